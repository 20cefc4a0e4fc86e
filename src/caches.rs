// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Reading and tracking of a volume's boot caches descriptor.
//!
//! Each participating volume carries a `bootcaches.plist` describing
//! the artifacts that must be mirrored onto its helper partitions. The
//! descriptor is only trusted when owned by root, and any key we do
//! not understand rejects the whole file. The open descriptor file
//! doubles as the scope for all subsequent mutations of the volume
//! (see [`crate::safecalls`]), guaranteeing that the volume still
//! exists and is still the same filesystem.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use serde::{Deserialize, Serialize};

use crate::disks::DiskArbiter;
use crate::{safecalls, Error, Result};

#[cfg(test)]
#[path = "./caches_test.rs"]
mod caches_test;

/// Location of the descriptor file, relative to the volume root.
pub const BOOT_CACHES_PATH: &str = "usr/standalone/bootcaches.plist";

/// The bootstamp tree, relative to the volume root.
pub const TS_CACHE_DIR: &str = "System/Library/Caches/com.apple.bootstamps";

/// Mode for the bootstamp directory and stamp files.
pub const TS_CACHE_MODE: u32 = 0o755;

// volumes mounted with this owner are ignored without complaint
const DISRESPECTED_UID: u32 = 99;

/// The typed contents of a `bootcaches.plist`.
///
/// Unknown keys are assumed required and reject the parse.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    #[serde(rename = "PreBootPaths", default, skip_serializing_if = "Option::is_none")]
    pub pre_boot: Option<PreBootPaths>,
    #[serde(rename = "BooterPaths", default, skip_serializing_if = "Option::is_none")]
    pub booters: Option<BooterPaths>,
    #[serde(rename = "PostBootPaths", default, skip_serializing_if = "Option::is_none")]
    pub post_boot: Option<PostBootPaths>,
}

/// Paths read before the booter runs (labels, icons, ...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PreBootPaths {
    #[serde(rename = "DiskLabel", default, skip_serializing_if = "Option::is_none")]
    pub disk_label: Option<String>,
    #[serde(rename = "AdditionalPaths", default, skip_serializing_if = "Option::is_none")]
    pub additional_paths: Option<Vec<String>>,
}

/// The booter binaries themselves.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BooterPaths {
    #[serde(rename = "EFIBooter", default, skip_serializing_if = "Option::is_none")]
    pub efi_booter: Option<String>,
    #[serde(rename = "OFBooter", default, skip_serializing_if = "Option::is_none")]
    pub of_booter: Option<String>,
}

/// Paths the kernel needs after the booter hands off. These form the
/// atomic RPS set on each helper partition.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PostBootPaths {
    #[serde(rename = "BootConfig", default, skip_serializing_if = "Option::is_none")]
    pub boot_config: Option<String>,
    #[serde(rename = "MKext", default, skip_serializing_if = "Option::is_none")]
    pub mkext: Option<MkextSpec>,
    #[serde(rename = "AdditionalPaths", default, skip_serializing_if = "Option::is_none")]
    pub additional_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MkextSpec {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ExtensionsDir", default, skip_serializing_if = "Option::is_none")]
    pub extensions_dir: Option<String>,
    #[serde(rename = "Archs", default, skip_serializing_if = "Option::is_none")]
    pub archs: Option<Vec<String>>,
}

/// One canonical boot artifact and its bootstamp shadow.
#[derive(Debug, Clone)]
pub struct CachedPath {
    /// path relative to the volume root
    rpath: PathBuf,
    /// shadow timestamp path, also relative to the volume root
    tspath: PathBuf,
    /// (atime, mtime) of the live source, captured at staleness check
    /// time and applied to the bootstamp once all helpers are updated
    pub(crate) tstamps: Option<(TimeSpec, TimeSpec)>,
}

impl CachedPath {
    fn new(uuid: &str, relpath: &str) -> Result<Self> {
        let relpath = relpath.trim_start_matches('/');
        if relpath.is_empty() {
            return Err(Error::InvalidDescriptor("empty cache path".to_string()));
        }
        let tspath = Path::new(TS_CACHE_DIR)
            .join(uuid)
            .join(relpath.replace('/', ":"));
        if relpath.len() >= libc::PATH_MAX as usize
            || tspath.as_os_str().len() >= libc::PATH_MAX as usize
        {
            return Err(Error::InvalidDescriptor(format!(
                "cache path too long: {relpath}"
            )));
        }
        Ok(Self {
            rpath: PathBuf::from(relpath),
            tspath,
            tstamps: None,
        })
    }

    pub fn rpath(&self) -> &Path {
        &self.rpath
    }

    pub fn tspath(&self) -> &Path {
        &self.tspath
    }
}

/// Parsed boot caches data for one watched volume.
pub struct BootCaches {
    pub(crate) root: PathBuf,
    pub(crate) uuid: String,
    pub(crate) volname: String,
    /// open handle to the descriptor file, used as the scope for all
    /// mutations of this volume
    pub(crate) scope: File,
    /// raw descriptor data, kept for arch lists and the like
    pub(crate) descriptor: Descriptor,

    /// kernel extensions folder (watched, never copied)
    pub(crate) exts: Option<PathBuf>,
    pub(crate) rps: Vec<CachedPath>,
    pub(crate) misc: Vec<CachedPath>,
    pub(crate) efibooter: Option<CachedPath>,
    pub(crate) ofbooter: Option<CachedPath>,

    // indices of the special entries within rps/misc
    pub(crate) mkext: Option<usize>,
    pub(crate) bootconfig: Option<usize>,
    pub(crate) label: Option<usize>,
}

impl std::fmt::Debug for BootCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootCaches")
            .field("root", &self.root)
            .field("uuid", &self.uuid)
            .field("volname", &self.volname)
            .field("rps", &self.rps)
            .field("misc", &self.misc)
            .field("efibooter", &self.efibooter)
            .field("ofbooter", &self.ofbooter)
            .finish()
    }
}

impl BootCaches {
    /// Look for and read a volume's boot caches descriptor.
    ///
    /// Volumes without a descriptor, or whose descriptor is owned by
    /// the ignored uid, are not an error and return `None`. A
    /// malformed or untrusted descriptor is an error; callers log it
    /// once and leave the volume alone.
    pub fn read<P: AsRef<Path>>(root: P, arbiter: &dyn DiskArbiter) -> Result<Option<Self>> {
        let root = root.as_ref().to_path_buf();
        let bcpath = root.join(BOOT_CACHES_PATH);

        let mut scope = match File::open(&bcpath) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::VolumeReadError(bcpath, err)),
        };

        // check the owner and mode before trusting any of the content
        let meta = scope.metadata()?;
        if meta.uid() != 0 {
            if meta.uid() == DISRESPECTED_UID {
                return Ok(None);
            }
            return Err(Error::InvalidDescriptor(format!(
                "{bcpath:?} not owned by root; no rebuilds"
            )));
        }
        if meta.mode() & 0o022 != 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{bcpath:?} writable by non-root"
            )));
        }

        let mut buf = Vec::with_capacity(meta.len() as usize);
        scope.read_to_end(&mut buf)?;
        let descriptor: Descriptor = plist::from_bytes(&buf).map_err(|err| {
            Error::InvalidDescriptor(format!("unsupported bootcaches data: {err}"))
        })?;

        let ident = arbiter.volume_ident(&root)?;

        let mut caches = Self {
            root,
            uuid: ident.uuid,
            volname: ident.label,
            scope,
            descriptor: descriptor.clone(),
            exts: None,
            rps: Vec::new(),
            misc: Vec::new(),
            efibooter: None,
            ofbooter: None,
            mkext: None,
            bootconfig: None,
            label: None,
        };

        if let Some(pre_boot) = &descriptor.pre_boot {
            if let Some(additional) = &pre_boot.additional_paths {
                for path in additional {
                    caches.misc.push(CachedPath::new(&caches.uuid, path)?);
                }
            }
            if let Some(disk_label) = &pre_boot.disk_label {
                caches.label = Some(caches.misc.len());
                caches.misc.push(CachedPath::new(&caches.uuid, disk_label)?);
            }
        }

        if let Some(booters) = &descriptor.booters {
            if let Some(efi) = &booters.efi_booter {
                caches.efibooter = Some(CachedPath::new(&caches.uuid, efi)?);
            }
            if let Some(of) = &booters.of_booter {
                caches.ofbooter = Some(CachedPath::new(&caches.uuid, of)?);
            }
        }

        if let Some(post_boot) = &descriptor.post_boot {
            if let Some(additional) = &post_boot.additional_paths {
                for path in additional {
                    caches.rps.push(CachedPath::new(&caches.uuid, path)?);
                }
            }
            if let Some(boot_config) = &post_boot.boot_config {
                caches.bootconfig = Some(caches.rps.len());
                caches.rps.push(CachedPath::new(&caches.uuid, boot_config)?);
            }
            if let Some(mkext) = &post_boot.mkext {
                caches.mkext = Some(caches.rps.len());
                caches.rps.push(CachedPath::new(&caches.uuid, &mkext.path)?);
                if let Some(exts) = &mkext.extensions_dir {
                    caches.exts = Some(PathBuf::from(exts.trim_start_matches('/')));
                }
            }
        }

        caches.ensure_bootstamp_dir()?;
        Ok(Some(caches))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn volume_name(&self) -> &str {
        &self.volname
    }

    /// The open descriptor handle scoping all mutations of this volume.
    pub fn scope(&self) -> &File {
        &self.scope
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn rps_paths(&self) -> &[CachedPath] {
        &self.rps
    }

    pub fn misc_paths(&self) -> &[CachedPath] {
        &self.misc
    }

    pub fn efibooter(&self) -> Option<&CachedPath> {
        self.efibooter.as_ref()
    }

    pub fn ofbooter(&self) -> Option<&CachedPath> {
        self.ofbooter.as_ref()
    }

    pub fn mkext(&self) -> Option<&CachedPath> {
        self.mkext.map(|i| &self.rps[i])
    }

    pub fn label(&self) -> Option<&CachedPath> {
        self.label.map(|i| &self.misc[i])
    }

    /// Index of the boot configuration entry within the RPS set, if any.
    pub fn bootconfig_index(&self) -> Option<usize> {
        self.bootconfig
    }

    /// Absolute path to the kernel extensions folder, if configured.
    pub fn extensions_dir(&self) -> Option<PathBuf> {
        self.exts.as_ref().map(|e| self.root.join(e))
    }

    /// Architectures requested for mkext rebuilds.
    pub fn archs(&self) -> Vec<String> {
        self.descriptor
            .post_boot
            .as_ref()
            .and_then(|pb| pb.mkext.as_ref())
            .and_then(|mk| mk.archs.clone())
            .unwrap_or_default()
    }

    /// This volume's bootstamp directory, absolute.
    pub fn bootstamp_dir(&self) -> PathBuf {
        self.root.join(TS_CACHE_DIR).join(&self.uuid)
    }

    /// Every absolute path that should be watched for changes.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(exts) = self.extensions_dir() {
            paths.push(exts);
        }
        for cp in &self.rps {
            paths.push(self.root.join(&cp.rpath));
        }
        for cp in self.efibooter.iter().chain(self.ofbooter.iter()) {
            paths.push(self.root.join(&cp.rpath));
        }
        for cp in &self.misc {
            paths.push(self.root.join(&cp.rpath));
        }
        paths
    }

    fn ensure_bootstamp_dir(&self) -> Result<()> {
        let tsdir = self.bootstamp_dir();
        match std::fs::metadata(&tsdir) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => safecalls::sdeepmkdir(
                &self.scope,
                &tsdir,
                Mode::from_bits_truncate(TS_CACHE_MODE as libc::mode_t),
            ),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the bootstamps for every cached path, mirroring the
    /// source timestamps captured during the last staleness scan.
    ///
    /// Called only once every helper partition has been updated
    /// successfully; a missing stamp keeps the volume looking stale.
    pub fn apply_stamps(&self) -> Result<()> {
        let mut result = Ok(());
        for cp in self
            .rps
            .iter()
            .chain(self.efibooter.iter())
            .chain(self.ofbooter.iter())
            .chain(self.misc.iter())
        {
            if let Err(err) = self.apply_stamp(cp) {
                tracing::error!(?err, tspath = ?cp.tspath, "failed to write bootstamp");
                result = Err(err);
            }
        }
        result
    }

    fn apply_stamp(&self, cp: &CachedPath) -> Result<()> {
        let (atime, mtime) = match cp.tstamps {
            Some(stamps) => stamps,
            // the source was missing at scan time; nothing to certify
            None => return Ok(()),
        };
        let tspath = self.root.join(&cp.tspath);

        // sopen passes O_EXCL, so clear any previous stamp first
        match safecalls::sunlink(&self.scope, &tspath) {
            Ok(()) => (),
            Err(err) if err.is_not_found() => (),
            Err(err) => return Err(err),
        }
        let stamp = safecalls::sopen(
            &self.scope,
            &tspath,
            OFlag::O_WRONLY | OFlag::O_CREAT,
            Mode::from_bits_truncate(TS_CACHE_MODE as libc::mode_t),
        )?;
        nix::sys::stat::futimens(stamp.as_raw_fd(), &atime, &mtime)?;
        Ok(())
    }
}
