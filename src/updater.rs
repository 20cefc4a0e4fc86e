// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Copying boot caches onto a volume's helper partitions.
//!
//! Helpers are updated one at a time: stage new content into the free
//! slot of the R/P/S directory rotation, stage booters next to their
//! live copies, then commit with a single finder-info write and a
//! leap-frog rename. Any failure rolls the helper back to its prior
//! bootable state and moves on to the next helper; bootstamps are only
//! written once every helper has succeeded, so a partial update leaves
//! the volume looking stale and the work is retried later.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::{fstat, Mode};
use nix::sys::statvfs::fstatvfs;

use crate::caches::BootCaches;
use crate::disks::{DiskArbiter, FinderInfo, BOOTER_TYPE_CREATOR, LABEL_TYPE_CREATOR};
use crate::staleness::{self, Staleness};
use crate::{builder, safecalls, Error, Result};

#[cfg(test)]
#[path = "./updater_test.rs"]
mod updater_test;

/// The three-slot directory rotation on every helper partition.
pub const BOOT_DIR_R: &str = "com.apple.boot.R";
pub const BOOT_DIR_P: &str = "com.apple.boot.P";
pub const BOOT_DIR_S: &str = "com.apple.boot.S";

/// Mode for freshly staged rotation directories.
pub const RPS_DIR_MODE: u32 = 0o755;

/// The boot configuration key that receives the host volume's UUID.
pub const ROOT_UUID_KEY: &str = "Root UUID";

// non-RPS content, including booters, keeps its fallback under these
const OLD_EXT: &str = ".old";
const NEW_EXT: &str = ".new";
const CONTENT_EXT: &str = ".contentDetails";

/// How far a helper update has progressed, selecting the reverse
/// actions needed to roll it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ChangeState {
    Untouched,
    LabelsNuked,
    CopyingOfBooter,
    CopyingEfiBooter,
    CopiedBooters,
    ActivatingOfBooter,
    ActivatingEfiBooter,
    ActivatedBooters,
}

/// The rotation slots of one helper, as absolute paths.
///
/// `current` is what the firmware would select right now, `previous`
/// is the slot free to be rewritten, and `next` is the name the staged
/// content must take to win the next selection.
struct RpsSlots {
    previous: PathBuf,
    current: PathBuf,
    next: PathBuf,
}

/// Transient state of a single helper partition mid-update.
struct UpdatingVol {
    bsd_name: String,
    /// ordinal of this helper on its host volume
    index: usize,
    mount: PathBuf,
    /// handle to the mounted helper, scoping every mutation to it
    scope: File,
    /// the rotation directory receiving new content
    staged_rps: PathBuf,
    ofdst: Option<PathBuf>,
    efidst: Option<PathBuf>,
    state: ChangeState,
}

/// Brings a host volume's helper partitions up to date with its boot
/// caches.
pub struct HelperUpdater<'a> {
    caches: &'a mut BootCaches,
    arbiter: &'a dyn DiskArbiter,
    do_rps: bool,
    do_booters: bool,
    do_misc: bool,
}

impl<'a> HelperUpdater<'a> {
    /// A new updater acting on the categories reported stale.
    ///
    /// The caches must have been scanned already: the same scan that
    /// produced `stale` captured the source timestamps that become
    /// bootstamps on success.
    pub fn new(
        caches: &'a mut BootCaches,
        arbiter: &'a dyn DiskArbiter,
        stale: Staleness,
    ) -> Self {
        Self {
            caches,
            arbiter,
            do_rps: stale.rps,
            do_booters: stale.booters,
            do_misc: stale.misc,
        }
    }

    /// Update every helper partition in order, then commit bootstamps.
    ///
    /// A failed helper is rolled back and does not stop the loop, but
    /// overall success requires every helper to have completed; short
    /// of that the bootstamps stay unwritten and the volume will be
    /// picked up as stale again.
    pub async fn update_helpers(&mut self, helpers: &[String]) -> Result<()> {
        let mut updated = 0usize;
        for (index, bsd_name) in helpers.iter().enumerate() {
            match self.update_one(index, bsd_name).await {
                Ok(()) => {
                    updated += 1;
                    tracing::info!(%bsd_name, "successfully updated helper partition");
                }
                Err(err) => {
                    tracing::error!(%bsd_name, ?err, "error updating helper partition");
                }
            }
        }
        if updated != helpers.len() {
            return Err(Error::String(format!(
                "trouble updating {} of {} helper partitions",
                helpers.len() - updated,
                helpers.len()
            )));
        }

        self.caches
            .apply_stamps()
            .map_err(|err| err.wrap("trouble updating bootstamps"))
    }

    async fn update_one(&mut self, index: usize, bsd_name: &str) -> Result<()> {
        let mut up = self.mount_boot(index, bsd_name).await?;

        let result = self.populate(&mut up);
        if result.is_err() {
            if up.state != ChangeState::Untouched {
                tracing::error!(
                    %bsd_name,
                    state = ?up.state,
                    "helper update failed mid-change, reverting"
                );
            }
            // unroll any changes we may have made
            self.revert(&mut up);
        }

        if let Err(err) = self.nuke_fallbacks(&up) {
            tracing::error!(%bsd_name, ?err, "helper partition may be untidy");
        }

        self.unmount_boot(up).await;
        result
    }

    /// Run the staged update sequence against one mounted helper.
    fn populate(&self, up: &mut UpdatingVol) -> Result<()> {
        if self.do_rps {
            self.stage_rps(up)?; // -> inactive slot
        }
        if self.do_misc {
            self.stage_misc(up); // -> .new files, advisory
        }

        self.nuke_labels(up)?; // always

        if self.do_booters {
            self.stage_booters(up)?; // .old still active
            self.activate_booters(up)?;
        }
        // new booters stay mostly compatible with old kernels, so the
        // booters go live before the new RPS generation does
        if self.do_rps {
            self.activate_rps(up)?;
        }
        self.activate_misc(up, self.do_misc)?; // also restores the label

        up.state = ChangeState::Untouched; // loop success
        Ok(())
    }

    /// Mount a helper partition and vet it for updating.
    async fn mount_boot(&self, index: usize, bsd_name: &str) -> Result<UpdatingVol> {
        let mount = self
            .arbiter
            .mount_helper(bsd_name)
            .await
            .map_err(|err| err.wrap(format!("couldn't mount helper {bsd_name}")))?;

        let result = self.vet_helper(index, bsd_name, &mount);
        if result.is_err() {
            // unmount anything we managed to mount
            if let Err(err) = self.arbiter.unmount_helper(bsd_name, false).await {
                tracing::warn!(%bsd_name, ?err, "unmount trouble");
            }
        }
        result
    }

    fn vet_helper(&self, index: usize, bsd_name: &str, mount: &Path) -> Result<UpdatingVol> {
        // a non-spoofable handle to the current helper; all mutations
        // below go through it
        let scope = File::open(mount)
            .map_err(|err| Error::VolumeReadError(mount.to_path_buf(), err))?;

        // is the host volume still with us?
        fstat(self.caches.scope().as_raw_fd())?;

        let vfs = fstatvfs(&scope)?;
        let bytes = vfs.blocks() as u64 * vfs.fragment_size() as u64;
        let min = crate::get_config()?.helpers.min_partition_bytes;
        if bytes < min {
            return Err(Error::UnusableHelper(
                bsd_name.to_string(),
                format!("{bytes} bytes is smaller than the {min} byte minimum"),
            ));
        }

        Ok(UpdatingVol {
            bsd_name: bsd_name.to_string(),
            index,
            mount: mount.to_path_buf(),
            scope,
            staged_rps: PathBuf::new(),
            ofdst: None,
            efidst: None,
            state: ChangeState::Untouched,
        })
    }

    async fn unmount_boot(&self, up: UpdatingVol) {
        let bsd_name = up.bsd_name.clone();
        drop(up); // release the helper scope handle first
        if let Err(err) = self.arbiter.unmount_helper(&bsd_name, false).await {
            tracing::warn!(%bsd_name, ?err, "trouble unmounting helper; forcing");
            if let Err(err) = self.arbiter.unmount_helper(&bsd_name, true).await {
                tracing::error!(%bsd_name, ?err, "forced unmount failed too");
            }
        }
    }

    /// Unlink and re-copy the RPS set into the inactive rotation slot.
    ///
    /// Only a whole RPS directory makes sense, so any error here fails
    /// the helper.
    fn stage_rps(&self, up: &mut UpdatingVol) -> Result<()> {
        let slots = find_rps_dirs(&up.mount);
        // the previous slot is fair game; activation later renames it
        // past the current generation
        up.staged_rps = slots.previous;

        if std::fs::symlink_metadata(&up.staged_rps).is_ok() {
            safecalls::sdeepunlink(&up.scope, &up.staged_rps)?;
        }
        safecalls::smkdir(
            &up.scope,
            &up.staged_rps,
            Mode::from_bits_truncate(RPS_DIR_MODE as libc::mode_t),
        )?;

        for (i, cp) in self.caches.rps_paths().iter().enumerate() {
            let src = self.caches.root().join(cp.rpath());
            let dst = up.staged_rps.join(cp.rpath());

            if Some(i) == self.caches.bootconfig_index() {
                // the boot configuration gets the host UUID inserted
                // rather than a byte copy
                if let Err(err) = self.stage_boot_config(up, &src, &dst) {
                    tracing::error!(?err, config = ?dst, "error populating boot config");
                    continue;
                }
            } else {
                if let Ok(meta) = std::fs::metadata(&src) {
                    if meta.len() == 0 {
                        return Err(Error::new(format!("zero-size cache file {src:?}")));
                    }
                }
                safecalls::scopyfile(self.caches.scope(), &src, &up.scope, &dst)
                    .map_err(|err| err.wrap(format!("error copying {src:?}")))?;
            }
        }
        Ok(())
    }

    /// Copy the boot configuration with this volume's UUID inserted so
    /// the booter can find its way back to the host volume.
    fn stage_boot_config(&self, up: &UpdatingVol, src: &Path, dst: &Path) -> Result<()> {
        let mut file = safecalls::sopen(self.caches.scope(), src, OFlag::O_RDONLY, Mode::empty())?;
        let srcst = fstat(file.as_raw_fd())?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // maybe the config is empty or not a dictionary yet
        let mut dict = match plist::Value::from_reader_xml(std::io::Cursor::new(&buf)) {
            Ok(plist::Value::Dictionary(dict)) => dict,
            _ => plist::Dictionary::new(),
        };
        dict.insert(
            ROOT_UUID_KEY.to_string(),
            plist::Value::String(self.caches.uuid().to_string()),
        );

        match safecalls::sunlink(&up.scope, dst) {
            Ok(()) => (),
            Err(err) if err.is_not_found() => (),
            Err(err) => return Err(err),
        }

        let mode = srcst.st_mode as u32 & !(libc::S_IFMT as u32);
        let mut dirmode = mode | 0o300;
        if dirmode & 0o040 != 0 {
            dirmode |= 0o010;
        }
        if dirmode & 0o004 != 0 {
            dirmode |= 0o001;
        }
        if let Some(parent) = dst.parent() {
            safecalls::sdeepmkdir(
                &up.scope,
                parent,
                Mode::from_bits_truncate(dirmode as libc::mode_t),
            )?;
        }

        let out = safecalls::sopen(
            &up.scope,
            dst,
            OFlag::O_WRONLY | OFlag::O_CREAT,
            Mode::from_bits_truncate(mode as libc::mode_t),
        )?;
        plist::Value::Dictionary(dict).to_writer_xml(out)?;
        Ok(())
    }

    /// Copy misc files to their inactive `.new` names. Missing sources
    /// are not errors and copy failures only warn.
    fn stage_misc(&self, up: &UpdatingVol) {
        for cp in self.caches.misc_paths() {
            let src = self.caches.root().join(cp.rpath());
            let dst = append_ext(&up.mount.join(cp.rpath()), NEW_EXT);

            if std::fs::metadata(&src).is_ok() {
                if let Err(err) = safecalls::scopyfile(self.caches.scope(), &src, &up.scope, &dst)
                {
                    tracing::warn!(?err, ?src, ?dst, "error copying misc file");
                }
            }
        }
    }

    /// Remove the helper's label files. Activation writes fresh ones
    /// every time; their absence meanwhile hints at an update in
    /// progress.
    fn nuke_labels(&self, up: &mut UpdatingVol) -> Result<()> {
        let mut result = Ok(());
        if let Some(label) = self.caches.label() {
            let labelp = up.mount.join(label.rpath());
            for path in [labelp.clone(), append_ext(&labelp, CONTENT_EXT)] {
                if std::fs::symlink_metadata(&path).is_ok() {
                    if let Err(err) = safecalls::sunlink(&up.scope, &path) {
                        result = Err(err);
                    }
                }
            }
        }
        up.state = ChangeState::LabelsNuked;
        result
    }

    /// Copy down new booters without blessing them; the `.old` copies
    /// stay active until activation.
    fn stage_booters(&self, up: &mut UpdatingVol) -> Result<()> {
        up.state = ChangeState::CopyingOfBooter;
        if let Some(cp) = self.caches.ofbooter() {
            let src = self.caches.root().join(cp.rpath());
            let dst = up.mount.join(cp.rpath());
            self.stage_one_booter(up, &src, &dst)?;
            up.ofdst = Some(dst);
        }

        up.state = ChangeState::CopyingEfiBooter;
        if let Some(cp) = self.caches.efibooter() {
            let src = self.caches.root().join(cp.rpath());
            let dst = up.mount.join(cp.rpath());
            self.stage_one_booter(up, &src, &dst)?;
            up.efidst = Some(dst);
        }

        up.state = ChangeState::CopiedBooters;
        Ok(())
    }

    fn stage_one_booter(&self, up: &UpdatingVol, src: &Path, dst: &Path) -> Result<()> {
        let old = append_ext(dst, OLD_EXT);
        match safecalls::sunlink(&up.scope, &old) {
            Ok(()) => (),
            Err(err) if err.is_not_found() => (),
            Err(err) => return Err(err),
        }
        // a helper being populated for the first time has no original
        match safecalls::srename(&up.scope, dst, &old) {
            Ok(()) => (),
            Err(err) if err.is_not_found() => (),
            Err(err) => return Err(err),
        }
        safecalls::scopyfile(self.caches.scope(), src, &up.scope, dst)
            .map_err(|err| err.wrap(format!("failure copying booter {src:?}")))
    }

    /// Bless the freshly copied booters. This is the point of no
    /// return: a single finder-info write makes both booters live.
    fn activate_booters(&self, up: &mut UpdatingVol) -> Result<()> {
        let mut vinfo = FinderInfo::default();

        up.state = ChangeState::ActivatingOfBooter;
        if let Some(dst) = up.ofdst.clone() {
            let file = safecalls::sopen(&up.scope, &dst, OFlag::O_RDWR, Mode::empty())?;
            // booter bytes must hit stable storage before the bless
            safecalls::flush_to_media(file.as_raw_fd())?;
            self.arbiter.set_type_creator(&file, BOOTER_TYPE_CREATOR)?;
            drop(file);

            let parent = booter_parent(&dst)?;
            let pfile = safecalls::sopen(&up.scope, parent, OFlag::O_RDONLY, Mode::empty())?;
            let sb = fstat(pfile.as_raw_fd())?;
            vinfo.0[FinderInfo::SYSTEM_FOLDER] = sb.st_ino as u32;
        }

        up.state = ChangeState::ActivatingEfiBooter;
        if let Some(dst) = up.efidst.clone() {
            let file = safecalls::sopen(&up.scope, &dst, OFlag::O_RDWR, Mode::empty())?;
            safecalls::flush_to_media(file.as_raw_fd())?;
            self.arbiter.set_type_creator(&file, BOOTER_TYPE_CREATOR)?;
            let sb = fstat(file.as_raw_fd())?;
            vinfo.0[FinderInfo::EFI_BOOTER] = sb.st_ino as u32;
            drop(file);

            // with only one booter we still want a blessed folder
            if vinfo.0[FinderInfo::SYSTEM_FOLDER] == 0 {
                let parent = booter_parent(&dst)?;
                let pfile = safecalls::sopen(&up.scope, parent, OFlag::O_RDONLY, Mode::empty())?;
                let sb = fstat(pfile.as_raw_fd())?;
                vinfo.0[FinderInfo::SYSTEM_FOLDER] = sb.st_ino as u32;
            }
        }

        // blessing booter and folder happens through the volume root
        // in one operation
        self.arbiter.bless(&up.mount, &vinfo)?;

        up.state = ChangeState::ActivatedBooters;
        Ok(())
    }

    /// Leap-frog the staged rotation directory past the current
    /// generation, then make everything durable.
    fn activate_rps(&self, up: &UpdatingVol) -> Result<()> {
        let slots = find_rps_dirs(&up.mount);

        // when selection still lands on the old generation, rename the
        // staged slot to the name that wins the next selection; the
        // former active becomes the rotation tail
        if slots.current != up.staged_rps {
            safecalls::srename(&up.scope, &slots.previous, &slots.next)?;
        }

        // all essential boot bytes reach the media before we consider
        // the new generation committed
        safecalls::flush_to_media(up.scope.as_raw_fd())
    }

    /// Rename staged `.new` misc files into place and write fresh
    /// labels; active labels indicate an updated system.
    fn activate_misc(&self, up: &UpdatingVol, write_misc: bool) -> Result<()> {
        if write_misc {
            for cp in self.caches.misc_paths() {
                let path = up.mount.join(cp.rpath());
                let newpath = append_ext(&path, NEW_EXT);
                if std::fs::symlink_metadata(&newpath).is_ok() {
                    if let Err(err) = safecalls::srename(&up.scope, &newpath, &path) {
                        tracing::warn!(?err, ?path, "couldn't activate misc file");
                    }
                }
            }
        }

        if let Some(label) = self.caches.label() {
            let labelp = up.mount.join(label.rpath());
            match safecalls::sunlink(&up.scope, &labelp) {
                Ok(()) => (),
                Err(err) if err.is_not_found() => (),
                Err(err) => return Err(err),
            }

            // construct the label with a trailing ordinal so multiple
            // helpers remain distinguishable at boot
            let bootname = format!("{} {}", self.caches.volume_name(), up.index + 1);
            let data = self.arbiter.render_label(&bootname)?;
            let mut file = safecalls::sopen(
                &up.scope,
                &labelp,
                OFlag::O_CREAT | OFlag::O_WRONLY,
                Mode::from_bits_truncate(0o644),
            )?;
            file.write_all(&data)?;
            drop(file);

            // and the content details as plain text
            let content = append_ext(&labelp, CONTENT_EXT);
            match safecalls::sunlink(&up.scope, &content) {
                Ok(()) => (),
                Err(err) if err.is_not_found() => (),
                Err(err) => return Err(err),
            }
            let mut file = safecalls::sopen(
                &up.scope,
                &content,
                OFlag::O_CREAT | OFlag::O_WRONLY,
                Mode::from_bits_truncate(0o644),
            )?;
            file.write_all(self.caches.volume_name().as_bytes())?;
            drop(file);

            // tag the label so the firmware recognizes it
            let file = safecalls::sopen(&up.scope, &labelp, OFlag::O_RDWR, Mode::empty())?;
            self.arbiter.set_type_creator(&file, LABEL_TYPE_CREATOR)?;
        }
        Ok(())
    }

    /// Get rid of everything extra: `.old` booters and the spent
    /// rotation slot. Correct whether or not the update succeeded.
    fn nuke_fallbacks(&self, up: &UpdatingVol) -> Result<()> {
        let mut result = Ok(());

        if self.do_booters {
            for cp in self
                .caches
                .ofbooter()
                .into_iter()
                .chain(self.caches.efibooter())
            {
                let old = append_ext(&up.mount.join(cp.rpath()), OLD_EXT);
                match safecalls::sunlink(&up.scope, &old) {
                    Ok(()) => (),
                    Err(err) if err.is_not_found() => (),
                    Err(err) => result = Err(err),
                }
            }
        }

        if self.do_rps {
            let slots = find_rps_dirs(&up.mount);
            match safecalls::sdeepunlink(&up.scope, &slots.previous) {
                Ok(()) => (),
                Err(err) if err.is_not_found() => (),
                Err(err) => result = Err(err),
            }
        }

        result
    }

    /// Unwind a partial update, driven by how far the change cursor
    /// advanced. Staged RPS content needs no undoing: it becomes the
    /// sacrificial slot of the next run.
    fn revert(&self, up: &mut UpdatingVol) {
        let reached = up.state;

        if reached >= ChangeState::ActivatedBooters {
            // we blessed the new booters, so bless the old ones back
            if let Some(dst) = up.ofdst.take() {
                up.ofdst = Some(append_ext(&dst, OLD_EXT));
            }
            if let Some(dst) = up.efidst.take() {
                up.efidst = Some(append_ext(&dst, OLD_EXT));
            }
            if let Err(err) = self.activate_booters(up) {
                tracing::error!(?err, "failed to re-bless previous booters");
            }
        }

        if reached >= ChangeState::CopyingEfiBooter {
            if let Some(cp) = self.caches.efibooter() {
                self.restore_booter(up, &up.mount.join(cp.rpath()));
            }
        }
        if reached >= ChangeState::CopyingOfBooter {
            if let Some(cp) = self.caches.ofbooter() {
                self.restore_booter(up, &up.mount.join(cp.rpath()));
            }
        }

        if reached >= ChangeState::LabelsNuked {
            // the old ones are gone for good; write fresh labels
            if let Err(err) = self.activate_misc(up, false) {
                tracing::error!(?err, "failed to restore labels");
            }
        }
    }

    /// Put a booter's `.old` copy back in place of the staged one. A
    /// missing `.old` means the helper had no booter to begin with.
    fn restore_booter(&self, up: &UpdatingVol, dst: &Path) {
        let old = append_ext(dst, OLD_EXT);
        if let Err(err) = safecalls::sunlink(&up.scope, dst) {
            if !err.is_not_found() {
                tracing::warn!(?err, ?dst, "couldn't remove staged booter");
            }
        }
        if std::fs::symlink_metadata(&old).is_ok() {
            if let Err(err) = safecalls::srename(&up.scope, &old, dst) {
                tracing::error!(?err, ?dst, "couldn't restore previous booter");
            }
        }
    }
}

/// Find the rock, paper and scissors directories, handling every
/// permutation of which subset exists.
fn find_rps_dirs(mount: &Path) -> RpsSlots {
    let r = mount.join(BOOT_DIR_R);
    let p = mount.join(BOOT_DIR_P);
    let s = mount.join(BOOT_DIR_S);

    let have_r = std::fs::metadata(&r).is_ok();
    let have_p = std::fs::metadata(&p).is_ok();
    let have_s = std::fs::metadata(&s).is_ok();

    let (previous, current, next) = match (have_r, have_p, have_s) {
        (true, true, true) => {
            tracing::warn!(?mount, "all of R, P and S exist: picking R");
            (s, r, p)
        }
        // with two present, the cyclic successor wins
        (true, true, false) => (r, p, s),
        (true, false, true) => (s, r, p),
        (false, true, true) => (p, s, r),
        // one present wins by default, rotation continues in order
        (true, false, false) => (s, r, p),
        (false, true, false) => (r, p, s),
        (false, false, true) => (p, s, r),
        // we'll start with rock
        (false, false, false) => (s, r, p),
    };
    RpsSlots {
        previous,
        current,
        next,
    }
}

fn booter_parent(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| Error::new(format!("booter path {path:?} has no parent")))
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ext);
    PathBuf::from(os)
}

/// One-shot update of a volume's helper partitions.
///
/// This is the library entry behind the builder's `-u` invocation: the
/// caller is expected to hold the volume's update lock. The mkext is
/// rebuilt synchronously first if it is out of date, then every helper
/// is brought up to date. Returns false when there was nothing to do.
pub async fn update_volume<P: AsRef<Path>>(
    root: P,
    force: bool,
    arbiter: &dyn DiskArbiter,
) -> Result<bool> {
    // if there's no descriptor, we don't care about this volume
    let mut caches = match BootCaches::read(root.as_ref(), arbiter)? {
        Some(caches) => caches,
        None => return Ok(false),
    };

    if staleness::mkext_needs_rebuild(&caches) {
        match builder::rebuild_mkext(&caches, true).await? {
            Some(0) => (),
            code => {
                return Err(Error::new(format!(
                    "couldn't rebuild stale mkext (builder exited {code:?})"
                )))
            }
        }
    }

    let binfo = arbiter.booter_info(caches.root())?;
    if binfo.helpers.is_empty() {
        tracing::debug!(root = ?caches.root(), "no helper partitions; skipping update");
        return Ok(false);
    }

    let stale = staleness::scan(&mut caches)?;
    if !stale.any && !force {
        tracing::debug!(root = ?caches.root(), "helper partitions appear up to date");
        return Ok(false);
    }
    let stale = if force { Staleness::all() } else { stale };

    HelperUpdater::new(&mut caches, arbiter, stale)
        .update_helpers(&binfo.helpers)
        .await?;
    Ok(true)
}
