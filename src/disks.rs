// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! The seam between the daemon core and the host's disk services.
//!
//! Everything the core needs from disk arbitration and the bless
//! library goes through [`DiskArbiter`]: disk discovery and
//! description, helper partition mounts, ownership toggling, and the
//! finder-info writes that commit a new set of boot files. Production
//! bindings live outside this crate; tests use [`mock::MockArbiter`].

use std::fs::File;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::Result;

/// Description of a single disk as reported by the host.
#[derive(Debug, Clone, Default)]
pub struct DiskDescription {
    pub mount_point: Option<PathBuf>,
    pub writable: bool,
    pub network: bool,
    /// True when the volume is mounted with ownership ignored
    pub owners_ignored: bool,
}

/// Booter layout information for a host volume.
#[derive(Debug, Clone, Default)]
pub struct BooterInfo {
    /// bsd names of the volume's helper partitions, in update order
    pub helpers: Vec<String>,
    pub gpt: bool,
}

impl BooterInfo {
    /// Only volumes with helper partitions on GPT media boot this way.
    pub fn is_boot_root(&self) -> bool {
        !self.helpers.is_empty() && self.gpt
    }
}

/// Identity of a mounted volume.
#[derive(Debug, Clone)]
pub struct VolumeIdent {
    pub uuid: String,
    pub label: String,
}

/// The eight 32-bit words of a volume's finder info. Writing the pair
/// (system folder inode, efi booter inode) is the single operation
/// that makes a freshly staged helper bootable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinderInfo(pub [u32; 8]);

impl FinderInfo {
    pub const SYSTEM_FOLDER: usize = 0;
    pub const EFI_BOOTER: usize = 1;
}

/// A type/creator pair applied to boot files as a finder-info
/// extended attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeCreator(pub [u8; 8]);

pub const BOOTER_TYPE_CREATOR: TypeCreator = TypeCreator(*b"tbxichrp");
pub const LABEL_TYPE_CREATOR: TypeCreator = TypeCreator(*b"tbxjchrp");

/// Reply to an unmount approval request.
#[derive(Debug)]
pub enum UnmountResponse {
    Allow,
    /// The named device is busy and the unmount should be dissented
    Busy { device: String },
}

/// Disk lifecycle notifications delivered to the volume controller.
#[derive(Debug)]
pub enum DiskEvent {
    Appeared {
        bsd_name: String,
    },
    /// Some aspect of the disk's description (typically the mount
    /// point) changed
    Changed {
        bsd_name: String,
    },
    Disappeared {
        bsd_name: String,
    },
    /// Someone wants to unmount this disk and we may dissent
    UnmountRequest {
        bsd_name: String,
        respond: oneshot::Sender<UnmountResponse>,
    },
}

/// Host disk services used by the daemon core.
///
/// Mount and unmount block until the host's completion callback fires,
/// which is why they are async; the descriptive calls are cheap.
#[async_trait::async_trait]
pub trait DiskArbiter: Send + Sync {
    /// Take the stream of disk lifecycle events. May only be called once.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DiskEvent>;

    /// Describe a disk by bsd name.
    fn description(&self, bsd_name: &str) -> Result<DiskDescription>;

    /// Booter layout information for the volume mounted at `root`.
    fn booter_info(&self, root: &Path) -> Result<BooterInfo>;

    /// UUID and label of the volume mounted at `root`.
    fn volume_ident(&self, root: &Path) -> Result<VolumeIdent>;

    /// bsd names of all currently mounted local disks.
    fn local_disks(&self) -> Result<Vec<String>>;

    /// Mount a helper partition read-write at a private mount point,
    /// returning the mount point.
    async fn mount_helper(&self, bsd_name: &str) -> Result<PathBuf>;

    /// Unmount a previously mounted helper.
    async fn unmount_helper(&self, bsd_name: &str, force: bool) -> Result<()>;

    /// Enable or disable ownership semantics on a mounted volume.
    async fn set_owners_honored(&self, bsd_name: &str, honored: bool) -> Result<()>;

    /// Write the volume finder info of the helper mounted at
    /// `mount_point`, committing its new boot files.
    fn bless(&self, mount_point: &Path, info: &FinderInfo) -> Result<()>;

    /// Apply a type/creator pair to an open boot file.
    fn set_type_creator(&self, file: &File, tc: TypeCreator) -> Result<()>;

    /// Render display label content for the given text.
    fn render_label(&self, text: &str) -> Result<Vec<u8>>;
}
