// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Decides which categories of boot content are out of date.
//!
//! A cached path is stale when its bootstamp is missing or carries a
//! different modification time than the live source. Scanning also
//! captures the source timestamps into each [`CachedPath`] - the
//! update engine needs them later to write fresh bootstamps, so the
//! scan keeps going even after staleness is already established.

use std::path::Path;

use nix::sys::stat::stat;
use nix::sys::time::TimeSpec;

use crate::caches::{BootCaches, CachedPath};
use crate::Result;

#[cfg(test)]
#[path = "./staleness_test.rs"]
mod staleness_test;

/// Which categories of content are out of date on a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Staleness {
    pub any: bool,
    pub rps: bool,
    pub booters: bool,
    pub misc: bool,
}

impl Staleness {
    /// Everything stale, used for forced updates.
    pub fn all() -> Self {
        Self {
            any: true,
            rps: true,
            booters: true,
            misc: true,
        }
    }
}

/// Check every cached path on the volume, capturing source timestamps
/// as a side effect.
pub fn scan(caches: &mut BootCaches) -> Result<Staleness> {
    let root = caches.root().to_path_buf();
    let mut stale = Staleness::default();

    for cp in caches.rps.iter_mut() {
        if needs_update(&root, cp)? {
            stale.any = true;
            stale.rps = true;
        }
        // one is enough, but the timestamp capture is needed later
    }
    for cp in caches
        .efibooter
        .iter_mut()
        .chain(caches.ofbooter.iter_mut())
    {
        if needs_update(&root, cp)? {
            stale.any = true;
            stale.booters = true;
        }
    }
    for cp in caches.misc.iter_mut() {
        // no one cares if an icon is missing, though the label file
        // does matter; errors here only warn
        match needs_update(&root, cp) {
            Ok(true) => {
                stale.any = true;
                stale.misc = true;
            }
            Ok(false) => (),
            Err(err) => tracing::warn!(?err, rpath = ?cp.rpath(), "trouble checking misc path"),
        }
    }

    Ok(stale)
}

/// Check one path, populating its timestamp pair. A missing source is
/// neither stale nor an error.
fn needs_update(root: &Path, cp: &mut CachedPath) -> Result<bool> {
    let src = root.join(cp.rpath());
    let rsb = match stat(&src) {
        Ok(sb) => sb,
        Err(nix::errno::Errno::ENOENT) => return Ok(false),
        Err(err) => {
            tracing::error!(path = ?src, %err, "cannot stat cached file source");
            return Err(err.into());
        }
    };

    cp.tstamps = Some((
        TimeSpec::new(rsb.st_atime, rsb.st_atime_nsec),
        TimeSpec::new(rsb.st_mtime, rsb.st_mtime_nsec),
    ));

    let tspath = root.join(cp.tspath());
    match stat(&tspath) {
        Ok(tsb) => {
            Ok(tsb.st_mtime != rsb.st_mtime || tsb.st_mtime_nsec != rsb.st_mtime_nsec)
        }
        Err(nix::errno::Errno::ENOENT) => Ok(true), // nothing to compare with
        Err(err) => {
            tracing::error!(path = ?tspath, %err, "cannot stat bootstamp");
            Err(err.into())
        }
    }
}

/// True when the mkext must be rebuilt by the external cache builder.
///
/// The builder marks a finished mkext by setting its modification time
/// to exactly one second past the extensions directory's; anything
/// else means the cache no longer matches the extensions folder.
pub fn mkext_needs_rebuild(caches: &BootCaches) -> bool {
    let mkext = match caches.mkext() {
        Some(cp) => cp,
        None => return false,
    };
    let exts = match caches.extensions_dir() {
        Some(dir) => dir,
        None => return false,
    };

    // mkext implies exts; we cannot build without them
    let extsb = match stat(&exts) {
        Ok(sb) => sb,
        Err(err) => {
            tracing::info!(path = ?exts, %err, "couldn't stat extensions folder");
            return false;
        }
    };

    let mkpath = caches.root().join(mkext.rpath());
    match stat(&mkpath) {
        // this stat failing means the mkext is simply gone
        Err(_) => true,
        Ok(sb) => sb.st_mtime != extsb.st_mtime + 1,
    }
}
