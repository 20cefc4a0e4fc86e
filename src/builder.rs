// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Launching of the external cache builder process.
//!
//! The daemon never builds an mkext itself; it forks the builder and
//! consumes the result via filesystem notifications and the volume
//! lock protocol. Asynchronous launches are re-parented to the system
//! so that no zombies accumulate, and the child's `TMPDIR` is pointed
//! at the volume's bootstamp directory so that its final
//! rename-into-place lands on the target volume.

use std::ffi::OsString;
use std::process::Stdio;

use crate::caches::BootCaches;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./builder_test.rs"]
mod builder_test;

/// Exit status used by the builder to hand work off to a follow-up
/// invocation: the lock is released but no error is recorded.
pub const EX_TEMPFAIL: i32 = 75;

/// Rebuild the volume's mkext from its extensions folder.
///
/// When `wait` is true the builder runs synchronously and its exit
/// code is returned; otherwise it is detached and `None` is returned
/// once the launch is known to have succeeded.
pub async fn rebuild_mkext(caches: &BootCaches, wait: bool) -> Result<Option<i32>> {
    let mkext = caches
        .mkext()
        .ok_or_else(|| Error::new("volume has no mkext to rebuild"))?;
    let exts = caches
        .extensions_dir()
        .ok_or_else(|| Error::new("volume has no extensions folder"))?;

    let mut args: Vec<OsString> = Vec::new();
    for arch in caches.archs() {
        args.push("-a".into());
        args.push(arch.into());
    }
    args.push("-l".into());
    args.push("-m".into());
    args.push(caches.root().join(mkext.rpath()).into());
    args.push(exts.into());

    fork_builder(caches, args, wait).await
}

/// Launch the builder's one-shot helper update (`-u`) for the volume.
pub async fn rebuild_helpers(caches: &BootCaches, force: bool) -> Result<()> {
    let mut args: Vec<OsString> = Vec::new();
    if force {
        args.push("-f".into());
    }
    args.push("-u".into());
    args.push(caches.root().into());

    fork_builder(caches, args, false).await?;
    Ok(())
}

/// Fork the external builder with the given arguments.
///
/// Detached launches use daemon(3) in the forked child so the real
/// builder is owned by the system, leaving nothing for us to reap.
async fn fork_builder(caches: &BootCaches, args: Vec<OsString>, wait: bool) -> Result<Option<i32>> {
    let config = crate::get_config()?;

    let mut cmd = tokio::process::Command::new(&config.builder.path);
    cmd.args(args);
    cmd.env("TMPDIR", caches.bootstamp_dir());
    cmd.stdin(Stdio::null());

    if !wait {
        unsafe {
            cmd.pre_exec(|| match nix::unistd::daemon(false, false) {
                Ok(()) => Ok(()),
                Err(err) => Err(std::io::Error::from_raw_os_error(err as i32)),
            });
        }
    }

    tracing::debug!(builder = ?config.builder.path, root = ?caches.root(), wait, "launching cache builder");
    let mut child = cmd.spawn().map_err(|err| {
        Error::ProcessSpawnError(config.builder.path.display().to_string(), err)
    })?;

    // when detached, this only reaps the short-lived intermediate
    let status = child.wait().await?;
    if wait {
        return Ok(status.code());
    }
    if !status.success() {
        return Err(Error::new(format!(
            "cache builder failed to detach: {status:?}"
        )));
    }
    Ok(None)
}
