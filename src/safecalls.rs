// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Picky filesystem syscalls confined to a single volume.
//!
//! Every mutating primitive here takes a scope descriptor whose device
//! identifies the only volume the operation is allowed to touch. The
//! target's parent directory is opened first and must live on the same
//! device as the scope; the operation then runs through that parent
//! descriptor using only the target's base name, so no absolute path
//! re-traversal (symlink or mount swap) can redirect it off the volume.

use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{openat, renameat, OFlag};
use nix::sys::stat::{fchmod, fstat, mkdirat, Mode};
use nix::unistd::{unlinkat, UnlinkatFlags};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./safecalls_test.rs"]
mod safecalls_test;

/// Copies are performed through a fixed intermediate buffer of this size.
pub const MAX_COPY_BLOCK: usize = 1 << 20;

/// An opened parent directory that has passed the scope policy check.
struct ScopedParent {
    dir: File,
    name: OsString,
}

fn split_path(path: &Path) -> Result<(PathBuf, OsString)> {
    let name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => return Err(Error::new(format!("path has no base name: {path:?}"))),
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name))
}

// current check makes sure we are on the same volume
// other checks could include:
// * "really owned by <foo> on root/<foo>-mounted volume"
fn spolicy(fdvol: &File, candidate: &File) -> Result<()> {
    let dirst = fstat(candidate.as_raw_fd())?;
    let volst = fstat(fdvol.as_raw_fd())?; // still there?

    // simple st_dev policy for now
    if volst.st_dev != dirst.st_dev {
        tracing::error!("scope policy: ALERT: dev_t mismatch");
        return Err(Error::new_errno(
            libc::EPERM,
            "target parent is not on the scope volume",
        ));
    }
    Ok(())
}

fn scoped_parent(fdvol: &File, path: &Path) -> Result<ScopedParent> {
    let (parent, name) = split_path(path)?;

    // make sure the parent is on the specified volume
    let dir = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(&parent)
        .map_err(|err| Error::wrap_io(err, format!("open parent {parent:?}")))?;
    spolicy(fdvol, &dir)?;

    Ok(ScopedParent { dir, name })
}

/// Scoped open. `O_EXCL` is forced whenever `O_CREAT` is requested so
/// that a planted symlink can never redirect the create onto the scope.
pub fn sopen<P: AsRef<Path>>(fdvol: &File, path: P, flags: OFlag, mode: Mode) -> Result<File> {
    let mut flags = flags;
    if flags.contains(OFlag::O_CREAT) {
        flags |= OFlag::O_EXCL;
    }

    let parent = scoped_parent(fdvol, path.as_ref())?;
    let fd: RawFd = openat(parent.dir.as_raw_fd(), parent.name.as_os_str(), flags, mode)
        .map_err(|err| Error::wrap_nix(err, format!("open {:?}", path.as_ref())))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Scoped mkdir.
pub fn smkdir<P: AsRef<Path>>(fdvol: &File, path: P, mode: Mode) -> Result<()> {
    let parent = scoped_parent(fdvol, path.as_ref())?;
    mkdirat(parent.dir.as_raw_fd(), parent.name.as_os_str(), mode)?;
    Ok(())
}

/// Scoped rmdir.
pub fn srmdir<P: AsRef<Path>>(fdvol: &File, path: P) -> Result<()> {
    let parent = scoped_parent(fdvol, path.as_ref())?;
    unlinkat(
        Some(parent.dir.as_raw_fd()),
        parent.name.as_os_str(),
        UnlinkatFlags::RemoveDir,
    )?;
    Ok(())
}

/// Scoped unlink.
pub fn sunlink<P: AsRef<Path>>(fdvol: &File, path: P) -> Result<()> {
    let parent = scoped_parent(fdvol, path.as_ref())?;
    unlinkat(
        Some(parent.dir.as_raw_fd()),
        parent.name.as_os_str(),
        UnlinkatFlags::NoRemoveDir,
    )?;
    Ok(())
}

/// Scoped rename. Both parent directories must pass the scope policy.
pub fn srename<P: AsRef<Path>, Q: AsRef<Path>>(fdvol: &File, oldpath: P, newpath: Q) -> Result<()> {
    let old = scoped_parent(fdvol, oldpath.as_ref())?;
    let new = scoped_parent(fdvol, newpath.as_ref())?;
    renameat(
        Some(old.dir.as_raw_fd()),
        old.name.as_os_str(),
        Some(new.dir.as_raw_fd()),
        new.name.as_os_str(),
    )?;
    Ok(())
}

/// Scoped recursive unlink. Never follows symlinks and never crosses
/// onto another device.
pub fn sdeepunlink<P: AsRef<Path>>(fdvol: &File, path: P) -> Result<()> {
    let path = path.as_ref();
    let meta = std::fs::symlink_metadata(path)
        .map_err(|err| Error::wrap_io(err, format!("lstat {path:?}")))?;
    if !meta.file_type().is_dir() {
        return sunlink(fdvol, path);
    }

    let volst = fstat(fdvol.as_raw_fd())?;
    if meta.dev() != volst.st_dev as u64 {
        return Err(Error::new_errno(
            libc::EPERM,
            format!("refusing to cross devices under {path:?}"),
        ));
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            sdeepunlink(fdvol, entry.path())?;
        } else {
            sunlink(fdvol, entry.path())?;
        }
    }
    srmdir(fdvol, path)
}

/// Scoped recursive mkdir.
pub fn sdeepmkdir<P: AsRef<Path>>(fdvol: &File, path: P, mode: Mode) -> Result<()> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(Error::new("cannot create an empty path"));
    }

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()), // base case
        Ok(_) => {
            return Err(Error::new_errno(
                libc::ENOTDIR,
                format!("{path:?} exists and is not a directory"),
            ))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => return Err(err.into()),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            sdeepmkdir(fdvol, parent, mode)?;
        }
    }

    // all parents made; top level still needed
    smkdir(fdvol, path, mode)
}

/// Scoped file copy between two volumes, each confined by its own scope
/// descriptor. Intermediate destination directories are created with a
/// mode derived from the source file's mode.
pub fn scopyfile<P: AsRef<Path>, Q: AsRef<Path>>(
    srcvol: &File,
    srcpath: P,
    dstvol: &File,
    dstpath: Q,
) -> Result<()> {
    let srcpath = srcpath.as_ref();
    let dstpath = dstpath.as_ref();

    let mut src = sopen(srcvol, srcpath, OFlag::O_RDONLY, Mode::empty())?;
    let srcst = fstat(src.as_raw_fd())?;
    let mode = srcst.st_mode as u32 & !(libc::S_IFMT as u32);

    // intermediate directories: u+wx, with execute mirroring read
    let mut dirmode = mode | 0o300;
    if dirmode & 0o040 != 0 {
        dirmode |= 0o010;
    }
    if dirmode & 0o004 != 0 {
        dirmode |= 0o001;
    }
    if let Some(parent) = dstpath.parent() {
        if !parent.as_os_str().is_empty() {
            sdeepmkdir(
                dstvol,
                parent,
                Mode::from_bits_truncate(dirmode as libc::mode_t),
            )?;
        }
    }

    // nuke/open the destination (sopen forces O_EXCL on the create)
    match sunlink(dstvol, dstpath) {
        Ok(()) => (),
        Err(err) if err.is_not_found() => (),
        Err(err) => return Err(err),
    }
    let mut dst = sopen(
        dstvol,
        dstpath,
        OFlag::O_CREAT | OFlag::O_WRONLY,
        Mode::from_bits_truncate((mode | 0o200) as libc::mode_t),
    )?;

    let mut buf = vec![0u8; MAX_COPY_BLOCK];
    loop {
        let count = src
            .read(&mut buf)
            .map_err(|err| Error::wrap_io(err, format!("read {srcpath:?}")))?;
        if count == 0 {
            break;
        }
        dst.write_all(&buf[..count])
            .map_err(|err| Error::wrap_io(err, format!("write {dstpath:?}")))?;
    }

    // apply final permissions through the open descriptor
    fchmod(
        dst.as_raw_fd(),
        Mode::from_bits_truncate(mode as libc::mode_t),
    )?;
    Ok(())
}

/// Push everything written through this descriptor down to stable
/// storage, not just into the filesystem cache.
#[cfg(target_os = "macos")]
pub fn flush_to_media(fd: RawFd) -> Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) } == -1 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

/// Push everything written through this descriptor down to stable
/// storage, not just into the filesystem cache.
#[cfg(not(target_os = "macos"))]
pub fn flush_to_media(fd: RawFd) -> Result<()> {
    nix::unistd::fsync(fd)?;
    Ok(())
}
