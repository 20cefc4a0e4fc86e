// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("[ERRNO {1}] {0}")]
    Errno(String, i32),
    #[error(transparent)]
    Plist(#[from] plist::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// The descriptor was present but cannot be trusted or understood
    #[error("invalid bootcaches descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("volume is not watched: {0}")]
    UnknownVolume(String),
    #[error("helper partition {0} unusable: {1}")]
    UnusableHelper(String, String),
    #[error("error reading {0:?}")]
    VolumeReadError(PathBuf, #[source] io::Error),
    #[error("process failed to spawn: {0}")]
    ProcessSpawnError(String, #[source] io::Error),
}

impl Error {
    pub fn new<S: AsRef<str>>(message: S) -> Error {
        Error::new_errno(libc::EINVAL, message.as_ref())
    }

    pub fn new_errno<E: Into<String>>(errno: i32, e: E) -> Error {
        let msg = e.into();
        Error::Errno(msg, errno)
    }

    pub fn wrap_io<E: Into<String>>(err: std::io::Error, prefix: E) -> Error {
        let err = Self::from(err);
        err.wrap(prefix)
    }

    pub fn wrap_nix<E: Into<String>>(err: nix::Error, prefix: E) -> Error {
        let err = Self::from(err);
        err.wrap(prefix)
    }

    pub fn wrap<E: Into<String>>(&self, prefix: E) -> Error {
        let msg = format!("{}: {:?}", prefix.into(), self);
        match self.raw_os_error() {
            Some(errno) => Error::new_errno(errno, msg),
            None => Error::new(msg),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::IO(err) => err.raw_os_error(),
            Error::VolumeReadError(_, err) => err.raw_os_error(),
            Error::ProcessSpawnError(_, err) => err.raw_os_error(),
            Error::Errno(_, errno) => Some(*errno),
            Error::Nix(errno) => Some(*errno as i32),
            _ => None,
        }
    }

    /// True if this error means a path simply did not exist
    pub fn is_not_found(&self) -> bool {
        self.raw_os_error() == Some(libc::ENOENT)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::String(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::String(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
