// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Keeps auxiliary boot partitions synchronized with the canonical
//! boot artifacts stored on their host volume.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
#[macro_use]
mod fixtures;

mod arbiter;
mod builder;
pub mod caches;
pub mod config;
pub mod controller;
pub mod disks;
mod error;
pub mod safecalls;
pub mod staleness;
pub mod updater;

// re-exported to make downstream implementations easier
pub use async_trait::async_trait;

pub use arbiter::{client_pair, ClientGuard, LockClient, LockReply};
pub use builder::{rebuild_helpers, rebuild_mkext, EX_TEMPFAIL};
pub use caches::{BootCaches, CachedPath, Descriptor};
pub use config::{get_config, load_config, Config};
pub use controller::{Command, Controller, LockTarget, WatchedVol};
pub use disks::{
    BooterInfo, DiskArbiter, DiskDescription, DiskEvent, FinderInfo, TypeCreator, UnmountResponse,
    VolumeIdent,
};
pub use error::{Error, Result};
pub use staleness::{mkext_needs_rebuild, Staleness};
pub use updater::{update_volume, HelperUpdater};

/// Configure stderr logging for the daemon fronting this crate.
pub fn configure_logging(verbosity: usize) {
    use tracing_subscriber::prelude::*;

    let mut config = match verbosity {
        0 => {
            if let Ok(existing) = std::env::var("BOOTSYNC_LOG") {
                existing
            } else {
                "bootsync=info,warn".to_string()
            }
        }
        1 => "bootsync=debug,info".to_string(),
        2 => "bootsync=trace,info".to_string(),
        _ => "trace".to_string(),
    };
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let registry = tracing_subscriber::Registry::default().with(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    let _ = tracing::subscriber::set_global_default(registry.with(fmt_layer));
}
