// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

lazy_static! {
    static ref CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);
}

/// Settings for the volume watcher and its settle timer.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Watch {
    /// Seconds a volume must remain quiet before a rebuild is attempted
    pub settle_seconds: u64,
    /// Consecutive failures after which a volume no longer blocks reboot
    pub giveup_threshold: u32,
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            settle_seconds: 5,
            giveup_threshold: 5,
        }
    }
}

/// Settings for helper partition updates.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Helpers {
    /// Helper partitions smaller than this are skipped
    pub min_partition_bytes: u64,
}

impl Default for Helpers {
    fn default() -> Self {
        Self {
            min_partition_bytes: 128 * (1 << 20),
        }
    }
}

/// Settings for the external cache builder process.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Builder {
    pub path: PathBuf,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/sbin/kextcache"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub watch: Watch,
    pub helpers: Helpers,
    pub builder: Builder,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!(
                "Cannot load config, lock has been poisoned: {:?}",
                err
            ))
        })?;
        Ok(lock.insert(Arc::new(self)).clone())
    }
}

/// Get the current config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let lock = CONFIG.read().map_err(|err| {
        crate::Error::String(format!(
            "Cannot load config, lock has been poisoned: {:?}",
            err
        ))
    })?;
    if let Some(config) = &*lock {
        return Ok(config.clone());
    }
    drop(lock);

    // there is still a possible race condition here
    // where someone loads the config between the first check and
    // acquiring this lock, but the redundant work is still
    // less than not having a cache at all
    let config = load_config()?;
    config.make_current()
}

/// Load the configuration from disk, even if it's already been loaded.
///
/// This includes the default, user and system configurations, if they exist.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, Environment, File};

    let config = RawConfig::builder()
        // the system config can be in any supported format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/bootsync").required(false))
        .add_source(Environment::with_prefix("BOOTSYNC").separator("_"))
        .build()?;

    Ok(config.try_deserialize()?)
}
