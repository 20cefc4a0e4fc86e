// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Watching volumes as they come, go or change, and firing rebuilds.
//!
//! Roughly how it all works: disk notifications feed a single control
//! task that keeps one record per comprehensible volume. Each record
//! registers path notifications for every cached file the volume's
//! descriptor names. A burst of changes arms one settle timer; when it
//! fires, either the external cache builder is forked (stale mkext) or
//! the helper partitions are updated in place. Unmounts are dissented
//! while a volume is locked or still has work, and the lock arbitration
//! in [`crate::arbiter`] runs on this same task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::arbiter::{HeldLock, LockClient, LockReply};
use crate::caches::BootCaches;
use crate::disks::{DiskArbiter, DiskEvent, UnmountResponse};
use crate::staleness::{self, Staleness};
use crate::updater::HelperUpdater;
use crate::{builder, Result};

#[cfg(test)]
#[path = "./controller_test.rs"]
mod controller_test;

/// Which lock a client endpoint was attached to.
#[derive(Debug, Clone)]
pub enum LockTarget {
    Reboot,
    Volume(String),
}

/// Requests multiplexed onto the control task.
#[derive(Debug)]
pub enum Command {
    /// A watched path on the named volume changed
    PathChanged { bsd_name: String },
    /// The settle timer for the named volume expired
    SettleExpired { bsd_name: String },
    LockReboot {
        client: LockClient,
        reply: oneshot::Sender<LockReply>,
    },
    LockVolume {
        bsd_name: String,
        client: LockClient,
        reply: oneshot::Sender<LockReply>,
    },
    UnlockVolume {
        bsd_name: String,
        client_id: u64,
        exit_status: i32,
        reply: oneshot::Sender<Result<()>>,
    },
    /// A lock client's endpoint went invalid
    LockInvalidated { target: LockTarget, client_id: u64 },
    Shutdown,
}

/// One volume being actively monitored.
pub struct WatchedVol {
    pub(crate) caches: BootCaches,
    /// pending settle timer; set means a rebuild check is scheduled
    pub(crate) settle: Option<JoinHandle<()>>,
    pub(crate) lock: Option<HeldLock>,
    /// consecutive failed rebuild attempts
    pub(crate) errcount: u32,
    /// ownership was enabled for the current locker and must be
    /// reverted on release
    pub(crate) owners_enabled: bool,
    /// keeps the per-path notifications alive; dropped on teardown
    pub(crate) _watcher: Option<notify::RecommendedWatcher>,
    pub(crate) watched_paths: Vec<PathBuf>,
}

impl WatchedVol {
    fn new(caches: BootCaches) -> Self {
        Self {
            caches,
            settle: None,
            lock: None,
            errcount: 0,
            owners_enabled: false,
            _watcher: None,
            watched_paths: Vec::new(),
        }
    }

    pub fn caches(&self) -> &BootCaches {
        &self.caches
    }

    pub fn error_count(&self) -> u32 {
        self.errcount
    }
}

impl Drop for WatchedVol {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.abort();
        }
        // the lock's watcher aborts on drop, and dropping the path
        // watcher cancels its registrations
    }
}

/// The volume watch controller. All state lives on the task running
/// [`Controller::run`]; everything else talks to it over the command
/// channel.
pub struct Controller {
    pub(crate) arbiter: Arc<dyn DiskArbiter>,
    pub(crate) watched: HashMap<String, WatchedVol>,
    pub(crate) reboot_lock: Option<HeldLock>,
    pub(crate) tx: mpsc::UnboundedSender<Command>,
    pub(crate) rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl Controller {
    pub fn new(arbiter: Arc<dyn DiskArbiter>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            arbiter,
            watched: HashMap::new(),
            reboot_lock: None,
            tx,
            rx: Some(rx),
        }
    }

    /// A handle for submitting [`Command`]s to the control task.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    /// Run the control loop until shutdown is requested or the disk
    /// event stream ends.
    pub async fn run(mut self) -> Result<()> {
        let mut disk_events = self.arbiter.subscribe();
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| crate::Error::new("controller is already running"))?;

        loop {
            tokio::select! {
                event = disk_events.recv() => match event {
                    Some(event) => self.handle_disk_event(event).await,
                    None => break,
                },
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
            }
        }

        // volumes tear down their timers, locks and notifications as
        // they drop, in reverse of setup
        self.watched.clear();
        self.reboot_lock = None;
        Ok(())
    }

    pub(crate) async fn handle_disk_event(&mut self, event: DiskEvent) {
        match event {
            DiskEvent::Appeared { bsd_name } => self.vol_appeared(&bsd_name).await,
            DiskEvent::Changed { bsd_name } => self.vol_changed(&bsd_name).await,
            DiskEvent::Disappeared { bsd_name } => self.vol_disappeared(&bsd_name),
            DiskEvent::UnmountRequest { bsd_name, respond } => {
                let response = if self.check_vol_busy(&bsd_name) {
                    UnmountResponse::Busy {
                        device: bsd_name.clone(),
                    }
                } else {
                    UnmountResponse::Allow
                };
                let _ = respond.send(response);
            }
        }
    }

    pub(crate) async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PathChanged { bsd_name } => self.handle_path_changed(&bsd_name),
            Command::SettleExpired { bsd_name } => {
                self.handle_settle_expired(&bsd_name).await;
            }
            Command::LockReboot { client, reply } => {
                let _ = reply.send(self.handle_lock_reboot(client).await);
            }
            Command::LockVolume {
                bsd_name,
                client,
                reply,
            } => {
                let _ = reply.send(self.handle_lock_volume(&bsd_name, client).await);
            }
            Command::UnlockVolume {
                bsd_name,
                client_id,
                exit_status,
                reply,
            } => {
                let _ = reply.send(
                    self.handle_unlock_volume(&bsd_name, client_id, exit_status)
                        .await,
                );
            }
            Command::LockInvalidated { target, client_id } => {
                self.handle_lock_invalidated(target, client_id).await;
            }
            Command::Shutdown => (),
        }
    }

    /// A volume appeared (or was mounted); start watching it if it is
    /// one of ours.
    pub(crate) async fn vol_appeared(&mut self, bsd_name: &str) {
        match self.try_watch(bsd_name).await {
            Ok(true) => {
                // in case it needs an update right away
                self.check_rebuild(bsd_name, false).await;
            }
            Ok(false) => (), // uninteresting volume
            Err(err) => {
                tracing::error!(%bsd_name, ?err, "trouble setting up volume watch");
            }
        }
    }

    async fn try_watch(&mut self, bsd_name: &str) -> Result<bool> {
        let desc = self.arbiter.description(bsd_name)?;
        let root = match desc.mount_point {
            Some(root) => root,
            None => return Ok(false), // not mounted yet
        };
        if !desc.writable || desc.network {
            return Ok(false);
        }

        if self.watched.contains_key(bsd_name) {
            tracing::warn!(%bsd_name, "refreshing watch of volume already in watch table");
            self.vol_disappeared(bsd_name);
        }

        // only volumes that boot from helper partitions are interesting
        let binfo = self.arbiter.booter_info(&root)?;
        if !binfo.is_boot_root() {
            return Ok(false);
        }

        // enable ownership long enough to read the descriptor honestly
        let mut owners_toggled = false;
        if desc.owners_ignored {
            match self.arbiter.set_owners_honored(bsd_name, true).await {
                Ok(()) => owners_toggled = true,
                Err(err) => tracing::warn!(%bsd_name, ?err, "couldn't enable owners"),
            }
        }
        let caches = BootCaches::read(&root, self.arbiter.as_ref());
        if owners_toggled {
            if let Err(err) = self.arbiter.set_owners_honored(bsd_name, false).await {
                tracing::warn!(%bsd_name, ?err, "couldn't disable owners");
            }
        }

        let caches = match caches? {
            Some(caches) => caches,
            None => return Ok(false),
        };

        let mut watched = WatchedVol::new(caches);
        self.watch_paths(bsd_name, &mut watched);
        self.watched.insert(bsd_name.to_string(), watched);
        Ok(true)
    }

    /// Register change notifications for every path the descriptor
    /// names. Paths that do not exist yet are watched via their parent
    /// directory so that their creation is still seen.
    fn watch_paths(&self, bsd_name: &str, watched: &mut WatchedVol) {
        use notify::Watcher;

        let tx = self.tx.clone();
        let bsd = bsd_name.to_string();
        let mut watcher = match notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = tx.send(Command::PathChanged {
                        bsd_name: bsd.clone(),
                    });
                }
            },
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::error!(%bsd_name, ?err, "couldn't create path watcher");
                return;
            }
        };

        for path in watched.caches.watched_paths() {
            let target = if path.exists() {
                path
            } else {
                match path.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => path,
                }
            };
            match watcher.watch(&target, notify::RecursiveMode::NonRecursive) {
                Ok(()) => watched.watched_paths.push(target),
                Err(err) => {
                    tracing::debug!(%bsd_name, ?target, ?err, "couldn't watch path");
                }
            }
        }

        watched._watcher = Some(watcher);
    }

    /// The disk's description changed; remount churn shows up here.
    pub(crate) async fn vol_changed(&mut self, bsd_name: &str) {
        if self.watched.contains_key(bsd_name) {
            self.vol_disappeared(bsd_name);
        }
        let mounted = self
            .arbiter
            .description(bsd_name)
            .map(|desc| desc.mount_point.is_some())
            .unwrap_or(false);
        if mounted {
            self.vol_appeared(bsd_name).await;
        }
    }

    /// Remove a volume from the watch table, canceling its timer and
    /// notifications and discarding any held lock.
    pub(crate) fn vol_disappeared(&mut self, bsd_name: &str) {
        // dropping the record cancels everything; a disappeared volume
        // no longer cares about ownership either way
        self.watched.remove(bsd_name);
    }

    /// Would we rather this volume not be unmounted right now?
    pub(crate) fn check_vol_busy(&mut self, bsd_name: &str) -> bool {
        let arbiter = Arc::clone(&self.arbiter);
        match self.watched.get_mut(bsd_name) {
            Some(watched) => {
                watched.lock.is_some() || Controller::work_pending(arbiter.as_ref(), watched)
            }
            None => false,
        }
    }

    /// True when the volume's caches or helpers still need attention.
    pub(crate) fn work_pending(arbiter: &dyn DiskArbiter, watched: &mut WatchedVol) -> bool {
        if staleness::mkext_needs_rebuild(&watched.caches) {
            return true;
        }
        let binfo = match arbiter.booter_info(watched.caches.root()) {
            Ok(binfo) => binfo,
            // can't tell; assume the worst
            Err(_) => return true,
        };
        if !binfo.is_boot_root() {
            return false;
        }
        match staleness::scan(&mut watched.caches) {
            Ok(stale) => stale.any,
            Err(_) => true,
        }
    }

    /// A watched path changed; (re)arm the settle timer so the volume
    /// gets a chance to quiet down before we rebuild.
    pub(crate) fn handle_path_changed(&mut self, bsd_name: &str) {
        let settle = Duration::from_secs(self.settle_seconds());
        let tx = self.tx.clone();

        let watched = match self.watched.get_mut(bsd_name) {
            Some(watched) => watched,
            None => {
                // the notification should have been canceled
                tracing::warn!(%bsd_name, "change notification for unwatched volume");
                return;
            }
        };

        // cancel any existing timer; updates are evidently in progress
        if let Some(settle) = watched.settle.take() {
            settle.abort();
        }

        let bsd = bsd_name.to_string();
        watched.settle = Some(tokio::task::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = tx.send(Command::SettleExpired { bsd_name: bsd });
        }));
    }

    /// The settle timer fired; see what actually needs doing.
    pub(crate) async fn handle_settle_expired(&mut self, bsd_name: &str) {
        match self.watched.get_mut(bsd_name) {
            Some(watched) => watched.settle = None, // timer no longer pending
            None => return,                        // should have been invalidated
        }
        self.check_rebuild(bsd_name, false).await;
    }

    /// Check every cache on the volume and fire whatever rebuild is
    /// called for: the external builder for a stale mkext, or the
    /// helper update engine for everything else. Returns true when a
    /// rebuild ran or was launched.
    ///
    /// Rebuilding only what is out of date matters: the mkext rebuild
    /// touches the mkext, whose change notification brings us back
    /// here for the helper partitions.
    pub(crate) async fn check_rebuild(&mut self, bsd_name: &str, force: bool) -> bool {
        let arbiter = Arc::clone(&self.arbiter);
        let watched = match self.watched.get_mut(bsd_name) {
            Some(watched) => watched,
            None => return false,
        };

        // if we came in some other way and a timer is pending, cancel it
        if let Some(settle) = watched.settle.take() {
            settle.abort();
        }

        if force || staleness::mkext_needs_rebuild(&watched.caches) {
            match builder::rebuild_mkext(&watched.caches, false).await {
                Ok(_) => return true,
                Err(err) => {
                    tracing::error!(%bsd_name, ?err, "couldn't launch mkext rebuild");
                    // so a broken volume doesn't block reboot forever
                    watched.errcount += 1;
                    return false;
                }
            }
        }

        // does the volume have helper partitions that need content?
        let binfo = match arbiter.booter_info(watched.caches.root()) {
            Ok(binfo) => binfo,
            Err(err) => {
                tracing::warn!(%bsd_name, ?err, "couldn't query helper partitions");
                return false;
            }
        };
        if !binfo.is_boot_root() {
            return false;
        }

        let stale = match staleness::scan(&mut watched.caches) {
            Ok(stale) => stale,
            // a stat error means we can't trust the stamps at all
            Err(_) => Staleness::all(),
        };
        if !stale.any && !force {
            return false;
        }
        let stale = if force { Staleness::all() } else { stale };

        let result = HelperUpdater::new(&mut watched.caches, arbiter.as_ref(), stale)
            .update_helpers(&binfo.helpers)
            .await;
        match result {
            Ok(()) => {
                if watched.errcount > 0 {
                    tracing::info!(%bsd_name, "helper update succeeded (previously failed)");
                    watched.errcount = 0;
                }
                true
            }
            Err(err) => {
                tracing::error!(%bsd_name, ?err, "helper update failed");
                watched.errcount += 1;
                false
            }
        }
    }

    /// Walk the currently mounted local disks and re-examine any that
    /// are not yet watched, returning the first that reports work.
    /// Used before granting the reboot lock.
    pub(crate) async fn reconsider_volumes(&mut self) -> Option<String> {
        let disks = match self.arbiter.local_disks() {
            Ok(disks) => disks,
            Err(err) => {
                tracing::warn!(?err, "error while getting mount list");
                return None;
            }
        };

        let arbiter = Arc::clone(&self.arbiter);
        let mut busy = None;
        for bsd_name in disks {
            if self.watched.contains_key(&bsd_name) {
                continue; // the reboot check covers those already
            }
            self.vol_appeared(&bsd_name).await;
            if let Some(watched) = self.watched.get_mut(&bsd_name) {
                if Controller::work_pending(arbiter.as_ref(), watched) {
                    busy = Some(bsd_name);
                }
            }
        }
        busy
    }

    pub(crate) fn settle_seconds(&self) -> u64 {
        crate::get_config()
            .map(|c| c.watch.settle_seconds)
            .unwrap_or(5)
    }

    pub(crate) fn giveup_threshold(&self) -> u32 {
        crate::get_config()
            .map(|c| c.watch.giveup_threshold)
            .unwrap_or(5)
    }
}
