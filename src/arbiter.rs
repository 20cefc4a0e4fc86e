// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Exclusive update locks handed out to external rebuilders.
//!
//! Two lock scopes exist: one per watched volume, taken by a cache
//! builder while it updates that volume, and a single process-wide
//! reboot lock that shutdown takes once no volume has work left. A
//! client is represented by a channel endpoint; dropping the client's
//! guard (including by crashing) invalidates the endpoint and the
//! controller treats the lock as released.
//!
//! Only uid 0 callers reach these operations; that check belongs to
//! the transport fronting the daemon.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::builder::EX_TEMPFAIL;
use crate::controller::{Command, Controller, LockTarget};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./arbiter_test.rs"]
mod arbiter_test;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Held by the remote client for as long as it wants the lock; the
/// matching [`LockClient`] sees the drop.
#[derive(Debug)]
pub struct ClientGuard {
    id: u64,
    _alive: mpsc::UnboundedSender<Infallible>,
}

impl ClientGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The server side of a client endpoint.
#[derive(Debug)]
pub struct LockClient {
    id: u64,
    closed: mpsc::UnboundedReceiver<Infallible>,
}

impl LockClient {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Create a connected client endpoint pair.
pub fn client_pair() -> (ClientGuard, LockClient) {
    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (alive, closed) = mpsc::unbounded_channel();
    (ClientGuard { id, _alive: alive }, LockClient { id, closed })
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReply {
    Granted,
    Busy { device: Option<String> },
    NotFound,
    /// Reserved for the transport layer's caller checks
    NotPermitted,
}

/// A granted lock, watching its client for death.
pub(crate) struct HeldLock {
    id: u64,
    watcher: JoinHandle<()>,
}

impl HeldLock {
    /// Retain the client and start watching for its endpoint going
    /// invalid before a clean release.
    pub(crate) fn engage(
        mut client: LockClient,
        target: LockTarget,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let id = client.id;
        let watcher = tokio::task::spawn(async move {
            // resolves only once every guard for this client is gone
            if client.closed.recv().await.is_none() {
                let _ = tx.send(Command::LockInvalidated {
                    target,
                    client_id: id,
                });
            }
        });
        Self { id, watcher }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl Controller {
    /// Lock everything ahead of a reboot or shutdown.
    ///
    /// Granted only when no volume is locked and no volume still has
    /// work to do. Volumes that keep failing are skipped so that one
    /// broken disk cannot hold up reboot indefinitely.
    pub(crate) async fn handle_lock_reboot(&mut self, client: LockClient) -> LockReply {
        if self.reboot_lock.is_some() {
            return LockReply::Busy { device: None };
        }

        // check whether any new volumes have become eligible
        if let Some(device) = self.reconsider_volumes().await {
            tracing::info!(%device, "busy, preventing lock for reboot");
            return LockReply::Busy {
                device: Some(device),
            };
        }

        let threshold = self.giveup_threshold();
        let arbiter = Arc::clone(&self.arbiter);
        for (bsd_name, watched) in self.watched.iter_mut() {
            let busy = watched.lock.is_some()
                || (watched.errcount < threshold
                    && Controller::work_pending(arbiter.as_ref(), watched));
            if busy {
                tracing::info!(%bsd_name, "busy, preventing lock for reboot");
                return LockReply::Busy {
                    device: Some(bsd_name.clone()),
                };
            }
        }

        self.reboot_lock = Some(HeldLock::engage(
            client,
            LockTarget::Reboot,
            self.command_sender(),
        ));
        LockReply::Granted
    }

    /// Take the exclusive update lock for one volume.
    pub(crate) async fn handle_lock_volume(
        &mut self,
        bsd_name: &str,
        client: LockClient,
    ) -> LockReply {
        // deny new work while we're headed for reboot
        if self.reboot_lock.is_some() {
            return LockReply::Busy { device: None };
        }

        let arbiter = Arc::clone(&self.arbiter);
        let owners_ignored = arbiter
            .description(bsd_name)
            .map(|desc| desc.owners_ignored)
            .unwrap_or(false);

        let tx = self.command_sender();
        let watched = match self.watched.get_mut(bsd_name) {
            Some(watched) => watched,
            None => return LockReply::NotFound,
        };
        if watched.lock.is_some() {
            return LockReply::Busy { device: None };
        }
        watched.lock = Some(HeldLock::engage(
            client,
            LockTarget::Volume(bsd_name.to_string()),
            tx,
        ));

        // enable owners for the locker if they are not honored; the
        // release paths revert this
        if owners_ignored {
            match arbiter.set_owners_honored(bsd_name, true).await {
                Ok(()) => watched.owners_enabled = true,
                Err(err) => {
                    tracing::warn!(%bsd_name, ?err, "couldn't enable owners for locker")
                }
            }
        }

        LockReply::Granted
    }

    /// Release a volume lock, recording the locker's outcome.
    pub(crate) async fn handle_unlock_volume(
        &mut self,
        bsd_name: &str,
        client_id: u64,
        exit_status: i32,
    ) -> Result<()> {
        let arbiter = Arc::clone(&self.arbiter);
        let watched = self
            .watched
            .get_mut(bsd_name)
            .ok_or_else(|| Error::UnknownVolume(bsd_name.to_string()))?;

        match &watched.lock {
            None => return Err(Error::new(format!("{bsd_name} isn't locked"))),
            Some(lock) if lock.id() != client_id => {
                return Err(Error::new(format!(
                    "client {client_id} was not used to lock {bsd_name}"
                )))
            }
            Some(_) => (),
        }

        if exit_status == EX_TEMPFAIL {
            // the locker isn't done yet; record nothing
        } else if exit_status != 0 {
            tracing::warn!(%bsd_name, exit_status, "locker reported a problem updating volume");
            watched.errcount += 1;
        } else if watched.errcount > 0 {
            // put a reassuring message in the log
            tracing::info!(%bsd_name, "update succeeded (previously failed)");
            watched.errcount = 0;
        }

        if watched.owners_enabled {
            if let Err(err) = arbiter.set_owners_honored(bsd_name, false).await {
                tracing::warn!(%bsd_name, ?err, "couldn't disable owners on unlock");
            }
            watched.owners_enabled = false;
        }

        watched.lock = None;
        Ok(())
    }

    /// A lock client's endpoint went invalid; if the client still held
    /// a lock this was a crash and the lock is forcibly released.
    pub(crate) async fn handle_lock_invalidated(&mut self, target: LockTarget, client_id: u64) {
        match target {
            LockTarget::Reboot => {
                if self.reboot_lock.as_ref().map(|l| l.id()) == Some(client_id) {
                    tracing::warn!("reboot client should have rebooted instead of dying");
                    self.reboot_lock = None;
                }
            }
            LockTarget::Volume(bsd_name) => {
                let arbiter = Arc::clone(&self.arbiter);
                let watched = match self.watched.get_mut(&bsd_name) {
                    Some(watched) => watched,
                    // the volume might have been renamed while in action
                    None => return,
                };
                if watched.lock.as_ref().map(|l| l.id()) != Some(client_id) {
                    // a clean release already happened
                    return;
                }

                tracing::error!(%bsd_name, "client exited without releasing lock");
                if watched.owners_enabled {
                    if let Err(err) = arbiter.set_owners_honored(&bsd_name, false).await {
                        tracing::warn!(%bsd_name, ?err, "couldn't disable owners after crash");
                    }
                    watched.owners_enabled = false;
                }
                watched.lock = None;
                watched.errcount += 1;
            }
        }
    }
}
