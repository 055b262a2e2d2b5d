// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of sparse state-diff events to update watchers.
//!
//! Each watcher owns a bounded queue. Publishing never blocks: a watcher
//! whose queue is full has fallen too far behind to merge diffs safely, so it
//! is dropped, and the closed channel tells it to resubscribe and start over
//! from a full-state event. There is no replay.
//!
//! Publishers that need per-VM ordering publish while holding the lock that
//! serializes the corresponding mutations (see [`crate::vm::Registry`]).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{debug, info, Logger};
use tokio::sync::mpsc;
use vmhost_api_types::Update;

/// Depth of each watcher's event queue.
pub const WATCHER_QUEUE_DEPTH: usize = 256;

#[derive(Default)]
struct Watchers {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::Sender<Update>>,
}

pub struct UpdateBroadcaster {
    watchers: Mutex<Watchers>,
    log: Logger,
}

/// A subscription. Dropping it unregisters the watcher.
pub struct Watcher {
    id: u64,
    rx: mpsc::Receiver<Update>,
    broadcaster: Arc<UpdateBroadcaster>,
}

impl Watcher {
    /// Waits for the next event. `None` means the watcher was dropped by the
    /// broadcaster and must resubscribe.
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id);
    }
}

impl UpdateBroadcaster {
    pub fn new(log: Logger) -> Self {
        Self { watchers: Mutex::new(Watchers::default()), log }
    }

    fn watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a watcher whose first event is produced by `initial`.
    ///
    /// `initial` runs while the watcher table is locked, so no event
    /// published after the snapshot is taken can be missed, and none
    /// published before it is delivered twice.
    pub fn subscribe(
        self: &Arc<Self>,
        initial: impl FnOnce() -> Update,
    ) -> Watcher {
        let (tx, rx) = mpsc::channel(WATCHER_QUEUE_DEPTH);
        let mut watchers = self.watchers();
        let id = watchers.next_id;
        watchers.next_id += 1;
        // The queue is empty, so this cannot fail.
        let _ = tx.try_send(initial());
        watchers.senders.insert(id, tx);
        info!(self.log, "update watcher registered"; "watcher" => id);
        Watcher { id, rx, broadcaster: self.clone() }
    }

    fn unregister(&self, id: u64) {
        if self.watchers().senders.remove(&id).is_some() {
            info!(self.log, "update watcher unregistered"; "watcher" => id);
        }
    }

    pub fn publish(&self, update: Update) {
        if update.is_empty() {
            return;
        }
        let mut watchers = self.watchers();
        watchers.senders.retain(|id, tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(self.log, "dropping update watcher";
                       "watcher" => *id, "reason" => %e);
                false
            }
        });
    }

    /// Publishes the update built by `f` only if anyone is listening.
    pub fn publish_with(&self, f: impl FnOnce() -> Update) {
        if self.watcher_count() > 0 {
            self.publish(f());
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers().senders.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::IpAddr;
    use vmhost_api_types::{Address, VmChange, VmInfo, VmState};

    fn broadcaster() -> Arc<UpdateBroadcaster> {
        let log = Logger::root(slog::Discard, slog::o!());
        Arc::new(UpdateBroadcaster::new(log))
    }

    fn changed(addr: &str, state: VmState) -> Update {
        Update::vm_changed(VmInfo {
            address: Address {
                ip_address: Some(addr.parse().unwrap()),
                mac_address: String::new(),
            },
            state,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn initial_event_comes_first() {
        let b = broadcaster();
        let mut w = b.subscribe(|| Update {
            vms_complete: true,
            ..Default::default()
        });
        b.publish(changed("10.0.0.1", VmState::Running));

        assert!(w.recv().await.unwrap().vms_complete);
        let next = w.recv().await.unwrap();
        assert!(!next.vms_complete);
        assert_eq!(next.vms.len(), 1);
    }

    #[tokio::test]
    async fn per_vm_order_is_preserved() {
        let b = broadcaster();
        let mut w = b.subscribe(Update::default);
        let states = [VmState::Starting, VmState::Running, VmState::Stopping];
        for s in states {
            b.publish(changed("10.0.0.1", s));
        }
        let _initial = w.recv().await;
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        for s in states {
            match &w.recv().await.unwrap().vms[&addr] {
                VmChange::Changed(info) => assert_eq!(info.state, s),
                VmChange::Removed => panic!("unexpected removal"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_watcher_is_unregistered() {
        let b = broadcaster();
        let w = b.subscribe(Update::default);
        let _w2 = b.subscribe(Update::default);
        assert_eq!(b.watcher_count(), 2);
        drop(w);
        assert_eq!(b.watcher_count(), 1);
    }

    #[tokio::test]
    async fn slow_watcher_is_cut_off() {
        let b = broadcaster();
        let mut w = b.subscribe(Update::default);
        for _ in 0..WATCHER_QUEUE_DEPTH {
            b.publish(changed("10.0.0.1", VmState::Running));
        }
        assert_eq!(b.watcher_count(), 0);

        // Whatever was queued is still delivered, then the stream ends.
        let mut n = 0;
        while w.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(n, WATCHER_QUEUE_DEPTH);
    }

    #[test]
    fn empty_updates_are_not_sent() {
        let b = broadcaster();
        let mut w = b.subscribe(Update::default);
        b.publish(Update::default());
        assert!(w.rx.try_recv().is_ok());
        assert!(w.rx.try_recv().is_err());
    }
}
