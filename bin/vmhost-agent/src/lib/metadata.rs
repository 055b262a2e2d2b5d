// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracing of guest requests to the metadata service.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use slog::{trace, Logger};
use tokio::sync::broadcast;

const TRACE_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataAccess {
    pub path: String,
    pub at: DateTime<Utc>,
}

/// Fans metadata accesses out to whoever is tracing the VM that made them.
pub struct MetadataTracer {
    channels: Mutex<HashMap<IpAddr, broadcast::Sender<MetadataAccess>>>,
    log: Logger,
}

impl MetadataTracer {
    pub fn new(log: Logger) -> Self {
        Self { channels: Mutex::new(HashMap::new()), log }
    }

    fn channels(
        &self,
    ) -> MutexGuard<'_, HashMap<IpAddr, broadcast::Sender<MetadataAccess>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, vm: IpAddr, path: &str) {
        let mut channels = self.channels();
        let Some(tx) = channels.get(&vm) else {
            return;
        };
        trace!(self.log, "metadata access"; "vm" => %vm, "path" => path);
        let access = MetadataAccess { path: path.to_string(), at: Utc::now() };
        if tx.send(access).is_err() {
            // Every tracer has gone away.
            channels.remove(&vm);
        }
    }

    pub fn subscribe(&self, vm: IpAddr) -> broadcast::Receiver<MetadataAccess> {
        self.channels()
            .entry(vm)
            .or_insert_with(|| broadcast::channel(TRACE_QUEUE_DEPTH).0)
            .subscribe()
    }

    /// Ends every trace of `vm`.
    pub fn forget(&self, vm: IpAddr) {
        self.channels().remove(&vm);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn traces_only_the_subscribed_vm() {
        let t = MetadataTracer::new(Logger::root(slog::Discard, slog::o!()));
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        let b: IpAddr = "10.0.0.6".parse().unwrap();

        t.record(a, "/before");
        let mut rx = t.subscribe(a);
        t.record(b, "/other");
        t.record(a, "/latest/user-data");
        assert_eq!(rx.recv().await.unwrap().path, "/latest/user-data");

        t.forget(a);
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn abandoned_channels_are_dropped() {
        let t = MetadataTracer::new(Logger::root(slog::Discard, slog::o!()));
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        drop(t.subscribe(a));
        t.record(a, "/x");
        assert!(t.channels().is_empty());
    }
}
