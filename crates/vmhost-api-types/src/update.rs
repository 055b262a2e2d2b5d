// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sparse state-diff events delivered to update watchers.
//!
//! Every host-level field of an [`Update`] is optional: `None` means
//! "unchanged since the last event", never "cleared". VMs are reported
//! individually, and a VM that left the host is reported as
//! [`VmChange::Removed`] rather than by omission.

use std::collections::BTreeMap;
use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Address, GetCapacityResponse, Subnet, VmInfo};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
#[serde(tag = "change", content = "info")]
pub enum VmChange {
    Changed(Box<VmInfo>),
    Removed,
}

#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    PartialEq,
    Eq,
    Serialize,
    JsonSchema,
)]
#[serde(default)]
pub struct Update {
    /// Free addresses across all subnets.
    pub address_pool: Option<Vec<Address>>,
    pub capacity: Option<GetCapacityResponse>,
    /// Free address count per subnet id.
    pub num_free_addresses: Option<BTreeMap<String, u64>>,
    pub subnets: Option<Vec<Subnet>>,
    /// VMs whose record changed or which were removed.
    pub vms: BTreeMap<IpAddr, VmChange>,
    /// When set, `vms` lists every VM on the host and any VM cached by the
    /// watcher but absent here is gone.
    pub vms_complete: bool,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.address_pool.is_none()
            && self.capacity.is_none()
            && self.num_free_addresses.is_none()
            && self.subnets.is_none()
            && self.vms.is_empty()
            && !self.vms_complete
    }

    pub fn vm_changed(info: VmInfo) -> Option<Self> {
        let addr = info.address.ip_address?;
        let mut update = Update::default();
        update.vms.insert(addr, VmChange::Changed(Box::new(info)));
        Some(update)
    }

    pub fn vm_removed(addr: IpAddr) -> Self {
        let mut update = Update::default();
        update.vms.insert(addr, VmChange::Removed);
        update
    }
}

/// A watcher's cached view of a host, built by merging updates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostView {
    pub address_pool: Vec<Address>,
    pub capacity: GetCapacityResponse,
    pub num_free_addresses: BTreeMap<String, u64>,
    pub subnets: Vec<Subnet>,
    pub vms: BTreeMap<IpAddr, VmInfo>,
}

impl HostView {
    /// Merges `update` into the view, overwriting only fields it carries.
    pub fn apply(&mut self, update: Update) {
        if let Some(pool) = update.address_pool {
            self.address_pool = pool;
        }
        if let Some(capacity) = update.capacity {
            self.capacity = capacity;
        }
        if let Some(counts) = update.num_free_addresses {
            self.num_free_addresses = counts;
        }
        if let Some(subnets) = update.subnets {
            self.subnets = subnets;
        }
        if update.vms_complete {
            self.vms.retain(|addr, _| update.vms.contains_key(addr));
        }
        for (addr, change) in update.vms {
            match change {
                VmChange::Changed(info) => {
                    self.vms.insert(addr, *info);
                }
                VmChange::Removed => {
                    self.vms.remove(&addr);
                }
            }
        }
    }
}
