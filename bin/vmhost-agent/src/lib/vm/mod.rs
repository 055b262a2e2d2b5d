// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM registry: the authoritative table of VMs resident on this host.
//!
//! The registry owns every [`VmEntry`]. State changes go through
//! [`Registry::apply_transition`] and friends, which consult the transition
//! table in [`transition`]; field changes go through [`Registry::update`].
//! Every committed change is published to the update broadcaster while the
//! table is still locked, which is what gives watchers per-VM ordering.
//!
//! Uncommitted entries (VMs mid-creation, or arriving by migration) hold
//! their address but are invisible to listings and to watchers until
//! [`Registry::commit`].

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use slog::{info, Logger};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use vmhost_api_types::{MatchTags, Update, VmChange, VmInfo, VmState};

use crate::migrate::handshake::Phase;
use crate::migrate::MigrateRole;
use crate::updates::{UpdateBroadcaster, Watcher};

pub mod transition;

use transition::{InvalidTransition, Outcome, Trigger};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("VM {0} not found")]
    NotFound(IpAddr),

    #[error("a VM with address {0} already exists")]
    AlreadyExists(IpAddr),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("VM {addr} cannot be changed while it is {state}")]
    Frozen { addr: IpAddr, state: VmState },

    #[error("VM {addr} is busy: {op} in progress")]
    Busy { addr: IpAddr, op: &'static str },

    #[error("VM {0} is not uncommitted")]
    Committed(IpAddr),

    #[error("VM {0} is not migrating")]
    NotMigrating(IpAddr),

    #[error("VM descriptor has no IP address")]
    MissingAddress,
}

/// The migration a VM is part of. Present exactly when the VM is
/// `Migrating`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Host:port of the agent on the other end.
    pub peer: String,
    pub role: MigrateRole,
    pub phase: Phase,
}

#[derive(Clone, Debug)]
pub struct VmEntry {
    /// The VM's descriptor. `info.state` is the lifecycle state.
    pub info: VmInfo,
    pub migration: Option<MigrationInfo>,
    pub migration_source_disabled: bool,
    /// Name of a long-running operation holding the VM, if any.
    pub busy: Option<&'static str>,
}

impl VmEntry {
    pub fn state(&self) -> VmState {
        self.info.state
    }

    fn role(&self) -> Option<MigrateRole> {
        self.migration.as_ref().map(|m| m.role)
    }

    fn check_mutable(&self, addr: IpAddr) -> Result<(), RegistryError> {
        if let Some(op) = self.busy {
            return Err(RegistryError::Busy { addr, op });
        }
        match self.info.state {
            state @ (VmState::Migrating | VmState::Destroying) => {
                Err(RegistryError::Frozen { addr, state })
            }
            _ => Ok(()),
        }
    }
}

/// Selects VMs for listings.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub ignore_state_mask: u64,
    pub owner_users: Vec<String>,
    pub owner_groups: Vec<String>,
    pub tags: MatchTags,
}

impl ListFilter {
    fn matches(&self, info: &VmInfo) -> bool {
        let ignored = self.ignore_state_mask & info.state.mask_bit() != 0;
        if info.uncommitted || ignored {
            return false;
        }
        if !self.owner_users.is_empty() || !self.owner_groups.is_empty() {
            let by_user =
                self.owner_users.iter().any(|u| info.owner_users.contains(u));
            let by_group =
                self.owner_groups.iter().any(|g| info.owner_groups.contains(g));
            if !by_user && !by_group {
                return false;
            }
        }
        info.matches_tags(&self.tags)
    }
}

pub struct Registry {
    vms: Mutex<BTreeMap<IpAddr, VmEntry>>,
    /// Woken whenever an operation marker is cleared.
    idle: Notify,
    updates: Arc<UpdateBroadcaster>,
    log: Logger,
}

type Table<'a> = MutexGuard<'a, BTreeMap<IpAddr, VmEntry>>;

impl Registry {
    pub fn new(updates: Arc<UpdateBroadcaster>, log: Logger) -> Self {
        Self {
            vms: Mutex::new(BTreeMap::new()),
            idle: Notify::new(),
            updates,
            log,
        }
    }

    fn table(&self) -> Table<'_> {
        self.vms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, entry: &VmEntry) {
        if entry.info.uncommitted {
            return;
        }
        if let Some(update) = Update::vm_changed(entry.info.clone()) {
            self.updates.publish(update);
        }
    }

    fn entry_mut<'a>(
        table: &'a mut Table<'_>,
        addr: IpAddr,
    ) -> Result<&'a mut VmEntry, RegistryError> {
        table.get_mut(&addr).ok_or(RegistryError::NotFound(addr))
    }

    pub fn lookup(&self, addr: IpAddr) -> Result<VmEntry, RegistryError> {
        self.table().get(&addr).cloned().ok_or(RegistryError::NotFound(addr))
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.table().contains_key(&addr)
    }

    fn insert(
        &self,
        mut info: VmInfo,
        migration: Option<MigrationInfo>,
    ) -> Result<VmEntry, RegistryError> {
        let addr =
            info.address.ip_address.ok_or(RegistryError::MissingAddress)?;
        let mut table = self.table();
        if table.contains_key(&addr) {
            return Err(RegistryError::AlreadyExists(addr));
        }
        let now = Utc::now();
        info.uncommitted = true;
        info.created_on.get_or_insert(now);
        info.changed_state_on = Some(now);
        let entry = VmEntry {
            info,
            migration,
            migration_source_disabled: false,
            busy: None,
        };
        table.insert(addr, entry.clone());
        info!(self.log, "VM entry created";
              "vm" => %addr, "state" => %entry.state());
        Ok(entry)
    }

    /// Creates an uncommitted entry for a new VM. Creation is not a
    /// transition: a new VM begins either `Starting` or `Stopped`.
    pub fn create(
        &self,
        mut info: VmInfo,
        initial: VmState,
    ) -> Result<VmEntry, RegistryError> {
        if !matches!(initial, VmState::Starting | VmState::Stopped) {
            return Err(InvalidTransition {
                state: initial,
                trigger: Trigger::StartRequested,
            }
            .into());
        }
        info.state = initial;
        self.insert(info, None)
    }

    /// Creates the uncommitted, `Migrating` entry a migration destination
    /// receives a VM into.
    pub fn create_incoming(
        &self,
        mut info: VmInfo,
        peer: String,
    ) -> Result<VmEntry, RegistryError> {
        info.state = VmState::Migrating;
        self.insert(
            info,
            Some(MigrationInfo {
                peer,
                role: MigrateRole::Destination,
                phase: Phase::Prepare,
            }),
        )
    }

    fn transition_locked(
        &self,
        table: &mut Table<'_>,
        addr: IpAddr,
        trigger: Trigger,
        migration: Option<MigrationInfo>,
    ) -> Result<Outcome, RegistryError> {
        let entry = Self::entry_mut(table, addr)?;
        if let Some(op) = entry.busy {
            return Err(RegistryError::Busy { addr, op });
        }
        let from = entry.state();
        let outcome = transition::next(from, entry.role(), trigger)?;
        match outcome {
            Outcome::Enter(VmState::Migrating) if migration.is_none() => {
                return Err(InvalidTransition { state: from, trigger }.into());
            }
            Outcome::Enter(to) => {
                entry.info.state = to;
                entry.info.changed_state_on = Some(Utc::now());
                entry.migration =
                    if to == VmState::Migrating { migration } else { None };
                info!(self.log, "VM state changed";
                      "vm" => %addr, "from" => %from, "to" => %to,
                      "trigger" => %trigger);
                let entry = entry.clone();
                self.publish(&entry);
            }
            Outcome::Remove => {
                if let Some(entry) = table.remove(&addr) {
                    info!(self.log, "VM entry removed";
                          "vm" => %addr, "from" => %from);
                    if !entry.info.uncommitted {
                        self.updates.publish(Update::vm_removed(addr));
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Applies `trigger` to the VM at `addr`. On rejection the VM is left
    /// exactly as it was.
    pub fn apply_transition(
        &self,
        addr: IpAddr,
        trigger: Trigger,
    ) -> Result<Outcome, RegistryError> {
        let mut table = self.table();
        self.transition_locked(&mut table, addr, trigger, None)
    }

    /// Applies each of `triggers` in turn without letting any other change
    /// in between. Stops at the first rejection.
    pub fn apply_transitions(
        &self,
        addr: IpAddr,
        triggers: &[Trigger],
    ) -> Result<(), RegistryError> {
        let mut table = self.table();
        for trigger in triggers {
            self.transition_locked(&mut table, addr, *trigger, None)?;
        }
        Ok(())
    }

    /// Moves a running VM into `Migrating` as the source of a migration to
    /// `peer`.
    pub fn begin_migration(
        &self,
        addr: IpAddr,
        peer: String,
    ) -> Result<VmEntry, RegistryError> {
        let mut table = self.table();
        let migration = MigrationInfo {
            peer,
            role: MigrateRole::Source,
            phase: Phase::Prepare,
        };
        self.transition_locked(
            &mut table,
            addr,
            Trigger::MigrationAccepted,
            Some(migration),
        )?;
        Self::entry_mut(&mut table, addr).map(|e| e.clone())
    }

    pub fn set_migration_phase(
        &self,
        addr: IpAddr,
        phase: Phase,
    ) -> Result<(), RegistryError> {
        let mut table = self.table();
        let entry = Self::entry_mut(&mut table, addr)?;
        let migration = entry
            .migration
            .as_mut()
            .ok_or(RegistryError::NotMigrating(addr))?;
        migration.phase = phase;
        Ok(())
    }

    /// Makes an uncommitted VM visible.
    pub fn commit(&self, addr: IpAddr) -> Result<VmEntry, RegistryError> {
        let mut table = self.table();
        let entry = Self::entry_mut(&mut table, addr)?;
        entry.info.uncommitted = false;
        let entry = entry.clone();
        info!(self.log, "VM committed"; "vm" => %addr);
        self.publish(&entry);
        Ok(entry)
    }

    /// Discards an uncommitted entry.
    pub fn remove(&self, addr: IpAddr) -> Result<VmEntry, RegistryError> {
        let mut table = self.table();
        let entry = table.get(&addr).ok_or(RegistryError::NotFound(addr))?;
        if !entry.info.uncommitted {
            return Err(RegistryError::Committed(addr));
        }
        info!(self.log, "uncommitted VM discarded"; "vm" => %addr);
        table.remove(&addr).ok_or(RegistryError::NotFound(addr))
    }

    /// Mutates a VM's descriptor without changing its lifecycle state.
    ///
    /// `f` works on a copy; the VM is only changed (and the change only
    /// published) if it returns `Ok`.
    pub fn update<T, E>(
        &self,
        addr: IpAddr,
        f: impl FnOnce(&mut VmInfo) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<RegistryError>,
    {
        let mut table = self.table();
        let entry = Self::entry_mut(&mut table, addr)?;
        entry.check_mutable(addr)?;
        self.update_entry(entry, f)
    }

    fn update_entry<T, E>(
        &self,
        entry: &mut VmEntry,
        f: impl FnOnce(&mut VmInfo) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut info = entry.info.clone();
        let out = f(&mut info)?;
        info.state = entry.info.state;
        entry.info = info;
        self.publish(entry);
        Ok(out)
    }

    /// Marks the VM as held by a long-running operation for as long as the
    /// returned guard lives. The VM must be in one of `allowed` states.
    pub fn begin_operation(
        self: &Arc<Self>,
        addr: IpAddr,
        op: &'static str,
        allowed: &[VmState],
    ) -> Result<OperationGuard, RegistryError> {
        let mut table = self.table();
        let entry = Self::entry_mut(&mut table, addr)?;
        entry.check_mutable(addr)?;
        if !allowed.contains(&entry.state()) {
            return Err(RegistryError::Frozen { addr, state: entry.state() });
        }
        entry.busy = Some(op);
        Ok(OperationGuard { registry: self.clone(), addr })
    }

    /// Resolves the next time any VM's operation marker is cleared. Call
    /// `enable` on the pinned future before checking, or a clear that
    /// happens in between is missed.
    pub fn operation_finished(&self) -> Notified<'_> {
        self.idle.notified()
    }

    /// Committed VMs selected by `filter`, in address order.
    pub fn list(&self, filter: &ListFilter) -> Vec<VmInfo> {
        self.table()
            .values()
            .filter(|e| filter.matches(&e.info))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Memory and vCPUs claimed by every VM on the host, committed or not.
    pub fn usage(&self) -> (u64, u64) {
        self.table().values().fold((0, 0), |(mem, cpus), e| {
            (
                mem.saturating_add(e.info.memory_in_mib),
                cpus.saturating_add(u64::from(e.info.virtual_cpus)),
            )
        })
    }

    /// Moves a VM to a new address. Watchers see the old address removed and
    /// the new one appear.
    pub fn rekey(
        &self,
        old: IpAddr,
        info: VmInfo,
    ) -> Result<VmEntry, RegistryError> {
        let new = info.address.ip_address.ok_or(RegistryError::MissingAddress)?;
        let mut table = self.table();
        if table.contains_key(&new) {
            return Err(RegistryError::AlreadyExists(new));
        }
        let entry = Self::entry_mut(&mut table, old)?;
        entry.check_mutable(old)?;
        let mut entry = table.remove(&old).ok_or(RegistryError::NotFound(old))?;
        let state = entry.info.state;
        entry.info = info;
        entry.info.state = state;
        table.insert(new, entry.clone());
        info!(self.log, "VM re-keyed"; "old" => %old, "new" => %new);
        if !entry.info.uncommitted {
            self.updates.publish(Update::vm_removed(old));
        }
        self.publish(&entry);
        Ok(entry)
    }

    pub fn set_migration_source_enabled(
        &self,
        addr: IpAddr,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        let mut table = self.table();
        let entry = Self::entry_mut(&mut table, addr)?;
        entry.migration_source_disabled = !enabled;
        Ok(())
    }

    /// Subscribes to updates. The first event lists every committed VM along
    /// with whatever host-level state `host` fills in.
    pub fn subscribe(&self, host: impl FnOnce() -> Update) -> Watcher {
        let table = self.table();
        self.updates.subscribe(|| {
            let mut full = host();
            full.vms_complete = true;
            full.vms = table
                .iter()
                .filter(|(_, e)| !e.info.uncommitted)
                .map(|(a, e)| (*a, VmChange::Changed(Box::new(e.info.clone()))))
                .collect();
            full
        })
    }
}

/// Holds a VM's "operation in progress" marker; dropping it clears the
/// marker.
pub struct OperationGuard {
    registry: Arc<Registry>,
    addr: IpAddr,
}

impl OperationGuard {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Updates the held VM's descriptor.
    pub fn update<T, E>(
        &self,
        f: impl FnOnce(&mut VmInfo) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<RegistryError>,
    {
        let mut table = self.registry.table();
        let entry = Registry::entry_mut(&mut table, self.addr)?;
        self.registry.update_entry(entry, f)
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.table().get_mut(&self.addr) {
            entry.busy = None;
        }
        self.registry.idle.notify_waiters();
    }
}
