// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent: every component of one host wired together, and the
//! operations callers invoke on them.
//!
//! Operations are grouped by area in the submodules; each is an inherent
//! method on [`Agent`]. Per-VM operations follow one validation order:
//! resolve the VM, take the host lock shared and the VM lock in the mode the
//! operation needs, check credentials, then ask the registry to apply the
//! change. Locks are held only across each discrete step; a VM in an
//! intermediate state (Migrating, Exporting, an operation marker) is its own
//! guard against conflicting requests.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use slog::{error, info, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vmhost_api_types::{GetCapacityResponse, Update, VmInfo, VmState};
use vmhost_config_toml::Config;

use crate::dhcp::{lease_wait, DhcpMonitor};
use crate::engine::{BootSpec, EngineEvent, VmEngine};
use crate::error::AgentError;
use crate::lock::{LockGuard, LockManager, LockMode, VmLocks};
use crate::metadata::MetadataTracer;
use crate::pool::AddressPool;
use crate::storage::{Blob, VolumeStore};
use crate::token::TokenIssuer;
use crate::updates::{UpdateBroadcaster, Watcher};
use crate::vm::transition::Trigger;
use crate::vm::{Registry, RegistryError};

mod image;
mod lifecycle;
mod mutate;
mod network;
mod query;

pub use lifecycle::CreateOutcome;

/// Header carrying the authenticated caller's user name.
pub const USER_HEADER: &str = "x-vmhost-user";
/// Header carrying the caller's groups, comma separated.
pub const GROUPS_HEADER: &str = "x-vmhost-groups";

/// Who is making a request, as established by the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    /// `None` for a local administrative caller.
    pub user: Option<String>,
    pub groups: Vec<String>,
}

impl Caller {
    pub fn admin() -> Self {
        Self::default()
    }

    pub fn user(name: &str, groups: &[&str]) -> Self {
        Self {
            user: Some(name.to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    pub fn from_headers(headers: &http::HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        Self {
            user: header(USER_HEADER).map(str::to_string),
            groups: header(GROUPS_HEADER)
                .map(|g| {
                    g.split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_none()
    }

    pub fn owns(&self, info: &VmInfo) -> bool {
        match &self.user {
            None => true,
            Some(user) => info.is_owned_by(user, &self.groups),
        }
    }

    fn name(&self) -> &str {
        self.user.as_deref().unwrap_or("<admin>")
    }
}

/// Users and groups allowed to create VMs on this host.
#[derive(Clone, Debug, Default)]
struct HostOwners {
    users: Vec<String>,
    groups: Vec<String>,
}

pub struct Agent {
    pub(crate) config: Config,
    pub(crate) registry: Arc<Registry>,
    pub(crate) locks: LockManager,
    pub(crate) pool: AddressPool,
    pub(crate) tokens: TokenIssuer,
    pub(crate) updates: Arc<UpdateBroadcaster>,
    pub(crate) storage: Arc<dyn VolumeStore>,
    pub(crate) engine: Arc<dyn VmEngine>,
    pub(crate) dhcp: DhcpMonitor,
    pub(crate) metadata: MetadataTracer,
    owners: Mutex<HostOwners>,
    advertised: OnceLock<String>,
    pub(crate) log: Logger,
}

impl Agent {
    pub fn new(
        config: Config,
        storage: Arc<dyn VolumeStore>,
        engine: Arc<dyn VmEngine>,
        log: Logger,
    ) -> Self {
        let updates = Arc::new(UpdateBroadcaster::new(
            log.new(slog::o!("component" => "updates")),
        ));
        let registry = Arc::new(Registry::new(
            updates.clone(),
            log.new(slog::o!("component" => "registry")),
        ));
        let owners = HostOwners {
            users: config.owner_users.clone(),
            groups: config.owner_groups.clone(),
        };
        Self {
            registry,
            locks: LockManager::new(log.new(slog::o!("component" => "locks"))),
            pool: AddressPool::new(
                config.subnets.clone(),
                log.new(slog::o!("component" => "pool")),
            ),
            tokens: TokenIssuer::new(
                std::time::Duration::from_secs(config.tokens.max_lifetime_secs),
                log.new(slog::o!("component" => "tokens")),
            ),
            updates,
            storage,
            engine,
            dhcp: DhcpMonitor::new(log.new(slog::o!("component" => "dhcp"))),
            metadata: MetadataTracer::new(
                log.new(slog::o!("component" => "metadata")),
            ),
            owners: Mutex::new(owners),
            advertised: OnceLock::new(),
            config,
            log,
        }
    }

    /// Records the host:port migration peers know this agent by. Only the
    /// first call has any effect.
    pub fn set_advertised_name(&self, name: String) {
        let _ = self.advertised.set(name);
    }

    pub(crate) fn advertised_name(&self) -> String {
        self.advertised.get().cloned().unwrap_or_else(|| "unknown".to_string())
    }

    fn owners(&self) -> MutexGuard<'_, HostOwners> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turns guest-side events from the engine into lifecycle transitions.
    pub fn spawn_event_handler(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                agent.handle_engine_event(event).await;
            }
            info!(agent.log, "engine event channel closed");
        })
    }

    async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) {
        let addr = event.addr();
        match event {
            EngineEvent::Crashed(_) => {
                warn!(self.log, "VM crashed"; "vm" => %addr)
            }
            EngineEvent::PoweredOff(_) => {
                info!(self.log, "VM powered off"; "vm" => %addr)
            }
        }
        match self.record_engine_event(event) {
            Err(RegistryError::Busy { op, .. }) => {
                info!(self.log, "deferring guest event";
                      "vm" => %addr, "op" => op);
                let agent = self.clone();
                tokio::spawn(async move {
                    agent.retry_engine_event(event).await;
                });
            }
            res => self.finish_engine_event(event, res).await,
        }
    }

    /// Retries an event until no operation holds its VM.
    async fn retry_engine_event(&self, event: EngineEvent) {
        loop {
            let finished = self.registry.operation_finished();
            tokio::pin!(finished);
            finished.as_mut().enable();
            match self.record_engine_event(event) {
                Err(RegistryError::Busy { .. }) => finished.await,
                res => return self.finish_engine_event(event, res).await,
            }
        }
    }

    fn record_engine_event(
        &self,
        event: EngineEvent,
    ) -> Result<(), RegistryError> {
        match event {
            EngineEvent::Crashed(addr) => self
                .registry
                .apply_transition(addr, Trigger::HealthCheckFailed)
                .map(drop),
            EngineEvent::PoweredOff(addr) => self.registry.apply_transitions(
                addr,
                &[Trigger::StopRequested, Trigger::StopCompleted],
            ),
        }
    }

    async fn finish_engine_event(
        &self,
        event: EngineEvent,
        res: Result<(), RegistryError>,
    ) {
        let addr = event.addr();
        if let Err(e) = res {
            error!(self.log, "could not record guest event";
                   "vm" => %addr, "event" => ?event, "error" => %e);
            return;
        }
        if let EngineEvent::Crashed(_) = event {
            return;
        }
        let destroy = self.registry.lookup(addr).is_ok_and(|e| {
            e.info.destroy_on_powerdown && !e.info.destroy_protection
        });
        if destroy {
            if let Err(e) = self.destroy_unchecked(addr).await {
                error!(self.log, "destroy on power-down failed";
                       "vm" => %addr, "error" => %e);
            }
        }
    }

    /// Takes the host lock shared and the VM lock in `mode`.
    pub(crate) async fn vm_locks(
        &self,
        addr: IpAddr,
        mode: LockMode,
    ) -> Result<VmLocks, AgentError> {
        Ok(self
            .locks
            .lock_host_and_vm(
                LockMode::Shared,
                addr,
                mode,
                self.config.agent.lock_timeout(),
            )
            .await?)
    }

    /// Takes the host lock for a host-wide administrative change.
    pub(crate) async fn host_lock(
        &self,
        mode: LockMode,
    ) -> Result<LockGuard, AgentError> {
        Ok(self.locks.lock_host(mode, self.config.agent.lock_timeout()).await?)
    }

    /// The caller must own the VM.
    pub(crate) fn check_owner(
        &self,
        caller: &Caller,
        info: &VmInfo,
    ) -> Result<(), AgentError> {
        if caller.owns(info) {
            return Ok(());
        }
        Err(AgentError::Unauthorized(format!(
            "{} does not own VM {}",
            caller.name(),
            describe_addr(info)
        )))
    }

    /// The caller must own the VM or present a token for it.
    pub(crate) fn check_owner_or_token(
        &self,
        caller: &Caller,
        info: &VmInfo,
        addr: IpAddr,
        token: Option<&str>,
    ) -> Result<(), AgentError> {
        if caller.owns(info) {
            return Ok(());
        }
        Ok(self.tokens.authorize(token, addr)?)
    }

    /// Operations able to destroy data need a token; only a local
    /// administrative caller may go without one.
    pub(crate) fn check_token(
        &self,
        caller: &Caller,
        addr: IpAddr,
        token: Option<&str>,
    ) -> Result<(), AgentError> {
        if caller.is_admin() {
            return Ok(());
        }
        Ok(self.tokens.authorize(token, addr)?)
    }

    /// The caller may create VMs on this host.
    pub(crate) fn check_host_owner(
        &self,
        caller: &Caller,
    ) -> Result<(), AgentError> {
        let Some(user) = caller.user.as_deref() else {
            return Ok(());
        };
        let owners = self.owners();
        if owners.users.is_empty() && owners.groups.is_empty() {
            return Ok(());
        }
        if owners.users.iter().any(|u| u == user)
            || owners.groups.iter().any(|g| caller.groups.contains(g))
        {
            return Ok(());
        }
        Err(AgentError::Unauthorized(format!(
            "{user} may not create VMs on this host"
        )))
    }

    pub(crate) fn set_host_owners(
        &self,
        users: Vec<String>,
        groups: Vec<String>,
    ) {
        *self.owners() = HostOwners { users, groups };
    }

    /// Fails unless `extra_mib` more memory fits alongside every VM already
    /// on the host.
    pub(crate) fn check_memory(
        &self,
        extra_mib: u64,
    ) -> Result<(), AgentError> {
        let (used, _) = self.registry.usage();
        let capacity = self.config.capacity.memory_mib;
        if used.saturating_add(extra_mib) > capacity {
            return Err(AgentError::ResourceExhausted(format!(
                "need {extra_mib} MiB but only {} MiB of {capacity} MiB \
                 are free",
                capacity.saturating_sub(used)
            )));
        }
        Ok(())
    }

    pub fn capacity(&self) -> GetCapacityResponse {
        GetCapacityResponse {
            memory_in_mib: self.config.capacity.memory_mib,
            num_cpus: self.config.capacity.num_cpus,
            total_volume_bytes: self.config.capacity.volume_bytes,
        }
    }

    /// Every host-level field of an update, filled in.
    pub(crate) fn host_update(&self) -> Update {
        Update {
            address_pool: Some(self.pool.free_addresses()),
            capacity: Some(self.capacity()),
            num_free_addresses: Some(self.pool.free_counts()),
            subnets: Some(self.pool.subnets()),
            ..Default::default()
        }
    }

    /// Tells watchers about a change to the pool or subnets.
    pub(crate) fn publish_host_state(&self) {
        self.updates.publish_with(|| Update {
            address_pool: Some(self.pool.free_addresses()),
            num_free_addresses: Some(self.pool.free_counts()),
            subnets: Some(self.pool.subnets()),
            ..Default::default()
        });
    }

    /// Subscribes to updates; the first event is the full host state.
    pub fn subscribe_updates(&self) -> Watcher {
        self.registry.subscribe(|| self.host_update())
    }

    pub(crate) async fn boot_spec(
        &self,
        info: &VmInfo,
        debug: bool,
    ) -> BootSpec {
        let addr =
            info.address.ip_address.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let root = if debug { Blob::DebugImage } else { Blob::Volume(0) };
        let user_data = if self.storage.exists(addr, &Blob::UserData).await {
            Some(self.storage.location(addr, &Blob::UserData))
        } else {
            None
        };
        BootSpec {
            info: info.clone(),
            root: self.storage.location(addr, &root),
            volumes: (1..info.volumes.len())
                .map(|i| self.storage.location(addr, &Blob::Volume(i)))
                .collect(),
            user_data,
        }
    }

    /// Boots a `Starting` VM and records the outcome. Returns whether the
    /// wait for the guest's DHCP lease timed out.
    pub(crate) async fn boot_vm(
        &self,
        addr: IpAddr,
        dhcp_timeout_ms: i64,
        debug: bool,
    ) -> Result<bool, AgentError> {
        let entry = self.registry.lookup(addr)?;
        let spec = self.boot_spec(&entry.info, debug).await;
        let waiter = lease_wait(dhcp_timeout_ms).map(|wait| {
            (self.dhcp.ack_waiter(&entry.info.address.mac_address), wait)
        });

        let booted = if debug {
            self.engine.boot_debug(spec).await
        } else {
            self.engine.boot(spec).await
        };
        if let Err(e) = booted {
            error!(self.log, "boot failed"; "vm" => %addr, "error" => %e);
            if !debug {
                self.registry.apply_transition(addr, Trigger::BootFailed)?;
            }
            return Err(e.into());
        }
        if !debug {
            self.registry.apply_transition(addr, Trigger::BootSucceeded)?;
        }

        let Some((waiter, wait)) = waiter else {
            return Ok(false);
        };
        let acked = waiter.wait(1, wait).await;
        if !acked {
            warn!(self.log, "timed out waiting for DHCP lease"; "vm" => %addr);
        }
        Ok(!acked)
    }

    /// Gives back everything a departing VM holds on this host other than
    /// its registry entry.
    pub(crate) async fn discard_vm_resources(&self, info: &VmInfo) {
        let Some(addr) = info.address.ip_address else {
            return;
        };
        self.pool.release(addr);
        for a in info.secondary_addresses.iter().filter_map(|a| a.ip_address) {
            self.pool.release(a);
        }
        if let Err(e) = self.storage.remove_all(addr).await {
            warn!(self.log, "could not remove VM volumes";
                  "vm" => %addr, "error" => %e);
        }
        self.tokens.revoke_vm(addr);
        self.metadata.forget(addr);
        self.locks.forget(addr);
        self.publish_host_state();
    }

    /// Removes one blob, logging rather than returning a failure.
    pub(crate) async fn remove_blob_logged(&self, addr: IpAddr, blob: &Blob) {
        if let Err(e) = self.storage.remove(addr, blob).await {
            warn!(self.log, "could not remove blob";
                  "vm" => %addr, "blob" => ?blob, "error" => %e);
        }
    }

    /// Destroys a VM in any state that permits it, with no credential
    /// checks.
    pub(crate) async fn destroy_unchecked(
        &self,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        let entry = self.registry.lookup(addr)?;
        self.registry.apply_transition(addr, Trigger::DestroyRequested)?;
        self.engine.release(addr).await;
        self.discard_vm_resources(&entry.info).await;
        self.registry.apply_transition(addr, Trigger::DestroyCompleted)?;
        info!(self.log, "VM destroyed"; "vm" => %addr);
        Ok(())
    }

    /// Looks a VM up and requires it to be in one of `allowed`.
    pub(crate) fn vm_in(
        &self,
        addr: IpAddr,
        allowed: &[VmState],
    ) -> Result<VmInfo, AgentError> {
        let entry = self.registry.lookup(addr)?;
        if !allowed.contains(&entry.state()) {
            return Err(AgentError::InvalidState(format!(
                "VM {addr} is {}",
                entry.state()
            )));
        }
        Ok(entry.info)
    }
}

fn describe_addr(info: &VmInfo) -> String {
    info.address
        .ip_address
        .map_or_else(|| "<unaddressed>".to_string(), |a| a.to_string())
}
