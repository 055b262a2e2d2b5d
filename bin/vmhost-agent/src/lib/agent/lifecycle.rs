// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating, starting, stopping, moving and destroying VMs.

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use slog::{error, info, warn};
use tokio::io::AsyncWriteExt;
use vmhost_api_types::{
    CopyVmRequest, CopyVmResponse, CreateVmRequest, CreateVmResponse,
    DestroyVmRequest, ExportLocalVmInfo, ImportLocalVmRequest, LocalVolume,
    MigrateVmRequest, MigrateVmResponse, MigrateVmResponseResponse,
    PrepareVmForMigrationRequest, RebootVmRequest, RebootVmResponse,
    ResolveVmMigrationRequest, StartVmRequest, StartVmResponse, StopVmRequest,
    VmInfo, VmState, Volume,
};

use super::{Agent, Caller};
use crate::dhcp::lease_wait;
use crate::engine::EngineError;
use crate::error::AgentError;
use crate::lock::LockMode;
use crate::migrate::destination::{self, Driver, Outcome};
use crate::migrate::handshake::{Decision, Phase};
use crate::migrate::{MigrateError, MigrateRole};
use crate::storage::Blob;
use crate::stream::{Conversation, StreamConn, StreamError};
use crate::vm::transition::Trigger;

/// The result of a successful create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateOutcome {
    pub ip_address: IpAddr,
    pub dhcp_timed_out: bool,
}

impl From<CreateOutcome> for CreateVmResponse {
    fn from(o: CreateOutcome) -> Self {
        CreateVmResponse {
            ip_address: Some(o.ip_address),
            dhcp_timed_out: o.dhcp_timed_out,
            progress_message: "created".to_string(),
            ..Default::default()
        }
    }
}

fn stream_failed(e: StreamError) -> MigrateError {
    MigrateError::Websocket(e.to_string())
}

/// Relays migration progress to the caller and asks it for the decision.
struct MigrateDriver<'a, S> {
    conv: &'a mut Conversation<S>,
}

#[async_trait]
impl<S: StreamConn> Driver for MigrateDriver<'_, S> {
    async fn progress(&mut self, message: String) -> Result<(), MigrateError> {
        self.conv
            .progress::<MigrateVmResponse>(message)
            .await
            .map_err(stream_failed)
    }

    async fn request_decision(&mut self) -> Result<Decision, MigrateError> {
        self.conv
            .send(&MigrateVmResponse {
                progress_message: "ready to commit".to_string(),
                request_commit: true,
                ..Default::default()
            })
            .await
            .map_err(stream_failed)?;
        let reply: MigrateVmResponseResponse =
            self.conv.recv().await.map_err(stream_failed)?;
        Ok(reply.commit.into())
    }
}

struct CopyDriver<'a, S> {
    conv: &'a mut Conversation<S>,
}

#[async_trait]
impl<S: StreamConn> Driver for CopyDriver<'_, S> {
    async fn progress(&mut self, message: String) -> Result<(), MigrateError> {
        self.conv
            .progress::<CopyVmResponse>(message)
            .await
            .map_err(stream_failed)
    }

    /// A copy leaves the source alone, so there is nothing to decide.
    async fn request_decision(&mut self) -> Result<Decision, MigrateError> {
        Ok(Decision::Commit)
    }
}

/// Addresses and blobs taken by a create or import that has not committed.
struct Provisional<'a> {
    agent: &'a Agent,
    addrs: Vec<IpAddr>,
    registered: Option<IpAddr>,
}

impl Provisional<'_> {
    async fn discard(self) {
        if let Some(addr) = self.registered {
            if let Err(e) = self.agent.registry.remove(addr) {
                warn!(self.agent.log, "could not discard VM entry";
                      "vm" => %addr, "error" => %e);
            }
            if let Err(e) = self.agent.storage.remove_all(addr).await {
                warn!(self.agent.log, "could not remove volumes";
                      "vm" => %addr, "error" => %e);
            }
        }
        for a in self.addrs {
            self.agent.pool.release(a);
        }
        self.agent.publish_host_state();
    }
}

impl Agent {
    /// Takes the primary and secondary addresses a new VM asks for, or
    /// allocates them from its subnets.
    fn place(
        &self,
        caller: &Caller,
        info: &mut VmInfo,
        provisional: &mut Provisional<'_>,
    ) -> Result<IpAddr, AgentError> {
        if let Some(user) = caller.user.as_deref() {
            let ids = std::iter::once(&info.subnet_id)
                .chain(info.secondary_subnet_ids.iter());
            for id in ids.filter(|id| !id.is_empty()) {
                let subnet = self.pool.subnet(id).ok_or_else(|| {
                    AgentError::NotFound(format!("subnet {id} not found"))
                })?;
                if !subnet.allows(user, &caller.groups) {
                    return Err(AgentError::Unauthorized(format!(
                        "{user} may not use subnet {id}"
                    )));
                }
            }
        }

        let addr = match info.address.ip_address {
            Some(ip) => {
                if self.registry.contains(ip) {
                    let e = crate::vm::RegistryError::AlreadyExists(ip);
                    return Err(e.into());
                }
                info.address = self.pool.claim(&info.address, ip)?;
                ip
            }
            None => {
                info.address = self.pool.allocate_primary(&info.subnet_id)?;
                info.address
                    .ip_address
                    .ok_or(crate::pool::PoolError::MissingIp)?
            }
        };
        provisional.addrs.push(addr);
        if info.subnet_id.is_empty() {
            if let Some(subnet) = self.pool.subnet_for(addr) {
                info.subnet_id = subnet.id;
            }
        }

        if info.secondary_addresses.is_empty() {
            let mut secondaries =
                Vec::with_capacity(info.secondary_subnet_ids.len());
            for id in info.secondary_subnet_ids.iter() {
                let a = self.pool.allocate_secondary(id, addr)?;
                provisional.addrs.extend(a.ip_address);
                secondaries.push(a);
            }
            info.secondary_addresses = secondaries;
        } else {
            for a in info.secondary_addresses.iter_mut() {
                *a = self.pool.claim(a, addr)?;
                provisional.addrs.extend(a.ip_address);
            }
        }
        Ok(addr)
    }

    /// Creates a VM from a descriptor and the payloads that follow the
    /// request on `conv`: root image, user data, then secondary volume
    /// contents if the request says they are included.
    pub async fn create_vm<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<CreateOutcome, AgentError> {
        let req: CreateVmRequest = conv.recv().await?;
        self.check_host_owner(caller)?;
        if req.image_data_size == 0 {
            return Err(AgentError::InvalidArgument(
                "no root image supplied".to_string(),
            ));
        }
        let empty = req.secondary_volumes.iter().position(|v| v.size == 0);
        if let Some(i) = empty {
            return Err(AgentError::InvalidArgument(format!(
                "secondary volume {} has no size",
                i + 1
            )));
        }

        let mut info = req.vm_info.clone();
        if info.owner_users.is_empty() {
            info.owner_users.extend(caller.user.clone());
        }
        info.created_on = Some(Utc::now());
        info.last_patch = None;
        info.volumes = std::iter::once(Volume {
            size: req.image_data_size,
            ..req.vm_info.volumes.first().cloned().unwrap_or_default()
        })
        .chain(req.secondary_volumes.iter().cloned())
        .collect();

        let mut provisional =
            Provisional { agent: self, addrs: Vec::new(), registered: None };
        let result =
            self.provision(caller, &req, info, conv, &mut provisional).await;
        let addr = match result {
            Ok(addr) => addr,
            Err(e) => {
                provisional.discard().await;
                return Err(e);
            }
        };
        self.registry.commit(addr)?;
        self.publish_host_state();
        info!(self.log, "VM created"; "vm" => %addr, "caller" => caller.name());

        if req.do_not_start {
            return Ok(CreateOutcome {
                ip_address: addr,
                dhcp_timed_out: false,
            });
        }
        // Committed VMs boot whether or not the caller is still listening.
        if let Err(e) = conv.progress::<CreateVmResponse>("starting VM").await
        {
            warn!(self.log, "could not report progress";
                  "vm" => %addr, "error" => %e);
        }
        let dhcp_timed_out =
            self.boot_vm(addr, req.dhcp_timeout_ms, false).await?;
        Ok(CreateOutcome { ip_address: addr, dhcp_timed_out })
    }

    async fn provision<S: StreamConn>(
        &self,
        caller: &Caller,
        req: &CreateVmRequest,
        mut info: VmInfo,
        conv: &mut Conversation<S>,
        provisional: &mut Provisional<'_>,
    ) -> Result<IpAddr, AgentError> {
        let addr = self.place(caller, &mut info, provisional)?;
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            if !req.skip_memory_check {
                self.check_memory(info.memory_in_mib)?;
            }
            let needed = info
                .volumes
                .iter()
                .fold(req.user_data_size, |sum, v| sum.saturating_add(v.size));
            let capacity = self.storage.capacity().await?;
            capacity.check(needed, req.minimum_free_bytes)?;
            let initial = if req.do_not_start {
                VmState::Stopped
            } else {
                VmState::Starting
            };
            self.registry.create(info.clone(), initial)?;
            provisional.registered = Some(addr);
        }
        self.publish_host_state();

        let size = req.image_data_size;
        let message = format!("receiving {size} byte image");
        conv.progress::<CreateVmResponse>(message).await?;
        self.receive_blob(conv, addr, &Blob::Volume(0), size).await?;
        if req.user_data_size > 0 {
            conv.progress::<CreateVmResponse>("receiving user data").await?;
            self.receive_blob(conv, addr, &Blob::UserData, req.user_data_size)
                .await?;
        }
        for (i, volume) in req.secondary_volumes.iter().enumerate() {
            let blob = Blob::Volume(i + 1);
            if req.secondary_volumes_data {
                let message = format!("receiving volume {}", i + 1);
                conv.progress::<CreateVmResponse>(message).await?;
                self.receive_blob(conv, addr, &blob, volume.size).await?;
            } else {
                let mut w = self.storage.create(addr, &blob).await?;
                w.shutdown().await.map_err(crate::storage::StorageError::from)?;
                self.storage.set_size(addr, &blob, volume.size).await?;
            }
        }
        Ok(addr)
    }

    /// Copies `len` payload bytes from `conv` into `blob`.
    pub(crate) async fn receive_blob<S: StreamConn>(
        &self,
        conv: &mut Conversation<S>,
        addr: IpAddr,
        blob: &Blob,
        len: u64,
    ) -> Result<(), AgentError> {
        let mut writer = self.storage.create(addr, blob).await?;
        conv.read_payload(len, &mut writer).await?;
        writer.shutdown().await.map_err(crate::storage::StorageError::from)?;
        Ok(())
    }

    pub async fn start_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &StartVmRequest,
    ) -> Result<StartVmResponse, AgentError> {
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let entry = self.registry.lookup(addr)?;
            let token = req.access_token.as_deref();
            self.check_owner_or_token(caller, &entry.info, addr, token)?;
            self.registry.apply_transition(addr, Trigger::StartRequested)?;
        }
        let dhcp_timed_out =
            self.boot_vm(addr, req.dhcp_timeout_ms, false).await?;
        Ok(StartVmResponse { dhcp_timed_out })
    }

    pub async fn stop_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &StopVmRequest,
    ) -> Result<(), AgentError> {
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let entry = self.registry.lookup(addr)?;
            let token = req.access_token.as_deref();
            self.check_owner_or_token(caller, &entry.info, addr, token)?;
            self.registry.apply_transition(addr, Trigger::StopRequested)?;
        }
        self.halt(addr).await
    }

    /// Stops the guest of a `Stopping` VM and records that it stopped.
    async fn halt(&self, addr: IpAddr) -> Result<(), AgentError> {
        match self.engine.stop(addr).await {
            // A crashed guest is already gone.
            Ok(()) | Err(EngineError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.registry.apply_transition(addr, Trigger::StopCompleted)?;
        info!(self.log, "VM stopped"; "vm" => %addr);
        Ok(())
    }

    pub async fn reboot_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &RebootVmRequest,
    ) -> Result<RebootVmResponse, AgentError> {
        let info = {
            let _locks = self.vm_locks(addr, LockMode::Shared).await?;
            let info = self.vm_in(addr, &[VmState::Running])?;
            self.check_owner(caller, &info)?;
            info
        };
        let mac = &info.address.mac_address;
        let waiter = lease_wait(req.dhcp_timeout_ms)
            .map(|wait| (self.dhcp.ack_waiter(mac), wait));
        self.engine.reboot(addr).await?;
        let dhcp_timed_out = match waiter {
            Some((waiter, wait)) => !waiter.wait(1, wait).await,
            None => false,
        };
        Ok(RebootVmResponse { dhcp_timed_out })
    }

    /// Destroys a VM. A running VM is stopped first.
    pub async fn destroy_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &DestroyVmRequest,
    ) -> Result<(), AgentError> {
        let entry = {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let entry = self.registry.lookup(addr)?;
            if entry.info.destroy_protection {
                return Err(AgentError::Unauthorized(format!(
                    "VM {addr} is destroy-protected"
                )));
            }
            self.check_token(caller, addr, req.access_token.as_deref())?;
            let trigger = if entry.state() == VmState::Running {
                Trigger::StopRequested
            } else {
                Trigger::DestroyRequested
            };
            self.registry.apply_transition(addr, trigger)?;
            entry
        };
        if entry.state() == VmState::Running {
            self.halt(addr).await?;
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            self.registry.apply_transition(addr, Trigger::DestroyRequested)?;
        }
        self.engine.release(addr).await;
        self.discard_vm_resources(&entry.info).await;
        self.registry.apply_transition(addr, Trigger::DestroyCompleted)?;
        info!(self.log, "VM destroyed";
              "vm" => %addr, "caller" => caller.name());
        Ok(())
    }

    /// Adopts local files as the volumes of a new, stopped VM. The VM stays
    /// uncommitted until [`Agent::commit_imported_vm`].
    pub async fn import_local_vm(
        &self,
        caller: &Caller,
        req: &ImportLocalVmRequest,
    ) -> Result<IpAddr, AgentError> {
        self.check_host_owner(caller)?;
        if req.vm_info.address.ip_address.is_none() {
            return Err(AgentError::InvalidArgument(
                "an imported VM must carry its address".to_string(),
            ));
        }
        if req.volume_filenames.is_empty() {
            return Err(AgentError::InvalidArgument(
                "no volumes to import".to_string(),
            ));
        }
        if !req.vm_info.volumes.is_empty()
            && req.vm_info.volumes.len() != req.volume_filenames.len()
        {
            return Err(AgentError::InvalidArgument(format!(
                "{} volumes described but {} files given",
                req.vm_info.volumes.len(),
                req.volume_filenames.len()
            )));
        }
        if !req.skip_memory_check {
            self.check_memory(req.vm_info.memory_in_mib)?;
        }

        let mut info = req.vm_info.clone();
        let mut provisional =
            Provisional { agent: self, addrs: Vec::new(), registered: None };
        let imported = async {
            let addr = self.place(caller, &mut info, &mut provisional)?;
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            info.volumes.resize(req.volume_filenames.len(), Volume::default());
            self.registry.create(info.clone(), VmState::Stopped)?;
            provisional.registered = Some(addr);
            for (i, file) in req.volume_filenames.iter().enumerate() {
                info.volumes[i].size = self
                    .storage
                    .adopt(addr, &Blob::Volume(i), Path::new(file))
                    .await?;
            }
            let volumes = info.volumes.clone();
            self.registry.update(addr, |vm| {
                vm.volumes = volumes;
                Ok::<_, AgentError>(())
            })?;
            Ok::<_, AgentError>(addr)
        }
        .await;
        match imported {
            Ok(addr) => {
                info!(self.log, "VM imported"; "vm" => %addr);
                Ok(addr)
            }
            Err(e) => {
                provisional.discard().await;
                Err(e)
            }
        }
    }

    pub async fn commit_imported_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        if !entry.info.uncommitted {
            return Err(AgentError::InvalidState(format!(
                "VM {addr} is already committed"
            )));
        }
        if entry.state() != VmState::Stopped {
            return Err(AgentError::InvalidState(format!(
                "VM {addr} is {} and was not imported",
                entry.state()
            )));
        }
        self.registry.commit(addr)?;
        Ok(())
    }

    /// Hands the locations of a running VM's volumes to a local consumer.
    /// The VM passes through `Exporting` while they are collected.
    pub async fn export_local_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<ExportLocalVmInfo, AgentError> {
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let entry = self.registry.lookup(addr)?;
            self.check_owner(caller, &entry.info)?;
            self.registry.apply_transition(addr, Trigger::ExportRequested)?;
        }
        let entry = self.registry.lookup(addr)?;
        let directory = self.storage.directory(addr).display().to_string();
        let volume_locations = (0..entry.info.volumes.len())
            .map(|i| LocalVolume {
                directory_to_cleanup: directory.clone(),
                filename: self
                    .storage
                    .location(addr, &Blob::Volume(i))
                    .display()
                    .to_string(),
            })
            .collect();
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        self.registry.apply_transition(addr, Trigger::ExportFinished)?;
        let vm_info = self.registry.lookup(addr)?.info;
        Ok(ExportLocalVmInfo { vm_info, volume_locations })
    }

    /// Receives a VM from another agent. The caller is sent progress, then a
    /// commit request, and must reply with its decision.
    pub async fn migrate_vm<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<MigrateVmResponse, AgentError> {
        let req: MigrateVmRequest = conv.recv().await?;
        self.check_host_owner(caller)?;
        let mut driver = MigrateDriver { conv };
        let outcome = destination::migrate_in(self, &req, &mut driver).await?;
        let message = match outcome {
            Outcome::Committed { dhcp_timed_out: false } => {
                "migration committed"
            }
            Outcome::Committed { dhcp_timed_out: true } => {
                "migration committed; timed out waiting for DHCP lease"
            }
            Outcome::Aborted => "migration aborted",
        };
        Ok(MigrateVmResponse {
            progress_message: message.to_string(),
            ..Default::default()
        })
    }

    /// Duplicates a VM from another agent under a new address.
    pub async fn copy_vm<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<CopyVmResponse, AgentError> {
        let mut req: CopyVmRequest = conv.recv().await?;
        self.check_host_owner(caller)?;
        if req.vm_info.owner_users.is_empty() {
            req.vm_info.owner_users.extend(caller.user.clone());
        }
        let mut driver = CopyDriver { conv };
        let addr = destination::copy_in(self, &req, &mut driver).await?;
        if !req.vm_info.owner_users.is_empty() {
            let owners = req.vm_info.owner_users.clone();
            self.registry.update(addr, |vm| {
                vm.owner_users = owners;
                Ok::<_, AgentError>(())
            })?;
        }
        Ok(CopyVmResponse {
            ip_address: Some(addr),
            progress_message: "copied".to_string(),
            ..Default::default()
        })
    }

    /// Gives a migration source VM back after its migration was abandoned.
    /// With `restart` the guest, stopped for the transfer, boots again; a
    /// guest that will not boot leaves the VM crashed.
    pub(crate) async fn resume_after_migration(
        &self,
        addr: IpAddr,
        restart: bool,
    ) -> Result<(), AgentError> {
        let booted = if restart {
            let entry = self.registry.lookup(addr)?;
            let spec = self.boot_spec(&entry.info, false).await;
            self.engine.boot(spec).await
        } else {
            Ok(())
        };
        self.registry.apply_transition(addr, Trigger::PeerAborted)?;
        if let Err(e) = booted {
            error!(self.log, "guest did not come back after migration";
                   "vm" => %addr, "error" => %e);
            self.registry.apply_transition(addr, Trigger::HealthCheckFailed)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Settles an outgoing migration whose outcome this host never learned.
    /// The administrator has checked the destination: `commit` means the VM
    /// lives there now, so the local copy is destroyed; otherwise the VM
    /// runs here again.
    pub async fn resolve_vm_migration(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ResolveVmMigrationRequest,
    ) -> Result<(), AgentError> {
        if !caller.is_admin() {
            return Err(AgentError::Unauthorized(format!(
                "{} may not resolve migrations",
                caller.name()
            )));
        }
        let entry = {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let entry = self.registry.lookup(addr)?;
            let in_doubt = entry.migration.as_ref().is_some_and(|m| {
                m.role == MigrateRole::Source && m.phase == Phase::InDoubt
            });
            if !in_doubt {
                return Err(AgentError::InvalidState(format!(
                    "VM {addr} has no migration awaiting resolution"
                )));
            }
            if !req.commit {
                self.resume_after_migration(addr, true).await?;
                info!(self.log, "in-doubt migration resolved; VM kept";
                      "vm" => %addr);
                return Ok(());
            }
            self.registry.apply_transition(addr, Trigger::PeerCommitted)?;
            entry
        };
        self.engine.release(addr).await;
        self.discard_vm_resources(&entry.info).await;
        self.registry.apply_transition(addr, Trigger::DestroyCompleted)?;
        info!(self.log, "in-doubt migration resolved; VM given up";
              "vm" => %addr);
        Ok(())
    }

    /// Enables or disables a VM as a migration source.
    pub async fn prepare_vm_for_migration(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &PrepareVmForMigrationRequest,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let entry = self.registry.lookup(addr)?;
        let token = req.access_token.as_deref();
        self.check_owner_or_token(caller, &entry.info, addr, token)?;
        self.registry.set_migration_source_enabled(addr, req.enable)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::test::{harness, resident_vm, Harness};
    use crate::error::ErrorKind;
    use crate::stream::test::pair;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    fn state(h: &Harness, ip: IpAddr) -> VmState {
        h.agent.registry.lookup(ip).unwrap().state()
    }

    #[tokio::test]
    async fn create_allocates_and_boots() {
        let h = harness();
        let before = h.agent.pool.free_counts()["s0"];
        let (mut conv, mut client) = pair().await;
        let req = CreateVmRequest {
            image_data_size: 8,
            user_data_size: 3,
            vm_info: VmInfo {
                subnet_id: "s0".to_string(),
                memory_in_mib: 256,
                ..Default::default()
            },
            ..Default::default()
        };
        let client_task = tokio::spawn(async move {
            let text = serde_json::to_string(&req).unwrap();
            client.send(Message::Text(text)).await.unwrap();
            client.send(Message::Binary(b"rootroot".to_vec())).await.unwrap();
            client.send(Message::Binary(b"ud!".to_vec())).await.unwrap();
            let mut frames = Vec::new();
            while let Some(Ok(Message::Text(t))) = client.next().await {
                let frame: CreateVmResponse = serde_json::from_str(&t).unwrap();
                frames.push(frame);
            }
            frames
        });

        let caller = Caller::user("alice", &[]);
        let outcome = h.agent.create_vm(&caller, &mut conv).await.unwrap();
        conv.close().await;
        let frames = client_task.await.unwrap();
        assert!(frames.iter().all(|f| !f.is_final && f.error.is_none()));

        let entry = h.agent.registry.lookup(outcome.ip_address).unwrap();
        assert_eq!(entry.state(), VmState::Running);
        assert!(!entry.info.uncommitted);
        assert_eq!(entry.info.owner_users, ["alice"]);
        assert_eq!(entry.info.volumes[0].size, 8);
        assert_eq!(h.agent.pool.free_counts()["s0"], before - 1);
        assert!(h.engine.is_running(outcome.ip_address));
    }

    /// Fails any write carrying `marker`, the way a socket to a caller that
    /// has hung up does.
    struct HangUpOn {
        inner: tokio::io::DuplexStream,
        marker: &'static [u8],
    }

    impl tokio::io::AsyncRead for HangUpOn {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for HangUpOn {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            if buf.windows(this.marker.len()).any(|w| w == this.marker) {
                let err = std::io::ErrorKind::BrokenPipe.into();
                return std::task::Poll::Ready(Err(err));
            }
            std::pin::Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn created_vm_boots_after_caller_hangs_up() {
        use tokio_tungstenite::tungstenite::protocol::Role;
        use tokio_tungstenite::WebSocketStream;

        let h = harness();
        let (a, b) = tokio::io::duplex(1 << 16);
        let server = HangUpOn { inner: a, marker: b"starting VM" };
        let mut conv = Conversation::new(
            WebSocketStream::from_raw_socket(server, Role::Server, None).await,
        );
        let mut client =
            WebSocketStream::from_raw_socket(b, Role::Client, None).await;

        let req = CreateVmRequest {
            image_data_size: 4,
            vm_info: VmInfo {
                subnet_id: "s0".to_string(),
                memory_in_mib: 256,
                ..Default::default()
            },
            ..Default::default()
        };
        let client_task = tokio::spawn(async move {
            let text = serde_json::to_string(&req).unwrap();
            client.send(Message::Text(text)).await.unwrap();
            client.send(Message::Binary(b"root".to_vec())).await.unwrap();
            while let Some(Ok(_)) = client.next().await {}
        });

        let outcome = h
            .agent
            .create_vm(&Caller::user("alice", &[]), &mut conv)
            .await
            .unwrap();
        drop(conv);
        client_task.await.unwrap();

        let ip = outcome.ip_address;
        assert_eq!(state(&h, ip), VmState::Running);
        assert!(h.engine.is_running(ip));
        h.agent
            .stop_vm(&Caller::admin(), ip, &StopVmRequest::default())
            .await
            .unwrap();
        assert_eq!(state(&h, ip), VmState::Stopped);
    }

    #[tokio::test]
    async fn failed_create_gives_everything_back() {
        let h = harness();
        let (mut conv, mut client) = pair().await;
        let req = CreateVmRequest {
            image_data_size: 8,
            vm_info: VmInfo {
                subnet_id: "s0".to_string(),
                memory_in_mib: 1 << 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let text = serde_json::to_string(&req).unwrap();
        client.send(Message::Text(text)).await.unwrap();
        let err =
            h.agent.create_vm(&Caller::admin(), &mut conv).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(h.agent.pool.free_counts()["s0"], 2);
        assert!(h.agent.registry.list(&Default::default()).is_empty());
    }

    #[tokio::test]
    async fn stop_start_and_destroy() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let alice = Caller::user("alice", &[]);
        let bob = Caller::user("bob", &[]);

        let stop = StopVmRequest::default();
        let err = h.agent.stop_vm(&bob, ip, &stop).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        h.agent.stop_vm(&alice, ip, &stop).await.unwrap();
        assert_eq!(state(&h, ip), VmState::Stopped);
        assert!(!h.engine.is_running(ip));

        let token =
            h.agent.tokens.issue(ip, Duration::from_secs(60)).unwrap().token;
        let start = StartVmRequest {
            access_token: Some(token.clone()),
            dhcp_timeout_ms: 0,
        };
        h.agent.start_vm(&bob, ip, &start).await.unwrap();
        assert_eq!(state(&h, ip), VmState::Running);

        // Destroy needs a token even from the owner.
        let err = h
            .agent
            .destroy_vm(&alice, ip, &DestroyVmRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(state(&h, ip), VmState::Running);

        let destroy = DestroyVmRequest { access_token: Some(token.clone()) };
        h.agent.destroy_vm(&alice, ip, &destroy).await.unwrap();
        assert!(!h.agent.registry.contains(ip));
        assert!(h.agent.tokens.authorize(Some(&token), ip).is_err());
        assert_eq!(h.agent.pool.slot(ip), Some(crate::pool::Slot::Free));
    }

    #[tokio::test]
    async fn destroy_protection_is_unauthorized() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        h.agent
            .registry
            .update(ip, |vm| {
                vm.destroy_protection = true;
                Ok::<_, AgentError>(())
            })
            .unwrap();
        let err = h
            .agent
            .destroy_vm(&Caller::admin(), ip, &DestroyVmRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(state(&h, ip), VmState::Stopped);
    }

    #[tokio::test]
    async fn boot_failure_leaves_failed_to_start() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        h.engine.fail_boots_for(ip, true);
        let admin = Caller::admin();
        let err = h
            .agent
            .start_vm(&admin, ip, &StartVmRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(state(&h, ip), VmState::FailedToStart);
        let destroy = DestroyVmRequest::default();
        h.agent.destroy_vm(&admin, ip, &destroy).await.unwrap();
        assert!(!h.agent.registry.contains(ip));
    }

    #[tokio::test]
    async fn import_then_commit() {
        let h = harness();
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("disk.img");
        std::fs::write(&file, b"0123456789").unwrap();
        let ip: IpAddr = "10.0.0.6".parse().unwrap();
        let req = ImportLocalVmRequest {
            skip_memory_check: false,
            vm_info: VmInfo {
                address: vmhost_api_types::Address {
                    ip_address: Some(ip),
                    mac_address: String::new(),
                },
                memory_in_mib: 128,
                ..Default::default()
            },
            volume_filenames: vec![file.display().to_string()],
        };
        let admin = Caller::admin();
        h.agent.import_local_vm(&admin, &req).await.unwrap();
        assert!(h.agent.registry.list(&Default::default()).is_empty());
        let vm = h.agent.registry.lookup(ip).unwrap().info;
        assert_eq!(vm.volumes[0].size, 10);

        h.agent.commit_imported_vm(&admin, ip).await.unwrap();
        let listed = h.agent.registry.list(&Default::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, VmState::Stopped);
        assert!(h.agent.commit_imported_vm(&admin, ip).await.is_err());
    }

    #[tokio::test]
    async fn export_is_transient() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let admin = Caller::admin();
        let export = h.agent.export_local_vm(&admin, ip).await.unwrap();
        assert_eq!(export.volume_locations.len(), 1);
        assert!(export.volume_locations[0].filename.ends_with("volume-0"));
        assert_eq!(export.vm_info.state, VmState::Running);

        h.agent.stop_vm(&admin, ip, &StopVmRequest::default()).await.unwrap();
        let err = h.agent.export_local_vm(&admin, ip).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn prepare_for_migration_toggles_flag() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let req =
            PrepareVmForMigrationRequest { access_token: None, enable: false };
        h.agent
            .prepare_vm_for_migration(&Caller::admin(), ip, &req)
            .await
            .unwrap();
        assert!(h.agent.registry.lookup(ip).unwrap().migration_source_disabled);
    }
}
