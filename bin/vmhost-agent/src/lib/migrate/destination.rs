// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The destination half of a migration or copy.

use std::net::IpAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{error, info, warn, Logger};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{tungstenite, MaybeTlsStream};
use vmhost_api_types::{
    Address, CopyVmRequest, MigrateVmRequest, VmInfo, VmState,
};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::storage::Blob;
use crate::vm::transition::Trigger;

use super::handshake::{Decision, Handshake, Phase};
use super::protocol;
use super::{
    codec, Link, MigrateError, MigrateRole, Preamble, SourceRequest,
    TransferMode,
};

type SourceLink = Link<MaybeTlsStream<TcpStream>>;

/// The caller driving an incoming transfer.
#[async_trait::async_trait]
pub trait Driver: Send {
    async fn progress(&mut self, message: String) -> Result<(), MigrateError>;

    /// Signals that a complete copy is held and waits for the caller's
    /// decision.
    async fn request_decision(&mut self) -> Result<Decision, MigrateError>;
}

/// How an incoming migration ended, when it ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed { dhcp_timed_out: bool },
    Aborted,
}

/// Connects to the source agent's migration channel for `addr` and
/// negotiates a protocol.
pub(crate) async fn initiate(
    log: &Logger,
    source: &str,
    addr: IpAddr,
    timeout: Duration,
) -> Result<SourceLink, MigrateError> {
    info!(log, "negotiating migration as destination");

    // Built by hand: the source channel is not part of the OpenAPI document.
    let src_migrate_url = format!("ws://{source}/migrate/{addr}/source");
    info!(log, "connecting to {}", src_migrate_url);
    let (mut conn, _) = match tokio::time::timeout(
        timeout,
        tokio_tungstenite::connect_async(src_migrate_url.as_str()),
    )
    .await
    {
        Ok(connected) => connected?,
        Err(_) => {
            error!(log, "timed out connecting to source");
            return Err(MigrateError::Initiate);
        }
    };

    let dst_protocols = protocol::make_protocol_offer();
    conn.send(tungstenite::Message::Text(dst_protocols.clone())).await?;
    let selected = match conn.next().await {
        Some(Ok(tungstenite::Message::Text(selected))) => {
            match protocol::select_protocol_from_offer(&selected) {
                Ok(Some(selected)) => selected,
                Ok(None) => {
                    return Err(MigrateError::NoMatchingProtocol(
                        selected,
                        dst_protocols,
                    ))
                }
                Err(e) => {
                    return Err(MigrateError::ProtocolParse(
                        selected,
                        e.to_string(),
                    ))
                }
            }
        }
        x => {
            conn.send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Protocol,
                reason: "did not respond to protocol offer".into(),
            })))
            .await?;
            error!(
                log,
                "source instance failed to negotiate protocol version: {:?}", x
            );
            return Err(MigrateError::Initiate);
        }
    };
    info!(log, "selected protocol {:?}", selected);
    Ok(Link::new(conn, MigrateRole::Source, log.clone()))
}

fn describe(blob: &Blob) -> String {
    match blob {
        Blob::Volume(0) => "root image".to_string(),
        Blob::Volume(i) => format!("volume {i}"),
        Blob::UserData => "user data".to_string(),
        other => format!("{other:?}"),
    }
}

/// What an incoming VM has reserved locally so far.
struct Inbound<'a> {
    agent: &'a Agent,
    mode: TransferMode,
    addr: Option<IpAddr>,
    claimed: Vec<IpAddr>,
    registered: bool,
}

impl<'a> Inbound<'a> {
    fn new(agent: &'a Agent, mode: TransferMode) -> Self {
        Self { agent, mode, addr: None, claimed: Vec::new(), registered: false }
    }

    fn pool_error(e: impl std::fmt::Display) -> MigrateError {
        MigrateError::Resources(e.to_string())
    }

    /// Checks capacity, takes addresses and creates the uncommitted entry.
    /// Returns the local address of the VM.
    async fn reserve(
        &mut self,
        mut info: VmInfo,
        preamble: &Preamble,
        source: &str,
        skip_memory_check: bool,
        overrides: Option<&VmInfo>,
    ) -> Result<IpAddr, MigrateError> {
        let agent = self.agent;
        if !skip_memory_check {
            agent
                .check_memory(info.memory_in_mib)
                .map_err(|e| MigrateError::Resources(e.to_string()))?;
        }
        agent.storage.capacity().await?.check(preamble.total_bytes(), 0)?;

        let addr = match overrides {
            None => {
                let addr = info.address.ip_address.ok_or_else(|| {
                    MigrateError::Parse(
                        "preamble".into(),
                        "VM has no address".into(),
                    )
                })?;
                info.address = agent
                    .pool
                    .claim(&info.address, addr)
                    .map_err(Self::pool_error)?;
                self.claimed.push(addr);
                for secondary in info.secondary_addresses.iter_mut() {
                    *secondary = agent
                        .pool
                        .claim(secondary, addr)
                        .map_err(Self::pool_error)?;
                    if let Some(ip) = secondary.ip_address {
                        self.claimed.push(ip);
                    }
                }
                addr
            }
            Some(overrides) => {
                if !overrides.subnet_id.is_empty() {
                    info.subnet_id = overrides.subnet_id.clone();
                }
                if !overrides.hostname.is_empty() {
                    info.hostname = overrides.hostname.clone();
                }
                info.address = agent
                    .pool
                    .allocate_primary(&info.subnet_id)
                    .map_err(Self::pool_error)?;
                let addr = info.address.ip_address.ok_or_else(|| {
                    MigrateError::Resources(
                        "allocated address has no IP".into(),
                    )
                })?;
                self.claimed.push(addr);
                let mut secondaries =
                    Vec::with_capacity(info.secondary_subnet_ids.len());
                for subnet_id in info.secondary_subnet_ids.iter() {
                    let a = agent
                        .pool
                        .allocate_secondary(subnet_id, addr)
                        .map_err(Self::pool_error)?;
                    if let Some(ip) = a.ip_address {
                        self.claimed.push(ip);
                    }
                    secondaries.push(a);
                }
                info.secondary_addresses = secondaries;
                info.identity_name = String::new();
                info.identity_expires = None;
                info.created_on = Some(chrono::Utc::now());
                addr
            }
        };
        self.addr = Some(addr);

        match self.mode {
            TransferMode::Migrate => {
                agent.registry.create_incoming(info, source.to_string())
            }
            TransferMode::Copy => {
                agent.registry.create(info, VmState::Starting)
            }
        }
        .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
        self.registered = true;
        agent.publish_host_state();
        Ok(addr)
    }

    /// Gives back everything reserved for a VM that is not staying.
    async fn discard(self, log: &Logger) {
        let agent = self.agent;
        if let Some(addr) = self.addr {
            if self.registered {
                let removed = match self.mode {
                    TransferMode::Migrate => agent
                        .registry
                        .apply_transition(addr, Trigger::PeerAborted)
                        .map(|_| ()),
                    TransferMode::Copy => {
                        agent.registry.remove(addr).map(|_| ())
                    }
                };
                if let Err(e) = removed {
                    error!(log, "could not discard incoming VM"; "error" => %e);
                }
            }
            if let Err(e) = agent.storage.remove_all(addr).await {
                warn!(log, "could not remove incoming volumes"; "error" => %e);
            }
        }
        for ip in self.claimed {
            agent.pool.release(ip);
        }
        agent.publish_host_state();
    }
}

fn set_phase(agent: &Agent, addr: IpAddr, phase: Phase, log: &Logger) {
    if let Err(e) = agent.registry.set_migration_phase(addr, phase) {
        warn!(log, "could not record migration phase";
              "phase" => %phase, "error" => %e);
    }
}

/// Pulls every blob announced by `preamble` into local storage.
async fn receive(
    agent: &Agent,
    link: &mut SourceLink,
    addr: IpAddr,
    preamble: &Preamble,
    driver: &mut dyn Driver,
) -> Result<(), MigrateError> {
    link.send_msg(codec::Message::Okay).await?;
    for (blob, size) in preamble.transfer_order() {
        driver
            .progress(format!("receiving {} ({size} bytes)", describe(&blob)))
            .await?;
        let mut writer = agent.storage.create(addr, &blob).await?;
        link.recv_blob(&mut writer, size).await?;
    }
    link.send_msg(codec::Message::Okay).await
}

/// Runs an incoming migration requested by a caller of this agent.
pub async fn migrate_in(
    agent: &Agent,
    req: &MigrateVmRequest,
    driver: &mut dyn Driver,
) -> Result<Outcome, AgentError> {
    let addr = req.ip_address;
    let log = agent.log.new(slog::o!(
        "migrate_role" => "destination",
        "peer" => req.source_hypervisor.clone(),
        "vm" => addr.to_string(),
    ));
    if agent.registry.contains(addr) {
        return Err(AgentError::InvalidState(format!(
            "VM {addr} already exists on this host"
        )));
    }

    driver.progress(format!("connecting to {}", req.source_hypervisor)).await?;
    let mut link = initiate(
        &log,
        &req.source_hypervisor,
        addr,
        agent.config.migration.connect_timeout(),
    )
    .await?;
    link.send_serialized(&SourceRequest {
        access_token: req.access_token.clone(),
        mode: TransferMode::Migrate,
        destination: agent.advertised_name(),
    })
    .await?;
    let preamble: Preamble = link.read_serialized("preamble").await?;

    let mut inbound = Inbound::new(agent, TransferMode::Migrate);
    let transferred = async {
        if preamble.vm_info.address.ip_address != Some(addr) {
            return Err(MigrateError::Parse(
                "preamble".to_string(),
                format!(
                    "source sent VM {:?}",
                    preamble.vm_info.address.ip_address
                ),
            ));
        }
        inbound
            .reserve(
                preamble.vm_info.clone(),
                &preamble,
                &req.source_hypervisor,
                req.skip_memory_check,
                None,
            )
            .await?;
        receive(agent, &mut link, addr, &preamble, &mut *driver).await
    }
    .await;
    if let Err(e) = transferred {
        error!(log, "incoming migration failed"; "error" => %e);
        if !matches!(e, MigrateError::RemoteError(..)) {
            link.fail(&e).await;
        }
        link.close().await;
        inbound.discard(&log).await;
        return Err(e.into());
    }

    let mut handshake = Handshake::new();
    handshake.ready()?;
    set_phase(agent, addr, Phase::AwaitDecision, &log);
    let decision = tokio::time::timeout(
        agent.config.migration.decision_timeout(),
        driver.request_decision(),
    )
    .await;
    let (decision, failure) = match decision {
        Ok(Ok(d)) => (d, None),
        Ok(Err(e)) => (Decision::Abort, Some(e)),
        Err(_) => {
            handshake.expire();
            (Decision::Abort, Some(MigrateError::DecisionTimeout))
        }
    };
    // An expired handshake has already settled on abort.
    let phase = if handshake.phase().is_terminal() {
        handshake.phase()
    } else {
        handshake.decide(decision)?
    };

    if phase != Phase::Committed {
        info!(log, "incoming migration aborted"; "reason" => ?failure);
        if let Err(e) = link.send_msg(codec::Message::Abort).await {
            warn!(log, "could not tell source about abort"; "error" => %e);
        }
        link.close().await;
        inbound.discard(&log).await;
        return match failure {
            Some(e) => Err(e.into()),
            None => Ok(Outcome::Aborted),
        };
    }

    // The destination commits first. From here on the VM lives here.
    set_phase(agent, addr, Phase::Committed, &log);
    agent.registry.commit(addr)?;
    agent.registry.apply_transition(addr, Trigger::PeerCommitted)?;
    let confirmed = async {
        link.send_msg(codec::Message::Commit).await?;
        link.read_ok().await
    }
    .await;
    if let Err(e) = confirmed {
        warn!(log, "source did not confirm commit"; "error" => %e);
    }
    link.close().await;
    info!(log, "incoming migration committed");

    // The VM is ours now and must boot whether or not the caller is still
    // listening.
    if let Err(e) = driver.progress("starting VM".to_string()).await {
        warn!(log, "could not report progress"; "error" => %e);
    }
    let dhcp_timed_out = agent.boot_vm(addr, req.dhcp_timeout_ms, false).await?;
    Ok(Outcome::Committed { dhcp_timed_out })
}

/// Runs an incoming copy, returning the address of the new VM.
pub async fn copy_in(
    agent: &Agent,
    req: &CopyVmRequest,
    driver: &mut dyn Driver,
) -> Result<IpAddr, AgentError> {
    let log = agent.log.new(slog::o!(
        "migrate_role" => "destination",
        "peer" => req.source_hypervisor.clone(),
        "vm" => req.ip_address.to_string(),
        "mode" => "copy",
    ));
    driver.progress(format!("connecting to {}", req.source_hypervisor)).await?;
    let mut link = initiate(
        &log,
        &req.source_hypervisor,
        req.ip_address,
        agent.config.migration.connect_timeout(),
    )
    .await?;
    link.send_serialized(&SourceRequest {
        access_token: req.access_token.clone(),
        mode: TransferMode::Copy,
        destination: agent.advertised_name(),
    })
    .await?;
    let preamble: Preamble = link.read_serialized("preamble").await?;

    let mut inbound = Inbound::new(agent, TransferMode::Copy);
    let transferred = async {
        let mut info = preamble.vm_info.clone();
        info.address = Address::default();
        let addr = inbound
            .reserve(
                info,
                &preamble,
                &req.source_hypervisor,
                req.skip_memory_check,
                Some(&req.vm_info),
            )
            .await?;
        receive(agent, &mut link, addr, &preamble, &mut *driver).await?;
        Ok(addr)
    }
    .await;
    let addr = match transferred {
        Ok(addr) => addr,
        Err(e) => {
            error!(log, "incoming copy failed"; "error" => %e);
            if !matches!(e, MigrateError::RemoteError(..)) {
                link.fail(&e).await;
            }
            link.close().await;
            inbound.discard(&log).await;
            return Err(e.into());
        }
    };
    link.close().await;

    agent.registry.commit(addr)?;
    info!(log, "VM copied"; "new_address" => %addr);
    if let Err(e) = driver.progress(format!("starting copy at {addr}")).await {
        warn!(log, "could not report progress"; "error" => %e);
    }
    agent.boot_vm(addr, 0, false).await?;
    Ok(addr)
}
