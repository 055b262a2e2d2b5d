// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The source half of a migration or copy.

use std::net::IpAddr;

use futures::{SinkExt, StreamExt};
use slog::{error, info, warn, Logger};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use vmhost_api_types::VmState;

use crate::agent::Agent;
use crate::engine::EngineError;
use crate::lock::LockMode;
use crate::storage::Blob;
use crate::vm::transition::Trigger;

use super::handshake::Phase;
use super::protocol::{self, Protocol};
use super::{
    codec, Link, MigrateConn, MigrateError, MigrateRole, Preamble,
    SourceRequest, TransferMode,
};

/// Answers the destination's protocol offer. The destination speaks first.
async fn negotiate<T: MigrateConn>(
    log: &Logger,
    conn: &mut WebSocketStream<T>,
) -> Result<Protocol, MigrateError> {
    let offer = match conn.next().await {
        Some(Ok(tungstenite::Message::Text(offer))) => offer,
        x => {
            error!(log, "destination did not offer protocols: {:?}", x);
            return Err(MigrateError::Initiate);
        }
    };
    let refusal = match protocol::select_protocol_from_offer(&offer) {
        Ok(Some(selected)) => {
            info!(log, "negotiated protocol {}", selected.offer_string());
            conn.send(tungstenite::Message::Text(selected.offer_string()))
                .await?;
            return Ok(selected);
        }
        Ok(None) => MigrateError::NoMatchingProtocol(
            protocol::make_protocol_offer(),
            offer,
        ),
        Err(e) => MigrateError::ProtocolParse(offer, e.to_string()),
    };
    error!(log, "protocol negotiation failed"; "error" => %refusal);
    conn.send(tungstenite::Message::Close(Some(CloseFrame {
        code: CloseCode::Protocol,
        reason: "no acceptable protocol offered".into(),
    })))
    .await?;
    Err(refusal)
}

/// Serves one destination connected to `/migrate/{addr}/source`.
pub(crate) async fn serve<T: MigrateConn>(
    agent: &Agent,
    addr: IpAddr,
    mut conn: WebSocketStream<T>,
) -> Result<(), MigrateError> {
    let log = agent.log.new(slog::o!(
        "migrate_role" => "source",
        "vm" => addr.to_string(),
    ));
    match negotiate(&log, &mut conn).await? {
        Protocol::RonV0 => {}
    }
    let mut link = Link::new(conn, MigrateRole::Destination, log.clone());

    let request: SourceRequest = link.read_serialized("source request").await?;
    let log = log.new(slog::o!("peer" => request.destination.clone()));
    info!(log, "destination connected"; "mode" => ?request.mode);

    let result = match request.mode {
        TransferMode::Migrate => {
            migrate_out(agent, addr, &request, &mut link, &log).await
        }
        TransferMode::Copy => {
            copy_out(agent, addr, &request, &mut link, &log).await
        }
    };
    if let Err(e) = &result {
        error!(log, "transfer failed"; "error" => %e);
        // A failure reported by the destination needs no echo.
        if !matches!(e, MigrateError::RemoteError(..)) {
            link.fail(e).await;
        }
    }
    link.close().await;
    result
}

fn authorize(
    agent: &Agent,
    addr: IpAddr,
    request: &SourceRequest,
) -> Result<(), MigrateError> {
    agent
        .tokens
        .authorize(Some(&request.access_token), addr)
        .map_err(|e| MigrateError::Unauthorized(e.to_string()))
}

async fn preamble(
    agent: &Agent,
    addr: IpAddr,
) -> Result<Preamble, MigrateError> {
    let entry = agent
        .registry
        .lookup(addr)
        .map_err(|_| MigrateError::VmNotFound(addr))?;
    let mut volume_sizes = Vec::with_capacity(entry.info.volumes.len());
    for i in 0..entry.info.volumes.len() {
        volume_sizes.push(agent.storage.size(addr, &Blob::Volume(i)).await?);
    }
    let user_data_size = if agent.storage.exists(addr, &Blob::UserData).await
    {
        agent.storage.size(addr, &Blob::UserData).await?
    } else {
        0
    };
    Ok(Preamble { vm_info: entry.info, volume_sizes, user_data_size })
}

/// Sends the preamble and every blob it announces. The destination's
/// acknowledgement of the data is left for the caller to read.
async fn send_contents<T: MigrateConn>(
    agent: &Agent,
    addr: IpAddr,
    link: &mut Link<T>,
    preamble: &Preamble,
) -> Result<(), MigrateError> {
    link.send_serialized(preamble).await?;
    link.read_ok().await?;
    for (blob, size) in preamble.transfer_order() {
        let mut reader = agent.storage.open(addr, &blob).await?;
        link.send_blob(&mut reader, size).await?;
    }
    Ok(())
}

fn set_phase(agent: &Agent, addr: IpAddr, phase: Phase, log: &Logger) {
    if let Err(e) = agent.registry.set_migration_phase(addr, phase) {
        warn!(log, "could not record migration phase";
              "phase" => %phase, "error" => %e);
    }
}

/// How the destination answered once it held every byte.
enum Verdict {
    Commit,
    Abort,
    /// Nothing usable arrived; the destination may have committed.
    Unknown(MigrateError),
}

async fn await_verdict<T: MigrateConn>(link: &mut Link<T>) -> Verdict {
    match link.read_ok().await {
        Ok(()) => {}
        Err(MigrateError::Aborted | MigrateError::RemoteError(..)) => {
            return Verdict::Abort
        }
        Err(e) => return Verdict::Unknown(e),
    }
    match link.read_msg().await {
        Ok(codec::Message::Commit) => Verdict::Commit,
        Ok(codec::Message::Abort) | Err(MigrateError::RemoteError(..)) => {
            Verdict::Abort
        }
        Ok(_) => Verdict::Unknown(MigrateError::UnexpectedMessage),
        Err(e) => Verdict::Unknown(e),
    }
}

async fn migrate_out<T: MigrateConn>(
    agent: &Agent,
    addr: IpAddr,
    request: &SourceRequest,
    link: &mut Link<T>,
    log: &Logger,
) -> Result<(), MigrateError> {
    authorize(agent, addr, request)?;
    {
        let _locks = agent
            .vm_locks(addr, LockMode::Exclusive)
            .await
            .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
        let entry = agent
            .registry
            .lookup(addr)
            .map_err(|_| MigrateError::VmNotFound(addr))?;
        if entry.info.destroy_protection {
            return Err(MigrateError::DestroyProtected);
        }
        if entry.migration_source_disabled {
            return Err(MigrateError::SourceDisabled);
        }
        agent
            .registry
            .begin_migration(addr, request.destination.clone())
            .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
    }

    // The guest stays down while its volumes are read.
    match agent.engine.stop(addr).await {
        Ok(()) | Err(EngineError::NotRunning(_)) => {}
        Err(e) => {
            error!(log, "could not stop guest for migration"; "error" => %e);
            resume(agent, addr, false, log).await;
            return Err(MigrateError::InvalidState(e.to_string()));
        }
    }

    let sent = async {
        let preamble = preamble(agent, addr).await?;
        send_contents(agent, addr, link, &preamble).await
    }
    .await;
    if let Err(e) = sent {
        resume(agent, addr, true, log).await;
        return Err(e);
    }

    // Every byte has left, so the destination may commit from here on.
    // Only an explicit abort gives the VM back. Bound the wait so a vanished
    // destination cannot hold this task forever.
    set_phase(agent, addr, Phase::AwaitDecision, log);
    let patience = agent.config.migration.decision_timeout()
        + agent.config.migration.connect_timeout();
    let verdict = tokio::time::timeout(patience, await_verdict(link))
        .await
        .unwrap_or(Verdict::Unknown(MigrateError::DecisionTimeout));
    match verdict {
        Verdict::Commit => {
            set_phase(agent, addr, Phase::Committed, log);
            let entry = agent
                .registry
                .lookup(addr)
                .map_err(|_| MigrateError::VmNotFound(addr))?;
            agent
                .registry
                .apply_transition(addr, Trigger::PeerCommitted)
                .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
            agent.engine.release(addr).await;
            if let Err(e) = link.send_msg(codec::Message::Okay).await {
                warn!(log, "could not confirm commit to destination";
                      "error" => %e);
            }
            agent.discard_vm_resources(&entry.info).await;
            agent
                .registry
                .apply_transition(addr, Trigger::DestroyCompleted)
                .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
            info!(log, "VM migrated away");
            Ok(())
        }
        Verdict::Abort => {
            info!(log, "destination aborted the migration");
            resume(agent, addr, true, log).await;
            Ok(())
        }
        Verdict::Unknown(e) => {
            error!(log, "migration outcome unknown; VM left stopped";
                   "error" => %e);
            set_phase(agent, addr, Phase::InDoubt, log);
            Err(e)
        }
    }
}

/// Takes the VM back after an abort, restarting its guest if the migration
/// had stopped it.
async fn resume(agent: &Agent, addr: IpAddr, restart: bool, log: &Logger) {
    match agent.resume_after_migration(addr, restart).await {
        Ok(()) => info!(log, "VM resumed after aborted migration"),
        Err(e) => error!(log, "could not resume VM"; "error" => %e),
    }
}

async fn copy_out<T: MigrateConn>(
    agent: &Agent,
    addr: IpAddr,
    request: &SourceRequest,
    link: &mut Link<T>,
    log: &Logger,
) -> Result<(), MigrateError> {
    authorize(agent, addr, request)?;
    let _op = {
        let _locks = agent
            .vm_locks(addr, LockMode::Exclusive)
            .await
            .map_err(|e| MigrateError::InvalidState(e.to_string()))?;
        agent
            .registry
            .begin_operation(
                addr,
                "copy",
                &[VmState::Running, VmState::Stopped],
            )
            .map_err(|e| MigrateError::InvalidState(e.to_string()))?
    };
    let preamble = preamble(agent, addr).await?;
    send_contents(agent, addr, link, &preamble).await?;
    link.read_ok().await?;
    info!(log, "VM copied"; "bytes" => preamble.total_bytes());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::test::{harness, resident_vm, Harness};
    use crate::agent::Caller;
    use crate::error::ErrorKind;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use vmhost_api_types::ResolveVmMigrationRequest;

    /// Connects a destination to a source serving `ip`, and runs the
    /// exchange up to the point where every byte has arrived.
    async fn receive_everything(
        h: &Harness,
        ip: IpAddr,
    ) -> (Link<DuplexStream>, JoinHandle<Result<(), MigrateError>>) {
        let log = Logger::root(slog::Discard, slog::o!());
        let (a, b) = tokio::io::duplex(1 << 16);
        let agent = h.agent.clone();
        let source = tokio::spawn(async move {
            let ws =
                WebSocketStream::from_raw_socket(a, Role::Server, None).await;
            serve(&agent, ip, ws).await
        });

        let mut ws =
            WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let offer = protocol::make_protocol_offer();
        ws.send(tungstenite::Message::Text(offer)).await.unwrap();
        match ws.next().await {
            Some(Ok(tungstenite::Message::Text(_))) => {}
            x => panic!("no protocol selected: {x:?}"),
        }
        let mut link = Link::new(ws, MigrateRole::Source, log);
        let token = h.agent.tokens.issue(ip, Duration::from_secs(60)).unwrap();
        link.send_serialized(&SourceRequest {
            access_token: token.token,
            mode: TransferMode::Migrate,
            destination: "dst:1".to_string(),
        })
        .await
        .unwrap();

        let preamble: Preamble =
            link.read_serialized("preamble").await.unwrap();
        assert!(!h.engine.is_running(ip));
        assert_eq!(
            h.agent.registry.lookup(ip).unwrap().state(),
            VmState::Migrating
        );
        link.send_msg(codec::Message::Okay).await.unwrap();
        for (_, size) in preamble.transfer_order() {
            let mut got = 0;
            while got < size {
                match link.read_msg().await.unwrap() {
                    codec::Message::Blob(chunk) => got += chunk.len() as u64,
                    msg => panic!("expected blob data, got {msg:?}"),
                }
            }
        }
        link.send_msg(codec::Message::Okay).await.unwrap();
        (link, source)
    }

    fn phase(h: &Harness, ip: IpAddr) -> Option<Phase> {
        h.agent.registry.lookup(ip).unwrap().migration.map(|m| m.phase)
    }

    #[tokio::test]
    async fn lost_decision_leaves_vm_in_doubt() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (link, source) = receive_everything(&h, ip).await;
        drop(link);

        assert!(source.await.unwrap().is_err());
        assert_eq!(
            h.agent.registry.lookup(ip).unwrap().state(),
            VmState::Migrating
        );
        assert_eq!(phase(&h, ip), Some(Phase::InDoubt));
        assert!(!h.engine.is_running(ip));

        let keep = ResolveVmMigrationRequest { commit: false };
        let err = h
            .agent
            .resolve_vm_migration(&Caller::user("alice", &[]), ip, &keep)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        h.agent
            .resolve_vm_migration(&Caller::admin(), ip, &keep)
            .await
            .unwrap();
        let entry = h.agent.registry.lookup(ip).unwrap();
        assert_eq!(entry.state(), VmState::Running);
        assert!(entry.migration.is_none());
        assert!(h.engine.is_running(ip));

        let err = h
            .agent
            .resolve_vm_migration(&Caller::admin(), ip, &keep)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn in_doubt_vm_resolved_as_committed_is_destroyed() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (link, source) = receive_everything(&h, ip).await;
        drop(link);
        assert!(source.await.unwrap().is_err());

        h.agent
            .resolve_vm_migration(
                &Caller::admin(),
                ip,
                &ResolveVmMigrationRequest { commit: true },
            )
            .await
            .unwrap();
        assert!(!h.agent.registry.contains(ip));
        assert!(!h.engine.is_running(ip));
    }

    #[tokio::test]
    async fn explicit_abort_restarts_the_guest() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (mut link, source) = receive_everything(&h, ip).await;
        link.send_msg(codec::Message::Abort).await.unwrap();

        source.await.unwrap().unwrap();
        let entry = h.agent.registry.lookup(ip).unwrap();
        assert_eq!(entry.state(), VmState::Running);
        assert!(entry.migration.is_none());
        assert!(h.engine.is_running(ip));
    }

    #[tokio::test]
    async fn commit_hands_the_vm_over() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (mut link, source) = receive_everything(&h, ip).await;
        link.send_msg(codec::Message::Commit).await.unwrap();
        link.read_ok().await.unwrap();

        source.await.unwrap().unwrap();
        assert!(!h.agent.registry.contains(ip));
        assert!(!h.engine.is_running(ip));
    }
}
