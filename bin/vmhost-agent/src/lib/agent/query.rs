// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only queries, credentials, held locks, and the long-lived streams:
//! update subscriptions, metadata traces and guest channel pass-through.

use std::net::IpAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use vmhost_api_types::{
    DiscardVmAccessTokenRequest, GetUpdatesRequest, GetVmAccessTokenRequest,
    GetVmAccessTokenResponse, GetVmInfosRequest, GetVmInfosResponse,
    HoldLockRequest, HoldLockResponse, ListVMsRequest, ListVMsResponse,
    MetadataAccessEvent, ProbeVmPortRequest, ProbeVmPortResponse,
    ScanVmRootRequest, ScanVmRootResponse, StreamHandshakeResponse, VmInfo,
    VmState,
};

use super::{Agent, Caller};
use crate::engine::{Channel, EngineConn, EngineError};
use crate::error::AgentError;
use crate::lock::LockMode;
use crate::storage::Blob;
use crate::stream::{Conversation, StreamConn, StreamError};
use crate::vm::ListFilter;

/// Size of each chunk relayed from a guest channel.
const PASS_THROUGH_CHUNK: usize = 4096;

/// Copies bytes both ways between a websocket and a guest channel until
/// either side closes.
async fn pass_through<S: StreamConn>(
    conv: Conversation<S>,
    conn: Box<dyn EngineConn>,
) -> Result<(), StreamError> {
    let mut ws = conv.into_inner();
    let (mut guest_rx, mut guest_tx) = tokio::io::split(conn);
    let mut buf = vec![0u8; PASS_THROUGH_CHUNK];
    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    guest_tx.write_all(&data).await?
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            n = guest_rx.read(&mut buf) => match n? {
                0 => break,
                n => ws.send(Message::Binary(buf[..n].to_vec())).await?,
            },
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}

impl Agent {
    pub async fn get_vm_info(
        &self,
        addr: IpAddr,
    ) -> Result<VmInfo, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Shared).await?;
        let entry = self.registry.lookup(addr)?;
        if entry.info.uncommitted {
            return Err(crate::vm::RegistryError::NotFound(addr).into());
        }
        Ok(entry.info)
    }

    pub async fn get_vm_infos(
        &self,
        req: &GetVmInfosRequest,
    ) -> Result<GetVmInfosResponse, AgentError> {
        let _host = self.host_lock(LockMode::Shared).await?;
        let filter = ListFilter {
            ignore_state_mask: req.ignore_state_mask,
            owner_users: req.owner_users.clone(),
            owner_groups: req.owner_groups.clone(),
            tags: req.vm_tags_to_match.clone(),
        };
        Ok(GetVmInfosResponse { vms: self.registry.list(&filter) })
    }

    pub async fn list_vms(
        &self,
        req: &ListVMsRequest,
    ) -> Result<ListVMsResponse, AgentError> {
        let _host = self.host_lock(LockMode::Shared).await?;
        let filter = ListFilter {
            ignore_state_mask: req.ignore_state_mask,
            owner_users: req.owner_users.clone(),
            owner_groups: req.owner_groups.clone(),
            tags: req.vm_tags_to_match.clone(),
        };
        let mut ip_addresses: Vec<IpAddr> = self
            .registry
            .list(&filter)
            .into_iter()
            .filter_map(|vm| vm.address.ip_address)
            .collect();
        if req.sort {
            ip_addresses.sort();
        }
        Ok(ListVMsResponse { ip_addresses })
    }

    /// Streams updates to a watcher, starting with the full host state. The
    /// watcher may register external leases up the same channel.
    pub async fn get_updates<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<(), AgentError> {
        let mut watcher = self.subscribe_updates();
        loop {
            tokio::select! {
                update = watcher.recv() => match update {
                    Some(update) => conv.send(&update).await?,
                    None => {
                        warn!(self.log,
                              "update watcher fell behind and was dropped");
                        return Err(AgentError::Busy(
                            "update stream fell behind; resubscribe"
                                .to_string(),
                        ));
                    }
                },
                inbound = conv.recv::<GetUpdatesRequest>() => match inbound {
                    Ok(GetUpdatesRequest {
                        register_external_leases: Some(leases),
                    }) => {
                        let registered = self
                            .register_external_leases(caller, &leases)
                            .await;
                        if let Err(e) = registered {
                            warn!(self.log,
                                  "watcher could not register leases";
                                  "error" => %e);
                        }
                    }
                    Ok(_) => {}
                    Err(StreamError::Closed) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Lists the files in a stopped VM's root file system.
    pub async fn scan_vm_root(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ScanVmRootRequest,
    ) -> Result<ScanVmRootResponse, AgentError> {
        let _op = {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let info = self.vm_in(addr, &[VmState::Stopped])?;
            self.check_owner(caller, &info)?;
            self.registry.begin_operation(
                addr,
                "scan root",
                &[VmState::Stopped],
            )?
        };
        let root = self.storage.location(addr, &Blob::Volume(0));
        let file_system =
            self.engine.scan_root(&root, &req.exclude_prefixes).await?;
        Ok(ScanVmRootResponse { file_system })
    }

    /// Tries to open a TCP connection to a port on a running VM.
    pub async fn probe_vm_port(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ProbeVmPortRequest,
    ) -> Result<ProbeVmPortResponse, AgentError> {
        {
            let _locks = self.vm_locks(addr, LockMode::Shared).await?;
            let info =
                self.vm_in(addr, &[VmState::Running, VmState::Debugging])?;
            self.check_owner(caller, &info)?;
        }
        let wait = Duration::from_millis(req.timeout_ms);
        let connect = TcpStream::connect((addr, req.port_number));
        let port_is_open =
            matches!(tokio::time::timeout(wait, connect).await, Ok(Ok(_)));
        debug!(self.log, "probed port";
               "vm" => %addr, "port" => req.port_number,
               "open" => port_is_open);
        Ok(ProbeVmPortResponse { port_is_open })
    }

    pub async fn get_vm_access_token(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &GetVmAccessTokenRequest,
    ) -> Result<GetVmAccessTokenResponse, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Shared).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        let lifetime = Duration::from_secs(req.lifetime_secs);
        let issued = self.tokens.issue(addr, lifetime)?;
        Ok(GetVmAccessTokenResponse {
            token: issued.token,
            expires: issued.expires_at,
        })
    }

    /// Owners may discard any token for their VM; anyone else must hold
    /// the token being discarded.
    pub async fn discard_vm_access_token(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &DiscardVmAccessTokenRequest,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Shared).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner_or_token(
            caller,
            &entry.info,
            addr,
            Some(&req.access_token),
        )?;
        Ok(self.tokens.discard(&req.access_token, addr)?)
    }

    /// Holds the host lock for a caller until the requested time passes or
    /// the caller hangs up.
    pub async fn hold_host_lock<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<HoldLockResponse, AgentError> {
        let req: HoldLockRequest = conv.recv().await?;
        let mode = LockMode::from_write_flag(req.write_lock);
        if mode == LockMode::Exclusive && !caller.is_admin() {
            return Err(AgentError::Unauthorized(
                "only a local administrator may hold the host lock \
                 exclusively"
                    .to_string(),
            ));
        }
        let wait = Duration::from_millis(req.timeout_ms);
        let guard = self.locks.lock_host(mode, wait).await?;
        self.hold(conv, wait).await?;
        drop(guard);
        Ok(HoldLockResponse::default())
    }

    pub async fn hold_vm_lock<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<HoldLockResponse, AgentError> {
        let req: HoldLockRequest = conv.recv().await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        let wait = Duration::from_millis(req.timeout_ms);
        let locks = self
            .locks
            .lock_host_and_vm(
                LockMode::Shared,
                addr,
                LockMode::from_write_flag(req.write_lock),
                wait,
            )
            .await?;
        self.hold(conv, wait).await?;
        drop(locks);
        Ok(HoldLockResponse::default())
    }

    /// Tells the caller its lock is held, then waits out `duration` or the
    /// caller's hang-up, whichever comes first.
    async fn hold<S: StreamConn>(
        &self,
        conv: &mut Conversation<S>,
        duration: Duration,
    ) -> Result<(), StreamError> {
        conv.send(&HoldLockResponse::default()).await?;
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                inbound = conv.recv::<HoldLockRequest>() => match inbound {
                    Err(StreamError::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                    Ok(_) => {}
                },
            }
        }
    }

    /// Streams a VM's requests to the metadata service.
    pub async fn trace_vm_metadata<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<(), AgentError> {
        let subscribed = async {
            let _locks = self.vm_locks(addr, LockMode::Shared).await?;
            let entry = self.registry.lookup(addr)?;
            self.check_owner(caller, &entry.info)?;
            Ok::<_, AgentError>(self.metadata.subscribe(addr))
        }
        .await;
        let mut accesses = match subscribed {
            Ok(rx) => rx,
            Err(e) => {
                conv.send(&StreamHandshakeResponse {
                    error: Some(e.to_string()),
                })
                .await?;
                return Err(e);
            }
        };
        conv.send(&StreamHandshakeResponse::default()).await?;
        loop {
            tokio::select! {
                access = accesses.recv() => match access {
                    Ok(a) => {
                        let event =
                            MetadataAccessEvent { path: a.path, at: a.at };
                        conv.send(&event).await?
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(self.log, "metadata trace fell behind";
                              "vm" => %addr, "dropped" => n);
                    }
                    // The VM is gone.
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                inbound = conv.recv::<StreamHandshakeResponse>() => {
                    match inbound {
                        Err(StreamError::Closed) => return Ok(()),
                        Err(e) => return Err(e.into()),
                        Ok(_) => {}
                    }
                }
            }
        }
    }

    async fn connect_channel(
        &self,
        caller: &Caller,
        addr: IpAddr,
        channel: Channel,
    ) -> Result<Box<dyn EngineConn>, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Shared).await?;
        let info = self.vm_in(addr, &[VmState::Running, VmState::Debugging])?;
        self.check_owner(caller, &info)?;
        if let Channel::Serial(port) = channel {
            if port >= self.config.agent.num_serial_ports {
                return Err(EngineError::NoChannel(addr, channel).into());
            }
        }
        Ok(self.engine.connect(addr, channel).await?)
    }

    /// Answers a console, manager or serial port request, then turns the
    /// connection into a raw byte stream to the guest.
    pub async fn serve_channel<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        channel: Channel,
        mut conv: Conversation<S>,
    ) -> Result<(), AgentError> {
        let conn = match self.connect_channel(caller, addr, channel).await {
            Ok(conn) => conn,
            Err(e) => {
                conv.send(&StreamHandshakeResponse {
                    error: Some(e.to_string()),
                })
                .await?;
                conv.close().await;
                return Err(e);
            }
        };
        conv.send(&StreamHandshakeResponse::default()).await?;
        info!(self.log, "guest channel opened";
              "vm" => %addr, "channel" => ?channel);
        pass_through(conv, conn).await?;
        info!(self.log, "guest channel closed";
              "vm" => %addr, "channel" => ?channel);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::test::{harness, resident_vm};
    use crate::error::ErrorKind;
    use crate::stream::test::pair;
    use std::collections::BTreeMap;
    use vmhost_api_types::{
        RegisterExternalLeasesRequest, StopVmRequest, Update,
    };
    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;

    async fn next_text<T: serde::de::DeserializeOwned>(
        client: &mut WebSocketStream<DuplexStream>,
    ) -> T {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(t))) => {
                    return serde_json::from_str(&t).unwrap()
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn listings_filter_and_sort() {
        let h = harness();
        let b = resident_vm(&h, "10.0.0.6", VmState::Running).await;
        let a = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        h.agent
            .registry
            .update(b, |vm| {
                vm.tags.insert("tier".to_string(), "web".to_string());
                Ok::<_, AgentError>(())
            })
            .unwrap();

        let all = h
            .agent
            .list_vms(&ListVMsRequest { sort: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.ip_addresses, [a, b]);

        let running = ListVMsRequest {
            ignore_state_mask: VmState::Stopped.mask_bit(),
            ..Default::default()
        };
        assert_eq!(h.agent.list_vms(&running).await.unwrap().ip_addresses, [b]);

        let tagged = GetVmInfosRequest {
            vm_tags_to_match: BTreeMap::from([("tier".to_string(), vec![])]),
            ..Default::default()
        };
        let infos = h.agent.get_vm_infos(&tagged).await.unwrap();
        assert_eq!(infos.vms.len(), 1);
        assert_eq!(infos.vms[0].address.ip_address, Some(b));

        let err = h
            .agent
            .get_vm_info("10.0.0.9".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn updates_start_full_and_accept_leases() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (mut conv, mut client) = pair().await;
        let agent = h.agent.clone();
        let stream = tokio::spawn(async move {
            agent.get_updates(&Caller::admin(), &mut conv).await
        });

        let full: Update = next_text(&mut client).await;
        assert!(full.vms_complete);
        assert!(full.vms.contains_key(&ip));
        assert!(full.capacity.is_some());

        h.agent
            .stop_vm(&Caller::admin(), ip, &StopVmRequest::default())
            .await
            .unwrap();
        let changed: Update = loop {
            let u: Update = next_text(&mut client).await;
            if u.vms.contains_key(&ip) {
                break u;
            }
        };
        assert!(!changed.vms_complete);

        let leases = GetUpdatesRequest {
            register_external_leases: Some(RegisterExternalLeasesRequest {
                addresses: vec![vmhost_api_types::Address {
                    ip_address: Some("10.0.0.6".parse().unwrap()),
                    mac_address: String::new(),
                }],
                hostnames: vec!["nas".to_string()],
            }),
        };
        let text = serde_json::to_string(&leases).unwrap();
        client.send(Message::Text(text)).await.unwrap();
        loop {
            let u: Update = next_text(&mut client).await;
            if let Some(free) = u.num_free_addresses {
                if free["s0"] == 0 {
                    break;
                }
            }
        }

        client.close(None).await.unwrap();
        stream.await.unwrap().unwrap();
        assert_eq!(h.agent.updates.watcher_count(), 0);
    }

    #[tokio::test]
    async fn tokens_are_owner_issued() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let req = GetVmAccessTokenRequest { lifetime_secs: 60 };
        let err = h
            .agent
            .get_vm_access_token(&Caller::user("bob", &[]), ip, &req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let issued = h
            .agent
            .get_vm_access_token(&Caller::user("alice", &[]), ip, &req)
            .await
            .unwrap();
        assert_eq!(issued.token.len(), 64);
        assert!(h.agent.tokens.authorize(Some(&issued.token), ip).is_ok());

        let discard = DiscardVmAccessTokenRequest {
            access_token: "f".repeat(64),
        };
        let err = h
            .agent
            .discard_vm_access_token(&Caller::user("bob", &[]), ip, &discard)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        // Holding the token is enough to give it up.
        let discard =
            DiscardVmAccessTokenRequest { access_token: issued.token.clone() };
        h.agent
            .discard_vm_access_token(&Caller::user("bob", &[]), ip, &discard)
            .await
            .unwrap();
        assert!(h.agent.tokens.authorize(Some(&issued.token), ip).is_err());

        // Owners may discard tokens that are already gone.
        h.agent
            .discard_vm_access_token(&Caller::user("alice", &[]), ip, &discard)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn held_vm_lock_blocks_until_hangup() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (mut conv, mut client) = pair().await;
        let req = HoldLockRequest { timeout_ms: 60_000, write_lock: true };
        let text = serde_json::to_string(&req).unwrap();
        client.send(Message::Text(text)).await.unwrap();
        let agent = h.agent.clone();
        let holder = tokio::spawn(async move {
            agent.hold_vm_lock(&Caller::admin(), ip, &mut conv).await
        });
        let held: HoldLockResponse = next_text(&mut client).await;
        assert!(!held.is_final && held.error.is_none());

        let err = h
            .agent
            .change_vm_tags(&Caller::admin(), ip, &Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        client.close(None).await.unwrap();
        let released = holder.await.unwrap().unwrap();
        assert!(released.error.is_none());
        h.agent
            .change_vm_tags(&Caller::admin(), ip, &Default::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn held_lock_expires() {
        let h = harness();
        let (mut conv, mut client) = pair().await;
        let req = HoldLockRequest { timeout_ms: 20, write_lock: true };
        let text = serde_json::to_string(&req).unwrap();
        client.send(Message::Text(text)).await.unwrap();
        let resp =
            h.agent.hold_host_lock(&Caller::admin(), &mut conv).await.unwrap();
        assert!(resp.error.is_none());
        assert!(h.agent.host_lock(LockMode::Exclusive).await.is_ok());
    }

    #[tokio::test]
    async fn metadata_trace() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (mut conv, mut client) = pair().await;
        let agent = h.agent.clone();
        let trace = tokio::spawn(async move {
            agent.trace_vm_metadata(&Caller::admin(), ip, &mut conv).await
        });
        let hello: StreamHandshakeResponse = next_text(&mut client).await;
        assert!(hello.error.is_none());

        h.agent.record_metadata_access(ip, "/latest/user-data");
        let seen: MetadataAccessEvent = next_text(&mut client).await;
        assert_eq!(seen.path, "/latest/user-data");

        client.close(None).await.unwrap();
        trace.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn console_pass_through() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let (conv, mut client) = pair().await;
        let agent = h.agent.clone();
        let console = tokio::spawn(async move {
            agent
                .serve_channel(&Caller::admin(), ip, Channel::Console, conv)
                .await
        });
        let hello: StreamHandshakeResponse = next_text(&mut client).await;
        assert!(hello.error.is_none());

        client.send(Message::Binary(b"hello".to_vec())).await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            match client.next().await {
                Some(Ok(Message::Binary(b))) => echoed.extend(b),
                other => panic!("expected guest bytes, got {other:?}"),
            }
        }
        assert_eq!(echoed, b"hello");
        client.close(None).await.unwrap();
        console.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn channel_refused_for_stopped_vm() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let (conv, mut client) = pair().await;
        let agent = h.agent.clone();
        let serial = tokio::spawn(async move {
            agent
                .serve_channel(&Caller::admin(), ip, Channel::Serial(0), conv)
                .await
        });
        let hello: StreamHandshakeResponse = next_text(&mut client).await;
        assert!(hello.error.is_some());
        assert_eq!(
            serial.await.unwrap().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn port_check_refused_for_stopped_vm() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let req = ProbeVmPortRequest { port_number: 22, timeout_ms: 10 };
        let err = h
            .agent
            .probe_vm_port(&Caller::admin(), ip, &req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
