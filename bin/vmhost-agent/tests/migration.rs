// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two agents on loopback: a VM is created on one and migrated to the other
//! over the agents' own HTTP and websocket endpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::Logger;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use vmhost_agent::agent::Agent;
use vmhost_agent::engine::SimulatedEngine;
use vmhost_agent::server;
use vmhost_agent::storage::DirectoryStore;
use vmhost_api_types::{
    Address, ChangeAddressPoolRequest, CreateVmRequest, CreateVmResponse,
    GetVmAccessTokenRequest, GetVmAccessTokenResponse, MigrateVmRequest,
    MigrateVmResponse, MigrateVmResponseResponse, Subnet, VmInfo, VmState,
};
use vmhost_config_toml::Config;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestAgent {
    addr: SocketAddr,
    server: dropshot::HttpServer<Arc<Agent>>,
    _dir: tempfile::TempDir,
}

fn subnet() -> Subnet {
    Subnet {
        id: "s0".to_string(),
        ip_gateway: "10.0.0.1".parse().unwrap(),
        ip_mask: "255.255.255.0".parse().unwrap(),
        domain_name: String::new(),
        domain_name_servers: vec![],
        disable_metadata: false,
        manage: true,
        vlan_id: 0,
        allowed_groups: vec![],
        allowed_users: vec![],
        first_dynamic_ip: None,
        last_dynamic_ip: None,
    }
}

fn start_agent() -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let log = Logger::root(slog::Discard, slog::o!());
    let mut config = Config::default();
    config.agent.state_dir = dir.path().to_path_buf();
    config.capacity.memory_mib = 4096;
    config.capacity.num_cpus = 4;
    config.migration.decision_timeout_secs = 10;
    config.migration.connect_timeout_secs = 5;
    config.subnets = vec![subnet()];

    let storage = Arc::new(DirectoryStore::new(dir.path(), 1 << 30));
    let (engine, events) = SimulatedEngine::new(log.clone());
    let agent =
        Arc::new(Agent::new(config, storage, Arc::new(engine), log.clone()));
    agent.spawn_event_handler(events);
    let server =
        server::start(agent, "127.0.0.1:0".parse().unwrap(), &log).unwrap();
    TestAgent { addr: server.local_addr(), server, _dir: dir }
}

async fn put<B: Serialize, T: DeserializeOwned>(
    agent: &TestAgent,
    path: &str,
    body: &B,
) -> T {
    let resp = reqwest::Client::new()
        .put(format!("http://{}{}", agent.addr, path))
        .json(body)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "PUT {path}: {}", resp.status());
    let bytes = resp.bytes().await.unwrap();
    // No-content responses decode as JSON null.
    if bytes.is_empty() {
        serde_json::from_str("null").unwrap()
    } else {
        serde_json::from_slice(&bytes).unwrap()
    }
}

/// The VM's record, or `None` once the agent no longer knows it.
async fn vm_info(agent: &TestAgent, ip: IpAddr) -> Option<VmInfo> {
    let resp = reqwest::get(format!("http://{}/vm/{ip}", agent.addr))
        .await
        .unwrap();
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return None;
    }
    assert!(resp.status().is_success());
    Some(resp.json().await.unwrap())
}

async fn wait_for_state(agent: &TestAgent, ip: IpAddr, want: Option<VmState>) {
    for _ in 0..100 {
        if vm_info(agent, ip).await.map(|vm| vm.state) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("VM {ip} on {} never reached {want:?}", agent.addr);
}

async fn connect(agent: &TestAgent, path: &str) -> Client {
    let (ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{}{}", agent.addr, path))
            .await
            .unwrap();
    ws
}

async fn send<T: Serialize>(ws: &mut Client, msg: &T) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap())).await.unwrap();
}

async fn recv<T: DeserializeOwned>(ws: &mut Client) -> T {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(t))) => {
                return serde_json::from_str(&t).unwrap()
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Creates a running VM on `agent` and returns its address.
async fn create_vm(agent: &TestAgent) -> IpAddr {
    let pool = ChangeAddressPoolRequest {
        addresses_to_add: vec![Address {
            ip_address: Some("10.0.0.5".parse().unwrap()),
            mac_address: String::new(),
        }],
        ..Default::default()
    };
    let () = put(agent, "/host/address-pool", &pool).await;

    let mut ws = connect(agent, "/vms/create").await;
    let req = CreateVmRequest {
        dhcp_timeout_ms: -1,
        image_data_size: 4,
        vm_info: VmInfo {
            memory_in_mib: 512,
            virtual_cpus: 1,
            subnet_id: "s0".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    send(&mut ws, &req).await;
    ws.send(Message::Binary(b"root".to_vec())).await.unwrap();
    let done = loop {
        let frame: CreateVmResponse = recv(&mut ws).await;
        if frame.is_final {
            break frame;
        }
    };
    assert_eq!(done.error, None);
    done.ip_address.unwrap()
}

/// Drives a migration from `src` to `dst`, answering the commit request with
/// `commit`, and returns the final frame.
async fn migrate(
    src: &TestAgent,
    dst: &TestAgent,
    ip: IpAddr,
    commit: bool,
) -> MigrateVmResponse {
    let token: GetVmAccessTokenResponse = put(
        src,
        &format!("/vm/{ip}/access-token"),
        &GetVmAccessTokenRequest { lifetime_secs: 600 },
    )
    .await;

    let mut ws = connect(dst, "/vms/migrate").await;
    send(
        &mut ws,
        &MigrateVmRequest {
            access_token: token.token,
            dhcp_timeout_ms: -1,
            ip_address: ip,
            skip_memory_check: false,
            source_hypervisor: src.addr.to_string(),
        },
    )
    .await;
    loop {
        let frame: MigrateVmResponse = recv(&mut ws).await;
        if frame.is_final {
            return frame;
        }
        if frame.request_commit {
            send(&mut ws, &MigrateVmResponseResponse { commit }).await;
        }
    }
}

#[tokio::test]
async fn committed_migration_moves_the_vm() {
    let src = start_agent();
    let dst = start_agent();
    let ip = create_vm(&src).await;
    wait_for_state(&src, ip, Some(VmState::Running)).await;

    let done = migrate(&src, &dst, ip, true).await;
    assert_eq!(done.error, None);
    assert_eq!(done.progress_message, "migration committed");

    wait_for_state(&dst, ip, Some(VmState::Running)).await;
    wait_for_state(&src, ip, None).await;

    src.server.close().await.unwrap();
    dst.server.close().await.unwrap();
}

#[tokio::test]
async fn aborted_migration_leaves_the_source_running() {
    let src = start_agent();
    let dst = start_agent();
    let ip = create_vm(&src).await;

    let done = migrate(&src, &dst, ip, false).await;
    assert_eq!(done.error, None);
    assert_eq!(done.progress_message, "migration aborted");

    wait_for_state(&src, ip, Some(VmState::Running)).await;
    wait_for_state(&dst, ip, None).await;

    src.server.close().await.unwrap();
    dst.server.close().await.unwrap();
}

#[tokio::test]
async fn migration_needs_a_valid_token() {
    let src = start_agent();
    let dst = start_agent();
    let ip = create_vm(&src).await;

    let mut ws = connect(&dst, "/vms/migrate").await;
    send(
        &mut ws,
        &MigrateVmRequest {
            access_token: "0".repeat(64),
            dhcp_timeout_ms: -1,
            ip_address: ip,
            skip_memory_check: false,
            source_hypervisor: src.addr.to_string(),
        },
    )
    .await;
    let done = loop {
        let frame: MigrateVmResponse = recv(&mut ws).await;
        if frame.is_final {
            break frame;
        }
    };
    assert!(done.error.is_some());

    wait_for_state(&src, ip, Some(VmState::Running)).await;
    wait_for_state(&dst, ip, None).await;

    src.server.close().await.unwrap();
    dst.server.close().await.unwrap();
}
