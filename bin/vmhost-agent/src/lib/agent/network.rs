// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subnets, the address pool, and DHCP.

use std::net::IpAddr;
use std::time::Duration;

use slog::{info, warn};
use tokio::sync::broadcast;
use tokio::time::Instant;
use vmhost_api_types::{
    ChangeAddressPoolRequest, ListSubnetsRequest, ListSubnetsResponse,
    NetbootMachineRequest, RegisterExternalLeasesRequest,
    UpdateSubnetsRequest, WatchDhcpRequest, WatchDhcpResponse,
};

use super::{Agent, Caller};
use crate::dhcp::NetbootOffer;
use crate::error::AgentError;
use crate::lock::LockMode;
use crate::pool::mac_for;
use crate::stream::{Conversation, StreamConn, StreamError};

fn require_admin(caller: &Caller, what: &str) -> Result<(), AgentError> {
    match caller.user.as_deref() {
        None => Ok(()),
        Some(user) => Err(AgentError::Unauthorized(format!(
            "{user} may not {what}; only a local administrator may"
        ))),
    }
}

/// Pairs each leased address with its hostname. Hostnames may run out
/// before addresses do.
fn leases(req: &RegisterExternalLeasesRequest) -> Vec<(IpAddr, String)> {
    req.addresses
        .iter()
        .enumerate()
        .filter_map(|(i, a)| {
            let hostname = req.hostnames.get(i).cloned().unwrap_or_default();
            a.ip_address.map(|ip| (ip, hostname))
        })
        .collect()
}

impl Agent {
    pub async fn change_address_pool(
        &self,
        caller: &Caller,
        req: &ChangeAddressPoolRequest,
    ) -> Result<(), AgentError> {
        require_admin(caller, "change the address pool")?;
        let _host = self.host_lock(LockMode::Exclusive).await?;
        self.pool.change_pool(
            &req.addresses_to_add,
            &req.addresses_to_remove,
            &req.maximum_free_addresses,
        )?;
        info!(self.log, "address pool changed";
              "added" => req.addresses_to_add.len(),
              "removed" => req.addresses_to_remove.len());
        self.publish_host_state();
        Ok(())
    }

    /// Replaces the set of addresses leased to machines that are not VMs
    /// on this host.
    pub async fn register_external_leases(
        &self,
        caller: &Caller,
        req: &RegisterExternalLeasesRequest,
    ) -> Result<(), AgentError> {
        require_admin(caller, "register external leases")?;
        let _host = self.host_lock(LockMode::Exclusive).await?;
        self.pool.register_external_leases(&leases(req));
        self.publish_host_state();
        Ok(())
    }

    pub async fn list_subnets(
        &self,
        req: &ListSubnetsRequest,
    ) -> Result<ListSubnetsResponse, AgentError> {
        let _host = self.host_lock(LockMode::Shared).await?;
        let mut subnets = self.pool.subnets();
        if req.sort {
            subnets.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Ok(ListSubnetsResponse { subnets })
    }

    pub async fn update_subnets(
        &self,
        caller: &Caller,
        req: &UpdateSubnetsRequest,
    ) -> Result<(), AgentError> {
        require_admin(caller, "change subnets")?;
        let _host = self.host_lock(LockMode::Exclusive).await?;
        self.pool.update_subnets(
            req.add.clone(),
            req.change.clone(),
            req.delete.clone(),
        )?;
        info!(self.log, "subnets updated";
              "added" => req.add.len(),
              "changed" => req.change.len(),
              "deleted" => req.delete.len());
        self.publish_host_state();
        Ok(())
    }

    /// Offers a netboot to a machine that is not a VM, then waits for it to
    /// acknowledge the requested number of leases.
    pub async fn netboot_machine(
        &self,
        caller: &Caller,
        req: &NetbootMachineRequest,
    ) -> Result<(), AgentError> {
        require_admin(caller, "netboot machines")?;
        let ip = req.address.ip_address.ok_or_else(|| {
            AgentError::InvalidArgument(
                "netboot needs an IP address".to_string(),
            )
        })?;
        if req.subnet.is_none() && self.pool.subnet_for(ip).is_none() {
            return Err(AgentError::NotFound(format!(
                "{ip} is not in a known subnet and none was given"
            )));
        }
        let mut address = req.address.clone();
        if address.mac_address.is_empty() {
            address.mac_address = mac_for(ip);
        }
        let mac = address.mac_address.clone();

        let now = Instant::now();
        let offer_expires =
            now + Duration::from_secs(req.offer_expiration_secs);
        let files_expire = offer_expires
            .max(now + Duration::from_secs(req.files_expiration_secs));
        let offer = NetbootOffer {
            address,
            hostname: req.hostname.clone(),
            subnet: req.subnet.clone(),
            files: req.files.clone(),
            offer_expires,
            files_expire,
        };
        let waiter = self.dhcp.ack_waiter(&mac);
        self.dhcp.publish_netboot_offer(offer);
        if req.num_acknowledgements_to_wait_for == 0 {
            return Ok(());
        }
        let wait = Duration::from_millis(req.wait_timeout_ms);
        if waiter.wait(req.num_acknowledgements_to_wait_for, wait).await {
            info!(self.log, "netbooted machine acknowledged";
                  "mac" => &mac, "address" => %ip);
            return Ok(());
        }
        self.dhcp.withdraw_netboot_offer(&mac);
        Err(AgentError::Busy(format!(
            "timed out waiting for {} acknowledgements from {mac}",
            req.num_acknowledgements_to_wait_for
        )))
    }

    /// A file offered to a netbooting machine.
    pub fn netboot_file(
        &self,
        mac: &str,
        name: &str,
    ) -> Result<Vec<u8>, AgentError> {
        self.dhcp.netboot_file(mac, name).ok_or_else(|| {
            AgentError::NotFound(format!("no netboot file {name} for {mac}"))
        })
    }

    /// Streams DHCP packets seen on the host until the caller goes away or
    /// the requested number has been sent.
    pub async fn watch_dhcp<S: StreamConn>(
        &self,
        caller: &Caller,
        conv: &mut Conversation<S>,
    ) -> Result<(), AgentError> {
        let req: WatchDhcpRequest = conv.recv().await?;
        require_admin(caller, "watch DHCP")?;
        let mut packets = self.dhcp.subscribe();
        let mut sent = 0u64;
        while req.max_packets == 0 || sent < req.max_packets {
            tokio::select! {
                observed = packets.recv() => match observed {
                    Ok(o) if req.interface.is_empty()
                        || o.interface == req.interface =>
                    {
                        conv.send(&WatchDhcpResponse {
                            error: None,
                            interface: o.interface,
                            packet: o.packet,
                        })
                        .await?;
                        sent += 1;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(self.log, "DHCP watcher fell behind";
                              "dropped" => n);
                        conv.send(&WatchDhcpResponse {
                            error: Some(format!("{n} packets dropped")),
                            ..Default::default()
                        })
                        .await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                inbound = conv.recv::<WatchDhcpRequest>() => match inbound {
                    Err(StreamError::Closed) => break,
                    Err(e) => return Err(e.into()),
                    Ok(_) => {}
                },
            }
        }
        Ok(())
    }

    /// Feeds a packet seen by the host's DHCP server.
    pub fn observe_dhcp_packet(&self, interface: &str, packet: Vec<u8>) {
        self.dhcp.observe(interface, packet);
    }

    /// Feeds a guest's request to the metadata service.
    pub fn record_metadata_access(&self, addr: IpAddr, path: &str) {
        self.metadata.record(addr, path);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::test::{harness, subnet};
    use crate::dhcp::test::packet;
    use crate::error::ErrorKind;
    use crate::pool::Slot;
    use crate::stream::test::pair;
    use futures::{SinkExt, StreamExt};
    use std::net::Ipv4Addr;
    use tokio_tungstenite::tungstenite::Message;
    use vmhost_api_types::Address;

    const MSG_ACK: u8 = 5;

    fn address(ip: &str) -> Address {
        Address {
            ip_address: Some(ip.parse().unwrap()),
            mac_address: String::new(),
        }
    }

    #[tokio::test]
    async fn pool_changes_need_admin_and_publish() {
        let h = harness();
        let req = ChangeAddressPoolRequest {
            addresses_to_add: vec![address("10.0.0.7")],
            ..Default::default()
        };
        let err = h
            .agent
            .change_address_pool(&Caller::user("alice", &[]), &req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let mut watcher = h.agent.subscribe_updates();
        watcher.recv().await.unwrap();
        h.agent.change_address_pool(&Caller::admin(), &req).await.unwrap();
        let update = watcher.recv().await.unwrap();
        assert_eq!(update.num_free_addresses.unwrap()["s0"], 3);
    }

    #[tokio::test]
    async fn external_leases_pair_hostnames() {
        let h = harness();
        let req = RegisterExternalLeasesRequest {
            addresses: vec![address("10.0.0.5"), address("10.0.0.6")],
            hostnames: vec!["printer".to_string()],
        };
        h.agent.register_external_leases(&Caller::admin(), &req).await.unwrap();
        let five: IpAddr = "10.0.0.5".parse().unwrap();
        let six: IpAddr = "10.0.0.6".parse().unwrap();
        assert_eq!(
            h.agent.pool.slot(five),
            Some(Slot::Leased("printer".to_string()))
        );
        assert_eq!(h.agent.pool.slot(six), Some(Slot::Leased(String::new())));
    }

    #[tokio::test]
    async fn subnets_listed_and_updated() {
        let h = harness();
        let mut other = subnet();
        other.id = "a0".to_string();
        other.ip_gateway = "10.9.0.1".parse().unwrap();
        let req =
            UpdateSubnetsRequest { add: vec![other], ..Default::default() };
        h.agent.update_subnets(&Caller::admin(), &req).await.unwrap();

        let sorted = h
            .agent
            .list_subnets(&ListSubnetsRequest { sort: true })
            .await
            .unwrap();
        let ids: Vec<_> =
            sorted.subnets.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a0", "s0"]);
    }

    #[tokio::test]
    async fn netboot_waits_for_acks() {
        let h = harness();
        let req = NetbootMachineRequest {
            address: Address {
                ip_address: Some("10.0.0.40".parse().unwrap()),
                mac_address: "52:54:0a:00:00:28".to_string(),
            },
            files: [("pxelinux.0".to_string(), b"boot".to_vec())].into(),
            files_expiration_secs: 60,
            hostname: "bare".to_string(),
            num_acknowledgements_to_wait_for: 2,
            offer_expiration_secs: 60,
            wait_timeout_ms: 5_000,
            ..Default::default()
        };
        let agent = h.agent.clone();
        let netboot = tokio::spawn(async move {
            agent.netboot_machine(&Caller::admin(), &req).await
        });
        let mac = [0x52, 0x54, 0x0a, 0, 0, 0x28];
        while h.agent.dhcp.netboot_offer("52:54:0a:00:00:28").is_none() {
            tokio::task::yield_now().await;
        }
        for _ in 0..2 {
            let ack = packet(mac, Ipv4Addr::new(10, 0, 0, 40), MSG_ACK);
            h.agent.observe_dhcp_packet("eth0", ack);
        }
        netboot.await.unwrap().unwrap();
        assert_eq!(
            h.agent.netboot_file("52:54:0a:00:00:28", "pxelinux.0").unwrap(),
            b"boot"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn netboot_files_outlive_the_offer() {
        let h = harness();
        let req = NetbootMachineRequest {
            address: address("10.0.0.42"),
            files: [("kernel".to_string(), b"vmlinuz".to_vec())].into(),
            files_expiration_secs: 60,
            offer_expiration_secs: 10,
            ..Default::default()
        };
        h.agent.netboot_machine(&Caller::admin(), &req).await.unwrap();
        let mac = mac_for("10.0.0.42".parse().unwrap());
        assert!(h.agent.dhcp.netboot_offer(&mac).is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(h.agent.dhcp.netboot_offer(&mac).is_none());
        assert_eq!(h.agent.netboot_file(&mac, "kernel").unwrap(), b"vmlinuz");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(h.agent.netboot_file(&mac, "kernel").is_err());
    }

    #[tokio::test]
    async fn netboot_times_out_and_withdraws() {
        let h = harness();
        let req = NetbootMachineRequest {
            address: address("10.0.0.41"),
            num_acknowledgements_to_wait_for: 1,
            offer_expiration_secs: 60,
            wait_timeout_ms: 20,
            ..Default::default()
        };
        let err = h
            .agent
            .netboot_machine(&Caller::admin(), &req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        let mac = mac_for("10.0.0.41".parse().unwrap());
        assert!(h.agent.dhcp.netboot_offer(&mac).is_none());
    }

    #[tokio::test]
    async fn watch_filters_by_interface() {
        let h = harness();
        let (mut conv, mut client) = pair().await;
        let req = WatchDhcpRequest {
            interface: "eth1".to_string(),
            max_packets: 1,
        };
        let text = serde_json::to_string(&req).unwrap();
        client.send(Message::Text(text)).await.unwrap();

        let agent = h.agent.clone();
        let watch = tokio::spawn(async move {
            agent.watch_dhcp(&Caller::admin(), &mut conv).await
        });
        let mac = [0x52, 0x54, 0x0a, 0, 0, 9];
        let Some(Ok(Message::Text(text))) = async {
            loop {
                let (wrong, right) = (
                    packet(mac, Ipv4Addr::UNSPECIFIED, 1),
                    packet(mac, Ipv4Addr::UNSPECIFIED, 3),
                );
                h.agent.observe_dhcp_packet("eth0", wrong);
                h.agent.observe_dhcp_packet("eth1", right);
                tokio::select! {
                    frame = client.next() => break frame,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }
        .await
        else {
            panic!("expected a packet");
        };
        let seen: WatchDhcpResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(seen.interface, "eth1");
        assert!(seen.error.is_none());
        watch.await.unwrap().unwrap();
    }
}
