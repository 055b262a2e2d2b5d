// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCP activity seen on the host's networks.
//!
//! Raw packets are handed to [`DhcpMonitor::observe`] by whatever sniffs the
//! host's interfaces. The monitor fans them out to packet watchers, lets
//! boot paths wait for a guest's lease acknowledgement, and holds the
//! netboot offers published for bare machines.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use slog::{debug, info, Logger};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use vmhost_api_types::{Address, Subnet};

const MIN_PACKET_LEN: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const OPT_PAD: u8 = 0;
const OPT_MSG_TYPE: u8 = 53;
const OPT_END: u8 = 255;
const MSG_ACK: u8 = 5;

/// Packets buffered per watcher before it starts missing some.
const PACKET_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DhcpParseError {
    #[error("packet too short: {0} bytes (minimum {MIN_PACKET_LEN})")]
    TooShort(usize),

    #[error("invalid magic cookie")]
    InvalidMagic,
}

/// The parts of a BOOTP/DHCPv4 packet the agent cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    /// Client hardware address, formatted like "52:54:0a:00:00:05".
    pub mac: String,
    pub your_ip: Ipv4Addr,
    pub message_type: Option<u8>,
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self, DhcpParseError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(DhcpParseError::TooShort(data.len()));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err(DhcpParseError::InvalidMagic);
        }
        let hlen = usize::from(data[2]).min(16);
        let mac = data[28..28 + hlen]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self {
            op: data[0],
            mac,
            your_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            message_type: find_option(&data[MIN_PACKET_LEN..], OPT_MSG_TYPE)
                .and_then(|v| v.first().copied()),
        })
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == Some(MSG_ACK)
    }
}

fn find_option(mut opts: &[u8], code: u8) -> Option<&[u8]> {
    while let Some((&c, rest)) = opts.split_first() {
        match c {
            OPT_END => return None,
            OPT_PAD => opts = rest,
            _ => {
                let (&len, rest) = rest.split_first()?;
                let len = usize::from(len);
                if rest.len() < len {
                    return None;
                }
                if c == code {
                    return Some(&rest[..len]);
                }
                opts = &rest[len..];
            }
        }
    }
    None
}

/// Converts a request's `dhcp_timeout_ms` into a wait. Zero and negative
/// values mean the caller does not want to wait.
pub fn lease_wait(dhcp_timeout_ms: i64) -> Option<Duration> {
    u64::try_from(dhcp_timeout_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[derive(Clone, Debug)]
pub struct Observed {
    pub interface: String,
    pub packet: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct NetbootOffer {
    pub address: Address,
    pub hostname: String,
    pub subnet: Option<Subnet>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub offer_expires: Instant,
    pub files_expire: Instant,
}

pub struct DhcpMonitor {
    packets: broadcast::Sender<Observed>,
    offers: Mutex<HashMap<String, NetbootOffer>>,
    log: Logger,
}

impl DhcpMonitor {
    pub fn new(log: Logger) -> Self {
        let (packets, _) = broadcast::channel(PACKET_QUEUE_DEPTH);
        Self { packets, offers: Mutex::new(HashMap::new()), log }
    }

    fn offers(&self) -> MutexGuard<'_, HashMap<String, NetbootOffer>> {
        self.offers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feeds one packet seen on `interface` to everyone watching.
    pub fn observe(&self, interface: &str, packet: Vec<u8>) {
        match DhcpPacket::parse(&packet) {
            Ok(p) => debug!(self.log, "DHCP packet";
                            "interface" => interface,
                            "mac" => &p.mac,
                            "type" => ?p.message_type),
            Err(e) => debug!(self.log, "unparseable DHCP packet";
                             "interface" => interface, "error" => %e),
        }
        // No receivers is not an error.
        let _ = self
            .packets
            .send(Observed { interface: interface.to_string(), packet });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Observed> {
        self.packets.subscribe()
    }

    /// Starts listening for acknowledgements sent to `mac`. Take the waiter
    /// before doing whatever provokes the lease so the ACK cannot be missed.
    pub fn ack_waiter(&self, mac: &str) -> AckWaiter {
        AckWaiter { rx: self.subscribe(), mac: mac.to_ascii_lowercase() }
    }

    pub fn publish_netboot_offer(&self, offer: NetbootOffer) {
        let mac = offer.address.mac_address.to_ascii_lowercase();
        info!(self.log, "netboot offer published";
              "mac" => &mac, "hostname" => &offer.hostname);
        self.offers().insert(mac, offer);
    }

    /// The live offer for `mac`, if any. Offers past their expiry are
    /// dropped.
    pub fn netboot_offer(&self, mac: &str) -> Option<NetbootOffer> {
        let mut offers = self.offers();
        let mac = mac.to_ascii_lowercase();
        let now = Instant::now();
        match offers.get(&mac) {
            Some(o) if o.offer_expires > now => Some(o.clone()),
            Some(o) if o.files_expire > now => None,
            Some(_) => {
                offers.remove(&mac);
                None
            }
            None => None,
        }
    }

    /// A file served to a netbooting machine. Files outlive their offer
    /// until their own expiry.
    pub fn netboot_file(&self, mac: &str, name: &str) -> Option<Vec<u8>> {
        let offers = self.offers();
        offers
            .get(&mac.to_ascii_lowercase())
            .filter(|o| o.files_expire > Instant::now())
            .and_then(|o| o.files.get(name).cloned())
    }

    pub fn withdraw_netboot_offer(&self, mac: &str) {
        self.offers().remove(&mac.to_ascii_lowercase());
    }
}

pub struct AckWaiter {
    rx: broadcast::Receiver<Observed>,
    mac: String,
}

impl AckWaiter {
    /// Waits for `count` acknowledgements. Returns false if `timeout`
    /// passed first.
    pub async fn wait(mut self, count: u32, timeout: Duration) -> bool {
        let mut seen = 0;
        let wait = async {
            while seen < count {
                match self.rx.recv().await {
                    Ok(o) => {
                        let acked = DhcpPacket::parse(&o.packet)
                            .is_ok_and(|p| p.is_ack() && p.mac == self.mac);
                        if acked {
                            seen += 1;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
            true
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}
