// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the vmhost-agent API

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rpc;
pub mod update;

pub use rpc::*;
pub use update::{HostView, Update, VmChange};

/// Lifecycle state of a VM resident on a host.
///
/// The discriminants are part of the wire contract: `ignore_state_mask`
/// filters select states by `1 << discriminant`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u8)]
pub enum VmState {
    #[default]
    Starting = 0,
    Running = 1,
    FailedToStart = 2,
    Stopping = 3,
    Stopped = 4,
    Destroying = 5,
    Migrating = 6,
    Exporting = 7,
    Crashed = 8,
    Debugging = 9,
}

impl VmState {
    pub const ALL: [VmState; 10] = [
        VmState::Starting,
        VmState::Running,
        VmState::FailedToStart,
        VmState::Stopping,
        VmState::Stopped,
        VmState::Destroying,
        VmState::Migrating,
        VmState::Exporting,
        VmState::Crashed,
        VmState::Debugging,
    ];

    /// The bit selecting this state in an `ignore_state_mask`.
    pub fn mask_bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::FailedToStart => "failed to start",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Destroying => "destroying",
            VmState::Migrating => "migrating",
            VmState::Exporting => "exporting",
            VmState::Crashed => "crashed",
            VmState::Debugging => "debugging",
        };
        f.write_str(s)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum ConsoleType {
    #[default]
    None,
    Dummy,
    Vnc,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum FirmwareType {
    #[default]
    Default,
    Bios,
    Uefi,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum MachineType {
    #[default]
    GenericPc,
    Q35,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum VolumeFormat {
    #[default]
    Raw,
    Qcow2,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum VolumeInterface {
    #[default]
    VirtIo,
    Ide,
    Nvme,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum VolumeType {
    #[default]
    Persistent,
    Memory,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum WatchdogAction {
    #[default]
    None,
    Reset,
    Shutdown,
    PowerOff,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum WatchdogModel {
    #[default]
    None,
    Ib700,
    I6300esb,
}

/// A network address: an IP address and the MAC address of the interface it
/// is bound to.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct Address {
    pub ip_address: Option<IpAddr>,
    pub mac_address: String,
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct Volume {
    pub format: VolumeFormat,
    pub interface: VolumeInterface,
    pub size: u64,
    /// Named snapshots of this volume, with the size of each.
    pub snapshots: BTreeMap<String, u64>,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct PatchLog {
    pub patched_on: DateTime<Utc>,
    pub lines: Vec<String>,
}

/// Descriptive and configuration snapshot of a VM.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct VmInfo {
    pub address: Address,
    pub changed_state_on: Option<DateTime<Utc>>,
    pub console_type: ConsoleType,
    pub created_on: Option<DateTime<Utc>>,
    pub cpu_priority: i32,
    pub destroy_on_powerdown: bool,
    pub destroy_protection: bool,
    pub disable_virtio: bool,
    pub extra_kernel_options: String,
    pub firmware_type: FirmwareType,
    pub hostname: String,
    pub identity_expires: Option<DateTime<Utc>>,
    pub identity_name: String,
    pub image_name: String,
    pub image_url: String,
    pub last_patch: Option<PatchLog>,
    pub machine_type: MachineType,
    pub memory_in_mib: u64,
    pub milli_cpus: u32,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub root_file_system_label: String,
    pub spread_volumes: bool,
    pub state: VmState,
    pub secondary_addresses: Vec<Address>,
    pub secondary_subnet_ids: Vec<String>,
    pub subnet_id: String,
    pub tags: BTreeMap<String, String>,
    pub uncommitted: bool,
    pub virtual_cpus: u32,
    pub volumes: Vec<Volume>,
    pub watchdog_action: WatchdogAction,
    pub watchdog_model: WatchdogModel,
}

impl VmInfo {
    /// Returns true if `user` or any of `groups` owns this VM.
    pub fn is_owned_by(&self, user: &str, groups: &[String]) -> bool {
        self.owner_users.iter().any(|u| u == user)
            || self.owner_groups.iter().any(|g| groups.contains(g))
    }

    /// Returns true if every tag named in `matcher` has one of the accepted
    /// values. An empty matcher matches every VM.
    pub fn matches_tags(&self, matcher: &MatchTags) -> bool {
        matcher.iter().all(|(key, accepted)| {
            self.tags.get(key).is_some_and(|value| {
                accepted.is_empty() || accepted.contains(value)
            })
        })
    }
}

/// Tag name to the set of accepted values. An empty value set accepts any
/// value as long as the tag is present.
pub type MatchTags = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetError {
    #[error("gateway {0} and mask {1} are not the same address family")]
    FamilyMismatch(IpAddr, IpAddr),

    #[error("subnet id must not be empty")]
    EmptyId,

    #[error("dynamic range {0}..={1} lies outside the subnet")]
    DynamicRange(IpAddr, IpAddr),
}

#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct Subnet {
    pub id: String,
    pub ip_gateway: IpAddr,
    pub ip_mask: IpAddr,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub domain_name_servers: Vec<IpAddr>,
    #[serde(default)]
    pub disable_metadata: bool,
    #[serde(default)]
    pub manage: bool,
    #[serde(default)]
    pub vlan_id: u32,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub first_dynamic_ip: Option<IpAddr>,
    #[serde(default)]
    pub last_dynamic_ip: Option<IpAddr>,
}

impl Subnet {
    /// Returns true if `addr` falls within the network described by the
    /// gateway and mask.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip_gateway, self.ip_mask, addr) {
            (IpAddr::V4(gw), IpAddr::V4(mask), IpAddr::V4(a)) => {
                let mask = u32::from(mask);
                u32::from(gw) & mask == u32::from(a) & mask
            }
            (IpAddr::V6(gw), IpAddr::V6(mask), IpAddr::V6(a)) => {
                let mask = u128::from(mask);
                u128::from(gw) & mask == u128::from(a) & mask
            }
            _ => false,
        }
    }

    /// Checks the internal consistency of an administratively supplied
    /// subnet.
    pub fn validate(&self) -> Result<(), SubnetError> {
        if self.id.is_empty() {
            return Err(SubnetError::EmptyId);
        }
        if self.ip_gateway.is_ipv4() != self.ip_mask.is_ipv4() {
            return Err(SubnetError::FamilyMismatch(
                self.ip_gateway,
                self.ip_mask,
            ));
        }
        if let (Some(first), Some(last)) =
            (self.first_dynamic_ip, self.last_dynamic_ip)
        {
            if !self.contains(first) || !self.contains(last) {
                return Err(SubnetError::DynamicRange(first, last));
            }
        }
        Ok(())
    }

    /// Returns true if the user or one of the groups may place VMs here. A
    /// subnet with no allow lists is open to everyone.
    pub fn allows(&self, user: &str, groups: &[String]) -> bool {
        if self.allowed_users.is_empty() && self.allowed_groups.is_empty() {
            return true;
        }
        self.allowed_users.iter().any(|u| u == user)
            || self.allowed_groups.iter().any(|g| groups.contains(g))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subnet(gw: &str, mask: &str) -> Subnet {
        Subnet {
            id: "s0".to_string(),
            ip_gateway: gw.parse().unwrap(),
            ip_mask: mask.parse().unwrap(),
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

    #[test]
    fn subnet_membership() {
        let s = subnet("10.2.0.1", "255.255.255.0");
        assert!(s.contains("10.2.0.77".parse().unwrap()));
        assert!(!s.contains("10.2.1.77".parse().unwrap()));
        assert!(!s.contains("fd00::1".parse().unwrap()));

        let s6 = subnet("fd00::1", "ffff:ffff:ffff:ffff::");
        assert!(s6.contains("fd00::abcd".parse().unwrap()));
        assert!(!s6.contains("fd01::abcd".parse().unwrap()));
    }

    #[test]
    fn subnet_validation() {
        let mut s = subnet("10.2.0.1", "ffff::");
        assert!(matches!(s.validate(), Err(SubnetError::FamilyMismatch(..))));

        s.ip_mask = "255.255.255.0".parse().unwrap();
        s.first_dynamic_ip = Some("10.2.0.10".parse().unwrap());
        s.last_dynamic_ip = Some("10.3.0.10".parse().unwrap());
        assert!(matches!(s.validate(), Err(SubnetError::DynamicRange(..))));

        s.last_dynamic_ip = Some("10.2.0.200".parse().unwrap());
        assert_eq!(s.validate(), Ok(()));
    }

    #[test]
    fn state_mask_bits_follow_wire_numbering() {
        assert_eq!(VmState::Starting.mask_bit(), 1);
        assert_eq!(VmState::Stopped.mask_bit(), 1 << 4);
        assert_eq!(VmState::Debugging.mask_bit(), 1 << 9);
    }

    #[test]
    fn tag_matching() {
        let mut vm = VmInfo::default();
        vm.tags.insert("role".to_string(), "db".to_string());

        assert!(vm.matches_tags(&MatchTags::new()));

        let mut m = MatchTags::new();
        m.insert("role".to_string(), vec!["web".into(), "db".into()]);
        assert!(vm.matches_tags(&m));

        m.insert("zone".to_string(), vec![]);
        assert!(!vm.matches_tags(&m));
    }

    #[test]
    fn vm_info_accepts_sparse_json() {
        let vm: VmInfo =
            serde_json::from_str(r#"{"hostname":"web0","memory_in_mib":512}"#)
                .unwrap();
        assert_eq!(vm.hostname, "web0");
        assert_eq!(vm.state, VmState::Starting);
        assert!(vm.volumes.is_empty());
    }
}
