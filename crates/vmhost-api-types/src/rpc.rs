// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response bodies for the agent's RPC surface.
//!
//! Streamed calls exchange these bodies as JSON text frames over a websocket.
//! Bulk payloads (image data, user data, volume data) follow their declaring
//! message as binary frames, in the declared order and with the declared
//! lengths. Every multi-response call marks exactly one response as `final`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    Address, ConsoleType, MachineType, MatchTags, Subnet, VmInfo, Volume,
    VolumeInterface, WatchdogAction, WatchdogModel,
};

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct VmPathParams {
    pub ip_address: IpAddr,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct VolumePathParams {
    pub ip_address: IpAddr,
    pub volume_index: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SnapshotPathParams {
    pub ip_address: IpAddr,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SerialPortPathParams {
    pub ip_address: IpAddr,
    pub port_number: u32,
}

// Lifecycle

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CreateVmRequest {
    /// <0: no DHCP; 0: do not wait; >0: wait this many milliseconds for the
    /// guest to acquire its lease.
    pub dhcp_timeout_ms: i64,
    pub do_not_start: bool,
    /// Length of the root image, sent as binary frames after this request.
    pub image_data_size: u64,
    pub minimum_free_bytes: u64,
    pub secondary_volumes: Vec<Volume>,
    /// If set, the contents of each secondary volume follow the user data.
    pub secondary_volumes_data: bool,
    pub skip_memory_check: bool,
    /// Length of the user data, sent after the image.
    pub user_data_size: u64,
    pub vm_info: VmInfo,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CreateVmResponse {
    pub dhcp_timed_out: bool,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub ip_address: Option<IpAddr>,
    pub progress_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StartVmRequest {
    pub access_token: Option<String>,
    pub dhcp_timeout_ms: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct StartVmResponse {
    pub dhcp_timed_out: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StopVmRequest {
    pub access_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RebootVmRequest {
    pub dhcp_timeout_ms: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct RebootVmResponse {
    pub dhcp_timed_out: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct DestroyVmRequest {
    pub access_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ImportLocalVmRequest {
    pub skip_memory_check: bool,
    pub vm_info: VmInfo,
    /// Files to adopt as the VM's volumes, root volume first.
    pub volume_filenames: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct LocalVolume {
    pub directory_to_cleanup: String,
    pub filename: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ExportLocalVmInfo {
    pub vm_info: VmInfo,
    pub volume_locations: Vec<LocalVolume>,
}

// Mutation

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ChangeOwnersRequest {
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmOwnerUsersRequest {
    pub owner_users: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmOwnerGroupsRequest {
    pub owner_groups: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmTagsRequest {
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmCpuPriorityRequest {
    pub cpu_priority: i32,
}

/// A zero field leaves that dimension unchanged.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ChangeVmSizeRequest {
    pub memory_in_mib: u64,
    pub milli_cpus: u32,
    pub virtual_cpus: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmSubnetRequest {
    pub subnet_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmSubnetResponse {
    pub new_ip_address: IpAddr,
    pub old_identity_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmConsoleTypeRequest {
    pub console_type: ConsoleType,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmDestroyProtectionRequest {
    pub destroy_protection: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmMachineTypeRequest {
    pub machine_type: MachineType,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmWatchdogRequest {
    pub watchdog_action: WatchdogAction,
    pub watchdog_model: WatchdogModel,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmVolumeInterfacesRequest {
    pub interfaces: Vec<VolumeInterface>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChangeVmVolumeSizeRequest {
    pub volume_size: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ReorderVmVolumesRequest {
    pub access_token: Option<String>,
    pub volume_indices: Vec<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct AddVmVolumesRequest {
    pub volume_sizes: Vec<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct DeleteVmVolumeRequest {
    pub access_token: Option<String>,
}

// Snapshots

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct SnapshotVmRequest {
    pub force_if_not_stopped: bool,
    pub name: String,
    pub root_only: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RestoreVmFromSnapshotRequest {
    pub force_if_not_stopped: bool,
}

// Migration

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct MigrateVmRequest {
    pub access_token: String,
    #[serde(default)]
    pub dhcp_timeout_ms: i64,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub skip_memory_check: bool,
    /// Address (host:port) of the agent currently running the VM.
    pub source_hypervisor: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct MigrateVmResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub progress_message: String,
    /// The destination holds a complete copy and awaits a decision.
    pub request_commit: bool,
}

/// The driving caller's decision, sent in reply to `request_commit`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct MigrateVmResponseResponse {
    pub commit: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PrepareVmForMigrationRequest {
    pub access_token: Option<String>,
    /// True marks the VM as available to migrate out; false disables it.
    pub enable: bool,
}

/// Settles a migration this host sent out whose outcome it never learned.
/// `commit` says the destination kept the VM; false takes it back here.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ResolveVmMigrationRequest {
    pub commit: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct CopyVmRequest {
    pub access_token: String,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub skip_memory_check: bool,
    pub source_hypervisor: String,
    /// Overrides for the copy. An empty subnet selects the source's subnet;
    /// an empty hostname keeps the source's.
    #[serde(default)]
    pub vm_info: VmInfo,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CopyVmResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub ip_address: Option<IpAddr>,
    pub progress_message: String,
}

// Image and user data

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ReplaceVmImageRequest {
    pub dhcp_timeout_ms: i64,
    pub image_data_size: u64,
    pub minimum_free_bytes: u64,
    pub skip_backup: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PatchVmImageRequest {
    pub image_name: String,
    pub image_timeout_ms: u64,
    pub skip_backup: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct DebugVmImageRequest {
    pub dhcp_timeout_ms: i64,
    pub image_data_size: u64,
    pub minimum_free_bytes: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ReplaceVmUserDataRequest {
    pub size: u64,
}

/// Progress frame shared by the image and user-data streams.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ImageProgressResponse {
    pub dhcp_timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub progress_message: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct GetVmUserDataRequest {
    pub access_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GetVmUserDataResponse {
    pub data: Vec<u8>,
}

// Access control

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GetVmAccessTokenRequest {
    pub lifetime_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetVmAccessTokenResponse {
    pub token: String,
    pub expires: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct DiscardVmAccessTokenRequest {
    pub access_token: String,
}

// Locking

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct HoldLockRequest {
    /// Bounds both the wait for the lock and how long it is then held.
    pub timeout_ms: u64,
    pub write_lock: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct HoldLockResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

// Networking

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ChangeAddressPoolRequest {
    pub addresses_to_add: Vec<Address>,
    pub addresses_to_remove: Vec<Address>,
    /// Per-subnet cap on idle addresses.
    pub maximum_free_addresses: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RegisterExternalLeasesRequest {
    pub addresses: Vec<Address>,
    /// Parallel to `addresses`; may be shorter.
    pub hostnames: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ListSubnetsRequest {
    pub sort: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ListSubnetsResponse {
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct UpdateSubnetsRequest {
    pub add: Vec<Subnet>,
    pub change: Vec<Subnet>,
    pub delete: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct NetbootMachineRequest {
    pub address: Address,
    pub files: BTreeMap<String, Vec<u8>>,
    pub files_expiration_secs: u64,
    pub hostname: String,
    pub num_acknowledgements_to_wait_for: u32,
    pub offer_expiration_secs: u64,
    /// Needed only when the machine is on a subnet this host does not know.
    pub subnet: Option<Subnet>,
    pub wait_timeout_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct WatchDhcpRequest {
    /// Empty watches every interface.
    pub interface: String,
    /// Zero means no limit.
    pub max_packets: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct WatchDhcpResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub interface: String,
    pub packet: Vec<u8>,
}

// Introspection

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct GetVmInfosRequest {
    pub ignore_state_mask: u64,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub vm_tags_to_match: MatchTags,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GetVmInfosResponse {
    pub vms: Vec<VmInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ListVMsRequest {
    pub ignore_state_mask: u64,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub sort: bool,
    pub vm_tags_to_match: MatchTags,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ListVMsResponse {
    pub ip_addresses: Vec<IpAddr>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    JsonSchema,
)]
pub struct GetCapacityResponse {
    pub memory_in_mib: u64,
    pub num_cpus: u32,
    pub total_volume_bytes: u64,
}

/// Sent by a watcher up its update stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct GetUpdatesRequest {
    pub register_external_leases: Option<RegisterExternalLeasesRequest>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ScanVmRootRequest {
    /// Paths under any of these prefixes are left out of the scan.
    pub exclude_prefixes: Vec<String>,
}

#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    JsonSchema,
)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
}

#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    JsonSchema,
)]
pub struct FileSystemScan {
    pub entries: Vec<FileEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ScanVmRootResponse {
    pub file_system: FileSystemScan,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ProbeVmPortRequest {
    pub port_number: u16,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ProbeVmPortResponse {
    pub port_is_open: bool,
}

/// First frame of a trace or pass-through stream. When `error` is absent
/// the channel carries the stream's payload from then on.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StreamHandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One guest request to the metadata service, as seen by a trace.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct MetadataAccessEvent {
    pub path: String,
    pub at: DateTime<Utc>,
}

// Host feeds

/// A DHCP packet seen on one of the host's interfaces.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ObserveDhcpPacketRequest {
    pub interface: String,
    pub packet: Vec<u8>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct RecordMetadataAccessRequest {
    pub path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NetbootFilePathParams {
    pub mac_address: String,
    pub name: String,
}
