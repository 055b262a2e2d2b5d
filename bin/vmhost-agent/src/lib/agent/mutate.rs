// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Changes to a VM's descriptor, volumes and snapshots.

use std::net::IpAddr;

use slog::{error, info};
use vmhost_api_types::{
    AddVmVolumesRequest, ChangeOwnersRequest, ChangeVmConsoleTypeRequest,
    ChangeVmCpuPriorityRequest, ChangeVmDestroyProtectionRequest,
    ChangeVmMachineTypeRequest, ChangeVmOwnerGroupsRequest,
    ChangeVmOwnerUsersRequest, ChangeVmSizeRequest, ChangeVmSubnetRequest,
    ChangeVmSubnetResponse, ChangeVmTagsRequest,
    ChangeVmVolumeInterfacesRequest,
    ChangeVmVolumeSizeRequest, ChangeVmWatchdogRequest, DeleteVmVolumeRequest,
    ReorderVmVolumesRequest, RestoreVmFromSnapshotRequest, SnapshotVmRequest,
    VmInfo, VmState, Volume,
};

use super::{Agent, Caller};
use crate::error::AgentError;
use crate::lock::LockMode;
use crate::pool::PoolError;
use crate::storage::Blob;

/// States a snapshot may be taken or restored in when forced.
const FORCEABLE: &[VmState] = &[VmState::Stopped, VmState::Running];

fn valid_snapshot_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Agent {
    /// Applies `f` to an owned VM's descriptor under the VM's exclusive lock.
    async fn change<T>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        required: Option<VmState>,
        f: impl FnOnce(&mut VmInfo) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        if let Some(required) = required {
            if entry.state() != required {
                return Err(AgentError::InvalidState(format!(
                    "VM {addr} is {} but must be {required}",
                    entry.state()
                )));
            }
        }
        self.registry.update(addr, f)
    }

    /// Replaces the users and groups allowed to create VMs on this host.
    pub async fn change_owners(
        &self,
        caller: &Caller,
        req: &ChangeOwnersRequest,
    ) -> Result<(), AgentError> {
        if !caller.is_admin() {
            return Err(AgentError::Unauthorized(
                "only a local administrator may change host owners".to_string(),
            ));
        }
        let _host = self.host_lock(LockMode::Exclusive).await?;
        self.set_host_owners(req.owner_users.clone(), req.owner_groups.clone());
        info!(self.log, "host owners changed";
              "users" => ?req.owner_users, "groups" => ?req.owner_groups);
        Ok(())
    }

    pub async fn change_vm_owner_users(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmOwnerUsersRequest,
    ) -> Result<(), AgentError> {
        let users = req.owner_users.clone();
        self.change(caller, addr, None, |vm| {
            vm.owner_users = users;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_owner_groups(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmOwnerGroupsRequest,
    ) -> Result<(), AgentError> {
        let groups = req.owner_groups.clone();
        self.change(caller, addr, None, |vm| {
            vm.owner_groups = groups;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_tags(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmTagsRequest,
    ) -> Result<(), AgentError> {
        let tags = req.tags.clone();
        self.change(caller, addr, None, |vm| {
            vm.tags = tags;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_cpu_priority(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmCpuPriorityRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, None, |vm| {
            vm.cpu_priority = req.cpu_priority;
            Ok(())
        })
        .await
    }

    /// Resizes a VM. Zero fields are left alone. Growing any dimension
    /// requires the VM to be stopped and the memory to be available.
    pub async fn change_vm_size(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmSizeRequest,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        let vm = &entry.info;
        let grows = req.memory_in_mib > vm.memory_in_mib
            || req.milli_cpus > vm.milli_cpus
            || req.virtual_cpus > vm.virtual_cpus;
        if grows && entry.state() != VmState::Stopped {
            return Err(AgentError::InvalidState(format!(
                "VM {addr} must be stopped to grow"
            )));
        }
        if req.memory_in_mib > vm.memory_in_mib {
            self.check_memory(req.memory_in_mib - vm.memory_in_mib)?;
        }
        if req.virtual_cpus > self.config.capacity.num_cpus {
            return Err(AgentError::ResourceExhausted(format!(
                "{} vCPUs requested but the host has {}",
                req.virtual_cpus, self.config.capacity.num_cpus
            )));
        }
        self.registry.update(addr, |vm| {
            if req.memory_in_mib != 0 {
                vm.memory_in_mib = req.memory_in_mib;
            }
            if req.milli_cpus != 0 {
                vm.milli_cpus = req.milli_cpus;
            }
            if req.virtual_cpus != 0 {
                vm.virtual_cpus = req.virtual_cpus;
            }
            Ok::<_, AgentError>(())
        })
    }

    /// Moves a stopped VM to another subnet. It gets a new address there and
    /// loses its identity.
    pub async fn change_vm_subnet(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmSubnetRequest,
    ) -> Result<ChangeVmSubnetResponse, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, &[VmState::Stopped])?;
        self.check_owner(caller, &info)?;
        if info.subnet_id == req.subnet_id {
            return Err(AgentError::InvalidArgument(format!(
                "VM {addr} is already on subnet {}",
                req.subnet_id
            )));
        }
        let subnet = self
            .pool
            .subnet(&req.subnet_id)
            .ok_or_else(|| PoolError::UnknownSubnet(req.subnet_id.clone()))?;
        if let Some(user) = caller.user.as_deref() {
            if !subnet.allows(user, &caller.groups) {
                return Err(AgentError::Unauthorized(format!(
                    "{user} may not use subnet {}",
                    req.subnet_id
                )));
            }
        }

        let address = self.pool.allocate_primary(&req.subnet_id)?;
        let new = address.ip_address.ok_or(PoolError::MissingIp)?;
        let mut moved = info.clone();
        moved.address = address;
        moved.subnet_id = req.subnet_id.clone();
        moved.identity_name = String::new();
        moved.identity_expires = None;
        let wait = self.config.agent.lock_timeout();
        let _new_lock =
            self.locks.lock_vm(new, LockMode::Exclusive, wait).await?;
        if let Err(e) = self.storage.move_vm(addr, new).await {
            self.pool.release(new);
            return Err(e.into());
        }
        if let Err(e) = self.registry.rekey(addr, moved) {
            if let Err(e) = self.storage.move_vm(new, addr).await {
                error!(self.log, "could not move volumes back";
                       "vm" => %addr, "error" => %e);
            }
            self.pool.release(new);
            return Err(e.into());
        }
        // Secondary addresses were recorded against the old key.
        for a in info.secondary_addresses.iter() {
            if let Some(ip) = a.ip_address {
                self.pool.release(ip);
                self.pool.claim(a, new)?;
            }
        }
        self.pool.release(addr);
        self.tokens.revoke_vm(addr);
        self.metadata.forget(addr);
        self.publish_host_state();
        info!(self.log, "VM moved to new subnet";
              "old" => %addr, "new" => %new, "subnet" => &req.subnet_id);
        Ok(ChangeVmSubnetResponse {
            new_ip_address: new,
            old_identity_name: info.identity_name,
        })
    }

    pub async fn change_vm_console_type(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmConsoleTypeRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, None, |vm| {
            vm.console_type = req.console_type;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_destroy_protection(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmDestroyProtectionRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, None, |vm| {
            vm.destroy_protection = req.destroy_protection;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_machine_type(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmMachineTypeRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, Some(VmState::Stopped), |vm| {
            vm.machine_type = req.machine_type;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_watchdog(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmWatchdogRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, None, |vm| {
            vm.watchdog_action = req.watchdog_action;
            vm.watchdog_model = req.watchdog_model;
            Ok(())
        })
        .await
    }

    pub async fn change_vm_volume_interfaces(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ChangeVmVolumeInterfacesRequest,
    ) -> Result<(), AgentError> {
        self.change(caller, addr, Some(VmState::Stopped), |vm| {
            if req.interfaces.len() != vm.volumes.len() {
                return Err(AgentError::InvalidArgument(format!(
                    "{} interfaces given for {} volumes",
                    req.interfaces.len(),
                    vm.volumes.len()
                )));
            }
            let pairs = vm.volumes.iter_mut().zip(req.interfaces.iter());
            for (volume, interface) in pairs {
                volume.interface = *interface;
            }
            Ok(())
        })
        .await
    }

    /// Grows a volume of a stopped VM.
    pub async fn change_vm_volume_size(
        &self,
        caller: &Caller,
        addr: IpAddr,
        index: u32,
        req: &ChangeVmVolumeSizeRequest,
    ) -> Result<(), AgentError> {
        let index = index as usize;
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, &[VmState::Stopped])?;
        self.check_owner(caller, &info)?;
        let volume = info.volumes.get(index).ok_or_else(|| {
            AgentError::NotFound(format!("VM {addr} has no volume {index}"))
        })?;
        if req.volume_size < volume.size {
            return Err(AgentError::InvalidArgument(format!(
                "volume {index} cannot shrink from {} to {} bytes",
                volume.size, req.volume_size
            )));
        }
        if req.volume_size == volume.size {
            return Ok(());
        }
        let growth = req.volume_size - volume.size;
        self.storage.capacity().await?.check(growth, 0)?;
        let op = self.registry.begin_operation(
            addr,
            "resize volume",
            &[VmState::Stopped],
        )?;
        self.storage
            .set_size(addr, &Blob::Volume(index), req.volume_size)
            .await?;
        op.update(|vm| {
            vm.volumes[index].size = req.volume_size;
            Ok::<_, AgentError>(())
        })
    }

    /// Rearranges the volumes of a stopped VM. The root volume may be
    /// swapped out like any other.
    pub async fn reorder_vm_volumes(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &ReorderVmVolumesRequest,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, &[VmState::Stopped])?;
        self.check_owner(caller, &info)?;
        self.check_token(caller, addr, req.access_token.as_deref())?;

        let order: Vec<usize> =
            req.volume_indices.iter().map(|&i| i as usize).collect();
        let mut seen = vec![false; info.volumes.len()];
        let is_permutation = order.len() == seen.len()
            && order.iter().all(|&i| {
                i < seen.len() && !std::mem::replace(&mut seen[i], true)
            });
        if !is_permutation {
            return Err(AgentError::InvalidArgument(format!(
                "{:?} is not an ordering of {} volumes",
                req.volume_indices,
                info.volumes.len()
            )));
        }

        let op = self.registry.begin_operation(
            addr,
            "reorder volumes",
            &[VmState::Stopped],
        )?;
        self.storage.reorder_volumes(addr, &order).await?;
        op.update(|vm| {
            vm.volumes =
                order.iter().map(|&i| info.volumes[i].clone()).collect();
            Ok::<_, AgentError>(())
        })
    }

    /// Appends empty volumes to a stopped VM.
    pub async fn add_vm_volumes(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &AddVmVolumesRequest,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, &[VmState::Stopped])?;
        self.check_owner(caller, &info)?;
        if req.volume_sizes.is_empty() || req.volume_sizes.contains(&0) {
            return Err(AgentError::InvalidArgument(
                "volume sizes must be given and non-zero".to_string(),
            ));
        }
        self.storage
            .capacity()
            .await?
            .check(req.volume_sizes.iter().sum(), 0)?;

        let op = self.registry.begin_operation(
            addr,
            "add volumes",
            &[VmState::Stopped],
        )?;
        let first = info.volumes.len();
        for (i, &size) in req.volume_sizes.iter().enumerate() {
            self.storage.set_size(addr, &Blob::Volume(first + i), size).await?;
        }
        op.update(|vm| {
            vm.volumes.extend(
                req.volume_sizes
                    .iter()
                    .map(|&size| Volume { size, ..Default::default() }),
            );
            Ok::<_, AgentError>(())
        })
    }

    /// Deletes a secondary volume of a stopped VM. Later volumes move down.
    pub async fn delete_vm_volume(
        &self,
        caller: &Caller,
        addr: IpAddr,
        index: u32,
        req: &DeleteVmVolumeRequest,
    ) -> Result<(), AgentError> {
        let index = index as usize;
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, &[VmState::Stopped])?;
        self.check_owner(caller, &info)?;
        self.check_token(caller, addr, req.access_token.as_deref())?;
        if index == 0 {
            return Err(AgentError::InvalidArgument(
                "the root volume cannot be deleted".to_string(),
            ));
        }
        if index >= info.volumes.len() {
            return Err(AgentError::NotFound(format!(
                "VM {addr} has no volume {index}"
            )));
        }

        let op = self.registry.begin_operation(
            addr,
            "delete volume",
            &[VmState::Stopped],
        )?;
        self.storage.delete_volume(addr, index).await?;
        op.update(|vm| {
            vm.volumes.remove(index);
            Ok::<_, AgentError>(())
        })
    }

    /// Takes a named snapshot of a VM's volumes, or of the root volume only.
    pub async fn snapshot_vm(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &SnapshotVmRequest,
    ) -> Result<(), AgentError> {
        if !valid_snapshot_name(&req.name) {
            return Err(AgentError::InvalidArgument(format!(
                "invalid snapshot name {:?}",
                req.name
            )));
        }
        let force = req.force_if_not_stopped;
        let (info, op) =
            self.begin_snapshot_op(caller, addr, "snapshot", force).await?;
        let count = if req.root_only {
            info.volumes.len().min(1)
        } else {
            info.volumes.len()
        };
        let clash = info.volumes[..count]
            .iter()
            .position(|v| v.snapshots.contains_key(&req.name));
        if let Some(i) = clash {
            return Err(AgentError::InvalidArgument(format!(
                "volume {i} already has a snapshot named {}",
                req.name
            )));
        }

        let mut sizes = Vec::with_capacity(count);
        for index in 0..count {
            let snapshot = Blob::Snapshot { index, name: req.name.clone() };
            let copied =
                self.storage.copy(addr, &Blob::Volume(index), &snapshot).await;
            if let Err(e) = copied {
                for taken in 0..index {
                    let taken =
                        Blob::Snapshot { index: taken, name: req.name.clone() };
                    self.remove_blob_logged(addr, &taken).await;
                }
                return Err(e.into());
            }
            sizes.push(self.storage.size(addr, &snapshot).await?);
        }
        op.update(|vm| {
            for (volume, size) in vm.volumes.iter_mut().zip(sizes) {
                volume.snapshots.insert(req.name.clone(), size);
            }
            Ok::<_, AgentError>(())
        })?;
        info!(self.log, "snapshot taken";
              "vm" => %addr, "name" => &req.name, "volumes" => count);
        Ok(())
    }

    /// Copies a snapshot back over every volume that has one by that name.
    /// The snapshot is kept.
    pub async fn restore_vm_from_snapshot(
        &self,
        caller: &Caller,
        addr: IpAddr,
        name: &str,
        req: &RestoreVmFromSnapshotRequest,
    ) -> Result<(), AgentError> {
        let force = req.force_if_not_stopped;
        let (info, op) =
            self.begin_snapshot_op(caller, addr, "restore", force).await?;
        let holders = snapshot_holders(&info, addr, name)?;
        let mut sizes = Vec::with_capacity(holders.len());
        for &index in holders.iter() {
            let snapshot = Blob::Snapshot { index, name: name.to_string() };
            self.storage.copy(addr, &snapshot, &Blob::Volume(index)).await?;
            let size = self.storage.size(addr, &Blob::Volume(index)).await?;
            sizes.push((index, size));
        }
        op.update(|vm| {
            for (index, size) in sizes {
                vm.volumes[index].size = size;
            }
            Ok::<_, AgentError>(())
        })?;
        info!(self.log, "snapshot restored"; "vm" => %addr, "name" => name);
        Ok(())
    }

    pub async fn discard_vm_snapshot(
        &self,
        caller: &Caller,
        addr: IpAddr,
        name: &str,
    ) -> Result<(), AgentError> {
        let (info, op) = self
            .begin_snapshot_op(caller, addr, "discard snapshot", true)
            .await?;
        let holders = snapshot_holders(&info, addr, name)?;
        for &index in holders.iter() {
            let snapshot = Blob::Snapshot { index, name: name.to_string() };
            self.storage.remove(addr, &snapshot).await?;
        }
        op.update(|vm| {
            for volume in vm.volumes.iter_mut() {
                volume.snapshots.remove(name);
            }
            Ok::<_, AgentError>(())
        })
    }

    async fn begin_snapshot_op(
        &self,
        caller: &Caller,
        addr: IpAddr,
        op: &'static str,
        force: bool,
    ) -> Result<(VmInfo, crate::vm::OperationGuard), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let allowed = if force { FORCEABLE } else { &[VmState::Stopped][..] };
        let info = self.vm_in(addr, allowed)?;
        self.check_owner(caller, &info)?;
        let guard = self.registry.begin_operation(addr, op, allowed)?;
        Ok((info, guard))
    }
}

/// Indices of the volumes holding snapshot `name`.
fn snapshot_holders(
    info: &VmInfo,
    addr: IpAddr,
    name: &str,
) -> Result<Vec<usize>, AgentError> {
    let holders: Vec<usize> = info
        .volumes
        .iter()
        .enumerate()
        .filter(|(_, v)| v.snapshots.contains_key(name))
        .map(|(i, _)| i)
        .collect();
    if holders.is_empty() {
        return Err(AgentError::NotFound(format!(
            "VM {addr} has no snapshot {name}"
        )));
    }
    Ok(holders)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::test::{harness, resident_vm, subnet};
    use crate::error::ErrorKind;
    use tokio::io::AsyncReadExt;
    use vmhost_api_types::{Address, StopVmRequest, VolumeInterface};

    async fn read_blob(
        h: &crate::agent::test::Harness,
        ip: IpAddr,
        blob: &Blob,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = h.agent.storage.open(ip, blob).await.unwrap();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn snapshot_names() {
        assert!(valid_snapshot_name("pre-upgrade_2"));
        assert!(!valid_snapshot_name(""));
        assert!(!valid_snapshot_name("a/b"));
        assert!(!valid_snapshot_name("two words"));
    }

    #[tokio::test]
    async fn owners_gate_changes() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let tags = [("role".to_string(), "db".to_string())].into();
        let req = ChangeVmTagsRequest { tags };
        let bob = Caller::user("bob", &[]);
        let err = h.agent.change_vm_tags(&bob, ip, &req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let alice = Caller::user("alice", &[]);
        h.agent.change_vm_tags(&alice, ip, &req).await.unwrap();
        let vm = h.agent.registry.lookup(ip).unwrap().info;
        assert_eq!(vm.tags["role"], "db");

        let owner_groups = vec!["ops".to_string()];
        let groups = ChangeVmOwnerGroupsRequest { owner_groups };
        let admin = Caller::admin();
        h.agent.change_vm_owner_groups(&admin, ip, &groups).await.unwrap();
        let priority = ChangeVmCpuPriorityRequest { cpu_priority: 5 };
        let ops = Caller::user("bob", &["ops"]);
        h.agent.change_vm_cpu_priority(&ops, ip, &priority).await.unwrap();
        assert_eq!(h.agent.registry.lookup(ip).unwrap().info.cpu_priority, 5);
    }

    #[tokio::test]
    async fn change_owners_needs_admin() {
        let h = harness();
        let req = ChangeOwnersRequest {
            owner_groups: vec![],
            owner_users: vec!["alice".to_string()],
        };
        let alice = Caller::user("alice", &[]);
        assert!(h.agent.change_owners(&alice, &req).await.is_err());
        h.agent.change_owners(&Caller::admin(), &req).await.unwrap();
        assert!(h.agent.check_host_owner(&Caller::user("bob", &[])).is_err());
    }

    #[tokio::test]
    async fn growing_needs_stopped() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let admin = Caller::admin();
        let grow =
            ChangeVmSizeRequest { memory_in_mib: 1024, ..Default::default() };
        let err = h.agent.change_vm_size(&admin, ip, &grow).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let shrink =
            ChangeVmSizeRequest { memory_in_mib: 256, ..Default::default() };
        h.agent.change_vm_size(&admin, ip, &shrink).await.unwrap();
        let vm = h.agent.registry.lookup(ip).unwrap().info;
        assert_eq!(vm.memory_in_mib, 256);
        assert_eq!(vm.virtual_cpus, 1);

        h.agent.stop_vm(&admin, ip, &StopVmRequest::default()).await.unwrap();
        let huge =
            ChangeVmSizeRequest { memory_in_mib: 8192, ..Default::default() };
        let err = h.agent.change_vm_size(&admin, ip, &huge).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        h.agent.change_vm_size(&admin, ip, &grow).await.unwrap();
    }

    #[tokio::test]
    async fn subnet_change_rekeys() {
        let h = harness();
        let mut other = subnet();
        other.id = "s1".to_string();
        other.ip_gateway = "10.1.0.1".parse().unwrap();
        h.agent.pool.update_subnets(vec![other], vec![], vec![]).unwrap();
        let spare = Address {
            ip_address: Some("10.1.0.9".parse().unwrap()),
            mac_address: String::new(),
        };
        h.agent
            .pool
            .change_pool(&[spare], &[], &Default::default())
            .unwrap();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        h.agent
            .registry
            .update(ip, |vm| {
                vm.identity_name = "vm-5".to_string();
                Ok::<_, AgentError>(())
            })
            .unwrap();

        let req = ChangeVmSubnetRequest { subnet_id: "s1".to_string() };
        let resp =
            h.agent.change_vm_subnet(&Caller::admin(), ip, &req).await.unwrap();
        let new: IpAddr = "10.1.0.9".parse().unwrap();
        assert_eq!(resp.new_ip_address, new);
        assert_eq!(resp.old_identity_name, "vm-5");
        assert!(!h.agent.registry.contains(ip));
        let moved = h.agent.registry.lookup(new).unwrap().info;
        assert_eq!(moved.subnet_id, "s1");
        assert!(moved.identity_name.is_empty());
        assert_eq!(read_blob(&h, new, &Blob::Volume(0)).await, b"root");
        assert_eq!(h.agent.pool.slot(ip), Some(crate::pool::Slot::Free));
        assert_eq!(
            h.agent.pool.slot(new),
            Some(crate::pool::Slot::UsedBy(new))
        );
    }

    #[tokio::test]
    async fn volume_management() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let admin = Caller::admin();

        let add = AddVmVolumesRequest { volume_sizes: vec![16, 32] };
        h.agent.add_vm_volumes(&admin, ip, &add).await.unwrap();
        let sizes = |h: &crate::agent::test::Harness| -> Vec<u64> {
            let vm = h.agent.registry.lookup(ip).unwrap().info;
            vm.volumes.iter().map(|v| v.size).collect()
        };
        assert_eq!(sizes(&h), [4, 16, 32]);

        let shrink = ChangeVmVolumeSizeRequest { volume_size: 8 };
        let err = h
            .agent
            .change_vm_volume_size(&admin, ip, 1, &shrink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let grow = ChangeVmVolumeSizeRequest { volume_size: 64 };
        h.agent.change_vm_volume_size(&admin, ip, 1, &grow).await.unwrap();
        let size = h.agent.storage.size(ip, &Blob::Volume(1)).await.unwrap();
        assert_eq!(size, 64);

        let bad = ReorderVmVolumesRequest {
            access_token: None,
            volume_indices: vec![0, 0, 1],
        };
        assert!(h.agent.reorder_vm_volumes(&admin, ip, &bad).await.is_err());
        let order = ReorderVmVolumesRequest {
            access_token: None,
            volume_indices: vec![2, 0, 1],
        };
        h.agent.reorder_vm_volumes(&admin, ip, &order).await.unwrap();
        assert_eq!(sizes(&h), [32, 4, 64]);
        assert_eq!(read_blob(&h, ip, &Blob::Volume(1)).await, b"root");

        let err = h
            .agent
            .delete_vm_volume(&admin, ip, 0, &DeleteVmVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let delete = DeleteVmVolumeRequest::default();
        h.agent.delete_vm_volume(&admin, ip, 1, &delete).await.unwrap();
        assert_eq!(sizes(&h), [32, 64]);
        let size = h.agent.storage.size(ip, &Blob::Volume(1)).await.unwrap();
        assert_eq!(size, 64);

        let interfaces = ChangeVmVolumeInterfacesRequest {
            interfaces: vec![VolumeInterface::default(); 2],
        };
        h.agent
            .change_vm_volume_interfaces(&admin, ip, &interfaces)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_a_volume_needs_a_token() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let alice = Caller::user("alice", &[]);
        let err = h
            .agent
            .delete_vm_volume(&alice, ip, 1, &DeleteVmVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn snapshot_restore_discard() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Running).await;
        let admin = Caller::admin();
        let req = SnapshotVmRequest {
            name: "before".to_string(),
            root_only: true,
            force_if_not_stopped: false,
        };
        let err = h.agent.snapshot_vm(&admin, ip, &req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let forced =
            SnapshotVmRequest { force_if_not_stopped: true, ..req.clone() };
        h.agent.snapshot_vm(&admin, ip, &forced).await.unwrap();
        let vm = h.agent.registry.lookup(ip).unwrap().info;
        assert_eq!(vm.volumes[0].snapshots["before"], 4);
        assert!(h.agent.snapshot_vm(&admin, ip, &forced).await.is_err());

        h.agent.stop_vm(&admin, ip, &StopVmRequest::default()).await.unwrap();
        let mut w = h.agent.storage.create(ip, &Blob::Volume(0)).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut w, b"changed!").await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut w).await.unwrap();

        let restore = RestoreVmFromSnapshotRequest::default();
        h.agent
            .restore_vm_from_snapshot(&admin, ip, "before", &restore)
            .await
            .unwrap();
        assert_eq!(read_blob(&h, ip, &Blob::Volume(0)).await, b"root");

        h.agent.discard_vm_snapshot(&admin, ip, "before").await.unwrap();
        let vm = h.agent.registry.lookup(ip).unwrap().info;
        assert!(vm.volumes[0].snapshots.is_empty());
        let err = h
            .agent
            .discard_vm_snapshot(&admin, ip, "before")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn operation_marker_blocks_other_changes() {
        let h = harness();
        let ip = resident_vm(&h, "10.0.0.5", VmState::Stopped).await;
        let admin = Caller::admin();
        let (_, _op) = h
            .agent
            .begin_snapshot_op(&admin, ip, "snapshot", false)
            .await
            .unwrap();
        let err = h
            .agent
            .change_vm_tags(&admin, ip, &ChangeVmTagsRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }
}
