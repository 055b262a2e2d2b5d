// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-subnet bookkeeping of the addresses this host may hand out.
//!
//! Every address the pool knows about sits in exactly one [`Slot`]: free,
//! used by a VM, or leased to something outside the agent's control. The
//! slot is a single enum per address, so the three partitions cannot
//! overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use slog::{info, warn, Logger};
use thiserror::Error;
use vmhost_api_types::{Address, Subnet, SubnetError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Free,
    /// In use by the VM with this primary address (which may be the address
    /// itself).
    UsedBy(IpAddr),
    /// Observed in use outside VM creation, by the named host.
    Leased(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    pub subnet_id: String,
    pub mac: String,
    pub slot: Slot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no free addresses in subnet {0}")]
    Exhausted(String),

    #[error("unknown subnet {0}")]
    UnknownSubnet(String),

    #[error("address {0} is not in any known subnet")]
    NoSubnetFor(IpAddr),

    #[error("address {0} is not free")]
    NotFree(IpAddr),

    #[error("address {0} is in use and cannot be removed")]
    InUse(IpAddr),

    #[error("subnet {0} still has addresses in use")]
    SubnetInUse(String),

    #[error("subnet {0} already exists")]
    DuplicateSubnet(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(#[from] SubnetError),

    #[error("address entry has no IP address")]
    MissingIp,
}

/// Derives a locally administered MAC address from an IP address.
pub fn mac_for(addr: IpAddr) -> String {
    let tail: [u8; 4] = match addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[12], o[13], o[14], o[15]]
        }
    };
    format!(
        "52:54:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3]
    )
}

#[derive(Default)]
struct PoolState {
    subnets: BTreeMap<String, Subnet>,
    entries: BTreeMap<IpAddr, PoolEntry>,
    max_free: BTreeMap<String, u32>,
}

impl PoolState {
    fn subnet_for(&self, addr: IpAddr) -> Option<&Subnet> {
        self.subnets.values().find(|s| s.contains(addr))
    }

    fn find_free(&self, subnet_id: &str) -> Option<IpAddr> {
        self.entries
            .iter()
            .find(|(_, e)| e.subnet_id == subnet_id && e.slot == Slot::Free)
            .map(|(a, _)| *a)
    }

    fn take(
        &mut self,
        subnet_id: &str,
        user: Option<IpAddr>,
    ) -> Result<Address, PoolError> {
        if !self.subnets.contains_key(subnet_id) {
            return Err(PoolError::UnknownSubnet(subnet_id.to_string()));
        }
        let addr = self
            .find_free(subnet_id)
            .ok_or_else(|| PoolError::Exhausted(subnet_id.to_string()))?;
        let entry = self
            .entries
            .get_mut(&addr)
            .ok_or_else(|| PoolError::Exhausted(subnet_id.to_string()))?;
        entry.slot = Slot::UsedBy(user.unwrap_or(addr));
        Ok(Address { ip_address: Some(addr), mac_address: entry.mac.clone() })
    }

    /// Drops free addresses beyond each subnet's cap, highest first.
    fn trim(&mut self, log: &Logger) {
        for (subnet_id, cap) in self.max_free.iter() {
            let free: Vec<IpAddr> = self
                .entries
                .iter()
                .filter(|(_, e)| &e.subnet_id == subnet_id)
                .filter(|(_, e)| e.slot == Slot::Free)
                .map(|(a, _)| *a)
                .collect();
            let excess = free.len().saturating_sub(*cap as usize);
            for addr in free.iter().rev().take(excess) {
                self.entries.remove(addr);
            }
            if excess > 0 {
                info!(log, "released excess free addresses";
                      "subnet" => subnet_id, "count" => excess);
            }
        }
    }
}

pub struct AddressPool {
    inner: Mutex<PoolState>,
    log: Logger,
}

impl AddressPool {
    pub fn new(subnets: Vec<Subnet>, log: Logger) -> Self {
        let state = PoolState {
            subnets: subnets.into_iter().map(|s| (s.id.clone(), s)).collect(),
            ..Default::default()
        };
        Self { inner: Mutex::new(state), log }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.state().subnets.values().cloned().collect()
    }

    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        self.state().subnets.get(id).cloned()
    }

    pub fn subnet_for(&self, addr: IpAddr) -> Option<Subnet> {
        self.state().subnet_for(addr).cloned()
    }

    pub fn slot(&self, addr: IpAddr) -> Option<Slot> {
        self.state().entries.get(&addr).map(|e| e.slot.clone())
    }

    /// Applies a batch of subnet changes. Either every change is applied or
    /// none is.
    pub fn update_subnets(
        &self,
        add: Vec<Subnet>,
        change: Vec<Subnet>,
        delete: Vec<String>,
    ) -> Result<(), PoolError> {
        let mut state = self.state();

        let mut seen = BTreeSet::new();
        for subnet in add.iter() {
            subnet.validate()?;
            if state.subnets.contains_key(&subnet.id)
                || !seen.insert(subnet.id.clone())
            {
                return Err(PoolError::DuplicateSubnet(subnet.id.clone()));
            }
        }
        for subnet in change.iter() {
            subnet.validate()?;
            if !state.subnets.contains_key(&subnet.id) {
                return Err(PoolError::UnknownSubnet(subnet.id.clone()));
            }
        }
        for id in delete.iter() {
            if !state.subnets.contains_key(id) {
                return Err(PoolError::UnknownSubnet(id.clone()));
            }
            let busy = state
                .entries
                .values()
                .any(|e| &e.subnet_id == id && e.slot != Slot::Free);
            if busy {
                return Err(PoolError::SubnetInUse(id.clone()));
            }
        }

        for id in delete {
            state.entries.retain(|_, e| e.subnet_id != id);
            state.max_free.remove(&id);
            state.subnets.remove(&id);
            info!(self.log, "deleted subnet"; "subnet" => id);
        }
        for subnet in add.into_iter().chain(change) {
            info!(self.log, "updated subnet"; "subnet" => &subnet.id);
            state.subnets.insert(subnet.id.clone(), subnet);
        }
        Ok(())
    }

    /// Adds and removes explicit addresses and sets per-subnet caps on idle
    /// addresses. All changes are validated before any is applied.
    pub fn change_pool(
        &self,
        add: &[Address],
        remove: &[Address],
        max_free: &BTreeMap<String, u32>,
    ) -> Result<(), PoolError> {
        let mut state = self.state();

        let mut additions = Vec::with_capacity(add.len());
        for a in add {
            let ip = a.ip_address.ok_or(PoolError::MissingIp)?;
            let subnet =
                state.subnet_for(ip).ok_or(PoolError::NoSubnetFor(ip))?;
            if let Some(e) = state.entries.get(&ip) {
                if e.slot != Slot::Free {
                    return Err(PoolError::NotFree(ip));
                }
            }
            let mac = if a.mac_address.is_empty() {
                mac_for(ip)
            } else {
                a.mac_address.clone()
            };
            additions.push((ip, subnet.id.clone(), mac));
        }
        let mut removals = Vec::with_capacity(remove.len());
        for a in remove {
            let ip = a.ip_address.ok_or(PoolError::MissingIp)?;
            match state.entries.get(&ip) {
                Some(e) if e.slot != Slot::Free => {
                    return Err(PoolError::InUse(ip))
                }
                _ => removals.push(ip),
            }
        }
        for id in max_free.keys() {
            if !state.subnets.contains_key(id) {
                return Err(PoolError::UnknownSubnet(id.clone()));
            }
        }

        for (ip, subnet_id, mac) in additions {
            state
                .entries
                .insert(ip, PoolEntry { subnet_id, mac, slot: Slot::Free });
        }
        for ip in removals {
            state.entries.remove(&ip);
        }
        for (id, cap) in max_free {
            state.max_free.insert(id.clone(), *cap);
        }
        state.trim(&self.log);
        Ok(())
    }

    /// Takes a free address from `subnet_id` to serve as a new VM's primary
    /// address.
    pub fn allocate_primary(
        &self,
        subnet_id: &str,
    ) -> Result<Address, PoolError> {
        let addr = self.state().take(subnet_id, None)?;
        info!(self.log, "allocated address";
              "subnet" => subnet_id, "address" => ?addr.ip_address);
        Ok(addr)
    }

    pub fn allocate_secondary(
        &self,
        subnet_id: &str,
        vm: IpAddr,
    ) -> Result<Address, PoolError> {
        self.state().take(subnet_id, Some(vm))
    }

    /// Records a caller-chosen address as in use by `vm`. Addresses the pool
    /// does not track yet are adopted if they fall in a known subnet.
    pub fn claim(
        &self,
        addr: &Address,
        vm: IpAddr,
    ) -> Result<Address, PoolError> {
        let ip = addr.ip_address.ok_or(PoolError::MissingIp)?;
        let mut state = self.state();
        if let Some(entry) = state.entries.get_mut(&ip) {
            return match &entry.slot {
                Slot::Free => {
                    entry.slot = Slot::UsedBy(vm);
                    Ok(Address {
                        ip_address: Some(ip),
                        mac_address: entry.mac.clone(),
                    })
                }
                Slot::UsedBy(owner) if *owner == vm => Ok(Address {
                    ip_address: Some(ip),
                    mac_address: entry.mac.clone(),
                }),
                _ => Err(PoolError::NotFree(ip)),
            };
        }
        let subnet_id = state
            .subnet_for(ip)
            .map(|s| s.id.clone())
            .ok_or(PoolError::NoSubnetFor(ip))?;
        let mac = if addr.mac_address.is_empty() {
            mac_for(ip)
        } else {
            addr.mac_address.clone()
        };
        state.entries.insert(
            ip,
            PoolEntry { subnet_id, mac: mac.clone(), slot: Slot::UsedBy(vm) },
        );
        Ok(Address { ip_address: Some(ip), mac_address: mac })
    }

    /// Returns an address used by a VM to the free set.
    pub fn release(&self, addr: IpAddr) -> bool {
        let mut state = self.state();
        let released = match state.entries.get_mut(&addr) {
            Some(e) if matches!(e.slot, Slot::UsedBy(_)) => {
                e.slot = Slot::Free;
                true
            }
            _ => false,
        };
        if released {
            state.trim(&self.log);
        }
        released
    }

    /// Replaces the set of externally leased addresses. Leases absent from
    /// `leases` go back to the free set.
    pub fn register_external_leases(&self, leases: &[(IpAddr, String)]) {
        let mut state = self.state();
        let wanted: BTreeMap<IpAddr, &String> =
            leases.iter().map(|(a, h)| (*a, h)).collect();

        for (addr, entry) in state.entries.iter_mut() {
            if matches!(entry.slot, Slot::Leased(_))
                && !wanted.contains_key(addr)
            {
                entry.slot = Slot::Free;
            }
        }

        for (addr, hostname) in wanted {
            if let Some(entry) = state.entries.get_mut(&addr) {
                match entry.slot {
                    Slot::UsedBy(vm) => {
                        warn!(self.log, "external lease for address used by VM";
                              "address" => %addr, "vm" => %vm);
                    }
                    _ => entry.slot = Slot::Leased(hostname.clone()),
                }
                continue;
            }
            let Some(subnet_id) = state.subnet_for(addr).map(|s| s.id.clone())
            else {
                warn!(self.log, "external lease outside known subnets";
                      "address" => %addr);
                continue;
            };
            state.entries.insert(
                addr,
                PoolEntry {
                    subnet_id,
                    mac: mac_for(addr),
                    slot: Slot::Leased(hostname.clone()),
                },
            );
        }
        state.trim(&self.log);
    }

    /// Free address count for every known subnet.
    pub fn free_counts(&self) -> BTreeMap<String, u64> {
        let state = self.state();
        let mut counts: BTreeMap<String, u64> =
            state.subnets.keys().map(|id| (id.clone(), 0)).collect();
        for e in state.entries.values().filter(|e| e.slot == Slot::Free) {
            *counts.entry(e.subnet_id.clone()).or_default() += 1;
        }
        counts
    }

    pub fn free_addresses(&self) -> Vec<Address> {
        self.state()
            .entries
            .iter()
            .filter(|(_, e)| e.slot == Slot::Free)
            .map(|(a, e)| Address {
                ip_address: Some(*a),
                mac_address: e.mac.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn subnet(id: &str, gw: &str) -> Subnet {
        Subnet {
            id: id.to_string(),
            ip_gateway: gw.parse().unwrap(),
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

    fn addr(ip: &str) -> Address {
        Address {
            ip_address: Some(ip.parse().unwrap()),
            mac_address: String::new(),
        }
    }

    fn pool_with(ips: &[&str]) -> AddressPool {
        let pool =
            AddressPool::new(vec![subnet("s0", "10.0.0.1")], test_logger());
        let add: Vec<Address> = ips.iter().map(|ip| addr(ip)).collect();
        pool.change_pool(&add, &[], &BTreeMap::new()).unwrap();
        pool
    }

    #[test]
    fn allocation_takes_lowest_free_address() {
        let pool = pool_with(&["10.0.0.20", "10.0.0.10"]);
        let a = pool.allocate_primary("s0").unwrap();
        assert_eq!(a.ip_address, Some("10.0.0.10".parse().unwrap()));
        assert_eq!(a.mac_address, "52:54:0a:00:00:0a");
        assert_eq!(pool.free_counts()["s0"], 1);

        pool.allocate_primary("s0").unwrap();
        assert_eq!(
            pool.allocate_primary("s0"),
            Err(PoolError::Exhausted("s0".to_string()))
        );
        assert_eq!(
            pool.allocate_primary("nope"),
            Err(PoolError::UnknownSubnet("nope".to_string()))
        );
    }

    #[test]
    fn release_returns_address_to_free() {
        let pool = pool_with(&["10.0.0.10"]);
        let ip = pool.allocate_primary("s0").unwrap().ip_address.unwrap();
        assert_eq!(pool.slot(ip), Some(Slot::UsedBy(ip)));
        assert!(pool.release(ip));
        assert_eq!(pool.slot(ip), Some(Slot::Free));
        assert!(!pool.release(ip));
    }

    #[test]
    fn change_pool_is_all_or_nothing() {
        let pool = pool_with(&["10.0.0.10", "10.0.0.11"]);
        let used = pool.allocate_primary("s0").unwrap();

        let err = pool
            .change_pool(
                &[addr("10.0.0.12")],
                &[used.clone()],
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert_eq!(err, PoolError::InUse(used.ip_address.unwrap()));
        assert_eq!(pool.slot("10.0.0.12".parse().unwrap()), None);

        let err = pool
            .change_pool(&[addr("192.168.9.9")], &[], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, PoolError::NoSubnetFor(_)));
    }

    #[test]
    fn excess_free_addresses_are_released() {
        let pool = pool_with(&["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
        let caps = BTreeMap::from([("s0".to_string(), 1)]);
        pool.change_pool(&[], &[], &caps).unwrap();
        assert_eq!(pool.free_counts()["s0"], 1);
        assert_eq!(pool.slot("10.0.0.10".parse().unwrap()), Some(Slot::Free));
        assert_eq!(pool.slot("10.0.0.12".parse().unwrap()), None);

        let ip = pool.allocate_primary("s0").unwrap().ip_address.unwrap();
        pool.change_pool(&[addr("10.0.0.30")], &[], &BTreeMap::new()).unwrap();
        // Releasing the VM's address would leave two idle addresses.
        pool.release(ip);
        assert_eq!(pool.free_counts()["s0"], 1);
    }

    #[test]
    fn external_leases_replace_previous_set() {
        let pool = pool_with(&["10.0.0.10", "10.0.0.11"]);
        let a: IpAddr = "10.0.0.10".parse().unwrap();
        let b: IpAddr = "10.0.0.11".parse().unwrap();
        let outside: IpAddr = "10.9.9.9".parse().unwrap();

        pool.register_external_leases(&[
            (a, "printer".to_string()),
            (outside, "stray".to_string()),
        ]);
        assert_eq!(pool.slot(a), Some(Slot::Leased("printer".to_string())));
        assert_eq!(pool.slot(outside), None);
        assert_eq!(pool.free_counts()["s0"], 1);

        // A VM-owned address is never re-attributed to a lease.
        let vm = pool.allocate_primary("s0").unwrap().ip_address.unwrap();
        assert_eq!(vm, b);
        pool.register_external_leases(&[(b, "laptop".to_string())]);
        assert_eq!(pool.slot(b), Some(Slot::UsedBy(b)));
        assert_eq!(pool.slot(a), Some(Slot::Free));
    }

    #[test]
    fn claim_adopts_untracked_address() {
        let pool = pool_with(&[]);
        let vm: IpAddr = "10.0.0.50".parse().unwrap();
        let claimed = pool.claim(&addr("10.0.0.50"), vm).unwrap();
        assert_eq!(claimed.mac_address, mac_for(vm));
        assert_eq!(pool.slot(vm), Some(Slot::UsedBy(vm)));
        assert!(pool.claim(&addr("10.0.0.50"), vm).is_ok());
        let other: IpAddr = "10.0.0.51".parse().unwrap();
        assert_eq!(
            pool.claim(&addr("10.0.0.50"), other),
            Err(PoolError::NotFree(vm))
        );
    }

    #[test]
    fn subnet_deletion_refused_while_in_use() {
        let pool = pool_with(&["10.0.0.10"]);
        let ip = pool.allocate_primary("s0").unwrap().ip_address.unwrap();
        assert_eq!(
            pool.update_subnets(vec![], vec![], vec!["s0".to_string()]),
            Err(PoolError::SubnetInUse("s0".to_string()))
        );
        pool.release(ip);
        pool.update_subnets(
            vec![subnet("s1", "10.1.0.1")],
            vec![],
            vec!["s0".to_string()],
        )
        .unwrap();
        assert_eq!(pool.slot(ip), None);
        assert_eq!(
            pool.subnets().into_iter().map(|s| s.id).collect::<Vec<_>>(),
            vec!["s1".to_string()]
        );
        assert_eq!(
            pool.update_subnets(vec![subnet("s1", "10.1.0.1")], vec![], vec![]),
            Err(PoolError::DuplicateSubnet("s1".to_string()))
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Allocate,
        Release(u8),
        Lease(Vec<u8>),
        Cap(u32),
        Add(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Allocate),
            (0u8..16).prop_map(Op::Release),
            proptest::collection::vec(0u8..16, 0..4).prop_map(Op::Lease),
            (0u32..8).prop_map(Op::Cap),
            (0u8..16).prop_map(Op::Add),
        ]
    }

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, 100 + n])
    }

    proptest! {
        #[test]
        fn partitions_stay_disjoint(
            ops in proptest::collection::vec(op(), 1..40)
        ) {
            let pool = pool_with(&[]);
            let mut vms: BTreeSet<IpAddr> = BTreeSet::new();
            for op in ops {
                match op {
                    Op::Allocate => {
                        if let Ok(a) = pool.allocate_primary("s0") {
                            let a = a.ip_address.unwrap();
                            prop_assert!(vms.insert(a), "handed out {a} twice");
                        }
                    }
                    Op::Release(n) => {
                        if pool.release(ip(n)) {
                            vms.remove(&ip(n));
                        }
                    }
                    Op::Lease(ns) => {
                        let leases: Vec<(IpAddr, String)> = ns
                            .iter()
                            .map(|n| (ip(*n), format!("h{n}")))
                            .collect();
                        pool.register_external_leases(&leases);
                    }
                    Op::Cap(c) => {
                        let caps = BTreeMap::from([("s0".to_string(), c)]);
                        pool.change_pool(&[], &[], &caps).unwrap();
                    }
                    Op::Add(n) => {
                        let _ = pool.change_pool(
                            &[addr(&ip(n).to_string())],
                            &[],
                            &BTreeMap::new(),
                        );
                    }
                }

                let free = pool.free_addresses();
                prop_assert_eq!(free.len() as u64, pool.free_counts()["s0"]);
                for a in free {
                    prop_assert!(!vms.contains(&a.ip_address.unwrap()));
                }
                for vm in vms.iter() {
                    prop_assert_eq!(pool.slot(*vm), Some(Slot::UsedBy(*vm)));
                }
            }
        }
    }
}
