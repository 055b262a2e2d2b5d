// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared/exclusive locks over the whole host and over individual VMs.
//!
//! Each lock is a fair tokio `RwLock` held through owned guards, so a lock
//! can outlive the request task that acquired it (the hold-lock calls rely on
//! this) and is released the moment its guard is dropped. Every acquisition is
//! bounded: a zero timeout tries exactly once, and running out of time is
//! reported as [`LockError::Busy`] rather than treated as a fault.
//!
//! Operations that need both the host lock and a VM lock must take the host
//! lock first. [`LockManager::lock_host_and_vm`] is the only entry point that
//! hands out both, and it always acquires them in that order.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, Logger};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn from_write_flag(write_lock: bool) -> Self {
        if write_lock {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockTarget {
    Host,
    Vm(IpAddr),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Host => f.write_str("host"),
            LockTarget::Vm(addr) => write!(f, "VM {addr}"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {mode} lock on {target}")]
    Busy { target: LockTarget, mode: LockMode, waited: Duration },
}

/// Who currently holds a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Holders {
    Unlocked,
    Shared(usize),
    Exclusive,
}

#[derive(Default)]
struct Accounting {
    shared: usize,
    exclusive: bool,
    waiting: usize,
}

struct LockCell {
    rw: Arc<RwLock<()>>,
    accounting: Mutex<Accounting>,
}

impl LockCell {
    fn new() -> Self {
        Self {
            rw: Arc::new(RwLock::new(())),
            accounting: Mutex::new(Accounting::default()),
        }
    }

    fn accounting(&self) -> std::sync::MutexGuard<'_, Accounting> {
        // The accounting is plain counters; a panic elsewhere can't leave it
        // half-written, so a poisoned lock is still usable.
        self.accounting.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn holders(&self) -> Holders {
        let acct = self.accounting();
        if acct.exclusive {
            Holders::Exclusive
        } else if acct.shared > 0 {
            Holders::Shared(acct.shared)
        } else {
            Holders::Unlocked
        }
    }

    fn waiting(&self) -> usize {
        self.accounting().waiting
    }
}

/// Marks a task as queued on a lock for as long as it is alive, including
/// when the waiting future is dropped before it resolves.
struct WaitTicket<'a>(&'a LockCell);

impl<'a> WaitTicket<'a> {
    fn new(cell: &'a LockCell) -> Self {
        cell.accounting().waiting += 1;
        Self(cell)
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.accounting().waiting -= 1;
    }
}

enum Held {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A held lock. Dropping the guard releases it.
pub struct LockGuard {
    cell: Arc<LockCell>,
    target: LockTarget,
    held: Held,
}

impl LockGuard {
    pub fn target(&self) -> LockTarget {
        self.target
    }

    pub fn mode(&self) -> LockMode {
        match self.held {
            Held::Shared(_) => LockMode::Shared,
            Held::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("target", &self.target)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut acct = self.cell.accounting();
        match self.held {
            Held::Shared(_) => acct.shared -= 1,
            Held::Exclusive(_) => acct.exclusive = false,
        }
    }
}

/// Both locks needed by an operation on one VM, host lock first.
///
/// Fields drop in declaration order, so the VM lock is released before the
/// host lock.
#[derive(Debug)]
pub struct VmLocks {
    pub vm: LockGuard,
    pub host: LockGuard,
}

async fn acquire(
    cell: &Arc<LockCell>,
    target: LockTarget,
    mode: LockMode,
    timeout: Duration,
) -> Result<LockGuard, LockError> {
    let held = if timeout.is_zero() {
        match mode {
            LockMode::Shared => {
                cell.rw.clone().try_read_owned().ok().map(Held::Shared)
            }
            LockMode::Exclusive => {
                cell.rw.clone().try_write_owned().ok().map(Held::Exclusive)
            }
        }
    } else {
        let _ticket = WaitTicket::new(cell);
        let rw = cell.rw.clone();
        let wait = async move {
            match mode {
                LockMode::Shared => Held::Shared(rw.read_owned().await),
                LockMode::Exclusive => Held::Exclusive(rw.write_owned().await),
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    };

    let held =
        held.ok_or(LockError::Busy { target, mode, waited: timeout })?;
    {
        let mut acct = cell.accounting();
        match held {
            Held::Shared(_) => acct.shared += 1,
            Held::Exclusive(_) => acct.exclusive = true,
        }
    }
    Ok(LockGuard { cell: cell.clone(), target, held })
}

/// The lock table for one host.
pub struct LockManager {
    host: Arc<LockCell>,
    vms: Mutex<HashMap<IpAddr, Arc<LockCell>>>,
    log: Logger,
}

impl LockManager {
    pub fn new(log: Logger) -> Self {
        Self {
            host: Arc::new(LockCell::new()),
            vms: Mutex::new(HashMap::new()),
            log,
        }
    }

    fn vm_cell(&self, addr: IpAddr) -> Arc<LockCell> {
        let mut vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
        vms.entry(addr).or_insert_with(|| Arc::new(LockCell::new())).clone()
    }

    pub async fn lock_host(
        &self,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let guard = acquire(&self.host, LockTarget::Host, mode, timeout).await;
        if let Err(e) = &guard {
            debug!(self.log, "host lock not acquired"; "error" => %e);
        }
        guard
    }

    /// Acquires a lock on one VM without touching the host lock. Callers
    /// that already hold the host lock use this; everyone else should use
    /// [`LockManager::lock_host_and_vm`].
    pub async fn lock_vm(
        &self,
        addr: IpAddr,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let cell = self.vm_cell(addr);
        let guard = acquire(&cell, LockTarget::Vm(addr), mode, timeout).await;
        if let Err(e) = &guard {
            debug!(self.log, "VM lock not acquired"; "error" => %e);
        }
        guard
    }

    /// Acquires the host lock and then the lock on `addr`, both within a
    /// single overall `timeout`.
    pub async fn lock_host_and_vm(
        &self,
        host_mode: LockMode,
        addr: IpAddr,
        vm_mode: LockMode,
        timeout: Duration,
    ) -> Result<VmLocks, LockError> {
        let deadline = Instant::now() + timeout;
        let host = self.lock_host(host_mode, timeout).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let vm = self.lock_vm(addr, vm_mode, remaining).await?;
        Ok(VmLocks { vm, host })
    }

    pub fn holders(&self, target: LockTarget) -> Holders {
        match target {
            LockTarget::Host => self.host.holders(),
            LockTarget::Vm(addr) => {
                let vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
                vms.get(&addr).map_or(Holders::Unlocked, |c| c.holders())
            }
        }
    }

    pub fn waiting(&self, target: LockTarget) -> usize {
        match target {
            LockTarget::Host => self.host.waiting(),
            LockTarget::Vm(addr) => {
                let vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
                vms.get(&addr).map_or(0, |c| c.waiting())
            }
        }
    }

    /// Drops the table entry for a VM that has left the host. Holders and
    /// waiters keep their own reference to the old lock.
    pub fn forget(&self, addr: IpAddr) {
        let mut vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
        vms.remove(&addr);
    }
}
