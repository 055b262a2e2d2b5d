// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the agent and the engine that actually runs guests.
//!
//! The agent decides *when* a VM boots, stops or reboots; a [`VmEngine`]
//! does it. Guest-initiated events (crashes, power-off from inside the
//! guest) flow back to the agent as [`EngineEvent`]s on a channel handed out
//! when the engine is built.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use slog::{info, warn, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use vmhost_api_types::{FileEntry, FileSystemScan, VmInfo};

/// Depth of the engine event channel.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// A pass-through byte stream into a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Console,
    Manager,
    Serial(u32),
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Console => f.write_str("console"),
            Channel::Manager => f.write_str("manager"),
            Channel::Serial(n) => write!(f, "serial port {n}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("VM {0} is not running")]
    NotRunning(IpAddr),

    #[error("VM {0} failed to boot: {1}")]
    BootFailed(IpAddr, String),

    #[error("VM {0} has no {1}")]
    NoChannel(IpAddr, Channel),

    #[error("patching failed: {0}")]
    Patch(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What the engine needs to boot a VM.
#[derive(Clone, Debug)]
pub struct BootSpec {
    pub info: VmInfo,
    /// Root image; the debug image when booting for debugging.
    pub root: PathBuf,
    /// Secondary volumes, in volume order.
    pub volumes: Vec<PathBuf>,
    pub user_data: Option<PathBuf>,
}

impl BootSpec {
    pub fn addr(&self) -> Option<IpAddr> {
        self.info.address.ip_address
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// The guest stopped responding or the engine process died.
    Crashed(IpAddr),
    /// The guest powered itself off.
    PoweredOff(IpAddr),
}

impl EngineEvent {
    pub fn addr(&self) -> IpAddr {
        match self {
            EngineEvent::Crashed(addr) | EngineEvent::PoweredOff(addr) => *addr,
        }
    }
}

/// A raw duplex byte stream into a VM.
pub trait EngineConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> EngineConn for T {}

#[async_trait]
pub trait VmEngine: Send + Sync {
    async fn boot(&self, spec: BootSpec) -> Result<(), EngineError>;

    /// Boots the VM from a debug root image, leaving the real root alone.
    async fn boot_debug(&self, spec: BootSpec) -> Result<(), EngineError>;

    /// Shuts the guest down and waits until it is gone.
    async fn stop(&self, addr: IpAddr) -> Result<(), EngineError>;

    async fn reboot(&self, addr: IpAddr) -> Result<(), EngineError>;

    /// Forgets a VM that is leaving this host, stopping it if needed.
    async fn release(&self, addr: IpAddr);

    async fn connect(
        &self,
        addr: IpAddr,
        channel: Channel,
    ) -> Result<Box<dyn EngineConn>, EngineError>;

    /// Applies `image_name` to the root image at `root` in place, returning
    /// the patch log.
    async fn patch_root(
        &self,
        root: &Path,
        image_name: &str,
    ) -> Result<Vec<String>, EngineError>;

    async fn scan_root(
        &self,
        root: &Path,
        exclude_prefixes: &[String],
    ) -> Result<FileSystemScan, EngineError>;
}

#[derive(Default)]
struct SimState {
    running: HashMap<IpAddr, SimVm>,
    fail_boots: HashSet<IpAddr>,
}

struct SimVm {
    debug: bool,
    serial_ports: u32,
}

/// An engine that runs nothing. Booted VMs are remembered, pass-through
/// channels echo back whatever is written to them, and guest events are
/// raised on demand. Used by tests and by agents without a real engine.
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    events: mpsc::Sender<EngineEvent>,
    log: Logger,
}

impl SimulatedEngine {
    pub fn new(log: Logger) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self { state: Mutex::new(SimState::default()), events, log }, rx)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every boot of `addr` fail until cleared.
    pub fn fail_boots_for(&self, addr: IpAddr, fail: bool) {
        let mut state = self.state();
        if fail {
            state.fail_boots.insert(addr);
        } else {
            state.fail_boots.remove(&addr);
        }
    }

    pub fn is_running(&self, addr: IpAddr) -> bool {
        self.state().running.contains_key(&addr)
    }

    pub fn is_debugging(&self, addr: IpAddr) -> bool {
        self.state().running.get(&addr).is_some_and(|vm| vm.debug)
    }

    fn raise(&self, event: EngineEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(self.log, "dropping engine event"; "error" => %e);
        }
    }

    /// Simulates a guest crash.
    pub fn crash(&self, addr: IpAddr) {
        if self.state().running.remove(&addr).is_some() {
            self.raise(EngineEvent::Crashed(addr));
        }
    }

    /// Simulates the guest powering itself off.
    pub fn power_off(&self, addr: IpAddr) {
        if self.state().running.remove(&addr).is_some() {
            self.raise(EngineEvent::PoweredOff(addr));
        }
    }

    fn start(&self, spec: &BootSpec, debug: bool) -> Result<(), EngineError> {
        let addr = spec.addr().ok_or_else(|| {
            EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "boot spec has no address",
            ))
        })?;
        let mut state = self.state();
        if state.fail_boots.contains(&addr) {
            return Err(EngineError::BootFailed(
                addr,
                "simulated boot failure".to_string(),
            ));
        }
        state.running.insert(addr, SimVm { debug, serial_ports: 1 });
        info!(self.log, "simulated VM booted"; "vm" => %addr, "debug" => debug);
        Ok(())
    }
}

#[async_trait]
impl VmEngine for SimulatedEngine {
    async fn boot(&self, spec: BootSpec) -> Result<(), EngineError> {
        self.start(&spec, false)
    }

    async fn boot_debug(&self, spec: BootSpec) -> Result<(), EngineError> {
        self.start(&spec, true)
    }

    async fn stop(&self, addr: IpAddr) -> Result<(), EngineError> {
        self.state()
            .running
            .remove(&addr)
            .map(|_| ())
            .ok_or(EngineError::NotRunning(addr))
    }

    async fn reboot(&self, addr: IpAddr) -> Result<(), EngineError> {
        if self.is_running(addr) {
            Ok(())
        } else {
            Err(EngineError::NotRunning(addr))
        }
    }

    async fn release(&self, addr: IpAddr) {
        let mut state = self.state();
        state.running.remove(&addr);
        state.fail_boots.remove(&addr);
    }

    async fn connect(
        &self,
        addr: IpAddr,
        channel: Channel,
    ) -> Result<Box<dyn EngineConn>, EngineError> {
        {
            let state = self.state();
            let vm = state
                .running
                .get(&addr)
                .ok_or(EngineError::NotRunning(addr))?;
            if let Channel::Serial(n) = channel {
                if n >= vm.serial_ports {
                    return Err(EngineError::NoChannel(addr, channel));
                }
            }
        }
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(theirs);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        Ok(Box::new(ours))
    }

    async fn patch_root(
        &self,
        root: &Path,
        image_name: &str,
    ) -> Result<Vec<String>, EngineError> {
        if image_name.is_empty() {
            return Err(EngineError::Patch("no image name".to_string()));
        }
        let size = tokio::fs::metadata(root).await?.len();
        Ok(vec![
            format!("patching {} ({size} bytes)", root.display()),
            format!("applied {image_name}"),
        ])
    }

    async fn scan_root(
        &self,
        root: &Path,
        exclude_prefixes: &[String],
    ) -> Result<FileSystemScan, EngineError> {
        let size = tokio::fs::metadata(root).await?.len();
        let entries = [("/", 0o40755, 0), ("/root.img", 0o100644, size)]
            .into_iter()
            .filter(|(path, _, _)| {
                *path == "/"
                    || !exclude_prefixes
                        .iter()
                        .any(|p| path.starts_with(p.as_str()))
            })
            .map(|(path, mode, size)| FileEntry {
                path: path.to_string(),
                size,
                mode,
            })
            .collect();
        Ok(FileSystemScan { entries })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use vmhost_api_types::Address;

    fn spec(addr: &str) -> BootSpec {
        BootSpec {
            info: VmInfo {
                address: Address {
                    ip_address: Some(addr.parse().unwrap()),
                    mac_address: String::new(),
                },
                ..Default::default()
            },
            root: PathBuf::from("/nonexistent"),
            volumes: vec![],
            user_data: None,
        }
    }

    fn engine() -> (SimulatedEngine, mpsc::Receiver<EngineEvent>) {
        SimulatedEngine::new(Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn boot_stop_and_failures() {
        let (e, _rx) = engine();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        e.boot(spec("10.0.0.5")).await.unwrap();
        assert!(e.is_running(a));
        e.stop(a).await.unwrap();
        assert!(matches!(e.stop(a).await, Err(EngineError::NotRunning(_))));

        e.fail_boots_for(a, true);
        assert!(matches!(
            e.boot(spec("10.0.0.5")).await,
            Err(EngineError::BootFailed(..))
        ));
        e.fail_boots_for(a, false);
        e.boot_debug(spec("10.0.0.5")).await.unwrap();
        assert!(e.is_debugging(a));
    }

    #[tokio::test]
    async fn guest_events_are_raised() {
        let (e, mut rx) = engine();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        e.boot(spec("10.0.0.5")).await.unwrap();
        e.crash(a);
        assert_eq!(rx.recv().await, Some(EngineEvent::Crashed(a)));

        // Nothing is running any more, so power-off has nothing to report.
        e.power_off(a);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn channels_echo() {
        let (e, _rx) = engine();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(e.connect(a, Channel::Console).await.is_err());
        e.boot(spec("10.0.0.5")).await.unwrap();
        assert!(matches!(
            e.connect(a, Channel::Serial(3)).await,
            Err(EngineError::NoChannel(..))
        ));

        let mut conn = e.connect(a, Channel::Serial(0)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
