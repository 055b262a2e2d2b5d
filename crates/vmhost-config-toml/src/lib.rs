// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use vmhost_api_types::Subnet;

/// Configuration for the vmhost agent.
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    /// Users allowed to create VMs on this host. Empty lists leave creation
    /// open to any authenticated caller.
    #[serde(default)]
    pub owner_users: Vec<String>,

    #[serde(default)]
    pub owner_groups: Vec<String>,

    #[serde(default)]
    pub agent: Agent,

    #[serde(default)]
    pub capacity: Capacity,

    #[serde(default)]
    pub migration: Migration,

    #[serde(default)]
    pub tokens: Tokens,

    /// Subnets known at startup.
    #[serde(default, rename = "subnet")]
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Agent {
    /// Root directory holding per-VM volume directories.
    pub state_dir: PathBuf,

    /// How long internally-acquired VM and host locks are waited for.
    pub lock_timeout_ms: u64,

    pub num_serial_ports: u32,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/vmhost"),
            lock_timeout_ms: 10_000,
            num_serial_ports: 1,
        }
    }
}

impl Agent {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Capacity {
    pub memory_mib: u64,
    pub num_cpus: u32,

    /// Bytes available for VM volumes under `agent.state_dir`.
    pub volume_bytes: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Self { memory_mib: 16 * 1024, num_cpus: 8, volume_bytes: 1 << 40 }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Migration {
    /// How long a destination waits for the commit decision before it
    /// discards the incoming VM.
    pub decision_timeout_secs: u64,

    pub connect_timeout_secs: u64,
}

impl Default for Migration {
    fn default() -> Self {
        Self { decision_timeout_secs: 300, connect_timeout_secs: 15 }
    }
}

impl Migration {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Tokens {
    pub max_lifetime_secs: u64,
}

impl Default for Tokens {
    fn default() -> Self {
        Self { max_lifetime_secs: 24 * 60 * 60 }
    }
}

/// Errors which may be returned when parsing the agent configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid subnet {0}: {1}")]
    Subnet(String, vmhost_api_types::SubnetError),

    #[error("Duplicate subnet id {0}")]
    DuplicateSubnet(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    for (i, subnet) in cfg.subnets.iter().enumerate() {
        subnet
            .validate()
            .map_err(|e| ParseError::Subnet(subnet.id.clone(), e))?;
        if cfg.subnets[..i].iter().any(|s| s.id == subnet.id) {
            return Err(ParseError::DuplicateSubnet(subnet.id.clone()));
        }
    }
    Ok(cfg)
}
