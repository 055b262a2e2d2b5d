// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-host VM agent: a registry of the VMs resident on one hypervisor
//! host, the operations that change them, and the HTTP and websocket server
//! that exposes those operations.

pub mod agent;
pub mod dhcp;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metadata;
mod migrate;
pub mod pool;
pub mod server;
pub mod storage;
pub mod stream;
pub mod token;
pub mod updates;
pub mod vm;
