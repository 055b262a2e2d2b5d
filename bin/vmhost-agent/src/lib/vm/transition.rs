// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle transition table.
//!
//! Every state change a VM goes through is one row of [`TABLE`]. Request
//! handlers never assign a state directly: they name a [`Trigger`] and ask
//! [`next`] where it leads from the VM's current state. Anything not in the
//! table is rejected and leaves the VM untouched.

use thiserror::Error;
use vmhost_api_types::VmState;

use crate::migrate::MigrateRole;

/// Events that move a VM between lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter)]
pub enum Trigger {
    BootSucceeded,
    BootFailed,
    StopRequested,
    StopCompleted,
    StartRequested,
    DestroyRequested,
    MigrationAccepted,
    ExportRequested,
    ExportFinished,
    HealthCheckFailed,
    DebugRequested,
    DebugEnded,
    PeerCommitted,
    PeerAborted,
    DestroyCompleted,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::BootSucceeded => "boot succeeded",
            Trigger::BootFailed => "boot failed",
            Trigger::StopRequested => "stop",
            Trigger::StopCompleted => "stop completed",
            Trigger::StartRequested => "start",
            Trigger::DestroyRequested => "destroy",
            Trigger::MigrationAccepted => "migrate",
            Trigger::ExportRequested => "export",
            Trigger::ExportFinished => "export finished",
            Trigger::HealthCheckFailed => "health check failed",
            Trigger::DebugRequested => "debug",
            Trigger::DebugEnded => "end debugging",
            Trigger::PeerCommitted => "peer committed",
            Trigger::PeerAborted => "peer aborted",
            Trigger::DestroyCompleted => "destroy completed",
        };
        f.write_str(s)
    }
}

/// Where a transition leaves the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Enter(VmState),
    /// The entry leaves the registry.
    Remove,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("cannot {trigger} a VM which is {state}")]
pub struct InvalidTransition {
    pub state: VmState,
    pub trigger: Trigger,
}

struct Edge {
    from: &'static [VmState],
    /// Restricts the edge to one side of a migration. Only meaningful for
    /// edges out of `Migrating`.
    role: Option<MigrateRole>,
    trigger: Trigger,
    to: Outcome,
}

use MigrateRole::{Destination, Source};
use Outcome::{Enter, Remove};
use Trigger::*;
use VmState::*;

#[rustfmt::skip]
const TABLE: &[Edge] = &[
    Edge { from: &[Starting], role: None, trigger: BootSucceeded, to: Enter(Running) },
    Edge { from: &[Starting], role: None, trigger: BootFailed, to: Enter(FailedToStart) },
    Edge { from: &[Running, Crashed], role: None, trigger: StopRequested, to: Enter(Stopping) },
    Edge { from: &[Running], role: None, trigger: MigrationAccepted, to: Enter(Migrating) },
    Edge { from: &[Running], role: None, trigger: ExportRequested, to: Enter(Exporting) },
    Edge { from: &[Running], role: None, trigger: HealthCheckFailed, to: Enter(Crashed) },
    Edge { from: &[Running], role: None, trigger: DebugRequested, to: Enter(Debugging) },
    Edge { from: &[Stopping], role: None, trigger: StopCompleted, to: Enter(Stopped) },
    Edge { from: &[Stopped], role: None, trigger: StartRequested, to: Enter(Starting) },
    Edge {
        from: &[Stopped, FailedToStart, Crashed, Debugging],
        role: None,
        trigger: DestroyRequested,
        to: Enter(Destroying),
    },
    Edge { from: &[Debugging], role: None, trigger: DebugEnded, to: Enter(Running) },
    Edge { from: &[Migrating], role: Some(Source), trigger: PeerCommitted, to: Enter(Destroying) },
    Edge { from: &[Migrating], role: Some(Source), trigger: PeerAborted, to: Enter(Running) },
    Edge { from: &[Migrating], role: Some(Destination), trigger: PeerCommitted, to: Enter(Starting) },
    Edge { from: &[Migrating], role: Some(Destination), trigger: PeerAborted, to: Remove },
    Edge { from: &[Exporting], role: None, trigger: ExportFinished, to: Enter(Running) },
    Edge { from: &[Destroying], role: None, trigger: DestroyCompleted, to: Remove },
];

/// Looks up where `trigger` takes a VM in `state`. `role` is the VM's side
/// of its migration, if it is migrating.
pub fn next(
    state: VmState,
    role: Option<MigrateRole>,
    trigger: Trigger,
) -> Result<Outcome, InvalidTransition> {
    TABLE
        .iter()
        .find(|e| {
            e.trigger == trigger
                && e.from.contains(&state)
                && (e.role.is_none() || e.role == role)
        })
        .map(|e| e.to)
        .ok_or(InvalidTransition { state, trigger })
}

/// Returns true if `trigger` is accepted from `state`.
pub fn allowed(
    state: VmState,
    role: Option<MigrateRole>,
    trigger: Trigger,
) -> bool {
    next(state, role, trigger).is_ok()
}
