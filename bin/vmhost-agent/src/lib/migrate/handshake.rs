// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-migration commit handshake.
//!
//! This tracks one exchange between the destination agent and the caller
//! driving the migration, and is independent of the VM's lifecycle state.
//! Terminal outcomes are sticky: repeating the decision that ended the
//! handshake returns the same outcome again, while contradicting it is an
//! error.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Image, user data and volumes are still arriving.
    Prepare,
    /// The destination holds a full copy and has asked for a decision.
    AwaitDecision,
    Committed,
    Aborted,
    /// The source sent everything but never learned the decision. The VM
    /// stays stopped until an administrator settles it.
    InDoubt,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Committed | Phase::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Prepare => "prepare",
            Phase::AwaitDecision => "await-decision",
            Phase::Committed => "committed",
            Phase::Aborted => "aborted",
            Phase::InDoubt => "in-doubt",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

impl From<bool> for Decision {
    fn from(commit: bool) -> Self {
        if commit {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("cannot commit before the transfer has completed")]
    NotReady,

    #[error("migration already {0}")]
    AlreadyDecided(Phase),
}

#[derive(Debug)]
pub struct Handshake {
    phase: Phase,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self { phase: Phase::Prepare }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The transfer finished; the destination now waits for a decision.
    pub fn ready(&mut self) -> Result<Phase, HandshakeError> {
        match self.phase {
            Phase::Prepare => {
                self.phase = Phase::AwaitDecision;
                Ok(self.phase)
            }
            Phase::AwaitDecision => Ok(self.phase),
            decided => Err(HandshakeError::AlreadyDecided(decided)),
        }
    }

    pub fn decide(
        &mut self,
        decision: Decision,
    ) -> Result<Phase, HandshakeError> {
        self.phase = match (self.phase, decision) {
            (Phase::Prepare, Decision::Commit) => {
                return Err(HandshakeError::NotReady)
            }
            (Phase::Prepare | Phase::AwaitDecision, Decision::Abort) => {
                Phase::Aborted
            }
            (Phase::AwaitDecision, Decision::Commit) => Phase::Committed,
            (Phase::Committed, Decision::Commit) => Phase::Committed,
            (Phase::Aborted, Decision::Abort) => Phase::Aborted,
            (decided, _) => return Err(HandshakeError::AlreadyDecided(decided)),
        };
        Ok(self.phase)
    }

    /// No decision arrived in time. An undecided handshake aborts; a decided
    /// one keeps its outcome.
    pub fn expire(&mut self) -> Phase {
        if !self.phase.is_terminal() {
            self.phase = Phase::Aborted;
        }
        self.phase
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commit_after_ready() {
        let mut h = Handshake::new();
        assert_eq!(h.decide(Decision::Commit), Err(HandshakeError::NotReady));
        assert_eq!(h.ready(), Ok(Phase::AwaitDecision));
        assert_eq!(h.decide(Decision::Commit), Ok(Phase::Committed));
    }

    #[test]
    fn repeated_decisions_are_idempotent() {
        let mut h = Handshake::new();
        h.ready().unwrap();
        assert_eq!(h.decide(Decision::Abort), Ok(Phase::Aborted));
        assert_eq!(h.decide(Decision::Abort), Ok(Phase::Aborted));
        assert_eq!(
            h.decide(Decision::Commit),
            Err(HandshakeError::AlreadyDecided(Phase::Aborted))
        );

        let mut h = Handshake::new();
        h.ready().unwrap();
        h.decide(Decision::Commit).unwrap();
        assert_eq!(h.decide(Decision::Commit), Ok(Phase::Committed));
        assert_eq!(h.expire(), Phase::Committed);
        assert_eq!(
            h.ready(),
            Err(HandshakeError::AlreadyDecided(Phase::Committed))
        );
    }

    #[test]
    fn abort_during_transfer() {
        let mut h = Handshake::new();
        assert_eq!(h.decide(false.into()), Ok(Phase::Aborted));
    }

    #[test]
    fn expiry_aborts_undecided() {
        let mut h = Handshake::new();
        h.ready().unwrap();
        assert_eq!(h.expire(), Phase::Aborted);
        assert!(h.phase().is_terminal());
    }
}
