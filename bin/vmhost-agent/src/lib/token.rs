// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability tokens scoping destructive operations to one VM.
//!
//! A token may be presented any number of times until it expires or is
//! discarded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use slog::{debug, Logger};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("an access token is required")]
    Missing,

    #[error("unknown access token")]
    Unknown,

    #[error("access token has expired")]
    Expired,

    #[error("access token was not issued for VM {0}")]
    WrongVm(IpAddr),

    #[error("token lifetime must be greater than zero")]
    ZeroLifetime,
}

struct Grant {
    vm: IpAddr,
    expires: Instant,
}

#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenIssuer {
    tokens: Mutex<HashMap<String, Grant>>,
    max_lifetime: Duration,
    log: Logger,
}

impl TokenIssuer {
    pub fn new(max_lifetime: Duration, log: Logger) -> Self {
        Self { tokens: Mutex::new(HashMap::new()), max_lifetime, log }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, Grant>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issues a token for `vm`. Lifetimes above the configured maximum are
    /// shortened to it.
    pub fn issue(
        &self,
        vm: IpAddr,
        lifetime: Duration,
    ) -> Result<IssuedToken, TokenError> {
        if lifetime.is_zero() {
            return Err(TokenError::ZeroLifetime);
        }
        let lifetime = lifetime.min(self.max_lifetime);

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut tokens = self.tokens();
        let now = Instant::now();
        tokens.retain(|_, g| g.expires > now);
        tokens.insert(token.clone(), Grant { vm, expires: now + lifetime });
        debug!(self.log, "issued access token";
               "vm" => %vm, "lifetime" => ?lifetime);
        Ok(IssuedToken { token, expires_at })
    }

    /// Checks that `token` is live and was issued for `vm`. An expired token
    /// is forgotten on first sight.
    pub fn authorize(
        &self,
        token: Option<&str>,
        vm: IpAddr,
    ) -> Result<(), TokenError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenError::Missing)?;
        let mut tokens = self.tokens();
        let (granted_vm, expires) = tokens
            .get(token)
            .map(|g| (g.vm, g.expires))
            .ok_or(TokenError::Unknown)?;
        if expires <= Instant::now() {
            tokens.remove(token);
            return Err(TokenError::Expired);
        }
        if granted_vm != vm {
            return Err(TokenError::WrongVm(vm));
        }
        Ok(())
    }

    /// Discards a token issued for `vm`. Discarding an unknown token is not
    /// an error.
    pub fn discard(&self, token: &str, vm: IpAddr) -> Result<(), TokenError> {
        let mut tokens = self.tokens();
        match tokens.get(token) {
            Some(g) if g.vm != vm => Err(TokenError::WrongVm(vm)),
            Some(_) => {
                tokens.remove(token);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Drops every token issued for `vm`.
    pub fn revoke_vm(&self, vm: IpAddr) {
        self.tokens().retain(|_, g| g.vm != vm);
    }
}
