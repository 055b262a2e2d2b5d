// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent's error type and the failure classes callers act on.

use dropshot::{ClientErrorStatusCode, HttpError};
use thiserror::Error;

use crate::engine::EngineError;
use crate::lock::LockError;
use crate::migrate::handshake::HandshakeError;
use crate::migrate::MigrateError;
use crate::pool::PoolError;
use crate::storage::StorageError;
use crate::stream::StreamError;
use crate::token::TokenError;
use crate::vm::RegistryError;

/// What a caller may do about a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown VM, volume, snapshot or subnet. Retry after resolving the key.
    NotFound,
    /// Not legal from the current lifecycle state. Re-query before retrying.
    InvalidState,
    /// A lock or other bounded wait timed out. Retry with backoff.
    Busy,
    /// Bad or missing credential, destroy protection, or a disabled
    /// migration source.
    Unauthorized,
    /// Out of addresses, memory or bytes.
    ResourceExhausted,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::Busy => "Busy",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Internal => "Internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Lock(_) => ErrorKind::Busy,
            AgentError::Pool(e) => match e {
                PoolError::Exhausted(_) => ErrorKind::ResourceExhausted,
                PoolError::UnknownSubnet(_) | PoolError::NoSubnetFor(_) => {
                    ErrorKind::NotFound
                }
                PoolError::NotFree(_)
                | PoolError::InUse(_)
                | PoolError::SubnetInUse(_) => ErrorKind::InvalidState,
                PoolError::DuplicateSubnet(_)
                | PoolError::InvalidSubnet(_)
                | PoolError::MissingIp => ErrorKind::InvalidArgument,
            },
            AgentError::Token(TokenError::ZeroLifetime) => {
                ErrorKind::InvalidArgument
            }
            AgentError::Token(_) => ErrorKind::Unauthorized,
            AgentError::Registry(e) => match e {
                RegistryError::NotFound(_) => ErrorKind::NotFound,
                RegistryError::Busy { .. } => ErrorKind::Busy,
                RegistryError::MissingAddress => ErrorKind::InvalidArgument,
                _ => ErrorKind::InvalidState,
            },
            AgentError::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::InsufficientSpace { .. } => {
                    ErrorKind::ResourceExhausted
                }
                StorageError::Io(_) => ErrorKind::Internal,
            },
            AgentError::Engine(e) => match e {
                EngineError::NotRunning(_) => ErrorKind::InvalidState,
                EngineError::NoChannel(..) => ErrorKind::NotFound,
                _ => ErrorKind::Internal,
            },
            AgentError::Migrate(e) => match e {
                MigrateError::VmNotFound(_) => ErrorKind::NotFound,
                MigrateError::Unauthorized(_)
                | MigrateError::DestroyProtected
                | MigrateError::SourceDisabled => ErrorKind::Unauthorized,
                MigrateError::InvalidState(_) => ErrorKind::InvalidState,
                MigrateError::Resources(_) => ErrorKind::ResourceExhausted,
                _ => ErrorKind::Internal,
            },
            AgentError::Handshake(_) => ErrorKind::InvalidState,
            AgentError::Stream(_) => ErrorKind::InvalidArgument,
            AgentError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AgentError::Unauthorized(_) => ErrorKind::Unauthorized,
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AgentError::InvalidState(_) => ErrorKind::InvalidState,
            AgentError::Busy(_) => ErrorKind::Busy,
            AgentError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<AgentError> for HttpError {
    fn from(err: AgentError) -> Self {
        let kind = err.kind();
        let code = Some(kind.code().to_string());
        let msg = err.to_string();
        match kind {
            ErrorKind::NotFound => HttpError::for_not_found(code, msg),
            ErrorKind::InvalidArgument => HttpError::for_bad_request(code, msg),
            ErrorKind::Busy => HttpError::for_unavail(code, msg),
            ErrorKind::Unauthorized => HttpError::for_client_error(
                code,
                ClientErrorStatusCode::FORBIDDEN,
                msg,
            ),
            ErrorKind::InvalidState | ErrorKind::ResourceExhausted => {
                HttpError::for_client_error(
                    code,
                    ClientErrorStatusCode::CONFLICT,
                    msg,
                )
            }
            ErrorKind::Internal => HttpError::for_internal_error(msg),
        }
    }
}
