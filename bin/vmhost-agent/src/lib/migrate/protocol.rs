// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration protocol negotiation.
//!
//! Protocols are named "vmhost-migrate-<encoding>/<version>". The
//! destination opens the connection and sends a comma-separated list of
//! the protocols it speaks; the source answers with the newest one it also
//! speaks, or closes the connection.

use std::fmt::Display;
use std::str::FromStr;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

/// Every protocol this agent can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Protocol {
    /// Preamble as RON, then volume 0, user data and the remaining volumes
    /// as blob chunks, then the commit handshake.
    RonV0,
}

impl Protocol {
    pub fn offer_string(&self) -> String {
        ProtocolParts::from(*self).to_string()
    }

    fn from_parts(parts: ProtocolParts) -> Option<Self> {
        Protocol::iter().find(|p| ProtocolParts::from(*p) == parts)
    }
}

const PREFIX: &str = "vmhost-migrate-";
const ENCODING_VERSION_SEPARATOR: char = '/';
const DELIMITER: char = ',';

#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum ProtocolParseError {
    #[error("protocol string did not begin with {PREFIX}: {0}")]
    InvalidPrefix(String),

    #[error("protocol string did not have a '/' separator: {0}")]
    NoEncodingVersionSeparator(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("failed to parse protocol version number {0}: {1}")]
    InvalidVersionNumber(String, String),

    #[error("offered protocol set contained duplicate protocol {0}")]
    DuplicateProtocolInOffer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Encoding {
    Ron,
}

impl Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Ron => f.write_str("ron"),
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ron" => Ok(Encoding::Ron),
            _ => Err(ProtocolParseError::InvalidEncoding(s.to_owned())),
        }
    }
}

// Field order matters: the derived Ord compares versions first, so the
// newest shared version wins regardless of encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ProtocolParts {
    version: u32,
    encoding: Encoding,
}

impl Display for ProtocolParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{PREFIX}{}{ENCODING_VERSION_SEPARATOR}{}",
            self.encoding, self.version
        )
    }
}

impl From<Protocol> for ProtocolParts {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::RonV0 => {
                ProtocolParts { version: 0, encoding: Encoding::Ron }
            }
        }
    }
}

impl FromStr for ProtocolParts {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (encoding, version) = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ProtocolParseError::InvalidPrefix(s.to_owned()))?
            .split_once(ENCODING_VERSION_SEPARATOR)
            .ok_or_else(|| {
                ProtocolParseError::NoEncodingVersionSeparator(s.to_owned())
            })?;

        let encoding = encoding.parse()?;
        let version = version.parse().map_err(|e: std::num::ParseIntError| {
            ProtocolParseError::InvalidVersionNumber(
                version.to_owned(),
                e.to_string(),
            )
        })?;

        Ok(ProtocolParts { encoding, version })
    }
}

lazy_static! {
    static ref SUPPORTED: Vec<ProtocolParts> =
        Protocol::iter().map(ProtocolParts::from).collect();
}

fn join_offers(parts: impl Iterator<Item = ProtocolParts>) -> String {
    parts
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(&DELIMITER.to_string())
}

/// The offer a destination sends when it connects to a source.
pub(super) fn make_protocol_offer() -> String {
    join_offers(SUPPORTED.iter().copied())
}

/// Parses an offer into its protocols, sorted ascending.
fn parse_protocol_offer(
    offer: &str,
) -> Result<Vec<ProtocolParts>, ProtocolParseError> {
    let mut parsed: Vec<ProtocolParts> = Vec::new();
    for o in offer.split(DELIMITER) {
        let protocol: ProtocolParts = o.parse()?;
        if parsed.contains(&protocol) {
            return Err(ProtocolParseError::DuplicateProtocolInOffer(
                protocol.to_string(),
            ));
        }
        parsed.push(protocol);
    }
    parsed.sort_unstable();
    Ok(parsed)
}

/// The newest protocol in `offered` that also appears in `supported`.
fn select_compatible_protocol(
    offered: &[ProtocolParts],
    supported: &[ProtocolParts],
) -> Option<ProtocolParts> {
    offered.iter().filter(|o| supported.contains(o)).max().copied()
}

/// Picks a protocol from a peer's offer. `Ok(None)` means the offer parsed
/// but shares nothing with this agent.
pub(super) fn select_protocol_from_offer(
    offer: &str,
) -> Result<Option<Protocol>, ProtocolParseError> {
    let offered = parse_protocol_offer(offer)?;
    Ok(select_compatible_protocol(&offered, &SUPPORTED)
        .and_then(Protocol::from_parts))
}
