// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the agent-to-agent migration protocol.
//!
//! Every message travels in one Binary websocket frame whose last byte is
//! the message tag. Structured payloads (the preamble, errors) are RON text;
//! volume and user-data contents are sent as uninterpreted blob chunks whose
//! boundaries are implied by the sizes announced in the preamble.

use super::MigrateError;
use bytes::{BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Largest blob chunk a sender emits.
pub const BLOB_CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("couldn't decode message type ({0})")]
    InvalidMessageType(u8),

    #[error("unexpected message length {1} for type {0:?}")]
    UnexpectedMessageLen(u8, usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Ron(#[from] ron::Error),

    #[error("deserialization error: {0}")]
    RonSpanned(#[from] ron::error::SpannedError),

    #[error("non-UTF8 string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Nothing, not even a tag byte
    #[error("received empty message with no discriminant")]
    EmptyMessage,

    #[error("error occurred in websocket layer: {0}")]
    WebsocketError(tungstenite::Error),

    #[error("unexpected websocket message {0:?}")]
    UnexpectedWebsocketMessage(tungstenite::Message),
}

#[derive(Debug)]
pub(crate) enum Message {
    Okay,
    Error(MigrateError),
    Serialized(String),
    Blob(Vec<u8>),
    /// Sent by the destination once it has committed the VM locally.
    Commit,
    Abort,
}

/// Wire tags, kept in bijection with [`Message`].
#[derive(Debug, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MessageType {
    Okay,
    Error,
    Serialized,
    Blob,
    Commit,
    Abort,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::Okay => MessageType::Okay,
            Message::Error(_) => MessageType::Error,
            Message::Serialized(_) => MessageType::Serialized,
            Message::Blob(_) => MessageType::Blob,
            Message::Commit => MessageType::Commit,
            Message::Abort => MessageType::Abort,
        }
    }
}

impl std::convert::TryInto<tungstenite::Message> for Message {
    type Error = ProtocolError;
    fn try_into(self) -> Result<tungstenite::Message, ProtocolError> {
        let tag = MessageType::from(&self) as u8;
        let mut dst = Vec::new();
        match self {
            Message::Okay | Message::Commit | Message::Abort => {}
            Message::Error(e) => {
                dst.put_slice(ron::ser::to_string(&e)?.as_bytes());
            }
            Message::Serialized(s) => dst.put_slice(s.as_bytes()),
            Message::Blob(mut bytes) => {
                // Reuse the chunk's allocation for the frame.
                bytes.push(tag);
                return Ok(tungstenite::Message::Binary(bytes));
            }
        }
        dst.push(tag);
        Ok(tungstenite::Message::Binary(dst))
    }
}

fn expect_empty(tag: MessageType, src: &Bytes) -> Result<(), ProtocolError> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedMessageLen(tag as u8, src.len()))
    }
}

impl std::convert::TryInto<Message> for tungstenite::Message {
    type Error = ProtocolError;
    fn try_into(self) -> Result<Message, ProtocolError> {
        let tungstenite::Message::Binary(mut v) = self else {
            return Err(ProtocolError::UnexpectedWebsocketMessage(self));
        };
        let tag_byte = v.pop().ok_or(ProtocolError::EmptyMessage)?;
        let tag = MessageType::try_from(tag_byte)
            .map_err(|_| ProtocolError::InvalidMessageType(tag_byte))?;
        if tag == MessageType::Blob {
            return Ok(Message::Blob(v));
        }
        let src = Bytes::from(v);
        let m = match tag {
            MessageType::Okay => {
                expect_empty(tag, &src)?;
                Message::Okay
            }
            MessageType::Commit => {
                expect_empty(tag, &src)?;
                Message::Commit
            }
            MessageType::Abort => {
                expect_empty(tag, &src)?;
                Message::Abort
            }
            MessageType::Error => {
                Message::Error(ron::de::from_str(std::str::from_utf8(&src)?)?)
            }
            MessageType::Serialized => {
                Message::Serialized(std::str::from_utf8(&src)?.to_string())
            }
            MessageType::Blob => Message::Blob(src.to_vec()),
        };
        Ok(m)
    }
}

#[cfg(test)]
mod encoder_tests {
    use super::*;
    use std::convert::TryInto;

    fn encode(m: Message) -> Vec<u8> {
        match m.try_into().unwrap() {
            tungstenite::Message::Binary(bytes) => bytes,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn bare_tags() {
        assert_eq!(encode(Message::Okay), [MessageType::Okay as u8]);
        assert_eq!(encode(Message::Commit), [MessageType::Commit as u8]);
        assert_eq!(encode(Message::Abort), [MessageType::Abort as u8]);
    }

    #[test]
    fn encode_error() {
        let mut bytes = encode(Message::Error(MigrateError::SourceDisabled));
        assert_eq!(bytes.pop(), Some(MessageType::Error as u8));
        assert_eq!(&bytes[..], b"SourceDisabled");
    }

    #[test]
    fn encode_serialized() {
        let mut bytes = encode(Message::Serialized("(a: 1)".to_string()));
        assert_eq!(bytes.pop(), Some(MessageType::Serialized as u8));
        assert_eq!(&bytes[..], b"(a: 1)");
    }

    #[test]
    fn encode_blob() {
        assert_eq!(encode(Message::Blob(vec![])), [MessageType::Blob as u8]);
        assert_eq!(
            encode(Message::Blob(vec![1, 2, 3])),
            [1, 2, 3, MessageType::Blob as u8]
        );
    }
}
