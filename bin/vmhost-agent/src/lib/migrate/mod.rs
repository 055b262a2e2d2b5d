// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving VMs between agents.
//!
//! The destination agent drives: it is asked by a caller to migrate (or
//! copy) a VM, connects to the source agent's migration channel, negotiates
//! a protocol and then pulls the VM's descriptor, root image, user data and
//! secondary volumes, in that order. A migration then waits for the caller's
//! commit decision before either side lets go of its copy.

use std::convert::TryInto;
use std::io;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slog::{error, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{tungstenite, WebSocketStream};
use vmhost_api_types::VmInfo;

use crate::storage::{Blob, BlobReader, BlobWriter};

mod codec;
pub mod destination;
pub mod handshake;
pub mod protocol;
pub mod source;

/// Trait bounds for connection objects used in migrations.
pub(crate) trait MigrateConn:
    AsyncRead + AsyncWrite + Unpin + Send
{
}

impl MigrateConn for tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream> {}
impl MigrateConn for dropshot::WebsocketConnectionRaw {}
#[cfg(test)]
impl MigrateConn for tokio::io::DuplexStream {}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Destination,
}

impl std::fmt::Display for MigrateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrateRole::Source => f.write_str("source"),
            MigrateRole::Destination => f.write_str("destination"),
        }
    }
}

/// Errors which may occur during the course of a migration or copy
#[derive(Clone, Debug, Error, Deserialize, PartialEq, Serialize)]
pub enum MigrateError {
    /// An error as a result of some Websocket operation (i.e. establishing
    /// or maintaining the connection between the source and destination)
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// Failed to initiate the migration protocol
    #[error("couldn't establish migration connection to source agent")]
    Initiate,

    #[error("failed to parse the offered protocol list ({0}): {1}")]
    ProtocolParse(String, String),

    /// The source and destination agents are not compatible
    #[error(
        "the source ({0}) and destination ({1}) agents have no common protocol"
    )]
    NoMatchingProtocol(String, String),

    /// Error parsing a serialized protocol message
    #[error("failed to parse {0}: {1}")]
    Parse(String, String),

    /// Encountered an error as part of encoding/decoding migration messages
    #[error("codec error: {0}")]
    Codec(String),

    /// Received a message out of order
    #[error("received unexpected migration message")]
    UnexpectedMessage,

    #[error("no VM with address {0}")]
    VmNotFound(std::net::IpAddr),

    /// The access token presented to the source was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("VM is destroy-protected")]
    DestroyProtected,

    #[error("VM has been disabled as a migration source")]
    SourceDisabled,

    /// The VM is in the wrong state on one side or the other
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The destination could not reserve what the VM needs
    #[error("insufficient resources: {0}")]
    Resources(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("blob overran its declared length of {0} bytes")]
    BlobOverrun(u64),

    #[error("no commit decision arrived in time")]
    DecisionTimeout,

    #[error("migration aborted")]
    Aborted,

    /// The other end of the migration ran into an error
    #[error("{0} agent encountered error: {1}")]
    RemoteError(MigrateRole, String),
}

impl From<tungstenite::Error> for MigrateError {
    fn from(err: tungstenite::Error) -> MigrateError {
        MigrateError::Websocket(err.to_string())
    }
}

impl From<codec::ProtocolError> for MigrateError {
    fn from(err: codec::ProtocolError) -> Self {
        MigrateError::Codec(err.to_string())
    }
}

impl From<crate::storage::StorageError> for MigrateError {
    fn from(err: crate::storage::StorageError) -> Self {
        MigrateError::Storage(err.to_string())
    }
}

/// Whether the source keeps its copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Move the VM; exactly one side keeps it once a decision is made.
    Migrate,
    /// Duplicate the VM under a new address; the source is left alone.
    Copy,
}

/// The destination's first message after protocol negotiation.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct SourceRequest {
    pub access_token: String,
    pub mode: TransferMode,
    /// How the destination agent names itself, for logs and VM records.
    pub destination: String,
}

/// Everything the destination needs before any data moves.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct Preamble {
    pub vm_info: VmInfo,
    pub volume_sizes: Vec<u64>,
    pub user_data_size: u64,
}

impl Preamble {
    /// Blobs in the order they cross the wire: root image, user data, then
    /// the secondary volumes.
    pub(crate) fn transfer_order(&self) -> Vec<(Blob, u64)> {
        let mut order = Vec::with_capacity(self.volume_sizes.len() + 1);
        if let Some(root) = self.volume_sizes.first() {
            order.push((Blob::Volume(0), *root));
        }
        if self.user_data_size > 0 {
            order.push((Blob::UserData, self.user_data_size));
        }
        order.extend(
            self.volume_sizes
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, size)| (Blob::Volume(i), *size)),
        );
        order
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.volume_sizes.iter().sum::<u64>() + self.user_data_size
    }
}

/// One end of an established migration connection.
pub(crate) struct Link<T: MigrateConn> {
    conn: WebSocketStream<T>,
    /// The role of the agent on the other end.
    peer: MigrateRole,
    log: Logger,
}

impl<T: MigrateConn> Link<T> {
    pub(crate) fn new(
        conn: WebSocketStream<T>,
        peer: MigrateRole,
        log: Logger,
    ) -> Self {
        Self { conn, peer, log }
    }

    pub(crate) async fn read_msg(
        &mut self,
    ) -> Result<codec::Message, MigrateError> {
        loop {
            let frame = self
                .conn
                .next()
                .await
                .ok_or_else(|| {
                    codec::ProtocolError::Io(io::Error::from(
                        io::ErrorKind::BrokenPipe,
                    ))
                })?
                .map_err(codec::ProtocolError::WebsocketError)?;
            if matches!(
                frame,
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)
            ) {
                continue;
            }
            // If this is an error message, lift that out
            let msg: codec::Message = frame.try_into()?;
            return match msg {
                codec::Message::Error(err) => {
                    error!(
                        self.log,
                        "migration failed due to error from {}: {err}",
                        self.peer
                    );
                    Err(MigrateError::RemoteError(self.peer, err.to_string()))
                }
                msg => Ok(msg),
            };
        }
    }

    pub(crate) async fn read_ok(&mut self) -> Result<(), MigrateError> {
        match self.read_msg().await? {
            codec::Message::Okay => Ok(()),
            codec::Message::Abort => Err(MigrateError::Aborted),
            msg => {
                error!(self.log, "expected `Okay` but received: {msg:?}");
                Err(MigrateError::UnexpectedMessage)
            }
        }
    }

    pub(crate) async fn send_msg(
        &mut self,
        m: codec::Message,
    ) -> Result<(), MigrateError> {
        Ok(self.conn.send(m.try_into()?).await?)
    }

    pub(crate) async fn read_serialized<D: DeserializeOwned>(
        &mut self,
        what: &str,
    ) -> Result<D, MigrateError> {
        match self.read_msg().await? {
            codec::Message::Serialized(s) => {
                ron::de::from_str(&s).map_err(|e| {
                    MigrateError::Parse(what.to_string(), e.to_string())
                })
            }
            msg => {
                error!(self.log, "expected {what} but received: {msg:?}");
                Err(MigrateError::UnexpectedMessage)
            }
        }
    }

    pub(crate) async fn send_serialized<S: Serialize>(
        &mut self,
        value: &S,
    ) -> Result<(), MigrateError> {
        let s = ron::ser::to_string(value)
            .map_err(|e| MigrateError::Codec(e.to_string()))?;
        self.send_msg(codec::Message::Serialized(s)).await
    }

    /// Streams exactly `len` bytes of `src` as blob chunks.
    pub(crate) async fn send_blob(
        &mut self,
        src: &mut BlobReader,
        len: u64,
    ) -> Result<(), MigrateError> {
        let mut remaining = len;
        let mut buf = vec![0u8; codec::BLOB_CHUNK_SIZE];
        while remaining > 0 {
            let want = usize::try_from(remaining)
                .map_or(buf.len(), |r| r.min(buf.len()));
            let n = src
                .read(&mut buf[..want])
                .await
                .map_err(|e| MigrateError::Storage(e.to_string()))?;
            if n == 0 {
                return Err(MigrateError::Storage(format!(
                    "blob ended {remaining} bytes short"
                )));
            }
            self.send_msg(codec::Message::Blob(buf[..n].to_vec())).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Receives exactly `len` bytes of blob chunks into `dst`.
    pub(crate) async fn recv_blob(
        &mut self,
        dst: &mut BlobWriter,
        len: u64,
    ) -> Result<(), MigrateError> {
        let mut remaining = len;
        while remaining > 0 {
            match self.read_msg().await? {
                codec::Message::Blob(chunk) => {
                    let n = chunk.len() as u64;
                    if n > remaining {
                        return Err(MigrateError::BlobOverrun(len));
                    }
                    dst.write_all(&chunk)
                        .await
                        .map_err(|e| MigrateError::Storage(e.to_string()))?;
                    remaining -= n;
                }
                codec::Message::Abort => return Err(MigrateError::Aborted),
                msg => {
                    error!(
                        self.log,
                        "expected blob data but received: {msg:?}"
                    );
                    return Err(MigrateError::UnexpectedMessage);
                }
            }
        }
        dst.shutdown().await.map_err(|e| MigrateError::Storage(e.to_string()))
    }

    /// Tells the peer why we are bailing out. This is best effort: a failure
    /// to send must not shadow `err`.
    pub(crate) async fn fail(&mut self, err: &MigrateError) {
        let _ = self.send_msg(codec::Message::Error(err.clone())).await;
    }

    pub(crate) async fn close(mut self) {
        let _ = self.conn.close(None).await;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    pub(crate) async fn link_pair() -> (
        Link<tokio::io::DuplexStream>,
        Link<tokio::io::DuplexStream>,
    ) {
        let log = Logger::root(slog::Discard, slog::o!());
        let (a, b) = tokio::io::duplex(1 << 16);
        let dst = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let src = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (
            Link::new(dst, MigrateRole::Source, log.clone()),
            Link::new(src, MigrateRole::Destination, log),
        )
    }

    #[test]
    fn transfer_order_puts_user_data_after_root() {
        let p = Preamble {
            vm_info: VmInfo::default(),
            volume_sizes: vec![10, 20, 30],
            user_data_size: 5,
        };
        let order: Vec<Blob> =
            p.transfer_order().into_iter().map(|(b, _)| b).collect();
        assert_eq!(
            order,
            [Blob::Volume(0), Blob::UserData, Blob::Volume(1), Blob::Volume(2)]
        );
        assert_eq!(p.total_bytes(), 65);

        let no_user_data = Preamble { user_data_size: 0, ..p };
        assert_eq!(no_user_data.transfer_order().len(), 3);
    }

    #[tokio::test]
    async fn blobs_and_structured_messages_cross_the_link() {
        let (mut dst, mut src) = link_pair().await;
        let payload: Vec<u8> = (0..(codec::BLOB_CHUNK_SIZE + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let len = payload.len() as u64;

        let sent = payload.clone();
        let sender = tokio::spawn(async move {
            let req: SourceRequest =
                src.read_serialized("request").await.unwrap();
            assert_eq!(req.mode, TransferMode::Copy);
            let mut reader: BlobReader = Box::new(std::io::Cursor::new(sent));
            src.send_blob(&mut reader, len).await.unwrap();
            src.read_ok().await.unwrap();
        });

        dst.send_serialized(&SourceRequest {
            access_token: "t".to_string(),
            mode: TransferMode::Copy,
            destination: "dst:1".to_string(),
        })
        .await
        .unwrap();
        let (mut rd, wr) = tokio::io::duplex(len as usize * 2);
        let mut writer: BlobWriter = Box::new(wr);
        dst.recv_blob(&mut writer, len).await.unwrap();
        dst.send_msg(codec::Message::Okay).await.unwrap();
        sender.await.unwrap();

        let mut received = Vec::new();
        rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn remote_errors_are_lifted() {
        let (mut dst, mut src) = link_pair().await;
        src.fail(&MigrateError::SourceDisabled).await;
        assert_eq!(
            dst.read_ok().await,
            Err(MigrateError::RemoteError(
                MigrateRole::Source,
                MigrateError::SourceDisabled.to_string()
            ))
        );
    }

    #[tokio::test]
    async fn short_blob_is_an_error() {
        let (_dst, mut src) = link_pair().await;
        let mut reader: BlobReader =
            Box::new(std::io::Cursor::new(vec![1u8; 4]));
        assert!(matches!(
            src.send_blob(&mut reader, 8).await,
            Err(MigrateError::Storage(_))
        ));
    }
}
