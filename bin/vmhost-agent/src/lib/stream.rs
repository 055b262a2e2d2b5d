// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-facing streamed calls.
//!
//! A streamed call runs over a websocket. Structured messages are JSON in
//! Text frames; bulk payloads (image, user data, volume contents) follow
//! their declaring request as Binary frames whose lengths add up to the
//! size the request declared.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use vmhost_api_types::{
    CopyVmResponse, CreateVmResponse, HoldLockResponse, ImageProgressResponse,
    MigrateVmResponse,
};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed by peer")]
    Closed,

    #[error("websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("payload overran its declared length of {0} bytes")]
    PayloadOverrun(u64),

    #[error("I/O error writing payload: {0}")]
    Io(#[from] std::io::Error),
}

/// A progress-reporting response type: progress frames carry a message,
/// and exactly one final frame ends the call.
pub trait ProgressFrame: Serialize + Default {
    fn set_message(&mut self, message: String);
    fn set_error(&mut self, error: String);
    fn set_final(&mut self);

    fn progress(message: impl Into<String>) -> Self {
        let mut frame = Self::default();
        frame.set_message(message.into());
        frame
    }

    fn failure(error: String) -> Self {
        let mut frame = Self::default();
        frame.set_error(error);
        frame.set_final();
        frame
    }
}

macro_rules! impl_progress_frame {
    ($($t:ty),*) => {
        $(
            impl ProgressFrame for $t {
                fn set_message(&mut self, message: String) {
                    self.progress_message = message;
                }
                fn set_error(&mut self, error: String) {
                    self.error = Some(error);
                }
                fn set_final(&mut self) {
                    self.is_final = true;
                }
            }
        )*
    };
}

impl_progress_frame!(
    CreateVmResponse,
    MigrateVmResponse,
    CopyVmResponse,
    ImageProgressResponse
);

impl ProgressFrame for HoldLockResponse {
    fn set_message(&mut self, _message: String) {}
    fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }
    fn set_final(&mut self) {
        self.is_final = true;
    }
}

/// Bounds for the connection under a [`Conversation`].
pub trait StreamConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamConn for T {}

pub struct Conversation<S> {
    ws: WebSocketStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conversation<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// The next frame that is not a ping or pong.
    async fn next_frame(&mut self) -> Result<Message, StreamError> {
        loop {
            match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => {
                    return Err(StreamError::Closed)
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(m)) => return Ok(m),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Reads the next structured message.
    pub async fn recv<T: DeserializeOwned>(
        &mut self,
    ) -> Result<T, StreamError> {
        match self.next_frame().await? {
            Message::Text(s) => Ok(serde_json::from_str(&s)?),
            _ => Err(StreamError::UnexpectedFrame("binary")),
        }
    }

    pub async fn send<T: Serialize>(
        &mut self,
        msg: &T,
    ) -> Result<(), StreamError> {
        let text = serde_json::to_string(msg)?;
        Ok(self.ws.send(Message::Text(text)).await?)
    }

    /// Sends raw payload bytes.
    pub async fn send_payload(
        &mut self,
        data: Vec<u8>,
    ) -> Result<(), StreamError> {
        Ok(self.ws.send(Message::Binary(data)).await?)
    }

    /// Copies exactly `len` payload bytes into `sink`.
    pub async fn read_payload<W: AsyncWrite + Unpin + ?Sized>(
        &mut self,
        len: u64,
        sink: &mut W,
    ) -> Result<(), StreamError> {
        let mut remaining = len;
        while remaining > 0 {
            match self.next_frame().await? {
                Message::Binary(chunk) => {
                    let n = chunk.len() as u64;
                    if n > remaining {
                        return Err(StreamError::PayloadOverrun(len));
                    }
                    sink.write_all(&chunk).await?;
                    remaining -= n;
                }
                _ => return Err(StreamError::UnexpectedFrame("text")),
            }
        }
        Ok(())
    }

    /// Discards `len` payload bytes the caller already sent.
    pub async fn skip_payload(&mut self, len: u64) -> Result<(), StreamError> {
        self.read_payload(len, &mut tokio::io::sink()).await
    }

    pub async fn progress<F: ProgressFrame>(
        &mut self,
        message: impl Into<String>,
    ) -> Result<(), StreamError> {
        self.send(&F::progress(message)).await
    }

    /// Sends the final frame for `result`: the frame itself marked final, or
    /// a failure frame carrying the error text.
    pub async fn finish<F: ProgressFrame, E: std::fmt::Display>(
        &mut self,
        result: Result<F, E>,
    ) -> Result<(), StreamError> {
        let frame = match result {
            Ok(mut frame) => {
                frame.set_final();
                frame
            }
            Err(e) => F::failure(e.to_string()),
        };
        self.send(&frame).await
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    pub(crate) async fn pair(
        ) -> (Conversation<DuplexStream>, WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let server =
            WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client =
            WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (Conversation::new(server), client)
    }

    #[tokio::test]
    async fn request_then_payload() {
        let (mut conv, mut client) = pair().await;
        client
            .send(Message::Text(r#"{"size": 6}"#.to_string()))
            .await
            .unwrap();
        client.send(Message::Ping(vec![])).await.unwrap();
        client.send(Message::Binary(b"abc".to_vec())).await.unwrap();
        client.send(Message::Binary(b"def".to_vec())).await.unwrap();

        let req: vmhost_api_types::ReplaceVmUserDataRequest =
            conv.recv().await.unwrap();
        assert_eq!(req.size, 6);
        let mut out = Vec::new();
        conv.read_payload(req.size, &mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn overrun_and_close() {
        let (mut conv, mut client) = pair().await;
        client.send(Message::Binary(vec![0; 8])).await.unwrap();
        assert!(matches!(
            conv.read_payload(4, &mut tokio::io::sink()).await,
            Err(StreamError::PayloadOverrun(4))
        ));
        client.close(None).await.unwrap();
        assert!(matches!(
            conv.recv::<HoldLockResponse>().await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn final_frames() {
        let (mut conv, mut client) = pair().await;
        conv.progress::<ImageProgressResponse>("copying").await.unwrap();
        conv.finish::<ImageProgressResponse, String>(Err(
            "disk full".to_string()
        ))
        .await
        .unwrap();

        let Some(Ok(Message::Text(first))) = client.next().await else {
            panic!("expected a text frame");
        };
        let first: ImageProgressResponse =
            serde_json::from_str(&first).unwrap();
        assert_eq!(first.progress_message, "copying");
        assert!(!first.is_final);

        let Some(Ok(Message::Text(last))) = client.next().await else {
            panic!("expected a text frame");
        };
        let last: ImageProgressResponse = serde_json::from_str(&last).unwrap();
        assert!(last.is_final);
        assert_eq!(last.error.as_deref(), Some("disk full"));
    }
}
