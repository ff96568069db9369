//! Frame-level transport shared by both sides of a session.
//!
//! The caller side is an axum `WebSocket`, the upstream side a
//! `tokio-tungstenite` client stream. Both are adapted into a `Link` so the
//! session never depends on a concrete socket type.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::protocol::Message as WsMessage};

/// A single data frame. Ping/pong never reaches this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// One duplex connection, split into its read and write halves.
pub struct Link {
    pub inbound: FrameStream,
    pub outbound: FrameSink,
}

impl Link {
    pub fn new(inbound: FrameStream, outbound: FrameSink) -> Self {
        Self { inbound, outbound }
    }

    /// Adapts an upgraded caller socket.
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let inbound = stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Err(e) => Some(Err(TransportError(e.to_string()))),
            }
        });
        let outbound = sink
            .sink_map_err(|e| TransportError(e.to_string()))
            .with(|frame: Frame| async move {
                Ok::<_, TransportError>(match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(data) => Message::Binary(data),
                    Frame::Close => Message::Close(None),
                })
            });
        Self::new(Box::pin(inbound), Box::pin(outbound))
    }

    /// Adapts an outbound client connection to the upstream AI.
    pub fn from_tungstenite(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (sink, stream) = stream.split();
        let inbound = stream.filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(WsMessage::Close(_)) => Some(Ok(Frame::Close)),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => None,
                Err(e) => Some(Err(TransportError(e.to_string()))),
            }
        });
        let outbound = sink
            .sink_map_err(|e| TransportError(e.to_string()))
            .with(|frame: Frame| async move {
                Ok::<_, TransportError>(match frame {
                    Frame::Text(text) => WsMessage::Text(text.into()),
                    Frame::Binary(data) => WsMessage::Binary(data),
                    Frame::Close => WsMessage::Close(None),
                })
            });
        Self::new(Box::pin(inbound), Box::pin(outbound))
    }
}

/// In-memory links for driving sessions from tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc;
    use serde_json::Value;
    use std::time::Duration;

    /// The far end of an in-memory `Link`.
    pub struct LinkPeer {
        to_link: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        from_link: mpsc::UnboundedReceiver<Frame>,
    }

    pub fn link_pair() -> (Link, LinkPeer) {
        let (to_link, inbound) = mpsc::unbounded();
        let (outbound, from_link) = mpsc::unbounded();
        let link = Link::new(
            Box::pin(inbound),
            Box::pin(outbound.sink_map_err(|e| TransportError(e.to_string()))),
        );
        (link, LinkPeer { to_link, from_link })
    }

    impl LinkPeer {
        pub fn send_text(&self, text: &str) {
            let _ = self.to_link.unbounded_send(Ok(Frame::Text(text.to_string())));
        }

        pub fn send_json(&self, value: Value) {
            self.send_text(&value.to_string());
        }

        pub fn send_binary(&self, data: &'static [u8]) {
            let _ = self.to_link.unbounded_send(Ok(Frame::Binary(Bytes::from_static(data))));
        }

        pub fn send_close(&self) {
            let _ = self.to_link.unbounded_send(Ok(Frame::Close));
        }

        pub fn fail(&self, reason: &str) {
            let _ = self.to_link.unbounded_send(Err(TransportError(reason.to_string())));
        }

        /// Next frame the link wrote, or `None` once the link hung up.
        pub async fn next_frame(&mut self) -> Option<Frame> {
            tokio::time::timeout(Duration::from_secs(30), self.from_link.next())
                .await
                .expect("timed out waiting for a frame")
        }

        /// Next text frame parsed as JSON. Panics on anything else.
        pub async fn next_json(&mut self) -> Value {
            match self.next_frame().await {
                Some(Frame::Text(text)) => serde_json::from_str(&text).expect("frame is not JSON"),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        /// Skips frames until one with the given `type` arrives.
        pub async fn next_of_type(&mut self, kind: &str) -> Value {
            loop {
                let value = self.next_json().await;
                if value["type"] == kind {
                    return value;
                }
            }
        }

        /// Drains frames until the link closes, returning everything seen.
        pub async fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Some(frame) = self.next_frame().await {
                frames.push(frame);
            }
            frames
        }
    }
}
