//! Message transport seam of the proxy.
//!
//! The session state machine only sees text frames and close frames, so it
//! runs unchanged over the axum server socket, the tungstenite backend
//! socket, or an in-process channel pair in tests.

use core::fmt;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::dialer::BackendWs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: Option<u16>, reason: String },
}

#[derive(Debug, Error)]
#[error("transport failed: {0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait MessageSource: Send {
    /// Next frame; `None` once the peer is gone without a close frame.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError>;
}

/// Both halves of one peer.
pub struct MessageStream {
    pub source: Box<dyn MessageSource>,
    pub sink: Box<dyn MessageSink>,
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

// ----- axum (client leg) ----- //

pub fn from_client_ws(ws: axum::extract::ws::WebSocket) -> MessageStream {
    let (sink, source) = ws.split();
    MessageStream {
        source: Box::new(ClientSource(source)),
        sink: Box::new(ClientSink(sink)),
    }
}

struct ClientSource(SplitStream<axum::extract::ws::WebSocket>);

#[async_trait]
impl MessageSource for ClientSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        use axum::extract::ws::Message;

        loop {
            return match self.0.next().await {
                None => Ok(None),
                Some(Err(error)) => Err(TransportError(error.to_string())),
                Some(Ok(message)) => match message {
                    Message::Text(text) => Ok(Some(Frame::Text(text.as_str().to_owned()))),
                    Message::Binary(data) => String::from_utf8(data.to_vec())
                        .map(|text| Some(Frame::Text(text)))
                        .map_err(|_| TransportError("binary frame is not valid UTF-8".to_owned())),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(frame.code), frame.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        Ok(Some(Frame::Close { code, reason }))
                    }
                },
            };
        }
    }
}

struct ClientSink(SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>);

#[async_trait]
impl MessageSink for ClientSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        use axum::extract::ws::Message;

        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| TransportError(error.to_string()))
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        use axum::extract::ws::{CloseFrame, Message};

        // The peer may already be gone; a failed close is not interesting.
        let _ = self
            .0
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;

        Ok(())
    }
}

// ----- tungstenite (backend leg) ----- //

pub fn from_backend_ws(ws: BackendWs) -> MessageStream {
    let (sink, source) = ws.split();
    MessageStream {
        source: Box::new(BackendSource(source)),
        sink: Box::new(BackendSink(sink)),
    }
}

struct BackendSource(SplitStream<BackendWs>);

#[async_trait]
impl MessageSource for BackendSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        use tungstenite::Message;

        loop {
            return match self.0.next().await {
                None => Ok(None),
                Some(Err(error)) => Err(TransportError(error.to_string())),
                Some(Ok(message)) => match message {
                    Message::Text(text) => Ok(Some(Frame::Text(text.as_str().to_owned()))),
                    Message::Binary(data) => String::from_utf8(data.to_vec())
                        .map(|text| Some(Frame::Text(text)))
                        .map_err(|_| TransportError("binary frame is not valid UTF-8".to_owned())),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        Ok(Some(Frame::Close { code, reason }))
                    }
                },
            };
        }
    }
}

struct BackendSink(SplitSink<BackendWs, tungstenite::Message>);

#[async_trait]
impl MessageSink for BackendSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        use tungstenite::Message;

        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| TransportError(error.to_string()))
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        use tungstenite::Message;
        use tungstenite::protocol::CloseFrame;
        use tungstenite::protocol::frame::coding::CloseCode;

        let _ = self
            .0
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })))
            .await;

        Ok(())
    }
}

// ----- in-process pair ----- //

/// Two cross-wired endpoints carrying frames over bounded channels.
/// What one endpoint sends, the other receives.
pub fn channel_pair(capacity: usize) -> (MessageStream, MessageStream) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);

    let left = MessageStream {
        source: Box::new(ChannelSource(a_rx)),
        sink: Box::new(ChannelSink(b_tx)),
    };
    let right = MessageStream {
        source: Box::new(ChannelSource(b_rx)),
        sink: Box::new(ChannelSink(a_tx)),
    };

    (left, right)
}

struct ChannelSource(mpsc::Receiver<Frame>);

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.0.recv().await)
    }
}

struct ChannelSink(mpsc::Sender<Frame>);

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Frame::Text(text))
            .await
            .map_err(|_| TransportError("peer endpoint dropped".to_owned()))
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        let _ = self.0.send(Frame::Close { code: Some(code), reason }).await;
        Ok(())
    }
}
