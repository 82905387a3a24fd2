//! Socket transports.
//!
//! A transport turns a URL into a pair of channels: commands flowing to the
//! socket and events flowing back. Closing is always reported as a
//! `SocketEvent::Closed`, or by the event channel ending, which callers
//! treat as an abnormal close (1006).

use crate::error::{DeliveryError, DeliveryResult};
use crate::websocket::frames::Frame;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
pub struct SocketChannels {
    pub commands: mpsc::UnboundedSender<SocketCommand>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve once the socket is open
    async fn connect(&self, url: &Url) -> DeliveryResult<SocketChannels>;
}

/// tokio-tungstenite client
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> DeliveryResult<SocketChannels> {
        let (stream, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SocketCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let result = match command {
                    SocketCommand::Text(text) => sink.send(WsMessage::text(text)).await,
                    SocketCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut close = None;
            while let Some(next) = source.next().await {
                match next {
                    Ok(WsMessage::Text(text)) => {
                        if event_tx.send(SocketEvent::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        close = Some(match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                            None => (CLOSE_NO_STATUS, String::new()),
                        });
                        break;
                    }
                    // Control frames are answered by tungstenite; binary is not part of the protocol
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let (code, reason) =
                close.unwrap_or_else(|| (CLOSE_ABNORMAL, "connection lost".to_string()));
            let _ = event_tx.send(SocketEvent::Closed { code, reason });
        });

        Ok(SocketChannels {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// How the next `MemoryTransport::connect` behaves
#[derive(Debug, Clone)]
pub enum ConnectStep {
    Accept,
    Refuse(String),
    /// Never resolves; exercises the connect deadline
    Hang,
}

/// Server side of an accepted in-process socket
#[derive(Debug)]
pub struct MemorySocket {
    pub url: Url,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MemorySocket {
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.events.send(SocketEvent::Text(text.into())).is_ok()
    }

    pub fn push_frame(&self, frame: &Frame) -> bool {
        match frame.to_json() {
            Ok(text) => self.push_text(text),
            Err(_) => false,
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Next command the client wrote, or `None` once the client hung up
    pub async fn next_command(&mut self) -> Option<SocketCommand> {
        self.commands.recv().await
    }

    /// Next text frame the client wrote; `None` on close or hang-up
    pub async fn next_text(&mut self) -> Option<String> {
        match self.commands.recv().await? {
            SocketCommand::Text(text) => Some(text),
            SocketCommand::Close { .. } => None,
        }
    }

    /// Everything written so far, without waiting
    pub fn drain(&mut self) -> Vec<SocketCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            out.push(command);
        }
        out
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    script: VecDeque<ConnectStep>,
    connects: u32,
}

/// In-process transport with scripted connect outcomes. Unscripted
/// connects are accepted; each accepted socket is handed to the receiver
/// returned by `new`.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    accepted: mpsc::UnboundedSender<MemorySocket>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySocket>) {
        let (accepted, sockets) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(MemoryState::default())),
                accepted,
            },
            sockets,
        )
    }

    pub fn script(&self, step: ConnectStep) {
        self.state.lock().script.push_back(step);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &Url) -> DeliveryResult<SocketChannels> {
        let step = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.script.pop_front().unwrap_or(ConnectStep::Accept)
        };

        match step {
            ConnectStep::Accept => {}
            ConnectStep::Refuse(reason) => return Err(DeliveryError::Network(reason)),
            ConnectStep::Hang => std::future::pending::<()>().await,
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(MemorySocket {
                url: url.clone(),
                commands: command_rx,
                events: event_tx,
            })
            .map_err(|_| DeliveryError::Network("memory server is gone".to_string()))?;

        Ok(SocketChannels {
            commands: command_tx,
            events: event_rx,
        })
    }
}
