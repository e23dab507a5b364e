//! One physical WebSocket connection.
//!
//! Each connection runs its own I/O task and reports back on a shared event
//! channel, tagging every event with the generation it was opened under.
//! The engine drops events from superseded generations, so a late close
//! from an old socket can never clobber the current one.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, SyncError};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    FrameReceived(String),
    Disconnected { reason: String, code: Option<u16> },
    TransportError(String),
}

#[derive(Debug)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub endpoint: String,
    pub auth_token: Option<String>,
}

#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Opens the socket, attaching the bearer token to the upgrade request.
pub(crate) async fn open_stream(target: &ConnectTarget, timeout: Duration) -> Result<WsStream> {
    let mut request = target
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| SyncError::Transport(format!("invalid endpoint: {err}")))?;

    if let Some(token) = target.auth_token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| SyncError::Transport(format!("invalid auth token: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(err)) => Err(SyncError::Transport(err.to_string())),
        Err(_) => Err(SyncError::Transport(format!(
            "connect timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

pub(crate) fn normal_close() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    }))
}

/// Handle to a live (or connecting) socket owned by the engine actor.
#[derive(Debug)]
pub struct TransportConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl TransportConnection {
    pub fn open(
        generation: u64,
        target: ConnectTarget,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            generation,
            target,
            connect_timeout,
            outbound_rx,
            events,
        ));
        Self { outbound, task }
    }

    pub fn send(&self, frame: String) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SyncError::NotConnected)
    }

    /// Sends a normal close. The I/O task exits on its own once the close
    /// is flushed.
    pub fn close(self) {
        if self.outbound.send(Outbound::Close).is_err() {
            self.task.abort();
        }
    }
}

async fn run_connection(
    generation: u64,
    target: ConnectTarget,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TaggedEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(TaggedEvent { generation, event });
    };

    let stream = tokio::select! {
        result = open_stream(&target, connect_timeout) => match result {
            Ok(stream) => stream,
            Err(err) => {
                emit(TransportEvent::TransportError(err.to_string()));
                return;
            }
        },
        // Closed (or superseded) before the socket opened.
        _ = wait_for_close(&mut outbound_rx) => return,
    };

    tracing::debug!(generation, endpoint = %target.endpoint, "Socket open");
    emit(TransportEvent::Connected);

    let (mut sink, mut reader) = stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    emit(TransportEvent::FrameReceived(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                        None => (None, "closed without status".to_string()),
                    };
                    emit(TransportEvent::Disconnected { reason, code });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    emit(TransportEvent::TransportError(err.to_string()));
                    return;
                }
                None => {
                    emit(TransportEvent::Disconnected {
                        reason: "stream ended".to_string(),
                        code: None,
                    });
                    return;
                }
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                        emit(TransportEvent::TransportError(err.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(err) = sink.send(normal_close()).await {
                        tracing::debug!(error = %err, "Close frame not delivered");
                    }
                    let _ = sink.close().await;
                    emit(TransportEvent::Disconnected {
                        reason: "closed by client".to_string(),
                        code: Some(tether_protocol::NORMAL_CLOSE_CODE),
                    });
                    return;
                }
            },
        }
    }
}

async fn wait_for_close(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match outbound_rx.recv().await {
            Some(Outbound::Close) | None => return,
            // The engine only sends after `Connected`.
            Some(Outbound::Frame(_)) => {
                tracing::warn!("Dropping frame sent before socket opened");
            }
        }
    }
}
