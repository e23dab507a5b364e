//! Push-notification delivery and background history fetch.
//!
//! Runs without the primary connection: the pushed message is persisted
//! directly, then a short-lived secondary socket fetches whatever else the
//! session produced while the app was away. Nothing here touches the
//! primary connection's reconnect schedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tether_protocol::{
    parse_timestamp, Envelope, HistoryMessage, HistoryRequest, Payload, PushPayload,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::BackgroundFetchConfig;
use crate::correlator::new_correlation_id;
use crate::error::{Result, SyncError};
use crate::persistence::PersistenceStore;
use crate::transport::{normal_close, open_stream, ConnectTarget, WsStream};
use crate::types::{
    new_id, Message, MessageSessionMetadata, ProjectDescriptor, Sender, StreamingState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Not an app payload; leave it to the OS.
    Ignored,
    /// Relevant, but no project could be resolved to store it under.
    Unroutable,
    Stored {
        project_id: String,
        session_id: String,
        message_count: usize,
        fetched: usize,
    },
}

/// Secondary connection used only to pull missed history.
#[derive(Debug, Clone)]
pub struct BackgroundFetcher {
    target: ConnectTarget,
    config: BackgroundFetchConfig,
}

impl BackgroundFetcher {
    pub fn new(target: ConnectTarget, config: BackgroundFetchConfig) -> Self {
        Self { target, config }
    }

    pub async fn fetch_history(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut stream = open_stream(&self.target, self.config.connect_timeout()).await?;
        let correlation_id = new_correlation_id();
        let fetch_timeout = self.config.fetch_timeout();

        let result = tokio::time::timeout(
            fetch_timeout,
            exchange_history(&mut stream, session_id, since, &correlation_id),
        )
        .await;

        if let Err(err) = stream.send(normal_close()).await {
            tracing::debug!(error = %err, "Background fetch close not delivered");
        }

        match result {
            Ok(history) => history,
            Err(_) => Err(SyncError::CorrelationTimeout {
                correlation_id,
                waited_secs: fetch_timeout.as_secs(),
            }),
        }
    }
}

async fn exchange_history(
    stream: &mut WsStream,
    session_id: &str,
    since: Option<DateTime<Utc>>,
    correlation_id: &str,
) -> Result<Vec<Message>> {
    let mut requested = false;
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|err| SyncError::Transport(err.to_string()))?;
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let envelope = match Envelope::decode(text.as_str()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "Ignoring frame during background fetch");
                continue;
            }
        };

        match envelope.payload {
            Payload::Welcome(_) if !requested => {
                let request = Envelope::new(Payload::GetSessionHistory(HistoryRequest {
                    session_id: session_id.to_string(),
                    since,
                }))
                .with_correlation_id(correlation_id);
                stream
                    .send(WsMessage::Text(request.encode()?.into()))
                    .await
                    .map_err(|err| SyncError::Transport(err.to_string()))?;
                requested = true;
            }
            Payload::SessionHistory(history)
                if envelope.correlation_id.as_deref() == Some(correlation_id)
                    || history.session_id == session_id =>
            {
                return Ok(history
                    .messages
                    .into_iter()
                    .map(|message| history_to_message(message, session_id))
                    .collect());
            }
            Payload::Error(info) if envelope.correlation_id.as_deref() == Some(correlation_id) => {
                return Err(SyncError::Remote {
                    code: info.code,
                    message: info.message,
                });
            }
            _ => {}
        }
    }
    Err(SyncError::Transport(
        "connection closed before history arrived".to_string(),
    ))
}

pub fn history_to_message(message: HistoryMessage, session_id: &str) -> Message {
    Message {
        id: message.id,
        content: message.content,
        sender: Sender::from_role(&message.role),
        timestamp: message
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        session_metadata: Some(MessageSessionMetadata {
            session_id: Some(session_id.to_string()),
            ..MessageSessionMetadata::default()
        }),
        streaming_state: StreamingState::Completed,
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| SyncError::Transport(format!("persistence task failed: {err}")))?
}

/// Persists a pushed message and back-fills history.
pub(crate) async fn deliver(
    payload: PushPayload,
    project: Option<ProjectDescriptor>,
    store: Arc<PersistenceStore>,
    fetcher: Option<BackgroundFetcher>,
) -> Result<PushOutcome> {
    let Some(session_id) = payload.session_id.clone() else {
        tracing::info!("Push payload has no session id; nothing to store");
        return Ok(PushOutcome::Unroutable);
    };
    let Some(project) = project else {
        tracing::warn!(session_id = %session_id, "No project bound for pushed session");
        return Ok(PushOutcome::Unroutable);
    };

    // The cursor has to come from what was stored before this push, or the
    // fetch would only ask for messages newer than the push itself.
    let since = match fetcher {
        Some(_) => {
            let store = Arc::clone(&store);
            let project_id = project.id.clone();
            let session = session_id.clone();
            blocking(move || {
                Ok(store
                    .load(&project_id, &session)
                    .iter()
                    .map(|message| message.timestamp)
                    .max())
            })
            .await?
        }
        None => None,
    };

    let mut record = None;
    if let Some(content) = payload.message.clone() {
        let message = Message {
            id: payload.message_id.clone().unwrap_or_else(new_id),
            content,
            sender: Sender::Assistant,
            timestamp: Utc::now(),
            session_metadata: Some(MessageSessionMetadata {
                session_id: Some(session_id.clone()),
                ..MessageSessionMetadata::default()
            }),
            streaming_state: StreamingState::Completed,
        };
        let store = Arc::clone(&store);
        let project = project.clone();
        let session = session_id.clone();
        record = Some(blocking(move || store.append(&project, &session, message)).await?);
    }

    let mut fetched = 0;
    if let Some(fetcher) = fetcher {
        match fetcher.fetch_history(&session_id, since).await {
            Ok(history) => {
                fetched = history.len();
                let store = Arc::clone(&store);
                let project = project.clone();
                let session = session_id.clone();
                record =
                    Some(blocking(move || store.merge_history(&project, &session, history)).await?);
            }
            Err(err) => {
                tracing::warn!(error = %err, session_id = %session_id, "Background fetch failed");
            }
        }
    }

    let message_count = record.map(|record| record.message_count).unwrap_or_default();
    tracing::info!(
        project_id = %project.id,
        session_id = %session_id,
        message_count,
        fetched,
        "Push delivered"
    );
    Ok(PushOutcome::Stored {
        project_id: project.id,
        session_id,
        message_count,
        fetched,
    })
}
