//! Commands that hold a live engine connection.

use serde_json::json;
use tether_core::{
    probe_health, Engine, EngineConfig, EngineEvent, ProjectDescriptor, Result, Sender,
    StorageConfig, SyncError,
};
use tokio::sync::broadcast::error::RecvError;

use crate::output::print_json;

pub enum SessionChoice {
    /// Continue the session recorded in the project's metadata, if any.
    Resume,
    Existing(String),
    New,
}

pub async fn tail(
    config: EngineConfig,
    storage: StorageConfig,
    sessions: Vec<String>,
    project: Option<String>,
) -> Result<()> {
    let engine = Engine::new(config, storage);
    let project = project.as_deref().map(ProjectDescriptor::from_path);
    for session_id in &sessions {
        engine.track(session_id, project.clone())?;
    }

    let mut events = engine.subscribe_events();
    engine.connect()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_json(&event)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    engine.disconnect()?;
    engine.shutdown().await;
    Ok(())
}

pub async fn send(
    config: EngineConfig,
    storage: StorageConfig,
    project_path: &str,
    session: SessionChoice,
    content: &str,
    wait_for_reply: bool,
) -> Result<()> {
    let engine = Engine::new(config, storage);
    let project = ProjectDescriptor::from_path(project_path);
    let session_id = match session {
        SessionChoice::Existing(id) => Some(id),
        SessionChoice::New => None,
        SessionChoice::Resume => engine.resume_session(&project).await?,
    };

    let mut events = engine.subscribe_events();
    engine.connect()?;

    let receipt = engine
        .send_chat(&project, session_id.as_deref(), content)
        .await?;
    print_json(&json!({
        "correlationId": receipt.correlation_id,
        "sessionId": receipt.session_id,
        "userMessage": receipt.user_message,
    }))?;

    if wait_for_reply {
        match receipt.session_id.as_deref() {
            Some(session_id) => wait_for_reply_message(&mut events, session_id).await?,
            None => tracing::warn!("Server did not name a session; not waiting for a reply"),
        }
    }

    engine.disconnect()?;
    engine.shutdown().await;
    Ok(())
}

/// Prints tool activity for `session_id` until the assistant's reply
/// completes, the session closes, or the user interrupts.
async fn wait_for_reply_message(
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    session_id: &str,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event output fell behind");
                continue;
            }
            Err(RecvError::Closed) => return Err(SyncError::EngineStopped),
        };

        match &event {
            EngineEvent::MessageCompleted(message)
                if message.sender == Sender::Assistant
                    && message.session_id() == Some(session_id) =>
            {
                return print_json(&event);
            }
            EngineEvent::SessionClosed { session_id: closed } if closed == session_id => {
                return print_json(&event);
            }
            EngineEvent::ToolUse { session_id: id, .. }
            | EngineEvent::ToolResult { session_id: id, .. }
                if id == session_id =>
            {
                print_json(&event)?;
            }
            EngineEvent::Notice(_) => print_json(&event)?,
            _ => {}
        }
    }
}

pub async fn health(config: &EngineConfig) -> Result<()> {
    let endpoint = config
        .endpoint
        .as_deref()
        .ok_or_else(|| SyncError::Config("no endpoint configured".into()))?;
    let status = probe_health(endpoint, config.auth_token.as_deref()).await?;
    print_json(&status)?;
    if status.reachable {
        Ok(())
    } else {
        Err(SyncError::Http(format!("{} is not healthy", status.url)))
    }
}
