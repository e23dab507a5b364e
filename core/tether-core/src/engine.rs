//! The sync engine: composition root and single-writer actor.
//!
//! [`Engine`] is a cheap handle. All mutable state (connection, tracked
//! sessions, pending requests, reconstructions, timers) lives in one actor
//! task fed by a command channel and the transport event channel, so UI
//! calls and frames from the socket never race.
//!
//! Timers are plain deadlines owned by the actor. Each loop iteration
//! sleeps until the earliest one; clearing a deadline is how a timer is
//! cancelled.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tether_protocol::{
    AnyValue, ChatCommand, Envelope, Payload, ProtocolError, PushPayload, SessionHistory,
    SessionStarted,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::correlator::{new_correlation_id, PendingReply, RequestCorrelator};
use crate::error::{Result, SyncError};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::http::{probe_health, HealthStatus};
use crate::lifecycle::{AppTransition, LifecycleAction, LifecycleCoordinator};
use crate::persistence::PersistenceStore;
use crate::push::{self, history_to_message, BackgroundFetcher, PushOutcome};
use crate::reconstructor::{ReconstructionUpdate, StreamReconstructor};
use crate::reliability::{DisconnectKind, ReliabilityCoordinator};
use crate::storage::StorageConfig;
use crate::tracker::SessionTracker;
use crate::transport::{ConnectTarget, TaggedEvent, TransportConnection, TransportEvent};
use crate::types::{
    new_id, ConnectionSnapshot, ConnectionState, EngineEvent, Message, MessageSessionMetadata,
    ProjectDescriptor, SessionMetadataRecord, Sender, StreamingState, UserNotice,
};

const EVENT_CAPACITY: usize = 256;

/// Result of a chat send once the server acknowledged it.
#[derive(Debug, Clone)]
pub struct ChatReceipt {
    pub correlation_id: String,
    pub session_id: Option<String>,
    pub user_message: Message,
    pub response: Envelope,
}

enum Command {
    Connect(ConnectTarget),
    Disconnect,
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<()>>,
    },
    SendCorrelated {
        envelope: Envelope,
        reply: oneshot::Sender<PendingReply>,
    },
    SendChat {
        project: ProjectDescriptor,
        session_id: Option<String>,
        content: String,
        reply: oneshot::Sender<(PendingReply, Message)>,
    },
    CancelRequest(String),
    Track {
        session_id: String,
        project: Option<ProjectDescriptor>,
    },
    Untrack(String),
    Subscribe(Option<Vec<String>>),
    TrackedSessions(oneshot::Sender<Vec<String>>),
    StartStream {
        session_id: String,
        reply: oneshot::Sender<Message>,
    },
    CancelStream {
        session_id: String,
        reply: oneshot::Sender<Option<Message>>,
    },
    Lifecycle(AppTransition),
    CancelReconnection,
    ResetReconnection,
    PushContext {
        session_id: Option<String>,
        reply: oneshot::Sender<(Option<ProjectDescriptor>, Option<ConnectTarget>)>,
    },
    Shutdown,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Public handle
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Engine {
    config: EngineConfig,
    store: Arc<PersistenceStore>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    task: JoinHandle<()>,
}

impl Engine {
    /// Spawns the actor. Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig, storage: StorageConfig) -> Self {
        let store = Arc::new(PersistenceStore::new(storage));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = EngineActor::new(
            config.clone(),
            Arc::clone(&store),
            state_tx,
            events.clone(),
            transport_tx,
        );
        let task = tokio::spawn(actor.run(command_rx, transport_rx));

        Self {
            config,
            store,
            commands,
            state,
            events,
            task,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<PersistenceStore> {
        Arc::clone(&self.store)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────

    /// Connects to the configured endpoint.
    pub fn connect(&self) -> Result<()> {
        let endpoint = self
            .config
            .endpoint
            .clone()
            .ok_or_else(|| SyncError::Config("no endpoint configured".into()))?;
        self.connect_to(ConnectTarget {
            endpoint,
            auth_token: self.config.auth_token.clone(),
        })
    }

    /// Connects to `target`, replacing any existing connection.
    pub fn connect_to(&self, target: ConnectTarget) -> Result<()> {
        self.command(Command::Connect(target))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn cancel_reconnection(&self) -> Result<()> {
        self.command(Command::CancelReconnection)
    }

    pub fn reset_reconnection_state(&self) -> Result<()> {
        self.command(Command::ResetReconnection)
    }

    pub fn state(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn probe_health(&self) -> Result<HealthStatus> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| SyncError::Config("no endpoint configured".into()))?;
        probe_health(endpoint, self.config.auth_token.as_deref()).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────

    /// Fire-and-forget send. Fails with `NotConnected` before the handshake.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.request(|reply| Command::Send { envelope, reply })
            .await?
    }

    /// Sends with a correlation id. Before the handshake the request is
    /// queued and flushed, in order, right after it.
    pub async fn send_correlated(&self, envelope: Envelope) -> Result<PendingReply> {
        self.request(|reply| Command::SendCorrelated { envelope, reply })
            .await
    }

    pub fn cancel_request(&self, correlation_id: &str) -> Result<()> {
        self.command(Command::CancelRequest(correlation_id.to_string()))
    }

    /// Sends a chat command and waits for the server's acknowledgement.
    ///
    /// Without a session id the server starts a new session, which is
    /// tracked automatically. If the server rejects a known session, a
    /// `NoActiveSession` notice is raised and the message is re-sent as a
    /// fresh session.
    pub async fn send_chat(
        &self,
        project: &ProjectDescriptor,
        session_id: Option<&str>,
        content: &str,
    ) -> Result<ChatReceipt> {
        let mut session_id = session_id.map(str::to_string);
        loop {
            let (reply, user_message) = self
                .request(|reply| Command::SendChat {
                    project: project.clone(),
                    session_id: session_id.clone(),
                    content: content.to_string(),
                    reply,
                })
                .await?;
            let correlation_id = reply.correlation_id().to_string();

            match reply.wait_timeout(self.config.chat_timeout()).await {
                Ok(response) => {
                    let session_id = response
                        .payload
                        .session_id()
                        .map(str::to_string)
                        .or(session_id);
                    return Ok(ChatReceipt {
                        correlation_id,
                        session_id,
                        user_message,
                        response,
                    });
                }
                Err(err @ SyncError::CorrelationTimeout { .. }) => {
                    self.cancel_request(&correlation_id)?;
                    self.notify(UserNotice::SendTimeout { correlation_id });
                    return Err(err);
                }
                Err(SyncError::Remote { code, message }) if session_id.is_some() => {
                    tracing::warn!(
                        code = %code,
                        message = %message,
                        project_id = %project.id,
                        "Session rejected, starting a fresh one"
                    );
                    self.notify(UserNotice::NoActiveSession {
                        project_id: project.id.clone(),
                    });
                    if let Some(stale) = session_id.take() {
                        self.untrack(&stale)?;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Remote session id to resume for `project`, from validated metadata.
    pub async fn resume_session(&self, project: &ProjectDescriptor) -> Result<Option<String>> {
        Ok(self
            .session_metadata(&project.id)
            .await?
            .and_then(|record| record.remote_session_id))
    }

    fn notify(&self, notice: UserNotice) {
        let _ = self.events.send(EngineEvent::Notice(notice));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions & streams
    // ─────────────────────────────────────────────────────────────────────

    pub fn track(&self, session_id: &str, project: Option<ProjectDescriptor>) -> Result<()> {
        self.command(Command::Track {
            session_id: session_id.to_string(),
            project,
        })
    }

    pub fn untrack(&self, session_id: &str) -> Result<()> {
        self.command(Command::Untrack(session_id.to_string()))
    }

    /// Subscribes `session_ids`, or the whole tracked set for `None`.
    pub fn subscribe(&self, session_ids: Option<Vec<String>>) -> Result<()> {
        self.command(Command::Subscribe(session_ids))
    }

    pub async fn tracked_sessions(&self) -> Result<Vec<String>> {
        self.request(Command::TrackedSessions).await
    }

    pub async fn start_stream(&self, session_id: &str) -> Result<Message> {
        self.request(|reply| Command::StartStream {
            session_id: session_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn cancel_stream(&self, session_id: &str) -> Result<Option<Message>> {
        self.request(|reply| Command::CancelStream {
            session_id: session_id.to_string(),
            reply,
        })
        .await
    }

    pub fn lifecycle(&self, transition: AppTransition) -> Result<()> {
        self.command(Command::Lifecycle(transition))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────

    pub async fn handle_push(
        &self,
        map: std::collections::BTreeMap<String, AnyValue>,
    ) -> Result<PushOutcome> {
        let Some(payload) = PushPayload::from_map(map) else {
            return Ok(PushOutcome::Ignored);
        };

        let (bound_project, target) = self
            .request(|reply| Command::PushContext {
                session_id: payload.session_id.clone(),
                reply,
            })
            .await?;
        let project = payload
            .project_path
            .as_deref()
            .map(ProjectDescriptor::from_path)
            .or(bound_project);

        let target = target.or_else(|| {
            self.config.endpoint.clone().map(|endpoint| ConnectTarget {
                endpoint,
                auth_token: self.config.auth_token.clone(),
            })
        });
        let fetcher = target
            .filter(|_| payload.session_id.is_some())
            .map(|target| BackgroundFetcher::new(target, self.config.background_fetch.clone()));

        push::deliver(payload, project, self.store(), fetcher).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PersistenceStore) -> T + Send + 'static,
    {
        let store = self.store();
        tokio::task::spawn_blocking(move || work(store.as_ref()))
            .await
            .map_err(|err| SyncError::Transport(format!("persistence task failed: {err}")))
    }

    pub async fn save_messages(
        &self,
        project: &ProjectDescriptor,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<SessionMetadataRecord> {
        let project = project.clone();
        let session_id = session_id.to_string();
        self.blocking(move |store| store.save(&project.id, &messages, &session_id, &project))
            .await?
    }

    pub async fn load_messages(&self, project_id: &str, session_id: &str) -> Result<Vec<Message>> {
        let project_id = project_id.to_string();
        let session_id = session_id.to_string();
        self.blocking(move |store| store.load(&project_id, &session_id))
            .await
    }

    pub async fn session_metadata(&self, project_id: &str) -> Result<Option<SessionMetadataRecord>> {
        let project_id = project_id.to_string();
        self.blocking(move |store| store.get_metadata(&project_id))
            .await
    }

    pub async fn clear_project(&self, project_id: &str) -> Result<()> {
        let project_id = project_id.to_string();
        self.blocking(move |store| store.clear(&project_id)).await?
    }

    pub async fn archive_project(&self, project_id: &str) -> Result<Vec<PathBuf>> {
        let project_id = project_id.to_string();
        self.blocking(move |store| store.archive(&project_id)).await?
    }

    /// Stops the actor and closes the connection.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Engine task ended abnormally");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actor
// ═══════════════════════════════════════════════════════════════════════════════

struct SubscribeAttempt {
    session_ids: Vec<String>,
    attempt: u32,
    timeout_at: Instant,
}

struct PendingChat {
    project: ProjectDescriptor,
    message: Message,
}

struct EngineActor {
    config: EngineConfig,
    store: Arc<PersistenceStore>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,

    connection: Option<TransportConnection>,
    generation: u64,
    target: Option<ConnectTarget>,
    handshake_confirmed: bool,
    user_disconnected: bool,

    reliability: ReliabilityCoordinator,
    heartbeat: HeartbeatMonitor,
    correlator: RequestCorrelator,
    tracker: SessionTracker,
    reconstructor: StreamReconstructor,
    lifecycle: LifecycleCoordinator,

    backoff_deadline: Option<Instant>,
    subscribes: HashMap<String, SubscribeAttempt>,
    subscribe_retry: Option<(Instant, BTreeSet<String>)>,
    pending_chats: HashMap<String, PendingChat>,
    chat_order: VecDeque<String>,
}

impl EngineActor {
    fn new(
        config: EngineConfig,
        store: Arc<PersistenceStore>,
        state_tx: watch::Sender<ConnectionSnapshot>,
        events: broadcast::Sender<EngineEvent>,
        transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            reliability: ReliabilityCoordinator::new(config.backoff.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            lifecycle: LifecycleCoordinator::new(config.lifecycle.grace_period()),
            correlator: RequestCorrelator::new(),
            tracker: SessionTracker::new(),
            reconstructor: StreamReconstructor::new(),
            config,
            store,
            state_tx,
            events,
            transport_tx,
            connection: None,
            generation: 0,
            target: None,
            handshake_confirmed: false,
            user_disconnected: false,
            backoff_deadline: None,
            subscribes: HashMap::new(),
            subscribe_retry: None,
            pending_chats: HashMap::new(),
            chat_order: VecDeque::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                _ = sleep_until(deadline) => self.on_deadline(Instant::now()),
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        tracing::debug!("Engine actor stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.backoff_deadline,
            self.heartbeat.next_deadline(),
            self.lifecycle.grace_deadline(),
            self.subscribe_retry.as_ref().map(|(at, _)| *at),
            self.subscribes.values().map(|s| s.timeout_at).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.backoff_deadline.is_some_and(|at| at <= now) {
            self.backoff_deadline = None;
            if self.reliability.on_backoff_elapsed() {
                tracing::info!(attempt = self.reliability.attempt(), "Reconnecting");
                self.open_connection();
            }
        }

        match self.heartbeat.on_tick(now) {
            Some(HeartbeatAction::SendPing) => self.send_uncorrelated(Payload::Ping),
            Some(HeartbeatAction::Stale { missed }) => {
                tracing::warn!(missed, "Heartbeat unanswered, dropping connection");
                self.handle_disconnect(DisconnectKind::Unexpected, "heartbeat timed out".into());
            }
            None => {}
        }

        let actions = self.lifecycle.on_grace_elapsed(
            now,
            self.handshake_confirmed,
            self.reconstructor.has_active(),
        );
        self.apply_lifecycle(actions, now);

        let timed_out: Vec<String> = self
            .subscribes
            .iter()
            .filter(|(_, attempt)| attempt.timeout_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for correlation_id in timed_out {
            if let Some(attempt) = self.subscribes.remove(&correlation_id) {
                self.on_subscribe_failed(attempt, "no answer", now);
            }
        }

        if self.subscribe_retry.as_ref().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, ids)) = self.subscribe_retry.take() {
                if self.handshake_confirmed {
                    self.send_subscribe(ids.into_iter().collect(), 1);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(target) => {
                self.user_disconnected = false;
                self.target = Some(target);
                self.reliability.on_connect_requested();
                self.open_connection();
            }
            Command::Disconnect => {
                self.user_disconnected = true;
                self.deliberate_disconnect();
            }
            Command::Send { envelope, reply } => {
                let result = if self.handshake_confirmed {
                    self.transmit(&envelope)
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::SendCorrelated { envelope, reply } => {
                let pending = self.send_correlated(envelope);
                let _ = reply.send(pending);
            }
            Command::SendChat {
                project,
                session_id,
                content,
                reply,
            } => {
                let result = self.send_chat(project, session_id, content);
                let _ = reply.send(result);
            }
            Command::CancelRequest(correlation_id) => {
                self.correlator.cancel(&correlation_id);
                self.pending_chats.remove(&correlation_id);
                self.chat_order.retain(|id| id != &correlation_id);
            }
            Command::Track {
                session_id,
                project,
            } => self.track(&session_id, project),
            Command::Untrack(session_id) => {
                if self.tracker.untrack(&session_id) && self.handshake_confirmed {
                    self.send_envelope_best_effort(SessionTracker::unsubscribe_envelope(
                        &session_id,
                    ));
                }
            }
            Command::Subscribe(ids) => {
                let ids = ids.unwrap_or_else(|| self.tracker.tracked());
                self.send_subscribe(ids, 0);
            }
            Command::TrackedSessions(reply) => {
                let _ = reply.send(self.tracker.tracked());
            }
            Command::StartStream { session_id, reply } => {
                let message = self.reconstructor.start(&session_id);
                self.emit(EngineEvent::MessageUpdated(message.clone()));
                let _ = reply.send(message);
            }
            Command::CancelStream { session_id, reply } => {
                let cancelled = self.reconstructor.cancel(&session_id);
                if let Some(message) = &cancelled {
                    self.emit(EngineEvent::MessageCancelled(message.clone()));
                    if self.handshake_confirmed {
                        self.send_envelope_best_effort(SessionTracker::abort_envelope(
                            &session_id,
                        ));
                    }
                    self.settle_stream();
                }
                let _ = reply.send(cancelled);
            }
            Command::Lifecycle(transition) => self.handle_lifecycle(transition),
            Command::CancelReconnection => {
                self.backoff_deadline = None;
                self.reliability.cancel_reconnection();
                if self.connection.is_none() {
                    self.publish(ConnectionState::Disconnected);
                }
            }
            Command::ResetReconnection => {
                if let Some(delay) = self.reliability.reset_reconnection_state() {
                    let rearmed = Instant::now() + delay;
                    self.backoff_deadline = Some(
                        self.backoff_deadline
                            .map_or(rearmed, |current| current.min(rearmed)),
                    );
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "Backoff reset");
                }
            }
            Command::PushContext { session_id, reply } => {
                let project = session_id
                    .as_deref()
                    .and_then(|id| self.tracker.project_for(id))
                    .cloned();
                let _ = reply.send((project, self.target.clone()));
            }
            Command::Shutdown => {}
        }
    }

    fn send_correlated(&mut self, envelope: Envelope) -> PendingReply {
        let (envelope, pending) = self.correlator.register(envelope);
        if self.handshake_confirmed {
            if let Err(err) = self.transmit(&envelope) {
                self.correlator.fail(pending.correlation_id(), err);
            }
        } else {
            tracing::debug!(
                correlation_id = pending.correlation_id(),
                "Queued request until handshake"
            );
            self.correlator.enqueue(envelope);
        }
        pending
    }

    fn send_chat(
        &mut self,
        project: ProjectDescriptor,
        session_id: Option<String>,
        content: String,
    ) -> (PendingReply, Message) {
        let mut message = Message::user(content.clone());
        message.session_metadata = session_id.as_ref().map(|id| MessageSessionMetadata {
            session_id: Some(id.clone()),
            ..MessageSessionMetadata::default()
        });

        let envelope = Envelope::new(Payload::ChatCommand(ChatCommand {
            content,
            project_path: Some(project.path.clone()),
            session_id: session_id.clone(),
        }))
        .with_correlation_id(new_correlation_id());
        let pending = self.send_correlated(envelope);

        self.emit(EngineEvent::MessageCompleted(message.clone()));
        match session_id {
            Some(session_id) => {
                self.track(&session_id, Some(project.clone()));
                self.persist(project, session_id, message.clone());
            }
            None => {
                let correlation_id = pending.correlation_id().to_string();
                self.chat_order.push_back(correlation_id.clone());
                self.pending_chats.insert(
                    correlation_id,
                    PendingChat {
                        project,
                        message: message.clone(),
                    },
                );
            }
        }
        (pending, message)
    }

    fn track(&mut self, session_id: &str, project: Option<ProjectDescriptor>) {
        if self.tracker.track(session_id, project) && self.handshake_confirmed {
            self.send_subscribe(vec![session_id.to_string()], 0);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection management
    // ─────────────────────────────────────────────────────────────────────

    fn open_connection(&mut self) {
        let Some(target) = self.target.clone() else {
            tracing::warn!("Connect requested without a target");
            return;
        };
        self.drop_connection();
        self.backoff_deadline = None;
        self.generation += 1;
        tracing::info!(
            generation = self.generation,
            endpoint = %target.endpoint,
            "Connecting"
        );
        self.connection = Some(TransportConnection::open(
            self.generation,
            target,
            self.config.connect_timeout(),
            self.transport_tx.clone(),
        ));
        self.publish(ConnectionState::Connecting);
    }

    /// Closes the socket without touching the reconnect schedule. Events
    /// from the old generation are ignored from here on.
    fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            self.generation += 1;
        }
        self.handshake_confirmed = false;
        self.heartbeat.stop();
        self.subscribes.clear();
        self.subscribe_retry = None;
    }

    fn deliberate_disconnect(&mut self) {
        self.drop_connection();
        self.backoff_deadline = None;
        self.reliability.on_disconnect(DisconnectKind::Deliberate);
        self.publish(ConnectionState::Disconnected);
    }

    fn handle_disconnect(&mut self, kind: DisconnectKind, reason: String) {
        let was_confirmed = self.handshake_confirmed;
        self.drop_connection();

        match self.reliability.on_disconnect(kind) {
            Some(delay) => {
                self.backoff_deadline = Some(Instant::now() + delay);
                tracing::warn!(
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.reliability.attempt(),
                    "Connection lost, reconnect scheduled"
                );
                if self.reliability.is_at_cap(delay) {
                    self.publish(ConnectionState::Error(format!(
                        "{reason}; retrying every {}s",
                        delay.as_secs()
                    )));
                } else {
                    self.publish(ConnectionState::Disconnected);
                }
            }
            None => {
                tracing::info!(reason = %reason, ?kind, "Connection closed");
                self.backoff_deadline = None;
                self.publish(ConnectionState::Disconnected);
            }
        }

        if was_confirmed && kind == DisconnectKind::Unexpected {
            self.emit(EngineEvent::Notice(UserNotice::ConnectionLost { reason }));
        }
    }

    fn on_handshake(&mut self, now: Instant) {
        self.handshake_confirmed = true;
        self.reliability.on_handshake_confirmed();
        self.heartbeat.start(now);
        if self.lifecycle.is_backgrounded() && !self.reconstructor.has_active() {
            self.heartbeat.pause();
        }
        self.publish(ConnectionState::Connected);

        for envelope in self.correlator.drain_queue() {
            if let Err(err) = self.transmit(&envelope) {
                if let Some(id) = envelope.correlation_id.as_deref() {
                    self.correlator.fail(id, err);
                }
            }
        }

        self.send_subscribe(self.tracker.tracked(), 0);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    fn transmit(&mut self, envelope: &Envelope) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(SyncError::NotConnected)?;
        let frame = envelope.encode()?;
        connection.send(frame)
    }

    fn send_uncorrelated(&mut self, payload: Payload) {
        self.send_envelope_best_effort(Envelope::new(payload));
    }

    fn send_envelope_best_effort(&mut self, envelope: Envelope) {
        let type_tag = envelope.type_tag();
        if let Err(err) = self.transmit(&envelope) {
            tracing::debug!(error = %err, type_tag, "Best-effort send failed");
        }
    }

    fn send_subscribe(&mut self, session_ids: Vec<String>, attempt: u32) {
        if !self.handshake_confirmed {
            tracing::debug!("Skipping subscribe until handshake");
            return;
        }
        let correlation_id = new_correlation_id();
        let envelope = self
            .tracker
            .subscribe_envelope(Some(session_ids.clone()))
            .with_correlation_id(&correlation_id);
        let now = Instant::now();
        let record = SubscribeAttempt {
            session_ids,
            attempt,
            timeout_at: now + self.config.subscribe_timeout(),
        };
        match self.transmit(&envelope) {
            Ok(()) => {
                self.subscribes.insert(correlation_id, record);
            }
            Err(err) => self.on_subscribe_failed(record, &err.to_string(), now),
        }
    }

    fn on_subscribe_failed(&mut self, failed: SubscribeAttempt, reason: &str, now: Instant) {
        if failed.attempt > 0 || !self.handshake_confirmed {
            tracing::info!(reason, "Subscribe failed; waiting for next connect");
            return;
        }
        tracing::warn!(reason, "Subscribe failed, retrying once");
        let at = now + self.config.subscribe_retry_delay();
        match self.subscribe_retry.as_mut() {
            Some((_, ids)) => ids.extend(failed.session_ids),
            None => self.subscribe_retry = Some((at, failed.session_ids.into_iter().collect())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    fn handle_transport(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation {
            tracing::trace!(
                generation = tagged.generation,
                current = self.generation,
                "Dropping event from superseded connection"
            );
            return;
        }

        match tagged.event {
            TransportEvent::Connected => {
                tracing::debug!(generation = self.generation, "Socket open, awaiting welcome");
            }
            TransportEvent::FrameReceived(raw) => self.handle_frame(&raw),
            TransportEvent::Disconnected { reason, code } => {
                self.handle_disconnect(DisconnectKind::classify(code), reason);
            }
            TransportEvent::TransportError(reason) => {
                self.handle_disconnect(DisconnectKind::Unexpected, reason);
            }
        }
    }

    fn handle_frame(&mut self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(ProtocolError::UnknownType(type_tag)) => {
                tracing::debug!(type_tag = %type_tag, "Ignoring unknown frame type");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed frame");
                return;
            }
        };

        if let Some(correlation_id) = envelope.correlation_id.as_deref() {
            if let Some(attempt) = self.subscribes.remove(correlation_id) {
                match &envelope.payload {
                    Payload::Error(info) => {
                        let reason = format!("{}: {}", info.code, info.message);
                        self.on_subscribe_failed(attempt, &reason, Instant::now());
                    }
                    _ => tracing::debug!(sessions = attempt.session_ids.len(), "Subscribed"),
                }
                return;
            }
        }

        let matched = self.correlator.resolve(&envelope);
        let correlation_id = envelope.correlation_id.clone();

        match envelope.payload {
            Payload::Welcome(welcome) => {
                tracing::info!(
                    server_version = welcome.server_version.as_deref().unwrap_or("unknown"),
                    "Handshake confirmed"
                );
                self.on_handshake(Instant::now());
            }
            Payload::Pong => self.heartbeat.on_pong(),
            Payload::SessionStarted(started) => {
                self.on_session_started(started, correlation_id.as_deref())
            }
            Payload::SessionClosed(closed) => {
                if let Some(message) = self.reconstructor.complete(&closed.session_id, None) {
                    self.on_message_completed(message);
                }
                self.tracker.untrack(&closed.session_id);
                self.emit(EngineEvent::SessionClosed {
                    session_id: closed.session_id,
                });
            }
            Payload::StreamData(data) => {
                match self.reconstructor.apply(&data.session_id, &data.fragment) {
                    ReconstructionUpdate::Streaming(message) => {
                        self.emit(EngineEvent::MessageUpdated(message))
                    }
                    ReconstructionUpdate::Completed(message) => self.on_message_completed(message),
                }
            }
            Payload::StreamComplete(complete) => {
                if let Some(message) = self
                    .reconstructor
                    .complete(&complete.session_id, complete.metadata)
                {
                    self.on_message_completed(message);
                }
            }
            Payload::ToolUse(tool) => self.emit(EngineEvent::ToolUse {
                session_id: tool.session_id,
                tool_name: tool.tool_name,
                input: tool.input,
            }),
            Payload::ToolResult(result) => self.emit(EngineEvent::ToolResult {
                session_id: result.session_id,
                output: result.output,
                is_error: result.is_error,
            }),
            Payload::AssistantMessage(body) => {
                if self.reconstructor.is_active(&body.session_id) {
                    tracing::debug!(
                        session_id = %body.session_id,
                        "Assistant message during stream; stream completion delivers it"
                    );
                    return;
                }
                let message = Message {
                    id: body.message_id.unwrap_or_else(new_id),
                    content: body.content,
                    sender: Sender::Assistant,
                    timestamp: envelope.timestamp,
                    session_metadata: Some(MessageSessionMetadata {
                        session_id: Some(body.session_id),
                        ..MessageSessionMetadata::default()
                    }),
                    streaming_state: StreamingState::Completed,
                };
                self.on_message_completed(message);
            }
            Payload::SessionHistory(history) if !matched => self.on_history(history),
            Payload::Error(info) if !matched => {
                tracing::warn!(code = %info.code, message = %info.message, "Server error");
            }
            _ if matched => {}
            other => {
                tracing::debug!(type_tag = other.type_tag(), "Ignoring frame");
            }
        }
    }

    fn on_session_started(&mut self, started: SessionStarted, correlation_id: Option<&str>) {
        let chat_id = correlation_id
            .filter(|id| self.pending_chats.contains_key(*id))
            .map(str::to_string)
            .or_else(|| {
                let path = started.project_path.as_deref()?;
                self.chat_order
                    .iter()
                    .find(|id| {
                        self.pending_chats
                            .get(*id)
                            .is_some_and(|chat| chat.project.path == path)
                    })
                    .cloned()
            });
        let pending = chat_id.and_then(|id| {
            self.chat_order.retain(|queued| queued != &id);
            self.pending_chats.remove(&id)
        });

        let project = pending
            .as_ref()
            .map(|chat| chat.project.clone())
            .or_else(|| {
                started
                    .project_path
                    .as_deref()
                    .map(ProjectDescriptor::from_path)
            });

        self.track(&started.session_id, project.clone());

        if let Some(PendingChat {
            project,
            mut message,
        }) = pending
        {
            message.session_metadata = Some(MessageSessionMetadata {
                session_id: Some(started.session_id.clone()),
                ..MessageSessionMetadata::default()
            });
            self.persist(project, started.session_id.clone(), message);
        }

        self.emit(EngineEvent::SessionStarted {
            session_id: started.session_id,
            project_id: project.map(|project| project.id),
        });
    }

    fn on_message_completed(&mut self, message: Message) {
        self.emit(EngineEvent::MessageCompleted(message.clone()));
        if let Some(session_id) = message.session_id().map(str::to_string) {
            match self.tracker.project_for(&session_id).cloned() {
                Some(project) => self.persist(project, session_id, message),
                None => {
                    tracing::debug!(session_id = %session_id, "No project bound; not persisting")
                }
            }
        }
        self.settle_stream();
    }

    fn on_history(&mut self, history: SessionHistory) {
        let Some(project) = self.tracker.project_for(&history.session_id).cloned() else {
            return;
        };
        let session_id = history.session_id.clone();
        let messages: Vec<Message> = history
            .messages
            .into_iter()
            .map(|message| history_to_message(message, &session_id))
            .collect();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store.merge_history(&project, &session_id, messages) {
                tracing::warn!(error = %err, "Failed to merge session history");
            }
        });
    }

    fn persist(&self, project: ProjectDescriptor, session_id: String, message: Message) {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store.append(&project, &session_id, message) {
                tracing::warn!(error = %err, session_id = %session_id, "Failed to persist message");
            }
        });
    }

    fn settle_stream(&mut self) {
        if self.reconstructor.has_active() {
            return;
        }
        if let Some(action) = self.lifecycle.on_stream_settled() {
            self.apply_lifecycle(vec![action], Instant::now());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    fn handle_lifecycle(&mut self, transition: AppTransition) {
        let now = Instant::now();
        tracing::debug!(?transition, "Lifecycle transition");
        let actions = match transition {
            AppTransition::Background => {
                self.lifecycle.on_background(now);
                Vec::new()
            }
            AppTransition::Foreground => self.lifecycle.on_foreground(self.handshake_confirmed),
            AppTransition::Terminate => self.lifecycle.on_terminate(),
        };
        self.apply_lifecycle(actions, now);
    }

    fn apply_lifecycle(&mut self, actions: Vec<LifecycleAction>, now: Instant) {
        for action in actions {
            match action {
                LifecycleAction::SendBackgroundingNotice => {
                    self.send_uncorrelated(Payload::ClientBackgrounding)
                }
                LifecycleAction::PauseHeartbeat => self.heartbeat.pause(),
                LifecycleAction::ResumeHeartbeat => self.heartbeat.resume(now),
                LifecycleAction::Reconnect => {
                    let connecting = self.connection.is_some();
                    if !self.user_disconnected && !connecting && self.target.is_some() {
                        self.reliability.on_connect_requested();
                        self.open_connection();
                    }
                }
                LifecycleAction::Disconnect => self.deliberate_disconnect(),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────

    fn publish(&self, state: ConnectionState) {
        let snapshot = ConnectionSnapshot {
            state,
            changed_at: chrono::Utc::now(),
        };
        let changed = self.state_tx.send_if_modified(|current| {
            if current.state == snapshot.state {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if changed {
            tracing::debug!(state = ?snapshot.state, "Connection state changed");
            self.emit(EngineEvent::Connection(snapshot));
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
