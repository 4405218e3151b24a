//! WebSocket session client: one shared buffer on one relay.
//!
//! Lifecycle:
//! ```text
//!   connect ──INFO──► AVAILABLE ──┬─ host:  seed model from local text ──► Ready
//!                                 └─ guest: REQUEST ──► INITIAL ─────────► Ready
//! ```
//!
//! The session runs as a task that owns the [`Coordinator`]. The application
//! talks to it through [`SessionCommand`]s and receives [`SessionEvent`]s:
//! every [`SessionEvent::ApplyEdit`] must be written to the surface, its
//! change notification reported as a [`SessionCommand::LocalChange`] like any
//! other, and completion acknowledged with [`SessionCommand::EditApplied`].
//! The next remote operation is released only after that acknowledgement.
//!
//! Reference: Shapiro et al., Conflict-free Replicated Data Types (SSS 2011)

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use instant_core::{Document, DocumentError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use crate::coordinator::Coordinator;
use crate::protocol::{BufferId, ClientId, Message, ProtocolError};
use crate::server::DEFAULT_PORT;
use crate::surface::{SurfaceChange, SurfaceEdit};

/// Which side of the session this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Shares its local buffer and serves snapshots.
    Host,
    /// Joins by requesting a snapshot.
    Guest,
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:8080`
    pub url: String,
    pub username: String,
    pub role: Role,
    /// Name announced in INITIAL
    pub buffer_name: String,
    /// Host-local buffer number
    pub buffer_number: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            username: String::new(),
            role: Role::Host,
            buffer_name: String::new(),
            buffer_number: 1,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.username.trim().is_empty() {
            return Err(SessionError::Config("username must not be empty".into()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SessionError::Config(format!(
                "relay url must start with ws:// or wss://, got {:?}",
                self.url
            )));
        }
        Ok(())
    }
}

/// Turn `host[:port]` into a relay URL, defaulting the port.
pub fn parse_session_url(input: &str) -> Result<String, SessionError> {
    let input = input.trim();
    let rest = input
        .strip_prefix("ws://")
        .or_else(|| input.strip_prefix("wss://"))
        .unwrap_or(input);
    let scheme = if input.starts_with("wss://") { "wss" } else { "ws" };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(SessionError::Config("empty relay address".into()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(SessionError::Config(format!("invalid relay address {input:?}")));
            }
            Ok(format!("{scheme}://{rest}"))
        }
        None => Ok(format!("{scheme}://{rest}:{DEFAULT_PORT}")),
    }
}

/// Session errors.
#[derive(Debug)]
pub enum SessionError {
    /// Message valid per schema but illegal in the current phase.
    State(String),
    Document(DocumentError),
    Protocol(ProtocolError),
    Transport(String),
    Config(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(msg) => write!(f, "Session state error: {msg}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Config(msg) => write!(f, "Invalid session config: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        SessionError::Document(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(e: tungstenite::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Relay accepted us.
    Connected { client_id: ClientId, is_first: bool },
    PeerJoined { client_id: ClientId, username: String },
    PeerLeft { client_id: ClientId },
    /// Guest only: the model was seeded. `text` must replace the surface content.
    SnapshotLoaded { buffer_name: String, buffer: BufferId, text: String },
    /// Write this to the surface, then send [`SessionCommand::EditApplied`].
    ApplyEdit(SurfaceEdit),
    /// Session ended. `error` is set when it ended on a session error.
    Closed { error: Option<String> },
}

/// Instructions from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Surface change notification (user input or echo).
    LocalChange(SurfaceChange),
    /// The last [`SessionEvent::ApplyEdit`] has been written.
    EditApplied,
    Close,
}

// ───────────────────────────────────────────────────────────────────
// Session state machine
// ───────────────────────────────────────────────────────────────────

enum Phase {
    AwaitingAvailable,
    AwaitingSnapshot { client_id: ClientId },
    Ready(Coordinator),
}

/// Transport-free session logic. Handlers queue outgoing messages and
/// events; the task flushes them.
struct Session {
    config: SessionConfig,
    /// Host seed text, consumed on AVAILABLE.
    seed: String,
    phase: Phase,
    outgoing: Vec<Message>,
    events: Vec<SessionEvent>,
}

impl Session {
    fn new(config: SessionConfig, seed: String) -> Self {
        let info = Message::info(config.username.clone());
        Self {
            config,
            seed,
            phase: Phase::AwaitingAvailable,
            outgoing: vec![info],
            events: Vec::new(),
        }
    }

    fn handle_message(&mut self, msg: Message) -> Result<(), SessionError> {
        match msg {
            Message::Available {
                is_first,
                client_id,
                session_share,
            } => self.on_available(is_first, client_id, session_share),
            Message::Request => {
                match &self.phase {
                    Phase::Ready(coordinator) => {
                        log::debug!("Serving snapshot of {}", self.config.buffer_name);
                        self.outgoing
                            .push(coordinator.initial_message(&self.config.buffer_name));
                    }
                    _ => log::warn!("REQUEST received before the buffer is ready"),
                }
                Ok(())
            }
            Message::Initial {
                buffer_name,
                buffer,
                pids,
                lines,
            } => {
                let Phase::AwaitingSnapshot { client_id } = self.phase else {
                    log::debug!("Ignoring INITIAL for {buffer_name}: already seeded");
                    return Ok(());
                };
                let document = Document::from_snapshot(buffer.host_id, pids, &lines)?;
                let text = document.linearize();
                log::info!(
                    "Loaded snapshot of {buffer_name} ({} chars) from host {}",
                    document.len(),
                    buffer.host_id
                );
                self.phase = Phase::Ready(Coordinator::new(client_id, buffer, document));
                self.events.push(SessionEvent::SnapshotLoaded {
                    buffer_name,
                    buffer,
                    text,
                });
                Ok(())
            }
            Message::Text { op, sender_id, .. } => {
                let Phase::Ready(coordinator) = &mut self.phase else {
                    return Err(SessionError::State(
                        "TEXT received before the buffer was seeded".into(),
                    ));
                };
                coordinator.remote_text(op, sender_id);
                self.pump();
                Ok(())
            }
            Message::Connect {
                client_id,
                username,
            } => {
                log::info!("{username} ({client_id}) joined");
                self.events
                    .push(SessionEvent::PeerJoined { client_id, username });
                Ok(())
            }
            Message::Disconnect { client_id } => {
                log::info!("Peer {client_id} left");
                self.events.push(SessionEvent::PeerLeft { client_id });
                Ok(())
            }
            Message::Info { .. } => {
                log::warn!("Ignoring INFO from relay");
                Ok(())
            }
        }
    }

    fn on_available(
        &mut self,
        is_first: bool,
        client_id: ClientId,
        session_share: bool,
    ) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::AwaitingAvailable) {
            log::warn!("Ignoring repeated AVAILABLE");
            return Ok(());
        }
        if session_share {
            return Err(SessionError::State("session sharing is not supported".into()));
        }
        match (self.config.role, is_first) {
            (Role::Guest, true) => {
                return Err(SessionError::State("no session is running on this relay".into()))
            }
            (Role::Host, false) => {
                return Err(SessionError::State(
                    "a session is already running on this relay".into(),
                ))
            }
            (Role::Host, true) => {
                let buffer = BufferId {
                    bufnr: self.config.buffer_number,
                    host_id: client_id,
                };
                let document = Document::new_host(client_id, &std::mem::take(&mut self.seed));
                log::info!(
                    "Hosting {} as {client_id} ({} chars)",
                    self.config.buffer_name,
                    document.len()
                );
                self.phase = Phase::Ready(Coordinator::new(client_id, buffer, document));
            }
            (Role::Guest, false) => {
                log::info!("Joined as {client_id}, requesting snapshot");
                self.phase = Phase::AwaitingSnapshot { client_id };
                self.outgoing.push(Message::Request);
            }
        }
        self.events.push(SessionEvent::Connected {
            client_id,
            is_first,
        });
        Ok(())
    }

    fn handle_command(&mut self, command: SessionCommand) {
        let Phase::Ready(coordinator) = &mut self.phase else {
            log::warn!("Dropping {command:?}: buffer not ready");
            return;
        };
        match command {
            SessionCommand::LocalChange(change) => match coordinator.local_change(change) {
                Ok(messages) => self.outgoing.extend(messages),
                Err(e) => log::error!("Local change rejected: {e}"),
            },
            SessionCommand::EditApplied => {
                let messages = coordinator.finish_edit();
                self.outgoing.extend(messages);
                self.pump();
            }
            SessionCommand::Close => {}
        }
    }

    /// Release the next remote edit if the coordinator is idle.
    fn pump(&mut self) {
        if let Phase::Ready(coordinator) = &mut self.phase {
            if let Some(edit) = coordinator.begin_next() {
                self.events.push(SessionEvent::ApplyEdit(edit));
            }
        }
    }

    fn coordinator(&self) -> Option<&Coordinator> {
        match &self.phase {
            Phase::Ready(c) => Some(c),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// Handle to a running session task.
pub struct SyncClient {
    config: SessionConfig,
    commands: mpsc::Sender<SessionCommand>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SyncClient {
    /// Connect to the relay and start the session. `text` seeds the model
    /// when hosting and is ignored for guests.
    pub async fn connect(config: SessionConfig, text: &str) -> Result<Self, SessionError> {
        config.validate()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
        log::info!("Connected to {} as {}", config.url, config.username);

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let session = Session::new(config.clone(), text.to_owned());
        let task = tokio::spawn(run_session(ws_stream, session, command_rx, event_tx));

        Ok(Self {
            config,
            commands: command_tx,
            event_rx: Some(event_rx),
            task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Protocol(ProtocolError::ConnectionClosed))
    }

    pub async fn local_change(&self, change: SurfaceChange) -> Result<(), SessionError> {
        self.send(SessionCommand::LocalChange(change)).await
    }

    pub async fn edit_applied(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::EditApplied).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and wait for the session task.
    pub async fn close(self) -> Result<(), SessionError> {
        let _ = self.commands.send(SessionCommand::Close).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Transport(e.to_string())),
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_session(
    ws_stream: WsStream,
    mut session: Session,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let result = loop {
        // Flush whatever the last step produced.
        let mut flushed = Ok(());
        for msg in session.outgoing.drain(..) {
            let frame = match msg.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode {:?}: {e}", msg.message_type());
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(tungstenite::Message::text(frame)).await {
                flushed = Err(SessionError::from(e));
                break;
            }
        }
        for event in session.events.drain(..) {
            let _ = events.send(event).await;
        }
        if let Err(e) = flushed {
            break Err(e);
        }

        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match Message::decode(text.as_str()) {
                            Ok(msg) => {
                                if let Err(e) = session.handle_message(msg) {
                                    break Err(e);
                                }
                            }
                            Err(e) => log::warn!("Dropping message from relay: {e}"),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        log::info!("Relay closed the connection");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e.into()),
                    _ => {}
                }
            }

            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Close) | None => {
                        let _ = ws_sender.close().await;
                        break Ok(());
                    }
                    Some(command) => session.handle_command(command),
                }
            }
        }
    };

    if let Err(e) = &result {
        log::error!("Session {} ended: {e}", session.config.buffer_name);
        let _ = ws_sender.close().await;
    }
    if let Some(c) = session.coordinator() {
        if c.pending_remote() > 0 {
            log::debug!("Discarding {} queued remote ops", c.pending_remote());
        }
    }
    let _ = events
        .send(SessionEvent::Closed {
            error: result.as_ref().err().map(ToString::to_string),
        })
        .await;
    result
}
