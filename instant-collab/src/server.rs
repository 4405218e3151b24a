//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ── conn task ──┐                    ┌──► conn task A ── Client A
//!                         ├── RelayEvent ──► Router ──► Outbound ─┤
//! Client B ── conn task ──┘   (mpsc)        (one task)            └──► conn task B ── Client B
//! ```
//!
//! A single router task owns the [`Router`] and is the only place the
//! connection registry is touched. Each accepted socket gets its own task
//! which reports frames and lifecycle changes as [`RelayEvent`]s and
//! writes whatever the router hands back through its command channel.
//! The relay never inspects document contents.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ClientId;
use crate::router::{ConnectionId, Outbound, RelayStats, Router, DEFAULT_BASE_ID};

/// Default relay port.
pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// First client id handed out
    pub base_client_id: ClientId,
    /// Per-connection outbound queue capacity
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            base_client_id: DEFAULT_BASE_ID,
            outbound_capacity: 256,
        }
    }
}

/// Transport event reported by a connection task.
#[derive(Debug)]
pub enum RelayEvent {
    /// Handshake finished. The router replies with the allocated id.
    Opened {
        addr: SocketAddr,
        commands: mpsc::Sender<ConnectionCommand>,
        reply: oneshot::Sender<ConnectionId>,
    },
    MessageReceived { id: ConnectionId, frame: String },
    Errored { id: ConnectionId, error: String },
    Closed { id: ConnectionId },
}

/// Instruction for a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Send(Arc<str>),
    Close,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server. Bind first, then [`run`](Self::run).
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared handle to the routing counters.
    pub fn stats_handle(&self) -> Arc<RwLock<RelayStats>> {
        self.stats.clone()
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", self.local_addr()?);

        let (events_tx, events_rx) = mpsc::channel(self.config.outbound_capacity.max(1) * 4);
        let router = Router::new(self.config.base_client_id);
        tokio::spawn(route(router, events_rx, self.stats.clone()));

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let events = events_tx.clone();
            let capacity = self.config.outbound_capacity.max(1);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, events, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Router task: applies events in arrival order and dispatches the result.
async fn route(
    mut router: Router,
    mut events: mpsc::Receiver<RelayEvent>,
    stats: Arc<RwLock<RelayStats>>,
) {
    let mut links: HashMap<ConnectionId, mpsc::Sender<ConnectionCommand>> = HashMap::new();

    while let Some(event) = events.recv().await {
        let outbound = match event {
            RelayEvent::Opened {
                addr,
                commands,
                reply,
            } => {
                let id = router.connect();
                links.insert(id, commands);
                if reply.send(id).is_err() {
                    // Connection task already gone.
                    links.remove(&id);
                    router.disconnect(id)
                } else {
                    log::debug!("Connection {id} is {addr}");
                    Vec::new()
                }
            }
            RelayEvent::MessageReceived { id, frame } => router.receive(id, &frame),
            RelayEvent::Errored { id, error } => {
                log::error!("Transport error on connection {id}: {error}");
                Vec::new()
            }
            RelayEvent::Closed { id } => {
                links.remove(&id);
                router.disconnect(id)
            }
        };

        let mut queue: VecDeque<Outbound> = outbound.into();
        while let Some(out) = queue.pop_front() {
            if let Some(failed) = dispatch(&links, out) {
                // Dropping the link ends the connection task, which closes
                // the socket. The peers hear about it right away.
                links.remove(&failed);
                queue.extend(router.disconnect(failed));
            }
        }
        *stats.write().await = router.stats().clone();
    }
    log::debug!("Router task stopped");
}

/// Hand one command to its connection task. Returns the id of a connection
/// that can no longer keep up and must be dropped.
fn dispatch(
    links: &HashMap<ConnectionId, mpsc::Sender<ConnectionCommand>>,
    out: Outbound,
) -> Option<ConnectionId> {
    let (id, command) = match out {
        Outbound::Send { to, frame } => (to, ConnectionCommand::Send(frame)),
        Outbound::Close { id } => (id, ConnectionCommand::Close),
    };
    let Some(link) = links.get(&id) else {
        log::debug!("Dropping outbound for closed connection {id}");
        return None;
    };
    match link.try_send(command) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => {
            log::warn!("Outbound queue for connection {id} is full, disconnecting it");
            Some(id)
        }
        Err(TrySendError::Closed(_)) => {
            log::debug!("Connection {id} task already stopped");
            Some(id)
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::Sender<RelayEvent>,
    capacity: usize,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (commands_tx, mut commands_rx) = mpsc::channel(capacity);
    let (reply_tx, reply_rx) = oneshot::channel();
    events
        .send(RelayEvent::Opened {
            addr,
            commands: commands_tx,
            reply: reply_tx,
        })
        .await?;
    let id = reply_rx.await?;
    log::info!("WebSocket connection {id} established from {addr}");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = text.as_str().to_owned();
                        if events.send(RelayEvent::MessageReceived { id, frame }).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Ignoring binary frame from connection {id}");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            let _ = events.send(RelayEvent::Errored { id, error: e.to_string() }).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {id} closed by {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(RelayEvent::Errored { id, error: e.to_string() }).await;
                        break;
                    }
                    _ => {}
                }
            }

            command = commands_rx.recv() => {
                match command {
                    Some(ConnectionCommand::Send(frame)) => {
                        if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                            let _ = events.send(RelayEvent::Errored { id, error: e.to_string() }).await;
                            break;
                        }
                    }
                    Some(ConnectionCommand::Close) | None => {
                        log::info!("Closing connection {id}");
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(RelayEvent::Closed { id }).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.base_client_id, 100);
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_server_config_from_json() {
        let config: ServerConfig = serde_json::from_str(r#"{"bind_addr":"0.0.0.0:9000"}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.base_client_id, 100);
        let json = serde_json::to_string(&RelayStats::default()).unwrap();
        assert!(json.contains("\"messages_routed\":0"));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_router_task_dispatches() {
        let (events_tx, events_rx) = mpsc::channel(16);
        let stats = Arc::new(RwLock::new(RelayStats::default()));
        tokio::spawn(route(Router::default(), events_rx, stats.clone()));

        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        events_tx
            .send(RelayEvent::Opened {
                addr: "127.0.0.1:1".parse().unwrap(),
                commands: cmd_tx,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let id = reply_rx.await.unwrap();
        assert_eq!(id, 100);

        events_tx
            .send(RelayEvent::MessageReceived {
                id,
                frame: r#"[5,false,"ann",1]"#.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            cmd_rx.recv().await,
            Some(ConnectionCommand::Send("[2,true,100,false]".into()))
        );

        events_tx
            .send(RelayEvent::MessageReceived {
                id,
                frame: r#"[5,true,"ann",1]"#.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(cmd_rx.recv().await, Some(ConnectionCommand::Close));

        events_tx.send(RelayEvent::Closed { id }).await.unwrap();
        drop(events_tx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(stats.read().await.active_connections, 0);
    }

    async fn open(
        events: &mpsc::Sender<RelayEvent>,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<ConnectionCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (reply_tx, reply_rx) = oneshot::channel();
        events
            .send(RelayEvent::Opened {
                addr: "127.0.0.1:1".parse().unwrap(),
                commands: cmd_tx,
                reply: reply_tx,
            })
            .await
            .unwrap();
        (reply_rx.await.unwrap(), cmd_rx)
    }

    #[tokio::test]
    async fn test_full_outbound_queue_disconnects_peer() {
        let (events_tx, events_rx) = mpsc::channel(16);
        let stats = Arc::new(RwLock::new(RelayStats::default()));
        tokio::spawn(route(Router::default(), events_rx, stats.clone()));

        let (x, mut x_rx) = open(&events_tx, 16).await;
        let (y, mut y_rx) = open(&events_tx, 2).await;
        for (id, frame) in [(x, r#"[5,false,"xavier",1]"#), (y, r#"[5,false,"yolanda",1]"#)] {
            events_tx
                .send(RelayEvent::MessageReceived {
                    id,
                    frame: frame.to_string(),
                })
                .await
                .unwrap();
        }
        assert_eq!(
            x_rx.recv().await,
            Some(ConnectionCommand::Send("[2,true,100,false]".into()))
        );
        assert_eq!(
            x_rx.recv().await,
            Some(ConnectionCommand::Send(r#"[7,101,"yolanda"]"#.into()))
        );

        // y never reads: its queue holds AVAILABLE plus one TEXT.
        let text = r#"[1,[2,[[[[50,100]],"a"]]],[1,100],100]"#;
        for _ in 0..3 {
            events_tx
                .send(RelayEvent::MessageReceived {
                    id: x,
                    frame: text.to_string(),
                })
                .await
                .unwrap();
        }

        assert_eq!(
            x_rx.recv().await,
            Some(ConnectionCommand::Send("[8,101]".into()))
        );
        assert_eq!(
            y_rx.recv().await,
            Some(ConnectionCommand::Send("[2,false,101,false]".into()))
        );
        assert_eq!(y_rx.recv().await, Some(ConnectionCommand::Send(text.into())));
        // The link is gone instead of silently skipping frames.
        assert_eq!(y_rx.recv().await, None);

        // The connection task still reports its close; that is a no-op now.
        events_tx.send(RelayEvent::Closed { id: y }).await.unwrap();
        drop(events_tx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stats = stats.read().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.registered_connections, 1);
    }
}
