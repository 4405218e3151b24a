//! Integration tests for end-to-end relay sessions.
//!
//! These tests start a real relay and connect real clients, both raw
//! WebSocket peers speaking the wire format and full `SyncClient` sessions.

use futures_util::{SinkExt, StreamExt};
use instant_collab::client::{Role, SessionConfig, SessionEvent, SyncClient};
use instant_collab::protocol::Message;
use instant_collab::server::{RelayServer, ServerConfig};
use instant_collab::surface::{EditSurface, SurfaceChange, TextBuffer};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on an ephemeral port, return its URL.
async fn start_test_relay() -> String {
    let server = RelayServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    format!("ws://{addr}")
}

async fn raw_client(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_frame(ws: &mut Ws, frame: &str) {
    ws.send(tungstenite::Message::text(frame.to_string()))
        .await
        .unwrap();
}

async fn recv_frame(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let tungstenite::Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    assert!(
        timeout(Duration::from_millis(200), ws.next()).await.is_err(),
        "expected no frame"
    );
}

/// Two raw peers, registered in order as 100 and 101.
async fn registered_pair(url: &str) -> (Ws, Ws) {
    let mut x = raw_client(url).await;
    send_frame(&mut x, r#"[5,false,"xavier",1]"#).await;
    assert_eq!(recv_frame(&mut x).await, "[2,true,100,false]");

    let mut y = raw_client(url).await;
    send_frame(&mut y, r#"[5,false,"yolanda",1]"#).await;
    assert_eq!(recv_frame(&mut y).await, "[2,false,101,false]");
    assert_eq!(recv_frame(&mut x).await, r#"[7,101,"yolanda"]"#);
    (x, y)
}

#[tokio::test]
async fn test_registration_order() {
    let url = start_test_relay().await;
    let (mut x, mut y) = registered_pair(&url).await;
    assert_silent(&mut x).await;
    assert_silent(&mut y).await;
}

#[tokio::test]
async fn test_text_relayed_verbatim_without_echo() {
    let url = start_test_relay().await;
    let (mut x, mut y) = registered_pair(&url).await;

    // Non-canonical spacing survives the relay untouched.
    let frame = r#"[1, [2, [[[[50,100]], "a"]]], [1,100], 100]"#;
    send_frame(&mut x, frame).await;
    assert_eq!(recv_frame(&mut y).await, frame);
    assert_silent(&mut x).await;
}

#[tokio::test]
async fn test_request_and_initial_between_peers() {
    let url = start_test_relay().await;
    let (mut x, mut y) = registered_pair(&url).await;

    send_frame(&mut y, "[3]").await;
    assert_eq!(recv_frame(&mut x).await, "[3]");

    let initial = r#"[6,"notes",[1,100],[[[0,100]],[[100000000000,100]]],[""]]"#;
    send_frame(&mut x, initial).await;
    assert_eq!(recv_frame(&mut y).await, initial);
}

#[tokio::test]
async fn test_invalid_and_unregistered_messages_dropped() {
    let url = start_test_relay().await;
    let (mut x, mut y) = registered_pair(&url).await;

    let mut z = raw_client(&url).await;
    send_frame(&mut z, r#"[1,[2,[]],[1,100],102]"#).await;
    send_frame(&mut x, "not json").await;
    send_frame(&mut x, r#"[7,"bad"]"#).await;
    assert_silent(&mut y).await;

    // The sender is still connected and routed.
    send_frame(&mut x, r#"[1,[1,[]],[1,100],100]"#).await;
    assert_eq!(recv_frame(&mut y).await, r#"[1,[1,[]],[1,100],100]"#);
}

#[tokio::test]
async fn test_disconnect_notifies_peers() {
    let url = start_test_relay().await;
    let (mut x, mut y) = registered_pair(&url).await;

    y.close(None).await.unwrap();
    assert_eq!(recv_frame(&mut x).await, "[8,101]");
    assert_silent(&mut x).await;
}

#[tokio::test]
async fn test_session_share_closes_connection() {
    let url = start_test_relay().await;
    let mut x = raw_client(&url).await;
    send_frame(&mut x, r#"[5,true,"xavier",1]"#).await;

    let next = timeout(Duration::from_secs(2), x.next())
        .await
        .expect("relay did not close the connection");
    assert!(matches!(
        next,
        None | Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_))
    ));
}

// ───────────────────────────────────────────────────────────────────
// Full sessions
// ───────────────────────────────────────────────────────────────────

fn session_config(url: &str, username: &str, role: Role) -> SessionConfig {
    SessionConfig {
        url: url.to_string(),
        username: username.to_string(),
        role,
        buffer_name: "notes.txt".to_string(),
        buffer_number: 3,
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event channel closed")
}

/// Write remote edits to `surface` until it reads `expected`.
async fn apply_until(
    client: &SyncClient,
    rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>,
    surface: &mut TextBuffer,
    expected: &str,
) {
    while surface.as_str() != expected {
        if let SessionEvent::ApplyEdit(edit) = next_event(rx).await {
            let change = surface.apply(&edit).unwrap();
            client.local_change(change).await.unwrap();
            client.edit_applied().await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_host_and_guest_converge() {
    let url = start_test_relay().await;

    let mut host = SyncClient::connect(session_config(&url, "ann", Role::Host), "hello")
        .await
        .unwrap();
    let mut host_rx = host.take_event_rx().unwrap();
    assert_eq!(
        next_event(&mut host_rx).await,
        SessionEvent::Connected {
            client_id: 100,
            is_first: true
        }
    );
    let mut host_surface = TextBuffer::new("hello");

    let mut guest = SyncClient::connect(session_config(&url, "bob", Role::Guest), "")
        .await
        .unwrap();
    let mut guest_rx = guest.take_event_rx().unwrap();
    assert_eq!(
        next_event(&mut guest_rx).await,
        SessionEvent::Connected {
            client_id: 101,
            is_first: false
        }
    );
    let text = match next_event(&mut guest_rx).await {
        SessionEvent::SnapshotLoaded { buffer_name, text, .. } => {
            assert_eq!(buffer_name, "notes.txt");
            text
        }
        other => panic!("expected snapshot, got {other:?}"),
    };
    assert_eq!(text, "hello");
    let mut guest_surface = TextBuffer::new(text);

    // Guest types; host follows.
    let typed = SurfaceChange::insert(5, " world");
    guest_surface.replace(&typed).unwrap();
    guest.local_change(typed).await.unwrap();
    apply_until(&host, &mut host_rx, &mut host_surface, "hello world").await;

    // Host replaces a word; guest follows.
    let typed = SurfaceChange::replace(0, 5, "howdy");
    host_surface.replace(&typed).unwrap();
    host.local_change(typed).await.unwrap();
    apply_until(&guest, &mut guest_rx, &mut guest_surface, "howdy world").await;

    host.close().await.unwrap();
    loop {
        match next_event(&mut guest_rx).await {
            SessionEvent::PeerLeft { client_id } => {
                assert_eq!(client_id, 100);
                break;
            }
            _ => continue,
        }
    }
    guest.close().await.unwrap();
}

#[tokio::test]
async fn test_guest_without_host_fails() {
    let url = start_test_relay().await;
    let mut guest = SyncClient::connect(session_config(&url, "bob", Role::Guest), "")
        .await
        .unwrap();
    let mut rx = guest.take_event_rx().unwrap();
    match next_event(&mut rx).await {
        SessionEvent::Closed { error } => assert!(error.is_some()),
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(guest.close().await.is_err());
}

#[tokio::test]
async fn test_edits_fan_out_to_every_guest() {
    let url = start_test_relay().await;

    let mut host = SyncClient::connect(session_config(&url, "ann", Role::Host), "ab")
        .await
        .unwrap();
    let mut host_rx = host.take_event_rx().unwrap();
    next_event(&mut host_rx).await;

    let mut guests = Vec::new();
    for name in ["bob", "cat"] {
        let mut guest = SyncClient::connect(session_config(&url, name, Role::Guest), "")
            .await
            .unwrap();
        let mut rx = guest.take_event_rx().unwrap();
        next_event(&mut rx).await;
        match next_event(&mut rx).await {
            SessionEvent::SnapshotLoaded { text, .. } => assert_eq!(text, "ab"),
            other => panic!("expected snapshot, got {other:?}"),
        }
        guests.push((guest, rx, TextBuffer::new("ab")));
    }

    let typed = SurfaceChange::insert(1, "-");
    let (first, _, first_surface) = &mut guests[0];
    first_surface.replace(&typed).unwrap();
    first.local_change(typed).await.unwrap();

    let mut host_surface = TextBuffer::new("ab");
    apply_until(&host, &mut host_rx, &mut host_surface, "a-b").await;
    let (second, second_rx, second_surface) = &mut guests[1];
    apply_until(second, second_rx, second_surface, "a-b").await;

    host.close().await.unwrap();
    for (guest, _, _) in guests {
        guest.close().await.unwrap();
    }
}

#[test]
fn test_wire_helpers_agree_with_relay_frames() {
    assert_eq!(Message::info("xavier").encode().unwrap(), r#"[5,false,"xavier",1]"#);
}
