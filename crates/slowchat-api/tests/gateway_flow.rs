//! End-to-end: a real server on an ephemeral port, REST over reqwest and the
//! gateway over tokio-tungstenite.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use slowchat_api::oauth::OAuthProviders;
use slowchat_api::{AppStateInner, AuthSettings, app};
use slowchat_db::Database;
use slowchat_gateway::dispatcher::Dispatcher;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let state = AppStateInner::new(
        db,
        Dispatcher::new(),
        AuthSettings::new("e2e-secret", "http://localhost:3001"),
        OAuthProviders::default(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

async fn register(http: &reqwest::Client, addr: SocketAddr, name: &str) -> (String, String) {
    let body: Value = http
        .post(format!("http://{}/api/auth/register", addr))
        .json(&json!({ "username": name, "password": "password1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        body["token"].as_str().unwrap().to_string(),
        body["user"]["id"].as_str().unwrap().to_string(),
    )
}

/// Next JSON event, skipping control frames.
async fn next_event(ws: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Socket, command: Value) {
    ws.send(Message::text(command.to_string())).await.unwrap();
}

async fn expect_silence(ws: &mut Socket) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}

#[tokio::test]
async fn messages_reach_offline_users_on_reconnect() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let (alice, _) = register(&http, addr, "alice").await;
    let (bob, bob_id) = register(&http, addr, "bob").await;

    let chat: Value = http
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice)
        .json(&json!({ "user_id": bob_id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap().to_string();

    // Bob is offline while this is stored.
    let status = http
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice)
        .json(&json!({ "content": "while you were out" }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::CREATED);

    // Bob connects with a query token: Ready, then the missed message.
    let (mut bob_ws, _) = connect_async(format!("ws://{}/api/gateway?token={}", addr, bob)).await.unwrap();
    let ready = next_event(&mut bob_ws).await;
    assert_eq!(ready["type"], "Ready");
    assert_eq!(ready["data"]["username"], "bob");
    let replay = next_event(&mut bob_ws).await;
    assert_eq!(replay["type"], "MessageCreate");
    assert_eq!(replay["data"]["message"]["seq"], 1);
    send(&mut bob_ws, json!({ "type": "Ack", "data": { "chat_id": chat_id, "seq": 1 } })).await;

    // Alice connects through the Identify handshake and sees Bob online.
    let (mut alice_ws, _) = connect_async(format!("ws://{}/api/gateway", addr)).await.unwrap();
    send(&mut alice_ws, json!({ "type": "Identify", "data": { "token": alice } })).await;
    assert_eq!(next_event(&mut alice_ws).await["type"], "Ready");
    let presence = next_event(&mut alice_ws).await;
    assert_eq!(presence["type"], "PresenceUpdate");
    assert_eq!(presence["data"]["user_id"], bob_id.as_str());

    let online = next_event(&mut bob_ws).await;
    assert_eq!(online["type"], "PresenceUpdate");
    assert_eq!(online["data"]["online"], true);

    // Typing reaches Bob but not Alice herself.
    send(&mut alice_ws, json!({ "type": "StartTyping", "data": { "chat_id": chat_id } })).await;
    assert_eq!(next_event(&mut bob_ws).await["type"], "TypingStart");

    // A gateway send: Bob gets the message (after the typing stop), Alice
    // gets her copy plus the ack.
    send(
        &mut alice_ws,
        json!({ "type": "SendMessage", "data": { "chat_id": chat_id, "content": "live", "client_id": "c-2" } }),
    )
    .await;
    assert_eq!(next_event(&mut bob_ws).await["type"], "TypingStop");
    let live = next_event(&mut bob_ws).await;
    assert_eq!(live["type"], "MessageCreate");
    assert_eq!(live["data"]["message"]["seq"], 2);

    assert_eq!(next_event(&mut alice_ws).await["type"], "MessageCreate");
    let ack = next_event(&mut alice_ws).await;
    assert_eq!(ack["type"], "MessageAck");
    assert_eq!(ack["data"]["client_id"], "c-2");
    assert_eq!(ack["data"]["message"]["seq"], 2);

    // Bob drops without acking seq 2; Alice learns he went offline.
    bob_ws.close(None).await.unwrap();
    let offline = next_event(&mut alice_ws).await;
    assert_eq!(offline["type"], "PresenceUpdate");
    assert_eq!(offline["data"]["online"], false);

    // On reconnect only the unacknowledged message is replayed.
    let (mut bob_ws, _) = connect_async(format!("ws://{}/api/gateway?token={}", addr, bob)).await.unwrap();
    assert_eq!(next_event(&mut bob_ws).await["type"], "Ready");
    let presence = next_event(&mut bob_ws).await;
    assert_eq!(presence["type"], "PresenceUpdate");
    let replay = next_event(&mut bob_ws).await;
    assert_eq!(replay["type"], "MessageCreate");
    assert_eq!(replay["data"]["message"]["seq"], 2);
    expect_silence(&mut bob_ws).await;
}

#[tokio::test]
async fn bad_commands_get_error_events() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let (token, _) = register(&http, addr, "mallory").await;

    let (mut ws, _) = connect_async(format!("ws://{}/api/gateway?token={}", addr, token)).await.unwrap();
    assert_eq!(next_event(&mut ws).await["type"], "Ready");

    ws.send(Message::text("{not json")).await.unwrap();
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "Error");
    assert_eq!(error["data"]["code"], "bad_command");

    let stranger_chat = uuid::Uuid::new_v4();
    send(&mut ws, json!({ "type": "SendMessage", "data": { "chat_id": stranger_chat, "content": "hi" } })).await;
    let error = next_event(&mut ws).await;
    assert_eq!(error["data"]["code"], "not_found");
}

#[tokio::test]
async fn invalid_query_token_is_refused_before_upgrade() {
    let addr = spawn_server().await;
    match connect_async(format!("ws://{}/api/gateway?token=nope", addr)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}
