//! Gateway timers under paused tokio time: the Identify deadline and the
//! heartbeat. Setup runs on the real clock; time is frozen once the socket
//! is open, so idle periods auto-advance to the server's next timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use slowchat_api::oauth::OAuthProviders;
use slowchat_api::{AppStateInner, AuthSettings, app};
use slowchat_db::Database;
use slowchat_gateway::dispatcher::Dispatcher;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (SocketAddr, Dispatcher) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let dispatcher = Dispatcher::new();
    let state = AppStateInner::new(
        db,
        dispatcher.clone(),
        AuthSettings::new("timer-secret", "http://localhost:3001"),
        OAuthProviders::default(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    (addr, dispatcher)
}

async fn register(addr: SocketAddr, name: &str) -> (String, Uuid) {
    let body: Value = reqwest::Client::new()
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
        body["user"]["id"].as_str().unwrap().parse().unwrap(),
    )
}

/// Reads until the server goes away and returns the text events seen.
async fn drain(ws: &mut Socket) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(120), ws.next())
            .await
            .expect("server kept the socket open");
        match frame {
            Some(Ok(Message::Text(text))) => events.push(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return events,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn silent_socket_is_closed_after_identify_deadline() {
    let (addr, _) = spawn_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/api/gateway", addr)).await.unwrap();

    tokio::time::pause();
    let started = tokio::time::Instant::now();
    let events = drain(&mut ws).await;

    assert!(started.elapsed() >= Duration::from_secs(9));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "Error");
    assert_eq!(events[0]["data"]["code"], "unauthorized");
}

#[tokio::test]
async fn identify_before_deadline_keeps_socket_open() {
    let (addr, _) = spawn_server().await;
    let (token, _) = register(addr, "prompt").await;
    let (mut ws, _) = connect_async(format!("ws://{}/api/gateway", addr)).await.unwrap();

    tokio::time::pause();
    tokio::time::sleep(Duration::from_secs(9)).await;
    ws.send(Message::text(json!({ "type": "Identify", "data": { "token": token } }).to_string()))
        .await
        .unwrap();

    let ready = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(ready["type"], "Ready");
}

#[tokio::test]
async fn unanswered_pings_drop_the_connection() {
    let (addr, dispatcher) = spawn_server().await;
    let (token, user_id) = register(addr, "sleepy").await;
    let (mut ws, _) = connect_async(format!("ws://{}/api/gateway?token={}", addr, token)).await.unwrap();

    let ready = loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            break serde_json::from_str::<Value>(&text).unwrap();
        }
    };
    assert_eq!(ready["type"], "Ready");
    assert!(dispatcher.is_online(user_id).await);

    // The client stops reading, so tungstenite never answers a ping. One
    // missed pong is tolerated; the second drops the socket.
    tokio::time::pause();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(dispatcher.is_online(user_id).await);

    tokio::time::sleep(Duration::from_secs(15)).await;
    drain(&mut ws).await;
    assert!(went_offline(&dispatcher, user_id).await);
}

/// Connection cleanup finishes shortly after the socket closes.
async fn went_offline(dispatcher: &Dispatcher, user_id: Uuid) -> bool {
    for _ in 0..100 {
        if !dispatcher.is_online(user_id).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn answered_pings_keep_the_connection() {
    let (addr, dispatcher) = spawn_server().await;
    let (token, user_id) = register(addr, "awake").await;
    let (mut ws, _) = connect_async(format!("ws://{}/api/gateway?token={}", addr, token)).await.unwrap();

    tokio::time::pause();
    // Polling the stream lets tungstenite reply to each ping with a pong.
    let mut pings = 0;
    while pings < 4 {
        if let Message::Ping(_) = ws.next().await.unwrap().unwrap() {
            pings += 1;
        }
    }
    assert!(dispatcher.is_online(user_id).await);
}
