use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use slowchat_types::events::{GatewayCommand, GatewayEvent};

use crate::delivery::{Delivery, DeliveryError};
use crate::identity::{Identity, verify_token};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// How long an unauthenticated socket may wait before sending Identify.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Handle a WebSocket whose token was already checked at the HTTP upgrade.
pub async fn handle_connection_authenticated(socket: WebSocket, delivery: Delivery, identity: Identity) {
    let (sender, receiver) = socket.split();
    info!("{} ({}) connected to gateway (pre-authenticated)", identity.username, identity.user_id);
    run_connection_loop(sender, receiver, delivery, identity).await;
}

/// Handle a WebSocket that must authenticate with an Identify command first.
pub async fn handle_connection(socket: WebSocket, delivery: Delivery, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &delivery, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let _ = send_event(
                &mut sender,
                &GatewayEvent::error("unauthorized", "identify with a valid token"),
            )
            .await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", identity.username, identity.user_id);
    run_connection_loop(sender, receiver, delivery, identity).await;
}

async fn run_connection_loop(mut sender: WsSink, mut receiver: WsStream, delivery: Delivery, identity: Identity) {
    let dispatcher = delivery.dispatcher().clone();
    let user_id = identity.user_id;

    // Register before replaying so nothing sent in between is lost; anything
    // fanned out meanwhile queues behind the replay in user_rx.
    let (conn_id, mut user_rx, first_connection) = dispatcher.connect(user_id).await;

    if !greet(&mut sender, &delivery, &identity).await {
        cleanup(&delivery, &identity, conn_id).await;
        return;
    }

    if first_connection {
        if let Err(e) = delivery.announce_presence(user_id, true).await {
            warn!("Presence announce for {} failed: {}", user_id, e);
        }
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = user_rx.recv() => {
                    let Some(event) = event else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_PONGS {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_delivery = delivery.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if let Err(e) = handle_command(&recv_delivery, &recv_identity, conn_id, cmd).await {
                            report_error(&recv_delivery, &recv_identity, conn_id, e).await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_identity.username,
                            recv_identity.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        recv_delivery
                            .dispatcher()
                            .send_to_connection(
                                recv_identity.user_id,
                                conn_id,
                                GatewayEvent::error("bad_command", e.to_string()),
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    cleanup(&delivery, &identity, conn_id).await;
}

/// Sends Ready, who of the user's contacts is online, then every message the
/// user has not acknowledged yet. Returns false if the socket went away.
async fn greet(sender: &mut WsSink, delivery: &Delivery, identity: &Identity) -> bool {
    let ready = GatewayEvent::Ready {
        user_id: identity.user_id,
        username: identity.username.clone(),
    };
    if !send_event(sender, &ready).await {
        return false;
    }

    match delivery.online_contacts(identity.user_id).await {
        Ok(online) => {
            for contact in online {
                let event = GatewayEvent::PresenceUpdate {
                    user_id: contact,
                    online: true,
                };
                if !send_event(sender, &event).await {
                    return false;
                }
            }
        }
        Err(e) => warn!("Could not load contacts of {}: {}", identity.user_id, e),
    }

    match delivery.pending_for(identity.user_id).await {
        Ok(pending) => {
            if !pending.is_empty() {
                debug!("Replaying {} messages to {}", pending.len(), identity.user_id);
            }
            for message in pending {
                if !send_event(sender, &GatewayEvent::MessageCreate { message }).await {
                    return false;
                }
            }
        }
        Err(e) => error!("Replay for {} failed: {}", identity.user_id, e),
    }
    true
}

async fn cleanup(delivery: &Delivery, identity: &Identity, conn_id: Uuid) {
    let user_id = identity.user_id;
    if delivery.dispatcher().disconnect(user_id, conn_id).await {
        delivery.clear_typing(user_id).await;
        if let Err(e) = delivery.announce_presence(user_id, false).await {
            warn!("Presence announce for {} failed: {}", user_id, e);
        }
    }
    info!("{} ({}) disconnected from gateway", identity.username, user_id);
}

async fn wait_for_identify(receiver: &mut WsStream, delivery: &Delivery, jwt_secret: &str) -> Option<Identity> {
    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) else {
                continue;
            };

            let db = delivery.db().clone();
            let secret = jwt_secret.to_string();
            return match tokio::task::spawn_blocking(move || verify_token(&db, &secret, &token)).await {
                Ok(Ok(identity)) => Some(identity),
                Ok(Err(e)) => {
                    debug!("Identify rejected: {}", e);
                    None
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    None
                }
            };
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    delivery: &Delivery,
    identity: &Identity,
    conn_id: Uuid,
    cmd: GatewayCommand,
) -> Result<(), DeliveryError> {
    match cmd {
        GatewayCommand::Identify { .. } => {}

        cmd @ GatewayCommand::SendMessage { .. } => {
            let Some((chat_id, req)) = cmd.into_send_request() else {
                return Ok(());
            };
            let outcome = delivery.send_message(identity, chat_id, req).await?;
            delivery
                .dispatcher()
                .send_to_connection(
                    identity.user_id,
                    conn_id,
                    GatewayEvent::MessageAck {
                        client_id: outcome.message.client_id.clone(),
                        message: outcome.message,
                    },
                )
                .await;
        }

        GatewayCommand::StartTyping { chat_id } => {
            delivery.start_typing(identity, chat_id).await?;
        }

        GatewayCommand::StopTyping { chat_id } => {
            delivery.stop_typing(identity.user_id, chat_id).await?;
        }

        GatewayCommand::Ack { chat_id, seq } => {
            let cursor = delivery.ack(identity.user_id, chat_id, seq).await?;
            debug!("{} acked chat {} up to {}", identity.user_id, chat_id, cursor);
        }

        GatewayCommand::MarkRead { chat_id, seq } => {
            delivery.mark_read(identity.user_id, chat_id, seq).await?;
        }
    }
    Ok(())
}

async fn report_error(delivery: &Delivery, identity: &Identity, conn_id: Uuid, e: DeliveryError) {
    match &e {
        DeliveryError::Storage(inner) => error!("{} ({}) command failed: {:#}", identity.username, identity.user_id, inner),
        other => debug!("{} ({}) command rejected: {}", identity.username, identity.user_id, other),
    }
    let message = match &e {
        DeliveryError::Storage(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    delivery
        .dispatcher()
        .send_to_connection(identity.user_id, conn_id, GatewayEvent::error(e.code(), message))
        .await;
}

/// Serializes and writes one event. Returns false if the socket is gone.
async fn send_event(sender: &mut WsSink, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize gateway event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}
