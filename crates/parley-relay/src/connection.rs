use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::relay::ConnectParams;

/// Heartbeat interval: the server pings every 15 seconds and drops the
/// channel after two missed pongs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// WebSocket endpoint, served at `/` and `/ws`.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .with_state(dispatcher)
}

async fn ws_upgrade(
    State(dispatcher): State<Dispatcher>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, dispatcher, params))
}

/// Drive one WebSocket channel: register with the relay, forward frames in
/// both directions, and deregister when either side stops.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, params: ConnectParams) {
    let (mut sender, mut receiver) = socket.split();

    let Some((peer_id, mut peer_rx)) = dispatcher.connect(params).await else {
        warn!("relay unavailable, closing new channel");
        return;
    };
    info!("{} connected to relay", peer_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                queued = peer_rx.recv() => {
                    let Some(queued) = queued else { break };
                    if sender.send(Message::Text(queued.frame.to_text().into())).await.is_err() {
                        break;
                    }
                    // Written; a paced stream may send its next chunk.
                    drop(queued);
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let dispatcher_recv = dispatcher.clone();
    let peer_recv = peer_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    dispatcher_recv.message(peer_recv.clone(), text.as_str().to_owned());
                }
                Message::Binary(data) => {
                    trace!("{} sent {} binary bytes, ignored", peer_recv, data.len());
                }
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

    dispatcher.disconnect(peer_id.clone());
    info!("{} disconnected from relay", peer_id);
}
