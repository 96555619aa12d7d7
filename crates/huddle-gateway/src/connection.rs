use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::GatewayCommand;

use crate::dispatcher::{Dispatcher, Payload};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Subscriptions opened on behalf of one socket, released when it closes.
#[derive(Default)]
struct ConnectionSubscriptions {
    /// room_id -> feed subscription id
    feeds: HashMap<Uuid, Uuid>,
    /// room_id -> presence connection id
    presence: HashMap<Uuid, Uuid>,
}

impl ConnectionSubscriptions {
    fn release(self, dispatcher: &Dispatcher) {
        for (room_id, sub_id) in self.feeds {
            dispatcher.unsubscribe_feed(room_id, sub_id);
        }
        for (room_id, conn_id) in self.presence {
            dispatcher.leave_presence(room_id, conn_id);
        }
    }
}

/// Serve one gateway WebSocket until the client leaves or stops answering pings.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let socket_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    info!(%socket_id, "client connected to gateway");

    // Every subscription on this socket funnels into one outbound queue
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Payload>();
    let mut subs = ConnectionSubscriptions::default();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut pong_received = true;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                        Ok(cmd) => handle_command(&dispatcher, &mut subs, &out_tx, cmd),
                        Err(e) => {
                            warn!(
                                "{} bad command: {} -- raw: {}",
                                socket_id,
                                e,
                                text.as_str().chars().take(200).collect::<String>()
                            );
                        }
                    },
                    Message::Pong(_) => pong_received = true,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(payload) = out_rx.recv() => {
                if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if std::mem::replace(&mut pong_received, false) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping {}", missed_heartbeats, socket_id);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    subs.release(&dispatcher);
    info!(%socket_id, "client disconnected from gateway");
}

fn handle_command(
    dispatcher: &Dispatcher,
    subs: &mut ConnectionSubscriptions,
    out_tx: &mpsc::UnboundedSender<Payload>,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Subscribe { room_id } => {
            subs.feeds
                .entry(room_id)
                .or_insert_with(|| dispatcher.attach_feed(room_id, out_tx.clone()));
        }

        GatewayCommand::Unsubscribe { room_id } => {
            if let Some(sub_id) = subs.feeds.remove(&room_id) {
                dispatcher.unsubscribe_feed(room_id, sub_id);
            }
        }

        GatewayCommand::Track { room_id, meta } => {
            let conn_id = *subs
                .presence
                .entry(room_id)
                .or_insert_with(|| dispatcher.attach_presence(room_id, out_tx.clone()));
            debug!(%room_id, user_id = %meta.user_id, "presence heartbeat");
            dispatcher.track(room_id, conn_id, meta);
        }

        GatewayCommand::Untrack { room_id } => {
            if let Some(conn_id) = subs.presence.remove(&room_id) {
                dispatcher.leave_presence(room_id, conn_id);
            }
        }
    }
}
