// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket observer bridging a socket to a broadcast hub.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::broadcast::{ChannelSink, ClientMessage, HubMessage};
use crate::tracker::Tracker;

/// Serve one observer until either side closes.
///
/// Hub messages are forwarded as JSON text frames. Text frames from the
/// client are parsed as [`ClientMessage`]s and answered by the hub. When the
/// hub is torn down the socket is closed and the client must reconnect.
pub(super) async fn serve_observer(
    socket: WebSocket,
    tracker: Tracker,
    partition: String,
    buffer: usize,
) {
    let (mut writer, mut reader) = socket.split();
    let (sink, mut outbound) = ChannelSink::channel(buffer);

    let (hub, observer_id) = match tracker.hubs().subscribe(&partition, Arc::new(sink)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(partition = %partition, error = %e, "Live subscribe failed");
            let reply = HubMessage::Error {
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&reply) {
                let _ = writer.send(Message::Text(text.into())).await;
            }
            let _ = writer.close().await;
            return;
        }
    };

    info!(partition = %partition, observer_id = %observer_id, "Live observer connected");

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else {
                    debug!(observer_id = %observer_id, "Hub closed, dropping observer");
                    break;
                };
                if !send_json(&mut writer, message.as_ref()).await {
                    break;
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => {
                            hub.handle_client_message(observer_id, message).await;
                        }
                        Err(e) => {
                            let reply = HubMessage::Error {
                                message: format!("invalid message: {}", e),
                            };
                            if !send_json(&mut writer, &reply).await {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(observer_id = %observer_id, error = %e, "Live socket error");
                    break;
                }
            }
        }
    }

    hub.unsubscribe(observer_id).await;
    let _ = writer.close().await;
    info!(partition = %partition, observer_id = %observer_id, "Live observer disconnected");
}

/// Returns false once the socket can no longer be written.
async fn send_json<S>(writer: &mut S, message: &HubMessage) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode hub message");
            return true;
        }
    };
    writer.send(Message::Text(text.into())).await.is_ok()
}
