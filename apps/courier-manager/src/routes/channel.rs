use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use courier_proto::{AgentFrame, ChannelEvent, Command};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::AppState;

use super::{map_state_err, ApiError, DeviceAuth, LeaseToken};

/// Upgrades to the lease's push channel. Credentials are checked before the upgrade so a
/// dead lease gets a plain HTTP error instead of a socket that closes immediately.
pub async fn channel_upgrade(
    ws: WebSocketUpgrade,
    Path(lease_id): Path<Uuid>,
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
) -> Result<Response, ApiError> {
    let lease = state
        .authorize(&device, token.as_str(), Some(lease_id))
        .await
        .map_err(map_state_err)?;
    let (connection_id, events, pending) = state
        .register_channel(&lease)
        .await
        .map_err(map_state_err)?;
    info!(
        lease_id = %lease_id,
        device_id = %device.device_id,
        pending = pending.len(),
        "push channel registered"
    );
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, lease_id, connection_id, events, pending)
    }))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    lease_id: Uuid,
    connection_id: Uuid,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    pending: Vec<Command>,
) {
    let (mut sender, mut receiver) = socket.split();

    let forward = tokio::spawn(async move {
        let first = ChannelEvent::Registered { pending };
        if send_event(&mut sender, &first).await.is_err() {
            return;
        }
        while let Some(event) = events.recv().await {
            let closing = matches!(event, ChannelEvent::SessionInvalidated { .. });
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
            if closing {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
        debug!(lease_id = %lease_id, "channel forwarder ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(lease_id = %lease_id, error = %err, "channel read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Ping) => debug!(lease_id = %lease_id, "agent ping"),
                Err(err) => debug!(lease_id = %lease_id, error = %err, "ignoring agent frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
        if forward.is_finished() {
            break;
        }
    }

    forward.abort();
    state.unregister_channel(lease_id, connection_id);
    info!(lease_id = %lease_id, "push channel closed");
}

async fn send_event<S>(sender: &mut S, event: &ChannelEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}
