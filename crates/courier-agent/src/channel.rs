use courier_proto::{AgentFrame, ChannelEvent, DEVICE_CREDENTIAL_HEADER, LEASE_TOKEN_HEADER};
use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};

use crate::{client::LeaseAuth, AgentError};

/// Client end of a lease's push channel. Dropping it closes the socket.
pub struct PushChannel {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedSender<AgentFrame>,
    task: JoinHandle<()>,
}

impl PushChannel {
    pub async fn connect(manager_url: &str, auth: &LeaseAuth) -> Result<Self, AgentError> {
        let url = format!(
            "{}/leases/{}/channel",
            websocket_base(manager_url),
            auth.lease_id
        );
        let mut request = url
            .into_client_request()
            .map_err(|err| AgentError::Channel(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(DEVICE_CREDENTIAL_HEADER, header_value(&auth.credential)?);
        headers.insert(LEASE_TOKEN_HEADER, header_value(&auth.lease_token)?);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| AgentError::Channel(err.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<AgentFrame>();
        let lease_id = auth.lease_id;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let Ok(json) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    message = source.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ChannelEvent>(&text) {
                                    Ok(event) => {
                                        if events_tx.send(event).is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => warn!(
                                        target: "courier.channel",
                                        %lease_id,
                                        error = %err,
                                        "unreadable channel frame"
                                    ),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                debug!(target: "courier.channel", %lease_id, error = %err, "channel read failed");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = sink.close().await;
            debug!(target: "courier.channel", %lease_id, "push channel closed");
        });

        Ok(Self {
            events,
            outbound,
            task,
        })
    }

    /// Next pushed event, or `None` once the socket is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn ping(&self) -> bool {
        self.outbound.send(AgentFrame::Ping).is_ok()
    }

    /// Channel with no socket behind it; events are fed through the returned sender.
    #[cfg(test)]
    pub(crate) fn in_memory() -> (Self, mpsc::UnboundedSender<ChannelEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<AgentFrame>();
        let task = tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });
        (
            Self {
                events,
                outbound,
                task,
            },
            events_tx,
        )
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AgentError> {
    HeaderValue::from_str(value).map_err(|err| AgentError::Channel(err.to_string()))
}

fn websocket_base(manager_url: &str) -> String {
    let trimmed = manager_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}
