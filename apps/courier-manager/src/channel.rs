use std::sync::Arc;

use courier_proto::ChannelEvent;
use dashmap::DashMap;
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::metrics;

#[derive(Clone)]
struct ChannelHandle {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// Live push channels keyed by lease id. At most one connection per lease; a newer
/// registration replaces the older one, whose receiver then drains and closes.
/// The registry is the only writer of its gauge.
#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<DashMap<Uuid, ChannelHandle>>,
    gauge: IntGauge,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_gauge(metrics::ACTIVE_CHANNELS.clone())
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gauge(gauge: IntGauge) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            gauge,
        }
    }

    pub fn register(&self, lease_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        let previous = self
            .channels
            .insert(lease_id, ChannelHandle { connection_id, tx });
        if previous.is_none() {
            self.gauge.inc();
        }
        debug!(lease_id = %lease_id, %connection_id, "channel registered");
        (connection_id, rx)
    }

    /// Removes the registration only if it still belongs to `connection_id`.
    pub fn unregister(&self, lease_id: Uuid, connection_id: Uuid) {
        let removed = self
            .channels
            .remove_if(&lease_id, |_, handle| handle.connection_id == connection_id);
        if removed.is_some() {
            self.gauge.dec();
            debug!(lease_id = %lease_id, %connection_id, "channel unregistered");
        }
    }

    /// Pushes an event; false when no channel is registered or it has closed.
    pub fn send(&self, lease_id: Uuid, event: ChannelEvent) -> bool {
        let Some(handle) = self.channels.get(&lease_id).map(|entry| entry.clone()) else {
            return false;
        };
        if handle.tx.send(event).is_ok() {
            return true;
        }
        self.unregister(lease_id, handle.connection_id);
        false
    }

    /// Tells the agent its session is gone and drops the channel.
    pub fn invalidate(&self, lease_id: Uuid, reason: &str) {
        if let Some((_, handle)) = self.channels.remove(&lease_id) {
            self.gauge.dec();
            let _ = handle.tx.send(ChannelEvent::SessionInvalidated {
                reason: reason.to_string(),
            });
            debug!(lease_id = %lease_id, reason, "channel invalidated");
        }
    }

    pub fn is_connected(&self, lease_id: Uuid) -> bool {
        self.channels.contains_key(&lease_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_registration_replaces_older() {
        let registry = ChannelRegistry::new();
        let lease = Uuid::new_v4();
        let (first, mut first_rx) = registry.register(lease);
        let (_second, mut second_rx) = registry.register(lease);

        // The stale connection cannot remove the live one.
        registry.unregister(lease, first);
        assert!(registry.is_connected(lease));

        assert!(registry.send(
            lease,
            ChannelEvent::SessionInvalidated {
                reason: "x".into()
            }
        ));
        assert!(second_rx.recv().await.is_some());
        assert!(first_rx.recv().await.is_none());
    }

    #[test]
    fn gauge_counts_each_live_lease_once() {
        let gauge = IntGauge::new("channels_under_test", "test").unwrap();
        let registry = ChannelRegistry::with_gauge(gauge.clone());
        let lease = Uuid::new_v4();
        let (first, _first_rx) = registry.register(lease);
        assert_eq!(gauge.get(), 1);
        let (second, _second_rx) = registry.register(lease);
        assert_eq!(gauge.get(), 1);

        registry.unregister(lease, first);
        assert_eq!(gauge.get(), 1);
        registry.unregister(lease, second);
        assert_eq!(gauge.get(), 0);
        registry.unregister(lease, second);
        assert_eq!(gauge.get(), 0);

        let other = Uuid::new_v4();
        registry.register(other);
        registry.invalidate(other, "revoked");
        registry.invalidate(other, "revoked");
        assert_eq!(gauge.get(), 0);
    }

    #[tokio::test]
    async fn invalidate_delivers_reason_then_closes() {
        let registry = ChannelRegistry::new();
        let lease = Uuid::new_v4();
        let (_id, mut rx) = registry.register(lease);
        registry.invalidate(lease, "revoked");
        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::SessionInvalidated {
                reason: "revoked".into()
            })
        );
        assert!(rx.recv().await.is_none());
        assert!(!registry.send(
            lease,
            ChannelEvent::Registered { pending: vec![] }
        ));
    }
}
