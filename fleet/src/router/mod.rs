//! Address-scoped message router.
//!
//! In-process publish/subscribe bridge with the same addressing discipline
//! as the MQTT topic scheme: every message carries a device-scoped address,
//! and a message published with address *X* is deliverable only to
//! subscribers registered for address *X*. Isolation is structural — there
//! is no API for a device-scoped subscriber to receive another device's
//! traffic. The router holds no business state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// The per-device channel a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Cloud → device: update notifications
    Update,
    /// Device → cloud: session status events
    Status,
    /// Cloud → device: operational commands
    Command,
    /// Device → cloud: command acknowledgments
    CommandAck,
    /// Device → cloud: heartbeat/telemetry
    Telemetry,
}

/// A device-scoped address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub device_id: String,
    pub kind: TopicKind,
}

impl Address {
    pub fn new(device_id: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }
}

/// A routed message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub address: Address,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

struct Inner {
    device_subs: HashMap<Address, Vec<UnboundedSender<Envelope>>>,
    fleet_taps: HashMap<TopicKind, Vec<UnboundedSender<Envelope>>>,
    online: bool,
}

/// In-process topic-addressed router. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RwLock<Inner>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                device_subs: HashMap::new(),
                fleet_taps: HashMap::new(),
                online: true,
            })),
        }
    }

    /// Publish to exactly one device's address.
    ///
    /// Returns `TransportUnavailable` when the transport is down; the
    /// payloads are idempotent (session/correlation ids) so callers retry.
    pub async fn publish_to(
        &self,
        device_id: &str,
        kind: TopicKind,
        payload: serde_json::Value,
    ) -> Result<(), FleetError> {
        let inner = self.inner.read().await;
        if !inner.online {
            return Err(FleetError::TransportUnavailable(format!(
                "publish to {}/{:?} dropped",
                device_id, kind
            )));
        }

        let envelope = Envelope {
            address: Address::new(device_id, kind),
            payload,
            published_at: Utc::now(),
        };

        if let Some(senders) = inner.device_subs.get(&envelope.address) {
            for sender in senders {
                let _ = sender.send(envelope.clone());
            }
        }

        if let Some(taps) = inner.fleet_taps.get(&kind) {
            for tap in taps {
                let _ = tap.send(envelope.clone());
            }
        }

        Ok(())
    }

    /// Publish the same fleet-wide payload to every subscribed device on
    /// `kind`, each under its own address. Device-addressed traffic is never
    /// broadcast; this enumerates registered addresses instead.
    pub async fn publish_all(
        &self,
        kind: TopicKind,
        payload: serde_json::Value,
    ) -> Result<usize, FleetError> {
        let inner = self.inner.read().await;
        if !inner.online {
            return Err(FleetError::TransportUnavailable(format!(
                "fleet publish on {:?} dropped",
                kind
            )));
        }

        let mut delivered = 0;
        for (address, senders) in &inner.device_subs {
            if address.kind != kind {
                continue;
            }
            let envelope = Envelope {
                address: address.clone(),
                payload: payload.clone(),
                published_at: Utc::now(),
            };
            for sender in senders {
                if sender.send(envelope.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Subscribe to one device's address. Only messages published with this
    /// exact address arrive on the returned receiver.
    pub async fn subscribe_as(&self, device_id: &str, kind: TopicKind) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.inner.write().await;
        prune(&mut inner);
        inner
            .device_subs
            .entry(Address::new(device_id, kind))
            .or_default()
            .push(tx);
        rx
    }

    /// Coordinator-side tap: every message of `kind`, regardless of which
    /// device address it was published under. The envelope retains the
    /// originating address, so attribution is never lost.
    pub async fn subscribe_fleet(&self, kind: TopicKind) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.inner.write().await;
        prune(&mut inner);
        inner.fleet_taps.entry(kind).or_default().push(tx);
        rx
    }

    /// Simulate transport loss/recovery (the MQTT bridge drives this in
    /// production when the broker connection drops).
    pub async fn set_online(&self, online: bool) {
        self.inner.write().await.online = online;
    }

    pub async fn is_online(&self) -> bool {
        self.inner.read().await.online
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(inner: &mut Inner) {
    inner.device_subs.retain(|_, senders| {
        senders.retain(|s| !s.is_closed());
        !senders.is_empty()
    });
    inner.fleet_taps.retain(|_, taps| {
        taps.retain(|t| !t.is_closed());
        !taps.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_exact_address_delivery() {
        let router = MessageRouter::new();
        let mut rx_a = router.subscribe_as("bat-a", TopicKind::Command).await;
        let mut rx_b = router.subscribe_as("bat-b", TopicKind::Command).await;

        router
            .publish_to("bat-a", TopicKind::Command, json!({"n": 1}))
            .await
            .unwrap();

        let envelope = rx_a.recv().await.unwrap();
        assert_eq!(envelope.address.device_id, "bat-a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kind_scoping_within_one_device() {
        let router = MessageRouter::new();
        let mut updates = router.subscribe_as("bat-a", TopicKind::Update).await;
        let mut commands = router.subscribe_as("bat-a", TopicKind::Command).await;

        router
            .publish_to("bat-a", TopicKind::Update, json!({"version": "1.1.0"}))
            .await
            .unwrap();

        assert!(updates.recv().await.is_some());
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fleet_tap_keeps_attribution() {
        let router = MessageRouter::new();
        let mut tap = router.subscribe_fleet(TopicKind::Status).await;

        router
            .publish_to("bat-a", TopicKind::Status, json!({"status": "DOWNLOADING"}))
            .await
            .unwrap();
        router
            .publish_to("bat-b", TopicKind::Status, json!({"status": "STAGED"}))
            .await
            .unwrap();

        assert_eq!(tap.recv().await.unwrap().address.device_id, "bat-a");
        assert_eq!(tap.recv().await.unwrap().address.device_id, "bat-b");
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let router = MessageRouter::new();
        router.set_online(false).await;

        let err = router
            .publish_to("bat-a", TopicKind::Status, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TransportUnavailable(_)));

        router.set_online(true).await;
        router
            .publish_to("bat-a", TopicKind::Status, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_all_addresses_each_subscriber() {
        let router = MessageRouter::new();
        let mut rx_a = router.subscribe_as("bat-a", TopicKind::Update).await;
        let mut rx_b = router.subscribe_as("bat-b", TopicKind::Update).await;
        let _commands = router.subscribe_as("bat-c", TopicKind::Command).await;

        let delivered = router
            .publish_all(TopicKind::Update, json!({"advisory": true}))
            .await
            .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap().address.device_id, "bat-a");
        assert_eq!(rx_b.recv().await.unwrap().address.device_id, "bat-b");
    }
}
