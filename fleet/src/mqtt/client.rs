//! MQTT client implementation

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::FleetError;
use crate::mqtt::topics::Topics;
use crate::router::{Envelope, TopicKind};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
        }
    }
}

/// MQTT client wrapper. The publish half is cheap to clone; the event half
/// is polled separately so a bridge can publish and poll concurrently.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
}

/// The poll half of a connection
pub struct MqttEventLoop {
    eventloop: EventLoop,
}

impl MqttClient {
    /// Connect to the broker. `credentials` is `(username, password)`.
    pub fn connect(
        address: &MqttAddress,
        client_id: &str,
        credentials: Option<(&str, &str)>,
    ) -> Result<(Self, MqttEventLoop), FleetError> {
        if address.host.is_empty() {
            return Err(FleetError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;
            use std::sync::Arc;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    FleetError::MqttError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 32);

        Ok((Self { client }, MqttEventLoop { eventloop }))
    }

    /// Subscribe to the topics a device listens on: updates and commands
    pub async fn subscribe_device(&self, device_id: &str) -> Result<(), FleetError> {
        for topic in [Topics::ota_update(device_id), Topics::command(device_id)] {
            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| FleetError::MqttError(e.to_string()))?;
            info!("Subscribed to: {}", topic);
        }
        Ok(())
    }

    /// Subscribe to the fleet-wide device-originated topics (coordinator side)
    pub async fn subscribe_fleet(&self) -> Result<(), FleetError> {
        for kind in [TopicKind::Status, TopicKind::CommandAck, TopicKind::Telemetry] {
            let filter = Topics::fleet_filter(kind);
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| FleetError::MqttError(e.to_string()))?;
            info!("Subscribed to: {}", filter);
        }
        Ok(())
    }

    /// Publish a routed envelope to its broker topic.
    ///
    /// Status events, notices, commands, and acks use QoS 1 (at least once);
    /// telemetry is fire-and-forget at QoS 0.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), FleetError> {
        let topic = Topics::for_address(&envelope.address);
        let qos = match envelope.address.kind {
            TopicKind::Telemetry => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        };
        let payload = serde_json::to_vec(&envelope.payload)?;

        self.client
            .publish(&topic, qos, false, payload)
            .await
            .map_err(|e| FleetError::MqttError(e.to_string()))?;

        debug!("Published to: {}", topic);
        Ok(())
    }

    /// Disconnect from broker
    pub async fn disconnect(&self) -> Result<(), FleetError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| FleetError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

impl MqttEventLoop {
    /// Poll for events
    pub async fn poll(&mut self) -> Result<Option<MqttMessage>, FleetError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let payload = publish.payload.to_vec();

                debug!("Received message on topic: {}", topic);

                Ok(Some(MqttMessage { topic, payload }))
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                Ok(None)
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("MQTT poll error: {}", e);
                Err(FleetError::MqttError(e.to_string()))
            }
        }
    }
}

/// MQTT message
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Parse payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FleetError> {
        serde_json::from_slice(&self.payload).map_err(|e| FleetError::MqttError(e.to_string()))
    }
}
