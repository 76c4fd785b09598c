//! MQTT bridge workers.
//!
//! Bridge the in-process router onto the broker, preserving the addressing
//! discipline in both directions. The device bridge carries exactly one
//! device's topics; the fleet bridge carries the coordinator's wildcard
//! subscriptions. While the broker is unreachable the local router is marked
//! offline so publishes fail fast with `TransportUnavailable`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::mqtt::client::{MqttAddress, MqttClient};
use crate::mqtt::topics::Topics;
use crate::router::{MessageRouter, TopicKind};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// MQTT bridge options
#[derive(Debug, Clone)]
pub struct Options {
    /// MQTT broker address
    pub broker_address: MqttAddress,

    /// Reconnect backoff
    pub cooldown: CooldownOptions,

    /// Max reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_address: MqttAddress::default(),
            cooldown: CooldownOptions::default(),
            max_reconnect_attempts: 10,
        }
    }
}

/// Run the device-side bridge: broker → local update/command addresses,
/// local status/ack/telemetry → broker.
pub async fn run_device_bridge<S, F>(
    options: &Options,
    device_id: &str,
    router: MessageRouter,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    if options.broker_address.host.is_empty() {
        info!("MQTT host not configured, device bridge will not start.");
        return;
    }

    info!(device_id, "Device MQTT bridge starting...");
    let client_id = format!("gridlink-{}", device_id);
    let mut reconnect_attempts = 0u32;

    loop {
        let (client, mut eventloop) =
            match MqttClient::connect(&options.broker_address, &client_id, None) {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to create MQTT client: {}", e);
                    reconnect_attempts += 1;
                    if reconnect_attempts >= options.max_reconnect_attempts {
                        error!("Max reconnect attempts reached, giving up");
                        return;
                    }
                    sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts)).await;
                    continue;
                }
            };

        if let Err(e) = client.subscribe_device(device_id).await {
            error!("Failed to subscribe: {}", e);
            sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts)).await;
            continue;
        }

        let mut status_rx = router.subscribe_as(device_id, TopicKind::Status).await;
        let mut ack_rx = router.subscribe_as(device_id, TopicKind::CommandAck).await;
        let mut telemetry_rx = router.subscribe_as(device_id, TopicKind::Telemetry).await;

        reconnect_attempts = 0;
        router.set_online(true).await;
        info!(device_id, "Device MQTT bridge connected and subscribed");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!(device_id, "Device MQTT bridge shutting down...");
                    let _ = client.disconnect().await;
                    return;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Some(message)) => {
                            inbound_to_router(&router, device_id, &message.topic, &message.payload).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("MQTT poll error: {}, reconnecting...", e);
                            break;
                        }
                    }
                }
                Some(envelope) = status_rx.recv() => {
                    if let Err(e) = client.publish_envelope(&envelope).await {
                        warn!(error = %e, "status not forwarded to broker");
                    }
                }
                Some(envelope) = ack_rx.recv() => {
                    if let Err(e) = client.publish_envelope(&envelope).await {
                        warn!(error = %e, "ack not forwarded to broker");
                    }
                }
                Some(envelope) = telemetry_rx.recv() => {
                    if let Err(e) = client.publish_envelope(&envelope).await {
                        warn!(error = %e, "telemetry not forwarded to broker");
                    }
                }
            }
        }

        router.set_online(false).await;
        sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts.max(1))).await;
    }
}

/// Run the fleet-side bridge: broker wildcard subscriptions → local router,
/// local update/command publishes → broker.
pub async fn run_fleet_bridge<S, F>(
    options: &Options,
    router: MessageRouter,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    if options.broker_address.host.is_empty() {
        info!("MQTT host not configured, fleet bridge will not start.");
        return;
    }

    info!("Fleet MQTT bridge starting...");
    let mut reconnect_attempts = 0u32;

    loop {
        let (client, mut eventloop) =
            match MqttClient::connect(&options.broker_address, "gridlink-fleet", None) {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to create MQTT client: {}", e);
                    reconnect_attempts += 1;
                    if reconnect_attempts >= options.max_reconnect_attempts {
                        error!("Max reconnect attempts reached, giving up");
                        return;
                    }
                    sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts)).await;
                    continue;
                }
            };

        if let Err(e) = client.subscribe_fleet().await {
            error!("Failed to subscribe: {}", e);
            sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts)).await;
            continue;
        }

        let mut update_tap = router.subscribe_fleet(TopicKind::Update).await;
        let mut command_tap = router.subscribe_fleet(TopicKind::Command).await;

        reconnect_attempts = 0;
        router.set_online(true).await;
        info!("Fleet MQTT bridge connected and subscribed");

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Fleet MQTT bridge shutting down...");
                    let _ = client.disconnect().await;
                    return;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Some(message)) => {
                            fleet_inbound_to_router(&router, &message.topic, &message.payload).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("MQTT poll error: {}, reconnecting...", e);
                            break;
                        }
                    }
                }
                Some(envelope) = update_tap.recv() => {
                    if let Err(e) = client.publish_envelope(&envelope).await {
                        warn!(error = %e, "update notice not forwarded to broker");
                    }
                }
                Some(envelope) = command_tap.recv() => {
                    if let Err(e) = client.publish_envelope(&envelope).await {
                        warn!(error = %e, "command not forwarded to broker");
                    }
                }
            }
        }

        router.set_online(false).await;
        sleep_fn(calc_exp_backoff(&options.cooldown, reconnect_attempts.max(1))).await;
    }
}

/// Deliver one broker message into a device's local router addresses
async fn inbound_to_router(router: &MessageRouter, device_id: &str, topic: &str, payload: &[u8]) {
    let Some(address) = Topics::parse(topic) else {
        warn!(topic, "unrecognized topic, dropping");
        return;
    };

    // A broker-delivered message for another device would be a subscription
    // leak; never forward it into this device's addresses.
    if address.device_id != device_id {
        warn!(topic, "message for foreign device on this link, dropping");
        return;
    }
    if !matches!(address.kind, TopicKind::Update | TopicKind::Command) {
        return;
    }

    forward(router, &address.device_id, address.kind, payload).await;
}

/// Deliver one broker message into the coordinator's local router
async fn fleet_inbound_to_router(router: &MessageRouter, topic: &str, payload: &[u8]) {
    let Some(address) = Topics::parse(topic) else {
        warn!(topic, "unrecognized topic, dropping");
        return;
    };
    if !matches!(
        address.kind,
        TopicKind::Status | TopicKind::CommandAck | TopicKind::Telemetry
    ) {
        return;
    }

    forward(router, &address.device_id, address.kind, payload).await;
}

async fn forward(router: &MessageRouter, device_id: &str, kind: TopicKind, payload: &[u8]) {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "undecodable payload, dropping");
            return;
        }
    };
    if let Err(e) = router.publish_to(device_id, kind, value).await {
        warn!(error = %e, "broker message not delivered locally");
    }
}
