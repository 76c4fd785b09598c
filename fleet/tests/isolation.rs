//! Cross-device isolation under fleet-wide concurrent load.
//!
//! The central correctness property: nothing addressed to device A is ever
//! observable by, or mutates state belonging to, device B.

mod common;

use std::sync::atomic::Ordering;

use common::{publish_image, settle, spawn_coordinator, spawn_device, wait_terminal, DeviceConfig};
use gridlink::agent::safety::OperatingMode;
use gridlink::models::command::{AckResult, CommandAck};
use gridlink::models::session::SessionState;
use gridlink::router::{MessageRouter, TopicKind};
use serde_json::json;

const FLEET_SIZE: usize = 10;

#[tokio::test]
async fn command_to_one_device_changes_no_other_device() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;

    let mut devices = Vec::new();
    for i in 0..FLEET_SIZE {
        devices.push(spawn_device(&router, &format!("bat-{i}"), DeviceConfig::default()).await);
    }
    settle().await;

    let mut acks = router.subscribe_fleet(TopicKind::CommandAck).await;

    let correlation_id = coordinator
        .dispatch_command("bat-3", "discharge", json!({"power_kw": 5.0}))
        .await
        .unwrap();

    // The commanded device acknowledged and switched mode
    let ack_envelope = acks.recv().await.unwrap();
    assert_eq!(ack_envelope.address.device_id, "bat-3");
    let ack: CommandAck = serde_json::from_value(ack_envelope.payload).unwrap();
    assert_eq!(ack.correlation_id, correlation_id);
    assert_eq!(ack.result, AckResult::Applied);

    let commanded = devices[3].state.snapshot().await;
    assert_eq!(commanded.mode, OperatingMode::Discharge);
    assert_eq!(commanded.power_kw, -5.0);

    // The other nine are byte-for-byte idle
    for (i, device) in devices.iter().enumerate() {
        if i == 3 {
            continue;
        }
        let state = device.state.snapshot().await;
        assert_eq!(state.mode, OperatingMode::Idle, "device bat-{i} mode leaked");
        assert_eq!(state.power_kw, 0.0, "device bat-{i} power leaked");
    }
}

#[tokio::test]
async fn concurrent_sessions_and_commands_stay_per_device() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;

    let mut devices = Vec::new();
    for i in 0..FLEET_SIZE {
        devices.push(spawn_device(&router, &format!("bat-{i}"), DeviceConfig::default()).await);
    }
    settle().await;

    // Devices 0..5 update concurrently, each to its own version
    let mut session_ids = Vec::new();
    for (i, device) in devices.iter().take(5).enumerate() {
        let version = format!("2.{i}.0");
        let bytes = format!("image-v{version}");
        let image = publish_image(device, &version, bytes.as_bytes());
        let session_id = coordinator
            .start_update(&device.device_id, image)
            .await
            .unwrap();
        session_ids.push(session_id);
    }

    // Meanwhile devices 5..10 get operational commands
    for device in devices.iter().skip(5) {
        coordinator
            .dispatch_command(&device.device_id, "charge", json!({"power_kw": 2.0}))
            .await
            .unwrap();
    }

    // Every session lands, each on its own device with its own version
    for (i, session_id) in session_ids.iter().enumerate() {
        let session = wait_terminal(&coordinator, session_id).await;
        assert_eq!(session.state, SessionState::UpdateSuccess);
        assert_eq!(session.device_id, format!("bat-{i}"));

        let store = devices[i].reopen_store().await;
        assert_eq!(store.confirmed_version(), Some(format!("2.{i}.0").as_str()));
    }

    // Updated devices did not absorb anyone's commands
    for device in devices.iter().take(5) {
        let state = device.state.snapshot().await;
        assert_eq!(state.mode, OperatingMode::Idle);
    }

    // Commanded devices did not absorb anyone's updates
    settle().await;
    for device in devices.iter().skip(5) {
        let state = device.state.snapshot().await;
        assert_eq!(state.mode, OperatingMode::Charge);
        let store = device.reopen_store().await;
        assert_eq!(store.confirmed_version(), Some("1.0.0"));
        assert!(store.staged().is_none());
    }
}

#[tokio::test]
async fn one_device_failure_does_not_stall_the_fleet() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;

    let healthy = spawn_device(&router, "bat-ok", DeviceConfig::default()).await;
    let unhealthy = spawn_device(&router, "bat-sick", DeviceConfig::default()).await;
    settle().await;

    // The sick device will fail healthcheck and churn through rollback while
    // the healthy one updates
    unhealthy.health.store(false, Ordering::SeqCst);

    let sick_image = publish_image(&unhealthy, "3.0.0", b"image-sick-3.0.0");
    let ok_image = publish_image(&healthy, "3.0.0", b"image-ok-3.0.0");

    let sick_session = coordinator
        .start_update("bat-sick", sick_image)
        .await
        .unwrap();
    let ok_session = coordinator.start_update("bat-ok", ok_image).await.unwrap();

    let ok_result = wait_terminal(&coordinator, &ok_session).await;
    assert_eq!(ok_result.state, SessionState::UpdateSuccess);

    let sick_result = wait_terminal(&coordinator, &sick_session).await;
    assert_eq!(sick_result.state, SessionState::RollbackExecuted);

    // Outcomes stayed attached to the right devices
    assert_eq!(
        healthy.reopen_store().await.confirmed_version(),
        Some("3.0.0")
    );
    assert_eq!(
        unhealthy.reopen_store().await.confirmed_version(),
        Some("1.0.0")
    );
}
