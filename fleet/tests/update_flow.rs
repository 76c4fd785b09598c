//! End-to-end update scenarios: coordinator, router, and a real agent over
//! a temp-dir slot store.

mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration as ChronoDuration, Utc};

use common::{publish_image, settle, spawn_coordinator, spawn_device, wait_terminal, DeviceConfig};
use gridlink::errors::FleetError;
use gridlink::models::image::{Checksum, UpdateImage};
use gridlink::models::session::SessionState;
use gridlink::models::status::{StatusEvent, StatusKind};
use gridlink::router::{MessageRouter, TopicKind};

#[tokio::test]
async fn successful_update_commits_target_version() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;
    let device = spawn_device(&router, "bat-1", DeviceConfig::default()).await;
    settle().await;

    let image = publish_image(&device, "1.1.0", b"image-v1.1.0");
    let session_id = coordinator.start_update("bat-1", image).await.unwrap();

    let session = wait_terminal(&coordinator, &session_id).await;
    assert_eq!(session.state, SessionState::UpdateSuccess);

    // The history walked the full pipeline in order
    let states: Vec<SessionState> = session.history.iter().map(|t| t.state).collect();
    assert_eq!(states.first(), Some(&SessionState::Pending));
    assert_eq!(states.last(), Some(&SessionState::UpdateSuccess));
    assert!(states.contains(&SessionState::Downloading));
    assert!(states.contains(&SessionState::Installing));
    assert!(states.contains(&SessionState::HealthcheckPending));

    // Registry observed the commit
    let record = coordinator.device("bat-1").await.unwrap();
    assert_eq!(record.confirmed_version.as_deref(), Some("1.1.0"));

    // The device's own store flipped slots and confirmed the version
    let store = device.reopen_store().await;
    assert_eq!(store.confirmed_version(), Some("1.1.0"));
    assert_eq!(store.read_active_image().await.unwrap(), b"image-v1.1.0");
    assert!(store.staged().is_none());
}

#[tokio::test]
async fn checksum_mismatch_leaves_active_slot_untouched() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;
    let device = spawn_device(&router, "bat-1", DeviceConfig::default()).await;
    settle().await;

    // Declared digest is for different bytes than the source serves
    let url = "https://images.gridlink.energy/fw-1.1.1.img".to_string();
    device.fetcher.insert(url.clone(), b"corrupted payload".to_vec());
    let image = UpdateImage {
        version: "1.1.1".to_string(),
        source_url: url,
        checksum: Checksum::sha256_of(b"the bytes that were promised"),
        size_bytes: None,
        signature: None,
    };

    let before = device.reopen_store().await.read_active_image().await.unwrap();

    let session_id = coordinator.start_update("bat-1", image).await.unwrap();
    let session = wait_terminal(&coordinator, &session_id).await;
    assert_eq!(session.state, SessionState::ChecksumFailed);

    // Hard correctness requirement: active slot bytes are identical and the
    // rejected download is gone
    let store = device.reopen_store().await;
    assert_eq!(store.read_active_image().await.unwrap(), before);
    assert_eq!(store.confirmed_version(), Some("1.0.0"));
    assert!(store.staged().is_none());
    assert!(tokio::fs::metadata(store.scratch_path()).await.is_err());

    let record = coordinator.device("bat-1").await.unwrap();
    assert_eq!(record.confirmed_version.as_deref(), None);
}

#[tokio::test]
async fn failed_healthcheck_rolls_back_to_previous_version() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;
    let device = spawn_device(&router, "bat-1", DeviceConfig::default()).await;
    settle().await;

    // Force the post-boot self-test to fail
    device.health.store(false, Ordering::SeqCst);

    let image = publish_image(&device, "1.1.2", b"image-v1.1.2");
    let session_id = coordinator.start_update("bat-1", image).await.unwrap();

    let session = wait_terminal(&coordinator, &session_id).await;
    assert_eq!(session.state, SessionState::RollbackExecuted);

    // Confirmed version is the pre-update version, not the target
    let store = device.reopen_store().await;
    assert_eq!(store.confirmed_version(), Some("1.0.0"));
    assert_ne!(store.confirmed_version(), Some("1.1.2"));
    assert_eq!(store.read_active_image().await.unwrap(), b"image-v1.0.0");

    let record = coordinator.device("bat-1").await.unwrap();
    assert_eq!(record.confirmed_version.as_deref(), Some("1.0.0"));

    // A later update on the recovered device still works
    device.health.store(true, Ordering::SeqCst);
    let image = publish_image(&device, "1.2.0", b"image-v1.2.0");
    let session_id = coordinator.start_update("bat-1", image).await.unwrap();
    let session = wait_terminal(&coordinator, &session_id).await;
    assert_eq!(session.state, SessionState::UpdateSuccess);
}

#[tokio::test]
async fn second_session_is_rejected_while_first_is_live() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;
    // No agent: the first session stays in PENDING for the whole test

    let image = UpdateImage {
        version: "9.9.9".to_string(),
        source_url: "https://images.gridlink.energy/fw-9.9.9.img".to_string(),
        checksum: Checksum::sha256_of(b"whatever"),
        size_bytes: None,
        signature: None,
    };

    let first = coordinator.start_update("bat-quiet", image.clone()).await.unwrap();
    let second = coordinator.start_update("bat-quiet", image).await;
    assert!(matches!(second.unwrap_err(), FleetError::SessionBusy(_)));

    // The first session's state is untouched by the rejected start
    let session = coordinator.session(&first).await.unwrap();
    assert_eq!(session.state, SessionState::Pending);
}

#[tokio::test]
async fn silent_device_times_out_by_deadline() {
    let router = MessageRouter::new();
    let coordinator = spawn_coordinator(&router).await;
    // No agent is spawned: the device never answers

    let image = UpdateImage {
        version: "1.1.0".to_string(),
        source_url: "https://images.gridlink.energy/fw-1.1.0.img".to_string(),
        checksum: Checksum::sha256_of(b"image-v1.1.0"),
        size_bytes: None,
        signature: None,
    };
    let session_id = coordinator.start_update("bat-ghost", image).await.unwrap();

    // Before the deadline nothing expires
    assert_eq!(coordinator.sweep_once(Utc::now()).await, 0);

    let past_deadline = Utc::now() + ChronoDuration::seconds(60);
    assert_eq!(coordinator.sweep_once(past_deadline).await, 1);

    let session = coordinator.session(&session_id).await.unwrap();
    assert_eq!(session.state, SessionState::SessionTimeout);

    // The registry renders the timeout distinctly from device-reported failure
    let record = coordinator.device("bat-ghost").await.unwrap();
    assert_eq!(record.last_session_state, Some(SessionState::SessionTimeout));
    assert_eq!(record.last_seen_at, None);

    // A late terminal report from the presumed-dead device no longer moves
    // the session
    let late = StatusEvent::new("bat-ghost", Some(session_id.clone()), StatusKind::UpdateSuccess)
        .with_version("1.1.0");
    router
        .publish_to(
            "bat-ghost",
            TopicKind::Status,
            serde_json::to_value(&late).unwrap(),
        )
        .await
        .unwrap();
    settle().await;

    let expired = coordinator.session(&session_id).await.unwrap();
    assert_eq!(expired.state, SessionState::SessionTimeout);
    // The device is alive after all; the registry view reflects its report
    let record = coordinator.device("bat-ghost").await.unwrap();
    assert!(record.last_seen_at.is_some());
}
