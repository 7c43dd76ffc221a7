//! End-to-end field scenarios over an on-disk store

mod common;

use common::*;
use fleetsync::{
    Attachment, DrainOutcome, DrainSummary, EngineEvent, OperationStatus, PerformOutcome,
    PerformRequest, RocksStore, SyncEngine, SyncError,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open_engine(dir: &Path, transport: Arc<ScriptedTransport>, online: bool) -> SyncEngine {
    let store = RocksStore::open(dir).expect("Failed to open store");
    create_engine(transport, Arc::new(store), online)
}

/// A driver registers fuel with a pump photo in a dead zone, the app is
/// killed, and the record reaches the server once coverage returns.
#[tokio::test]
async fn test_fuel_registration_with_photo_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let transport = ScriptedTransport::offline();
    let photo = vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4];

    let queued_id = {
        let engine = open_engine(tmp.path(), transport.clone(), false);
        let outcome = engine
            .perform(
                PerformRequest::post("registrations")
                    .body(json!({"vehicle_id": 3, "liters": 42.0}))
                    .attachment(
                        Attachment::new("photo", photo.clone())
                            .with_file_name("pump.jpg")
                            .with_content_type("image/jpeg"),
                    ),
            )
            .await
            .unwrap();
        let PerformOutcome::Queued(ack) = outcome else {
            panic!("expected queued");
        };
        ack.id
    };

    // App restarted; coverage is back
    transport.set_default(Reply::created(
        json!({"id": 981, "vehicle_id": 3, "liters": 42.0}),
    ));
    let engine = open_engine(tmp.path(), transport.clone(), false);
    assert_eq!(engine.pending().unwrap().len(), 1);

    let mut events = engine.subscribe();
    let outcome = engine.set_online(true).await;
    assert_eq!(
        outcome,
        Some(DrainOutcome::Completed(DrainSummary {
            succeeded: 1,
            ..Default::default()
        }))
    );

    assert!(engine.pending().unwrap().is_empty());
    assert_eq!(
        engine.cached("registrations").unwrap(),
        Some(json!([{"id": 981, "vehicle_id": 3, "liters": 42.0}]))
    );

    let sent = transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].operation_id.as_ref(), Some(&queued_id));
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].data, photo);
    assert_eq!(
        sent[0].body,
        Some(json!({"vehicle_id": 3, "liters": 42.0, "tempId": queued_id.to_string()}))
    );

    let event = wait_for_event(&mut events, |e| matches!(e, EngineEvent::Synced { .. })).await;
    assert_eq!(
        event,
        EngineEvent::Synced {
            id: queued_id,
            collection_key: Some("registrations".to_string())
        }
    );
}

/// An offline vehicle edit collides with a plate registered elsewhere. The
/// rejection is surfaced once and kept for the user to fix or drop.
#[tokio::test]
async fn test_rejected_vehicle_edit_waits_for_user() {
    let tmp = TempDir::new().unwrap();
    let transport = ScriptedTransport::answering(json!({}));
    transport.push(Reply::Status(400, json!({"error": "plate already exists"})));

    let engine = open_engine(tmp.path(), transport.clone(), false);
    let outcome = engine
        .perform(PerformRequest::put("vehicles/7").body(json!({"plate": "AB-123"})))
        .await
        .unwrap();
    let PerformOutcome::Queued(ack) = outcome else {
        panic!("expected queued");
    };
    let id = ack.id;

    let mut events = engine.subscribe();
    let outcome = engine.set_online(true).await;
    assert_eq!(
        outcome,
        Some(DrainOutcome::Completed(DrainSummary {
            rejected: 1,
            ..Default::default()
        }))
    );

    let event = wait_for_event(&mut events, |e| matches!(e, EngineEvent::Rejected { .. })).await;
    assert_eq!(
        event,
        EngineEvent::Rejected {
            id: id.clone(),
            status: 400,
            message: "plate already exists".to_string()
        }
    );

    let op = engine.pending().unwrap().remove(0);
    assert!(op.status.is_terminal());
    assert_eq!(op.last_status, Some(400));
    assert_eq!(op.last_error.as_deref(), Some("plate already exists"));
    drop(engine);

    // Still there after a restart, and never sent again on its own
    let engine = open_engine(tmp.path(), transport.clone(), true);
    let op = engine.pending().unwrap().remove(0);
    assert_eq!(op.id, id);
    assert!(op.status.is_terminal());

    engine.drain().await;
    engine.drain().await;
    assert_eq!(transport.request_count(), 1);

    // Unknown ids are reported
    let err = engine.discard(&"nope".into()).unwrap_err();
    assert!(matches!(err, SyncError::OperationNotFound(_)));

    // The user fixes the plate and resubmits
    let op = engine
        .resubmit(&id, Some(json!({"plate": "AB-124"})))
        .unwrap();
    assert_eq!(op.status, OperationStatus::Queued);
    assert_eq!(op.last_error, None);

    let outcome = engine.drain().await;
    assert_eq!(
        outcome,
        DrainOutcome::Completed(DrainSummary {
            succeeded: 1,
            ..Default::default()
        })
    );
    assert!(engine.pending().unwrap().is_empty());
    assert_eq!(transport.requests()[1].body, Some(json!({"plate": "AB-124"})));
}

#[tokio::test]
async fn test_rejected_edit_can_be_discarded() {
    let tmp = TempDir::new().unwrap();
    let transport = ScriptedTransport::answering(json!({}));
    transport.push(Reply::Status(422, json!({"message": "odometer went backwards"})));

    let engine = open_engine(tmp.path(), transport.clone(), false);
    engine
        .perform(PerformRequest::patch("vehicles/7").body(json!({"km": 10})))
        .await
        .unwrap();
    engine.set_online(true).await;

    let id = engine.pending().unwrap()[0].id.clone();
    let mut events = engine.subscribe();
    let dropped = engine.discard(&id).unwrap();
    assert_eq!(dropped.last_status, Some(422));

    let event = wait_for_event(&mut events, |e| matches!(e, EngineEvent::Discarded { .. })).await;
    assert_eq!(event, EngineEvent::Discarded { id });
    assert!(engine.pending().unwrap().is_empty());
}
