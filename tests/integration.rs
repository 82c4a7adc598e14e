// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Conformance Harness
//!
//! Scenarios run against the in-memory reference server through a recording
//! adapter, so every exchange the harness makes can be asserted on.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `cursor_*` - Cursor round-trip, cold start, stale cursors, persistence
//! - `poll_*` - Retry-poll timing contract
//! - `scenario_*` - Delivery, teardown and restorations end to end
//! - `protocol_*` - Expected-failure statuses and raw responses

mod common;

use common::{fields, scenario, seed, server, u1, u2, RecordingAdapter};
use conformance_harness::protocol::{MailMessage, RequestBody, SyncCommand, SyncRequest};
use conformance_harness::tracker::Artifact;
use conformance_harness::{
    poll_until, Command, CursorStore, FolderType, HarnessConfig, HarnessError, ItemKey, PollConfig, PollError, Request,
    Scenario, Status,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Cursor Tests
// =============================================================================

#[tokio::test]
async fn cursor_round_trip_after_every_exchange() {
    let server = server();
    let (scenario, _) = scenario("cursor_round_trip", &server).await;
    let session = scenario.session();
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();

    let primed = session.prime(&inbox).await.unwrap();
    assert_eq!(session.cursors().get(&u1(), &inbox).await, primed.cursor.clone().unwrap());

    seed(&server, "user1", FolderType::Inbox, "hello");
    let response = session
        .execute(Request::sync(inbox.clone(), SyncRequest::default()))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.items().len(), 1);
    let returned = response.cursor.unwrap();
    assert_ne!(Some(returned.clone()), primed.cursor);
    assert_eq!(session.cursors().get(&u1(), &inbox).await, returned);

    // The hierarchy cursor follows the same contract
    let hierarchy = session.cursors().get(&u1(), &conformance_harness::CollectionId::hierarchy()).await;
    assert!(!hierarchy.is_zero());

    scenario.release().await;
}

#[tokio::test]
async fn cursor_cold_start_with_zero_cursor() {
    let server = server();
    let (scenario, recorder) = scenario("cold_start", &server).await;
    let session = scenario.session();
    let contacts = scenario.folder(&u1(), FolderType::Contacts).await.unwrap();
    assert!(session.cursors().get(&u1(), &contacts).await.is_zero());

    recorder.clear();
    let items = session.sync_changes(&contacts, true).await.unwrap();
    assert!(items.adds.is_empty());
    assert!(!session.cursors().get(&u1(), &contacts).await.is_zero());

    let syncs = recorder.calls_for(Command::Sync);
    assert_eq!(syncs.len(), 2);
    assert!(syncs[0].cursor.as_ref().unwrap().is_zero());

    // Zero again resets the relationship rather than failing
    let again = session.prime(&contacts).await.unwrap();
    assert_eq!(again.status, Status::Success);

    scenario.release().await;
}

#[tokio::test]
async fn cursor_stale_replay_takes_cursor_state_path() {
    let server = server();
    let (scenario, _) = scenario("stale_cursor", &server).await;
    let session = scenario.session();
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();

    let stale = session.prime(&inbox).await.unwrap().cursor.unwrap();
    session.sync_changes(&inbox, false).await.unwrap();
    assert_ne!(session.cursors().get(&u1(), &inbox).await, stale);

    let response = session
        .execute_with_cursor(Request::sync(inbox.clone(), SyncRequest::default()), stale)
        .await
        .unwrap();
    assert_eq!(response.status, Status::InvalidCursor);
    assert!(session.cursors().get(&u1(), &inbox).await.is_zero());

    match response.ensure_success(&u1()) {
        Err(HarnessError::CursorState { owner, collection, status }) => {
            assert_eq!(owner, u1());
            assert_eq!(collection, inbox);
            assert_eq!(status, Status::InvalidCursor);
        }
        other => panic!("expected CursorState, got {other:?}"),
    }

    // Recovery is a re-prime
    assert!(session.snapshot(&inbox).await.unwrap().is_empty());
    scenario.release().await;
}

#[tokio::test]
async fn cursor_identities_do_not_share_cursors() {
    let server = server();
    let (scenario, recorder) = scenario("per_identity", &server).await;
    let session = scenario.session();

    let inbox1 = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    let inbox2 = scenario.folder(&u2(), FolderType::Inbox).await.unwrap();
    assert_eq!(inbox1, inbox2);

    scenario.switch_identity(&u1()).await.unwrap();
    session.prime(&inbox1).await.unwrap();
    scenario.switch_identity(&u2()).await.unwrap();
    assert!(session.cursors().get(&u2(), &inbox2).await.is_zero());

    recorder.clear();
    session.sync_changes(&inbox2, false).await.unwrap();
    let calls = recorder.calls_for(Command::Sync);
    assert!(calls[0].cursor.as_ref().unwrap().is_zero());
    assert!(calls.iter().all(|c| c.owner == Some(u2())));

    scenario.release().await;
}

#[tokio::test]
async fn cursor_collections_sync_concurrently() {
    let server = server();
    let (scenario, _) = scenario("concurrent_lanes", &server).await;
    let session = scenario.session();
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    let contacts = scenario.folder(&u1(), FolderType::Contacts).await.unwrap();
    seed(&server, "user1", FolderType::Inbox, "in inbox");

    let (a, b) = tokio::join!(session.snapshot(&inbox), session.snapshot(&contacts));
    assert_eq!(a.unwrap().len(), 1);
    assert!(b.unwrap().is_empty());

    let cursors = session.cursors().owner_cursors(&u1()).await;
    assert!(cursors.contains_key(&inbox));
    assert!(cursors.contains_key(&contacts));
    assert_ne!(cursors[&inbox], cursors[&contacts]);

    scenario.release().await;
}

#[tokio::test]
async fn cursor_ledger_persists_across_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursors.db");
    let mut config = HarnessConfig::for_testing();
    config.cursor.sqlite_path = Some(path.to_string_lossy().into_owned());

    let server = server();
    let recorder = Arc::new(RecordingAdapter::new(server.clone()));
    let scenario = Scenario::acquire("persist", config, recorder, server.clone()).await.unwrap();
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    let cursor = scenario.session().prime(&inbox).await.unwrap().cursor.unwrap();
    let report = scenario.release().await;
    assert!(report.is_clean());

    let reopened = CursorStore::open(&path).await.unwrap();
    assert_eq!(reopened.get(&u1(), &inbox).await, cursor);
    reopened.close().await;
}

// =============================================================================
// Poll Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn poll_first_attempt_success_costs_one_cycle() {
    let calls = AtomicU32::new(0);
    let config = PollConfig::new(10, Duration::from_secs(3));
    let started = Instant::now();

    let polled = poll_until(
        config,
        None,
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HarnessError>("ready") }
        },
        |_| true,
    )
    .await
    .unwrap();

    assert_eq!(polled.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn poll_never_true_exhausts_exactly() {
    let calls = AtomicU32::new(0);
    let config = PollConfig::new(7, Duration::from_millis(500));
    let started = Instant::now();

    let err = poll_until(
        config,
        None,
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HarnessError>(n) }
        },
        |_| false,
    )
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 7);
    assert_eq!(started.elapsed(), Duration::from_millis(3500));
    match err {
        PollError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 7);
            assert_eq!(last, 6);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_delivery_from_u2_to_u1_is_tracked_on_detection() {
    let server = server();
    server.set_delivery_delay(Duration::from_millis(25));
    let (scenario, recorder) = scenario("delivery", &server).await;
    let session = scenario.session();

    scenario.switch_identity(&u2()).await.unwrap();
    session
        .send_mail(MailMessage {
            to: vec!["user1".into()],
            subject: "S1".into(),
            body: "hello from U2".into(),
            save_in_sent: false,
        })
        .await
        .unwrap();

    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    let key = ItemKey::subject("S1");
    recorder.clear();
    let item = scenario.await_item(&u1(), &inbox, &key).await.unwrap();
    assert_eq!(item.field("Subject"), Some("S1"));

    // Visible at 25ms: checks at 10ms and 20ms miss, the one at 30ms finds
    // it. Each check is a prime plus one sync.
    let syncs = recorder.calls_for(Command::Sync);
    assert_eq!(syncs.len(), 6);
    assert!(syncs.iter().all(|c| c.owner == Some(u1())));

    assert_eq!(
        scenario.tracker().artifacts(&u1()).await,
        vec![Artifact::Item {
            collection: inbox.clone(),
            key: key.clone(),
        }]
    );

    let report = scenario.release().await;
    assert!(report.is_clean(), "{:?}", report.residue());
    assert!(server.items("user1", FolderType::Inbox).is_empty());
}

#[tokio::test]
async fn scenario_untracked_artifact_gets_no_delete_attempts() {
    let server = server();
    let (scenario, recorder) = scenario("untracked", &server).await;
    let session = scenario.session();
    let folder = scenario.folder(&u1(), FolderType::Contacts).await.unwrap();
    let key = ItemKey::file_as("contactA");

    session
        .sync_commands(
            &folder,
            vec![SyncCommand::Add {
                client_id: "c1".into(),
                fields: fields("FileAs", "contactA"),
            }],
            true,
        )
        .await
        .unwrap()
        .ensure_success(&u1())
        .unwrap();
    scenario.track(&u1(), &folder, [key.clone()]).await;

    let found = session.find_items(&folder, &key).await.unwrap();
    session
        .sync_commands(
            &folder,
            vec![SyncCommand::Delete {
                server_id: found[0].server_id.clone(),
            }],
            false,
        )
        .await
        .unwrap()
        .ensure_success(&u1())
        .unwrap();
    scenario.untrack(&u1(), &folder, [key]).await;

    recorder.clear();
    let report = scenario.release().await;
    assert!(report.is_clean());
    assert_eq!(report.artifact_count(), 0);
    assert_eq!(recorder.delete_commands(), 0);
}

#[tokio::test]
async fn scenario_teardown_removes_every_tracked_artifact() {
    let server = server();
    let (scenario, recorder) = scenario("cleanup", &server).await;
    let session = scenario.session();
    let contacts = scenario.folder(&u1(), FolderType::Contacts).await.unwrap();

    let names: Vec<String> = (0..3).map(|_| scenario.unique_name("contact")).collect();
    let adds = names
        .iter()
        .enumerate()
        .map(|(i, name)| SyncCommand::Add {
            client_id: format!("c{i}"),
            fields: fields("FileAs", name),
        })
        .collect();
    session.sync_commands(&contacts, adds, true).await.unwrap();
    scenario
        .track(&u1(), &contacts, names.iter().map(|n| ItemKey::file_as(n.as_str())))
        .await;

    let folder_name = scenario.unique_name("folder");
    scenario
        .create_folder(&conformance_harness::CollectionId::root(), &folder_name, FolderType::UserMail)
        .await
        .unwrap();

    recorder.clear();
    let report = scenario.release().await;
    assert!(report.is_clean(), "{:?}", report.residue());
    assert_eq!(report.artifact_count(), 4);
    assert_eq!(recorder.delete_commands(), 3);
    assert_eq!(recorder.calls_for(Command::FolderDelete).len(), 1);

    // Re-query through a fresh scenario
    let (fresh, _) = common::scenario("cleanup_check", &server).await;
    for name in &names {
        let found = fresh
            .session()
            .find_items(&contacts, &ItemKey::file_as(name.as_str()))
            .await
            .unwrap();
        assert!(found.is_empty(), "{} survived teardown", name);
    }
    assert!(fresh.session().folder_map(&u1()).await.unwrap().by_name(&folder_name).is_none());
    fresh.release().await;
}

#[tokio::test]
async fn scenario_residue_is_reported_not_raised() {
    let server = server();
    let (scenario, recorder) = scenario("residue", &server).await;
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    seed(&server, "user1", FolderType::Inbox, "stuck");
    scenario.track(&u1(), &inbox, [ItemKey::subject("stuck")]).await;
    scenario.track(&u1(), &inbox, [ItemKey::subject("already gone")]).await;

    // Every exchange from here on fails
    recorder.fail_after(0);
    let report = scenario.release().await;
    assert!(!report.is_clean());
    assert_eq!(report.artifact_count(), 2);
    assert_eq!(report.residue().len(), 2);
    assert_eq!(server.items("user1", FolderType::Inbox).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_restorations_run_newest_first() {
    let server = server();
    server.set_oof_delay(Duration::from_millis(15));
    let (scenario, _) = scenario("restorations", &server).await;

    scenario
        .set_oof(
            &u2(),
            conformance_harness::OofSettings {
                mode: conformance_harness::OofMode::Global,
                reply_message: Some("on leave".into()),
            },
        )
        .await
        .unwrap();
    scenario
        .set_folder_permission(&u1(), "Inbox", &u2(), conformance_harness::FolderPermission::Reviewer)
        .await
        .unwrap();
    scenario.override_device("SECONDDEVICE", "Tablet").await.unwrap();

    let report = scenario.release().await;
    assert!(report.is_clean(), "{:?}", report.residue());
    let kinds: Vec<&str> = report.restorations.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec!["client_context", "folder_permission", "oof"]);
    assert!(!server.oof("user2").unwrap().is_enabled());
    assert_eq!(server.client_context().unwrap().device_id, "HARNESSDEVICE01");
}

#[tokio::test]
async fn scenario_rejects_bad_credentials() {
    let server = server();
    let mut config = HarnessConfig::for_testing();
    config.users[0].password = "wrong".into();
    let result = Scenario::acquire("bad_password", config, server.clone(), server.clone()).await;
    match result {
        Err(HarnessError::Handshake { owner, message }) => {
            assert_eq!(owner, u1());
            assert!(message.contains("401"), "{message}");
        }
        Err(other) => panic!("expected Handshake, got {other:?}"),
        Ok(_) => panic!("expected Handshake, got a scenario"),
    }
}

// =============================================================================
// Protocol Tests
// =============================================================================

#[tokio::test]
async fn protocol_expected_failure_status_is_returned_untouched() {
    let server = server();
    let (scenario, _) = scenario("expected_failure", &server).await;
    let session = scenario.session();

    let response = session
        .execute(Request::new(
            Command::SendMail,
            None,
            RequestBody::SendMail(MailMessage {
                to: Vec::new(),
                subject: "nobody".into(),
                body: String::new(),
                save_in_sent: false,
            }),
        ))
        .await
        .unwrap();
    assert!(!response.status.is_success());
    assert!(matches!(
        response.ensure_success(&u1()),
        Err(HarnessError::Status {
            command: Command::SendMail,
            ..
        })
    ));

    scenario.release().await;
}

#[tokio::test]
async fn protocol_multipart_fetch_exposes_parts() {
    let server = server();
    let (scenario, _) = scenario("multipart", &server).await;
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
    let mut item = fields("Subject", "attached");
    item.insert("Body".into(), "part one body".into());
    let server_id = server.seed_item("user1", FolderType::Inbox, item).unwrap();

    let response = scenario
        .session()
        .execute(Request::new(
            Command::ItemOperations,
            Some(inbox),
            RequestBody::ItemOperations {
                server_ids: vec![server_id],
                multipart: true,
            },
        ))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Success);

    let raw = scenario.session().last_raw_response().unwrap();
    assert!(raw.is_multipart());
    assert_eq!(raw.header("content-type"), Some("application/vnd.ms-sync.multipart"));
    assert_eq!(raw.part(0), Some(&b"Status=1"[..]));
    assert_eq!(raw.part(1), Some(&b"part one body"[..]));
    assert_eq!(raw.part(2), None);

    scenario.release().await;
}

#[tokio::test]
async fn protocol_item_estimate_counts_visible_items() {
    let server = server();
    let (scenario, _) = scenario("estimate", &server).await;
    let session = scenario.session();
    let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();

    // Estimate requires a primed collection
    assert!(matches!(
        session.item_estimate(&inbox).await,
        Err(HarnessError::CursorState { .. })
    ));
    session.prime(&inbox).await.unwrap();
    seed(&server, "user1", FolderType::Inbox, "one");
    seed(&server, "user1", FolderType::Inbox, "two");
    assert_eq!(session.item_estimate(&inbox).await.unwrap(), 2);

    scenario.release().await;
}
