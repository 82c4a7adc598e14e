//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording `ProtocolAdapter` wrapping the in-memory server
//! - Scenario and item helpers

pub mod recording;

pub use recording::*;

use conformance_harness::{FolderType, HarnessConfig, MemoryAdapter, Owner, Scenario};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type TestScenario = Scenario<Arc<RecordingAdapter>, Arc<MemoryAdapter>>;

pub fn u1() -> Owner {
    Owner::from("U1")
}

pub fn u2() -> Owner {
    Owner::from("U2")
}

/// In-memory server with both configured users' mailboxes.
pub fn server() -> Arc<MemoryAdapter> {
    let server = Arc::new(MemoryAdapter::new());
    server.add_user("user1");
    server.add_user("user2");
    server
}

/// Acquire a scenario against `server`, recording every exchange.
pub async fn scenario(name: &str, server: &Arc<MemoryAdapter>) -> (TestScenario, Arc<RecordingAdapter>) {
    let recorder = Arc::new(RecordingAdapter::new(server.clone()));
    let scenario = Scenario::acquire(name, HarnessConfig::for_testing(), recorder.clone(), server.clone())
        .await
        .expect("scenario acquire");
    (scenario, recorder)
}

/// Single-field item payload.
pub fn fields(name: &str, value: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert(name.to_string(), value.to_string());
    fields
}

/// Put an item straight into a mailbox, bypassing the protocol.
#[allow(dead_code)]
pub fn seed(server: &MemoryAdapter, user: &str, folder: FolderType, subject: &str) -> String {
    server
        .seed_item(user, folder, fields("Subject", subject))
        .expect("seed item")
}
