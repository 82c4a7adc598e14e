//! # Conformance Harness
//!
//! A stateful client harness for exercising a cursor-based, eventually
//! consistent mailbox sync protocol (ActiveSync style) against a real server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Scenario                                     │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌───────────────┐   ┌──────────────────────────┐  │
//! │  │ ProtocolSession  │──►│ CursorStore   │   │ ArtifactTracker          │  │
//! │  │ (identity, lanes,│   │ (per owner,   │   │ (created items/folders,  │  │
//! │  │  hierarchy)      │   │  collection)  │   │  reconciled at release)  │  │
//! │  └────────┬─────────┘   └───────────────┘   └──────────────────────────┘  │
//! │           │                                                               │
//! │           ▼                                                               │
//! │  ┌──────────────────┐   ┌───────────────┐                                 │
//! │  │ ProtocolAdapter  │   │ SutControl    │   poll_until (retry-poll)       │
//! │  │ (wire exchange)  │   │ (admin ops)   │                                 │
//! │  └──────────────────┘   └───────────────┘                                 │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every exchange sends the cursor the store holds for `(owner, collection)`
//! and stores the one the server returns. Cursor-invalidating statuses reset
//! the stored cursor so the next exchange starts cold. Server-side effects
//! that propagate asynchronously (delivery, OOF, deletion) are observed with
//! [`poll_until`], bounded by a [`PollConfig`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conformance_harness::{HarnessConfig, ItemKey, MemoryAdapter, Owner, Scenario, FolderType};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> conformance_harness::Result<()> {
//!     let server = Arc::new(MemoryAdapter::new());
//!     server.add_user("user1");
//!     server.add_user("user2");
//!
//!     let scenario =
//!         Scenario::acquire("smoke", HarnessConfig::for_testing(), server.clone(), server).await?;
//!     let u1 = Owner::from("U1");
//!     let inbox = scenario.folder(&u1, FolderType::Inbox).await?;
//!     let _ = scenario.await_item(&u1, &inbox, &ItemKey::subject("hello")).await;
//!
//!     let report = scenario.release().await;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod cursor;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod poll;
pub mod protocol;
pub mod resilience;
pub mod scenario;
pub mod session;
pub mod status;
pub mod sut;
pub mod tracker;

// Re-exports for convenience
pub use adapter::{AdapterError, AdapterResult, ProtocolAdapter};
pub use config::{HarnessConfig, PollSettings, UserConfig};
pub use cursor::CursorStore;
pub use error::{HarnessError, Result};
pub use memory::{MemoryAdapter, MemoryOptions};
pub use poll::{poll_until, PollConfig, PollError, Polled};
pub use protocol::{
    ClientContext, CollectionId, Command, Credentials, Cursor, FolderType, Item, ItemKey, OofMode, OofSettings,
    Owner, Request, Response,
};
pub use resilience::{RateLimitConfig, RetryConfig};
pub use scenario::{Scenario, TeardownReport};
pub use session::{FolderMap, ProtocolSession, SessionOptions};
pub use status::{CommonStatus, CursorScope, Status};
pub use sut::{FolderPermission, NoOpSutControl, SutControl};
pub use tracker::{ArtifactState, ArtifactTracker, Janitor, ReconcileReport};
