// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scenario lifecycle.
//!
//! A [`Scenario`] is the composition root of one conformance test: it owns the
//! protocol session, the artifact tracker and the SUT control handle, and it
//! is the only place environment state gets mutated and restored.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ──► switch to primary identity (handshake)
//!    │
//!    ├── body: execute / await_item / set_oof / override_device ...
//!    │         (every created artifact and mutated setting is recorded)
//!    ▼
//! release ──► reconcile artifacts per owner
//!         ──► undo recorded mutations, newest first
//!         ──► flush and close the cursor store
//!         ──► TeardownReport
//! ```
//!
//! Release never fails. Anything it could not undo is in the report, and
//! [`TeardownReport::is_clean()`] tells the caller whether residue may remain
//! on the server.

use crate::adapter::ProtocolAdapter;
use crate::config::HarnessConfig;
use crate::cursor::CursorStore;
use crate::error::{HarnessError, Result};
use crate::poll::{poll_until, PollConfig};
use crate::protocol::{ClientContext, CollectionId, FolderType, Item, ItemKey, OofSettings, Owner};
use crate::session::{ProtocolSession, SessionOptions};
use crate::sut::{FolderPermission, SutControl};
use crate::tracker::{ArtifactTracker, ReconcileReport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// A recorded environment mutation, undone at release.
#[derive(Debug, Clone, PartialEq)]
enum Restoration {
    /// OOF was changed; revert to disabled.
    Oof { owner: Owner },
    FolderPermission {
        owner_user: String,
        folder: String,
        delegate: String,
        previous: FolderPermission,
    },
    ClientContext { previous: ClientContext },
}

impl Restoration {
    fn kind(&self) -> &'static str {
        match self {
            Restoration::Oof { .. } => "oof",
            Restoration::FolderPermission { .. } => "folder_permission",
            Restoration::ClientContext { .. } => "client_context",
        }
    }

    fn target(&self) -> String {
        match self {
            Restoration::Oof { owner } => owner.to_string(),
            Restoration::FolderPermission {
                owner_user,
                folder,
                delegate,
                ..
            } => format!("{}/{} for {}", owner_user, folder, delegate),
            Restoration::ClientContext { previous } => previous.device_id.clone(),
        }
    }
}

/// Result of undoing one environment mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorationOutcome {
    pub kind: &'static str,
    pub target: String,
    pub error: Option<String>,
}

impl RestorationOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything release did, and what it could not do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub scenario: String,
    pub reconciled: Vec<ReconcileReport>,
    pub restorations: Vec<RestorationOutcome>,
    /// Failure persisting the cursor ledger.
    pub cursor_error: Option<String>,
}

impl TeardownReport {
    /// Nothing the scenario created or changed is known to remain.
    pub fn is_clean(&self) -> bool {
        self.reconciled.iter().all(ReconcileReport::is_clean)
            && self.restorations.iter().all(RestorationOutcome::is_ok)
            && self.cursor_error.is_none()
    }

    pub fn artifact_count(&self) -> usize {
        self.reconciled.iter().map(|r| r.outcomes.len()).sum()
    }

    /// One line per residue, for logs and assertion messages.
    pub fn residue(&self) -> Vec<String> {
        let artifacts = self.reconciled.iter().flat_map(|report| {
            report.failures().map(move |outcome| {
                format!(
                    "{}: {} {}{}",
                    report.owner,
                    outcome.artifact,
                    outcome.state.as_str(),
                    outcome.detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
                )
            })
        });
        let restorations = self
            .restorations
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{} {}: {}", r.kind, r.target, e)));
        artifacts
            .chain(restorations)
            .chain(self.cursor_error.iter().map(|e| format!("cursor ledger: {}", e)))
            .collect()
    }
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One conformance test's view of the server under test.
pub struct Scenario<A: ProtocolAdapter, S: SutControl> {
    name: String,
    config: HarnessConfig,
    session: ProtocolSession<A>,
    tracker: ArtifactTracker,
    sut: S,
    poll: PollConfig,
    restorations: Mutex<Vec<Restoration>>,
    cancel: watch::Sender<bool>,
    run_id: String,
    names: AtomicU64,
    released: AtomicBool,
}

impl<A: ProtocolAdapter, S: SutControl> Scenario<A, S> {
    /// Build the session and tracker for `name` and switch to the primary
    /// identity.
    pub async fn acquire(name: impl Into<String>, config: HarnessConfig, adapter: A, sut: S) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let cursors = match &config.cursor.sqlite_path {
            Some(path) => CursorStore::open(path).await?,
            None => CursorStore::in_memory(),
        };
        let session = ProtocolSession::new(
            adapter,
            Arc::new(cursors),
            config.identities(),
            SessionOptions {
                retry: config.transport.retry_config(),
                rate_limit: config.rate_limit.rate_limit_config(),
            },
        );
        session.set_client_context(config.device.client_context()).await?;

        let primary = config.primary()?;
        session.switch_identity(&primary).await?;

        let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let run_id = format!("{}{}", chrono::Utc::now().format("%H%M%S%3f"), run);
        let (cancel, _) = watch::channel(false);

        info!(scenario = %name, primary = %primary, users = config.users.len(), "Scenario acquired");

        Ok(Self {
            name,
            poll: config.poll.poll_config(),
            config,
            session,
            tracker: ArtifactTracker::new(),
            sut,
            restorations: Mutex::new(Vec::new()),
            cancel,
            run_id,
            names: AtomicU64::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn session(&self) -> &ProtocolSession<A> {
        &self.session
    }

    pub fn tracker(&self) -> &ArtifactTracker {
        &self.tracker
    }

    pub fn sut(&self) -> &S {
        &self.sut
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    /// Abort any poll in progress (and all later ones).
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// A name no other scenario run uses, for subjects and folder names.
    pub fn unique_name(&self, prefix: &str) -> String {
        let n = self.names.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{}", prefix, self.run_id, n)
    }

    fn user_name(&self, owner: &Owner) -> Result<String> {
        self.config
            .user(owner)
            .map(|u| u.user_name.clone())
            .ok_or_else(|| HarnessError::UnknownIdentity(owner.clone()))
    }

    pub async fn switch_identity(&self, owner: &Owner) -> Result<()> {
        self.session.switch_identity(owner).await
    }

    /// Id of `owner`'s default folder of `folder_type`.
    ///
    /// Discovers the hierarchy of `owner` on first use. The acting identity
    /// is left as it was.
    pub async fn folder(&self, owner: &Owner, folder_type: FolderType) -> Result<CollectionId> {
        self.session.discover(owner).await?;
        self.session.folder_id(owner, folder_type).await
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    /// Register items for deletion at release.
    pub async fn track(&self, owner: &Owner, collection: &CollectionId, keys: impl IntoIterator<Item = ItemKey>) {
        self.tracker.track(owner, collection, keys).await;
    }

    /// Stop tracking items the scenario deleted itself.
    pub async fn untrack(&self, owner: &Owner, collection: &CollectionId, keys: impl IntoIterator<Item = ItemKey>) {
        self.tracker.untrack(owner, collection, keys).await;
    }

    /// Create a folder as the current identity and track it.
    pub async fn create_folder(
        &self,
        parent_id: &CollectionId,
        display_name: &str,
        folder_type: FolderType,
    ) -> Result<CollectionId> {
        let owner = self.session.current_owner().await?;
        let folder = self.session.create_folder(parent_id, display_name, folder_type).await?;
        self.tracker.track_folder(&owner, &folder).await;
        Ok(folder)
    }

    /// Wait until an item with `key` shows up in `owner`'s `collection`.
    ///
    /// The item is registered for teardown as soon as it is seen, before
    /// anything else can fail.
    pub async fn await_item(&self, owner: &Owner, collection: &CollectionId, key: &ItemKey) -> Result<Item> {
        self.session.switch_identity(owner).await?;
        debug!(owner = %owner, collection = %collection, key = %key, "Awaiting item");

        let polled = poll_until(
            self.poll,
            Some(self.cancel.subscribe()),
            || self.session.find_items(collection, key),
            |items: &Vec<Item>| !items.is_empty(),
        )
        .await
        .map_err(|e| {
            e.into_harness(format!("{} in {} of {}", key, collection, owner), |items| {
                format!("{} matching items", items.len())
            })
        })?;

        self.tracker.track(owner, collection, [key.clone()]).await;
        let mut items = polled.value;
        if items.len() > 1 {
            warn!(owner = %owner, key = %key, count = items.len(), "More than one item matches key");
        }
        info!(owner = %owner, key = %key, attempts = polled.attempts, "Item arrived");
        Ok(items.swap_remove(0))
    }

    /// Wait until no item with `key` remains in `owner`'s `collection`.
    pub async fn await_absent(&self, owner: &Owner, collection: &CollectionId, key: &ItemKey) -> Result<()> {
        self.session.switch_identity(owner).await?;
        poll_until(
            self.poll,
            Some(self.cancel.subscribe()),
            || self.session.find_items(collection, key),
            |items: &Vec<Item>| items.is_empty(),
        )
        .await
        .map_err(|e| {
            e.into_harness(format!("{} gone from {} of {}", key, collection, owner), |items| {
                format!("{} matching items", items.len())
            })
        })?;
        Ok(())
    }

    // =========================================================================
    // Environment mutations
    // =========================================================================

    async fn record(&self, restoration: Restoration) {
        let mut restorations = self.restorations.lock().await;
        let duplicate = restorations.iter().any(|existing| match (existing, &restoration) {
            (Restoration::Oof { owner: a }, Restoration::Oof { owner: b }) => a == b,
            (
                Restoration::FolderPermission {
                    owner_user: a_owner,
                    folder: a_folder,
                    delegate: a_delegate,
                    ..
                },
                Restoration::FolderPermission {
                    owner_user,
                    folder,
                    delegate,
                    ..
                },
            ) => a_owner == owner_user && a_folder == folder && a_delegate == delegate,
            // The earliest context is the one to restore
            (Restoration::ClientContext { .. }, Restoration::ClientContext { .. }) => true,
            _ => false,
        });
        if !duplicate {
            debug!(kind = restoration.kind(), target = %restoration.target(), "Recorded restoration");
            restorations.push(restoration);
        }
    }

    /// Note that `owner`'s OOF state was changed; release turns it off.
    pub async fn record_oof_change(&self, owner: &Owner) {
        self.record(Restoration::Oof { owner: owner.clone() }).await;
    }

    /// Set OOF as `owner` and record the change.
    pub async fn set_oof(&self, owner: &Owner, settings: OofSettings) -> Result<()> {
        self.session.switch_identity(owner).await?;
        self.record_oof_change(owner).await;
        self.session.set_oof(settings).await
    }

    async fn replace_context(&self, update: impl FnOnce(&mut ClientContext)) -> Result<()> {
        let mut context = self
            .session
            .client_context()
            .await
            .unwrap_or_else(|| self.config.device.client_context());
        update(&mut context);
        let previous = self
            .session
            .set_client_context(context)
            .await?
            .unwrap_or_else(|| self.config.device.client_context());
        self.record(Restoration::ClientContext { previous }).await;
        Ok(())
    }

    /// Send a different device id and type until release.
    pub async fn override_device(&self, device_id: &str, device_type: &str) -> Result<()> {
        info!(device_id, device_type, "Overriding device");
        self.replace_context(|context| {
            context.device_id = device_id.to_string();
            context.device_type = device_type.to_string();
        })
        .await
    }

    /// Send a different policy key until release.
    pub async fn override_policy_key(&self, policy_key: Option<String>) -> Result<()> {
        self.replace_context(|context| context.policy_key = policy_key).await
    }

    /// Grant `delegate` `permission` on `owner`'s `folder`, restored at release.
    pub async fn set_folder_permission(
        &self,
        owner: &Owner,
        folder: &str,
        delegate: &Owner,
        permission: FolderPermission,
    ) -> Result<()> {
        let owner_user = self.user_name(owner)?;
        let delegate_user = self.user_name(delegate)?;
        let previous = self
            .sut
            .mailbox_folder_permission(&owner_user, folder, &delegate_user)
            .await?;
        self.sut
            .set_mailbox_folder_permission(&owner_user, folder, &delegate_user, permission.clone())
            .await?;
        info!(
            owner = %owner,
            folder,
            delegate = %delegate,
            permission = permission.as_str(),
            previous = previous.as_str(),
            "Folder permission set"
        );
        self.record(Restoration::FolderPermission {
            owner_user,
            folder: folder.to_string(),
            delegate: delegate_user,
            previous,
        })
        .await;
        Ok(())
    }

    /// Remove the device partnership for `owner`. Setup only.
    ///
    /// The server forgets every sync relationship, so `owner`'s cursors are
    /// dropped too.
    pub async fn clear_device(&self, owner: &Owner) -> Result<()> {
        let user_name = self.user_name(owner)?;
        let device_id = self
            .session
            .client_context()
            .await
            .map(|c| c.device_id)
            .unwrap_or_else(|| self.config.device.device_id.clone());
        self.sut.delete_device(&user_name, &device_id).await?;
        let cleared = self.session.cursors().clear_owner(owner).await;
        info!(owner = %owner, device_id = %device_id, cursors = cleared, "Device cleared");
        Ok(())
    }

    // =========================================================================
    // Release
    // =========================================================================

    async fn restore(&self, restoration: &Restoration) -> Result<()> {
        match restoration {
            Restoration::Oof { owner } => {
                self.session.switch_identity(owner).await?;
                self.session.set_oof(OofSettings::disabled()).await?;
                poll_until(
                    self.poll,
                    None,
                    || self.session.get_oof(),
                    |settings: &OofSettings| !settings.is_enabled(),
                )
                .await
                .map_err(|e| e.into_harness(format!("OOF disabled for {}", owner), |s| format!("{:?}", s.mode)))?;
                Ok(())
            }
            Restoration::FolderPermission {
                owner_user,
                folder,
                delegate,
                previous,
            } => {
                self.sut
                    .set_mailbox_folder_permission(owner_user, folder, delegate, previous.clone())
                    .await
            }
            Restoration::ClientContext { previous } => {
                self.session.set_client_context(previous.clone()).await?;
                Ok(())
            }
        }
    }

    /// Tear the scenario down.
    ///
    /// Every tracked artifact is reconciled, every recorded mutation undone
    /// (newest first), and the cursor store flushed and closed. Failures are
    /// collected in the report rather than returned.
    pub async fn release(self) -> TeardownReport {
        let started = Instant::now();
        self.released.store(true, Ordering::SeqCst);
        info!(scenario = %self.name, "Releasing scenario");

        let mut reconciled = Vec::new();
        for owner in self.tracker.owners().await {
            reconciled.push(self.tracker.reconcile(&owner, &self.session).await);
        }

        let pending: Vec<Restoration> = std::mem::take(&mut *self.restorations.lock().await);
        let mut restorations = Vec::with_capacity(pending.len());
        for restoration in pending.iter().rev() {
            let result = self.restore(restoration).await;
            crate::metrics::record_restoration(restoration.kind(), result.is_ok());
            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        scenario = %self.name,
                        kind = restoration.kind(),
                        target = %restoration.target(),
                        error = %e,
                        "Failed to restore environment"
                    );
                    Some(e.to_string())
                }
            };
            restorations.push(RestorationOutcome {
                kind: restoration.kind(),
                target: restoration.target(),
                error,
            });
        }

        let cursors = self.session.cursors();
        let cursor_error = match cursors.flush_dirty().await {
            Ok(_) => None,
            Err(e) => {
                warn!(scenario = %self.name, error = %e, "Failed to flush cursor ledger");
                Some(e.to_string())
            }
        };
        cursors.close().await;

        let report = TeardownReport {
            scenario: self.name.clone(),
            reconciled,
            restorations,
            cursor_error,
        };
        let clean = report.is_clean();
        crate::metrics::record_teardown(&self.name, clean, started.elapsed());
        if clean {
            info!(scenario = %self.name, artifacts = report.artifact_count(), "Scenario released");
        } else {
            warn!(scenario = %self.name, residue = ?report.residue(), "Scenario released with residue");
        }
        report
    }
}

impl<A: ProtocolAdapter, S: SutControl> Drop for Scenario<A, S> {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let remaining = self.tracker.try_len().unwrap_or(0);
        warn!(
            scenario = %self.name,
            remaining,
            "Scenario dropped without release; server state was not cleaned up"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;
    use crate::protocol::{KeyField, MailMessage, OofMode, SyncCommand};
    use crate::tracker::ArtifactState;
    use std::collections::BTreeMap;
    use std::time::Duration;

    type TestScenario = Scenario<Arc<MemoryAdapter>, Arc<MemoryAdapter>>;

    async fn acquire() -> (TestScenario, Arc<MemoryAdapter>) {
        let server = Arc::new(MemoryAdapter::new());
        server.add_user("user1");
        server.add_user("user2");
        let scenario = Scenario::acquire("unit", HarnessConfig::for_testing(), server.clone(), server.clone())
            .await
            .unwrap();
        (scenario, server)
    }

    fn u1() -> Owner {
        Owner::from("U1")
    }

    fn u2() -> Owner {
        Owner::from("U2")
    }

    #[tokio::test]
    async fn test_acquire_switches_to_primary() {
        let (scenario, server) = acquire().await;
        assert_eq!(scenario.session().current_owner().await.unwrap(), u1());
        assert_eq!(server.client_context().unwrap().device_id, "HARNESSDEVICE01");
        let report = scenario.release().await;
        assert!(report.is_clean());
        assert_eq!(report.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_rejects_invalid_config() {
        let server = Arc::new(MemoryAdapter::new());
        let result =
            Scenario::acquire("bad", HarnessConfig::default(), server.clone(), server.clone()).await;
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[tokio::test]
    async fn test_acquire_fails_handshake_for_missing_mailbox() {
        let server = Arc::new(MemoryAdapter::new());
        let result =
            Scenario::acquire("nomailbox", HarnessConfig::for_testing(), server.clone(), server.clone()).await;
        assert!(matches!(result, Err(HarnessError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_unique_names_differ() {
        let (scenario, _) = acquire().await;
        let a = scenario.unique_name("subject");
        let b = scenario.unique_name("subject");
        assert_ne!(a, b);
        assert!(a.starts_with("subject_"));
        scenario.release().await;
    }

    #[tokio::test]
    async fn test_await_item_tracks_and_release_deletes() {
        let (scenario, server) = acquire().await;
        let subject = scenario.unique_name("S");

        scenario.switch_identity(&u2()).await.unwrap();
        scenario
            .session()
            .send_mail(MailMessage {
                to: vec!["user1".into()],
                subject: subject.clone(),
                body: "body".into(),
                save_in_sent: false,
            })
            .await
            .unwrap();

        let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
        let key = ItemKey::subject(subject.as_str());
        let item = scenario.await_item(&u1(), &inbox, &key).await.unwrap();
        assert_eq!(item.field("Subject"), Some(subject.as_str()));
        assert_eq!(scenario.tracker().len().await, 1);

        let report = scenario.release().await;
        assert!(report.is_clean(), "{:?}", report.residue());
        assert_eq!(report.reconciled[0].count(ArtifactState::Deleted), 1);
        assert!(server.items("user1", FolderType::Inbox).is_empty());
    }

    #[tokio::test]
    async fn test_await_item_exhausts() {
        let (scenario, _) = acquire().await;
        let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
        let err = scenario
            .await_item(&u1(), &inbox, &ItemKey::subject("never"))
            .await
            .unwrap_err();
        match err {
            HarnessError::PollExhausted { attempts, last_seen, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_seen, "0 matching items");
            }
            other => panic!("expected PollExhausted, got {other:?}"),
        }
        assert!(scenario.tracker().is_empty().await);
        scenario.release().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_await() {
        let (scenario, _) = acquire().await;
        let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
        scenario.cancel();
        let err = scenario
            .await_item(&u1(), &inbox, &ItemKey::subject("never"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
        scenario.release().await;
    }

    #[tokio::test]
    async fn test_created_folder_removed_at_release() {
        let (scenario, server) = acquire().await;
        let name = scenario.unique_name("folder");
        scenario
            .create_folder(&CollectionId::root(), &name, FolderType::UserMail)
            .await
            .unwrap();
        assert_eq!(server.user_folders("user1").len(), 1);

        let report = scenario.release().await;
        assert!(report.is_clean());
        assert!(server.user_folders("user1").is_empty());
    }

    #[tokio::test]
    async fn test_folder_lookup_keeps_acting_identity() {
        let (scenario, server) = acquire().await;
        let u1_inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();

        // First lookup runs the handshake for U2, the second hits the cache
        for _ in 0..2 {
            scenario.folder(&u2(), FolderType::Inbox).await.unwrap();
            assert_eq!(scenario.session().current_owner().await.unwrap(), u1());
        }

        let mut fields = BTreeMap::new();
        fields.insert(KeyField::Subject.name().to_string(), "for U1".to_string());
        server.seed_item("user1", FolderType::Inbox, fields);
        let items = scenario.session().snapshot(&u1_inbox).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(scenario.session().folder_map(&u2()).await.is_some());

        scenario.release().await;
    }

    #[tokio::test]
    async fn test_items_of_other_identities_reconciled() {
        let (scenario, server) = acquire().await;
        let contacts = scenario.folder(&u2(), FolderType::Contacts).await.unwrap();
        scenario.switch_identity(&u2()).await.unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(KeyField::FileAs.name().to_string(), "contactA".to_string());
        scenario
            .session()
            .sync_commands(
                &contacts,
                vec![SyncCommand::Add {
                    client_id: "c1".into(),
                    fields,
                }],
                true,
            )
            .await
            .unwrap();
        scenario.track(&u2(), &contacts, [ItemKey::file_as("contactA")]).await;

        // Back to the primary identity before teardown
        scenario.switch_identity(&u1()).await.unwrap();
        let report = scenario.release().await;
        assert!(report.is_clean());
        assert_eq!(report.reconciled[0].owner, u2());
        assert!(server.items("user2", FolderType::Contacts).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oof_restored_at_release() {
        let (scenario, server) = acquire().await;
        server.set_oof_delay(Duration::from_millis(25));

        scenario
            .set_oof(
                &u1(),
                OofSettings {
                    mode: OofMode::Global,
                    reply_message: Some("away".into()),
                },
            )
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(server.oof("user1").unwrap().is_enabled());

        let report = scenario.release().await;
        assert!(report.is_clean(), "{:?}", report.residue());
        assert_eq!(report.restorations.len(), 1);
        assert_eq!(report.restorations[0].kind, "oof");
        assert!(!server.oof("user1").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_permission_and_device_restored() {
        let (scenario, server) = acquire().await;
        scenario
            .set_folder_permission(&u1(), "Calendar", &u2(), FolderPermission::Editor)
            .await
            .unwrap();
        scenario
            .set_folder_permission(&u1(), "Calendar", &u2(), FolderPermission::Reviewer)
            .await
            .unwrap();
        scenario.override_device("OTHERDEVICE", "Phone").await.unwrap();
        scenario.override_policy_key(Some("1234".into())).await.unwrap();
        assert_eq!(server.client_context().unwrap().policy_key.as_deref(), Some("1234"));

        let report = scenario.release().await;
        assert!(report.is_clean());
        // Duplicate mutations collapse into one restoration each
        assert_eq!(report.restorations.len(), 2);
        assert_eq!(
            server.mailbox_folder_permission("user1", "Calendar", "user2").await.unwrap(),
            FolderPermission::None
        );
        let restored = server.client_context().unwrap();
        assert_eq!(restored.device_id, "HARNESSDEVICE01");
        assert_eq!(restored.policy_key, None);
    }

    #[tokio::test]
    async fn test_clear_device_drops_cursors() {
        let (scenario, server) = acquire().await;
        let inbox = scenario.folder(&u1(), FolderType::Inbox).await.unwrap();
        scenario.session().prime(&inbox).await.unwrap();

        scenario.clear_device(&u1()).await.unwrap();
        assert!(scenario.session().cursors().owner_cursors(&u1()).await.is_empty());
        assert_eq!(server.deleted_devices().len(), 1);

        // Cold start works again after the wipe
        assert!(scenario.session().snapshot(&inbox).await.unwrap().is_empty());
        scenario.release().await;
    }

    #[tokio::test]
    async fn test_report_residue_lines() {
        let report = TeardownReport {
            scenario: "s".into(),
            reconciled: Vec::new(),
            restorations: vec![RestorationOutcome {
                kind: "oof",
                target: "U1".into(),
                error: Some("timed out".into()),
            }],
            cursor_error: None,
        };
        assert!(!report.is_clean());
        assert_eq!(report.residue(), vec!["oof U1: timed out".to_string()]);
    }
}
