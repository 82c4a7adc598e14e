// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Artifact tracker.
//!
//! Every item or folder a scenario creates on the server under test is
//! registered here, keyed by owner and collection. At teardown
//! [`ArtifactTracker::reconcile()`] removes them again.
//!
//! Items are registered by [`ItemKey`], not by server id. Server ids change
//! when an item is moved or a collection is resynced, so the id is resolved by
//! a fresh query at teardown.
//!
//! # Artifact States
//!
//! ```text
//! Registered ──resolve──► Resolved ──delete──► Deleted
//!     │                       │
//!     ├──no match──► Absent   └──delete fails──► DeletionFailed
//!     │
//!     └──query fails──► ResolutionFailed
//! ```
//!
//! Reconciliation is best-effort and exhaustive: every artifact is attempted,
//! each failure is logged on its own and recorded in the [`ReconcileReport`],
//! and nothing is raised mid-loop. Items go before folders.

use crate::error::BoxFuture;
use crate::protocol::{CollectionId, ItemKey, Owner};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What teardown needs from the protocol side.
///
/// Implemented by [`ProtocolSession`](crate::session::ProtocolSession);
/// tests substitute their own.
pub trait Janitor: Send + Sync {
    /// Server ids of the items in `collection` matching `key`, by a fresh query.
    fn resolve(&self, owner: Owner, collection: CollectionId, key: ItemKey) -> BoxFuture<'_, Vec<String>>;

    /// Permanently delete items (no move to Deleted Items).
    fn delete_items(
        &self,
        owner: Owner,
        collection: CollectionId,
        server_ids: Vec<String>,
    ) -> BoxFuture<'_, ()>;

    fn delete_folder(&self, owner: Owner, folder: CollectionId) -> BoxFuture<'_, ()>;
}

/// A tracked thing to clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Item { collection: CollectionId, key: ItemKey },
    Folder { id: CollectionId },
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Item { collection, key } => write!(f, "{} in {}", key, collection),
            Artifact::Folder { id } => write!(f, "folder {}", id),
        }
    }
}

/// Terminal reconciliation state of one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Deleted,
    /// The query found nothing; there is nothing to clean.
    Absent,
    ResolutionFailed,
    DeletionFailed,
}

impl ArtifactState {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactState::Deleted => "deleted",
            ArtifactState::Absent => "absent",
            ArtifactState::ResolutionFailed => "resolution_failed",
            ArtifactState::DeletionFailed => "deletion_failed",
        }
    }

    /// Whether the server may still hold the artifact.
    pub fn is_residue(self) -> bool {
        matches!(self, ArtifactState::ResolutionFailed | ArtifactState::DeletionFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutcome {
    pub artifact: Artifact,
    pub state: ArtifactState,
    /// Error text for failed states.
    pub detail: Option<String>,
}

/// Result of reconciling one owner's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub owner: Owner,
    pub outcomes: Vec<ArtifactOutcome>,
}

impl ReconcileReport {
    fn new(owner: Owner) -> Self {
        Self {
            owner,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, artifact: Artifact, state: ArtifactState, detail: Option<String>) {
        crate::metrics::record_artifact_outcome(state.as_str());
        self.outcomes.push(ArtifactOutcome {
            artifact,
            state,
            detail,
        });
    }

    pub fn count(&self, state: ArtifactState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| o.state.is_residue())
    }

    /// No artifact may remain on the server.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[derive(Debug, Default)]
struct OwnerArtifacts {
    /// Collections in first-registration order, keys in registration order.
    items: Vec<(CollectionId, Vec<ItemKey>)>,
    folders: Vec<CollectionId>,
}

impl OwnerArtifacts {
    fn len(&self) -> usize {
        self.items.iter().map(|(_, keys)| keys.len()).sum::<usize>() + self.folders.len()
    }
}

fn publish_total(owners: &HashMap<Owner, OwnerArtifacts>) {
    let total: usize = owners.values().map(OwnerArtifacts::len).sum();
    crate::metrics::set_tracked_artifacts(total);
}

/// Registry of artifacts created during a scenario.
///
/// Registration may happen from concurrent tasks. Reconciliation drains the
/// owner's entries, so a second reconcile of the same owner does nothing.
#[derive(Debug, Default)]
pub struct ArtifactTracker {
    owners: RwLock<HashMap<Owner, OwnerArtifacts>>,
}

impl ArtifactTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register items. Registering a key twice is a no-op.
    pub async fn track(&self, owner: &Owner, collection: &CollectionId, keys: impl IntoIterator<Item = ItemKey>) {
        let mut owners = self.owners.write().await;
        let entry = owners.entry(owner.clone()).or_default();
        let idx = match entry.items.iter().position(|(c, _)| c == collection) {
            Some(idx) => idx,
            None => {
                entry.items.push((collection.clone(), Vec::new()));
                entry.items.len() - 1
            }
        };
        let tracked = &mut entry.items[idx].1;
        for key in keys {
            if !tracked.contains(&key) {
                debug!(owner = %owner, collection = %collection, key = %key, "Tracking item");
                tracked.push(key);
            }
        }
        publish_total(&owners);
    }

    /// Stop tracking items the scenario already removed itself.
    pub async fn untrack(&self, owner: &Owner, collection: &CollectionId, keys: impl IntoIterator<Item = ItemKey>) {
        let mut owners = self.owners.write().await;
        let Some(entry) = owners.get_mut(owner) else {
            return;
        };
        if let Some((_, tracked)) = entry.items.iter_mut().find(|(c, _)| c == collection) {
            for key in keys {
                tracked.retain(|k| k != &key);
            }
        }
        entry.items.retain(|(_, keys)| !keys.is_empty());
        publish_total(&owners);
    }

    pub async fn track_folder(&self, owner: &Owner, folder: &CollectionId) {
        let mut owners = self.owners.write().await;
        let entry = owners.entry(owner.clone()).or_default();
        if !entry.folders.contains(folder) {
            debug!(owner = %owner, folder = %folder, "Tracking folder");
            entry.folders.push(folder.clone());
        }
        publish_total(&owners);
    }

    pub async fn untrack_folder(&self, owner: &Owner, folder: &CollectionId) {
        let mut owners = self.owners.write().await;
        if let Some(entry) = owners.get_mut(owner) {
            entry.folders.retain(|f| f != folder);
        }
        publish_total(&owners);
    }

    /// Owners with at least one tracked artifact, sorted.
    pub async fn owners(&self) -> Vec<Owner> {
        let owners = self.owners.read().await;
        let mut list: Vec<Owner> = owners
            .iter()
            .filter(|(_, a)| a.len() > 0)
            .map(|(o, _)| o.clone())
            .collect();
        list.sort();
        list
    }

    /// Tracked artifacts of `owner`, items first, in registration order.
    pub async fn artifacts(&self, owner: &Owner) -> Vec<Artifact> {
        let owners = self.owners.read().await;
        let Some(entry) = owners.get(owner) else {
            return Vec::new();
        };
        entry
            .items
            .iter()
            .flat_map(|(collection, keys)| {
                keys.iter().map(move |key| Artifact::Item {
                    collection: collection.clone(),
                    key: key.clone(),
                })
            })
            .chain(entry.folders.iter().map(|id| Artifact::Folder { id: id.clone() }))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.values().map(OwnerArtifacts::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Non-blocking count; `None` while a writer holds the registry.
    pub fn try_len(&self) -> Option<usize> {
        self.owners
            .try_read()
            .ok()
            .map(|owners| owners.values().map(OwnerArtifacts::len).sum())
    }

    /// Remove every artifact tracked for `owner`.
    ///
    /// The janitor must already be acting as `owner`.
    pub async fn reconcile<J: Janitor + ?Sized>(&self, owner: &Owner, janitor: &J) -> ReconcileReport {
        let artifacts = self.owners.write().await.remove(owner).unwrap_or_default();
        let mut report = ReconcileReport::new(owner.clone());

        if artifacts.len() == 0 {
            return report;
        }
        info!(owner = %owner, count = artifacts.len(), "Reconciling artifacts");

        for (collection, keys) in artifacts.items {
            for key in keys {
                let artifact = Artifact::Item {
                    collection: collection.clone(),
                    key: key.clone(),
                };

                let server_ids = match janitor.resolve(owner.clone(), collection.clone(), key.clone()).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!(owner = %owner, artifact = %artifact, error = %e, "Failed to resolve artifact");
                        report.record(artifact, ArtifactState::ResolutionFailed, Some(e.to_string()));
                        continue;
                    }
                };

                if server_ids.is_empty() {
                    debug!(owner = %owner, artifact = %artifact, "Artifact already gone");
                    report.record(artifact, ArtifactState::Absent, None);
                    continue;
                }

                match janitor.delete_items(owner.clone(), collection.clone(), server_ids).await {
                    Ok(()) => {
                        debug!(owner = %owner, artifact = %artifact, "Artifact deleted");
                        report.record(artifact, ArtifactState::Deleted, None);
                    }
                    Err(e) => {
                        warn!(owner = %owner, artifact = %artifact, error = %e, "Failed to delete artifact");
                        report.record(artifact, ArtifactState::DeletionFailed, Some(e.to_string()));
                    }
                }
            }
        }

        for folder in artifacts.folders {
            let artifact = Artifact::Folder { id: folder.clone() };
            match janitor.delete_folder(owner.clone(), folder).await {
                Ok(()) => report.record(artifact, ArtifactState::Deleted, None),
                Err(e) => {
                    warn!(owner = %owner, artifact = %artifact, error = %e, "Failed to delete folder");
                    report.record(artifact, ArtifactState::DeletionFailed, Some(e.to_string()));
                }
            }
        }

        let total = self.len().await;
        crate::metrics::set_tracked_artifacts(total);

        if report.is_clean() {
            info!(owner = %owner, deleted = report.count(ArtifactState::Deleted), "Artifacts reconciled");
        } else {
            warn!(
                owner = %owner,
                failures = report.failures().count(),
                "Artifacts reconciled with residue"
            );
        }
        report
    }
}
