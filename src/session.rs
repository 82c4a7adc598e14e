// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol session.
//!
//! Every exchange with the server under test goes through
//! [`ProtocolSession::execute()`]. The session owns the bookkeeping that
//! scenarios would otherwise repeat by hand:
//!
//! - **Cursor injection**: cursor-bearing requests get the stored cursor for
//!   (current identity, collection); the folder hierarchy has its own.
//! - **Cursor update**: a successful response's cursor replaces the stored
//!   one. A cursor-state status invalidates it. Either way the response comes
//!   back with its status untouched.
//! - **Identity switching**: the first switch to an identity performs the
//!   hierarchy handshake (FolderSync from `"0"`) and caches the well-known
//!   folder ids.
//! - **Ordering**: exchanges on the same (identity, collection) are
//!   serialized by a per-lane async mutex.
//! - **Transport retry**: timeouts and connection failures are retried with
//!   bounded exponential backoff. Protocol statuses never are.
//!
//! ```text
//!  execute(req) ──► lane lock ──► cursor lookup ──► throttle ──► adapter
//!                                                                   │
//!        ◄── Response (status untouched) ◄── cursor put/invalidate ◄┘
//! ```

use crate::adapter::{AdapterError, ProtocolAdapter};
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, HarnessError, Result};
use crate::protocol::{
    ClientContext, CollectionId, Command, Credentials, Cursor, Folder, FolderSyncResponse, FolderType, Item,
    ItemKey, MailMessage, OofSettings, Owner, RawResponse, Request, RequestBody, Response, ResponseBody,
    SettingsRequest, SyncCommand, SyncRequest, SyncResponse,
};
use crate::resilience::{RateLimitConfig, RateLimiter, RetryConfig};
use crate::status::CursorScope;
use crate::tracker::Janitor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

/// Upper bound on MoreAvailable follow-ups in one `sync_changes` call.
const MAX_MORE_AVAILABLE_ROUNDS: usize = 256;

type LaneKey = (Owner, CollectionId);

/// Folder hierarchy of one identity as discovered at handshake.
#[derive(Debug, Clone, Default)]
pub struct FolderMap {
    folders: Vec<Folder>,
}

impl FolderMap {
    pub fn from_response(response: &FolderSyncResponse) -> Self {
        Self {
            folders: response.adds.clone(),
        }
    }

    /// Id of the default folder of `folder_type`.
    pub fn well_known(&self, folder_type: FolderType) -> Option<&CollectionId> {
        self.folders
            .iter()
            .find(|f| f.folder_type == folder_type && folder_type.is_well_known())
            .map(|f| &f.server_id)
    }

    pub fn by_name(&self, display_name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.display_name == display_name)
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    fn insert(&mut self, folder: Folder) {
        self.folders.retain(|f| f.server_id != folder.server_id);
        self.folders.push(folder);
    }

    /// Remove `server_id` and every folder beneath it.
    fn remove(&mut self, server_id: &CollectionId) {
        let mut doomed = vec![server_id.clone()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            for folder in &self.folders {
                if folder.parent_id == parent && !doomed.contains(&folder.server_id) {
                    doomed.push(folder.server_id.clone());
                }
            }
            i += 1;
        }
        self.folders.retain(|f| !doomed.contains(&f.server_id));
    }

    fn apply(&mut self, changes: &FolderSyncResponse) {
        for deleted in &changes.deletes {
            self.remove(deleted);
        }
        for updated in &changes.updates {
            if let Some(existing) = self.folders.iter_mut().find(|f| f.server_id == updated.server_id) {
                *existing = updated.clone();
            }
        }
        for added in &changes.adds {
            if !self.folders.iter().any(|f| f.server_id == added.server_id) {
                self.folders.push(added.clone());
            }
        }
    }
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limit: None,
        }
    }
}

impl SessionOptions {
    pub fn testing() -> Self {
        Self {
            retry: RetryConfig::testing(),
            rate_limit: None,
        }
    }
}

/// Uniform request/response channel to the server under test.
pub struct ProtocolSession<A: ProtocolAdapter> {
    adapter: A,
    cursors: Arc<CursorStore>,
    identities: HashMap<Owner, Credentials>,
    /// Held shared for the duration of each exchange, exclusively while switching.
    current: RwLock<Option<Owner>>,
    hierarchies: RwLock<HashMap<Owner, FolderMap>>,
    lanes: Mutex<HashMap<LaneKey, Arc<AsyncMutex<()>>>>,
    context: RwLock<Option<ClientContext>>,
    retry: RetryConfig,
    limiter: Option<RateLimiter>,
}

impl<A: ProtocolAdapter> ProtocolSession<A> {
    pub fn new(
        adapter: A,
        cursors: Arc<CursorStore>,
        identities: impl IntoIterator<Item = (Owner, Credentials)>,
        options: SessionOptions,
    ) -> Self {
        Self {
            adapter,
            cursors,
            identities: identities.into_iter().collect(),
            current: RwLock::new(None),
            hierarchies: RwLock::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            context: RwLock::new(None),
            retry: options.retry,
            limiter: options.rate_limit.map(RateLimiter::new),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    pub fn credentials(&self, owner: &Owner) -> Result<&Credentials> {
        self.identities
            .get(owner)
            .ok_or_else(|| HarnessError::UnknownIdentity(owner.clone()))
    }

    /// The identity exchanges currently run as.
    pub async fn current_owner(&self) -> Result<Owner> {
        self.current.read().await.clone().ok_or_else(|| HarnessError::InvalidState {
            expected: "identity selected".to_string(),
            actual: "none".to_string(),
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Switch credentials to `owner`.
    ///
    /// The first switch to an identity runs the hierarchy handshake and caches
    /// its folder ids; later switches reuse the cache. The current identity
    /// only changes once the handshake succeeded.
    pub async fn switch_identity(&self, owner: &Owner) -> Result<()> {
        let mut current = self.current.write().await;
        let previous = current.clone();
        let switching = previous.as_ref() != Some(owner);

        if switching {
            self.switch_adapter(owner).await?;
        }

        // Handshake while still holding the identity exclusively
        if let Err(e) = self.handshake(owner).await {
            if switching {
                // Report the handshake error, not a failed restore
                let _ = self.restore_adapter(previous.as_ref(), &mut current).await;
            }
            return Err(e);
        }

        *current = Some(owner.clone());
        Ok(())
    }

    /// Run the hierarchy handshake for `owner` without changing the identity
    /// exchanges run as.
    ///
    /// No-op when the hierarchy of `owner` is already cached.
    pub async fn discover(&self, owner: &Owner) -> Result<()> {
        let mut current = self.current.write().await;
        if self.hierarchies.read().await.contains_key(owner) {
            return Ok(());
        }

        let previous = current.clone();
        if previous.as_ref() == Some(owner) {
            return self.handshake(owner).await;
        }

        self.switch_adapter(owner).await?;
        let discovered = self.handshake(owner).await;
        let restored = self.restore_adapter(previous.as_ref(), &mut current).await;
        discovered.and(restored)
    }

    async fn switch_adapter(&self, owner: &Owner) -> Result<()> {
        let credentials = self.credentials(owner)?;
        self.adapter
            .switch_identity(owner, credentials)
            .await
            .map_err(|e| HarnessError::Handshake {
                owner: owner.clone(),
                message: e.to_string(),
            })?;
        info!(owner = %owner, user = %credentials.user_name, "Switched identity");
        crate::metrics::record_identity_switch(owner.as_str());
        Ok(())
    }

    /// Put the adapter back on `previous`. If that fails no identity is
    /// selected, so the next switch re-authenticates.
    async fn restore_adapter(&self, previous: Option<&Owner>, current: &mut Option<Owner>) -> Result<()> {
        let Some(previous) = previous else {
            return Ok(());
        };
        if let Err(e) = self.switch_adapter(previous).await {
            warn!(owner = %previous, error = %e, "Could not restore identity");
            *current = None;
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&self, owner: &Owner) -> Result<()> {
        if self.hierarchies.read().await.contains_key(owner) {
            return Ok(());
        }

        let response = self
            .exchange(owner, Request::folder_sync(), Some(Cursor::zero()))
            .await
            .and_then(|r| r.ensure_success(owner));

        match response {
            Ok(response) => {
                let map = response.folder_sync().map(FolderMap::from_response).unwrap_or_default();
                info!(owner = %owner, folders = map.folders().len(), "Hierarchy handshake complete");
                crate::metrics::record_handshake(owner.as_str(), true);
                self.hierarchies.write().await.insert(owner.clone(), map);
                Ok(())
            }
            Err(e) => {
                error!(owner = %owner, error = %e, "Hierarchy handshake failed");
                crate::metrics::record_handshake(owner.as_str(), false);
                Err(HarnessError::Handshake {
                    owner: owner.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Cached hierarchy of `owner` (after its first switch).
    pub async fn folder_map(&self, owner: &Owner) -> Option<FolderMap> {
        self.hierarchies.read().await.get(owner).cloned()
    }

    /// Id of `owner`'s default folder of `folder_type`.
    pub async fn folder_id(&self, owner: &Owner, folder_type: FolderType) -> Result<CollectionId> {
        let hierarchies = self.hierarchies.read().await;
        let map = hierarchies.get(owner).ok_or_else(|| HarnessError::InvalidState {
            expected: format!("handshake done for {}", owner),
            actual: "no cached hierarchy".to_string(),
        })?;
        map.well_known(folder_type).cloned().ok_or_else(|| HarnessError::Handshake {
            owner: owner.clone(),
            message: format!("no default {:?} folder", folder_type),
        })
    }

    /// Id of the current identity's default folder of `folder_type`.
    pub async fn well_known(&self, folder_type: FolderType) -> Result<CollectionId> {
        let owner = self.current_owner().await?;
        self.folder_id(&owner, folder_type).await
    }

    /// Override device id, device type and policy key.
    ///
    /// Returns the context that was in effect before.
    pub async fn set_client_context(&self, context: ClientContext) -> Result<Option<ClientContext>> {
        self.adapter
            .set_client_context(context.clone())
            .await
            .map_err(|e| e.into_harness(Command::Provision))?;
        debug!(device_id = %context.device_id, device_type = %context.device_type, "Client context set");
        Ok(self.context.write().await.replace(context))
    }

    pub async fn client_context(&self) -> Option<ClientContext> {
        self.context.read().await.clone()
    }

    // =========================================================================
    // Exchanges
    // =========================================================================

    /// Execute `request` as the current identity with the stored cursor.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let current = self.current.read().await;
        let owner = current.clone().ok_or_else(|| HarnessError::InvalidState {
            expected: "identity selected".to_string(),
            actual: "none".to_string(),
        })?;
        let response = self.exchange(&owner, request, None).await;
        drop(current);
        response
    }

    /// Execute `request` with an explicit cursor instead of the stored one.
    ///
    /// Used to replay a stale cursor on purpose. The store is still updated
    /// from the response.
    pub async fn execute_with_cursor(&self, request: Request, cursor: Cursor) -> Result<Response> {
        let current = self.current.read().await;
        let owner = current.clone().ok_or_else(|| HarnessError::InvalidState {
            expected: "identity selected".to_string(),
            actual: "none".to_string(),
        })?;
        let response = self.exchange(&owner, request, Some(cursor)).await;
        drop(current);
        response
    }

    fn lane(&self, key: LaneKey) -> Arc<AsyncMutex<()>> {
        let mut lanes = match self.lanes.lock() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        };
        lanes.entry(key).or_default().clone()
    }

    async fn exchange(&self, owner: &Owner, request: Request, explicit: Option<Cursor>) -> Result<Response> {
        let command = request.command;
        let cursor_collection = request.cursor_collection();
        let lane_collection = cursor_collection.clone().or_else(|| request.collection.clone());

        let lane = lane_collection.map(|c| self.lane((owner.clone(), c)));
        let _guard = match &lane {
            Some(lane) => Some(lane.lock().await),
            None => None,
        };

        let cursor = match (&cursor_collection, explicit) {
            (_, Some(explicit)) => Some(explicit),
            (Some(collection), None) => Some(self.cursors.get(owner, collection).await),
            (None, None) => None,
        };

        debug!(
            owner = %owner,
            command = %command,
            collection = ?request.collection,
            cursor = ?cursor.as_ref().map(Cursor::as_str),
            "Executing"
        );

        // A zero-cursor FolderSync returns the whole hierarchy
        let resync = command == Command::FolderSync && cursor.as_ref().is_some_and(Cursor::is_zero);

        let started = Instant::now();
        let response = self.send_with_retry(request, cursor).await?;
        crate::metrics::record_exchange(command.name(), &response.status.to_string(), started.elapsed());

        if response.status.is_success() {
            if let (Some(collection), Some(next)) = (&cursor_collection, &response.cursor) {
                self.cursors.put(owner, collection, next.clone()).await;
            }
            if command == Command::FolderSync {
                if let Some(changes) = response.folder_sync() {
                    if let Some(map) = self.hierarchies.write().await.get_mut(owner) {
                        if resync {
                            *map = FolderMap::from_response(changes);
                        } else {
                            map.apply(changes);
                        }
                    }
                }
            }
        } else if let Some(scope) = response.status.cursor_scope() {
            let stale = match scope {
                CursorScope::Hierarchy => Some(CollectionId::hierarchy()),
                CursorScope::Collection => cursor_collection.clone(),
            };
            if let Some(stale) = stale {
                warn!(
                    owner = %owner,
                    command = %command,
                    collection = %stale,
                    status = %response.status,
                    "Cursor rejected by server"
                );
                self.cursors.invalidate(owner, &stale).await;
            }
        } else {
            debug!(owner = %owner, command = %command, status = %response.status, "Non-success status");
        }

        Ok(response)
    }

    async fn send_with_retry(&self, request: Request, cursor: Option<Cursor>) -> Result<Response> {
        let command = request.command;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(limiter) = &self.limiter {
                let waited = Instant::now();
                limiter.acquire().await;
                crate::metrics::record_throttle_wait(waited.elapsed());
            }

            let result = match tokio::time::timeout(
                self.retry.exchange_timeout,
                self.adapter.execute(request.clone(), cursor.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(self.retry.exchange_timeout)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        command = %command,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport failure, retrying"
                    );
                    crate::metrics::record_transport_failure(command.name(), true);
                    crate::metrics::record_transport_retry(command.name());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(command = %command, attempt, error = %e, "Exchange failed");
                    crate::metrics::record_transport_failure(command.name(), e.is_transient());
                    return Err(e.into_harness(command));
                }
            }
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Establish sync state for `collection` with a zero-cursor Sync.
    pub async fn prime(&self, collection: &CollectionId) -> Result<Response> {
        let owner = self.current_owner().await?;
        let request = Request::sync(
            collection.clone(),
            SyncRequest {
                get_changes: false,
                ..SyncRequest::default()
            },
        );
        self.execute_with_cursor(request, Cursor::zero())
            .await?
            .ensure_success(&owner)
    }

    /// Drop the stored cursor and prime again.
    pub async fn reprime(&self, collection: &CollectionId) -> Result<Response> {
        let owner = self.current_owner().await?;
        self.cursors.invalidate(&owner, collection).await;
        self.prime(collection).await
    }

    /// Fetch changes since the stored cursor, priming first on a cold start.
    ///
    /// With `follow_more_available` the call keeps syncing while the server
    /// reports MoreAvailable and returns the merged result.
    pub async fn sync_changes(&self, collection: &CollectionId, follow_more_available: bool) -> Result<SyncResponse> {
        let owner = self.current_owner().await?;
        if self.cursors.get(&owner, collection).await.is_zero() {
            self.prime(collection).await?;
        }

        let mut merged = SyncResponse::default();
        for _ in 0..MAX_MORE_AVAILABLE_ROUNDS {
            let response = self
                .execute(Request::sync(collection.clone(), SyncRequest::default()))
                .await?
                .ensure_success(&owner)?;
            let page = match response.body {
                ResponseBody::Sync(page) => page,
                _ => SyncResponse::default(),
            };

            merged.adds.extend(page.adds);
            merged.changes.extend(page.changes);
            merged.deletes.extend(page.deletes);
            merged.fetched.extend(page.fetched);
            merged.added.extend(page.added);
            merged.more_available = page.more_available;

            if !(page.more_available && follow_more_available) {
                return Ok(merged);
            }
            debug!(owner = %owner, collection = %collection, "MoreAvailable, syncing again");
        }

        Err(HarnessError::Internal(format!(
            "{} still reports MoreAvailable after {} rounds",
            collection, MAX_MORE_AVAILABLE_ROUNDS
        )))
    }

    /// Complete item listing of `collection` from a fresh sync relationship.
    pub async fn snapshot(&self, collection: &CollectionId) -> Result<Vec<Item>> {
        self.reprime(collection).await?;
        Ok(self.sync_changes(collection, true).await?.adds)
    }

    /// Items in `collection` matching `key`.
    pub async fn find_items(&self, collection: &CollectionId, key: &ItemKey) -> Result<Vec<Item>> {
        let items = self.snapshot(collection).await?;
        Ok(items.into_iter().filter(|item| item.matches(key)).collect())
    }

    /// Issue Sync commands (Add/Change/Delete/Fetch) against `collection`.
    pub async fn sync_commands(
        &self,
        collection: &CollectionId,
        commands: Vec<SyncCommand>,
        deletes_as_moves: bool,
    ) -> Result<Response> {
        let owner = self.current_owner().await?;
        if self.cursors.get(&owner, collection).await.is_zero() {
            self.prime(collection).await?;
        }
        self.execute(Request::sync(
            collection.clone(),
            SyncRequest {
                get_changes: false,
                window_size: None,
                deletes_as_moves,
                commands,
            },
        ))
        .await
    }

    pub async fn item_estimate(&self, collection: &CollectionId) -> Result<u32> {
        let owner = self.current_owner().await?;
        let response = self
            .execute(Request::item_estimate(collection.clone()))
            .await?
            .ensure_success(&owner)?;
        match response.body {
            ResponseBody::Estimate { count } => Ok(count),
            _ => Err(HarnessError::Adapter {
                command: Command::GetItemEstimate,
                message: "response carried no estimate".to_string(),
            }),
        }
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// FolderSync from the stored hierarchy cursor.
    pub async fn folder_sync(&self) -> Result<FolderSyncResponse> {
        let owner = self.current_owner().await?;
        let response = self.execute(Request::folder_sync()).await?.ensure_success(&owner)?;
        Ok(match response.body {
            ResponseBody::FolderSync(changes) => changes,
            _ => FolderSyncResponse::default(),
        })
    }

    async fn ensure_hierarchy_cursor(&self, owner: &Owner) -> Result<()> {
        if self.cursors.get(owner, &CollectionId::hierarchy()).await.is_zero() {
            self.folder_sync().await?;
        }
        Ok(())
    }

    /// Run a hierarchy mutation, re-establishing the hierarchy cursor once if
    /// the server rejects it.
    async fn hierarchy_exchange(&self, request: Request) -> Result<Response> {
        let owner = self.current_owner().await?;
        self.ensure_hierarchy_cursor(&owner).await?;
        let response = self.execute(request.clone()).await?;
        if response.status.cursor_scope().is_some() {
            debug!(owner = %owner, command = %request.command, "Hierarchy cursor stale, resyncing once");
            self.ensure_hierarchy_cursor(&owner).await?;
            return self.execute(request).await;
        }
        Ok(response)
    }

    pub async fn create_folder(
        &self,
        parent_id: &CollectionId,
        display_name: &str,
        folder_type: FolderType,
    ) -> Result<CollectionId> {
        let owner = self.current_owner().await?;
        let response = self
            .hierarchy_exchange(Request::new(
                Command::FolderCreate,
                None,
                RequestBody::FolderCreate {
                    parent_id: parent_id.clone(),
                    display_name: display_name.to_string(),
                    folder_type,
                },
            ))
            .await?
            .ensure_success(&owner)?;
        match response.body {
            ResponseBody::FolderCreate { server_id } => {
                info!(owner = %owner, folder = %server_id, name = display_name, "Created folder");
                if let Some(map) = self.hierarchies.write().await.get_mut(&owner) {
                    map.insert(Folder {
                        server_id: server_id.clone(),
                        parent_id: parent_id.clone(),
                        display_name: display_name.to_string(),
                        folder_type,
                    });
                }
                Ok(server_id)
            }
            _ => Err(HarnessError::Adapter {
                command: Command::FolderCreate,
                message: "response carried no folder id".to_string(),
            }),
        }
    }

    pub async fn delete_folder(&self, folder: &CollectionId) -> Result<()> {
        let owner = self.current_owner().await?;
        self.hierarchy_exchange(Request::new(
            Command::FolderDelete,
            None,
            RequestBody::FolderDelete {
                server_id: folder.clone(),
            },
        ))
        .await?
        .ensure_success(&owner)?;
        if let Some(map) = self.hierarchies.write().await.get_mut(&owner) {
            map.remove(folder);
        }
        self.cursors.invalidate(&owner, folder).await;
        Ok(())
    }

    // =========================================================================
    // Mail and settings
    // =========================================================================

    pub async fn send_mail(&self, message: MailMessage) -> Result<()> {
        let owner = self.current_owner().await?;
        self.execute(Request::new(Command::SendMail, None, RequestBody::SendMail(message)))
            .await?
            .ensure_success(&owner)?;
        Ok(())
    }

    pub async fn get_oof(&self) -> Result<OofSettings> {
        let owner = self.current_owner().await?;
        let response = self
            .execute(Request::new(
                Command::Settings,
                None,
                RequestBody::Settings(SettingsRequest::GetOof),
            ))
            .await?
            .ensure_success(&owner)?;
        match response.body {
            ResponseBody::Oof(settings) => Ok(settings),
            _ => Err(HarnessError::Adapter {
                command: Command::Settings,
                message: "response carried no OOF settings".to_string(),
            }),
        }
    }

    pub async fn set_oof(&self, settings: OofSettings) -> Result<()> {
        let owner = self.current_owner().await?;
        self.execute(Request::new(
            Command::Settings,
            None,
            RequestBody::Settings(SettingsRequest::SetOof(settings)),
        ))
        .await?
        .ensure_success(&owner)?;
        Ok(())
    }

    pub fn last_raw_response(&self) -> Option<RawResponse> {
        self.adapter.last_raw_response()
    }
}

impl<A: ProtocolAdapter> Janitor for ProtocolSession<A> {
    fn resolve(&self, owner: Owner, collection: CollectionId, key: ItemKey) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.switch_identity(&owner).await?;
            let items = self.find_items(&collection, &key).await?;
            Ok(items.into_iter().map(|item| item.server_id).collect())
        })
    }

    fn delete_items(&self, owner: Owner, collection: CollectionId, server_ids: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.switch_identity(&owner).await?;
            let commands = server_ids
                .into_iter()
                .map(|server_id| SyncCommand::Delete { server_id })
                .collect();
            self.sync_commands(&collection, commands, false)
                .await?
                .ensure_success(&owner)?;
            Ok(())
        })
    }

    fn delete_folder(&self, owner: Owner, folder: CollectionId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.switch_identity(&owner).await?;
            ProtocolSession::delete_folder(self, &folder).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;
    use crate::protocol::KeyField;
    use crate::status::Status;
    use std::collections::BTreeMap;

    fn u1() -> Owner {
        Owner::from("U1")
    }

    fn session() -> ProtocolSession<Arc<MemoryAdapter>> {
        let server = Arc::new(MemoryAdapter::new());
        server.add_user("user1");
        server.add_user("user2");
        ProtocolSession::new(
            server,
            Arc::new(CursorStore::in_memory()),
            [
                (u1(), MemoryAdapter::credentials("user1")),
                (Owner::from("U2"), MemoryAdapter::credentials("user2")),
            ],
            SessionOptions::testing(),
        )
    }

    fn add(subject: &str) -> SyncCommand {
        let mut fields = BTreeMap::new();
        fields.insert(KeyField::Subject.name().to_string(), subject.to_string());
        SyncCommand::Add {
            client_id: subject.to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn test_execute_without_identity_is_invalid_state() {
        let session = session();
        let err = session.execute(Request::folder_sync()).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_switch_unknown_identity() {
        let session = session();
        let err = session.switch_identity(&Owner::from("U9")).await.unwrap_err();
        assert!(matches!(err, HarnessError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn test_handshake_caches_well_known_folders() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();

        let inbox = session.well_known(FolderType::Inbox).await.unwrap();
        let contacts = session.folder_id(&u1(), FolderType::Contacts).await.unwrap();
        assert_ne!(inbox, contacts);
        assert!(!session
            .cursors()
            .get(&u1(), &CollectionId::hierarchy())
            .await
            .is_zero());

        // Second switch does not repeat the handshake
        let hierarchy_cursor = session.cursors().get(&u1(), &CollectionId::hierarchy()).await;
        session.switch_identity(&u1()).await.unwrap();
        assert_eq!(
            session.cursors().get(&u1(), &CollectionId::hierarchy()).await,
            hierarchy_cursor
        );
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();

        // Cold start sends the zero cursor
        assert!(session.cursors().get(&u1(), &inbox).await.is_zero());
        let primed = session.prime(&inbox).await.unwrap();
        let k1 = primed.cursor.clone().unwrap();
        assert_eq!(session.cursors().get(&u1(), &inbox).await, k1);

        let next = session
            .execute(Request::sync(inbox.clone(), SyncRequest::default()))
            .await
            .unwrap();
        assert_eq!(next.status, Status::Success);
        let k2 = next.cursor.clone().unwrap();
        assert_ne!(k1, k2);
        assert_eq!(session.cursors().get(&u1(), &inbox).await, k2);
    }

    #[tokio::test]
    async fn test_stale_cursor_invalidates_and_returns_status() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();

        let stale = session.prime(&inbox).await.unwrap().cursor.unwrap();
        session
            .execute(Request::sync(inbox.clone(), SyncRequest::default()))
            .await
            .unwrap();

        let response = session
            .execute_with_cursor(Request::sync(inbox.clone(), SyncRequest::default()), stale)
            .await
            .unwrap();
        assert_eq!(response.status, Status::InvalidCursor);
        assert!(session.cursors().get(&u1(), &inbox).await.is_zero());

        let err = response.ensure_success(&u1()).unwrap_err();
        assert!(err.is_cursor_state());
    }

    #[tokio::test]
    async fn test_find_items_and_delete() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();

        session
            .sync_commands(&inbox, vec![add("S1"), add("S2")], true)
            .await
            .unwrap()
            .ensure_success(&u1())
            .unwrap();

        let found = session.find_items(&inbox, &ItemKey::subject("S1")).await.unwrap();
        assert_eq!(found.len(), 1);

        let ids = session.resolve(u1(), inbox.clone(), ItemKey::subject("S2")).await.unwrap();
        session.delete_items(u1(), inbox.clone(), ids).await.unwrap();
        assert!(session
            .find_items(&inbox, &ItemKey::subject("S2"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(session.snapshot(&inbox).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_changes_follows_more_available() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();
        session.adapter().set_window_size(2);

        let adds: Vec<SyncCommand> = (0..5).map(|i| add(&format!("M{i}"))).collect();
        session.sync_commands(&inbox, adds, true).await.unwrap();

        let all = session.snapshot(&inbox).await.unwrap();
        assert_eq!(all.len(), 5);

        session.reprime(&inbox).await.unwrap();
        let first_page = session.sync_changes(&inbox, false).await.unwrap();
        assert_eq!(first_page.adds.len(), 2);
        assert!(first_page.more_available);
    }

    #[tokio::test]
    async fn test_create_and_delete_folder() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();

        let folder = session
            .create_folder(&CollectionId::root(), "scratch", FolderType::UserMail)
            .await
            .unwrap();
        let map = session.folder_map(&u1()).await.unwrap();
        assert_eq!(map.by_name("scratch").unwrap().server_id, folder);

        // The server counts the create as already synced
        let changes = session.folder_sync().await.unwrap();
        assert!(changes.adds.is_empty());

        session.delete_folder(&folder).await.unwrap();
        assert!(session.folder_map(&u1()).await.unwrap().by_name("scratch").is_none());
        let err = session.delete_folder(&folder).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Status {
                status: Status::FolderNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_handshake_keeps_current_identity() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();

        // Exhaust every attempt of the U2 handshake
        session.adapter().fail_next(3);
        let err = session.switch_identity(&Owner::from("U2")).await.unwrap_err();
        assert!(matches!(err, HarnessError::Handshake { .. }));
        assert_eq!(session.current_owner().await.unwrap(), u1());
        assert!(session.folder_map(&Owner::from("U2")).await.is_none());

        // The adapter is back on user1
        let mut fields = BTreeMap::new();
        fields.insert(KeyField::Subject.name().to_string(), "mine".to_string());
        session.adapter().seed_item("user1", FolderType::Inbox, fields);
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();
        let items = session.snapshot(&inbox).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_keeps_current_identity() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let u2 = Owner::from("U2");

        session.discover(&u2).await.unwrap();
        assert_eq!(session.current_owner().await.unwrap(), u1());
        assert!(session.folder_id(&u2, FolderType::Inbox).await.is_ok());

        // Cached: no second handshake
        session.discover(&u2).await.unwrap();
        assert_eq!(session.current_owner().await.unwrap(), u1());

        assert!(!session.cursors().get(&u2, &CollectionId::hierarchy()).await.is_zero());

        // Exchanges still run as U1
        let inbox = session.well_known(FolderType::Inbox).await.unwrap();
        session.prime(&inbox).await.unwrap();
        assert!(!session.cursors().get(&u1(), &inbox).await.is_zero());
    }

    #[tokio::test]
    async fn test_discover_without_identity_selects_none() {
        let session = session();
        session.discover(&u1()).await.unwrap();
        assert!(session.folder_map(&u1()).await.is_some());
        assert!(session.current_owner().await.is_err());
    }

    #[tokio::test]
    async fn test_zero_cursor_folder_sync_replaces_cached_hierarchy() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let ghost = session
            .create_folder(&CollectionId::root(), "ghost", FolderType::UserMail)
            .await
            .unwrap();

        // Delete behind the session's back, consuming its hierarchy cursor
        let cursor = session.cursors().get(&u1(), &CollectionId::hierarchy()).await;
        let response = session
            .adapter()
            .execute(
                Request::new(
                    Command::FolderDelete,
                    None,
                    RequestBody::FolderDelete { server_id: ghost },
                ),
                Some(cursor),
            )
            .await
            .unwrap();
        assert!(response.status.is_success());

        // Stale cursor: rejected, then a cold resync
        assert!(session.folder_sync().await.is_err());
        session.folder_sync().await.unwrap();
        let map = session.folder_map(&u1()).await.unwrap();
        assert!(map.by_name("ghost").is_none());
        assert!(map.well_known(FolderType::Inbox).is_some());
    }

    #[tokio::test]
    async fn test_hierarchy_mutation_recovers_from_stale_cursor() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        session
            .cursors()
            .put(&u1(), &CollectionId::hierarchy(), Cursor::from("H-stale"))
            .await;

        let folder = session
            .create_folder(&CollectionId::root(), "retry", FolderType::UserMail)
            .await
            .unwrap();
        assert!(!folder.as_str().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        session.adapter().fail_next(2);

        // testing() allows three attempts
        let response = session.folder_sync().await;
        assert!(response.is_ok());

        session.adapter().fail_next(3);
        let err = session.folder_sync().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_identities_have_separate_cursors() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        let u1_inbox = session.well_known(FolderType::Inbox).await.unwrap();
        session.prime(&u1_inbox).await.unwrap();

        let u2 = Owner::from("U2");
        session.switch_identity(&u2).await.unwrap();
        let u2_inbox = session.well_known(FolderType::Inbox).await.unwrap();
        assert!(session.cursors().get(&u2, &u2_inbox).await.is_zero());
        assert!(!session.cursors().get(&u1(), &u1_inbox).await.is_zero());
    }

    #[tokio::test]
    async fn test_oof_round_trip() {
        let session = session();
        session.switch_identity(&u1()).await.unwrap();
        assert!(!session.get_oof().await.unwrap().is_enabled());

        session
            .set_oof(OofSettings {
                mode: crate::protocol::OofMode::Global,
                reply_message: Some("away".into()),
            })
            .await
            .unwrap();
        // Propagation is immediate with the default memory server
        assert!(session.get_oof().await.unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_client_context_override_returns_previous() {
        let session = session();
        let first = ClientContext {
            device_id: "DEV1".into(),
            device_type: "Harness".into(),
            policy_key: None,
        };
        assert!(session.set_client_context(first.clone()).await.unwrap().is_none());

        let second = ClientContext {
            device_id: "DEV2".into(),
            ..first.clone()
        };
        assert_eq!(session.set_client_context(second).await.unwrap(), Some(first));
    }

    #[test]
    fn test_folder_map_apply() {
        let folder = |id: &str, name: &str| Folder {
            server_id: CollectionId::from(id),
            parent_id: CollectionId::root(),
            display_name: name.to_string(),
            folder_type: FolderType::UserMail,
        };
        let mut map = FolderMap::from_response(&FolderSyncResponse {
            adds: vec![folder("1", "a"), folder("2", "b")],
            ..Default::default()
        });
        map.apply(&FolderSyncResponse {
            adds: vec![folder("3", "c")],
            updates: vec![folder("1", "a2")],
            deletes: vec![CollectionId::from("2")],
        });
        let names: Vec<&str> = map.folders().iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["a2", "c"]);
        // User folders are never "well known"
        assert!(map.well_known(FolderType::UserMail).is_none());
    }

    #[test]
    fn test_folder_map_remove_is_transitive() {
        let folder = |id: &str, parent: CollectionId| Folder {
            server_id: CollectionId::from(id),
            parent_id: parent,
            display_name: id.to_string(),
            folder_type: FolderType::UserMail,
        };
        let mut map = FolderMap::from_response(&FolderSyncResponse {
            adds: vec![
                folder("a", CollectionId::root()),
                folder("b", CollectionId::from("a")),
                folder("c", CollectionId::from("b")),
                folder("d", CollectionId::root()),
            ],
            ..Default::default()
        });
        map.remove(&CollectionId::from("a"));
        let names: Vec<&str> = map.folders().iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["d"]);
    }
}
