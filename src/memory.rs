// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process reference server.
//!
//! [`MemoryAdapter`] implements [`ProtocolAdapter`] and [`SutControl`] against
//! mailboxes held in memory, with the cursor semantics of a real server:
//!
//! - Every collection (and the folder hierarchy) has exactly one valid cursor
//!   per mailbox. Sending any other non-zero cursor yields the command's
//!   invalid-cursor status. The zero cursor resets sync state.
//! - Sync reports the difference between what the client was last told and
//!   what is visible now, windowed, with MoreAvailable.
//! - Mail delivery and OOF changes become visible after configurable delays,
//!   measured on the tokio clock so tests can run with a paused clock.
//! - Transport failures and latency can be injected.
//!
//! It backs the crate's own tests and dry runs of scenarios.
//!
//! ```rust,no_run
//! # async fn example() -> conformance_harness::Result<()> {
//! use conformance_harness::memory::MemoryAdapter;
//! use std::time::Duration;
//!
//! let server = MemoryAdapter::new();
//! server.add_user("user1");
//! server.add_user("user2");
//! server.set_delivery_delay(Duration::from_secs(3));
//! # Ok(())
//! # }
//! ```

use crate::adapter::{AdapterError, AdapterResult, BoxFuture, ProtocolAdapter};
use crate::error::{BoxFuture as HarnessFuture, HarnessError};
use crate::protocol::{
    ClientContext, CollectionId, Command, Credentials, Cursor, Folder, FolderSyncResponse, FolderType, Item,
    ItemKey, MailMessage, MeetingReply, MoveResult, MoveSpec, OofSettings, Owner, PartSpan, RawResponse,
    Request, RequestBody, Response, ResponseBody, SettingsRequest, SyncCommand, SyncRequest, SyncResponse,
};
use crate::status::{CommonStatus, Status};
use crate::sut::{FolderPermission, SutControl};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_PASSWORD: &str = "Password01!";
pub const DEFAULT_DOMAIN: &str = "contoso.com";

const WELL_KNOWN: [(FolderType, &str); 11] = [
    (FolderType::Inbox, "Inbox"),
    (FolderType::Drafts, "Drafts"),
    (FolderType::DeletedItems, "Deleted Items"),
    (FolderType::SentItems, "Sent Items"),
    (FolderType::Outbox, "Outbox"),
    (FolderType::Tasks, "Tasks"),
    (FolderType::Calendar, "Calendar"),
    (FolderType::Contacts, "Contacts"),
    (FolderType::Notes, "Notes"),
    (FolderType::Journal, "Journal"),
    (FolderType::RecipientInformationCache, "Suggested Contacts"),
];

/// Server behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Time between SendMail and the message showing up in the recipient's Inbox.
    pub delivery_delay: Duration,
    /// Time between an OOF Set and Get reporting it.
    pub oof_delay: Duration,
    /// Server-side cap on Sync changes per response.
    pub window_size: Option<u32>,
    /// Added to every exchange.
    pub latency: Duration,
}

#[derive(Debug, Clone)]
struct StoredItem {
    fields: BTreeMap<String, String>,
    visible_at: Instant,
}

#[derive(Debug)]
struct MemFolder {
    folder: Folder,
    items: BTreeMap<String, StoredItem>,
    next_item: u64,
}

impl MemFolder {
    fn new(folder: Folder) -> Self {
        Self {
            folder,
            items: BTreeMap::new(),
            next_item: 0,
        }
    }

    fn insert(&mut self, fields: BTreeMap<String, String>, visible_at: Instant) -> String {
        self.next_item += 1;
        let server_id = format!("{}:{}", self.folder.server_id, self.next_item);
        self.items.insert(server_id.clone(), StoredItem { fields, visible_at });
        server_id
    }

    fn visible(&self, now: Instant) -> impl Iterator<Item = (&String, &StoredItem)> {
        self.items.iter().filter(move |(_, item)| item.visible_at <= now)
    }
}

#[derive(Debug)]
struct SyncState {
    key: String,
    /// What the client was last told, by server id.
    known: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug)]
struct HierarchyState {
    key: String,
    known: BTreeMap<CollectionId, Folder>,
}

#[derive(Debug)]
struct Mailbox {
    password: String,
    folders: BTreeMap<CollectionId, MemFolder>,
    next_folder: u64,
    next_key: u64,
    hierarchy: Option<HierarchyState>,
    sync: HashMap<CollectionId, SyncState>,
    oof: OofSettings,
    pending_oof: Option<(Instant, OofSettings)>,
}

fn response(command: Command, status: Status) -> Response {
    Response::new(command, status)
}

impl Mailbox {
    fn new(password: &str) -> Self {
        let mut mailbox = Self {
            password: password.to_string(),
            folders: BTreeMap::new(),
            next_folder: 0,
            next_key: 0,
            hierarchy: None,
            sync: HashMap::new(),
            oof: OofSettings::disabled(),
            pending_oof: None,
        };
        for (folder_type, name) in WELL_KNOWN {
            mailbox.add_folder(CollectionId::root(), name, folder_type);
        }
        mailbox
    }

    fn add_folder(&mut self, parent_id: CollectionId, display_name: &str, folder_type: FolderType) -> CollectionId {
        self.next_folder += 1;
        let server_id = CollectionId::new(self.next_folder.to_string());
        let folder = Folder {
            server_id: server_id.clone(),
            parent_id,
            display_name: display_name.to_string(),
            folder_type,
        };
        self.folders.insert(server_id.clone(), MemFolder::new(folder));
        server_id
    }

    fn folder_of_type(&self, folder_type: FolderType) -> Option<CollectionId> {
        self.folders
            .values()
            .find(|f| f.folder.folder_type == folder_type)
            .map(|f| f.folder.server_id.clone())
    }

    fn folder_of_type_mut(&mut self, folder_type: FolderType) -> Option<&mut MemFolder> {
        self.folders.values_mut().find(|f| f.folder.folder_type == folder_type)
    }

    fn next_key(&mut self, prefix: char) -> Cursor {
        self.next_key += 1;
        Cursor::new(format!("{}{}", prefix, self.next_key))
    }

    fn effective_oof(&mut self, now: Instant) -> &OofSettings {
        if let Some((at, _)) = &self.pending_oof {
            if *at <= now {
                if let Some((_, settings)) = self.pending_oof.take() {
                    self.oof = settings;
                }
            }
        }
        &self.oof
    }

    /// Forget every sync relationship (device wipe).
    fn reset_partnership(&mut self) {
        self.hierarchy = None;
        self.sync.clear();
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    fn hierarchy_cursor_ok(&self, cursor: &Cursor) -> bool {
        matches!(&self.hierarchy, Some(h) if h.key == cursor.as_str())
    }

    fn snapshot_hierarchy(&self) -> BTreeMap<CollectionId, Folder> {
        self.folders
            .iter()
            .map(|(id, f)| (id.clone(), f.folder.clone()))
            .collect()
    }

    /// Advance the hierarchy cursor after a client-initiated change the
    /// client already knows about.
    fn advance_hierarchy(&mut self) -> Cursor {
        let key = self.next_key('H');
        let known = self.snapshot_hierarchy();
        if let Some(h) = self.hierarchy.as_mut() {
            h.key = key.as_str().to_string();
            h.known = known;
        }
        key
    }

    fn folder_sync(&mut self, cursor: &Cursor) -> Response {
        if cursor.is_zero() {
            self.hierarchy = Some(HierarchyState {
                key: String::new(),
                known: BTreeMap::new(),
            });
        } else if !self.hierarchy_cursor_ok(cursor) {
            return response(Command::FolderSync, Status::InvalidCursor);
        }

        let key = self.next_key('H');
        let current = self.snapshot_hierarchy();
        let mut changes = FolderSyncResponse::default();
        if let Some(h) = self.hierarchy.as_mut() {
            for (id, folder) in &current {
                match h.known.get(id) {
                    None => changes.adds.push(folder.clone()),
                    Some(known) if known != folder => changes.updates.push(folder.clone()),
                    Some(_) => {}
                }
            }
            changes.deletes = h.known.keys().filter(|id| !current.contains_key(*id)).cloned().collect();
            h.key = key.as_str().to_string();
            h.known = current;
        }

        response(Command::FolderSync, Status::Success)
            .with_cursor(key)
            .with_body(ResponseBody::FolderSync(changes))
    }

    fn name_taken(&self, parent_id: &CollectionId, display_name: &str, except: Option<&CollectionId>) -> bool {
        self.folders.values().any(|f| {
            &f.folder.parent_id == parent_id
                && f.folder.display_name == display_name
                && Some(&f.folder.server_id) != except
        })
    }

    fn parent_exists(&self, parent_id: &CollectionId) -> bool {
        *parent_id == CollectionId::root() || self.folders.contains_key(parent_id)
    }

    fn folder_create(
        &mut self,
        cursor: &Cursor,
        parent_id: CollectionId,
        display_name: &str,
        folder_type: FolderType,
    ) -> Response {
        let command = Command::FolderCreate;
        if !self.hierarchy_cursor_ok(cursor) {
            return response(command, Status::InvalidCursor);
        }
        if folder_type.is_well_known() {
            return response(command, Status::SpecialFolder);
        }
        if !self.parent_exists(&parent_id) {
            return response(command, Status::ParentNotFound);
        }
        if self.name_taken(&parent_id, display_name, None) {
            return response(command, Status::FolderExists);
        }
        let server_id = self.add_folder(parent_id, display_name, folder_type);
        let key = self.advance_hierarchy();
        response(command, Status::Success)
            .with_cursor(key)
            .with_body(ResponseBody::FolderCreate { server_id })
    }

    fn folder_delete(&mut self, cursor: &Cursor, server_id: &CollectionId) -> Response {
        let command = Command::FolderDelete;
        if !self.hierarchy_cursor_ok(cursor) {
            return response(command, Status::InvalidCursor);
        }
        let Some(folder) = self.folders.get(server_id) else {
            return response(command, Status::FolderNotFound);
        };
        if folder.folder.folder_type.is_well_known() {
            return response(command, Status::SpecialFolder);
        }

        let mut doomed = vec![server_id.clone()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            doomed.extend(
                self.folders
                    .values()
                    .filter(|f| f.folder.parent_id == parent)
                    .map(|f| f.folder.server_id.clone()),
            );
            i += 1;
        }
        for id in &doomed {
            self.folders.remove(id);
            self.sync.remove(id);
        }

        let key = self.advance_hierarchy();
        response(command, Status::Success).with_cursor(key)
    }

    fn folder_update(
        &mut self,
        cursor: &Cursor,
        server_id: &CollectionId,
        parent_id: CollectionId,
        display_name: &str,
    ) -> Response {
        let command = Command::FolderUpdate;
        if !self.hierarchy_cursor_ok(cursor) {
            return response(command, Status::InvalidCursor);
        }
        let Some(folder) = self.folders.get(server_id) else {
            return response(command, Status::FolderNotFound);
        };
        if folder.folder.folder_type.is_well_known() {
            return response(command, Status::SpecialFolder);
        }
        if !self.parent_exists(&parent_id) || parent_id == *server_id {
            return response(command, Status::ParentNotFound);
        }
        if self.name_taken(&parent_id, display_name, Some(server_id)) {
            return response(command, Status::FolderExists);
        }
        if let Some(folder) = self.folders.get_mut(server_id) {
            folder.folder.parent_id = parent_id;
            folder.folder.display_name = display_name.to_string();
        }
        let key = self.advance_hierarchy();
        response(command, Status::Success).with_cursor(key)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    fn sync(
        &mut self,
        collection: &CollectionId,
        cursor: &Cursor,
        request: SyncRequest,
        now: Instant,
        server_window: Option<u32>,
    ) -> Response {
        let fail = |status| response(Command::Sync, status).with_collection(collection.clone());

        if !self.folders.contains_key(collection) {
            return fail(Status::HierarchyChanged);
        }

        if cursor.is_zero() {
            if !request.commands.is_empty() {
                return fail(Status::ProtocolError);
            }
            let key = self.next_key('K');
            self.sync.insert(
                collection.clone(),
                SyncState {
                    key: key.as_str().to_string(),
                    known: BTreeMap::new(),
                },
            );
            return fail(Status::Success)
                .with_cursor(key)
                .with_body(ResponseBody::Sync(SyncResponse::default()));
        }

        match self.sync.get(collection) {
            Some(state) if state.key == cursor.as_str() => {}
            _ => return fail(Status::InvalidCursor),
        }

        let Some(folder) = self.folders.get(collection) else {
            return fail(Status::HierarchyChanged);
        };
        let missing_target = request.commands.iter().any(|command| match command {
            SyncCommand::Change { server_id, .. }
            | SyncCommand::Delete { server_id }
            | SyncCommand::Fetch { server_id } => !folder.items.contains_key(server_id),
            SyncCommand::Add { .. } => false,
        });
        if missing_target {
            return fail(Status::ObjectNotFound);
        }

        let trash = self.folder_of_type(FolderType::DeletedItems);
        let mut moved = Vec::new();
        let mut result = SyncResponse::default();

        if let (Some(folder), Some(state)) = (self.folders.get_mut(collection), self.sync.get_mut(collection)) {
            for command in request.commands {
                match command {
                    SyncCommand::Add { client_id, fields } => {
                        let server_id = folder.insert(fields.clone(), now);
                        state.known.insert(server_id.clone(), fields);
                        result.added.push((client_id, server_id));
                    }
                    SyncCommand::Change { server_id, fields } => {
                        if let Some(item) = folder.items.get_mut(&server_id) {
                            item.fields.extend(fields);
                            state.known.insert(server_id, item.fields.clone());
                        }
                    }
                    SyncCommand::Delete { server_id } => {
                        if let Some(item) = folder.items.remove(&server_id) {
                            state.known.remove(&server_id);
                            if request.deletes_as_moves && trash.as_ref() != Some(collection) {
                                moved.push(item.fields);
                            }
                        }
                    }
                    SyncCommand::Fetch { server_id } => {
                        if let Some(item) = folder.items.get(&server_id) {
                            result.fetched.push(Item {
                                server_id,
                                fields: item.fields.clone(),
                            });
                        }
                    }
                }
            }

            if request.get_changes {
                let window = match (request.window_size, server_window) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let mut budget = window.map(|w| w.max(1) as usize).unwrap_or(usize::MAX);

                for (server_id, item) in folder.visible(now) {
                    let known = state.known.get(server_id);
                    if known == Some(&item.fields) {
                        continue;
                    }
                    if budget == 0 {
                        result.more_available = true;
                        break;
                    }
                    budget -= 1;
                    let entry = Item {
                        server_id: server_id.clone(),
                        fields: item.fields.clone(),
                    };
                    if known.is_some() {
                        result.changes.push(entry);
                    } else {
                        result.adds.push(entry);
                    }
                    state.known.insert(server_id.clone(), item.fields.clone());
                }

                let gone: Vec<String> = state
                    .known
                    .keys()
                    .filter(|id| !folder.items.get(*id).is_some_and(|item| item.visible_at <= now))
                    .cloned()
                    .collect();
                for server_id in gone {
                    if budget == 0 {
                        result.more_available = true;
                        break;
                    }
                    budget -= 1;
                    state.known.remove(&server_id);
                    result.deletes.push(server_id);
                }
            }
        }

        if let Some(trash) = self.folder_of_type_mut(FolderType::DeletedItems) {
            for fields in moved {
                trash.insert(fields, now);
            }
        }

        let key = self.next_key('K');
        if let Some(state) = self.sync.get_mut(collection) {
            state.key = key.as_str().to_string();
        }
        fail(Status::Success)
            .with_cursor(key)
            .with_body(ResponseBody::Sync(result))
    }

    fn item_estimate(&self, collection: Option<&CollectionId>, cursor: &Cursor, now: Instant) -> Response {
        let command = Command::GetItemEstimate;
        let Some((collection, folder)) = collection.and_then(|c| self.folders.get(c).map(|f| (c, f))) else {
            return response(command, Status::InvalidCollection);
        };
        let fail = |status| response(command, status).with_collection(collection.clone());
        if cursor.is_zero() {
            return fail(Status::CursorNotPrimed);
        }
        let Some(state) = self.sync.get(collection).filter(|s| s.key == cursor.as_str()) else {
            return fail(Status::InvalidCursor);
        };

        let changed = folder
            .visible(now)
            .filter(|(id, item)| state.known.get(*id) != Some(&item.fields))
            .count();
        let gone = state
            .known
            .keys()
            .filter(|id| !folder.items.get(*id).is_some_and(|item| item.visible_at <= now))
            .count();
        fail(Status::Success).with_body(ResponseBody::Estimate {
            count: (changed + gone) as u32,
        })
    }

    // =========================================================================
    // Item commands
    // =========================================================================

    fn find(&self, collection: Option<&CollectionId>, key: &ItemKey, range: (u32, u32), now: Instant) -> Response {
        let command = Command::Find;
        if range.0 > range.1 {
            return response(command, Status::InvalidRange);
        }
        let folders: Vec<&MemFolder> = match collection {
            Some(id) => match self.folders.get(id) {
                Some(folder) => vec![folder],
                None => return response(command, Status::InvalidRequest),
            },
            None => self.folders.values().collect(),
        };

        let matches: Vec<Item> = folders
            .into_iter()
            .flat_map(|f| f.visible(now))
            .map(|(id, item)| Item {
                server_id: id.clone(),
                fields: item.fields.clone(),
            })
            .filter(|item| item.matches(key))
            .collect();
        let total = matches.len() as u32;
        let items = matches
            .into_iter()
            .skip(range.0 as usize)
            .take((range.1 - range.0) as usize + 1)
            .collect();

        let mut found = response(command, Status::Success).with_body(ResponseBody::Find { items, total });
        found.collection = collection.cloned();
        found
    }

    fn locate(&self, server_id: &str, now: Instant) -> Option<(&MemFolder, &StoredItem)> {
        self.folders.values().find_map(|folder| {
            folder
                .items
                .get(server_id)
                .filter(|item| item.visible_at <= now)
                .map(|item| (folder, item))
        })
    }

    fn item_operations(&self, server_ids: &[String], now: Instant) -> Response {
        let mut items = Vec::with_capacity(server_ids.len());
        for server_id in server_ids {
            match self.locate(server_id, now) {
                Some((_, item)) => items.push(Item {
                    server_id: server_id.clone(),
                    fields: item.fields.clone(),
                }),
                None => return response(Command::ItemOperations, Status::ObjectNotFound),
            }
        }
        response(Command::ItemOperations, Status::Success).with_body(ResponseBody::ItemOperations { items })
    }

    fn meeting_response(&mut self, request_id: &str, reply: MeetingReply, now: Instant) -> Response {
        let command = Command::MeetingResponse;
        let Some(inbox) = self.folder_of_type_mut(FolderType::Inbox) else {
            return response(command, Status::MailboxError);
        };
        let Some(request) = inbox
            .items
            .get(request_id)
            .filter(|item| item.visible_at <= now)
            .cloned()
        else {
            return response(command, Status::InvalidRequest);
        };
        inbox.items.remove(request_id);

        let calendar_id = match reply {
            MeetingReply::Declined => None,
            MeetingReply::Accepted | MeetingReply::Tentative => {
                let mut fields = request.fields;
                fields.insert("ResponseType".to_string(), format!("{:?}", reply));
                self.folder_of_type_mut(FolderType::Calendar)
                    .map(|calendar| calendar.insert(fields, now))
            }
        };
        response(command, Status::Success).with_body(ResponseBody::MeetingResponse { calendar_id })
    }

    fn move_one(&mut self, spec: &MoveSpec, now: Instant) -> MoveResult {
        let result = |status, destination_id| MoveResult {
            source_id: spec.server_id.clone(),
            status,
            destination_id,
        };
        if spec.source == spec.destination {
            return result(Status::SameFolder, None);
        }
        if !self.folders.contains_key(&spec.destination) {
            return result(Status::InvalidDestination, None);
        }
        let item = self
            .folders
            .get_mut(&spec.source)
            .and_then(|folder| folder.items.remove(&spec.server_id));
        let Some(item) = item else {
            return result(Status::InvalidSource, None);
        };
        match self.folders.get_mut(&spec.destination) {
            Some(destination) => {
                let new_id = destination.insert(item.fields, now.max(item.visible_at));
                result(Status::Success, Some(new_id))
            }
            None => result(Status::InvalidDestination, None),
        }
    }

    fn move_items(&mut self, specs: &[MoveSpec], now: Instant) -> Response {
        let results: Vec<MoveResult> = specs.iter().map(|spec| self.move_one(spec, now)).collect();
        let status = results
            .iter()
            .map(|r| r.status)
            .find(|s| !s.is_success())
            .unwrap_or(Status::Success);
        response(Command::MoveItems, status).with_body(ResponseBody::MoveItems(results))
    }

    fn settings(&mut self, request: SettingsRequest, now: Instant, oof_delay: Duration) -> Response {
        match request {
            SettingsRequest::GetOof => {
                let settings = self.effective_oof(now).clone();
                response(Command::Settings, Status::Success).with_body(ResponseBody::Oof(settings))
            }
            SettingsRequest::SetOof(settings) => {
                if let crate::protocol::OofMode::TimeBased { start, end } = &settings.mode {
                    if start >= end {
                        return response(Command::Settings, Status::InvalidArguments);
                    }
                }
                // Settle anything still pending first
                self.effective_oof(now);
                if oof_delay.is_zero() {
                    self.oof = settings;
                } else {
                    self.pending_oof = Some((now + oof_delay, settings));
                }
                response(Command::Settings, Status::Success)
            }
        }
    }
}

struct MemoryState {
    mailboxes: HashMap<String, Mailbox>,
    current: Option<String>,
    context: Option<ClientContext>,
    required_policy_key: Option<String>,
    options: MemoryOptions,
    fail_next: u32,
    exchanges: u64,
    last_raw: Option<RawResponse>,
    permissions: HashMap<(String, String, String), FolderPermission>,
    deleted_devices: Vec<(String, String)>,
}

impl MemoryState {
    fn dispatch(&mut self, user: &str, request: Request, cursor: Cursor, now: Instant) -> (Response, RawResponse) {
        let command = request.command;

        if let Some(context) = &self.context {
            if context.device_id.is_empty() {
                let denied = response(command, Status::Common(CommonStatus::DeviceIdMissingOrInvalid));
                return (denied.clone(), raw_for(&denied));
            }
        }
        if command != Command::Provision {
            if let Some(required) = &self.required_policy_key {
                let presented = self.context.as_ref().and_then(|c| c.policy_key.as_ref());
                if presented != Some(required) {
                    let denied = response(command, Status::Common(CommonStatus::DeviceNotProvisioned));
                    return (denied.clone(), raw_for(&denied));
                }
            }
        }

        if let RequestBody::SendMail(message) = request.body {
            let sent = self.send_mail(user, message, now);
            return (sent.clone(), raw_for(&sent));
        }
        if command == Command::Provision {
            let mut fields = BTreeMap::new();
            fields.insert(
                "PolicyKey".to_string(),
                self.required_policy_key.clone().unwrap_or_else(|| "0".to_string()),
            );
            let provisioned = response(command, Status::Success).with_body(ResponseBody::Opaque(fields));
            return (provisioned.clone(), raw_for(&provisioned));
        }

        let (server_window, oof_delay) = (self.options.window_size, self.options.oof_delay);
        let Some(mailbox) = self.mailboxes.get_mut(user) else {
            let missing = response(command, Status::Common(CommonStatus::UserHasNoMailbox));
            return (missing.clone(), raw_for(&missing));
        };
        let collection = request.collection.clone();

        let result = match (command, request.body) {
            (Command::Sync, RequestBody::Sync(sync)) => match &collection {
                Some(collection) => mailbox.sync(collection, &cursor, sync, now, server_window),
                None => response(command, Status::ProtocolError),
            },
            (Command::FolderSync, _) => mailbox.folder_sync(&cursor),
            (
                Command::FolderCreate,
                RequestBody::FolderCreate {
                    parent_id,
                    display_name,
                    folder_type,
                },
            ) => mailbox.folder_create(&cursor, parent_id, &display_name, folder_type),
            (Command::FolderDelete, RequestBody::FolderDelete { server_id }) => {
                mailbox.folder_delete(&cursor, &server_id)
            }
            (
                Command::FolderUpdate,
                RequestBody::FolderUpdate {
                    server_id,
                    parent_id,
                    display_name,
                },
            ) => mailbox.folder_update(&cursor, &server_id, parent_id, &display_name),
            (Command::GetItemEstimate, _) => mailbox.item_estimate(collection.as_ref(), &cursor, now),
            (Command::Find, RequestBody::Find { key, range }) => mailbox.find(collection.as_ref(), &key, range, now),
            (Command::ItemOperations, RequestBody::ItemOperations { server_ids, multipart }) => {
                let fetched = mailbox.item_operations(&server_ids, now);
                let raw = if multipart && fetched.status.is_success() {
                    multipart_raw(&fetched)
                } else {
                    raw_for(&fetched)
                };
                return (fetched, raw);
            }
            (Command::MeetingResponse, RequestBody::MeetingResponse { request_id, reply }) => {
                mailbox.meeting_response(&request_id, reply, now)
            }
            (Command::MoveItems, RequestBody::MoveItems(specs)) => mailbox.move_items(&specs, now),
            (Command::Settings, RequestBody::Settings(settings)) => mailbox.settings(settings, now, oof_delay),
            (
                Command::Sync
                | Command::FolderCreate
                | Command::FolderDelete
                | Command::FolderUpdate
                | Command::Find
                | Command::ItemOperations
                | Command::MeetingResponse
                | Command::MoveItems
                | Command::Settings,
                _,
            ) => response(command, Status::Common(CommonStatus::InvalidContent)),
            _ => response(command, Status::Common(CommonStatus::CommandNotSupported)),
        };
        (result.clone(), raw_for(&result))
    }

    fn send_mail(&mut self, sender: &str, message: MailMessage, now: Instant) -> Response {
        let command = Command::SendMail;
        if message.to.is_empty() {
            return response(command, Status::Common(CommonStatus::MessageHasNoRecipient));
        }
        if message.to.iter().any(|r| !self.mailboxes.contains_key(r)) {
            return response(command, Status::Common(CommonStatus::MessageRecipientUnresolved));
        }

        let delivered_at = now + self.options.delivery_delay;
        let mut fields = BTreeMap::new();
        fields.insert("Subject".to_string(), message.subject.clone());
        fields.insert("Body".to_string(), message.body.clone());
        fields.insert("From".to_string(), sender.to_string());
        fields.insert("To".to_string(), message.to.join(";"));

        let mut auto_replies = Vec::new();
        for recipient in &message.to {
            if let Some(mailbox) = self.mailboxes.get_mut(recipient) {
                if let Some(inbox) = mailbox.folder_of_type_mut(FolderType::Inbox) {
                    inbox.insert(fields.clone(), delivered_at);
                }
                let oof = mailbox.effective_oof(now);
                if oof.is_enabled() {
                    auto_replies.push((recipient.clone(), oof.reply_message.clone().unwrap_or_default()));
                }
            }
        }

        if let Some(mailbox) = self.mailboxes.get_mut(sender) {
            for (from, body) in auto_replies {
                let mut reply = BTreeMap::new();
                reply.insert("Subject".to_string(), format!("Automatic reply: {}", message.subject));
                reply.insert("Body".to_string(), body);
                reply.insert("From".to_string(), from);
                reply.insert("To".to_string(), sender.to_string());
                if let Some(inbox) = mailbox.folder_of_type_mut(FolderType::Inbox) {
                    inbox.insert(reply, delivered_at + self.options.delivery_delay);
                }
            }
            if message.save_in_sent {
                if let Some(sent) = mailbox.folder_of_type_mut(FolderType::SentItems) {
                    sent.insert(fields, now);
                }
            }
        }

        debug!(sender, recipients = ?message.to, subject = %message.subject, "Memory server accepted mail");
        response(command, Status::Success)
    }
}

fn raw_for(response: &Response) -> RawResponse {
    let code = response.status.code(response.command).unwrap_or(0);
    RawResponse {
        http_status: 200,
        headers: vec![("Content-Type".to_string(), "application/vnd.ms-sync.wbxml".to_string())],
        body: format!("{} Status={}", response.command, code).into_bytes(),
        parts: Vec::new(),
    }
}

/// Multipart layout: part 0 is the status envelope, then one part per item
/// body.
fn multipart_raw(response: &Response) -> RawResponse {
    let mut body = format!("Status={}", response.status.code(response.command).unwrap_or(0)).into_bytes();
    let mut parts = vec![PartSpan {
        offset: 0,
        len: body.len(),
    }];
    for item in response.items() {
        let bytes = item.field("Body").unwrap_or_default().as_bytes();
        parts.push(PartSpan {
            offset: body.len(),
            len: bytes.len(),
        });
        body.extend_from_slice(bytes);
    }
    RawResponse {
        http_status: 200,
        headers: vec![(
            "Content-Type".to_string(),
            "application/vnd.ms-sync.multipart".to_string(),
        )],
        body,
        parts,
    }
}

/// In-memory server under test.
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                mailboxes: HashMap::new(),
                current: None,
                context: None,
                required_policy_key: None,
                options,
                fail_next: 0,
                exchanges: 0,
                last_raw: None,
                permissions: HashMap::new(),
                deleted_devices: Vec::new(),
            }),
        }
    }

    /// Credentials the memory server accepts for `user_name`.
    pub fn credentials(user_name: &str) -> Credentials {
        Credentials {
            user_name: user_name.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a mailbox with the default folders. Existing mailboxes are kept.
    pub fn add_user(&self, user_name: &str) {
        self.state()
            .mailboxes
            .entry(user_name.to_string())
            .or_insert_with(|| Mailbox::new(DEFAULT_PASSWORD));
    }

    pub fn set_delivery_delay(&self, delay: Duration) {
        self.state().options.delivery_delay = delay;
    }

    pub fn set_oof_delay(&self, delay: Duration) {
        self.state().options.oof_delay = delay;
    }

    pub fn set_window_size(&self, window: u32) {
        self.state().options.window_size = Some(window);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().options.latency = latency;
    }

    /// Fail the next `n` exchanges with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Reject every command but Provision unless the client presents `key`.
    pub fn require_policy_key(&self, key: Option<String>) {
        self.state().required_policy_key = key;
    }

    pub fn client_context(&self) -> Option<ClientContext> {
        self.state().context.clone()
    }

    /// Exchanges attempted, including injected failures.
    pub fn exchange_count(&self) -> u64 {
        self.state().exchanges
    }

    /// Store an item directly, bypassing the protocol. Visible immediately.
    pub fn seed_item(&self, user_name: &str, folder_type: FolderType, fields: BTreeMap<String, String>) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state();
        let folder = state.mailboxes.get_mut(user_name)?.folder_of_type_mut(folder_type)?;
        Some(folder.insert(fields, now))
    }

    /// Every stored item of a default folder, including undelivered mail.
    pub fn items(&self, user_name: &str, folder_type: FolderType) -> Vec<Item> {
        let mut state = self.state();
        let Some(folder) = state
            .mailboxes
            .get_mut(user_name)
            .and_then(|m| m.folder_of_type_mut(folder_type))
        else {
            return Vec::new();
        };
        folder
            .items
            .iter()
            .map(|(id, item)| Item {
                server_id: id.clone(),
                fields: item.fields.clone(),
            })
            .collect()
    }

    /// Folders of `user_name` outside the default set.
    pub fn user_folders(&self, user_name: &str) -> Vec<Folder> {
        self.state()
            .mailboxes
            .get(user_name)
            .map(|m| {
                m.folders
                    .values()
                    .filter(|f| !f.folder.folder_type.is_well_known())
                    .map(|f| f.folder.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// OOF state as the server currently reports it.
    pub fn oof(&self, user_name: &str) -> Option<OofSettings> {
        let now = Instant::now();
        let mut state = self.state();
        state.mailboxes.get_mut(user_name).map(|m| m.effective_oof(now).clone())
    }

    pub fn deleted_devices(&self) -> Vec<(String, String)> {
        self.state().deleted_devices.clone()
    }
}

impl ProtocolAdapter for MemoryAdapter {
    fn switch_identity(&self, owner: &Owner, credentials: &Credentials) -> BoxFuture<'_, ()> {
        let result: AdapterResult<()> = {
            let mut state = self.state();
            let password_ok = state
                .mailboxes
                .get(&credentials.user_name)
                .map(|mailbox| mailbox.password == credentials.password);
            match password_ok {
                None => Err(AdapterError::UnknownIdentity(owner.clone())),
                Some(false) => Err(AdapterError::Malformed(format!(
                    "HTTP 401 Unauthorized for {}",
                    credentials.user_name
                ))),
                Some(true) => {
                    state.current = Some(credentials.user_name.clone());
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn set_client_context(&self, context: ClientContext) -> BoxFuture<'_, ()> {
        self.state().context = Some(context);
        Box::pin(async { Ok(()) })
    }

    fn execute(&self, request: Request, cursor: Option<Cursor>) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let latency = self.state().options.latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let now = Instant::now();
            let mut state = self.state();
            state.exchanges += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(AdapterError::Transport(format!(
                    "connection reset during {}",
                    request.command
                )));
            }
            let user = state
                .current
                .clone()
                .ok_or_else(|| AdapterError::Malformed("HTTP 401 Unauthorized: no credentials".to_string()))?;

            let (response, raw) = state.dispatch(&user, request, cursor.unwrap_or_default(), now);
            state.last_raw = Some(raw);
            Ok(response)
        })
    }

    fn last_raw_response(&self) -> Option<RawResponse> {
        self.state().last_raw.clone()
    }
}

impl SutControl for MemoryAdapter {
    fn delete_device(&self, user_name: &str, device_id: &str) -> HarnessFuture<'_, ()> {
        let result = {
            let mut state = self.state();
            match state.mailboxes.get_mut(user_name) {
                Some(mailbox) => {
                    mailbox.reset_partnership();
                    state
                        .deleted_devices
                        .push((user_name.to_string(), device_id.to_string()));
                    Ok(())
                }
                None => Err(HarnessError::sut("delete_device", format!("no mailbox for {}", user_name))),
            }
        };
        Box::pin(async move { result })
    }

    fn mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
    ) -> HarnessFuture<'_, FolderPermission> {
        let key = (owner_user.to_string(), folder.to_string(), delegate.to_string());
        let permission = self
            .state()
            .permissions
            .get(&key)
            .cloned()
            .unwrap_or(FolderPermission::None);
        Box::pin(async move { Ok(permission) })
    }

    fn set_mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
        permission: FolderPermission,
    ) -> HarnessFuture<'_, ()> {
        let result = {
            let mut state = self.state();
            if !state.mailboxes.contains_key(owner_user) || !state.mailboxes.contains_key(delegate) {
                Err(HarnessError::sut(
                    "set_mailbox_folder_permission",
                    format!("unknown user {} or {}", owner_user, delegate),
                ))
            } else {
                let key = (owner_user.to_string(), folder.to_string(), delegate.to_string());
                if permission == FolderPermission::None {
                    state.permissions.remove(&key);
                } else {
                    state.permissions.insert(key, permission);
                }
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}
