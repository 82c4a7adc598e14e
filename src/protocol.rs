// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured request/response model.
//!
//! This is the abstraction the harness drives, not a schema binding: the
//! adapter owns the wire encoding and translates these types to and from
//! whatever the server under test speaks.
//!
//! # Cursors
//!
//! A [`Cursor`] is opaque. The reserved zero token (`"0"`) means "no prior
//! state" and asks the server to start over. Anything else must be echoed back
//! verbatim on the next exchange for the same (owner, collection).
//!
//! The folder hierarchy has a cursor of its own, stored under
//! [`CollectionId::hierarchy()`]. Commands that mutate or read the hierarchy
//! ([`Command::uses_hierarchy_cursor()`]) use that cursor regardless of the
//! collection they address.

use crate::error::{HarnessError, Result};
use crate::status::{CursorScope, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity label (e.g. `"U1"`), as configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Owner {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Owner {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const HIERARCHY_ID: &str = "#hierarchy";

/// Server-assigned collection (folder) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Reserved identifier under which the folder hierarchy cursor lives.
    pub fn hierarchy() -> Self {
        Self(HIERARCHY_ID.to_string())
    }

    /// Parent id of top-level folders.
    pub fn root() -> Self {
        Self("0".to_string())
    }

    pub fn is_hierarchy(&self) -> bool {
        self.0 == HIERARCHY_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CollectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque synchronization cursor ("sync key").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// The reserved zero token.
    pub const ZERO: &'static str = "0";

    pub fn zero() -> Self {
        Self(Self::ZERO.to_string())
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol commands the harness can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    Sync,
    FolderSync,
    FolderCreate,
    FolderDelete,
    FolderUpdate,
    GetItemEstimate,
    ItemOperations,
    MeetingResponse,
    Settings,
    Find,
    MoveItems,
    SendMail,
    SmartReply,
    SmartForward,
    Search,
    Ping,
    Provision,
    ResolveRecipients,
}

impl Command {
    pub const ALL: [Command; 18] = [
        Command::Sync,
        Command::FolderSync,
        Command::FolderCreate,
        Command::FolderDelete,
        Command::FolderUpdate,
        Command::GetItemEstimate,
        Command::ItemOperations,
        Command::MeetingResponse,
        Command::Settings,
        Command::Find,
        Command::MoveItems,
        Command::SendMail,
        Command::SmartReply,
        Command::SmartForward,
        Command::Search,
        Command::Ping,
        Command::Provision,
        Command::ResolveRecipients,
    ];

    /// Whether requests for this command carry a cursor.
    pub fn is_cursor_bearing(self) -> bool {
        matches!(
            self,
            Command::Sync
                | Command::GetItemEstimate
                | Command::FolderSync
                | Command::FolderCreate
                | Command::FolderDelete
                | Command::FolderUpdate
        )
    }

    /// Whether the command's cursor is the folder hierarchy cursor.
    pub fn uses_hierarchy_cursor(self) -> bool {
        matches!(
            self,
            Command::FolderSync | Command::FolderCreate | Command::FolderDelete | Command::FolderUpdate
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Sync => "Sync",
            Command::FolderSync => "FolderSync",
            Command::FolderCreate => "FolderCreate",
            Command::FolderDelete => "FolderDelete",
            Command::FolderUpdate => "FolderUpdate",
            Command::GetItemEstimate => "GetItemEstimate",
            Command::ItemOperations => "ItemOperations",
            Command::MeetingResponse => "MeetingResponse",
            Command::Settings => "Settings",
            Command::Find => "Find",
            Command::MoveItems => "MoveItems",
            Command::SendMail => "SendMail",
            Command::SmartReply => "SmartReply",
            Command::SmartForward => "SmartForward",
            Command::Search => "Search",
            Command::Ping => "Ping",
            Command::Provision => "Provision",
            Command::ResolveRecipients => "ResolveRecipients",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logon credentials for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
    pub domain: String,
}

/// Per-device request context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub device_id: String,
    pub device_type: String,
    pub policy_key: Option<String>,
}

/// Field an item is identified by at teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyField {
    Subject,
    /// Contacts are identified by their file-as name.
    FileAs,
    Named(String),
}

impl KeyField {
    pub fn name(&self) -> &str {
        match self {
            KeyField::Subject => "Subject",
            KeyField::FileAs => "FileAs",
            KeyField::Named(name) => name,
        }
    }
}

/// Stable, test-chosen identifier of an item (`Subject = "S1"`).
///
/// Server ids are unstable across moves and resyncs, so artifacts are tracked
/// by key and resolved to a server id only when needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub field: KeyField,
    pub value: String,
}

impl ItemKey {
    pub fn new(field: KeyField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn subject(value: impl Into<String>) -> Self {
        Self::new(KeyField::Subject, value)
    }

    pub fn file_as(value: impl Into<String>) -> Self {
        Self::new(KeyField::FileAs, value)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field.name(), self.value)
    }
}

/// A synchronized item as the harness sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub server_id: String,
    pub fields: BTreeMap<String, String>,
}

impl Item {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn matches(&self, key: &ItemKey) -> bool {
        self.field(key.field.name()) == Some(key.value.as_str())
    }
}

/// FolderSync folder type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderType {
    UserGeneric,
    Inbox,
    Drafts,
    DeletedItems,
    SentItems,
    Outbox,
    Tasks,
    Calendar,
    Contacts,
    Notes,
    Journal,
    UserMail,
    UserCalendar,
    UserContacts,
    UserTasks,
    UserJournal,
    UserNotes,
    Unknown,
    RecipientInformationCache,
}

impl FolderType {
    const CODES: [FolderType; 19] = [
        FolderType::UserGeneric,
        FolderType::Inbox,
        FolderType::Drafts,
        FolderType::DeletedItems,
        FolderType::SentItems,
        FolderType::Outbox,
        FolderType::Tasks,
        FolderType::Calendar,
        FolderType::Contacts,
        FolderType::Notes,
        FolderType::Journal,
        FolderType::UserMail,
        FolderType::UserCalendar,
        FolderType::UserContacts,
        FolderType::UserTasks,
        FolderType::UserJournal,
        FolderType::UserNotes,
        FolderType::Unknown,
        FolderType::RecipientInformationCache,
    ];

    /// Wire code (`1..=19`).
    pub fn code(self) -> u8 {
        Self::CODES
            .iter()
            .position(|t| *t == self)
            .map(|i| i as u8 + 1)
            .unwrap_or(18)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::CODES.get(usize::from(code).checked_sub(1)?).copied()
    }

    /// Default folders every mailbox has.
    pub fn is_well_known(self) -> bool {
        !matches!(
            self,
            FolderType::UserGeneric
                | FolderType::UserMail
                | FolderType::UserCalendar
                | FolderType::UserContacts
                | FolderType::UserTasks
                | FolderType::UserJournal
                | FolderType::UserNotes
                | FolderType::Unknown
        )
    }
}

/// A folder in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub server_id: CollectionId,
    pub parent_id: CollectionId,
    pub display_name: String,
    pub folder_type: FolderType,
}

/// Out-of-office state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OofMode {
    #[default]
    Disabled,
    Global,
    TimeBased {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OofSettings {
    pub mode: OofMode,
    pub reply_message: Option<String>,
}

impl OofSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != OofMode::Disabled
    }
}

/// Operations carried inside a Sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Add {
        client_id: String,
        fields: BTreeMap<String, String>,
    },
    Change {
        server_id: String,
        fields: BTreeMap<String, String>,
    },
    Delete {
        server_id: String,
    },
    Fetch {
        server_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub get_changes: bool,
    pub window_size: Option<u32>,
    /// `false` deletes permanently instead of moving to Deleted Items.
    pub deletes_as_moves: bool,
    pub commands: Vec<SyncCommand>,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            get_changes: true,
            window_size: None,
            deletes_as_moves: true,
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Recipient user names.
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub save_in_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingReply {
    Accepted,
    Tentative,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveSpec {
    pub server_id: String,
    pub source: CollectionId,
    pub destination: CollectionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsRequest {
    GetOof,
    SetOof(OofSettings),
}

/// Command-specific request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Commands addressed by collection and cursor alone.
    Empty,
    Sync(SyncRequest),
    FolderCreate {
        parent_id: CollectionId,
        display_name: String,
        folder_type: FolderType,
    },
    FolderDelete {
        server_id: CollectionId,
    },
    FolderUpdate {
        server_id: CollectionId,
        parent_id: CollectionId,
        display_name: String,
    },
    ItemOperations {
        server_ids: Vec<String>,
        multipart: bool,
    },
    MeetingResponse {
        request_id: String,
        reply: MeetingReply,
    },
    Settings(SettingsRequest),
    Find {
        key: ItemKey,
        range: (u32, u32),
    },
    MoveItems(Vec<MoveSpec>),
    SendMail(MailMessage),
    /// Commands the structured model does not type; the adapter interprets
    /// the fields.
    Opaque(BTreeMap<String, String>),
}

/// A request handed to the session.
///
/// The cursor is not part of the request: the session supplies it from the
/// cursor store, or the caller supplies it explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub collection: Option<CollectionId>,
    pub body: RequestBody,
}

impl Request {
    pub fn new(command: Command, collection: Option<CollectionId>, body: RequestBody) -> Self {
        Self {
            command,
            collection,
            body,
        }
    }

    pub fn sync(collection: CollectionId, sync: SyncRequest) -> Self {
        Self::new(Command::Sync, Some(collection), RequestBody::Sync(sync))
    }

    pub fn folder_sync() -> Self {
        Self::new(Command::FolderSync, None, RequestBody::Empty)
    }

    pub fn item_estimate(collection: CollectionId) -> Self {
        Self::new(Command::GetItemEstimate, Some(collection), RequestBody::Empty)
    }

    /// The (owner-relative) collection whose cursor this request uses.
    pub fn cursor_collection(&self) -> Option<CollectionId> {
        if !self.command.is_cursor_bearing() {
            return None;
        }
        if self.command.uses_hierarchy_cursor() {
            return Some(CollectionId::hierarchy());
        }
        self.collection.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncResponse {
    pub adds: Vec<Item>,
    pub changes: Vec<Item>,
    pub deletes: Vec<String>,
    pub fetched: Vec<Item>,
    /// (client id, server id) for each accepted Add.
    pub added: Vec<(String, String)>,
    pub more_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FolderSyncResponse {
    pub adds: Vec<Folder>,
    pub updates: Vec<Folder>,
    pub deletes: Vec<CollectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    pub source_id: String,
    pub status: Status,
    pub destination_id: Option<String>,
}

/// Command-specific response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Sync(SyncResponse),
    FolderSync(FolderSyncResponse),
    FolderCreate { server_id: CollectionId },
    Estimate { count: u32 },
    ItemOperations { items: Vec<Item> },
    MeetingResponse { calendar_id: Option<String> },
    Oof(OofSettings),
    Find { items: Vec<Item>, total: u32 },
    MoveItems(Vec<MoveResult>),
    Opaque(BTreeMap<String, String>),
}

/// A well-formed response.
///
/// Carries its status untouched; expected-failure scenarios assert on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: Command,
    pub status: Status,
    pub collection: Option<CollectionId>,
    pub cursor: Option<Cursor>,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(command: Command, status: Status) -> Self {
        Self {
            command,
            status,
            collection: None,
            cursor: None,
            body: ResponseBody::Empty,
        }
    }

    pub fn with_collection(mut self, collection: CollectionId) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    /// Demand success.
    ///
    /// A cursor-state status becomes [`HarnessError::CursorState`] for the
    /// collection whose cursor was rejected; any other failure becomes
    /// [`HarnessError::Status`].
    pub fn ensure_success(self, owner: &Owner) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        match self.status.cursor_scope() {
            Some(CursorScope::Hierarchy) => Err(HarnessError::CursorState {
                owner: owner.clone(),
                collection: CollectionId::hierarchy(),
                status: self.status,
            }),
            Some(CursorScope::Collection) => Err(HarnessError::CursorState {
                owner: owner.clone(),
                collection: self
                    .collection
                    .clone()
                    .unwrap_or_else(CollectionId::hierarchy),
                status: self.status,
            }),
            None => Err(HarnessError::Status {
                command: self.command,
                status: self.status,
            }),
        }
    }

    pub fn sync(&self) -> Option<&SyncResponse> {
        match &self.body {
            ResponseBody::Sync(sync) => Some(sync),
            _ => None,
        }
    }

    pub fn folder_sync(&self) -> Option<&FolderSyncResponse> {
        match &self.body {
            ResponseBody::FolderSync(hierarchy) => Some(hierarchy),
            _ => None,
        }
    }

    pub fn items(&self) -> &[Item] {
        match &self.body {
            ResponseBody::Sync(sync) => &sync.adds,
            ResponseBody::ItemOperations { items } => items,
            ResponseBody::Find { items, .. } => items,
            _ => &[],
        }
    }
}

/// Byte span of one part of a multipart response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    pub offset: usize,
    pub len: usize,
}

/// The last raw exchange as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResponse {
    pub http_status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub parts: Vec<PartSpan>,
}

impl RawResponse {
    /// Header value, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Bytes of part `index`, or `None` when out of range or the span does
    /// not fit in the body.
    pub fn part(&self, index: usize) -> Option<&[u8]> {
        let span = self.parts.get(index)?;
        let end = span.offset.checked_add(span.len)?;
        self.body.get(span.offset..end)
    }
}
