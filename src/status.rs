// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol status codes.
//!
//! A status code only has meaning relative to the command that returned it:
//! `3` is a stale cursor for Sync, success for MoveItems and "not primed" for
//! GetItemEstimate. Every command therefore has a closed table of the codes it
//! may return, and [`Status::parse()`] is the only way to turn the wire value
//! into a [`Status`]. Scenarios compare `Status` values, never strings or
//! integers.
//!
//! Codes `101..=177` are the protocol-wide common status codes and are valid
//! for every command.
//!
//! ```rust
//! use conformance_harness::protocol::Command;
//! use conformance_harness::status::Status;
//!
//! assert_eq!(Status::parse(Command::Sync, "3").unwrap(), Status::InvalidCursor);
//! assert_eq!(Status::parse(Command::MoveItems, "3").unwrap(), Status::Success);
//! assert!(Status::parse(Command::Sync, "2").is_err());
//! ```

use crate::protocol::Command;
use std::fmt;
use thiserror::Error;

/// Error turning a wire status value into a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusParseError {
    /// The value is not a decimal integer.
    #[error("status '{raw}' for {command} is not numeric")]
    NotNumeric { command: Command, raw: String },

    /// The command does not define this code.
    #[error("{command} does not define status code {code}")]
    UnknownCode { command: Command, code: u16 },
}

/// Which cursor a cursor-state status invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorScope {
    /// The cursor of the collection the request addressed.
    Collection,
    /// The folder hierarchy cursor.
    Hierarchy,
}

/// Canonical protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// Ping: changes are waiting in at least one monitored folder.
    ChangesAvailable,

    // Cursor state
    InvalidCursor,
    CursorNotPrimed,
    HierarchyOutOfDate,
    HierarchyChanged,

    // General request/server failures
    ProtocolError,
    ServerError,
    ConversionError,
    Conflict,
    ObjectNotFound,
    CannotComplete,
    IncompleteRequest,
    InvalidInterval,
    InvalidRequest,
    Retry,
    Timeout,
    MalformedRequest,
    UnknownError,
    UnusualBackendIssue,

    // Folder hierarchy
    FolderExists,
    SpecialFolder,
    ParentNotFound,
    FolderNotFound,
    InvalidCollection,

    // ItemOperations
    BadDocumentUri,
    DocumentAccessDenied,
    ConnectionFailed,
    InvalidByteRange,
    UnknownStore,
    EmptyFile,
    DataTooLarge,
    IoFailure,
    InvalidAttachment,
    AccessDenied,
    PartialSuccess,
    CredentialsRequired,

    // MeetingResponse / Settings
    MailboxError,
    ServerUnavailable,
    InvalidArguments,
    ConflictingArguments,
    DeniedByPolicy,

    // Find / Search
    InvalidRange,
    QueryTooComplex,
    EndOfRange,
    AccessBlocked,

    // MoveItems
    InvalidSource,
    InvalidDestination,
    SameFolder,
    DuplicateDestination,
    ItemLocked,

    // Ping
    MissingParameters,
    SyntaxError,
    InvalidHeartbeat,
    TooManyFolders,

    /// Protocol-wide common status (`101..=177`).
    Common(CommonStatus),
}

use Status::*;

const SYNC: &[(u16, Status)] = &[
    (1, Success),
    (3, InvalidCursor),
    (4, ProtocolError),
    (5, ServerError),
    (6, ConversionError),
    (7, Conflict),
    (8, ObjectNotFound),
    (9, CannotComplete),
    (12, HierarchyChanged),
    (13, IncompleteRequest),
    (14, InvalidInterval),
    (15, InvalidRequest),
    (16, Retry),
];

const FOLDER_SYNC: &[(u16, Status)] = &[
    (1, Success),
    (6, ServerError),
    (8, Timeout),
    (9, InvalidCursor),
    (10, MalformedRequest),
    (11, UnknownError),
    (12, UnusualBackendIssue),
];

const FOLDER_CREATE: &[(u16, Status)] = &[
    (1, Success),
    (2, FolderExists),
    (3, SpecialFolder),
    (5, ParentNotFound),
    (6, ServerError),
    (8, Timeout),
    (9, InvalidCursor),
    (10, MalformedRequest),
    (11, UnknownError),
    (12, UnusualBackendIssue),
];

const FOLDER_DELETE: &[(u16, Status)] = &[
    (1, Success),
    (3, SpecialFolder),
    (4, FolderNotFound),
    (6, ServerError),
    (9, InvalidCursor),
    (10, MalformedRequest),
    (11, UnknownError),
];

const FOLDER_UPDATE: &[(u16, Status)] = &[
    (1, Success),
    (2, FolderExists),
    (3, SpecialFolder),
    (4, FolderNotFound),
    (5, ParentNotFound),
    (6, ServerError),
    (9, InvalidCursor),
    (10, MalformedRequest),
    (11, UnknownError),
];

const GET_ITEM_ESTIMATE: &[(u16, Status)] = &[
    (1, Success),
    (2, InvalidCollection),
    (3, CursorNotPrimed),
    (4, InvalidCursor),
];

const ITEM_OPERATIONS: &[(u16, Status)] = &[
    (1, Success),
    (2, ProtocolError),
    (3, ServerError),
    (4, BadDocumentUri),
    (5, DocumentAccessDenied),
    (6, ObjectNotFound),
    (7, ConnectionFailed),
    (8, InvalidByteRange),
    (9, UnknownStore),
    (10, EmptyFile),
    (11, DataTooLarge),
    (12, IoFailure),
    (14, ConversionError),
    (15, InvalidAttachment),
    (16, AccessDenied),
    (17, PartialSuccess),
    (18, CredentialsRequired),
];

const MEETING_RESPONSE: &[(u16, Status)] = &[
    (1, Success),
    (2, InvalidRequest),
    (3, MailboxError),
    (4, ServerError),
];

const SETTINGS: &[(u16, Status)] = &[
    (1, Success),
    (2, ProtocolError),
    (3, AccessDenied),
    (4, ServerUnavailable),
    (5, InvalidArguments),
    (6, ConflictingArguments),
    (7, DeniedByPolicy),
];

const FIND: &[(u16, Status)] = &[
    (1, Success),
    (2, InvalidRequest),
    (3, HierarchyOutOfDate),
    (4, InvalidRange),
];

const MOVE_ITEMS: &[(u16, Status)] = &[
    (1, InvalidSource),
    (2, InvalidDestination),
    (3, Success),
    (4, SameFolder),
    (5, DuplicateDestination),
    (7, ItemLocked),
];

const SEARCH: &[(u16, Status)] = &[
    (1, Success),
    (2, InvalidRequest),
    (3, ServerError),
    (4, BadDocumentUri),
    (5, AccessDenied),
    (6, ObjectNotFound),
    (7, ConnectionFailed),
    (8, QueryTooComplex),
    (10, Timeout),
    (11, HierarchyOutOfDate),
    (12, EndOfRange),
    (13, AccessBlocked),
    (14, CredentialsRequired),
];

const PING: &[(u16, Status)] = &[
    (1, Success),
    (2, ChangesAvailable),
    (3, MissingParameters),
    (4, SyntaxError),
    (5, InvalidHeartbeat),
    (6, TooManyFolders),
    (7, HierarchyOutOfDate),
    (8, ServerError),
];

const PROVISION: &[(u16, Status)] = &[(1, Success), (2, ProtocolError), (3, ServerError)];

const RESOLVE_RECIPIENTS: &[(u16, Status)] = &[(1, Success), (5, ProtocolError), (6, ServerError)];

// SendMail, SmartReply and SmartForward report success with an empty body;
// their failures are all common status codes.
const MAIL_SUBMISSION: &[(u16, Status)] = &[(1, Success)];

fn table(command: Command) -> &'static [(u16, Status)] {
    match command {
        Command::Sync => SYNC,
        Command::FolderSync => FOLDER_SYNC,
        Command::FolderCreate => FOLDER_CREATE,
        Command::FolderDelete => FOLDER_DELETE,
        Command::FolderUpdate => FOLDER_UPDATE,
        Command::GetItemEstimate => GET_ITEM_ESTIMATE,
        Command::ItemOperations => ITEM_OPERATIONS,
        Command::MeetingResponse => MEETING_RESPONSE,
        Command::Settings => SETTINGS,
        Command::Find => FIND,
        Command::MoveItems => MOVE_ITEMS,
        Command::Search => SEARCH,
        Command::Ping => PING,
        Command::Provision => PROVISION,
        Command::ResolveRecipients => RESOLVE_RECIPIENTS,
        Command::SendMail | Command::SmartReply | Command::SmartForward => MAIL_SUBMISSION,
    }
}

impl Status {
    /// Parse a wire status value for `command`.
    ///
    /// This is the single canonical conversion from wire text to [`Status`].
    pub fn parse(command: Command, raw: &str) -> Result<Self, StatusParseError> {
        let code: u16 = raw
            .trim()
            .parse()
            .map_err(|_| StatusParseError::NotNumeric {
                command,
                raw: raw.to_string(),
            })?;
        Self::from_code(command, code)
    }

    /// Look up a numeric status code for `command`.
    pub fn from_code(command: Command, code: u16) -> Result<Self, StatusParseError> {
        if let Some(common) = CommonStatus::from_code(code) {
            return Ok(Common(common));
        }
        table(command)
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, status)| *status)
            .ok_or(StatusParseError::UnknownCode { command, code })
    }

    /// The wire code of this status for `command`, if the command defines it.
    pub fn code(self, command: Command) -> Option<u16> {
        if let Common(common) = self {
            return Some(common.code());
        }
        table(command)
            .iter()
            .find(|(_, status)| *status == self)
            .map(|(code, _)| *code)
    }

    /// Whether the command completed.
    pub fn is_success(self) -> bool {
        matches!(self, Success | ChangesAvailable)
    }

    /// Which cursor this status invalidates, if any.
    pub fn cursor_scope(self) -> Option<CursorScope> {
        match self {
            InvalidCursor | CursorNotPrimed => Some(CursorScope::Collection),
            Common(
                CommonStatus::SyncStateNotFound
                | CommonStatus::SyncStateCorrupt
                | CommonStatus::SyncStateVersionInvalid,
            ) => Some(CursorScope::Collection),
            HierarchyOutOfDate | HierarchyChanged => Some(CursorScope::Hierarchy),
            _ => None,
        }
    }

    /// Whether the server asked the client to try again later.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Retry | ServerUnavailable | Common(CommonStatus::ServerErrorRetryLater)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Common(common) => write!(f, "{:?} ({})", common, common.code()),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Protocol-wide status codes shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommonStatus {
    InvalidContent,
    InvalidWbxml,
    InvalidXml,
    InvalidDateTime,
    InvalidCombinationOfIds,
    InvalidIds,
    InvalidMime,
    DeviceIdMissingOrInvalid,
    DeviceTypeMissingOrInvalid,
    ServerError,
    ServerErrorRetryLater,
    ActiveDirectoryAccessDenied,
    MailboxQuotaExceeded,
    MailboxServerOffline,
    SendQuotaExceeded,
    MessageRecipientUnresolved,
    MessageReplyNotAllowed,
    MessagePreviouslySent,
    MessageHasNoRecipient,
    MailSubmissionFailed,
    MessageReplyFailed,
    AttachmentIsTooLarge,
    UserHasNoMailbox,
    UserCannotBeAnonymous,
    UserPrincipalCouldNotBeFound,
    UserDisabledForSync,
    UserOnNewMailboxCannotSync,
    UserOnLegacyMailboxCannotSync,
    DeviceIsBlockedForThisUser,
    AccessDenied,
    AccountDisabled,
    SyncStateNotFound,
    SyncStateLocked,
    SyncStateCorrupt,
    SyncStateAlreadyExists,
    SyncStateVersionInvalid,
    CommandNotSupported,
    VersionNotSupported,
    DeviceNotFullyProvisionable,
    RemoteWipeRequested,
    LegacyDeviceOnStrictPolicy,
    DeviceNotProvisioned,
    PolicyRefresh,
    InvalidPolicyKey,
    ExternallyManagedDevicesNotAllowed,
    NoRecurrenceInCalendar,
    UnexpectedItemClass,
    RemoteServerHasNoSsl,
    InvalidStoredRequest,
    ItemNotFound,
    TooManyFolders,
    NoFoldersFound,
    ItemsLostAfterMove,
    FailureInMoveOperation,
    MoveCommandDisallowedForNonPersistentMoveAction,
    MoveCommandInvalidDestinationFolder,
    AvailabilityTooManyRecipients,
    AvailabilityDlLimitReached,
    AvailabilityTransientFailure,
    AvailabilityFailure,
    BodyPartPreferenceTypeNotSupported,
    DeviceInformationRequired,
    InvalidAccountId,
    AccountSendDisabled,
    IrmFeatureDisabled,
    IrmTransientError,
    IrmPermanentError,
    IrmInvalidTemplateId,
    IrmOperationNotPermitted,
    NoPicture,
    PictureTooLarge,
    PictureLimitReached,
    BodyPartConversationTooLarge,
    MaximumDevicesReached,
}

const COMMON: &[(u16, CommonStatus)] = &[
    (101, CommonStatus::InvalidContent),
    (102, CommonStatus::InvalidWbxml),
    (103, CommonStatus::InvalidXml),
    (104, CommonStatus::InvalidDateTime),
    (105, CommonStatus::InvalidCombinationOfIds),
    (106, CommonStatus::InvalidIds),
    (107, CommonStatus::InvalidMime),
    (108, CommonStatus::DeviceIdMissingOrInvalid),
    (109, CommonStatus::DeviceTypeMissingOrInvalid),
    (110, CommonStatus::ServerError),
    (111, CommonStatus::ServerErrorRetryLater),
    (112, CommonStatus::ActiveDirectoryAccessDenied),
    (113, CommonStatus::MailboxQuotaExceeded),
    (114, CommonStatus::MailboxServerOffline),
    (115, CommonStatus::SendQuotaExceeded),
    (116, CommonStatus::MessageRecipientUnresolved),
    (117, CommonStatus::MessageReplyNotAllowed),
    (118, CommonStatus::MessagePreviouslySent),
    (119, CommonStatus::MessageHasNoRecipient),
    (120, CommonStatus::MailSubmissionFailed),
    (121, CommonStatus::MessageReplyFailed),
    (122, CommonStatus::AttachmentIsTooLarge),
    (123, CommonStatus::UserHasNoMailbox),
    (124, CommonStatus::UserCannotBeAnonymous),
    (125, CommonStatus::UserPrincipalCouldNotBeFound),
    (126, CommonStatus::UserDisabledForSync),
    (127, CommonStatus::UserOnNewMailboxCannotSync),
    (128, CommonStatus::UserOnLegacyMailboxCannotSync),
    (129, CommonStatus::DeviceIsBlockedForThisUser),
    (130, CommonStatus::AccessDenied),
    (131, CommonStatus::AccountDisabled),
    (132, CommonStatus::SyncStateNotFound),
    (133, CommonStatus::SyncStateLocked),
    (134, CommonStatus::SyncStateCorrupt),
    (135, CommonStatus::SyncStateAlreadyExists),
    (136, CommonStatus::SyncStateVersionInvalid),
    (137, CommonStatus::CommandNotSupported),
    (138, CommonStatus::VersionNotSupported),
    (139, CommonStatus::DeviceNotFullyProvisionable),
    (140, CommonStatus::RemoteWipeRequested),
    (141, CommonStatus::LegacyDeviceOnStrictPolicy),
    (142, CommonStatus::DeviceNotProvisioned),
    (143, CommonStatus::PolicyRefresh),
    (144, CommonStatus::InvalidPolicyKey),
    (145, CommonStatus::ExternallyManagedDevicesNotAllowed),
    (146, CommonStatus::NoRecurrenceInCalendar),
    (147, CommonStatus::UnexpectedItemClass),
    (148, CommonStatus::RemoteServerHasNoSsl),
    (149, CommonStatus::InvalidStoredRequest),
    (150, CommonStatus::ItemNotFound),
    (151, CommonStatus::TooManyFolders),
    (152, CommonStatus::NoFoldersFound),
    (153, CommonStatus::ItemsLostAfterMove),
    (154, CommonStatus::FailureInMoveOperation),
    (155, CommonStatus::MoveCommandDisallowedForNonPersistentMoveAction),
    (156, CommonStatus::MoveCommandInvalidDestinationFolder),
    (160, CommonStatus::AvailabilityTooManyRecipients),
    (161, CommonStatus::AvailabilityDlLimitReached),
    (162, CommonStatus::AvailabilityTransientFailure),
    (163, CommonStatus::AvailabilityFailure),
    (164, CommonStatus::BodyPartPreferenceTypeNotSupported),
    (165, CommonStatus::DeviceInformationRequired),
    (166, CommonStatus::InvalidAccountId),
    (167, CommonStatus::AccountSendDisabled),
    (168, CommonStatus::IrmFeatureDisabled),
    (169, CommonStatus::IrmTransientError),
    (170, CommonStatus::IrmPermanentError),
    (171, CommonStatus::IrmInvalidTemplateId),
    (172, CommonStatus::IrmOperationNotPermitted),
    (173, CommonStatus::NoPicture),
    (174, CommonStatus::PictureTooLarge),
    (175, CommonStatus::PictureLimitReached),
    (176, CommonStatus::BodyPartConversationTooLarge),
    (177, CommonStatus::MaximumDevicesReached),
];

impl CommonStatus {
    /// Look up a common status by code.
    pub fn from_code(code: u16) -> Option<Self> {
        COMMON.iter().find(|(c, _)| *c == code).map(|(_, s)| *s)
    }

    /// Wire code.
    pub fn code(self) -> u16 {
        COMMON
            .iter()
            .find(|(_, s)| *s == self)
            .map(|(c, _)| *c)
            .unwrap_or(0)
    }
}
