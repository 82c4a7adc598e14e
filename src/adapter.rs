// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol adapter seam.
//!
//! The adapter owns the wire: it encodes [`Request`]s for the server under
//! test, sends them with the current identity's credentials and device
//! context, and decodes the reply into a [`Response`]. The harness never sees
//! transport details beyond [`AdapterError`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conformance_harness::adapter::{AdapterError, BoxFuture, ProtocolAdapter};
//! use conformance_harness::protocol::*;
//! use conformance_harness::status::Status;
//!
//! struct Offline;
//!
//! impl ProtocolAdapter for Offline {
//!     fn switch_identity(&self, _owner: &Owner, _credentials: &Credentials) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn set_client_context(&self, _context: ClientContext) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn execute(&self, request: Request, _cursor: Option<Cursor>) -> BoxFuture<'_, Response> {
//!         Box::pin(async move {
//!             Err(AdapterError::Transport(format!("{} while offline", request.command)))
//!         })
//!     }
//!
//!     fn last_raw_response(&self) -> Option<RawResponse> {
//!         None
//!     }
//! }
//! ```

use crate::error::HarnessError;
use crate::protocol::{ClientContext, Command, Credentials, Cursor, Owner, RawResponse, Request, Response};
use crate::status::StatusParseError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = AdapterResult<T>> + Send + 'a>>;

/// Failure below the protocol layer.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Connection refused/reset, TLS failure, HTTP 5xx without a body.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered but the reply could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Status(#[from] StatusParseError),

    #[error("no credentials for {0}")]
    UnknownIdentity(Owner),
}

impl AdapterError {
    /// Whether retrying the same exchange may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Translate into the harness taxonomy for an exchange of `command`.
    pub fn into_harness(self, command: Command) -> HarnessError {
        match self {
            Self::Transport(message) => HarnessError::transport(command, message),
            Self::Timeout(after) => {
                HarnessError::transport(command, format!("timed out after {:?}", after))
            }
            Self::Malformed(message) => HarnessError::Adapter { command, message },
            Self::Status(e) => HarnessError::StatusParse(e),
            Self::UnknownIdentity(owner) => HarnessError::UnknownIdentity(owner),
        }
    }
}

/// What the harness needs from a protocol client.
///
/// Implementations hold the current identity and device context; the session
/// serializes exchanges so an adapter never sees two requests for the same
/// (identity, collection) at once.
pub trait ProtocolAdapter: Send + Sync + 'static {
    /// Use `credentials` for subsequent exchanges.
    fn switch_identity(&self, owner: &Owner, credentials: &Credentials) -> BoxFuture<'_, ()>;

    /// Device id, device type and policy key sent with subsequent exchanges.
    fn set_client_context(&self, context: ClientContext) -> BoxFuture<'_, ()>;

    /// Perform one exchange.
    ///
    /// `cursor` is `Some` for cursor-bearing commands and is sent verbatim.
    /// A well-formed reply is `Ok` whatever its status.
    fn execute(&self, request: Request, cursor: Option<Cursor>) -> BoxFuture<'_, Response>;

    /// The undecoded form of the most recent exchange, for scenarios that
    /// inspect multipart segments or headers.
    fn last_raw_response(&self) -> Option<RawResponse>;
}

impl<A: ProtocolAdapter> ProtocolAdapter for Arc<A> {
    fn switch_identity(&self, owner: &Owner, credentials: &Credentials) -> BoxFuture<'_, ()> {
        (**self).switch_identity(owner, credentials)
    }

    fn set_client_context(&self, context: ClientContext) -> BoxFuture<'_, ()> {
        (**self).set_client_context(context)
    }

    fn execute(&self, request: Request, cursor: Option<Cursor>) -> BoxFuture<'_, Response> {
        (**self).execute(request, cursor)
    }

    fn last_raw_response(&self) -> Option<RawResponse> {
        (**self).last_raw_response()
    }
}
