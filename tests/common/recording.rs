//! Recording ProtocolAdapter for testing.
//!
//! Forwards every call to the in-memory server and records it for
//! assertions. Transport failures and forced statuses can be injected.

use conformance_harness::adapter::{AdapterError, BoxFuture};
use conformance_harness::protocol::{RequestBody, SyncCommand};
use conformance_harness::{
    ClientContext, Command, Credentials, Cursor, MemoryAdapter, Owner, ProtocolAdapter, Request, Response, Status,
};
use conformance_harness::protocol::RawResponse;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A recorded execute() call.
#[derive(Debug, Clone)]
pub struct ExchangeCall {
    pub owner: Option<Owner>,
    pub command: Command,
    pub request: Request,
    pub cursor: Option<Cursor>,
}

impl ExchangeCall {
    /// Number of Sync Delete commands carried.
    pub fn deletes(&self) -> usize {
        match &self.request.body {
            RequestBody::Sync(sync) => sync
                .commands
                .iter()
                .filter(|c| matches!(c, SyncCommand::Delete { .. }))
                .count(),
            _ => 0,
        }
    }
}

/// Adapter that records all calls before delegating.
///
/// # Example
/// ```rust,ignore
/// let recorder = Arc::new(RecordingAdapter::new(server.clone()));
///
/// // Inject two connection resets
/// recorder.fail_next(2);
///
/// // Use in a scenario...
///
/// assert_eq!(recorder.delete_commands(), 0);
/// ```
pub struct RecordingAdapter {
    inner: Arc<MemoryAdapter>,
    current: Mutex<Option<Owner>>,
    calls: Mutex<Vec<ExchangeCall>>,
    /// Transport failures still to inject
    failures: AtomicUsize,
    /// Fail every exchange after this many have succeeded
    fail_after: AtomicUsize,
    succeeded: AtomicUsize,
    /// Statuses returned instead of calling the server
    forced: Mutex<VecDeque<Status>>,
}

impl RecordingAdapter {
    pub fn new(inner: Arc<MemoryAdapter>) -> Self {
        Self {
            inner,
            current: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
            succeeded: AtomicUsize::new(0),
            forced: Mutex::new(VecDeque::new()),
        }
    }

    pub fn server(&self) -> &Arc<MemoryAdapter> {
        &self.inner
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next `n` exchanges with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Let `n` more exchanges through, then fail all of them.
    #[allow(dead_code)]
    pub fn fail_after(&self, n: usize) {
        self.succeeded.store(0, Ordering::SeqCst);
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Answer the next exchange with `status` without reaching the server.
    #[allow(dead_code)]
    pub fn force_status(&self, status: Status) {
        self.forced.lock().unwrap().push_back(status);
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    pub fn calls(&self) -> Vec<ExchangeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, command: Command) -> Vec<ExchangeCall> {
        self.calls().into_iter().filter(|c| c.command == command).collect()
    }

    /// Total Sync Delete commands sent.
    pub fn delete_commands(&self) -> usize {
        self.calls().iter().map(ExchangeCall::deletes).sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl ProtocolAdapter for RecordingAdapter {
    fn switch_identity(&self, owner: &Owner, credentials: &Credentials) -> BoxFuture<'_, ()> {
        let owner = owner.clone();
        let credentials = credentials.clone();
        Box::pin(async move {
            self.inner.switch_identity(&owner, &credentials).await?;
            *self.current.lock().unwrap() = Some(owner);
            Ok(())
        })
    }

    fn set_client_context(&self, context: ClientContext) -> BoxFuture<'_, ()> {
        self.inner.set_client_context(context)
    }

    fn execute(&self, request: Request, cursor: Option<Cursor>) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(ExchangeCall {
                owner: self.current.lock().unwrap().clone(),
                command: request.command,
                request: request.clone(),
                cursor: cursor.clone(),
            });

            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures.store(pending - 1, Ordering::SeqCst);
                return Err(AdapterError::Transport("connection reset by peer".into()));
            }
            if self.succeeded.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
                return Err(AdapterError::Transport("connection refused".into()));
            }

            let forced = self.forced.lock().unwrap().pop_front();
            if let Some(status) = forced {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                let mut response = Response::new(request.command, status);
                response.collection = request.collection.clone();
                return Ok(response);
            }

            let response = self.inner.execute(request, cursor).await?;
            self.succeeded.fetch_add(1, Ordering::SeqCst);
            Ok(response)
        })
    }

    fn last_raw_response(&self) -> Option<RawResponse> {
        self.inner.last_raw_response()
    }
}
