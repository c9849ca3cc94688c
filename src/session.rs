//! Client sessions over a Channel Access transport.
//!
//! A [`Session`] owns one channel [`Cache`], one put-completion table and one
//! table of live subscriptions, and drives the transport through a cooperative
//! polling loop. Every blocking operation (waiting for a connection, a put
//! acknowledgement or a synchronous group) is a bounded loop around
//! [`Session::poll_with`], so callbacks are delivered while the caller waits.
//!
//! Independent sessions may coexist in one process; each is internally locked
//! and can be cloned cheaply and shared between threads.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, debug_span, error, warn};

use crate::{
    cache::{Cache, CacheDump, HandleMismatch},
    dbr::CodecError,
    transport::{ContextId, ErrorCondition, Transport},
    utils::{
        get_default_connection_timeout, get_default_max_array_bytes,
        get_default_preemptive_callback,
    },
};

mod access;
mod connection;
mod group;
mod subscription;

pub use access::{GetOptions, PutCallback, PutMode, PutStatus};
pub use connection::{Channel, ChannelStatus, ConnectedChannel};
pub use group::{PendingValue, SyncGroup};
pub use subscription::{MonitorCallback, MonitorEvent, Subscription};

use access::PutRecord;
use subscription::MonitorTable;

/// Budgets used by a plain [`Session::poll`]
const POLL_EVENT_BUDGET: Duration = Duration::from_micros(100);
const POLL_IO_BUDGET: Duration = Duration::from_secs(1);
/// Per-iteration event budget inside bounded waits
const WAIT_EVENT_BUDGET: Duration = Duration::from_millis(1);
/// Flush and poll rounds allowed while tearing down
const TEARDOWN_ROUNDS: usize = 5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaError {
    #[error("{operation} failed: {condition}")]
    Transport {
        operation: &'static str,
        condition: ErrorCondition,
    },
    #[error("Channel {0} is not connected")]
    NotConnected(String),
    #[error("Channel {0} does not belong to this session")]
    InvalidChannel(String),
    #[error("Channel {0} has no resolvable field type")]
    NoFieldType(String),
    #[error(transparent)]
    HandleMismatch(#[from] HandleMismatch),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Value for {0} has not been received yet")]
    Pending(String),
    #[error("Session has been finalized")]
    Closed,
}

/// Map a transport status to an error naming the failed operation
pub(crate) fn failed(operation: &'static str) -> impl FnOnce(ErrorCondition) -> CaError {
    move |condition| CaError::Transport {
        operation,
        condition,
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long `create_channel` with `wait` and `connect_channel` wait by default
    pub connection_timeout: Duration,
    pub put_timeout: Duration,
    pub group_timeout: Duration,
    /// Reads whose payload would exceed this are refused
    pub max_array_bytes: usize,
    /// Character arrays at least this long are not rendered as text
    pub auto_monitor_max_length: usize,
    pub preemptive: bool,
    /// Finalize when the last handle to the session is dropped
    pub auto_cleanup: bool,
    /// Upper bound on the drain performed while finalizing
    pub teardown_time: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connection_timeout: get_default_connection_timeout(),
            put_timeout: Duration::from_secs(30),
            group_timeout: Duration::from_secs(10),
            max_array_bytes: get_default_max_array_bytes(),
            auto_monitor_max_length: 16384,
            preemptive: get_default_preemptive_callback(),
            auto_cleanup: true,
            teardown_time: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }
    pub fn put_timeout(mut self, timeout: Duration) -> Self {
        self.config.put_timeout = timeout;
        self
    }
    pub fn group_timeout(mut self, timeout: Duration) -> Self {
        self.config.group_timeout = timeout;
        self
    }
    pub fn max_array_bytes(mut self, bytes: usize) -> Self {
        self.config.max_array_bytes = bytes;
        self
    }
    pub fn auto_monitor_max_length(mut self, length: usize) -> Self {
        self.config.auto_monitor_max_length = length;
        self
    }
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.config.preemptive = preemptive;
        self
    }
    pub fn auto_cleanup(mut self, auto_cleanup: bool) -> Self {
        self.config.auto_cleanup = auto_cleanup;
        self
    }
    pub fn teardown_time(mut self, time: Duration) -> Self {
        self.config.teardown_time = time;
        self
    }

    /// Create the default context on `transport` and wrap it in a session
    ///
    /// The calling thread is attached to the new context. Other threads attach
    /// to it on their first operation.
    pub fn build<T: Transport>(self, transport: T) -> Result<Session<T>, CaError> {
        let context = transport
            .create_context(self.config.preemptive)
            .map_err(failed("create_context"))?;
        let mut cache = Cache::new();
        cache.add_context(context);
        debug!(
            "Session started on context {context} (preemptive: {})",
            self.config.preemptive
        );
        Ok(Session {
            inner: Arc::new(SessionInner {
                transport,
                config: self.config,
                cache: Mutex::new(cache),
                put_done: Mutex::new(HashMap::new()),
                monitors: Mutex::new(MonitorTable::default()),
                fault: Mutex::new(None),
                default_context: Mutex::new(Some(context)),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

/// A client session: the entry point for every channel operation
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct SessionInner<T: Transport> {
    transport: T,
    config: SessionConfig,
    cache: Mutex<Cache>,
    /// Keyed by channel name; the last put issued on a name wins
    put_done: Mutex<HashMap<String, PutRecord>>,
    monitors: Mutex<MonitorTable>,
    /// Errors raised inside callbacks, surfaced by the next poll
    fault: Mutex<Option<CaError>>,
    default_context: Mutex<Option<ContextId>>,
    closed: AtomicBool,
}

impl<T: Transport> SessionInner<T> {
    /// Make sure the calling thread is attached to a context of this session
    fn ensure_attached(&self) -> Result<ContextId, CaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaError::Closed);
        }
        if let Some(context) = self.transport.current_context() {
            return Ok(context);
        }
        let context = self.default_context.lock().unwrap().ok_or(CaError::Closed)?;
        self.transport
            .attach_context(context)
            .map_err(failed("attach_context"))?;
        debug!("Attached thread to context {context}");
        Ok(context)
    }

    fn record_fault(&self, fault: CaError) {
        error!("Error raised inside callback: {fault}");
        let mut stored = self.fault.lock().unwrap();
        if stored.is_none() {
            *stored = Some(fault);
        }
    }

    fn raise_fault(&self) -> Result<(), CaError> {
        match self.fault.lock().unwrap().take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn poll_with(&self, event_budget: Duration, io_budget: Duration) -> Result<(), CaError> {
        self.ensure_attached()?;
        match self.transport.poll(event_budget, io_budget) {
            Ok(()) | Err(ErrorCondition::Timeout) => (),
            Err(condition) => return Err(failed("poll")(condition)),
        }
        self.raise_fault()
    }

    /// Poll in small steps until `done` holds or `timeout` passes
    ///
    /// Returns whether `done` was satisfied.
    fn wait_until<F>(&self, timeout: Duration, mut done: F) -> Result<bool, CaError>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll_with((deadline - now).min(WAIT_EVENT_BUDGET), Duration::ZERO)?;
        }
    }

    /// Run teardown errors through the log rather than the caller
    fn best_effort(&self, operation: &str, result: Result<(), ErrorCondition>) {
        match result {
            Ok(()) | Err(ErrorCondition::Timeout) => (),
            Err(e) => warn!("Teardown: {operation} failed: {e}"),
        }
    }

    fn finalize(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _span = debug_span!("finalize").entered();
        if self.transport.current_context().is_none()
            && let Some(context) = *self.default_context.lock().unwrap()
        {
            self.best_effort("attach_context", self.transport.attach_context(context));
        }
        self.best_effort("flush", self.transport.flush());
        self.best_effort("poll", self.transport.poll(POLL_EVENT_BUDGET, Duration::ZERO));

        let subscriptions = self.monitors.lock().unwrap().drain();
        for id in subscriptions {
            self.best_effort("unsubscribe", self.transport.unsubscribe(id));
        }
        let (entries, contexts) = {
            let mut cache = self.cache.lock().unwrap();
            (cache.clear_channels(), cache.contexts())
        };
        for handle in entries.iter().filter_map(|e| e.handle) {
            self.best_effort("clear_channel", self.transport.clear_channel(handle));
        }
        self.put_done.lock().unwrap().clear();

        let deadline = Instant::now() + self.config.teardown_time;
        for _ in 0..TEARDOWN_ROUNDS {
            if Instant::now() >= deadline {
                break;
            }
            self.best_effort("flush", self.transport.flush());
            self.best_effort("poll", self.transport.poll(POLL_EVENT_BUDGET, Duration::ZERO));
        }

        for context in contexts {
            self.best_effort("destroy_context", self.transport.destroy_context(context));
            self.cache.lock().unwrap().destroy_context(context);
        }
        *self.default_context.lock().unwrap() = None;
        debug!("Session finalized, {} channel(s) cleared", entries.len());
    }
}

impl<T: Transport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        if self.config.auto_cleanup {
            self.finalize();
        }
    }
}

impl<T: Transport> Session<T> {
    /// Build a session over `transport` with default configuration
    pub fn new(transport: T) -> Result<Self, CaError> {
        SessionBuilder::new().build(transport)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Run one default poll cycle
    pub fn poll(&self) -> Result<(), CaError> {
        self.inner.poll_with(POLL_EVENT_BUDGET, POLL_IO_BUDGET)
    }

    /// Run due callbacks for up to `event_budget`, then wait up to `io_budget`
    /// for outstanding reads
    ///
    /// Errors raised inside callbacks since the last poll are returned here.
    pub fn poll_with(&self, event_budget: Duration, io_budget: Duration) -> Result<(), CaError> {
        self.inner.poll_with(event_budget, io_budget)
    }

    pub fn flush(&self) -> Result<(), CaError> {
        self.inner.ensure_attached()?;
        self.inner.transport.flush().map_err(failed("flush"))
    }

    /// Poll until `done` holds or `timeout` passes, returning whether it held
    pub fn wait_until<F>(&self, timeout: Duration, done: F) -> Result<bool, CaError>
    where
        F: FnMut() -> bool,
    {
        self.inner.wait_until(timeout, done)
    }

    /// Create a new context and attach the calling thread to it
    ///
    /// `None` uses the session's configured callback mode.
    pub fn create_context(&self, preemptive: Option<bool>) -> Result<ContextId, CaError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CaError::Closed);
        }
        let context = self
            .inner
            .transport
            .create_context(preemptive.unwrap_or(self.inner.config.preemptive))
            .map_err(failed("create_context"))?;
        self.inner.cache.lock().unwrap().add_context(context);
        let mut default = self.inner.default_context.lock().unwrap();
        if default.is_none() {
            *default = Some(context);
        }
        Ok(context)
    }

    pub fn attach_context(&self, context: ContextId) -> Result<(), CaError> {
        if !self.inner.cache.lock().unwrap().contexts().contains(&context) {
            return Err(failed("attach_context")(ErrorCondition::BadChId));
        }
        self.inner
            .transport
            .attach_context(context)
            .map_err(failed("attach_context"))
    }

    pub fn current_context(&self) -> Option<ContextId> {
        self.inner.transport.current_context()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.inner.cache.lock().unwrap().contexts()
    }

    /// Destroy a context and every channel in it
    ///
    /// When the calling thread is attached to the context, pending I/O is
    /// flushed and the event queue drained for a bounded number of rounds first.
    pub fn destroy_context(&self, context: ContextId) -> Result<(), CaError> {
        let _span = debug_span!("destroy_context", context = context.0).entered();
        let inner = &self.inner;
        if inner.transport.current_context() == Some(context) {
            for _ in 0..TEARDOWN_ROUNDS {
                inner.best_effort("flush", inner.transport.flush());
                inner.best_effort("poll", inner.transport.poll(POLL_EVENT_BUDGET, Duration::ZERO));
            }
        }
        let entries = inner.cache.lock().unwrap().destroy_context(context);
        {
            let mut put_done = inner.put_done.lock().unwrap();
            for entry in &entries {
                put_done.remove(&entry.name);
            }
        }
        let handles: Vec<_> = entries.iter().filter_map(|e| e.handle).collect();
        inner.monitors.lock().unwrap().forget_channels(&handles);
        inner
            .transport
            .destroy_context(context)
            .map_err(failed("destroy_context"))?;
        let mut default = inner.default_context.lock().unwrap();
        if *default == Some(context) {
            *default = inner.cache.lock().unwrap().fallback_context();
        }
        debug!("Destroyed context with {} channel(s)", entries.len());
        Ok(())
    }

    /// Snapshot of every cached channel
    pub fn cache_dump(&self) -> CacheDump {
        self.inner.cache.lock().unwrap().dump()
    }

    /// Tear everything down: flush, clear all channels, drain for a bounded time
    /// and destroy every context
    ///
    /// Failures along the way are logged and teardown continues. Every later
    /// operation on the session fails with [`CaError::Closed`].
    pub fn finalize(&self) {
        self.inner.finalize();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
