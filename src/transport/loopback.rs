//! An in-process transport backed by a table of simulated process variables.
//!
//! [`PvDatabase`] plays the part of the IOCs on the network: it holds named
//! records that can be added, updated and taken on/offline from any thread.
//! [`LoopbackTransport`] implements [`Transport`] against it, exchanging real
//! big-endian DBR payloads, so a [`Session`](crate::session::Session) behaves
//! exactly as it would against a remote server.
//!
//! Non-preemptive contexts queue events and run them inside [`Transport::poll`]
//! on the polling thread. Preemptive contexts own a single-worker tokio runtime
//! whose dispatcher delivers events as they fall due.

use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::{Arc, Mutex, Weak},
    thread::{self, ThreadId},
    time::{Duration, Instant, SystemTime},
};

use thiserror::Error;
use tokio::{
    runtime::Runtime,
    select,
    sync::Notify,
    time::{sleep_until, Instant as TokioInstant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrGraphics, DbrType, DbrValue, Limits, Status},
    transport::{
        ChannelHandle, ChannelState, ConnectionArgs, ConnectionHandler, ContextId,
        ErrorCondition, EventArgs, EventHandler, GroupId, MonitorMask, PutArgs, PutHandler,
        ReadBuffer, SubscriptionId, Transport,
    },
    utils::wrapping_inplace_add,
};

#[derive(Debug, Error, PartialEq)]
pub enum DatabaseError {
    #[error("PV {0} already exists")]
    AlreadyExists(String),
    #[error("No PV named {0}")]
    NotFound(String),
}

/// A simulated process variable
#[derive(Clone, Debug)]
pub struct Record {
    pub value: DbrValue,
    pub status: Status,
    /// The last time this value was written
    pub timestamp: SystemTime,
    pub units: String,
    /// Only reported for `FLOAT` and `DOUBLE` fields
    pub precision: i16,
    pub limits: Limits,
    pub control_limits: (f64, f64),
    pub enum_strings: Vec<String>,
    pub read_only: bool,
    /// Offline records are never found by channel searches
    pub online: bool,
    /// How long a write takes to be acknowledged
    pub put_delay: Duration,
}

impl Default for Record {
    fn default() -> Self {
        Record {
            value: DbrValue::Int(vec![0]),
            status: Status::default(),
            timestamp: SystemTime::now(),
            units: String::new(),
            precision: 0,
            limits: Limits::default(),
            control_limits: (0.0, 0.0),
            enum_strings: Vec::new(),
            read_only: false,
            online: true,
            put_delay: Duration::ZERO,
        }
    }
}

impl Record {
    fn element_count(&self) -> usize {
        self.value.get_count()
    }

    /// Timestamps are kept strictly increasing, even on coarse clocks
    fn touch(&mut self) {
        let now = SystemTime::now();
        self.timestamp = if now > self.timestamp {
            now
        } else {
            self.timestamp + Duration::from_micros(1)
        };
    }

    /// Encode the current state as `count` elements of `data_type`
    fn snapshot(&self, data_type: DbrType, count: usize) -> Result<Vec<u8>, ErrorCondition> {
        let mut value = match (&self.value, data_type.basic_type) {
            (DbrValue::Enum(index), DbrBasicType::String) => DbrValue::String(vec![
                self.enum_strings
                    .get(usize::from(*index))
                    .cloned()
                    .unwrap_or_else(|| index.to_string()),
            ]),
            (value, kind) => value.convert_to(kind)?,
        };
        let count = if count == 0 {
            self.element_count()
        } else {
            count
        };
        if !matches!(value, DbrValue::Enum(_)) {
            let _ = value.resize(count);
        }
        let graphics = match data_type.basic_type {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                strings: self.enum_strings.clone(),
            },
            kind => DbrGraphics::Numeric {
                units: self.units.clone(),
                precision: matches!(kind, DbrBasicType::Float | DbrBasicType::Double)
                    .then_some(self.precision),
                limits: self.limits.clone(),
            },
        };
        let status = self.status;
        let dbr = match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control_limits: self.control_limits,
                value,
            },
        };
        Ok(dbr.to_bytes(None).1)
    }

    /// Store a value from the CA protocol to the record
    ///
    /// Text is parsed into numeric fields, and matched against the state names
    /// of enumerated ones.
    fn store_from_ca(
        &mut self,
        data_type: DbrType,
        count: usize,
        data: &[u8],
    ) -> Result<(), ErrorCondition> {
        let incoming = Dbr::from_bytes(data_type, count, data)
            .map_err(|_| ErrorCondition::BadType)?
            .take_value();
        let native_type = self.value.get_type();
        let mut value = match (&incoming, native_type) {
            (DbrValue::String(text), DbrBasicType::Enum) if text.len() == 1 => {
                match self.enum_strings.iter().position(|s| *s == text[0]) {
                    Some(index) => DbrValue::Enum(index as u16),
                    None => incoming
                        .parse_into(native_type)
                        .map_err(|_| ErrorCondition::NoConvert)?,
                }
            }
            (DbrValue::String(_), kind) if kind != DbrBasicType::String => incoming
                .parse_into(kind)
                .map_err(|_| ErrorCondition::NoConvert)?,
            (_, kind) => incoming.convert_to(kind)?,
        };
        if let DbrValue::Enum(index) = value
            && !self.enum_strings.is_empty()
            && usize::from(index) >= self.enum_strings.len()
        {
            return Err(ErrorCondition::PutFail);
        }
        if !matches!(value, DbrValue::Enum(_)) {
            let _ = value.resize(self.element_count());
        }
        self.value = value;
        self.touch();
        Ok(())
    }
}

/// What changed about a record, for routing to subscribers
#[derive(Copy, Clone, Debug, PartialEq)]
enum Change {
    Value,
    Alarm,
    Property,
    Online(bool),
}

impl Change {
    fn wanted_by(&self, mask: &MonitorMask) -> bool {
        match self {
            Change::Value => mask.value || mask.log,
            Change::Alarm => mask.alarm,
            Change::Property => mask.property,
            Change::Online(_) => false,
        }
    }
}

#[derive(Default)]
struct DatabaseInner {
    records: Mutex<HashMap<String, Arc<Mutex<Record>>>>,
    observers: Mutex<Vec<Weak<Shared>>>,
}

/// Shared table of simulated process variables
#[derive(Clone, Default)]
pub struct PvDatabase {
    inner: Arc<DatabaseInner>,
}

impl PvDatabase {
    pub fn new() -> PvDatabase {
        PvDatabase::default()
    }

    fn record(&self, name: &str) -> Option<Arc<Mutex<Record>>> {
        self.inner.records.lock().unwrap().get(name).cloned()
    }

    fn observe(&self, shared: Weak<Shared>) {
        self.inner.observers.lock().unwrap().push(shared);
    }

    /// Tell every live transport about a change, forgetting dead ones
    fn notify(&self, name: &str, change: Change) {
        let observers: Vec<Arc<Shared>> = {
            let mut observers = self.inner.observers.lock().unwrap();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_change(name, change);
        }
    }

    pub fn add_record(&self, name: &str, record: Record) -> Result<(), DatabaseError> {
        let online = record.online;
        {
            let mut records = self.inner.records.lock().unwrap();
            if records.contains_key(name) {
                return Err(DatabaseError::AlreadyExists(name.to_owned()));
            }
            records.insert(name.to_owned(), Arc::new(Mutex::new(record)));
        }
        debug!("Database: Added {name}");
        if online {
            self.notify(name, Change::Online(true));
        }
        Ok(())
    }

    pub fn add_pv<T>(&self, name: &str, initial_value: T) -> Result<Intercom<T>, DatabaseError>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
        DbrValue: From<T>,
    {
        self.add_record(
            name,
            Record {
                value: DbrValue::from(initial_value),
                ..Default::default()
            },
        )?;
        Ok(Intercom::new(name, self.clone()))
    }

    pub fn add_enum_pv(
        &self,
        name: &str,
        states: &[&str],
        index: u16,
    ) -> Result<Intercom<u16>, DatabaseError> {
        self.add_record(
            name,
            Record {
                value: DbrValue::Enum(index),
                enum_strings: states.iter().map(|s| (*s).to_owned()).collect(),
                ..Default::default()
            },
        )?;
        Ok(Intercom::new(name, self.clone()))
    }

    /// Make a record reachable or unreachable, connecting or disconnecting channels
    pub fn set_online(&self, name: &str, online: bool) -> Result<(), DatabaseError> {
        let record = self
            .record(name)
            .ok_or_else(|| DatabaseError::NotFound(name.to_owned()))?;
        let changed = {
            let mut record = record.lock().unwrap();
            let changed = record.online != online;
            record.online = online;
            changed
        };
        if changed {
            debug!("Database: {name} is now {}", if online { "online" } else { "offline" });
            self.notify(name, Change::Online(online));
        }
        Ok(())
    }

    pub fn set_status(&self, name: &str, status: Status) -> Result<(), DatabaseError> {
        let record = self
            .record(name)
            .ok_or_else(|| DatabaseError::NotFound(name.to_owned()))?;
        {
            let mut record = record.lock().unwrap();
            record.status = status;
            record.touch();
        }
        self.notify(name, Change::Alarm);
        Ok(())
    }

    /// Change any of the record metadata
    pub fn configure<F>(&self, name: &str, f: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut Record),
    {
        let record = self
            .record(name)
            .ok_or_else(|| DatabaseError::NotFound(name.to_owned()))?;
        f(&mut record.lock().unwrap());
        self.notify(name, Change::Property);
        Ok(())
    }

    pub fn load(&self, name: &str) -> Option<DbrValue> {
        self.record(name).map(|r| r.lock().unwrap().value.clone())
    }

    /// Replace the value, converted to the record's native type
    pub fn store(&self, name: &str, value: &DbrValue) -> Result<(), ErrorCondition> {
        let record = self.record(name).ok_or(ErrorCondition::BadChId)?;
        {
            let mut record = record.lock().unwrap();
            record.value = value.convert_to(record.value.get_type())?;
            record.touch();
        }
        self.notify(name, Change::Value);
        Ok(())
    }

    fn store_from_ca(
        &self,
        name: &str,
        data_type: DbrType,
        count: usize,
        data: &[u8],
    ) -> Result<Duration, ErrorCondition> {
        let record = self.record(name).ok_or(ErrorCondition::BadChId)?;
        let put_delay = {
            let mut record = record.lock().unwrap();
            if record.read_only {
                return Err(ErrorCondition::NoWtAccess);
            }
            debug!("Database: Processing write to {name}");
            record.store_from_ca(data_type, count, data)?;
            record.put_delay
        };
        self.notify(name, Change::Value);
        Ok(put_delay)
    }

    fn snapshot(
        &self,
        name: &str,
        data_type: DbrType,
        count: usize,
    ) -> Result<Vec<u8>, ErrorCondition> {
        let record = self.record(name).ok_or(ErrorCondition::Disconn)?;
        let record = record.lock().unwrap();
        record.snapshot(data_type, count)
    }

    /// Element count and native type, if the record can be found
    fn shape(&self, name: &str) -> Option<(usize, DbrBasicType, bool)> {
        let record = self.record(name)?;
        let record = record.lock().unwrap();
        record
            .online
            .then(|| (record.element_count(), record.value.get_type(), record.read_only))
    }
}

/// Typed interface to reading and writing single simulated values
#[derive(Clone)]
pub struct Intercom<T> {
    name: String,
    database: PvDatabase,
    _marker: PhantomData<T>,
}

impl<T> Intercom<T>
where
    T: for<'a> TryFrom<&'a DbrValue>,
    DbrValue: From<T>,
{
    fn new(name: &str, database: PvDatabase) -> Self {
        Intercom {
            name: name.to_owned(),
            database,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> T {
        let value = self
            .database
            .load(&self.name)
            .unwrap_or_else(|| panic!("Intercom PV {} was removed", self.name));
        match T::try_from(&value) {
            Ok(v) => v,
            _ => panic!("Database logic should ensure this conversion never fails!"),
        }
    }

    pub fn store(&self, value: T) {
        if let Err(e) = self.database.store(&self.name, &value.into()) {
            panic!("Database logic should ensure this never fails: {e}");
        }
    }
}

struct ChannelRecord {
    context: ContextId,
    name: String,
    state: ChannelState,
    /// The state once every queued connection event is delivered
    target_connected: bool,
    element_count: usize,
    field_type: Option<DbrBasicType>,
    read_only: bool,
    on_connection: ConnectionHandler,
}

struct SubscriptionRecord {
    context: ContextId,
    handle: ChannelHandle,
    data_type: DbrType,
    count: usize,
    mask: MonitorMask,
    on_event: EventHandler,
}

struct PendingRead {
    handle: ChannelHandle,
    data_type: DbrType,
    count: usize,
    buffer: ReadBuffer,
}

#[derive(Default)]
struct GroupRecord {
    context: Option<ContextId>,
    reads: Vec<PendingRead>,
    /// Times at which each queued write is acknowledged
    writes: Vec<Instant>,
}

enum Event {
    Connection {
        handle: ChannelHandle,
        connected: bool,
    },
    Monitor {
        subscription: SubscriptionId,
        args: EventArgs,
    },
    PutComplete {
        on_complete: PutHandler,
        args: PutArgs,
    },
}

/// An event resolved against current state, ready to run without any lock held
enum Ready {
    Connection(ConnectionHandler, ConnectionArgs),
    Monitor(EventHandler, EventArgs),
    Put(PutHandler, PutArgs),
}

impl Ready {
    fn dispatch(self) {
        match self {
            Ready::Connection(handler, args) => handler(args),
            Ready::Monitor(handler, args) => handler(args),
            Ready::Put(handler, args) => handler(args),
        }
    }
}

struct Dispatcher {
    runtime: Option<Runtime>,
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct ContextState {
    creator: ThreadId,
    queue: BTreeMap<(Instant, u64), Event>,
    pending_reads: Vec<PendingRead>,
    dispatcher: Option<Dispatcher>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_sequence: u64,
    contexts: HashMap<ContextId, ContextState>,
    channels: HashMap<ChannelHandle, ChannelRecord>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
    groups: HashMap<GroupId, GroupRecord>,
}

impl State {
    fn new_id(&mut self) -> u64 {
        wrapping_inplace_add(&mut self.next_id);
        self.next_id
    }

    /// Fail every outstanding read on a channel, plain or grouped
    fn fail_reads(&mut self, handle: ChannelHandle, condition: ErrorCondition) {
        let plain = self.contexts.values_mut().map(|c| &mut c.pending_reads);
        let grouped = self.groups.values_mut().map(|g| &mut g.reads);
        for reads in plain.chain(grouped) {
            reads.retain(|read| {
                if read.handle == handle {
                    read.buffer.fill(Err(condition));
                }
                read.handle != handle
            });
        }
    }

    fn enqueue(&mut self, context: ContextId, due: Instant, event: Event) {
        let sequence = wrapping_inplace_add(&mut self.next_sequence);
        let Some(ctx) = self.contexts.get_mut(&context) else {
            trace!("Dropping event for destroyed context {context}");
            return;
        };
        ctx.queue.insert((due, sequence), event);
        if let Some(dispatcher) = &ctx.dispatcher {
            dispatcher.wake.notify_one();
        }
    }

    fn connected_channel(&self, handle: ChannelHandle) -> Result<&ChannelRecord, ErrorCondition> {
        let channel = self.channels.get(&handle).ok_or(ErrorCondition::BadChId)?;
        if channel.state != ChannelState::Connected {
            return Err(ErrorCondition::Disconn);
        }
        Ok(channel)
    }
}

struct Shared {
    database: PvDatabase,
    state: Mutex<State>,
    attached: Mutex<HashMap<ThreadId, ContextId>>,
    connect_delay: Duration,
}

impl Shared {
    fn current_context(&self) -> Option<ContextId> {
        self.attached
            .lock()
            .unwrap()
            .get(&thread::current().id())
            .copied()
    }

    fn require_context(&self) -> Result<ContextId, ErrorCondition> {
        self.current_context().ok_or(ErrorCondition::Internal)
    }

    fn create_context(self: &Arc<Self>, preemptive: bool) -> Result<ContextId, ErrorCondition> {
        let context = ContextId(self.state.lock().unwrap().new_id());
        let dispatcher = if preemptive {
            Some(self.start_dispatcher(context)?)
        } else {
            None
        };
        self.state.lock().unwrap().contexts.insert(
            context,
            ContextState {
                creator: thread::current().id(),
                queue: BTreeMap::new(),
                pending_reads: Vec::new(),
                dispatcher,
            },
        );
        self.attached
            .lock()
            .unwrap()
            .insert(thread::current().id(), context);
        debug!("Created context {context} (preemptive: {preemptive})");
        Ok(context)
    }

    fn start_dispatcher(self: &Arc<Self>, context: ContextId) -> Result<Dispatcher, ErrorCondition> {
        let attach = Arc::downgrade(self);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("ca-context-{context}"))
            .enable_time()
            .on_thread_start(move || {
                if let Some(shared) = attach.upgrade() {
                    shared
                        .attached
                        .lock()
                        .unwrap()
                        .insert(thread::current().id(), context);
                }
            })
            .build()
            .map_err(|e| {
                warn!("Failed to start dispatcher runtime: {e}");
                ErrorCondition::AllocMem
            })?;
        let stop = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        runtime.spawn(dispatch_loop(
            Arc::downgrade(self),
            context,
            wake.clone(),
            stop.clone(),
        ));
        Ok(Dispatcher {
            runtime: Some(runtime),
            stop,
            wake,
        })
    }

    fn destroy_context(&self, context: ContextId) -> Result<(), ErrorCondition> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state
                .contexts
                .remove(&context)
                .ok_or(ErrorCondition::BadChId)?;
            state.channels.retain(|_, c| c.context != context);
            state.subscriptions.retain(|_, s| s.context != context);
            state.groups.retain(|_, g| g.context != Some(context));
            removed
        };
        self.attached.lock().unwrap().retain(|_, c| *c != context);
        debug!("Destroyed context {context}");
        // Stops the dispatcher, if any, outside the state lock
        drop(removed);
        Ok(())
    }

    fn attach_context(&self, context: ContextId) -> Result<(), ErrorCondition> {
        {
            let state = self.state.lock().unwrap();
            let ctx = state.contexts.get(&context).ok_or(ErrorCondition::BadChId)?;
            if ctx.dispatcher.is_none() && ctx.creator != thread::current().id() {
                return Err(ErrorCondition::NotThreaded);
            }
        }
        self.attached
            .lock()
            .unwrap()
            .insert(thread::current().id(), context);
        Ok(())
    }

    /// Pop the earliest due event for a context that still has somewhere to go
    fn pop_due(&self, context: ContextId, now: Instant) -> Option<Ready> {
        let mut state = self.state.lock().unwrap();
        loop {
            let ctx = state.contexts.get_mut(&context)?;
            let (&(due, _), _) = ctx.queue.first_key_value()?;
            if due > now {
                return None;
            }
            let (_, event) = ctx.queue.pop_first()?;
            if let Some(ready) = self.resolve(&mut state, event, now) {
                return Some(ready);
            }
        }
    }

    fn resolve(&self, state: &mut State, event: Event, now: Instant) -> Option<Ready> {
        match event {
            Event::Connection { handle, connected } => {
                let shape = if connected {
                    let name = &state.channels.get(&handle)?.name;
                    self.database.shape(name)
                } else {
                    None
                };
                let channel = state.channels.get_mut(&handle)?;
                let was_connected = channel.state == ChannelState::Connected;
                match shape {
                    Some((element_count, field_type, read_only)) => {
                        channel.state = ChannelState::Connected;
                        channel.element_count = element_count;
                        channel.field_type = Some(field_type);
                        channel.read_only = read_only;
                    }
                    // Went offline again before the connection was delivered
                    None if connected => return None,
                    None => {
                        channel.state = ChannelState::Searching;
                        if !was_connected {
                            return None;
                        }
                    }
                }
                let handler = channel.on_connection.clone();
                let connected = channel.state == ChannelState::Connected;
                if connected {
                    // Subscriptions receive the current value on (re)connection
                    let subscriptions: Vec<SubscriptionId> = state
                        .subscriptions
                        .iter()
                        .filter(|(_, s)| s.handle == handle)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in subscriptions {
                        self.queue_monitor(state, id, now);
                    }
                } else {
                    state.fail_reads(handle, ErrorCondition::Disconn);
                }
                Some(Ready::Connection(handler, ConnectionArgs { handle, connected }))
            }
            Event::Monitor { subscription, args } => {
                let Some(sub) = state.subscriptions.get(&subscription) else {
                    trace!("Dropping event for cancelled subscription {subscription:?}");
                    return None;
                };
                Some(Ready::Monitor(sub.on_event.clone(), args))
            }
            Event::PutComplete { on_complete, args } => Some(Ready::Put(on_complete, args)),
        }
    }

    fn queue_monitor(&self, state: &mut State, subscription: SubscriptionId, now: Instant) {
        let Some(sub) = state.subscriptions.get(&subscription) else {
            return;
        };
        let Some(channel) = state.channels.get(&sub.handle) else {
            return;
        };
        let args = EventArgs {
            handle: sub.handle,
            data_type: sub.data_type,
            count: sub.count,
            payload: self.database.snapshot(&channel.name, sub.data_type, sub.count),
        };
        let context = sub.context;
        state.enqueue(context, now, Event::Monitor { subscription, args });
    }

    fn on_change(&self, name: &str, change: Change) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        match change {
            Change::Online(online) => {
                let targets: Vec<(ChannelHandle, ContextId)> = state
                    .channels
                    .iter_mut()
                    .filter(|(_, c)| c.name == name && c.target_connected != online)
                    .map(|(handle, c)| {
                        c.target_connected = online;
                        (*handle, c.context)
                    })
                    .collect();
                let due = if online { now + self.connect_delay } else { now };
                for (handle, context) in targets {
                    state.enqueue(
                        context,
                        due,
                        Event::Connection {
                            handle,
                            connected: online,
                        },
                    );
                }
            }
            change => {
                let subscriptions: Vec<SubscriptionId> = state
                    .subscriptions
                    .iter()
                    .filter(|(_, s)| change.wanted_by(&s.mask))
                    .filter(|(_, s)| {
                        state.channels.get(&s.handle).is_some_and(|c| {
                            c.name == name && c.state == ChannelState::Connected
                        })
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for id in subscriptions {
                    self.queue_monitor(&mut state, id, now);
                }
            }
        }
    }

    fn next_due(&self, context: ContextId) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        let ctx = state.contexts.get(&context)?;
        ctx.queue.first_key_value().map(|(&(due, _), _)| due)
    }

    /// Complete whatever reads can be completed, returning how many are still waiting
    fn complete_reads(&self, context: ContextId) -> usize {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(ctx) = state.contexts.get_mut(&context) else {
            return 0;
        };
        let mut waiting = Vec::new();
        for read in ctx.pending_reads.drain(..) {
            match state.channels.get(&read.handle) {
                None => read.buffer.fill(Err(ErrorCondition::ChanDestroy)),
                Some(channel) if channel.state == ChannelState::Connected => {
                    read.buffer.fill(self.database.snapshot(
                        &channel.name,
                        read.data_type,
                        read.count,
                    ))
                }
                Some(_) => waiting.push(read),
            }
        }
        let remaining = waiting.len();
        ctx.pending_reads = waiting;
        remaining
    }

    fn pend_io(&self, context: ContextId, budget: Duration) -> Result<(), ErrorCondition> {
        let deadline = Instant::now() + budget;
        loop {
            if self.complete_reads(context) == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorCondition::Timeout);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn poll(&self, event_budget: Duration, io_budget: Duration) -> Result<(), ErrorCondition> {
        let context = self.require_context()?;
        let preemptive = {
            let state = self.state.lock().unwrap();
            state
                .contexts
                .get(&context)
                .ok_or(ErrorCondition::BadChId)?
                .dispatcher
                .is_some()
        };
        let deadline = Instant::now() + event_budget;
        if preemptive {
            thread::sleep(event_budget);
        } else {
            loop {
                while let Some(ready) = self.pop_due(context, Instant::now()) {
                    ready.dispatch();
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wake = self
                    .next_due(context)
                    .map_or(deadline, |due| due.min(deadline));
                thread::sleep(wake.saturating_duration_since(now));
            }
        }
        self.pend_io(context, io_budget)
    }

    fn write(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: &[u8],
        on_complete: Option<PutHandler>,
    ) -> Result<(), ErrorCondition> {
        let (context, name) = {
            let state = self.state.lock().unwrap();
            let channel = state.connected_channel(handle)?;
            if channel.read_only {
                return Err(ErrorCondition::NoWtAccess);
            }
            (channel.context, channel.name.clone())
        };
        let put_delay = self.database.store_from_ca(&name, data_type, count, data)?;
        if let Some(on_complete) = on_complete {
            self.state.lock().unwrap().enqueue(
                context,
                Instant::now() + put_delay,
                Event::PutComplete {
                    on_complete,
                    args: PutArgs {
                        handle,
                        result: Ok(()),
                    },
                },
            );
        }
        Ok(())
    }

    fn group_test(&self, group: GroupId) -> Result<bool, ErrorCondition> {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let record = state
            .groups
            .get_mut(&group)
            .ok_or(ErrorCondition::BadSyncGrp)?;
        let mut waiting = Vec::new();
        for read in record.reads.drain(..) {
            match state.channels.get(&read.handle) {
                Some(channel) if channel.state == ChannelState::Connected => {
                    read.buffer.fill(self.database.snapshot(
                        &channel.name,
                        read.data_type,
                        read.count,
                    ))
                }
                None => read.buffer.fill(Err(ErrorCondition::ChanDestroy)),
                Some(_) => waiting.push(read),
            }
        }
        record.reads = waiting;
        record.writes.retain(|ready_at| *ready_at > now);
        Ok(record.reads.is_empty() && record.writes.is_empty())
    }
}

async fn dispatch_loop(
    shared: Weak<Shared>,
    context: ContextId,
    wake: Arc<Notify>,
    stop: CancellationToken,
) {
    loop {
        let next_due = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            while let Some(ready) = shared.pop_due(context, Instant::now()) {
                ready.dispatch();
            }
            shared.next_due(context)
        };
        let next_wake = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(1));
        select! {
            _ = stop.cancelled() => break,
            _ = wake.notified() => (),
            _ = sleep_until(TokioInstant::from_std(next_wake)) => (),
        }
    }
    trace!("Dispatcher for context {context} stopped");
}

/// A [`Transport`] delivering channels from a [`PvDatabase`] in the same process
#[derive(Clone)]
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub fn new(database: PvDatabase) -> Self {
        Self::with_connect_delay(database, Duration::ZERO)
    }

    /// Channels only connect `delay` after their record becomes reachable
    pub fn with_connect_delay(database: PvDatabase, delay: Duration) -> Self {
        let shared = Arc::new(Shared {
            database: database.clone(),
            state: Mutex::new(State::default()),
            attached: Mutex::new(HashMap::new()),
            connect_delay: delay,
        });
        database.observe(Arc::downgrade(&shared));
        LoopbackTransport { shared }
    }

    pub fn database(&self) -> &PvDatabase {
        &self.shared.database
    }
}

impl Transport for LoopbackTransport {
    fn create_context(&self, preemptive: bool) -> Result<ContextId, ErrorCondition> {
        self.shared.create_context(preemptive)
    }

    fn destroy_context(&self, context: ContextId) -> Result<(), ErrorCondition> {
        self.shared.destroy_context(context)
    }

    fn attach_context(&self, context: ContextId) -> Result<(), ErrorCondition> {
        self.shared.attach_context(context)
    }

    fn current_context(&self) -> Option<ContextId> {
        self.shared.current_context()
    }

    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelHandle, ErrorCondition> {
        let context = self.shared.require_context()?;
        let reachable = self.shared.database.shape(name).is_some();
        let mut state = self.shared.state.lock().unwrap();
        if !state.contexts.contains_key(&context) {
            return Err(ErrorCondition::BadChId);
        }
        let handle = ChannelHandle(state.new_id());
        state.channels.insert(
            handle,
            ChannelRecord {
                context,
                name: name.to_owned(),
                state: ChannelState::Searching,
                target_connected: reachable,
                element_count: 0,
                field_type: None,
                read_only: false,
                on_connection,
            },
        );
        if reachable {
            state.enqueue(
                context,
                Instant::now() + self.shared.connect_delay,
                Event::Connection {
                    handle,
                    connected: true,
                },
            );
        }
        trace!("Created channel {handle} for {name}");
        Ok(handle)
    }

    fn clear_channel(&self, handle: ChannelHandle) -> Result<(), ErrorCondition> {
        let mut state = self.shared.state.lock().unwrap();
        state
            .channels
            .remove(&handle)
            .ok_or(ErrorCondition::BadChId)?;
        state.subscriptions.retain(|_, s| s.handle != handle);
        Ok(())
    }

    fn channel_state(&self, handle: ChannelHandle) -> ChannelState {
        self.shared
            .state
            .lock()
            .unwrap()
            .channels
            .get(&handle)
            .map_or(ChannelState::Closed, |c| c.state)
    }

    fn name(&self, handle: ChannelHandle) -> Option<String> {
        let state = self.shared.state.lock().unwrap();
        state.channels.get(&handle).map(|c| c.name.clone())
    }

    fn element_count(&self, handle: ChannelHandle) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.channels.get(&handle).map_or(0, |c| c.element_count)
    }

    fn field_type(&self, handle: ChannelHandle) -> Option<DbrBasicType> {
        let state = self.shared.state.lock().unwrap();
        state.channels.get(&handle).and_then(|c| c.field_type)
    }

    fn read_access(&self, handle: ChannelHandle) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.connected_channel(handle).is_ok()
    }

    fn write_access(&self, handle: ChannelHandle) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.connected_channel(handle).is_ok_and(|c| !c.read_only)
    }

    fn host_name(&self, handle: ChannelHandle) -> Option<String> {
        let state = self.shared.state.lock().unwrap();
        state
            .connected_channel(handle)
            .ok()
            .map(|_| "localhost:5064".to_owned())
    }

    fn read(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        buffer: ReadBuffer,
    ) -> Result<(), ErrorCondition> {
        let mut state = self.shared.state.lock().unwrap();
        let context = state.connected_channel(handle)?.context;
        if data_type.payload_size(count) > buffer.capacity() {
            return Err(ErrorCondition::TooLarge);
        }
        state
            .contexts
            .get_mut(&context)
            .ok_or(ErrorCondition::BadChId)?
            .pending_reads
            .push(PendingRead {
                handle,
                data_type,
                count,
                buffer,
            });
        Ok(())
    }

    fn write(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
    ) -> Result<(), ErrorCondition> {
        self.shared.write(data_type, count, handle, &data, None)
    }

    fn write_with_callback(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
        on_complete: PutHandler,
    ) -> Result<(), ErrorCondition> {
        self.shared
            .write(data_type, count, handle, &data, Some(on_complete))
    }

    fn subscribe(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        mask: MonitorMask,
        on_event: EventHandler,
    ) -> Result<SubscriptionId, ErrorCondition> {
        if mask.is_empty() {
            return Err(ErrorCondition::BadMask);
        }
        let mut state = self.shared.state.lock().unwrap();
        let channel = state.channels.get(&handle).ok_or(ErrorCondition::BadChId)?;
        let (context, connected) = (channel.context, channel.state == ChannelState::Connected);
        let id = SubscriptionId(state.new_id());
        state.subscriptions.insert(
            id,
            SubscriptionRecord {
                context,
                handle,
                data_type,
                count,
                mask,
                on_event,
            },
        );
        if connected {
            self.shared.queue_monitor(&mut state, id, Instant::now());
        }
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ErrorCondition> {
        self.shared
            .state
            .lock()
            .unwrap()
            .subscriptions
            .remove(&subscription)
            .map(|_| ())
            .ok_or(ErrorCondition::BadMonId)
    }

    fn poll(&self, event_budget: Duration, io_budget: Duration) -> Result<(), ErrorCondition> {
        self.shared.poll(event_budget, io_budget)
    }

    fn flush(&self) -> Result<(), ErrorCondition> {
        // Nothing is buffered on the way out
        self.shared.require_context().map(|_| ())
    }

    fn group_create(&self) -> Result<GroupId, ErrorCondition> {
        let context = self.shared.require_context()?;
        let mut state = self.shared.state.lock().unwrap();
        let id = GroupId(state.new_id());
        state.groups.insert(
            id,
            GroupRecord {
                context: Some(context),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn group_delete(&self, group: GroupId) -> Result<(), ErrorCondition> {
        let mut state = self.shared.state.lock().unwrap();
        state
            .groups
            .remove(&group)
            .map(|_| ())
            .ok_or(ErrorCondition::BadSyncGrp)
    }

    fn group_reset(&self, group: GroupId) -> Result<(), ErrorCondition> {
        let mut state = self.shared.state.lock().unwrap();
        let record = state
            .groups
            .get_mut(&group)
            .ok_or(ErrorCondition::BadSyncGrp)?;
        record.reads.clear();
        record.writes.clear();
        Ok(())
    }

    fn group_block(&self, group: GroupId, timeout: Duration) -> Result<(), ErrorCondition> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.group_test(group)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorCondition::Timeout);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn group_test(&self, group: GroupId) -> Result<bool, ErrorCondition> {
        self.shared.group_test(group)
    }

    fn group_read(
        &self,
        group: GroupId,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        buffer: ReadBuffer,
    ) -> Result<(), ErrorCondition> {
        let mut state = self.shared.state.lock().unwrap();
        state.channels.get(&handle).ok_or(ErrorCondition::BadChId)?;
        if data_type.payload_size(count) > buffer.capacity() {
            return Err(ErrorCondition::TooLarge);
        }
        state
            .groups
            .get_mut(&group)
            .ok_or(ErrorCondition::BadSyncGrp)?
            .reads
            .push(PendingRead {
                handle,
                data_type,
                count,
                buffer,
            });
        Ok(())
    }

    fn group_write(
        &self,
        group: GroupId,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
    ) -> Result<(), ErrorCondition> {
        let name = {
            let state = self.shared.state.lock().unwrap();
            if !state.groups.contains_key(&group) {
                return Err(ErrorCondition::BadSyncGrp);
            }
            let channel = state.connected_channel(handle)?;
            if channel.read_only {
                return Err(ErrorCondition::NoWtAccess);
            }
            channel.name.clone()
        };
        let put_delay = self
            .shared
            .database
            .store_from_ca(&name, data_type, count, &data)?;
        let mut state = self.shared.state.lock().unwrap();
        if let Some(record) = state.groups.get_mut(&group) {
            record.writes.push(Instant::now() + put_delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dbr::{self, CaValue};

    fn counting_connection_handler(counter: Arc<AtomicUsize>) -> ConnectionHandler {
        Arc::new(move |args: ConnectionArgs| {
            if args.connected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn non_preemptive_connection_runs_inside_poll() {
        let database = PvDatabase::new();
        let _pv = database.add_pv("TEST:VALUE", 4.5f64).unwrap();
        let transport = LoopbackTransport::new(database);
        transport.create_context(false).unwrap();

        let connections = Arc::new(AtomicUsize::new(0));
        let handle = transport
            .create_channel("TEST:VALUE", counting_connection_handler(connections.clone()))
            .unwrap();
        // Nothing happens until we poll
        assert_eq!(transport.channel_state(handle), ChannelState::Searching);
        assert_eq!(connections.load(Ordering::SeqCst), 0);

        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(transport.channel_state(handle), ChannelState::Connected);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(transport.field_type(handle), Some(DbrBasicType::Double));
        assert_eq!(transport.element_count(handle), 1);
    }

    #[test]
    fn reads_complete_during_io() {
        let database = PvDatabase::new();
        let _pv = database.add_pv("TEST:ARRAY", vec![1i32, 2, 3]).unwrap();
        let transport = LoopbackTransport::new(database);
        transport.create_context(false).unwrap();
        let handle = transport
            .create_channel("TEST:ARRAY", Arc::new(|_| ()))
            .unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();

        let data_type: DbrType = "TIME_LONG".parse().unwrap();
        let buffer = ReadBuffer::with_capacity(data_type.payload_size(3));
        transport
            .read(data_type, 3, handle, buffer.clone())
            .unwrap();
        assert!(!buffer.is_complete());
        transport.poll(Duration::ZERO, Duration::ZERO).unwrap();
        let data = buffer.peek().unwrap().unwrap();
        let reading = dbr::decode(data_type, 3, &data).unwrap();
        assert_eq!(reading.value, CaValue::from(vec![1i32, 2, 3]));
        assert!(reading.metadata.timestamp.is_some());
    }

    #[test]
    fn disconnection_fails_outstanding_reads() {
        let database = PvDatabase::new();
        let _pv = database.add_pv("TEST:FLAKY", 2i32).unwrap();
        let transport = LoopbackTransport::new(database.clone());
        transport.create_context(false).unwrap();
        let handle = transport
            .create_channel("TEST:FLAKY", Arc::new(|_| ()))
            .unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();

        let data_type: DbrType = "LONG".parse().unwrap();
        let buffer = ReadBuffer::with_capacity(data_type.payload_size(1));
        transport.read(data_type, 1, handle, buffer.clone()).unwrap();
        database.set_online("TEST:FLAKY", false).unwrap();

        // Later polls must not wait on the abandoned read
        for _ in 0..3 {
            let start = Instant::now();
            transport
                .poll(Duration::ZERO, Duration::from_secs(1))
                .unwrap();
            assert!(start.elapsed() < Duration::from_millis(500));
        }
        assert_eq!(buffer.peek(), Some(Err(ErrorCondition::Disconn)));
        assert_eq!(transport.channel_state(handle), ChannelState::Searching);
    }

    #[test]
    fn missing_names_connect_when_added() {
        let database = PvDatabase::new();
        let transport = LoopbackTransport::new(database.clone());
        transport.create_context(false).unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let handle = transport
            .create_channel("LATE", counting_connection_handler(connections.clone()))
            .unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(transport.channel_state(handle), ChannelState::Searching);

        let _pv = database.add_pv("LATE", 1i16).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(transport.channel_state(handle), ChannelState::Connected);

        database.set_online("LATE", false).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(transport.channel_state(handle), ChannelState::Searching);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn monitors_follow_stores_until_cancelled() {
        let database = PvDatabase::new();
        let pv = database.add_pv("TEST:MON", 1i32).unwrap();
        let transport = LoopbackTransport::new(database);
        transport.create_context(false).unwrap();
        let handle = transport.create_channel("TEST:MON", Arc::new(|_| ())).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let data_type: DbrType = "LONG".parse().unwrap();
        let subscription = transport
            .subscribe(
                data_type,
                1,
                handle,
                MonitorMask::default(),
                Arc::new(move |args: EventArgs| {
                    let data = args.payload.unwrap();
                    let value = dbr::decode(args.data_type, args.count, &data).unwrap().value;
                    sink.lock().unwrap().push(value);
                }),
            )
            .unwrap();
        pv.store(2);
        pv.store(3);
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CaValue::Long(1), CaValue::Long(2), CaValue::Long(3)]
        );

        pv.store(4);
        transport.unsubscribe(subscription).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn enum_records_accept_state_names() {
        let database = PvDatabase::new();
        let pv = database
            .add_enum_pv("TEST:ENUM", &["Off", "On", "Fault"], 0)
            .unwrap();
        let transport = LoopbackTransport::new(database);
        transport.create_context(false).unwrap();
        let handle = transport.create_channel("TEST:ENUM", Arc::new(|_| ())).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();

        let (_, data) = DbrValue::from("Fault").to_bytes(None);
        transport
            .write(dbr::DBR_BASIC_STRING, 1, handle, data)
            .unwrap();
        assert_eq!(pv.load(), 2);

        let (_, data) = DbrValue::Enum(7).to_bytes(None);
        assert_eq!(
            transport.write("ENUM".parse().unwrap(), 1, handle, data),
            Err(ErrorCondition::PutFail)
        );
    }

    #[test]
    fn preemptive_contexts_deliver_without_polling() {
        let database = PvDatabase::new();
        let _pv = database.add_pv("TEST:PRE", 1.0f32).unwrap();
        let transport = LoopbackTransport::new(database);
        let context = transport.create_context(true).unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let handle = transport
            .create_channel("TEST:PRE", counting_connection_handler(connections.clone()))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while connections.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(transport.channel_state(handle), ChannelState::Connected);

        // Other threads may join a preemptive context
        let other = transport.clone();
        thread::spawn(move || other.attach_context(context))
            .join()
            .unwrap()
            .unwrap();
        transport.destroy_context(context).unwrap();
        assert_eq!(transport.channel_state(handle), ChannelState::Closed);
    }

    #[test]
    fn non_preemptive_contexts_refuse_other_threads() {
        let transport = LoopbackTransport::new(PvDatabase::new());
        let context = transport.create_context(false).unwrap();
        let other = transport.clone();
        let result = thread::spawn(move || other.attach_context(context))
            .join()
            .unwrap();
        assert_eq!(result, Err(ErrorCondition::NotThreaded));
    }

    #[test]
    fn group_writes_wait_for_acknowledgement() {
        let database = PvDatabase::new();
        let _pv = database.add_pv("TEST:SLOW", 0i32).unwrap();
        database
            .configure("TEST:SLOW", |r| r.put_delay = Duration::from_millis(50))
            .unwrap();
        let transport = LoopbackTransport::new(database);
        transport.create_context(false).unwrap();
        let handle = transport.create_channel("TEST:SLOW", Arc::new(|_| ())).unwrap();
        transport
            .poll(Duration::from_millis(1), Duration::ZERO)
            .unwrap();

        let group = transport.group_create().unwrap();
        let (_, data) = DbrValue::from(5i32).to_bytes(None);
        transport
            .group_write(group, "LONG".parse().unwrap(), 1, handle, data)
            .unwrap();
        assert!(!transport.group_test(group).unwrap());
        assert_eq!(
            transport.group_block(group, Duration::from_millis(1)),
            Err(ErrorCondition::Timeout)
        );
        transport.group_block(group, Duration::from_secs(5)).unwrap();
        transport.group_delete(group).unwrap();
        assert_eq!(
            transport.group_test(group),
            Err(ErrorCondition::BadSyncGrp)
        );
    }
}
