//! Reading and writing channel values.

use std::{
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    dbr::{self, CaValue, DbrBasicType, DbrCategory, DbrType, Metadata, Reading},
    session::{CaError, Channel, ConnectedChannel, Session, SessionInner, failed},
    transport::{ErrorCondition, PutArgs, PutHandler, ReadBuffer, Transport},
};

/// Budgets of the poll run straight after issuing a completion-tracked put
const PUT_EVENT_BUDGET: Duration = Duration::from_micros(100);
const PUT_IO_BUDGET: Duration = Duration::from_millis(50);
/// Arrays get extra polling scaled by their length, up to this many elements
const READ_SCALING_CAP: usize = 1000;

/// Called with the channel name and outcome when a put is acknowledged
///
/// Any data the caller needs alongside the completion is captured by the closure.
pub type PutCallback = Arc<dyn Fn(&str, Result<(), ErrorCondition>) + Send + Sync>;

#[derive(Clone)]
pub enum PutMode {
    /// Issue the write and return
    NoWait,
    /// Block until the write is acknowledged, or the timeout passes
    Wait(Duration),
    /// Return immediately; the callback runs on acknowledgement
    Callback(PutCallback),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PutStatus {
    /// The write was handed to the transport; no acknowledgement was awaited
    Issued,
    Completed,
    TimedOut,
}

/// Outstanding completion-tracked put for one channel name
pub(super) struct PutRecord {
    /// Set once acknowledged
    pub(super) outcome: Option<Result<(), ErrorCondition>>,
    pub(super) callback: Option<PutCallback>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Defaults to the channel's native type
    pub data_type: Option<DbrType>,
    /// Defaults to, and is capped at, the channel's element count
    pub count: Option<usize>,
}

impl GetOptions {
    pub fn data_type(data_type: DbrType) -> Self {
        GetOptions {
            data_type: Some(data_type),
            count: None,
        }
    }
}

impl<T: Transport> SessionInner<T> {
    fn on_put_complete(&self, name: &str, args: PutArgs) {
        let callback = {
            let mut table = self.put_done.lock().unwrap();
            match table.get_mut(name) {
                Some(record) => {
                    record.outcome = Some(args.result);
                    record.callback.take()
                }
                None => {
                    debug!("Put completion for {name} with no outstanding put");
                    None
                }
            }
        };
        if let Err(e) = args.result {
            warn!("Put to {name} failed: {e}");
        }
        if let Some(callback) = callback {
            callback(name, args.result);
        }
    }

    fn put_outcome(&self, name: &str) -> Option<Result<(), ErrorCondition>> {
        self.put_done
            .lock()
            .unwrap()
            .get(name)
            .and_then(|record| record.outcome)
    }

    fn is_put_done(&self, name: &str) -> bool {
        self.put_outcome(name).is_some()
    }
}

fn put_handler<T: Transport>(session: Weak<SessionInner<T>>, name: String) -> PutHandler {
    Arc::new(move |args: PutArgs| match session.upgrade() {
        Some(inner) => inner.on_put_complete(&name, args),
        None => trace!("Put completion for {name} after session dropped"),
    })
}

impl<T: Transport> Session<T> {
    /// Resolve the type and element count a read will use
    fn read_shape(
        &self,
        connected: &ConnectedChannel<'_>,
        options: GetOptions,
    ) -> Result<(DbrType, usize), CaError> {
        let data_type = options
            .data_type
            .unwrap_or_else(|| DbrType::new(connected.native_type(), DbrCategory::Basic));
        let count = options
            .count
            .map_or(connected.element_count(), |c| c.min(connected.element_count()))
            .max(1);
        if data_type.payload_size(count) > self.inner.config.max_array_bytes {
            return Err(failed("read")(ErrorCondition::TooLarge));
        }
        Ok((data_type, count))
    }

    /// Read the current value in the channel's native type
    pub fn get(&self, channel: &Channel) -> Result<CaValue, CaError> {
        Ok(self.get_with(channel, GetOptions::default())?.value)
    }

    /// Read the value, with any metadata the requested type carries
    pub fn get_with(
        &self,
        channel: &Channel,
        options: GetOptions,
    ) -> Result<Reading, CaError> {
        let _span = debug_span!("get", name = channel.name()).entered();
        let connected = self.require_connected(channel)?;
        let (data_type, count) = self.read_shape(&connected, options)?;
        let buffer = ReadBuffer::with_capacity(data_type.payload_size(count));
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .read(data_type, count, channel.handle(), buffer.clone())
            .map_err(failed("read"))?;
        self.poll()?;
        if count > 2 {
            let scale = count.min(READ_SCALING_CAP) as f64;
            self.poll_with(
                Duration::from_secs_f64(scale * 1e-5),
                Duration::from_secs_f64(scale * 0.01),
            )?;
        }
        let payload = match buffer.peek() {
            Some(Ok(payload)) => payload,
            Some(Err(condition)) => return Err(failed("read")(condition)),
            None => return Err(failed("read")(ErrorCondition::Timeout)),
        };
        trace!("Read {} bytes as {data_type}", payload.len());
        Ok(dbr::decode(data_type, count, &payload)?)
    }

    /// Read the value rendered for display
    ///
    /// Character waveforms become text, enumerated values their state name, and
    /// any other multi-element value a short placeholder.
    pub fn get_as_string(&self, channel: &Channel) -> Result<String, CaError> {
        let reading = self.get_with(channel, GetOptions::default())?;
        let native_type = reading.data_type.basic_type;
        Ok(match &reading.value {
            CaValue::Array(dbr::DbrValue::Char(chars))
                if reading.count < self.inner.config.auto_monitor_max_length =>
            {
                let text: String = chars
                    .iter()
                    .filter(|c| **c > 0)
                    .map(|c| *c as u8 as char)
                    .collect();
                text.trim().to_owned()
            }
            CaValue::Enum(index) => {
                let states = self.enum_strings(channel)?.unwrap_or_default();
                states
                    .get(usize::from(*index))
                    .cloned()
                    .unwrap_or_else(|| index.to_string())
            }
            CaValue::Array(_) => format!(
                "<array count={}, type={}>",
                reading.count, native_type as u16
            ),
            scalar => scalar.to_string(),
        })
    }

    /// Write a value to a channel
    ///
    /// The value is encoded to the channel's native type and full element
    /// count. Only one completion-tracked put per channel name is tracked at a
    /// time: a second one issued before the first completes replaces its
    /// record, and the first acknowledgement to arrive completes the second.
    pub fn put(
        &self,
        channel: &Channel,
        value: impl Into<CaValue>,
        mode: PutMode,
    ) -> Result<PutStatus, CaError> {
        let _span = debug_span!("put", name = channel.name()).entered();
        let connected = self.require_connected(channel)?;
        let value = value.into();
        let encoded = dbr::encode_put(&value, connected.native_type(), connected.element_count())?;
        let data_type = DbrType::new(encoded.get_type(), DbrCategory::Basic);
        let (count, data) = encoded.to_bytes(None);
        self.inner.ensure_attached()?;

        let callback = match mode {
            PutMode::NoWait => {
                self.inner
                    .transport
                    .write(data_type, count, channel.handle(), data)
                    .map_err(failed("put"))?;
                self.poll()?;
                return Ok(PutStatus::Issued);
            }
            PutMode::Wait(_) => None,
            PutMode::Callback(ref callback) => Some(callback.clone()),
        };

        let name = channel.name().to_owned();
        let record = PutRecord {
            outcome: None,
            callback,
        };
        let previous = self
            .inner
            .put_done
            .lock()
            .unwrap()
            .insert(name.clone(), record);
        if previous.is_some_and(|p| p.outcome.is_none()) {
            debug!("Replacing an unfinished put on {name}");
        }
        if let Err(e) = self.inner.transport.write_with_callback(
            data_type,
            count,
            channel.handle(),
            data,
            put_handler(Arc::downgrade(&self.inner), name.clone()),
        ) {
            self.inner.put_done.lock().unwrap().remove(&name);
            return Err(failed("put")(e));
        }
        self.poll_with(PUT_EVENT_BUDGET, PUT_IO_BUDGET)?;

        match mode {
            PutMode::Wait(timeout) => {
                let inner = &self.inner;
                if !inner.wait_until(timeout, || inner.is_put_done(&name))? {
                    debug!("Put on {name} not acknowledged within {timeout:?}");
                    return Ok(PutStatus::TimedOut);
                }
                match inner.put_outcome(&name) {
                    Some(Err(condition)) => Err(failed("put")(condition)),
                    _ => Ok(PutStatus::Completed),
                }
            }
            _ => Ok(PutStatus::Issued),
        }
    }

    /// Blocking put bounded by the configured put timeout
    pub fn put_wait(
        &self,
        channel: &Channel,
        value: impl Into<CaValue>,
    ) -> Result<PutStatus, CaError> {
        self.put(channel, value, PutMode::Wait(self.inner.config.put_timeout))
    }

    /// Whether the last completion-tracked put on this channel has been acknowledged
    pub fn put_complete(&self, channel: &Channel) -> bool {
        self.inner.is_put_done(channel.name())
    }

    /// Metadata of the `CTRL` variant of the channel's type
    pub fn ctrl_vars(&self, channel: &Channel) -> Result<Metadata, CaError> {
        let native_type = self.require_connected(channel)?.native_type();
        let options = GetOptions {
            data_type: Some(DbrType::promote(native_type, false, true)),
            count: Some(1),
        };
        Ok(self.get_with(channel, options)?.metadata)
    }

    /// Metadata of the `TIME` variant of the channel's type
    pub fn time_vars(&self, channel: &Channel) -> Result<Metadata, CaError> {
        let native_type = self.require_connected(channel)?.native_type();
        let options = GetOptions {
            data_type: Some(DbrType::promote(native_type, true, false)),
            count: Some(1),
        };
        Ok(self.get_with(channel, options)?.metadata)
    }

    pub fn timestamp(&self, channel: &Channel) -> Result<Option<SystemTime>, CaError> {
        Ok(self.time_vars(channel)?.timestamp)
    }

    pub fn severity(&self, channel: &Channel) -> Result<i16, CaError> {
        Ok(self.time_vars(channel)?.severity().unwrap_or(0))
    }

    /// Display precision; always 0 for non floating-point channels
    pub fn precision(&self, channel: &Channel) -> Result<i16, CaError> {
        let native_type = self.require_connected(channel)?.native_type();
        if !matches!(native_type, DbrBasicType::Float | DbrBasicType::Double) {
            return Ok(0);
        }
        Ok(self.ctrl_vars(channel)?.precision.unwrap_or(0))
    }

    /// State names of an enumerated channel, or `None` for any other type
    pub fn enum_strings(
        &self,
        channel: &Channel,
    ) -> Result<Option<Vec<String>>, CaError> {
        if self.require_connected(channel)?.native_type() != DbrBasicType::Enum {
            return Ok(None);
        }
        Ok(self.ctrl_vars(channel)?.enum_strings)
    }
}
