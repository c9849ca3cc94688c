//! The contract between the session layer and the transport that performs the
//! actual Channel Access exchange.
//!
//! A transport owns wire framing, network retries and the raw byte payloads. The
//! session layer above only ever talks to it through [`Transport`], handing over
//! encoded DBR payloads and receiving them back through handlers and
//! [`ReadBuffer`]s. Handlers may be invoked inline inside [`Transport::poll`]
//! (non-preemptive contexts) or from a transport-owned thread (preemptive ones).

use std::{
    fmt::{self, Display},
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;

use crate::dbr::{DbrBasicType, DbrType};

pub mod loopback;

/// Identifies one client context
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

/// Opaque channel identity issued by the transport
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    NeverSearched,
    Searching,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// Status codes returned by transport operations
///
/// A plain `Ok` is the normal-success sentinel, and [`ErrorCondition::Timeout`]
/// doubles as the I/O-pending sentinel from [`Transport::poll`]. Everything else
/// is a failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ErrorCondition {
    #[error("Unable to allocate additional dynamic memory")]
    AllocMem = 6,
    #[error("The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES")]
    TooLarge = 9,
    #[error("User specified timeout on IO operation expired")]
    Timeout = 10,
    #[error("The data type specified is invalid")]
    BadType = 14,
    #[error("Channel Access Internal Failure")]
    Internal = 17,
    #[error("Channel read request failed")]
    GetFail = 19,
    #[error("Channel write request failed")]
    PutFail = 20,
    #[error("Invalid element count requested")]
    BadCount = 22,
    #[error("Invalid string")]
    BadStr = 23,
    #[error("Virtual circuit disconnect")]
    Disconn = 24,
    #[error("Bad event subscription (monitor) identifier")]
    BadMonId = 30,
    #[error("Invalid event selection mask")]
    BadMask = 41,
    #[error("IO operations are in progress")]
    IoInProgress = 43,
    #[error("Invalid synchronous group identifier")]
    BadSyncGrp = 44,
    #[error("Put callback timed out")]
    PutCbInProg = 45,
    #[error("Read access denied")]
    NoRdAccess = 46,
    #[error("Write access denied")]
    NoWtAccess = 47,
    #[error("No reasonable data conversion between client and server types")]
    NoConvert = 50,
    #[error("Invalid channel identifier")]
    BadChId = 51,
    #[error("Thread is already attached to a client context")]
    IsAttached = 53,
    #[error("User destroyed channel")]
    ChanDestroy = 55,
    #[error("Preemptive callback not enabled - additional threads may not join context")]
    NotThreaded = 57,
}

impl ErrorCondition {
    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::AllocMem => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::IoInProgress => ErrorSeverity::Info,
            Self::BadSyncGrp => ErrorSeverity::Error,
            Self::PutCbInProg => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::IsAttached => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
            Self::NotThreaded => ErrorSeverity::Error,
        }
    }
}

/// Which kinds of change a subscription wants to hear about
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl MonitorMask {
    pub fn bits(&self) -> u16 {
        u16::from(self.value)
            | u16::from(self.log) << 1
            | u16::from(self.alarm) << 2
            | u16::from(self.property) << 3
    }
    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }
}

impl Default for MonitorMask {
    /// Value, log and alarm changes
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: true,
            alarm: true,
            property: false,
        }
    }
}

impl From<u16> for MonitorMask {
    fn from(bits: u16) -> Self {
        MonitorMask {
            value: bits & 1 != 0,
            log: bits & 2 != 0,
            alarm: bits & 4 != 0,
            property: bits & 8 != 0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ConnectionArgs {
    pub handle: ChannelHandle,
    pub connected: bool,
}

#[derive(Clone, Debug)]
pub struct EventArgs {
    pub handle: ChannelHandle,
    pub data_type: DbrType,
    pub count: usize,
    pub payload: Result<Vec<u8>, ErrorCondition>,
}

#[derive(Copy, Clone, Debug)]
pub struct PutArgs {
    pub handle: ChannelHandle,
    pub result: Result<(), ErrorCondition>,
}

pub type ConnectionHandler = Arc<dyn Fn(ConnectionArgs) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(EventArgs) + Send + Sync>;
pub type PutHandler = Arc<dyn Fn(PutArgs) + Send + Sync>;

#[derive(Debug, Default)]
struct ReadSlot {
    capacity: usize,
    result: Option<Result<Vec<u8>, ErrorCondition>>,
}

/// Receive buffer for a read request, filled in by the transport
///
/// Clones share the same slot, so the transport keeps one and the caller the
/// other.
#[derive(Clone, Debug, Default)]
pub struct ReadBuffer {
    slot: Arc<Mutex<ReadSlot>>,
}

impl ReadBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ReadBuffer {
            slot: Arc::new(Mutex::new(ReadSlot {
                capacity,
                result: None,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slot.lock().unwrap().capacity
    }

    /// Complete the read. Payloads larger than the buffer are refused.
    pub fn fill(&self, result: Result<Vec<u8>, ErrorCondition>) {
        let mut slot = self.slot.lock().unwrap();
        slot.result = Some(match result {
            Ok(data) if data.len() > slot.capacity => Err(ErrorCondition::TooLarge),
            other => other,
        });
    }

    pub fn is_complete(&self) -> bool {
        self.slot.lock().unwrap().result.is_some()
    }

    /// A copy of the result, if the read has completed
    pub fn peek(&self) -> Option<Result<Vec<u8>, ErrorCondition>> {
        self.slot.lock().unwrap().result.clone()
    }
}

/// Primitive operations offered by a Channel Access transport
///
/// Contexts are attached per thread: every call other than the context
/// management ones acts on the context attached to the calling thread.
pub trait Transport: Send + Sync + 'static {
    fn create_context(&self, preemptive: bool) -> Result<ContextId, ErrorCondition>;
    fn destroy_context(&self, context: ContextId) -> Result<(), ErrorCondition>;
    fn attach_context(&self, context: ContextId) -> Result<(), ErrorCondition>;
    fn current_context(&self) -> Option<ContextId>;

    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelHandle, ErrorCondition>;
    fn clear_channel(&self, handle: ChannelHandle) -> Result<(), ErrorCondition>;
    fn channel_state(&self, handle: ChannelHandle) -> ChannelState;
    fn name(&self, handle: ChannelHandle) -> Option<String>;
    /// Zero until the channel has connected at least once
    fn element_count(&self, handle: ChannelHandle) -> usize;
    fn field_type(&self, handle: ChannelHandle) -> Option<DbrBasicType>;
    fn read_access(&self, handle: ChannelHandle) -> bool;
    fn write_access(&self, handle: ChannelHandle) -> bool;
    fn host_name(&self, handle: ChannelHandle) -> Option<String>;

    fn read(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        buffer: ReadBuffer,
    ) -> Result<(), ErrorCondition>;
    fn write(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
    ) -> Result<(), ErrorCondition>;
    fn write_with_callback(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
        on_complete: PutHandler,
    ) -> Result<(), ErrorCondition>;
    fn subscribe(
        &self,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        mask: MonitorMask,
        on_event: EventHandler,
    ) -> Result<SubscriptionId, ErrorCondition>;
    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ErrorCondition>;

    /// Run due callbacks for up to `event_budget`, then wait up to `io_budget`
    /// for outstanding reads. `Err(Timeout)` means reads are still pending.
    fn poll(&self, event_budget: Duration, io_budget: Duration) -> Result<(), ErrorCondition>;
    fn flush(&self) -> Result<(), ErrorCondition>;

    fn group_create(&self) -> Result<GroupId, ErrorCondition>;
    fn group_delete(&self, group: GroupId) -> Result<(), ErrorCondition>;
    fn group_reset(&self, group: GroupId) -> Result<(), ErrorCondition>;
    /// `Err(Timeout)` if the group did not complete in time
    fn group_block(&self, group: GroupId, timeout: Duration) -> Result<(), ErrorCondition>;
    fn group_test(&self, group: GroupId) -> Result<bool, ErrorCondition>;
    fn group_read(
        &self,
        group: GroupId,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        buffer: ReadBuffer,
    ) -> Result<(), ErrorCondition>;
    fn group_write(
        &self,
        group: GroupId,
        data_type: DbrType,
        count: usize,
        handle: ChannelHandle,
        data: Vec<u8>,
    ) -> Result<(), ErrorCondition>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits() {
        assert_eq!(MonitorMask::default().bits(), 7);
        assert_eq!(MonitorMask::from(9u16).bits(), 9);
        assert!(MonitorMask::from(0u16).is_empty());
    }

    #[test]
    fn read_buffer_refuses_oversized_payloads() {
        let buffer = ReadBuffer::with_capacity(4);
        let transport_side = buffer.clone();
        assert!(!buffer.is_complete());
        transport_side.fill(Ok(vec![0u8; 8]));
        assert_eq!(buffer.peek(), Some(Err(ErrorCondition::TooLarge)));
        transport_side.fill(Ok(vec![1, 2]));
        assert_eq!(buffer.peek(), Some(Ok(vec![1, 2])));
    }

    #[test]
    fn condition_messages() {
        assert_eq!(
            ErrorCondition::NoWtAccess.to_string(),
            "Write access denied"
        );
        assert!(matches!(
            ErrorCondition::Internal.get_severity(),
            ErrorSeverity::Severe
        ));
    }
}
