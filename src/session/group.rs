//! Synchronous groups: batches of gets and puts completed together.

use std::time::{Duration, Instant};

use tracing::{debug, debug_span};

use crate::{
    dbr::{self, CaValue, DbrCategory, DbrType, Reading},
    session::{CaError, Channel, Session, failed},
    transport::{ErrorCondition, GroupId, ReadBuffer, Transport},
};

/// Longest single blocking call made into the transport while a group waits
const BLOCK_STEP: Duration = Duration::from_millis(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncGroup {
    id: GroupId,
}

impl SyncGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }
}

/// The eventual result of a [`Session::group_get`]
///
/// Only decodable once [`Session::group_block`] or [`Session::group_test`]
/// has reported the group complete.
#[derive(Clone, Debug)]
pub struct PendingValue {
    name: String,
    data_type: DbrType,
    count: usize,
    buffer: ReadBuffer,
}

impl PendingValue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DbrType {
        self.data_type
    }

    pub fn is_ready(&self) -> bool {
        self.buffer.is_complete()
    }

    pub fn reading(&self) -> Result<Reading, CaError> {
        match self.buffer.peek() {
            None => Err(CaError::Pending(self.name.clone())),
            Some(Err(condition)) => Err(failed("group_get")(condition)),
            Some(Ok(payload)) => Ok(dbr::decode(self.data_type, self.count, &payload)?),
        }
    }

    pub fn value(&self) -> Result<CaValue, CaError> {
        Ok(self.reading()?.value)
    }
}

impl<T: Transport> Session<T> {
    pub fn create_group(&self) -> Result<SyncGroup, CaError> {
        self.inner.ensure_attached()?;
        let id = self
            .inner
            .transport
            .group_create()
            .map_err(failed("group_create"))?;
        debug!("Created synchronous group {}", id.0);
        Ok(SyncGroup { id })
    }

    /// Queue a read in the group; `data_type` defaults to the native type
    pub fn group_get(
        &self,
        group: &SyncGroup,
        channel: &Channel,
        data_type: Option<DbrType>,
    ) -> Result<PendingValue, CaError> {
        let connected = self.require_connected(channel)?;
        let data_type = data_type
            .unwrap_or_else(|| DbrType::new(connected.native_type(), DbrCategory::Basic));
        let count = connected.element_count();
        let size = data_type.payload_size(count);
        if size > self.inner.config.max_array_bytes {
            return Err(failed("group_get")(ErrorCondition::TooLarge));
        }
        let buffer = ReadBuffer::with_capacity(size);
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .group_read(group.id, data_type, count, channel.handle(), buffer.clone())
            .map_err(failed("group_get"))?;
        Ok(PendingValue {
            name: channel.name().to_owned(),
            data_type,
            count,
            buffer,
        })
    }

    /// Queue a write in the group
    ///
    /// Completion is only observable for the group as a whole.
    pub fn group_put(
        &self,
        group: &SyncGroup,
        channel: &Channel,
        value: impl Into<CaValue>,
    ) -> Result<(), CaError> {
        let connected = self.require_connected(channel)?;
        let encoded = dbr::encode_put(
            &value.into(),
            connected.native_type(),
            connected.element_count(),
        )?;
        let data_type = DbrType::new(encoded.get_type(), DbrCategory::Basic);
        let (count, data) = encoded.to_bytes(None);
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .group_write(group.id, data_type, count, channel.handle(), data)
            .map_err(failed("group_put"))
    }

    /// Wait for every queued operation to complete
    ///
    /// Returns `false` if `timeout` (by default the configured group timeout)
    /// passes first. Callbacks keep being delivered while waiting.
    pub fn group_block(
        &self,
        group: &SyncGroup,
        timeout: Option<Duration>,
    ) -> Result<bool, CaError> {
        let _span = debug_span!("group_block", group = group.id.0).entered();
        let timeout = timeout.unwrap_or(self.inner.config.group_timeout);
        let deadline = Instant::now() + timeout;
        self.inner.ensure_attached()?;
        loop {
            let now = Instant::now();
            let step = deadline.saturating_duration_since(now).min(BLOCK_STEP);
            match self.inner.transport.group_block(group.id, step) {
                Ok(()) => return Ok(true),
                Err(ErrorCondition::Timeout) => (),
                Err(e) => return Err(failed("group_block")(e)),
            }
            if Instant::now() >= deadline {
                debug!("Group incomplete after {timeout:?}");
                return Ok(false);
            }
            self.inner.poll_with(BLOCK_STEP, Duration::ZERO)?;
        }
    }

    /// Whether every queued operation has completed, without waiting
    pub fn group_test(&self, group: &SyncGroup) -> Result<bool, CaError> {
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .group_test(group.id)
            .map_err(failed("group_test"))
    }

    /// Discard every queued operation, keeping the group
    pub fn group_reset(&self, group: &SyncGroup) -> Result<(), CaError> {
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .group_reset(group.id)
            .map_err(failed("group_reset"))
    }

    pub fn group_delete(&self, group: SyncGroup) -> Result<(), CaError> {
        self.inner.ensure_attached()?;
        self.inner
            .transport
            .group_delete(group.id)
            .map_err(failed("group_delete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_values_decode_once_filled() {
        let pending = PendingValue {
            name: "TEST:A".into(),
            data_type: "LONG".parse().unwrap(),
            count: 1,
            buffer: ReadBuffer::with_capacity(4),
        };
        assert!(!pending.is_ready());
        assert_eq!(
            pending.value(),
            Err(CaError::Pending("TEST:A".into()))
        );
        pending.buffer.fill(Ok(vec![0, 0, 0, 42]));
        assert!(pending.is_ready());
        assert_eq!(pending.value(), Ok(CaValue::Long(42)));
    }
}
