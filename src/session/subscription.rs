//! Standing subscriptions to channel value changes.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    dbr::{self, CaValue, DbrCategory, DbrType, Metadata},
    session::{CaError, Channel, Session, SessionInner, failed},
    transport::{
        ChannelHandle, ErrorCondition, EventArgs, EventHandler, MonitorMask, SubscriptionId,
        Transport,
    },
    utils::wrapping_inplace_add,
};

/// A decoded value-change event
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorEvent {
    pub name: String,
    pub handle: ChannelHandle,
    pub data_type: DbrType,
    pub count: usize,
    pub value: CaValue,
    pub metadata: Metadata,
}

pub type MonitorCallback = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

struct MonitorEntry {
    name: String,
    handle: ChannelHandle,
    callback: MonitorCallback,
    /// Unset until the transport has accepted the subscription
    subscription: Option<SubscriptionId>,
}

/// Live subscriptions, looked up by key when the transport delivers an event
#[derive(Default)]
pub(crate) struct MonitorTable {
    next_key: u64,
    entries: HashMap<u64, MonitorEntry>,
}

impl MonitorTable {
    fn insert(&mut self, name: &str, handle: ChannelHandle, callback: MonitorCallback) -> u64 {
        let key = wrapping_inplace_add(&mut self.next_key);
        self.entries.insert(
            key,
            MonitorEntry {
                name: name.to_owned(),
                handle,
                callback,
                subscription: None,
            },
        );
        key
    }

    /// Record the transport subscription behind an entry
    ///
    /// Returns `false` if the entry was cancelled in the meantime.
    fn attach(&mut self, key: u64, id: SubscriptionId) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.subscription = Some(id);
                true
            }
            None => false,
        }
    }

    /// Forget every entry, returning the transport subscriptions to cancel
    pub(crate) fn drain(&mut self) -> Vec<SubscriptionId> {
        self.entries
            .drain()
            .filter_map(|(_, entry)| entry.subscription)
            .collect()
    }

    /// Forget the entries for the given channels
    pub(crate) fn forget_channels(&mut self, handles: &[ChannelHandle]) -> Vec<SubscriptionId> {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| handles.contains(&entry.handle))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .filter_map(|entry| entry.subscription)
            .collect()
    }
}

impl<T: Transport> SessionInner<T> {
    fn on_monitor_event(&self, key: u64, args: EventArgs) {
        let Some((name, callback)) = self
            .monitors
            .lock()
            .unwrap()
            .entries
            .get(&key)
            .map(|entry| (entry.name.clone(), entry.callback.clone()))
        else {
            trace!("Dropping event for cancelled subscription {key}");
            return;
        };
        let payload = match args.payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Subscription event for {name} carried an error: {e}");
                return;
            }
        };
        match dbr::decode(args.data_type, args.count, &payload) {
            Ok(reading) => callback(&MonitorEvent {
                name,
                handle: args.handle,
                data_type: reading.data_type,
                count: reading.count,
                value: reading.value,
                metadata: reading.metadata,
            }),
            Err(e) => self.record_fault(e.into()),
        }
    }

    fn cancel_subscription(&self, key: u64) -> Result<(), CaError> {
        let Some(entry) = self.monitors.lock().unwrap().entries.remove(&key) else {
            return Ok(());
        };
        debug!("Cancelling subscription on {}", entry.name);
        match entry.subscription {
            Some(id) => self
                .transport
                .unsubscribe(id)
                .map_err(failed("unsubscribe")),
            None => Ok(()),
        }
    }
}

fn event_handler<T: Transport>(session: Weak<SessionInner<T>>, key: u64) -> EventHandler {
    Arc::new(move |args: EventArgs| match session.upgrade() {
        Some(inner) => inner.on_monitor_event(key, args),
        None => trace!("Subscription event after session dropped"),
    })
}

/// Keeps a subscription alive; dropping it cancels the subscription
pub struct Subscription<T: Transport> {
    session: Weak<SessionInner<T>>,
    key: u64,
    name: String,
}

impl<T: Transport> Subscription<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel explicitly, reporting any transport failure
    pub fn cancel(mut self) -> Result<(), CaError> {
        let session = std::mem::take(&mut self.session);
        match session.upgrade() {
            Some(inner) => inner.cancel_subscription(self.key),
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade()
            && let Err(e) = inner.cancel_subscription(self.key)
        {
            warn!("Failed to cancel subscription on {}: {e}", self.name);
        }
    }
}

impl<T: Transport> Session<T> {
    /// Subscribe to changes of a connected channel
    ///
    /// `category` selects the metadata delivered alongside each value:
    /// [`DbrCategory::Time`] and [`DbrCategory::Control`] promote the channel's
    /// native type, `CTRL` strings falling back to `TIME`. The callback first
    /// runs with the current value, then on every change selected by `mask`.
    pub fn subscribe(
        &self,
        channel: &Channel,
        category: DbrCategory,
        mask: MonitorMask,
        callback: MonitorCallback,
    ) -> Result<Subscription<T>, CaError> {
        let _span = debug_span!("subscribe", name = channel.name()).entered();
        let connected = self.require_connected(channel)?;
        let native_type = connected.native_type();
        let data_type = match category {
            DbrCategory::Time => DbrType::promote(native_type, true, false),
            DbrCategory::Control => DbrType::promote(native_type, false, true),
            other => DbrType::new(native_type, other),
        };
        let count = connected.element_count();
        if data_type.payload_size(count) > self.inner.config.max_array_bytes {
            return Err(failed("subscribe")(ErrorCondition::TooLarge));
        }
        self.inner.ensure_attached()?;

        let key = self
            .inner
            .monitors
            .lock()
            .unwrap()
            .insert(channel.name(), channel.handle(), callback);
        let subscription = Subscription {
            session: Arc::downgrade(&self.inner),
            key,
            name: channel.name().to_owned(),
        };
        let id = self
            .inner
            .transport
            .subscribe(
                data_type,
                count,
                channel.handle(),
                mask,
                event_handler(Arc::downgrade(&self.inner), key),
            )
            .map_err(failed("subscribe"))?;
        let attached = self.inner.monitors.lock().unwrap().attach(key, id);
        // Cancelled while we were subscribing
        if !attached && let Err(e) = self.inner.transport.unsubscribe(id) {
            debug!("Unsubscribe after cancelling {}: {e}", channel.name());
        }
        debug!("Subscribed as {data_type} x {count}");
        Ok(subscription)
    }

    /// Cancel a subscription; no events for it are delivered afterwards
    pub fn unsubscribe(&self, subscription: Subscription<T>) -> Result<(), CaError> {
        subscription.cancel()
    }
}
