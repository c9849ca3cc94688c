//! Channel creation, connection waits and connection events.

use std::{
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    cache::ConnectionCallback,
    dbr::DbrBasicType,
    session::{CaError, Session, SessionInner, failed},
    transport::{
        ChannelHandle, ChannelState, ConnectionArgs, ConnectionHandler, ContextId, Transport,
    },
};

/// Event budget of the extra poll run before connection listeners are called
const SETTLE_EVENT_BUDGET: Duration = Duration::from_millis(1);
const SETTLE_IO_BUDGET: Duration = Duration::from_secs(10);

/// A named channel within one context of a session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    handle: ChannelHandle,
    context: ContextId,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }
    pub fn context(&self) -> ContextId {
        self.context
    }
}

/// Proof that a channel was connected, with its native shape
///
/// Only obtainable through [`Session::require_connected`].
#[derive(Clone, Debug)]
pub struct ConnectedChannel<'a> {
    channel: &'a Channel,
    native_type: DbrBasicType,
    element_count: usize,
}

impl ConnectedChannel<'_> {
    pub fn channel(&self) -> &Channel {
        self.channel
    }
    pub fn native_type(&self) -> DbrBasicType {
        self.native_type
    }
    pub fn element_count(&self) -> usize {
        self.element_count
    }
}

/// What the cache knows about a channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelStatus {
    pub connected: bool,
    pub failures: u32,
    pub last_attempt: Option<SystemTime>,
    pub listeners: usize,
}

impl<T: Transport> SessionInner<T> {
    /// Handle a connection event from the transport
    fn on_connection(&self, name: &str, args: ConnectionArgs) {
        let _span = debug_span!("connection", name = name, handle = args.handle.0).entered();
        let context = {
            let cache = self.cache.lock().unwrap();
            self.transport
                .current_context()
                .or_else(|| cache.fallback_context())
        };
        let Some(context) = context else {
            warn!("Connection event with no known context");
            return;
        };
        let listeners = {
            let mut cache = self.cache.lock().unwrap();
            match cache.record_connection(context, name, args.handle, args.connected) {
                Ok(entry) => entry.listeners.clone(),
                Err(mismatch) => {
                    self.record_fault(mismatch.into());
                    return;
                }
            }
        };
        debug!("Channel is now {}", if args.connected { "connected" } else { "disconnected" });
        if listeners.is_empty() {
            return;
        }
        // Let access rights and the rest of the channel metadata arrive first
        if let Err(e) = self.poll_with(SETTLE_EVENT_BUDGET, SETTLE_IO_BUDGET) {
            self.record_fault(e);
        }
        for listener in listeners {
            listener(name, args.handle, args.connected);
        }
    }
}

fn connection_handler<T: Transport>(session: Weak<SessionInner<T>>, name: String) -> ConnectionHandler {
    Arc::new(move |args: ConnectionArgs| match session.upgrade() {
        Some(inner) => inner.on_connection(&name, args),
        None => trace!("Connection event for {name} after session dropped"),
    })
}

impl<T: Transport> Session<T> {
    /// Look up or create the channel `name` in the calling thread's context
    ///
    /// `on_connect` is added to the channel's listeners. If the channel is
    /// already connected it is also called straight away, unless it was
    /// registered before. One poll cycle is run before returning, and if
    /// `wait` is set, up to the configured connection timeout is spent waiting
    /// for the connection. Not connecting in time is not an error.
    pub fn create_channel(
        &self,
        name: &str,
        wait: bool,
        on_connect: Option<ConnectionCallback>,
    ) -> Result<Channel, CaError> {
        let _span = debug_span!("create_channel", name = name).entered();
        let context = self.inner.ensure_attached()?;
        let (handle, immediate) = {
            // Held across the transport call so concurrent creators share one handle
            let mut cache = self.inner.cache.lock().unwrap();
            let entry = cache.ensure(context, name);
            let mut immediate = None;
            if let Some(listener) = on_connect {
                let connected = entry.connected;
                if entry.add_listener(listener.clone()) && connected {
                    immediate = Some(listener);
                }
            }
            let handle = match entry.handle {
                Some(handle) => handle,
                None => {
                    let handle = self
                        .inner
                        .transport
                        .create_channel(
                            name,
                            connection_handler(Arc::downgrade(&self.inner), name.to_owned()),
                        )
                        .map_err(failed("create_channel"))?;
                    entry.handle = Some(handle);
                    debug!("Created channel with handle {handle}");
                    handle
                }
            };
            (handle, immediate)
        };
        if let Some(listener) = immediate {
            listener(name, handle, true);
        }
        let channel = Channel {
            name: name.to_owned(),
            handle,
            context,
        };
        self.poll()?;
        if wait {
            self.connect_channel(&channel, self.inner.config.connection_timeout)?;
        }
        Ok(channel)
    }

    /// Wait up to `timeout` for a channel to connect
    ///
    /// Returns `false` on timeout, after counting the failure in the cache.
    pub fn connect_channel(&self, channel: &Channel, timeout: Duration) -> Result<bool, CaError> {
        self.validate(channel)?;
        let transport = &self.inner.transport;
        let connected = self.inner.wait_until(timeout, || {
            transport.channel_state(channel.handle) == ChannelState::Connected
        })?;
        if !connected {
            debug!("{} did not connect within {timeout:?}", channel.name);
            self.inner
                .cache
                .lock()
                .unwrap()
                .record_failure(channel.context, &channel.name);
        }
        Ok(connected)
    }

    /// Check that `channel` is one this session created and has not cleared
    pub fn validate(&self, channel: &Channel) -> Result<(), CaError> {
        if self.is_closed() {
            return Err(CaError::Closed);
        }
        let cache = self.inner.cache.lock().unwrap();
        match cache.get(channel.context, &channel.name) {
            Some(entry) if entry.handle == Some(channel.handle) => Ok(()),
            _ => Err(CaError::InvalidChannel(channel.name.clone())),
        }
    }

    /// Guard for operations needing a live connection
    pub fn require_connected<'a>(
        &self,
        channel: &'a Channel,
    ) -> Result<ConnectedChannel<'a>, CaError> {
        self.validate(channel)?;
        let transport = &self.inner.transport;
        if transport.channel_state(channel.handle) != ChannelState::Connected {
            return Err(CaError::NotConnected(channel.name.clone()));
        }
        let native_type = transport
            .field_type(channel.handle)
            .ok_or_else(|| CaError::NoFieldType(channel.name.clone()))?;
        Ok(ConnectedChannel {
            channel,
            native_type,
            element_count: transport.element_count(channel.handle).max(1),
        })
    }

    /// Remove a channel from the cache and release it in the transport
    pub fn clear_channel(&self, channel: &Channel) -> Result<(), CaError> {
        self.validate(channel)?;
        self.inner
            .cache
            .lock()
            .unwrap()
            .remove(channel.context, &channel.name);
        self.inner.put_done.lock().unwrap().remove(&channel.name);
        let subscriptions = self
            .inner
            .monitors
            .lock()
            .unwrap()
            .forget_channels(&[channel.handle]);
        for id in subscriptions {
            if let Err(e) = self.inner.transport.unsubscribe(id) {
                debug!("Unsubscribe while clearing {}: {e}", channel.name);
            }
        }
        self.inner
            .transport
            .clear_channel(channel.handle)
            .map_err(failed("clear_channel"))
    }

    pub fn channel_status(&self, channel: &Channel) -> Result<ChannelStatus, CaError> {
        self.validate(channel)?;
        let cache = self.inner.cache.lock().unwrap();
        match cache.get(channel.context, &channel.name) {
            Some(entry) if entry.handle == Some(channel.handle) => Ok(ChannelStatus {
                connected: entry.connected,
                failures: entry.failures,
                last_attempt: entry.last_attempt,
                listeners: entry.listeners.len(),
            }),
            _ => Err(CaError::InvalidChannel(channel.name.clone())),
        }
    }

    pub fn state(&self, channel: &Channel) -> Result<ChannelState, CaError> {
        self.validate(channel)?;
        Ok(self.inner.transport.channel_state(channel.handle))
    }

    pub fn is_connected(&self, channel: &Channel) -> Result<bool, CaError> {
        Ok(self.state(channel)? == ChannelState::Connected)
    }

    /// The name as reported by the transport
    pub fn name(&self, channel: &Channel) -> Result<String, CaError> {
        self.validate(channel)?;
        self.inner
            .transport
            .name(channel.handle)
            .ok_or_else(|| CaError::InvalidChannel(channel.name.clone()))
    }

    pub fn host_name(&self, channel: &Channel) -> Result<String, CaError> {
        let connected = self.require_connected(channel)?;
        Ok(self
            .inner
            .transport
            .host_name(connected.channel.handle)
            .unwrap_or_default())
    }

    pub fn element_count(&self, channel: &Channel) -> Result<usize, CaError> {
        Ok(self.require_connected(channel)?.element_count)
    }

    pub fn field_type(&self, channel: &Channel) -> Result<DbrBasicType, CaError> {
        Ok(self.require_connected(channel)?.native_type)
    }

    pub fn read_access(&self, channel: &Channel) -> Result<bool, CaError> {
        let connected = self.require_connected(channel)?;
        Ok(self.inner.transport.read_access(connected.channel.handle))
    }

    pub fn write_access(&self, channel: &Channel) -> Result<bool, CaError> {
        let connected = self.require_connected(channel)?;
        Ok(self.inner.transport.write_access(connected.channel.handle))
    }

    /// Access rights as text, for display
    pub fn access(&self, channel: &Channel) -> Result<&'static str, CaError> {
        Ok(
            match (self.read_access(channel)?, self.write_access(channel)?) {
                (false, false) => "no access",
                (true, false) => "read-only",
                (false, true) => "write-only",
                (true, true) => "read/write",
            },
        )
    }
}
