//! The channel cache: what a session knows about each (context, name) pair.
//!
//! The cache never talks to the transport. It is mutated by channel creation and
//! by connection events, and always under the session's cache lock, which is
//! never held while a poll runs.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug, Display},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;

use crate::transport::{ChannelHandle, ContextId};

/// Called with `(name, handle, connected)` on every connection state change
pub type ConnectionCallback = Arc<dyn Fn(&str, ChannelHandle, bool) + Send + Sync>;

/// A cached channel disagrees with the transport about its own identity
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Channel {name} is cached with handle {cached}, but the transport reported {reported}")]
pub struct HandleMismatch {
    pub name: String,
    pub cached: ChannelHandle,
    pub reported: ChannelHandle,
}

#[derive(Clone)]
pub struct ChannelEntry {
    pub name: String,
    pub context: ContextId,
    /// Only `None` between creating the entry and the transport issuing a handle
    pub handle: Option<ChannelHandle>,
    pub connected: bool,
    /// Time of the last connection transition or failed connection attempt
    pub last_attempt: Option<SystemTime>,
    /// Failed connection attempts since the last connection event
    pub failures: u32,
    /// Notified in insertion order
    pub listeners: Vec<ConnectionCallback>,
}

impl Debug for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("handle", &self.handle)
            .field("connected", &self.connected)
            .field("last_attempt", &self.last_attempt)
            .field("failures", &self.failures)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ChannelEntry {
    fn new(context: ContextId, name: &str) -> Self {
        ChannelEntry {
            name: name.to_owned(),
            context,
            handle: None,
            connected: false,
            last_attempt: None,
            failures: 0,
            listeners: Vec::new(),
        }
    }

    pub fn has_listener(&self, listener: &ConnectionCallback) -> bool {
        self.listeners.iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Register a listener once. Returns false if it was already registered.
    pub fn add_listener(&mut self, listener: ConnectionCallback) -> bool {
        if self.has_listener(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }
}

#[derive(Debug, Default)]
pub struct Cache {
    contexts: BTreeMap<ContextId, HashMap<String, ChannelEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    pub fn add_context(&mut self, context: ContextId) {
        self.contexts.entry(context).or_default();
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.contexts.keys().copied().collect()
    }

    /// The context assumed when a connection event arrives on a thread with none
    pub fn fallback_context(&self) -> Option<ContextId> {
        self.contexts.keys().next().copied()
    }

    /// Fetch the entry for a channel, creating an unconnected one if needed
    pub fn ensure(&mut self, context: ContextId, name: &str) -> &mut ChannelEntry {
        self.contexts
            .entry(context)
            .or_default()
            .entry(name.to_owned())
            .or_insert_with(|| ChannelEntry::new(context, name))
    }

    pub fn get(&self, context: ContextId, name: &str) -> Option<&ChannelEntry> {
        self.contexts.get(&context)?.get(name)
    }

    pub fn get_mut(&mut self, context: ContextId, name: &str) -> Option<&mut ChannelEntry> {
        self.contexts.get_mut(&context)?.get_mut(name)
    }

    /// Upsert the result of a connection event
    ///
    /// A cached handle must match the reported one; a mismatch leaves the entry
    /// untouched.
    pub fn record_connection(
        &mut self,
        context: ContextId,
        name: &str,
        handle: ChannelHandle,
        connected: bool,
    ) -> Result<&mut ChannelEntry, HandleMismatch> {
        let entry = self.ensure(context, name);
        if let Some(cached) = entry.handle
            && cached != handle
        {
            return Err(HandleMismatch {
                name: name.to_owned(),
                cached,
                reported: handle,
            });
        }
        entry.handle = Some(handle);
        entry.connected = connected;
        entry.last_attempt = Some(SystemTime::now());
        entry.failures = 0;
        Ok(entry)
    }

    /// Note a connection wait that ran out of time
    pub fn record_failure(&mut self, context: ContextId, name: &str) {
        let entry = self.ensure(context, name);
        entry.last_attempt = Some(SystemTime::now());
        entry.failures += 1;
    }

    pub fn remove(&mut self, context: ContextId, name: &str) -> Option<ChannelEntry> {
        self.contexts.get_mut(&context)?.remove(name)
    }

    /// Drop a context and every channel it owns, returning the channels
    pub fn destroy_context(&mut self, context: ContextId) -> Vec<ChannelEntry> {
        self.contexts
            .remove(&context)
            .map(|channels| channels.into_values().collect())
            .unwrap_or_default()
    }

    /// Remove every channel, keeping the contexts
    pub fn clear_channels(&mut self) -> Vec<ChannelEntry> {
        self.contexts
            .values_mut()
            .flat_map(|channels| channels.drain().map(|(_, entry)| entry))
            .collect()
    }

    pub fn dump(&self) -> CacheDump {
        let mut rows: Vec<CacheRow> = self
            .contexts
            .iter()
            .flat_map(|(context, channels)| {
                channels.values().map(|entry| CacheRow {
                    context: *context,
                    name: entry.name.clone(),
                    handle: entry.handle,
                    connected: entry.connected,
                })
            })
            .collect();
        rows.sort_by(|a, b| (a.context, &a.name).cmp(&(b.context, &b.name)));
        CacheDump(rows)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheRow {
    pub context: ContextId,
    pub name: String,
    pub handle: Option<ChannelHandle>,
    pub connected: bool,
}

/// Snapshot of the whole cache, for diagnostics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheDump(pub Vec<CacheRow>);

impl Display for CacheDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#  PVName        ChannelID/Context Connected?")?;
        writeln!(f, "#--------------------------------------------")?;
        for row in &self.0 {
            let handle = row
                .handle
                .map(|h| h.to_string())
                .unwrap_or_else(|| "None".to_owned());
            writeln!(
                f,
                " {:<15} {}/{}  {}",
                row.name, handle, row.context, row.connected
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_upserts_and_resets_failures() {
        let mut cache = Cache::new();
        let context = ContextId(1);
        cache.ensure(context, "A");
        cache.record_failure(context, "A");
        cache.record_failure(context, "A");
        assert_eq!(cache.get(context, "A").unwrap().failures, 2);

        let entry = cache
            .record_connection(context, "A", ChannelHandle(7), true)
            .unwrap();
        assert_eq!(entry.failures, 0);
        assert!(entry.connected);
        assert!(entry.last_attempt.is_some());

        // Events for names never created are still cached
        cache
            .record_connection(context, "B", ChannelHandle(8), true)
            .unwrap();
        assert_eq!(cache.dump().0.len(), 2);
    }

    #[test]
    fn handle_mismatch_is_refused() {
        let mut cache = Cache::new();
        let context = ContextId(1);
        cache
            .record_connection(context, "A", ChannelHandle(1), true)
            .unwrap();
        let err = cache
            .record_connection(context, "A", ChannelHandle(2), false)
            .unwrap_err();
        assert_eq!(
            err,
            HandleMismatch {
                name: "A".into(),
                cached: ChannelHandle(1),
                reported: ChannelHandle(2)
            }
        );
        let entry = cache.get(context, "A").unwrap();
        assert_eq!(entry.handle, Some(ChannelHandle(1)));
        assert!(entry.connected);
    }

    #[test]
    fn listeners_are_deduplicated() {
        let mut cache = Cache::new();
        let first: ConnectionCallback = Arc::new(|_, _, _| ());
        let second: ConnectionCallback = Arc::new(|_, _, _| ());
        let entry = cache.ensure(ContextId(1), "A");
        assert!(entry.add_listener(first.clone()));
        assert!(entry.add_listener(second.clone()));
        assert!(!entry.add_listener(first.clone()));
        assert_eq!(entry.listeners.len(), 2);
        assert!(Arc::ptr_eq(&entry.listeners[0], &first));
    }

    #[test]
    fn destroying_a_context_cascades() {
        let mut cache = Cache::new();
        cache.ensure(ContextId(3), "A");
        cache.ensure(ContextId(2), "A");
        cache.ensure(ContextId(2), "B");
        assert_eq!(cache.fallback_context(), Some(ContextId(2)));

        let removed = cache.destroy_context(ContextId(2));
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.contexts(), vec![ContextId(3)]);
        assert!(cache.get(ContextId(2), "A").is_none());
        assert!(cache.get(ContextId(3), "A").is_some());
    }

    #[test]
    fn dump_rendering() {
        let mut cache = Cache::new();
        cache
            .record_connection(ContextId(1), "motor1.VAL", ChannelHandle(16), true)
            .unwrap();
        cache.ensure(ContextId(1), "missing");
        let text = cache.dump().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], " missing         None/1  false");
        assert_eq!(lines[3], " motor1.VAL      0x10/1  true");
    }
}
