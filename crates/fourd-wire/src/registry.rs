//! Port registry: which listener owns which port inside this process.
//!
//! A second [`Listener`](crate::Listener) constructed for a port that is
//! already registered becomes an *alias* of the first: it shares the owner's
//! sessions and socket, and its `open`/`close` do nothing. The entry is
//! removed when the owner closes.
//!
//! The registry is an ordinary value; create one per process (or per test)
//! and pass it to every listener constructor.

use crate::listener::ListenerShared;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared map from port to the owning listener.
#[derive(Clone, Default)]
pub struct PortRegistry {
    entries: Arc<Mutex<HashMap<u16, Arc<ListenerShared>>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered owner of `port`, or register the one built by
    /// `make`. The flag is `true` when an existing owner was returned.
    ///
    /// Port 0 asks the OS for an ephemeral port and is never registered.
    pub(crate) fn claim(
        &self,
        port: u16,
        make: impl FnOnce() -> Arc<ListenerShared>,
    ) -> (Arc<ListenerShared>, bool) {
        if port == 0 {
            return (make(), false);
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(owner) = entries.get(&port) {
            return (Arc::clone(owner), true);
        }
        let shared = make();
        entries.insert(port, Arc::clone(&shared));
        (shared, false)
    }

    /// Remove `port` if it is still owned by `shared`.
    pub(crate) fn release(&self, port: u16, shared: &Arc<ListenerShared>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&port) {
            Some(owner) if Arc::ptr_eq(owner, shared) => {
                entries.remove(&port);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&port)
    }

    /// Registered ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = entries.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.ports())
            .finish()
    }
}
