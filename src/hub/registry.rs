//! Set of live connections
//!
//! Owned and mutated only by the hub dispatcher.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::connection::{ConnectionHandle, ConnectionId};

#[derive(Default)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Closed or already-present connections are ignored.
    pub fn insert(&mut self, conn: ConnectionHandle) -> bool {
        if !conn.is_alive() {
            return false;
        }

        match self.connections.entry(conn.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    /// Remove a connection; unknown ids are a no-op
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.connections.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.connections.drain().map(|(_, conn)| conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::{Connection, ConnectionSettings};

    #[test]
    fn test_insert_and_remove() {
        let mut registry = Registry::new();
        let conn = Connection::new(ConnectionSettings::default());
        let id = conn.id();

        assert!(registry.insert(conn.handle()));
        assert!(!registry.insert(conn.handle()));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_connection_is_refused() {
        let mut registry = Registry::new();
        let conn = Connection::new(ConnectionSettings::default());
        conn.handle().close();

        assert!(!registry.insert(conn.handle()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = Registry::new();
        let a = Connection::new(ConnectionSettings::default());
        let b = Connection::new(ConnectionSettings::default());
        registry.insert(a.handle());
        registry.insert(b.handle());

        let drained: Vec<_> = registry.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
