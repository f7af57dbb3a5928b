use std::sync::Arc;

use dashmap::DashMap;

use crate::client::Client;

/// registry of live connections, keyed by display name
///
/// at most one entry per name: registering a name that is already present
/// replaces the previous connection. The map itself never leaves this
/// type; fan-out I/O runs against `snapshot()` so no map lock is held
/// across a write.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<DashMap<String, Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// insert or replace the entry for `name`
    pub fn register(&self, name: String, client: Client) {
        self.clients.insert(name, client);
    }

    /// remove the entry if present; removing an absent name is a no-op
    pub fn unregister(&self, name: &str) {
        self.clients.remove(name);
    }

    pub fn lookup(&self, name: &str) -> Option<Client> {
        self.clients.get(name).map(|entry| entry.value().clone())
    }

    /// point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<(String, Client)> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
