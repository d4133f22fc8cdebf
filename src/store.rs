use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// The in-memory keyspace. Authoritative for the life of the process;
/// seeded from persistence at startup, mutated only by SET and DEL.
#[derive(Default)]
pub struct Db {
    entries: HashMap<String, String>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally installs `value` under `key`, overwriting any
    /// previous value.
    pub fn set(&mut self, key: String, value: String) {
        self.entries.insert(key, value);
        metrics::gauge!("redis_clone_keys_total").set(self.entries.len() as f64);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Removes `key` if present; returns whether anything was removed.
    pub fn del(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            metrics::gauge!("redis_clone_keys_total").set(self.entries.len() as f64);
        }
        removed
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point-in-time copy of the keyspace, taken while the caller holds
    /// the store lock. Mutations committing after the clone do not appear
    /// in it, which is exactly the isolation background persistence wants.
    pub fn clone_entries(&self) -> HashMap<String, String> {
        self.entries.clone()
    }
}

pub type Store = Arc<RwLock<Db>>;

pub fn new_store(db: Db) -> Store {
    Arc::new(RwLock::new(db))
}
