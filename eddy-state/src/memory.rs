use crate::BackingStore;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

type NamespaceMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Heap-backed store, keyed by table, then key, then namespace.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: HashMap<char, BTreeMap<Vec<u8>, NamespaceMap>>,
    writes: usize,
}

impl InMemoryBackend {
    pub fn len(&self) -> usize {
        self.tables
            .values()
            .flat_map(|keys| keys.values())
            .map(|namespaces| namespaces.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of put and remove calls that reached the backend.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl BackingStore for InMemoryBackend {
    fn get(&self, table: char, key: &[u8], namespace: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .get(&table)
            .and_then(|keys| keys.get(key))
            .and_then(|namespaces| namespaces.get(namespace))
            .cloned())
    }

    fn put(&mut self, table: char, key: &[u8], namespace: &[u8], value: Vec<u8>) -> Result<()> {
        self.writes += 1;
        self.tables
            .entry(table)
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .insert(namespace.to_vec(), value);
        Ok(())
    }

    fn remove(&mut self, table: char, key: &[u8], namespace: &[u8]) -> Result<()> {
        self.writes += 1;
        if let Some(keys) = self.tables.get_mut(&table) {
            if let Some(namespaces) = keys.get_mut(key) {
                namespaces.remove(namespace);
                if namespaces.is_empty() {
                    keys.remove(key);
                }
            }
        }
        Ok(())
    }

    fn namespaces(&self, table: char, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .tables
            .get(&table)
            .and_then(|keys| keys.get(key))
            .map(|namespaces| namespaces.keys().cloned().collect())
            .unwrap_or_default())
    }
}
