use anyhow::{anyhow, Result};
use bincode::config::Configuration;
use bincode::{Decode, Encode};
use eddy_types::{Data, Key};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub mod memory;
pub mod timers;

pub use memory::InMemoryBackend;
pub use timers::{TimeDomain, TimerEntry, TimerQueue};

pub const BINCODE_CONFIG: Configuration = bincode::config::standard();

/// Namespace used by state that is scoped only by key.
pub const VOID_NAMESPACE: &[u8] = &[];

pub const DEFAULT_STATE_CACHE_SIZE: usize = 1000;

/// The physical keyed store. Keys and namespaces arrive already encoded; errors are handed
/// back to the caller untouched.
pub trait BackingStore {
    fn get(&self, table: char, key: &[u8], namespace: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, table: char, key: &[u8], namespace: &[u8], value: Vec<u8>) -> Result<()>;

    fn remove(&mut self, table: char, key: &[u8], namespace: &[u8]) -> Result<()>;

    fn namespaces(&self, table: char, key: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Turns stored values into bytes and back.
pub trait StateCodec {
    fn encode<V: Data>(&self, value: &V) -> Result<Vec<u8>>;

    fn decode<V: Data>(&self, bytes: &[u8]) -> Result<V>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl StateCodec for BincodeCodec {
    fn encode<V: Data>(&self, value: &V) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(value, BINCODE_CONFIG)?)
    }

    fn decode<V: Data>(&self, bytes: &[u8]) -> Result<V> {
        let (value, _) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(value)
    }
}

/// Serializes window identities into the opaque namespace bytes carried by state and timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceCoder;

impl NamespaceCoder {
    pub fn encode_nested<N: Encode>(&self, namespace: &N) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(namespace, BINCODE_CONFIG)?)
    }

    pub fn decode_nested<N: Decode>(&self, bytes: &[u8]) -> Result<N> {
        let (namespace, len) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
        if len != bytes.len() {
            return Err(anyhow!(
                "namespace has {} trailing bytes",
                bytes.len() - len
            ));
        }
        Ok(namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CacheKey {
    table: char,
    key: Vec<u8>,
    namespace: Vec<u8>,
}

#[derive(Debug)]
struct CacheEntry {
    // None marks a pending removal
    value: Option<Vec<u8>>,
    dirty: bool,
    tick: u64,
}

/// Write-back cache in front of the backing store, bounded by entry count. Dirty entries
/// reach the backend on eviction or on `flush`.
#[derive(Debug)]
struct StateCache {
    capacity: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl StateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    fn touch(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(entry)
    }

    fn insert(&mut self, key: CacheKey, value: Option<Vec<u8>>, dirty: bool) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(old) = self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                dirty,
                tick,
            },
        ) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(tick, key);
    }

    fn pop_lru_if_full(&mut self) -> Option<(CacheKey, CacheEntry)> {
        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, key) = self.recency.pop_first()?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry))
    }

    fn drain_dirty(&mut self) -> Vec<(CacheKey, Option<Vec<u8>>)> {
        let mut dirty = vec![];
        for (key, entry) in self.entries.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                dirty.push((key.clone(), entry.value.clone()));
            }
        }
        dirty.sort_by(|a, b| a.0.cmp(&b.0));
        dirty
    }
}

/// Typed, keyed access to a backing store. All reads and writes are scoped to the current
/// key, which the caller sets before touching state.
pub struct StateStore<K: Key, S: BackingStore, C: StateCodec = BincodeCodec> {
    backend: S,
    codec: C,
    current_key: Option<K>,
    encoded_key: Vec<u8>,
    cache: StateCache,
}

impl<K: Key, S: BackingStore> StateStore<K, S, BincodeCodec> {
    pub fn new(backend: S, cache_size: usize) -> Self {
        Self::with_codec(backend, BincodeCodec, cache_size)
    }
}

impl<K: Key, S: BackingStore, C: StateCodec> StateStore<K, S, C> {
    pub fn with_codec(backend: S, codec: C, cache_size: usize) -> Self {
        StateStore {
            backend,
            codec,
            current_key: None,
            encoded_key: vec![],
            cache: StateCache::new(cache_size),
        }
    }

    pub fn set_current_key(&mut self, key: K) -> Result<()> {
        self.encoded_key = bincode::encode_to_vec(&key, BINCODE_CONFIG)?;
        self.current_key = Some(key);
        Ok(())
    }

    pub fn current_key(&self) -> Option<&K> {
        self.current_key.as_ref()
    }

    fn cache_key(&self, table: char, namespace: &[u8]) -> Result<CacheKey> {
        if self.current_key.is_none() {
            return Err(anyhow!("keyed state accessed without a current key"));
        }
        Ok(CacheKey {
            table,
            key: self.encoded_key.clone(),
            namespace: namespace.to_vec(),
        })
    }

    fn evict(&mut self) -> Result<()> {
        while let Some((key, entry)) = self.cache.pop_lru_if_full() {
            if entry.dirty {
                self.write_through(&key, entry.value)?;
            }
        }
        Ok(())
    }

    fn write_through(&mut self, key: &CacheKey, value: Option<Vec<u8>>) -> Result<()> {
        match value {
            Some(bytes) => self.backend.put(key.table, &key.key, &key.namespace, bytes),
            None => self.backend.remove(key.table, &key.key, &key.namespace),
        }
    }

    pub fn get_value<V: Data>(&mut self, table: char, namespace: &[u8]) -> Result<Option<V>> {
        let cache_key = self.cache_key(table, namespace)?;
        let bytes = match self.cache.touch(&cache_key) {
            Some(entry) => entry.value.clone(),
            None => {
                let bytes = self
                    .backend
                    .get(table, &cache_key.key, &cache_key.namespace)?;
                self.cache.insert(cache_key, bytes.clone(), false);
                self.evict()?;
                bytes
            }
        };

        bytes.map(|b| self.codec.decode(&b)).transpose()
    }

    pub fn put_value<V: Data>(&mut self, table: char, namespace: &[u8], value: &V) -> Result<()> {
        let cache_key = self.cache_key(table, namespace)?;
        let bytes = self.codec.encode(value)?;
        self.cache.insert(cache_key, Some(bytes), true);
        self.evict()
    }

    pub fn remove_value(&mut self, table: char, namespace: &[u8]) -> Result<()> {
        let cache_key = self.cache_key(table, namespace)?;
        self.cache.insert(cache_key, None, true);
        self.evict()
    }

    /// Namespaces holding a value in `table` for the current key, pending writes included.
    pub fn namespaces(&mut self, table: char) -> Result<Vec<Vec<u8>>> {
        let probe = self.cache_key(table, VOID_NAMESPACE)?;
        let mut namespaces: BTreeMap<Vec<u8>, bool> = self
            .backend
            .namespaces(table, &probe.key)?
            .into_iter()
            .map(|n| (n, true))
            .collect();
        for (k, entry) in &self.cache.entries {
            if k.table == table && k.key == probe.key {
                namespaces.insert(k.namespace.clone(), entry.value.is_some());
            }
        }
        Ok(namespaces
            .into_iter()
            .filter_map(|(n, present)| present.then_some(n))
            .collect())
    }

    pub fn flush(&mut self) -> Result<()> {
        let dirty = self.cache.drain_dirty();
        debug!("flushing {} dirty state entries", dirty.len());
        for (key, value) in dirty {
            self.write_through(&key, value)?;
        }
        Ok(())
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_types::Value;

    fn store(cache_size: usize) -> StateStore<Vec<Value>, InMemoryBackend> {
        let mut store = StateStore::new(InMemoryBackend::default(), cache_size);
        store.set_current_key(vec![Value::from("k1")]).unwrap();
        store
    }

    #[test]
    fn test_write_back_until_flush() {
        let mut ss = store(10);
        ss.put_value('a', VOID_NAMESPACE, &5i64).unwrap();

        assert_eq!(ss.get_value::<i64>('a', VOID_NAMESPACE).unwrap(), Some(5));
        assert!(ss.backend().is_empty());

        ss.flush().unwrap();
        assert_eq!(ss.backend().len(), 1);

        ss.remove_value('a', VOID_NAMESPACE).unwrap();
        assert_eq!(ss.get_value::<i64>('a', VOID_NAMESPACE).unwrap(), None);
        ss.flush().unwrap();
        assert!(ss.backend().is_empty());
    }

    #[test]
    fn test_eviction_writes_dirty_entries() {
        let mut ss = store(1);
        ss.put_value('a', b"w1", &1i64).unwrap();
        ss.put_value('a', b"w2", &2i64).unwrap();

        // w1 was evicted and written through
        assert_eq!(ss.backend().len(), 1);
        assert_eq!(ss.get_value::<i64>('a', b"w1").unwrap(), Some(1));
        assert_eq!(ss.get_value::<i64>('a', b"w2").unwrap(), Some(2));
    }

    #[test]
    fn test_keys_are_isolated() {
        let mut ss = store(10);
        ss.put_value('a', VOID_NAMESPACE, &"first".to_string())
            .unwrap();
        ss.set_current_key(vec![Value::from("k2")]).unwrap();
        assert_eq!(ss.get_value::<String>('a', VOID_NAMESPACE).unwrap(), None);
    }

    #[test]
    fn test_namespaces_merge_cache_and_backend() {
        let mut ss = store(10);
        ss.put_value('w', b"n1", &1i64).unwrap();
        ss.put_value('w', b"n2", &2i64).unwrap();
        ss.flush().unwrap();
        ss.remove_value('w', b"n1").unwrap();
        ss.put_value('w', b"n3", &3i64).unwrap();

        assert_eq!(
            ss.namespaces('w').unwrap(),
            vec![b"n2".to_vec(), b"n3".to_vec()]
        );
    }

    #[test]
    fn test_requires_current_key() {
        let mut ss: StateStore<Vec<Value>, _> = StateStore::new(InMemoryBackend::default(), 10);
        assert!(ss.get_value::<i64>('a', VOID_NAMESPACE).is_err());
    }

    #[test]
    fn test_namespace_coder() {
        let coder = NamespaceCoder;
        let bytes = coder.encode_nested(&(10i64, 20i64)).unwrap();
        assert_eq!(coder.decode_nested::<(i64, i64)>(&bytes).unwrap(), (10, 20));

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(coder.decode_nested::<(i64, i64)>(&extended).is_err());
    }
}
