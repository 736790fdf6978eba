//! Object cache abstraction for keyframes and historical frame chunks.
//!
//! Keys are bucket indices (`floor(time / stride)`), so a keyframe or a
//! chunk is always addressed by the stride-aligned time it starts at.
//! Writes are overwrite-by-key, which keeps concurrent writers from
//! corrupting an entry; they can only race on the order keys appear.

use crate::error::EnvError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Async key/value store used for keyframes and cached frame chunks.
///
/// # Implementations
///
/// - **Memory**: `MemoryCache` - a locked `HashMap`
/// - **Disk**: `SledCache` - an embedded `sled` tree with JSON values
#[async_trait]
pub trait ObjectCache<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    /// Reads the value stored under `key`.
    async fn get(&self, key: i64) -> Result<Option<V>, EnvError>;
    
    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: i64, value: V) -> Result<(), EnvError>;
    
    /// Returns true if a value is stored under `key`.
    async fn has(&self, key: i64) -> Result<bool, EnvError>;
    
    /// Removes `key`. Returns true if something was removed.
    async fn delete(&self, key: i64) -> Result<bool, EnvError>;
    
    /// Flags `key` as a candidate for the next `cull_unused` pass.
    fn mark_unused(&self, key: i64);
    
    /// Clears the unused flag on `key`.
    fn mark_used(&self, key: i64);
    
    /// Deletes every key flagged unused and returns how many were removed.
    async fn cull_unused(&self) -> Result<usize, EnvError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MEMORY CACHE
// ============================================================================

/// In-memory object cache.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<i64, V>>,
    unused: Mutex<HashSet<i64>>,
}

impl<V> MemoryCache<V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            unused: Mutex::new(HashSet::new()),
        }
    }
    
    /// Number of stored entries.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
    
    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    /// Stored keys in ascending order.
    pub fn keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = lock(&self.entries).keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> ObjectCache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: i64) -> Result<Option<V>, EnvError> {
        Ok(lock(&self.entries).get(&key).cloned())
    }
    
    async fn set(&self, key: i64, value: V) -> Result<(), EnvError> {
        lock(&self.entries).insert(key, value);
        Ok(())
    }
    
    async fn has(&self, key: i64) -> Result<bool, EnvError> {
        Ok(lock(&self.entries).contains_key(&key))
    }
    
    async fn delete(&self, key: i64) -> Result<bool, EnvError> {
        lock(&self.unused).remove(&key);
        Ok(lock(&self.entries).remove(&key).is_some())
    }
    
    fn mark_unused(&self, key: i64) {
        lock(&self.unused).insert(key);
    }
    
    fn mark_used(&self, key: i64) {
        lock(&self.unused).remove(&key);
    }
    
    async fn cull_unused(&self) -> Result<usize, EnvError> {
        let unused: Vec<i64> = lock(&self.unused).drain().collect();
        let mut entries = lock(&self.entries);
        let removed = unused.iter().filter(|key| entries.remove(key).is_some()).count();
        debug!(removed, "culled memory cache");
        Ok(removed)
    }
}

// ============================================================================
// SLED CACHE (persistent)
// ============================================================================

/// Sled-backed persistent object cache.
///
/// Values are stored as JSON so any serde type can be cached.
pub struct SledCache<V> {
    tree: sled::Tree,
    unused: Mutex<HashSet<i64>>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> SledCache<V> {
    /// Opens (or creates) the named tree inside the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, tree: &str) -> Result<Self, EnvError> {
        let db = sled::open(path)
            .map_err(|e| EnvError::cache(format!("Failed to open sled DB: {}", e)))?;
        Self::from_db(&db, tree)
    }
    
    /// Opens a named tree inside an already-open database.
    ///
    /// Lets keyframes and frame chunks share one database file.
    pub fn from_db(db: &sled::Db, tree: &str) -> Result<Self, EnvError> {
        let tree = db
            .open_tree(tree)
            .map_err(|e| EnvError::cache(format!("Failed to open tree {}: {}", tree, e)))?;
        Ok(Self {
            tree,
            unused: Mutex::new(HashSet::new()),
            _marker: PhantomData,
        })
    }
    
    /// Creates a temporary store that is removed on drop.
    pub fn open_temp(tree: &str) -> Result<Self, EnvError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EnvError::cache(format!("Failed to open temp DB: {}", e)))?;
        Self::from_db(&db, tree)
    }
    
    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }
    
    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl<V> ObjectCache<V> for SledCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: i64) -> Result<Option<V>, EnvError> {
        match self.tree.get(key.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
    
    async fn set(&self, key: i64, value: V) -> Result<(), EnvError> {
        let bytes = serde_json::to_vec(&value)?;
        self.tree.insert(key.to_be_bytes(), bytes)?;
        Ok(())
    }
    
    async fn has(&self, key: i64) -> Result<bool, EnvError> {
        Ok(self.tree.contains_key(key.to_be_bytes())?)
    }
    
    async fn delete(&self, key: i64) -> Result<bool, EnvError> {
        lock(&self.unused).remove(&key);
        Ok(self.tree.remove(key.to_be_bytes())?.is_some())
    }
    
    fn mark_unused(&self, key: i64) {
        lock(&self.unused).insert(key);
    }
    
    fn mark_used(&self, key: i64) {
        lock(&self.unused).remove(&key);
    }
    
    async fn cull_unused(&self) -> Result<usize, EnvError> {
        let unused: Vec<i64> = lock(&self.unused).drain().collect();
        let mut removed = 0;
        for key in unused {
            if self.tree.remove(key.to_be_bytes())?.is_some() {
                removed += 1;
            }
        }
        self.tree.flush()?;
        debug!(removed, "culled sled cache");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    
    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache: MemoryCache<String> = MemoryCache::new();
        assert!(!cache.has(3).await.unwrap());
        
        cache.set(3, "three".to_string()).await.unwrap();
        assert!(cache.has(3).await.unwrap());
        assert_eq!(cache.get(3).await.unwrap(), Some("three".to_string()));
        assert_eq!(cache.get(4).await.unwrap(), None);
        
        // Overwrite by key
        cache.set(3, "drei".to_string()).await.unwrap();
        assert_eq!(cache.get(3).await.unwrap(), Some("drei".to_string()));
        assert_eq!(cache.len(), 1);
    }
    
    #[tokio::test]
    async fn test_memory_cache_cull_unused() {
        let cache: MemoryCache<u32> = MemoryCache::new();
        for key in 0..4 {
            cache.set(key, key as u32).await.unwrap();
        }
        
        cache.mark_unused(1);
        cache.mark_unused(2);
        cache.mark_used(2);
        cache.mark_unused(9); // never stored
        
        assert_eq!(cache.cull_unused().await.unwrap(), 1);
        assert_eq!(cache.keys(), vec![0, 2, 3]);
        
        // Marks are consumed by the pass
        assert_eq!(cache.cull_unused().await.unwrap(), 0);
    }
    
    #[tokio::test]
    async fn test_sled_cache_roundtrip() {
        let cache: SledCache<BTreeMap<String, f64>> = SledCache::open_temp("keyframes").unwrap();
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 2.0);
        
        cache.set(-2, value.clone()).await.unwrap();
        cache.set(1000, value.clone()).await.unwrap();
        
        assert_eq!(cache.get(-2).await.unwrap(), Some(value.clone()));
        assert!(cache.has(1000).await.unwrap());
        assert_eq!(cache.len(), 2);
        
        assert!(cache.delete(-2).await.unwrap());
        assert!(!cache.delete(-2).await.unwrap());
        assert_eq!(cache.get(-2).await.unwrap(), None);
    }
    
    #[tokio::test]
    async fn test_sled_cache_cull_unused() {
        let cache: SledCache<Vec<u8>> = SledCache::open_temp("chunks").unwrap();
        cache.set(0, vec![1]).await.unwrap();
        cache.set(1, vec![2]).await.unwrap();
        
        cache.mark_unused(0);
        assert_eq!(cache.cull_unused().await.unwrap(), 1);
        assert!(!cache.has(0).await.unwrap());
        assert!(cache.has(1).await.unwrap());
    }
}
