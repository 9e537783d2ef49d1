//! Sharded registry of live connection handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::ConnectionHandle;
use crate::error::GatewayError;
use crate::Result;

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 64;

/// Registry key: a session key qualified by its tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub tenant_id: String,
    pub session_key: String,
}

impl HandleKey {
    pub fn new(tenant_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_key: session_key.into(),
        }
    }

    fn shard_index(&self) -> usize {
        let mut hash = fnv1a(FNV_OFFSET, self.tenant_id.as_bytes());
        hash = fnv1a(hash, &[0]);
        hash = fnv1a(hash, self.session_key.as_bytes());
        hash as usize % SHARD_COUNT
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.session_key)
    }
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(mut hash: u32, bytes: &[u8]) -> u32 {
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

type Shard = RwLock<HashMap<HandleKey, Arc<ConnectionHandle>>>;

/// Thread-safe storage for connection handles.
///
/// Every operation locks a single shard and never awaits, so callers may use
/// it from async code without holding a lock across I/O.
pub struct SessionRegistry {
    shards: Vec<Shard>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &HandleKey) -> &Shard {
        &self.shards[key.shard_index()]
    }

    /// Get the handle registered under `key`.
    pub fn get(&self, key: &HandleKey) -> Result<Option<Arc<ConnectionHandle>>> {
        let shard = self
            .shard(key)
            .read()
            .map_err(|_| GatewayError::LockPoisoned)?;
        Ok(shard.get(key).cloned())
    }

    /// Install `handle` under `key`, returning whatever it replaced.
    ///
    /// The caller owns the returned handle and must tear it down.
    pub fn set(
        &self,
        key: HandleKey,
        handle: Arc<ConnectionHandle>,
    ) -> Result<Option<Arc<ConnectionHandle>>> {
        let mut shard = self
            .shard(&key)
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?;
        Ok(shard.insert(key, handle))
    }

    /// Remove the handle under `key`.
    pub fn remove(&self, key: &HandleKey) -> Result<Option<Arc<ConnectionHandle>>> {
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?;
        Ok(shard.remove(key))
    }

    /// Remove the handle under `key` only if it is `handle` itself.
    ///
    /// Used by background tasks so they never evict a newer replacement.
    pub fn remove_if_same(&self, key: &HandleKey, handle: &Arc<ConnectionHandle>) -> Result<bool> {
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?;
        match shard.get(key) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                shard.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Visit every entry.
    ///
    /// Each shard is snapshotted under its own lock and the callback runs
    /// with no lock held. Entries added to shards not yet visited are seen;
    /// visited shards are not revisited.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&HandleKey, &Arc<ConnectionHandle>),
    {
        for shard in &self.shards {
            let snapshot: Vec<_> = {
                let guard = shard.read().map_err(|_| GatewayError::LockPoisoned)?;
                guard
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect()
            };
            for (key, handle) in &snapshot {
                f(key, handle);
            }
        }
        Ok(())
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Result<Vec<(HandleKey, Arc<ConnectionHandle>)>> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write().map_err(|_| GatewayError::LockPoisoned)?;
            drained.extend(guard.drain());
        }
        Ok(drained)
    }

    /// Get the number of registered handles.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().map_err(|_| GatewayError::LockPoisoned)?.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackProvider;
    use crate::transport::DeviceProvider;
    use uuid::Uuid;

    async fn handle(key: &HandleKey) -> Arc<ConnectionHandle> {
        let client = LoopbackProvider::new().new_device().await.unwrap();
        Arc::new(ConnectionHandle::new(Uuid::new_v4(), key.clone(), client))
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(FNV_OFFSET, b""), 0x811c_9dc5);
        assert_eq!(fnv1a(FNV_OFFSET, b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_shard_index_is_stable() {
        let key = HandleKey::new("t1", "alice");
        assert_eq!(key.shard_index(), key.clone().shard_index());
        assert!(key.shard_index() < SHARD_COUNT);
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let registry = SessionRegistry::new();
        let key = HandleKey::new("t1", "alice");
        let h = handle(&key).await;

        assert!(registry.set(key.clone(), Arc::clone(&h)).unwrap().is_none());
        let got = registry.get(&key).unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &h));
        assert_eq!(registry.len().unwrap(), 1);

        let removed = registry.remove(&key).unwrap().unwrap();
        assert!(Arc::ptr_eq(&removed, &h));
        assert!(registry.get(&key).unwrap().is_none());
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_set_returns_previous() {
        let registry = SessionRegistry::new();
        let key = HandleKey::new("t1", "alice");
        let first = handle(&key).await;
        let second = handle(&key).await;

        registry.set(key.clone(), Arc::clone(&first)).unwrap();
        let previous = registry.set(key.clone(), Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&previous.unwrap(), &first));
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_tenants() {
        let registry = SessionRegistry::new();
        let a = HandleKey::new("tenantA", "alice");
        let b = HandleKey::new("tenantB", "alice");
        registry.set(a.clone(), handle(&a).await).unwrap();
        registry.set(b.clone(), handle(&b).await).unwrap();

        assert_eq!(registry.len().unwrap(), 2);
        registry.remove(&a).unwrap();
        assert!(registry.get(&b).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_if_same() {
        let registry = SessionRegistry::new();
        let key = HandleKey::new("t1", "alice");
        let old = handle(&key).await;
        let new = handle(&key).await;
        registry.set(key.clone(), Arc::clone(&new)).unwrap();

        assert!(!registry.remove_if_same(&key, &old).unwrap());
        assert!(registry.get(&key).unwrap().is_some());
        assert!(registry.remove_if_same(&key, &new).unwrap());
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_for_each_and_drain() {
        let registry = SessionRegistry::new();
        for i in 0..10 {
            let key = HandleKey::new("t1", format!("s{i}"));
            registry.set(key.clone(), handle(&key).await).unwrap();
        }

        let mut seen = 0;
        registry.for_each(|_, _| seen += 1).unwrap();
        assert_eq!(seen, 10);

        assert_eq!(registry.drain().unwrap().len(), 10);
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_for_each_allows_mutation() {
        let registry = SessionRegistry::new();
        let key = HandleKey::new("t1", "alice");
        registry.set(key.clone(), handle(&key).await).unwrap();

        registry
            .for_each(|k, _| {
                registry.remove(k).unwrap();
            })
            .unwrap();
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = vec![];

        for i in 0..100 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let key = HandleKey::new(format!("t{}", i % 7), format!("s{i}"));
                let h = handle(&key).await;
                registry.set(key.clone(), h).unwrap();
                assert!(registry.get(&key).unwrap().is_some());
                registry.for_each(|_, _| {}).unwrap();
                if i % 2 == 0 {
                    registry.remove(&key).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len().unwrap(), 50);
    }

    #[test]
    fn test_len_reports_poisoned_shard() {
        let registry = SessionRegistry::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = registry.shards[0].write().unwrap();
            panic!("poison shard");
        }));

        assert!(matches!(registry.len(), Err(GatewayError::LockPoisoned)));
        assert!(registry.is_empty().is_err());
    }
}
