//! In-process [`Registry`] for a single-host deployment and for tests.
//!
//! Expiry is lazy: an entry past its deadline is dropped the next time its
//! key is touched. Deadlines use `tokio::time::Instant`, so paused-clock
//! tests see TTLs run out as virtual time advances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    BackendRecord, BucketRecord, ExclusionRecord, PoolRecord, Registry, RegistryFuture, UserRecord,
};
use crate::config::PoolSeed;
use crate::error::AppError;

struct Expiring<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self { value, deadline: ttl.map(|t| Instant::now() + t) }
    }

    fn live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|d| d > now)
    }
}

fn purge<T>(map: &mut HashMap<String, Expiring<T>>, key: &str) {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| !e.live(now)) {
        map.remove(key);
    }
}

#[derive(Default)]
struct Store {
    pools: HashMap<String, PoolRecord>,
    users: HashMap<String, UserRecord>,
    buckets: HashMap<String, BucketRecord>,
    backends: HashMap<String, Expiring<BackendRecord>>,
    exclusions: HashMap<String, Expiring<ExclusionRecord>>,
    access: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    store: Mutex<Store>,
    unreachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configured pools, with an owner record and bucket records each.
    pub async fn seed(&self, seeds: &[PoolSeed]) {
        for seed in seeds {
            self.insert_pool(PoolRecord {
                pool: seed.id.clone(),
                owner_uid: seed.owner_uid.clone(),
                owner_gid: seed.owner_gid.clone(),
                directory: seed.directory.display().to_string(),
                enabled: seed.enabled,
                expiration: seed.expiration,
                inoperable: false,
                reason: String::new(),
            })
            .await;
            self.insert_user(UserRecord {
                uid: seed.owner_uid.clone(),
                enabled: true,
                expiration: seed.expiration,
            })
            .await;
            for bucket in &seed.buckets {
                self.insert_bucket(BucketRecord {
                    bucket: bucket.clone(),
                    pool: seed.id.clone(),
                    expiration: seed.expiration,
                })
                .await;
            }
        }
    }

    pub async fn insert_pool(&self, record: PoolRecord) {
        self.store.lock().await.pools.insert(record.pool.clone(), record);
    }

    pub async fn remove_pool(&self, pool: &str) {
        self.store.lock().await.pools.remove(pool);
    }

    pub async fn insert_user(&self, record: UserRecord) {
        self.store.lock().await.users.insert(record.uid.clone(), record);
    }

    pub async fn insert_bucket(&self, record: BucketRecord) {
        self.store.lock().await.buckets.insert(record.bucket.clone(), record);
    }

    /// Store a backend record under `key` without any consistency checks.
    pub async fn insert_backend_raw(&self, key: &str, record: BackendRecord) {
        self.store
            .lock()
            .await
            .backends
            .insert(key.to_string(), Expiring::new(record, None));
    }

    /// Remaining lifetime of a backend record; `None` if absent or immortal.
    pub async fn backend_ttl(&self, pool: &str) -> Option<Duration> {
        let mut store = self.store.lock().await;
        purge(&mut store.backends, pool);
        let deadline = store.backends.get(pool)?.deadline?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    pub async fn exclusion(&self, pool: &str) -> Option<ExclusionRecord> {
        let mut store = self.store.lock().await;
        purge(&mut store.exclusions, pool);
        store.exclusions.get(pool).map(|e| e.value.clone())
    }

    /// Make every operation fail, as if the store were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    async fn reach(&self) -> Result<(), AppError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(AppError::Registry("store unreachable".into()));
        }
        Ok(())
    }
}

impl Registry for MemoryRegistry {
    fn get_pool<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<PoolRecord>> {
        Box::pin(async move {
            self.reach().await?;
            Ok(self.store.lock().await.pools.get(pool).cloned())
        })
    }

    fn set_pool(&self, record: PoolRecord) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.reach().await?;
            self.store.lock().await.pools.insert(record.pool.clone(), record);
            Ok(())
        })
    }

    fn get_user<'a>(&'a self, uid: &'a str) -> RegistryFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            self.reach().await?;
            Ok(self.store.lock().await.users.get(uid).cloned())
        })
    }

    fn list_buckets<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Vec<BucketRecord>> {
        Box::pin(async move {
            self.reach().await?;
            let store = self.store.lock().await;
            let mut buckets: Vec<BucketRecord> =
                store.buckets.values().filter(|b| b.pool == pool).cloned().collect();
            buckets.sort_by(|a, b| a.bucket.cmp(&b.bucket));
            Ok(buckets)
        })
    }

    fn get_backend<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<BackendRecord>> {
        Box::pin(async move {
            self.reach().await?;
            let mut store = self.store.lock().await;
            purge(&mut store.backends, pool);
            Ok(store.backends.get(pool).map(|e| e.value.clone()))
        })
    }

    fn set_backend(&self, record: BackendRecord, ttl: Option<Duration>) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.reach().await?;
            self.store
                .lock()
                .await
                .backends
                .insert(record.pool.clone(), Expiring::new(record, ttl));
            Ok(())
        })
    }

    fn set_backend_ttl<'a>(&'a self, pool: &'a str, ttl: Duration) -> RegistryFuture<'a, bool> {
        Box::pin(async move {
            self.reach().await?;
            let mut store = self.store.lock().await;
            purge(&mut store.backends, pool);
            match store.backends.get_mut(pool) {
                Some(entry) => {
                    entry.deadline = Some(Instant::now() + ttl);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn delete_backend<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.reach().await?;
            self.store.lock().await.backends.remove(pool);
            Ok(())
        })
    }

    fn list_backends<'a>(&'a self, filter: &'a str) -> RegistryFuture<'a, Vec<BackendRecord>> {
        Box::pin(async move {
            self.reach().await?;
            let mut store = self.store.lock().await;
            let now = Instant::now();
            store.backends.retain(|_, e| e.live(now));
            let mut records: Vec<BackendRecord> = store
                .backends
                .iter()
                .filter(|(key, _)| filter == "*" || key.as_str() == filter)
                .map(|(_, e)| e.value.clone())
                .collect();
            records.sort_by(|a, b| a.pool.cmp(&b.pool));
            Ok(records)
        })
    }

    fn set_exclusion_if_absent(&self, record: ExclusionRecord) -> RegistryFuture<'_, bool> {
        Box::pin(async move {
            self.reach().await?;
            let mut store = self.store.lock().await;
            purge(&mut store.exclusions, &record.pool);
            if store.exclusions.contains_key(&record.pool) {
                return Ok(false);
            }
            store
                .exclusions
                .insert(record.pool.clone(), Expiring::new(record, None));
            Ok(true)
        })
    }

    fn set_exclusion_ttl<'a>(&'a self, pool: &'a str, ttl: Duration) -> RegistryFuture<'a, bool> {
        Box::pin(async move {
            self.reach().await?;
            let mut store = self.store.lock().await;
            purge(&mut store.exclusions, pool);
            match store.exclusions.get_mut(pool) {
                Some(entry) => {
                    entry.deadline = Some(Instant::now() + ttl);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn delete_exclusion<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.reach().await?;
            self.store.lock().await.exclusions.remove(pool);
            Ok(())
        })
    }

    fn get_access_timestamp<'a>(&'a self, pool: &'a str) -> RegistryFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.reach().await?;
            Ok(self.store.lock().await.access.get(pool).copied())
        })
    }

    fn set_access_timestamp<'a>(&'a self, pool: &'a str, timestamp: i64) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.reach().await?;
            self.store.lock().await.access.insert(pool.to_string(), timestamp);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendState, PoolReason};

    fn exclusion(pool: &str, mux: &str) -> ExclusionRecord {
        ExclusionRecord { pool: pool.into(), mux_ep: mux.into(), timestamp: 0 }
    }

    fn backend(pool: &str) -> BackendRecord {
        BackendRecord {
            pool: pool.into(),
            backend_ep: "h:9000".into(),
            backend_pid: 7,
            state: BackendState::Ready,
            reason: PoolReason::Normal,
            root_access: "A".into(),
            root_secret: "S".into(),
            mux_ep: "h:8004".into(),
            mux_pid: 1,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn exclusion_is_set_if_absent() {
        let reg = MemoryRegistry::new();
        assert!(reg.set_exclusion_if_absent(exclusion("p", "a:1")).await.unwrap());
        assert!(!reg.set_exclusion_if_absent(exclusion("p", "b:1")).await.unwrap());
        assert_eq!(reg.exclusion("p").await.unwrap().mux_ep, "a:1");
        reg.delete_exclusion("p").await.unwrap();
        assert!(reg.set_exclusion_if_absent(exclusion("p", "b:1")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn exclusion_ttl_expires() {
        let reg = MemoryRegistry::new();
        assert!(reg.set_exclusion_if_absent(exclusion("p", "a:1")).await.unwrap());
        assert!(reg.set_exclusion_ttl("p", Duration::from_secs(3)).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(reg.exclusion("p").await.is_none());
        assert!(!reg.set_exclusion_ttl("p", Duration::from_secs(3)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn backend_ttl_refresh_and_expiry() {
        let reg = MemoryRegistry::new();
        reg.set_backend(backend("p"), Some(Duration::from_secs(10))).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(reg.set_backend_ttl("p", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(reg.get_backend("p").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(reg.get_backend("p").await.unwrap().is_none());
        assert!(!reg.set_backend_ttl("p", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn list_backends_filters() {
        let reg = MemoryRegistry::new();
        reg.set_backend(backend("p1"), None).await.unwrap();
        reg.set_backend(backend("p2"), None).await.unwrap();
        assert_eq!(reg.list_backends("*").await.unwrap().len(), 2);
        let one = reg.list_backends("p2").await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].pool, "p2");
        assert!(reg.list_backends("p3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seed_creates_pool_owner_and_buckets() {
        let reg = MemoryRegistry::new();
        reg.seed(&[PoolSeed {
            id: "p1".into(),
            owner_uid: "alice".into(),
            owner_gid: "alice".into(),
            directory: "/srv/p1".into(),
            enabled: true,
            expiration: 4_102_444_800,
            buckets: vec!["b2".into(), "b1".into()],
        }])
        .await;
        let pool = reg.get_pool("p1").await.unwrap().unwrap();
        assert_eq!(pool.directory, "/srv/p1");
        assert!(reg.get_user("alice").await.unwrap().unwrap().enabled);
        let names: Vec<String> = reg
            .list_buckets("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.bucket)
            .collect();
        assert_eq!(names, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn unreachable_store_errors() {
        let reg = MemoryRegistry::new();
        reg.set_unreachable(true);
        assert!(reg.get_backend("p").await.is_err());
        reg.set_unreachable(false);
        assert!(reg.get_backend("p").await.unwrap().is_none());
    }
}
