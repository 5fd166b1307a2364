//! Redis storage for resource records, with in-process fallback
//!
//! Data model:
//! - resource:{id} → JSON record, expires after the record TTL (refreshed on read)
//! - resources:index → Set of all resource ids
//! - resource:events:{id} → List of JSON progress events, capped and expiring

use crate::events::ProgressEvent;
use chrono::{Duration as ChronoDuration, Utc};
use paygate_common::{DeployError, DeployedResource, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const INDEX_KEY: &str = "resources:index";

fn record_key(id: &str) -> String {
    format!("resource:{}", id)
}

fn events_key(id: &str) -> String {
    format!("resource:events:{}", id)
}

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Safety-net expiry for records; refreshed on every read
    pub record_ttl_secs: u64,

    /// Expiry for a resource's event log; refreshed on every append
    pub event_ttl_secs: u64,

    /// Maximum number of events kept per resource
    pub event_cap: usize,

    /// Upper bound on a single Redis round trip
    pub op_timeout: Duration,

    /// Minimum gap between attempts to (re)establish the connection
    pub reconnect_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 30 * 24 * 60 * 60,
            event_ttl_secs: 60 * 60,
            event_cap: 200,
            op_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// Lazily (re)established Redis connection
#[derive(Default)]
struct ConnectionSlot {
    manager: Option<ConnectionManager>,
    last_attempt: Option<Instant>,
}

/// Registry of deployed resources
pub struct Registry {
    client: Option<redis::Client>,
    slot: Mutex<ConnectionSlot>,
    config: RegistryConfig,
    /// Mirror of every local write; serves reads while Redis is down
    fallback: RwLock<HashMap<String, DeployedResource>>,
    fallback_events: RwLock<HashMap<String, VecDeque<ProgressEvent>>>,
    degraded: AtomicBool,
    degradations: AtomicU64,
}

impl Registry {
    /// Connect to Redis. Never fails: an unreachable backend yields a
    /// registry running on the in-process map until Redis comes back.
    pub async fn connect(redis_url: &str, config: RegistryConfig) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Invalid Redis URL {} ({}), using in-memory registry", redis_url, e);
                None
            }
        };

        let registry = Self::with_client(client, config);
        if registry.client.is_none() {
            registry.mark_degraded("connect", "invalid URL");
        } else if registry.connection("connect").await.is_some() {
            info!("Connected to Redis at {}", redis_url);
        } else {
            warn!("Redis unavailable at {}, serving from memory until it is reachable", redis_url);
        }
        registry
    }

    /// Registry with no backing store at all
    pub fn in_memory() -> Self {
        Self::in_memory_with(RegistryConfig::default())
    }

    pub fn in_memory_with(config: RegistryConfig) -> Self {
        let registry = Self::with_client(None, config);
        registry.degraded.store(true, Ordering::SeqCst);
        registry
    }

    fn with_client(client: Option<redis::Client>, config: RegistryConfig) -> Self {
        Self {
            client,
            slot: Mutex::new(ConnectionSlot::default()),
            config,
            fallback: RwLock::new(HashMap::new()),
            fallback_events: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            degradations: AtomicU64::new(0),
        }
    }

    /// Whether reads and writes are currently served from memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of healthy-to-degraded transitions so far
    pub fn degradation_count(&self) -> u64 {
        self.degradations.load(Ordering::SeqCst)
    }

    /// Get a resource by id, refreshing its TTL
    pub async fn get(&self, id: &str) -> Result<Option<DeployedResource>> {
        let key = record_key(id);
        let ttl = self.config.record_ttl_secs;

        let remote = self
            .with_redis("get", |mut conn| async move {
                let (json,): (Option<String>,) = redis::pipe()
                    .cmd("GET")
                    .arg(&key)
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(json)
            })
            .await;

        match remote {
            Some(Some(json)) => {
                let resource = decode_record(id, &json)?;
                self.fallback
                    .write()
                    .await
                    .insert(id.to_string(), resource.clone());
                Ok(Some(resource))
            }
            Some(None) => {
                // Written locally while Redis was unreachable: push it back
                let local = self.fallback.read().await.get(id).cloned();
                if let Some(resource) = &local {
                    debug!("Re-persisting resource {} written during degradation", id);
                    self.persist(resource).await?;
                }
                Ok(local)
            }
            None => Ok(self.fallback.read().await.get(id).cloned()),
        }
    }

    /// Store a resource and add it to the index
    pub async fn set(&self, resource: &DeployedResource) -> Result<()> {
        self.fallback
            .write()
            .await
            .insert(resource.id().to_string(), resource.clone());

        self.persist(resource).await?;

        debug!("Stored resource: {} status: {}", resource.id(), resource.status);
        Ok(())
    }

    /// Delete a resource, its index entry and its event log
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.fallback.write().await.remove(id);
        self.fallback_events.write().await.remove(id);

        let key = record_key(id);
        let events = events_key(id);
        let member = id.to_string();
        self.with_redis("delete", |mut conn| async move {
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(&key)
                .arg(&events)
                .ignore()
                .cmd("SREM")
                .arg(INDEX_KEY)
                .arg(&member)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await;

        info!("Deleted resource: {}", id);
        Ok(())
    }

    /// List all resources, oldest deployment first. Records that no longer
    /// decode are logged and left out.
    pub async fn list(&self) -> Result<Vec<DeployedResource>> {
        let ttl = self.config.record_ttl_secs;
        let remote = self
            .with_redis("list", |mut conn| async move {
                let ids = conn.smembers::<_, Vec<String>>(INDEX_KEY).await?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }

                let mut pipe = redis::pipe();
                for id in &ids {
                    let key = record_key(id);
                    pipe.cmd("GET").arg(&key).cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                }
                let values = pipe.query_async::<_, Vec<Option<String>>>(&mut conn).await?;
                Ok(ids.into_iter().zip(values).collect::<Vec<_>>())
            })
            .await;

        let mut resources = match remote {
            Some(raw) => {
                let decoded = decode_records(raw);

                let mut seen: HashSet<String> = decoded.malformed.iter().cloned().collect();
                {
                    let mut fallback = self.fallback.write().await;
                    for resource in &decoded.resources {
                        seen.insert(resource.id().to_string());
                        fallback.insert(resource.id().to_string(), resource.clone());
                    }
                }

                // Records only the in-process map knows about
                let local: Vec<DeployedResource> = self
                    .fallback
                    .read()
                    .await
                    .values()
                    .filter(|r| !seen.contains(r.id()))
                    .cloned()
                    .collect();

                let mut resources = decoded.resources;
                for resource in local {
                    debug!("Re-persisting resource {} written during degradation", resource.id());
                    self.persist(&resource).await?;
                    resources.push(resource);
                }

                let expired: Vec<String> = decoded
                    .expired
                    .into_iter()
                    .filter(|id| !resources.iter().any(|r| r.id() == id))
                    .collect();
                if !expired.is_empty() {
                    self.prune_index(expired).await;
                }
                resources
            }
            None => self.fallback.read().await.values().cloned().collect(),
        };

        resources.sort_by(|a, b| a.deployed_at.cmp(&b.deployed_at));
        Ok(resources)
    }

    /// Append a progress event. Best effort: never fails.
    pub async fn push_event(&self, id: &str, event: ProgressEvent) {
        {
            let mut events = self.fallback_events.write().await;
            let log = events.entry(id.to_string()).or_default();
            log.push_back(event.clone());
            while log.len() > self.config.event_cap {
                log.pop_front();
            }
        }

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize progress event for {}: {}", id, e);
                return;
            }
        };

        let key = events_key(id);
        let cap = self.config.event_cap as isize;
        let ttl = self.config.event_ttl_secs;
        self.with_redis("push_event", |mut conn| async move {
            redis::pipe()
                .cmd("RPUSH")
                .arg(&key)
                .arg(json)
                .ignore()
                .cmd("LTRIM")
                .arg(&key)
                .arg(-cap)
                .arg(-1)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(ttl)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await;
    }

    /// Events for a resource, oldest first. Malformed entries are skipped.
    pub async fn events(&self, id: &str) -> Vec<ProgressEvent> {
        let key = events_key(id);
        let remote = self
            .with_redis("events", |mut conn| async move {
                conn.lrange::<_, Vec<String>>(&key, 0, -1).await
            })
            .await;

        match remote {
            Some(entries) if !entries.is_empty() => entries
                .iter()
                .filter_map(|entry| serde_json::from_str(entry).ok())
                .collect(),
            _ => {
                let cutoff = Utc::now() - ChronoDuration::seconds(self.config.event_ttl_secs as i64);
                self.fallback_events
                    .read()
                    .await
                    .get(id)
                    .map(|log| log.iter().filter(|e| e.timestamp >= cutoff).cloned().collect())
                    .unwrap_or_default()
            }
        }
    }

    async fn persist(&self, resource: &DeployedResource) -> Result<()> {
        let json = serde_json::to_string(resource)?;
        let key = record_key(resource.id());
        let member = resource.id().to_string();
        let ttl = self.config.record_ttl_secs;

        self.with_redis("set", |mut conn| async move {
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&key)
                .arg(json)
                .arg("EX")
                .arg(ttl)
                .ignore()
                .cmd("SADD")
                .arg(INDEX_KEY)
                .arg(&member)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await;

        Ok(())
    }

    async fn prune_index(&self, ids: Vec<String>) {
        debug!("Pruning {} expired ids from index", ids.len());
        self.with_redis("prune_index", |mut conn| async move {
            conn.srem::<_, _, ()>(INDEX_KEY, ids).await
        })
        .await;
    }

    /// Run a Redis operation. `None` means the backend is unavailable and
    /// the caller should use the in-process map.
    async fn with_redis<T, F, Fut>(&self, op: &str, f: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection(op).await?;

        match tokio::time::timeout(self.config.op_timeout, f(conn)).await {
            Ok(Ok(value)) => {
                self.mark_recovered();
                Some(value)
            }
            Ok(Err(e)) => {
                self.mark_degraded(op, &e.to_string());
                None
            }
            Err(_) => {
                self.mark_degraded(op, "operation timed out");
                None
            }
        }
    }

    /// The live connection, establishing it first if there is none. Attempts
    /// are spaced by `reconnect_interval`.
    async fn connection(&self, op: &str) -> Option<ConnectionManager> {
        let client = self.client.as_ref()?;
        let mut slot = self.slot.lock().await;
        if let Some(conn) = &slot.manager {
            return Some(conn.clone());
        }

        if let Some(last) = slot.last_attempt {
            if last.elapsed() < self.config.reconnect_interval {
                return None;
            }
        }
        slot.last_attempt = Some(Instant::now());

        match tokio::time::timeout(self.config.op_timeout, ConnectionManager::new(client.clone())).await {
            Ok(Ok(conn)) => {
                slot.manager = Some(conn.clone());
                Some(conn)
            }
            Ok(Err(e)) => {
                self.mark_degraded(op, &e.to_string());
                None
            }
            Err(_) => {
                self.mark_degraded(op, "connection timed out");
                None
            }
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Redis reachable again, registry back on the backing store");
        }
    }

    fn mark_degraded(&self, op: &str, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.degradations.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Redis {} failed ({}), registry degraded to in-memory storage",
                op, reason
            );
        }
    }
}

fn decode_record(id: &str, json: &str) -> Result<DeployedResource> {
    serde_json::from_str(json)
        .map_err(|e| DeployError::Registry(format!("Failed to deserialize resource {}: {}", id, e)))
}

#[derive(Debug, Default)]
struct DecodedRecords {
    resources: Vec<DeployedResource>,
    /// Indexed ids whose record has expired
    expired: Vec<String>,
    /// Indexed ids whose record no longer decodes
    malformed: Vec<String>,
}

fn decode_records(raw: Vec<(String, Option<String>)>) -> DecodedRecords {
    let mut decoded = DecodedRecords::default();
    for (id, json) in raw {
        match json {
            Some(json) => match decode_record(&id, &json) {
                Ok(resource) => decoded.resources.push(resource),
                Err(e) => {
                    warn!("Skipping unreadable resource record: {}", e);
                    decoded.malformed.push(id);
                }
            },
            None => decoded.expired.push(id),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLevel;
    use paygate_common::{ResourceConfig, ResourceStatus};

    fn resource(id: &str) -> DeployedResource {
        let config = ResourceConfig {
            id: id.to_string(),
            name: format!("resource {}", id),
            description: String::new(),
            creator_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            resource_type: Default::default(),
            base_price_usdc: 0.01,
            pricing_model: Default::default(),
            tags: vec![],
            env_vars: Default::default(),
            endpoints: vec![],
        };
        DeployedResource::new(config, "paygate.test")
    }

    async fn get_test_registry() -> Registry {
        Registry::connect("redis://127.0.0.1:6379/15", RegistryConfig::default()).await
    }

    #[tokio::test]
    async fn test_set_get_delete_in_memory() {
        let registry = Registry::in_memory();
        let record = resource("a1");

        registry.set(&record).await.unwrap();
        let fetched = registry.get("a1").await.unwrap().expect("record missing");
        assert_eq!(fetched, record);

        registry.delete("a1").await.unwrap();
        assert!(registry.get("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_consistent_with_keys() {
        let registry = Registry::in_memory();
        for id in ["a", "b", "c"] {
            registry.set(&resource(id)).await.unwrap();
        }
        registry.delete("b").await.unwrap();

        let ids: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.config.id)
            .collect();

        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"c".to_string()));
        for id in ids {
            assert!(registry.get(&id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let registry = Registry::in_memory();
        let mut record = resource("x");
        registry.set(&record).await.unwrap();

        record.transition(ResourceStatus::Building);
        registry.set(&record).await.unwrap();

        let fetched = registry.get("x").await.unwrap().unwrap();
        assert_eq!(fetched.status, ResourceStatus::Building);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_log_is_capped() {
        let registry = Registry::in_memory_with(RegistryConfig {
            event_cap: 3,
            ..Default::default()
        });

        for i in 0..5 {
            registry
                .push_event("r", ProgressEvent::info(None, format!("step {}", i)))
                .await;
        }

        let events = registry.events("r").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "step 2");
        assert_eq!(events[2].message, "step 4");
        assert_eq!(events[2].level, EventLevel::Info);

        registry.delete("r").await.unwrap();
        assert!(registry.events("r").await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades() {
        let registry = Registry::connect(
            "redis://127.0.0.1:1",
            RegistryConfig {
                op_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await;
        assert!(registry.is_degraded());

        let record = resource("d1");
        registry.set(&record).await.unwrap();
        assert_eq!(registry.get("d1").await.unwrap(), Some(record));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_flag_flips_once_per_episode() {
        let registry = Registry::connect(
            "redis://127.0.0.1:1",
            RegistryConfig {
                op_timeout: Duration::from_millis(200),
                reconnect_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await;
        assert!(registry.is_degraded());
        assert_eq!(registry.degradation_count(), 1);

        // Every call retries the connection and fails again
        for id in ["e1", "e2"] {
            registry.set(&resource(id)).await.unwrap();
            registry.get(id).await.unwrap();
        }
        registry.list().await.unwrap();
        assert_eq!(registry.degradation_count(), 1);

        registry.mark_recovered();
        assert!(!registry.is_degraded());
        registry.mark_degraded("get", "connection reset");
        registry.mark_degraded("set", "connection reset");
        assert!(registry.is_degraded());
        assert_eq!(registry.degradation_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_are_spaced() {
        let registry = Registry::connect(
            "redis://127.0.0.1:1",
            RegistryConfig {
                op_timeout: Duration::from_millis(200),
                reconnect_interval: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .await;
        let first = registry.slot.lock().await.last_attempt;
        assert!(first.is_some());

        registry.get("nothing").await.unwrap();
        assert_eq!(registry.slot.lock().await.last_attempt, first);
    }

    #[test]
    fn test_unreadable_record_is_skipped() {
        let good = serde_json::to_string(&resource("good")).unwrap();
        let decoded = decode_records(vec![
            ("good".to_string(), Some(good)),
            ("broken".to_string(), Some("{\"config\": 42".to_string())),
            ("gone".to_string(), None),
        ]);

        assert_eq!(decoded.resources.len(), 1);
        assert_eq!(decoded.resources[0].config.id, "good");
        assert_eq!(decoded.malformed, vec!["broken".to_string()]);
        assert_eq!(decoded.expired, vec!["gone".to_string()]);
    }

    #[test]
    fn test_unreadable_record_fails_single_lookup() {
        let err = decode_record("broken", "not json").unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_list_skips_unreadable_record() {
        let registry = get_test_registry().await;
        registry.set(&resource("list-ok")).await.unwrap();

        let mut conn = redis::Client::open("redis://127.0.0.1:6379/15")
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        redis::pipe()
            .cmd("SET")
            .arg(record_key("list-bad"))
            .arg("{broken")
            .ignore()
            .cmd("SADD")
            .arg(INDEX_KEY)
            .arg("list-bad")
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.config.id)
            .collect();
        assert!(ids.contains(&"list-ok".to_string()));
        assert!(!ids.contains(&"list-bad".to_string()));
        assert!(registry.get("list-bad").await.is_err());

        registry.delete("list-ok").await.unwrap();
        registry.delete("list-bad").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_round_trip() {
        let registry = get_test_registry().await;
        assert!(!registry.is_degraded());

        let record = resource("redis-rt");
        registry.set(&record).await.unwrap();

        let fetched = registry.get("redis-rt").await.unwrap().unwrap();
        assert_eq!(fetched.config.id, "redis-rt");
        assert!(registry
            .list()
            .await
            .unwrap()
            .iter()
            .any(|r| r.config.id == "redis-rt"));

        registry
            .push_event("redis-rt", ProgressEvent::warn(Some(ResourceStatus::Pending), "hello"))
            .await;
        assert_eq!(registry.events("redis-rt").await.len(), 1);

        // Clean up
        registry.delete("redis-rt").await.unwrap();
        assert!(registry.get("redis-rt").await.unwrap().is_none());
    }
}
