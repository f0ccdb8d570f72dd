//! Injectable consensus cache.
//!
//! The aggregation core never touches a module-level mutable map; callers
//! inject whichever cache implementation suits them (in-memory for tests and
//! library use, SQLite-backed for the CLI), so caching side effects cannot
//! leak between test cases.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::consensus::models::{CityDescriptor, MetricConsensus};

#[async_trait]
pub trait ConsensusCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<MetricConsensus>;
    async fn set(&self, key: &str, value: &MetricConsensus, ttl: Duration);
}

/// Cache key for one (city, metric) evaluation under a specific provider
/// set. Including the providers keeps a reconfigured run from reading
/// consensus computed by a different panel.
pub fn cache_key(city: &CityDescriptor, metric_id: &str, providers: &[String]) -> String {
    let mut names: Vec<&str> = providers.iter().map(String::as_str).collect();
    names.sort_unstable();
    format!("{}|{}|{}", city.display_name(), metric_id, names.join("+"))
}

/// Simple in-process cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (MetricConsensus, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsensusCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<MetricConsensus> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &MetricConsensus, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.clone(), Instant::now() + ttl));
    }
}

/// Cache that never stores anything. Used when a caller wants every run to
/// hit the providers fresh.
pub struct NoopCache;

#[async_trait]
impl ConsensusCache for NoopCache {
    async fn get(&self, _key: &str) -> Option<MetricConsensus> {
        None
    }

    async fn set(&self, _key: &str, _value: &MetricConsensus, _ttl: Duration) {}
}
