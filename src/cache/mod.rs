//! Query result cache
//!
//! Process-local mapping from plan fingerprints to immutable result
//! payloads, bounded three ways:
//! - a byte budget with strict LRU eviction down to 90 % of the limit,
//! - a soft entry limit derived from the byte budget,
//! - a TTL after insertion, enforced on access.
//!
//! Concurrent misses for the same fingerprint are coalesced: the first
//! caller becomes the flight leader and computes the result; everyone else
//! waits on the flight's channel and receives the same shared payload, or
//! the leader's error.
//!
//! Payloads are `Arc<DataSet>` and immutable after insertion; readers never
//! copy row data. Size accounting is approximate (`overhead + rows x
//! bytes_per_row` with `bytes_per_row` taken from the first row's schema);
//! the cache stays within 1.25x of its byte budget at steady state.

use crate::error::ErrorKind;
use crate::query::planner::Fingerprint;
use crate::types::{DataSet, Tier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Configuration for the result cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// If false every operation is a no-op
    pub enabled: bool,
    /// Byte budget for cached payloads
    pub max_size_bytes: usize,
    /// Entry TTL, measured from insertion
    pub ttl: Duration,
    /// Soft cap on entry count
    pub entry_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let max_size_bytes = 512 * 1024 * 1024;
        Self {
            enabled: true,
            max_size_bytes,
            ttl: Duration::from_secs(3_600),
            entry_limit: default_entry_limit(max_size_bytes),
        }
    }
}

/// Soft entry limit: 10 x sqrt(byte budget)
fn default_entry_limit(max_size_bytes: usize) -> usize {
    (10.0 * (max_size_bytes as f64).sqrt()) as usize
}

impl CacheConfig {
    /// Set the byte budget, re-deriving the entry limit
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size_bytes = bytes;
        self.entry_limit = default_entry_limit(bytes);
        self
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Disable caching
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The immutable payload stored per fingerprint.
///
/// Carries enough plan context to populate result metadata on hits without
/// re-planning.
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// Shared result rows
    pub data: Arc<DataSet>,
    /// Tier the result was read from
    pub tier: Tier,
    /// Bucket width the result was aggregated at
    pub bucket_width_ns: i64,
    /// Whether the point budget shortened the result
    pub truncated: bool,
    /// End of the interval actually covered
    pub actual_end: i64,
    /// Whether the tier selector coarsened the requested resolution
    pub resolution_promoted: bool,
}

struct CacheEntry {
    payload: CachedResult,
    size_bytes: usize,
    created_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses
    pub misses: u64,
    /// Entries evicted by LRU or the entry limit
    pub evictions: u64,
    /// Approximate bytes held
    pub size_bytes: u64,
    /// Entry count
    pub entries: usize,
}

/// What a single-flight leader publishes to its waiters.
///
/// Errors travel by kind and message; the original error value stays with
/// the leader.
pub type FlightResult = std::result::Result<CachedResult, (ErrorKind, String)>;

type FlightMap = HashMap<Fingerprint, watch::Receiver<Option<FlightResult>>>;

/// Outcome of registering interest in a fingerprint
pub enum Flight {
    /// This caller computes the result and must call [`FlightGuard::complete`]
    Leader(FlightGuard),
    /// Another caller is computing; wait on the channel
    Waiter(watch::Receiver<Option<FlightResult>>),
}

/// Leader-side handle for an in-progress computation.
///
/// Dropping the guard without completing it publishes a cancellation error
/// so waiters never hang.
pub struct FlightGuard {
    flights: Arc<Mutex<FlightMap>>,
    fingerprint: Fingerprint,
    tx: watch::Sender<Option<FlightResult>>,
    registered: bool,
    completed: bool,
}

impl FlightGuard {
    /// Publish the result to all waiters and retire the flight.
    pub fn complete(mut self, result: FlightResult) {
        let _ = self.tx.send(Some(result));
        if self.registered {
            self.flights.lock().remove(&self.fingerprint);
        }
        self.completed = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.tx.send(Some(Err((
                ErrorKind::ReadFailed,
                "shared query computation was cancelled".to_string(),
            ))));
            if self.registered {
                self.flights.lock().remove(&self.fingerprint);
            }
        }
    }
}

/// Bounded LRU + TTL cache with single-flight coalescing
pub struct QueryCache {
    config: CacheConfig,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    flights: Arc<Mutex<FlightMap>>,
    current_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    /// Create a cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            flights: Arc::new(Mutex::new(HashMap::new())),
            current_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint, expiring the entry if its TTL has elapsed.
    pub fn get(&self, fingerprint: Fingerprint) -> Option<CachedResult> {
        if !self.config.enabled {
            return None;
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&fingerprint) {
            if entry.created_at.elapsed() > self.config.ttl {
                let size = entry.size_bytes as u64;
                entries.remove(&fingerprint);
                self.sub_size(size);
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(false);
                return None;
            }
            entry.last_access = Instant::now();
            entry.hit_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_lookup(true);
            return Some(entry.payload.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
        None
    }

    /// Insert a payload, evicting LRU entries to make room.
    ///
    /// Payloads larger than the whole budget are not cached at all.
    pub fn insert(&self, fingerprint: Fingerprint, payload: CachedResult) {
        if !self.config.enabled {
            return;
        }

        let size_bytes = estimate_size(&payload.data);
        if size_bytes > self.config.max_size_bytes {
            debug!(
                size_bytes = size_bytes,
                limit = self.config.max_size_bytes,
                "result larger than cache budget, not caching"
            );
            return;
        }

        let mut entries = self.entries.lock();

        if let Some(old) = entries.remove(&fingerprint) {
            self.sub_size(old.size_bytes as u64);
        }

        self.make_room(&mut entries, size_bytes);

        let now = Instant::now();
        entries.insert(
            fingerprint,
            CacheEntry {
                payload,
                size_bytes,
                created_at: now,
                last_access: now,
                hit_count: 0,
            },
        );
        let new_size = self
            .current_size
            .fetch_add(size_bytes as u64, Ordering::Relaxed)
            + size_bytes as u64;
        crate::metrics::update_cache_size(new_size);
    }

    /// Register interest in a fingerprint for single-flight coalescing.
    pub fn begin_flight(&self, fingerprint: Fingerprint) -> Flight {
        if !self.config.enabled {
            // With the cache off there is nothing to share; every caller
            // computes independently.
            let (tx, _rx) = watch::channel(None);
            return Flight::Leader(FlightGuard {
                flights: Arc::clone(&self.flights),
                fingerprint,
                tx,
                registered: false,
                completed: false,
            });
        }

        let mut flights = self.flights.lock();
        if let Some(rx) = flights.get(&fingerprint) {
            return Flight::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(fingerprint, rx);
        Flight::Leader(FlightGuard {
            flights: Arc::clone(&self.flights),
            fingerprint,
            tx,
            registered: true,
            completed: false,
        })
    }

    /// Atomically drop all entries.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
        crate::metrics::update_cache_size(0);
        debug!("cleared result cache");
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size_bytes: self.current_size.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    /// Whether the cache is active.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn sub_size(&self, bytes: u64) {
        let current = self.current_size.load(Ordering::Relaxed);
        let updated = current.saturating_sub(bytes);
        self.current_size.store(updated, Ordering::Relaxed);
        crate::metrics::update_cache_size(updated);
    }

    /// Evict by entry count, then by bytes down to 90 % of the budget.
    fn make_room(&self, entries: &mut HashMap<Fingerprint, CacheEntry>, incoming: usize) {
        while entries.len() >= self.config.entry_limit {
            if !self.evict_lru(entries) {
                break;
            }
        }

        let current = self.current_size.load(Ordering::Relaxed) as usize;
        if current + incoming <= self.config.max_size_bytes {
            return;
        }
        let target = (self.config.max_size_bytes as f64 * 0.9) as usize;
        while self.current_size.load(Ordering::Relaxed) as usize + incoming > target {
            if !self.evict_lru(entries) {
                break;
            }
        }
    }

    fn evict_lru(&self, entries: &mut HashMap<Fingerprint, CacheEntry>) -> bool {
        let lru_key = entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| *k);
        match lru_key {
            Some(key) => {
                if let Some(entry) = entries.remove(&key) {
                    self.sub_size(entry.size_bytes as u64);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::CACHE_EVICTIONS.inc();
                }
                true
            }
            None => false,
        }
    }
}

/// Approximate payload size: fixed overhead plus `rows x bytes_per_row`,
/// with `bytes_per_row` derived from the first row's measurement schema.
fn estimate_size(data: &DataSet) -> usize {
    const ENTRY_OVERHEAD: usize = 256;
    const ROW_BASE: usize = 48;
    const COLUMN_COST: usize = 40;

    let bytes_per_row = data
        .rows
        .first()
        .map(|row| {
            ROW_BASE
                + row.sensor.len()
                + row.asset.len()
                + row
                    .values
                    .keys()
                    .map(|name| name.len() + COLUMN_COST)
                    .sum::<usize>()
        })
        .unwrap_or(ROW_BASE);

    ENTRY_OVERHEAD + data.rows.len() * bytes_per_row
}
