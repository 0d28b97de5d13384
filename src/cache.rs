use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::models::{Event, Snapshot};

// Full eviction sweeps are amortized over this many applied events.
const SWEEP_INTERVAL: u64 = 64;

struct CacheEntry {
    snapshot: Snapshot,
    last_access: Instant,
    dirty: bool,
}

/// Locally-cached, eventually-consistent view of queried world objects.
///
/// Snapshots are keyed by target identifier (`player`, `entity:12`,
/// `block:1,64,0`). Versions only ever increase; a snapshot that an event has
/// marked dirty is never served, forcing the next read to re-query.
pub struct WorldCache {
    entries: DashMap<String, CacheEntry>,
    staleness_window: Duration,
    applied: AtomicU64,
}

impl WorldCache {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            staleness_window,
            applied: AtomicU64::new(0),
        }
    }

    /// Returns the cached snapshot for `target` when it is still current.
    ///
    /// Misses on unknown, dirty, or staleness-evicted targets; the caller is
    /// expected to re-query the remote and store the result with
    /// [`store_fetched`](Self::store_fetched).
    pub fn lookup(&self, target: &str) -> Option<Snapshot> {
        let mut entry = self.entries.get_mut(target)?;
        if entry.dirty {
            return None;
        }
        if entry.last_access.elapsed() > self.staleness_window {
            drop(entry);
            self.entries.remove(target);
            trace!(target_id = target, "evicted stale snapshot on read");
            return None;
        }
        entry.last_access = Instant::now();
        Some(entry.snapshot.clone())
    }

    /// The current version for `target`, or 0 when nothing is cached.
    ///
    /// Read before issuing a query so [`store_fetched`](Self::store_fetched)
    /// can tell whether an event overtook the response in flight.
    pub fn version_of(&self, target: &str) -> u64 {
        self.entries.get(target).map(|e| e.snapshot.version).unwrap_or(0)
    }

    /// Stores a query result, unless newer event-applied state exists.
    ///
    /// `observed_version` is the version read before the query was issued.
    /// If an event bumped the target past it while the request was in
    /// flight, the fetched payload is already stale and the event-derived
    /// snapshot is returned instead; versions never regress.
    pub fn store_fetched(&self, target: &str, attrs: Value, observed_version: u64) -> Snapshot {
        let mut entry = self
            .entries
            .entry(target.to_string())
            .or_insert_with(|| CacheEntry {
                snapshot: Snapshot {
                    target: target.to_string(),
                    version: 0,
                    attrs: Value::Object(Map::new()),
                },
                last_access: Instant::now(),
                dirty: false,
            });

        if entry.snapshot.version > observed_version {
            debug!(
                target_id = target,
                fetched_at = observed_version,
                current = entry.snapshot.version,
                "event overtook in-flight query; keeping newer snapshot"
            );
        } else {
            entry.snapshot.version += 1;
            entry.snapshot.attrs = attrs;
            entry.dirty = false;
        }
        entry.last_access = Instant::now();
        entry.snapshot.clone()
    }

    /// Applies a server-pushed change notification.
    ///
    /// The event's JSON payload is shallow-merged into the target's
    /// attributes and the version is bumped. An unknown target gets a
    /// tentative snapshot; the cache cannot assume complete prior knowledge
    /// of the world. Events named `*.invalidated` mark the snapshot dirty so
    /// the next read re-queries.
    pub fn apply_event(&self, event: &Event) {
        let mut entry = self
            .entries
            .entry(event.target.clone())
            .or_insert_with(|| {
                trace!(target_id = %event.target, "tentative snapshot for unknown target");
                CacheEntry {
                    snapshot: Snapshot {
                        target: event.target.clone(),
                        version: 0,
                        attrs: Value::Object(Map::new()),
                    },
                    last_access: Instant::now(),
                    dirty: false,
                }
            });

        entry.snapshot.version += 1;
        if event.name.ends_with(".invalidated") || event.name == "invalidated" {
            entry.dirty = true;
        } else if let Some(payload) = event.json_payload() {
            merge_attrs(&mut entry.snapshot.attrs, payload);
        } else if !event.args.is_empty() {
            // Non-JSON payloads are kept under the event name rather than
            // discarded.
            let rendered = Value::String(format!("{:?}", event.args));
            if let Value::Object(map) = &mut entry.snapshot.attrs {
                map.insert(event.name.clone(), rendered);
            }
        }
        drop(entry);

        if self.applied.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.evict_stale();
        }
    }

    /// Drops entries not accessed within the staleness window.
    ///
    /// Non-blocking; an evicted entry simply causes the next read to
    /// re-query.
    pub fn evict_stale(&self) {
        let window = self.staleness_window;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_access.elapsed() <= window);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "swept stale snapshots");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn merge_attrs(into: &mut Value, payload: Value) {
    let (Value::Object(dst), Value::Object(src)) = (into, payload) else {
        return;
    };
    for (key, value) in src {
        dst.insert(key, value);
    }
}
