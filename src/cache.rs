//! Time-bounded cache of oracle answers.
//!
//! Entries are keyed by the rounded coordinate pair of their endpoints and are
//! never rewritten while live; an expired entry is treated as absent and is
//! evicted once the map grows past its purge threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::model::{CoordKey, Coordinate, DistanceEdge};

/// Directed edge key.
pub type EdgeKey = (CoordKey, CoordKey);

#[derive(Debug, Clone, Copy)]
struct CachedEdge {
    edge: DistanceEdge,
    stored_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct EdgeCache {
    entries: RwLock<HashMap<EdgeKey, CachedEdge>>,
    ttl: Duration,
    precision: u32,
    purge_threshold: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EdgeCache {
    pub fn new(ttl: Duration, precision: u32, purge_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            precision,
            purge_threshold,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(&self, from: Coordinate, to: Coordinate) -> EdgeKey {
        (from.key(self.precision), to.key(self.precision))
    }

    /// Live entry for the pair, counting the lookup as a hit or miss.
    pub fn get(&self, from: Coordinate, to: Coordinate, now: OffsetDateTime) -> Option<DistanceEdge> {
        let key = self.key(from, to);
        let found = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .filter(|cached| now - cached.stored_at < self.ttl)
            .map(|cached| cached.edge);

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store an answer unless a live one is already present.
    ///
    /// Returns the edge that is now cached, which may be an earlier writer's.
    pub fn insert(
        &self,
        from: Coordinate,
        to: Coordinate,
        edge: DistanceEdge,
        now: OffsetDateTime,
    ) -> DistanceEdge {
        let key = self.key(from, to);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some(existing) if now - existing.stored_at < self.ttl => existing.edge,
            _ => {
                if entries.len() >= self.purge_threshold {
                    let before = entries.len();
                    entries.retain(|_, cached| now - cached.stored_at < self.ttl);
                    debug!(evicted = before - entries.len(), "edge cache purged on insert");
                }
                entries.insert(
                    key,
                    CachedEdge {
                        edge,
                        stored_at: now,
                    },
                );
                edge
            }
        }
    }

    /// Drop expired entries.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, cached| now - cached.stored_at < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
