//! Distance oracle: cache, then provider, then geometric fallback.
//!
//! The oracle never fails. Provider trouble degrades individual answers to a
//! [`EdgeSource::FallbackEstimate`] and, after repeated failures or quota
//! exhaustion, switches the whole oracle to fallback until the next day.
//!
//! One oracle is built per process and shared by reference; all state lives
//! behind its own locks so concurrent runs can query it freely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::cache::EdgeCache;
use crate::haversine::{DEFAULT_MINUTES_PER_KM, DEFAULT_ROAD_FACTOR, FallbackEstimator};
use crate::model::{CoordKey, Coordinate, DistanceEdge, EdgeSource, round_to};
use crate::quota::{BatchCheck, QuotaConfig, QuotaGuard, QuotaSnapshot};
use crate::traits::{
    Clock, ProviderError, ProviderLeg, ProviderTable, TravelCost, TravelCostProvider,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Straight-line to road distance multiplier for fallback estimates.
    pub road_factor: f64,
    /// Minutes per estimated kilometre for fallback estimates.
    pub minutes_per_km: f64,
    /// Consecutive provider failures that force fallback for the day.
    pub failure_threshold: u32,
    pub cache_ttl_secs: u64,
    /// Cache size at which inserts first evict expired entries.
    pub cache_purge_threshold: usize,
    /// Decimal places kept in cache keys.
    pub coordinate_precision: u32,
    pub pair_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    /// UTC offset of the calendar day used for quota resets.
    pub day_offset_hours: i8,
    pub quota: QuotaConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            road_factor: DEFAULT_ROAD_FACTOR,
            minutes_per_km: DEFAULT_MINUTES_PER_KM,
            failure_threshold: 3,
            cache_ttl_secs: 24 * 60 * 60,
            cache_purge_threshold: 100_000,
            coordinate_precision: 6,
            pair_timeout_ms: 10_000,
            batch_timeout_ms: 30_000,
            day_offset_hours: 0,
            quota: QuotaConfig::default(),
        }
    }
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Placeholder provider type for an oracle that never calls out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

impl TravelCostProvider for Offline {
    fn leg(&self, _: Coordinate, _: Coordinate, _: Duration) -> Result<ProviderLeg, ProviderError> {
        Err(ProviderError::Unavailable)
    }

    fn table(&self, _: &[Coordinate], _: Duration) -> Result<ProviderTable, ProviderError> {
        Err(ProviderError::Unavailable)
    }
}

/// Oracle usage counters for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleUsage {
    #[serde(flatten)]
    pub quota: QuotaSnapshot,
    pub usage_percentage: f64,
    pub provider_configured: bool,
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Share of lookups served from cache, in percent (one decimal).
    pub cache_hit_rate: f64,
}

pub struct DistanceOracle<P, C = SystemClock> {
    provider: Option<P>,
    clock: C,
    config: OracleConfig,
    offset: UtcOffset,
    estimator: FallbackEstimator,
    cache: EdgeCache,
    quota: QuotaGuard,
}

impl<P: TravelCostProvider> DistanceOracle<P, SystemClock> {
    pub fn new(provider: P, config: OracleConfig) -> Self {
        Self::with_clock(Some(provider), SystemClock, config)
    }
}

impl DistanceOracle<Offline, SystemClock> {
    /// An oracle that answers every query with the fallback estimate.
    pub fn offline(config: OracleConfig) -> Self {
        Self::with_clock(None, SystemClock, config)
    }
}

impl<P: TravelCostProvider, C: Clock> DistanceOracle<P, C> {
    pub fn with_clock(provider: Option<P>, clock: C, config: OracleConfig) -> Self {
        let offset = UtcOffset::from_hms(config.day_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC);
        let today = clock.now().to_offset(offset).date();
        let ttl = time::Duration::seconds(i64::try_from(config.cache_ttl_secs).unwrap_or(i64::MAX));
        Self {
            provider,
            estimator: FallbackEstimator::new(config.road_factor, config.minutes_per_km),
            cache: EdgeCache::new(ttl, config.coordinate_precision, config.cache_purge_threshold),
            quota: QuotaGuard::new(config.quota.clone(), config.failure_threshold, today),
            clock,
            config,
            offset,
        }
    }

    fn today_at(&self, now: OffsetDateTime) -> Date {
        now.to_offset(self.offset).date()
    }

    /// Distance and duration from `from` to `to`.
    pub fn query(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        let now = self.clock.now();
        if let Some(edge) = self.cache.get(from, to, now) {
            return edge;
        }

        let today = self.today_at(now);
        let edge = self
            .provider_leg(from, to, today)
            .unwrap_or_else(|| self.estimator.estimate(from, to));
        self.cache.insert(from, to, edge, now)
    }

    /// Query `origin` to every target concurrently, preserving target order.
    pub fn query_from(&self, origin: Coordinate, targets: &[Coordinate]) -> Vec<DistanceEdge> {
        targets
            .par_iter()
            .map(|target| self.query(origin, *target))
            .collect()
    }

    /// Geometric estimate only; touches neither cache nor provider.
    pub fn fallback(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        self.estimator.estimate(from, to)
    }

    fn provider_leg(&self, from: Coordinate, to: Coordinate, today: Date) -> Option<DistanceEdge> {
        let provider = self.provider.as_ref()?;
        if let Err(denial) = self.quota.try_reserve(today) {
            debug!(?denial, %from, %to, "provider skipped");
            return None;
        }

        let timeout = Duration::from_millis(self.config.pair_timeout_ms);
        let started = Instant::now();
        let result = provider
            .leg(from, to, timeout)
            .and_then(|leg| within_deadline(leg, started.elapsed(), timeout))
            .and_then(|leg| {
                if leg.is_well_formed() {
                    Ok(leg)
                } else {
                    Err(ProviderError::Malformed(format!("{leg:?}")))
                }
            });

        match result {
            Ok(leg) => {
                self.quota.record_success(today);
                Some(provider_edge(leg))
            }
            Err(err) => {
                self.note_failure(&err, today);
                None
            }
        }
    }

    fn note_failure(&self, err: &ProviderError, today: Date) {
        let tripped = self.quota.record_failure(today);
        warn!(error = %err, "provider call failed, using fallback estimate");
        if tripped {
            warn!(
                threshold = self.config.failure_threshold,
                "consecutive provider failures, forcing fallback for the rest of the day"
            );
        }
    }

    /// Full pairwise matrix for `points` in one provider round trip.
    ///
    /// Cells the provider could not answer fall back to the geometric estimate
    /// individually; if the round trip itself fails or is not permitted, every
    /// uncached cell is estimated.
    pub fn batch_query(&self, points: &[Coordinate]) -> DistanceMatrix {
        let now = self.clock.now();
        let cached: Vec<Vec<Option<DistanceEdge>>> = points
            .iter()
            .map(|from| points.iter().map(|to| self.cache.get(*from, *to, now)).collect())
            .collect();
        let complete = cached.iter().flatten().all(Option::is_some);

        let table = if complete || points.is_empty() {
            None
        } else {
            self.provider_table(points, self.today_at(now))
        };

        let cells = points
            .iter()
            .enumerate()
            .map(|(i, from)| {
                points
                    .iter()
                    .enumerate()
                    .map(|(j, to)| {
                        let known = cached.get(i).and_then(|row| row.get(j)).copied().flatten();
                        if let Some(edge) = known {
                            return edge;
                        }
                        let provided = table
                            .as_ref()
                            .and_then(|rows| rows.get(i))
                            .and_then(|row| row.get(j))
                            .copied()
                            .flatten()
                            .filter(ProviderLeg::is_well_formed);
                        match provided {
                            Some(leg) => self.cache.insert(*from, *to, provider_edge(leg), now),
                            None => self.estimator.estimate(*from, *to),
                        }
                    })
                    .collect()
            })
            .collect();

        DistanceMatrix::new(
            points.to_vec(),
            cells,
            self.estimator,
            self.config.coordinate_precision,
        )
    }

    fn provider_table(&self, points: &[Coordinate], today: Date) -> Option<ProviderTable> {
        let provider = self.provider.as_ref()?;
        if let Err(denial) = self.quota.try_reserve(today) {
            debug!(?denial, points = points.len(), "batch provider call skipped");
            return None;
        }

        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        let started = Instant::now();
        let result = provider
            .table(points, timeout)
            .and_then(|table| within_deadline(table, started.elapsed(), timeout))
            .and_then(|table| {
                let square = table.len() == points.len()
                    && table.iter().all(|row| row.len() == points.len());
                if square {
                    Ok(table)
                } else {
                    Err(ProviderError::Malformed(format!(
                        "expected a {n}x{n} table",
                        n = points.len()
                    )))
                }
            });

        match result {
            Ok(table) => {
                self.quota.record_success(today);
                Some(table)
            }
            Err(err) => {
                self.note_failure(&err, today);
                None
            }
        }
    }

    /// Would `expected` more provider calls stay within today's limit?
    pub fn check_batch(&self, expected: u64) -> BatchCheck {
        let today = self.today_at(self.clock.now());
        self.quota.check_batch(expected, today)
    }

    /// One uncached provider call between `from` and `to`.
    ///
    /// Runs even while fallback is forced; success re-enables the provider.
    pub fn probe(&self, from: Coordinate, to: Coordinate) -> bool {
        let Some(provider) = self.provider.as_ref() else {
            return false;
        };
        let now = self.clock.now();
        let today = self.today_at(now);
        if let Err(denial) = self.quota.try_reserve_probe(today) {
            debug!(?denial, "health probe skipped");
            return false;
        }

        let timeout = Duration::from_millis(self.config.pair_timeout_ms);
        let started = Instant::now();
        match provider
            .leg(from, to, timeout)
            .and_then(|leg| within_deadline(leg, started.elapsed(), timeout))
        {
            Ok(leg) if leg.is_well_formed() => {
                self.quota.clear_fallback(today);
                self.cache.insert(from, to, provider_edge(leg), now);
                true
            }
            Ok(leg) => {
                self.note_failure(&ProviderError::Malformed(format!("{leg:?}")), today);
                false
            }
            Err(err) => {
                self.note_failure(&err, today);
                false
            }
        }
    }

    pub fn is_forced_fallback(&self) -> bool {
        let today = self.today_at(self.clock.now());
        self.quota.is_forced_fallback(today)
    }

    /// Zero the quota counters and leave forced fallback.
    pub fn reset_quota(&self) {
        let today = self.today_at(self.clock.now());
        warn!("provider quota reset manually");
        self.quota.reset(today);
    }

    /// Drop expired cache entries, returning how many were removed.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired(self.clock.now())
    }

    pub fn usage(&self) -> OracleUsage {
        let quota = self.quota.snapshot(self.today_at(self.clock.now()));
        let hits = self.cache.hits();
        let misses = self.cache.misses();
        let lookups = hits + misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            round_to(hits as f64 / lookups as f64 * 100.0, 1)
        };
        OracleUsage {
            usage_percentage: quota.usage_percentage(),
            quota,
            provider_configured: self.provider.is_some(),
            cache_size: self.cache.len(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate,
        }
    }
}

impl<P: TravelCostProvider, C: Clock> TravelCost for DistanceOracle<P, C> {
    fn edge(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        self.query(from, to)
    }
}

fn within_deadline<T>(value: T, elapsed: Duration, timeout: Duration) -> Result<T, ProviderError> {
    if elapsed > timeout {
        return Err(ProviderError::DeadlineExceeded {
            timeout_ms: timeout.as_millis(),
        });
    }
    Ok(value)
}

fn provider_edge(leg: ProviderLeg) -> DistanceEdge {
    DistanceEdge {
        distance_km: leg.distance_meters / 1000.0,
        duration_min: leg.duration_seconds / 60.0,
        source: EdgeSource::Provider,
    }
}

/// Pairwise edges for a fixed point list.
///
/// Lookups for coordinates outside the list are estimated geometrically.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    points: Vec<Coordinate>,
    index: HashMap<CoordKey, usize>,
    cells: Vec<Vec<DistanceEdge>>,
    estimator: FallbackEstimator,
    precision: u32,
}

impl DistanceMatrix {
    fn new(
        points: Vec<Coordinate>,
        cells: Vec<Vec<DistanceEdge>>,
        estimator: FallbackEstimator,
        precision: u32,
    ) -> Self {
        let mut index = HashMap::new();
        for (i, point) in points.iter().enumerate() {
            index.entry(point.key(precision)).or_insert(i);
        }
        Self {
            points,
            index,
            cells,
            estimator,
            precision,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<DistanceEdge> {
        self.cells.get(i).and_then(|row| row.get(j)).copied()
    }

    /// Number of cells answered by the provider.
    pub fn provider_cells(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|edge| edge.source == EdgeSource::Provider)
            .count()
    }
}

impl TravelCost for DistanceMatrix {
    fn edge(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        let i = self.index.get(&from.key(self.precision));
        let j = self.index.get(&to.key(self.precision));
        match (i, j) {
            (Some(&i), Some(&j)) => self
                .get(i, j)
                .unwrap_or_else(|| self.estimator.estimate(from, to)),
            _ => self.estimator.estimate(from, to),
        }
    }
}
