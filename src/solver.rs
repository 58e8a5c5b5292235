//! Optimization run: validate, partition, sequence, aggregate.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{Depot, DistanceEdge, RawStop, Stop, round_to, total_demand};
use crate::oracle::{DistanceOracle, OracleUsage};
use crate::partition::{PartitionOptions, PartitionStrategy, partition};
use crate::sequencer::{SequenceOptions, SequencedRoute, sequence};
use crate::traits::{Clock, TravelCostProvider};
use crate::validation::{UnassignedStop, validate_stops};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    pub sequence: SequenceOptions,
    pub partition: PartitionOptions,
    /// Worker threads for concurrent oracle queries and candidate evaluation.
    pub worker_threads: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            sequence: SequenceOptions::default(),
            partition: PartitionOptions::default(),
            worker_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Optimized,
    /// Validation left nothing to route.
    NoValidInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// 1-based position in the run.
    pub batch_number: usize,
    pub stops: Vec<Stop>,
    pub route_order: Vec<String>,
    pub total_distance_km: f64,
    pub total_duration_min: f64,
    pub capacity_used: u64,
    /// Kilometres saved by 2-opt over the construction route.
    pub improvement_km: f64,
    pub legs: Vec<DistanceEdge>,
}

impl BatchResult {
    fn new(batch_number: usize, route: SequencedRoute) -> Self {
        Self {
            batch_number,
            route_order: route.stops.iter().map(|stop| stop.id.clone()).collect(),
            capacity_used: total_demand(&route.stops),
            total_distance_km: round_to(route.distance_km, 2),
            total_duration_min: round_to(route.duration_min, 1),
            improvement_km: round_to(route.improvement_km(), 2),
            stops: route.stops,
            legs: route.legs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Stops that passed validation.
    pub total_stops: usize,
    pub batched_stops: usize,
    /// Demand carried by the batches.
    pub total_demand: u64,
    pub batch_count: usize,
    pub avg_distance_per_batch: f64,
    pub avg_stops_per_batch: f64,
    pub capacity_utilization_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerResult {
    pub status: RunStatus,
    pub strategy: PartitionStrategy,
    pub batches: Vec<BatchResult>,
    pub unassigned: Vec<UnassignedStop>,
    pub total_distance_km: f64,
    pub total_duration_min: f64,
    pub statistics: Statistics,
    pub oracle_usage: OracleUsage,
}

/// Plan one day's trips from `depot` for the raw stop records.
///
/// Never fails: invalid and oversized stops are reported in `unassigned`, and
/// provider trouble shows up only as fallback provenance on the legs.
pub fn solve<P, C>(
    depot: &Depot,
    raw: &[RawStop],
    capacity: u32,
    oracle: &DistanceOracle<P, C>,
    options: SolveOptions,
) -> PlannerResult
where
    P: TravelCostProvider,
    C: Clock,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.worker_threads.max(1))
        .build();
    match pool {
        Ok(pool) => pool.install(|| run(depot, raw, capacity, oracle, &options)),
        Err(err) => {
            warn!(error = %err, "could not build worker pool, using the global pool");
            run(depot, raw, capacity, oracle, &options)
        }
    }
}

fn run<P, C>(
    depot: &Depot,
    raw: &[RawStop],
    capacity: u32,
    oracle: &DistanceOracle<P, C>,
    options: &SolveOptions,
) -> PlannerResult
where
    P: TravelCostProvider,
    C: Clock,
{
    let purged = oracle.purge_cache();
    if purged > 0 {
        debug!(purged, "expired cache entries dropped");
    }

    let validated = validate_stops(raw);
    let mut unassigned = validated.discarded;

    if validated.stops.is_empty() {
        warn!(records = raw.len(), "no valid stops to route");
        return PlannerResult {
            status: RunStatus::NoValidInput,
            strategy: PartitionStrategy::Empty,
            batches: Vec::new(),
            unassigned,
            total_distance_km: 0.0,
            total_duration_min: 0.0,
            statistics: Statistics::default(),
            oracle_usage: oracle.usage(),
        };
    }

    let partition = partition(depot, &validated.stops, capacity, oracle, &options.partition);
    unassigned.extend(
        partition
            .infeasible
            .into_iter()
            .map(|(stop, reason)| UnassignedStop {
                stop_id: stop.id,
                reason,
            }),
    );

    let batches: Vec<BatchResult> = partition
        .batches
        .iter()
        .enumerate()
        .map(|(index, stops)| {
            let route = sequence(depot, stops, oracle, &options.sequence);
            let batch = BatchResult::new(index + 1, route);
            info!(
                batch = batch.batch_number,
                stops = batch.stops.len(),
                capacity_used = batch.capacity_used,
                distance_km = batch.total_distance_km,
                improvement_km = batch.improvement_km,
                "batch sequenced"
            );
            batch
        })
        .collect();

    let total_distance_km = round_to(batches.iter().map(|b| b.total_distance_km).sum(), 2);
    let total_duration_min = round_to(batches.iter().map(|b| b.total_duration_min).sum(), 1);
    let statistics = statistics(validated.stops.len(), &batches, capacity, total_distance_km);
    info!(
        batches = batches.len(),
        unassigned = unassigned.len(),
        total_distance_km,
        total_duration_min,
        "optimization complete"
    );

    PlannerResult {
        status: RunStatus::Optimized,
        strategy: partition.strategy,
        batches,
        unassigned,
        total_distance_km,
        total_duration_min,
        statistics,
        oracle_usage: oracle.usage(),
    }
}

fn statistics(
    total_stops: usize,
    batches: &[BatchResult],
    capacity: u32,
    total_distance_km: f64,
) -> Statistics {
    let batch_count = batches.len();
    let batched_stops = batches.iter().map(|b| b.stops.len()).sum();
    let total_demand = batches.iter().map(|b| b.capacity_used).sum();
    if batch_count == 0 {
        return Statistics {
            total_stops,
            ..Statistics::default()
        };
    }

    let count = batch_count as f64;
    Statistics {
        total_stops,
        batched_stops,
        total_demand,
        batch_count,
        avg_distance_per_batch: round_to(total_distance_km / count, 2),
        avg_stops_per_batch: round_to(batched_stops as f64 / count, 1),
        capacity_utilization_pct: round_to(
            total_demand as f64 / (count * f64::from(capacity)) * 100.0,
            1,
        ),
    }
}
