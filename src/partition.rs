//! Capacity-constrained batch partitioning.
//!
//! Small stop sets are split into two trips by exhaustive search over sort
//! orders and first-trip load thresholds. Larger sets are split geographically
//! on the mean latitude or longitude and the boundary is refined one stop at a
//! time. When neither yields a feasible split, stops are packed greedily by
//! distance from the depot.
//!
//! Every candidate, including the single trip, is scored by the same route
//! estimate so that the comparison between them is fair.

use std::collections::HashSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::haversine::haversine_km;
use crate::model::{Coordinate, Depot, Stop, UnassignedReason, total_demand};
use crate::oracle::DistanceOracle;
use crate::sequencer::{MIN_IMPROVEMENT_KM, SequenceOptions, construction_cost, sequence};
use crate::traits::{Clock, TravelCost, TravelCostProvider};

/// Route estimate used to score candidate partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFidelity {
    /// Farthest-first nearest-neighbour distance.
    #[default]
    Construction,
    /// Construction followed by 2-opt.
    Improved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// No stop could be batched.
    Empty,
    SingleTrip,
    Enumerated,
    Clustered,
    Greedy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionOptions {
    /// Largest stop count searched exhaustively.
    pub enumeration_limit: usize,
    pub threshold_step: u32,
    /// Smallest first-trip load threshold tried.
    pub min_first_trip: u32,
    pub min_first_trip_share: f64,
    pub max_first_trip_share: f64,
    /// Load left for the second trip when one trip cannot carry everything.
    pub remainder_margin: u32,
    /// Upper bound on threshold fills tried across all sort orders.
    pub max_enumerated_fills: usize,
    pub refinement_iterations: usize,
    /// Load a boundary move must leave on the donor side.
    pub donor_floor: u32,
    pub fidelity: SearchFidelity,
    /// Passes used when `fidelity` is `Improved`.
    pub sequence: SequenceOptions,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            enumeration_limit: 15,
            threshold_step: 5,
            min_first_trip: 20,
            min_first_trip_share: 0.3,
            max_first_trip_share: 0.7,
            remainder_margin: 10,
            max_enumerated_fills: 1_000,
            refinement_iterations: 20,
            donor_floor: 20,
            fidelity: SearchFidelity::Construction,
            sequence: SequenceOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub batches: Vec<Vec<Stop>>,
    /// Stops that cannot fit in any trip on their own.
    pub infeasible: Vec<(Stop, UnassignedReason)>,
    pub strategy: PartitionStrategy,
}

/// Partition `stops` into capacity-feasible batches, pricing through `oracle`.
///
/// If today's quota cannot cover pairwise queries for the whole set, the
/// search runs on a single distance matrix instead.
pub fn partition<P: TravelCostProvider, C: Clock>(
    depot: &Depot,
    stops: &[Stop],
    capacity: u32,
    oracle: &DistanceOracle<P, C>,
    options: &PartitionOptions,
) -> Partition {
    let points = stops.iter().filter(|stop| stop.demand <= capacity).count() as u64 + 1;
    let check = oracle.check_batch(points * (points - 1));
    if check.allowed {
        return partition_with(depot, stops, capacity, oracle, options);
    }

    let mut locations = vec![depot.location];
    locations.extend(
        stops
            .iter()
            .filter(|stop| stop.demand <= capacity)
            .map(|stop| stop.location),
    );
    let matrix = oracle.batch_query(&locations);
    info!(
        expected_calls = check.expected_calls,
        projected_total = check.projected_total,
        provider_cells = matrix.provider_cells(),
        "pairwise budget refused, searching on one distance matrix"
    );
    partition_with(depot, stops, capacity, &matrix, options)
}

/// Partition `stops` pricing every edge through `cost`.
pub fn partition_with<T: TravelCost>(
    depot: &Depot,
    stops: &[Stop],
    capacity: u32,
    cost: &T,
    options: &PartitionOptions,
) -> Partition {
    let mut feasible = Vec::with_capacity(stops.len());
    let mut infeasible = Vec::new();
    for stop in stops {
        if stop.demand > capacity {
            warn!(stop_id = %stop.id, demand = stop.demand, capacity, "stop exceeds vehicle capacity");
            infeasible.push((
                stop.clone(),
                UnassignedReason::ExceedsCapacity {
                    demand: stop.demand,
                    capacity,
                },
            ));
        } else {
            feasible.push(stop.clone());
        }
    }

    if feasible.is_empty() {
        return Partition {
            batches: Vec::new(),
            infeasible,
            strategy: PartitionStrategy::Empty,
        };
    }

    let search = Search {
        depot,
        capacity: u64::from(capacity),
        cost,
        options,
    };
    let (batches, strategy) = search.run(feasible);
    info!(
        ?strategy,
        batches = batches.len(),
        infeasible = infeasible.len(),
        "partition chosen"
    );
    Partition {
        batches,
        infeasible,
        strategy,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortKey {
    Latitude,
    Longitude,
    DemandAscending,
    DemandDescending,
}

const SORT_KEYS: [SortKey; 4] = [
    SortKey::Latitude,
    SortKey::Longitude,
    SortKey::DemandAscending,
    SortKey::DemandDescending,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn of(self, point: Coordinate) -> f64 {
        match self {
            Axis::Latitude => point.lat,
            Axis::Longitude => point.lng,
        }
    }
}

/// A two-trip candidate and its estimated distance.
type Split = (Vec<Stop>, Vec<Stop>, f64);

/// First-trip fill at one load threshold, as indices into the stop list.
#[derive(Debug, Default, PartialEq)]
struct Fill {
    first: Vec<usize>,
    second: Vec<usize>,
    /// Lowest threshold at which a skipped stop would be taken instead.
    next_change: Option<u64>,
}

struct Search<'a, T> {
    depot: &'a Depot,
    capacity: u64,
    cost: &'a T,
    options: &'a PartitionOptions,
}

impl<T: TravelCost> Search<'_, T> {
    fn estimate(&self, stops: &[Stop]) -> f64 {
        match self.options.fidelity {
            SearchFidelity::Construction => construction_cost(self.depot, stops, self.cost),
            SearchFidelity::Improved => {
                sequence(self.depot, stops, self.cost, &self.options.sequence).distance_km
            }
        }
    }

    fn run(&self, stops: Vec<Stop>) -> (Vec<Vec<Stop>>, PartitionStrategy) {
        let total = total_demand(&stops);
        let single_trip = total <= self.capacity;

        let (split, strategy) = if stops.len() <= self.options.enumeration_limit {
            (self.enumerate(&stops, total, single_trip), PartitionStrategy::Enumerated)
        } else {
            (self.cluster(&stops), PartitionStrategy::Clustered)
        };

        if single_trip {
            let single = self.estimate(&stops);
            return match split {
                Some((first, second, km)) if km < single - MIN_IMPROVEMENT_KM => {
                    debug!(single_km = single, split_km = km, "two trips beat one");
                    (vec![first, second], strategy)
                }
                _ => (vec![stops], PartitionStrategy::SingleTrip),
            };
        }

        match split {
            Some((first, second, _)) => (vec![first, second], strategy),
            None => (self.greedy(stops), PartitionStrategy::Greedy),
        }
    }

    /// Inclusive first-trip load bounds, or `None` when the range is empty.
    fn threshold_range(&self, total: u64, single_trip: bool) -> Option<(u64, u64)> {
        let options = self.options;
        let min_first_trip = u64::from(options.min_first_trip);
        let (low, high) = if single_trip {
            (
                min_first_trip.max((total as f64 * options.min_first_trip_share).ceil() as u64),
                self.capacity
                    .min((total as f64 * options.max_first_trip_share).floor() as u64),
            )
        } else {
            (
                min_first_trip.max(total - self.capacity),
                self.capacity
                    .min(total.saturating_sub(u64::from(options.remainder_margin))),
            )
        };
        (low <= high).then_some((low, high))
    }

    fn step(&self) -> u64 {
        u64::from(self.options.threshold_step.max(1))
    }

    /// Best two-trip split over every sort order and load threshold.
    ///
    /// A fill only changes where the threshold crosses a skipped stop's
    /// running load, so thresholds in between are skipped and each distinct
    /// first trip is scored once.
    fn enumerate(&self, stops: &[Stop], total: u64, single_trip: bool) -> Option<Split> {
        let (low, high) = self.threshold_range(total, single_trip)?;
        let step = self.step();
        let limit = self.options.max_enumerated_fills;

        let mut fills = 0;
        let mut seen = HashSet::new();
        let mut candidates: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
        'orders: for key in SORT_KEYS {
            let order = sorted_order(stops, key);
            let mut threshold = low;
            while threshold <= high {
                if fills == limit {
                    warn!(limit, "enumeration fill budget spent");
                    break 'orders;
                }
                fills += 1;

                let fill = self.fill(stops, &order, threshold);
                debug!(sort = ?key, threshold, first = fill.first.len(), "enumerated fill");
                let next_change = fill.next_change;
                if self.is_feasible(stops, &fill) {
                    let mut members = fill.first.clone();
                    members.sort_unstable();
                    if seen.insert(members) {
                        candidates.push((fill.first, fill.second));
                    }
                }

                let Some(next) = next_change else {
                    break;
                };
                threshold = low + (next - low).div_ceil(step) * step;
            }
        }

        let picked = candidates
            .par_iter()
            .enumerate()
            .map(|(index, (first, second))| {
                let first = pick(stops, first);
                let second = pick(stops, second);
                let km = self.estimate(&first) + self.estimate(&second);
                (index, (first, second, km))
            })
            .min_by(|a, b| a.1.2.total_cmp(&b.1.2).then(a.0.cmp(&b.0)))
            .map(|(_, split)| split);
        debug!(fills, distinct = candidates.len(), "enumeration finished");
        picked
    }

    /// Fill the first trip up to `threshold` in `order`, skipping stops that
    /// do not fit; the rest form the second trip.
    fn fill(&self, stops: &[Stop], order: &[usize], threshold: u64) -> Fill {
        let mut fill = Fill::default();
        let mut load = 0;
        for &i in order {
            let reach = load + u64::from(stops[i].demand);
            if reach <= threshold {
                load = reach;
                fill.first.push(i);
            } else {
                fill.second.push(i);
                fill.next_change = Some(fill.next_change.map_or(reach, |next| next.min(reach)));
            }
        }
        fill
    }

    fn is_feasible(&self, stops: &[Stop], fill: &Fill) -> bool {
        !fill.first.is_empty()
            && !fill.second.is_empty()
            && total_demand(fill.second.iter().map(|&i| &stops[i])) <= self.capacity
    }

    fn cluster(&self, stops: &[Stop]) -> Option<Split> {
        let count = stops.len() as f64;
        let mean_lat = stops.iter().map(|stop| stop.location.lat).sum::<f64>() / count;
        let mean_lng = stops.iter().map(|stop| stop.location.lng).sum::<f64>() / count;

        let by_lat = split_on(stops, Axis::Latitude, mean_lat);
        let by_lng = split_on(stops, Axis::Longitude, mean_lng);
        let imbalance = |(a, b): &(Vec<Stop>, Vec<Stop>)| total_demand(a).abs_diff(total_demand(b));
        let (axis, mean, (mut a, mut b)) = if imbalance(&by_lat) <= imbalance(&by_lng) {
            (Axis::Latitude, mean_lat, by_lat)
        } else {
            (Axis::Longitude, mean_lng, by_lng)
        };
        debug!(?axis, mean, above = a.len(), below = b.len(), "geographic split");

        self.rebalance(&mut a, &mut b, axis, mean);
        if a.is_empty()
            || b.is_empty()
            || total_demand(&a) > self.capacity
            || total_demand(&b) > self.capacity
        {
            debug!("geographic split infeasible");
            return None;
        }

        Some(self.refine(a, b))
    }

    /// Move the stops nearest the split line off an over-capacity side.
    fn rebalance(&self, a: &mut Vec<Stop>, b: &mut Vec<Stop>, axis: Axis, mean: f64) {
        for _ in 0..a.len() + b.len() {
            let (donor, receiver) = if total_demand(a.iter()) > self.capacity {
                (&mut *a, &mut *b)
            } else if total_demand(b.iter()) > self.capacity {
                (&mut *b, &mut *a)
            } else {
                return;
            };

            let room = self.capacity.saturating_sub(total_demand(receiver.iter()));
            let nearest = donor
                .iter()
                .enumerate()
                .filter(|(_, stop)| u64::from(stop.demand) <= room)
                .min_by(|(_, x), (_, y)| {
                    (axis.of(x.location) - mean)
                        .abs()
                        .total_cmp(&(axis.of(y.location) - mean).abs())
                })
                .map(|(i, _)| i);
            let Some(i) = nearest else {
                return;
            };
            receiver.push(donor.remove(i));
        }
    }

    /// Single-stop boundary moves while they strictly shorten the estimate.
    fn refine(&self, mut a: Vec<Stop>, mut b: Vec<Stop>) -> Split {
        let mut best = self.estimate(&a) + self.estimate(&b);
        let donor_floor = u64::from(self.options.donor_floor);

        for iteration in 0..self.options.refinement_iterations {
            let moves: Vec<(bool, usize)> = (0..a.len())
                .map(|i| (true, i))
                .chain((0..b.len()).map(|i| (false, i)))
                .filter(|&(from_a, i)| {
                    let (donor, receiver) = if from_a { (&a, &b) } else { (&b, &a) };
                    let demand = u64::from(donor[i].demand);
                    donor.len() > 1
                        && total_demand(receiver) + demand <= self.capacity
                        && total_demand(donor) - demand >= donor_floor
                })
                .collect();

            let found = moves
                .par_iter()
                .enumerate()
                .filter_map(|(index, &(from_a, i))| {
                    let (mut donor, mut receiver) =
                        if from_a { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
                    receiver.push(donor.remove(i));
                    let km = self.estimate(&donor) + self.estimate(&receiver);
                    (km < best - MIN_IMPROVEMENT_KM).then_some((index, km))
                })
                .min_by(|x, y| x.1.total_cmp(&y.1).then(x.0.cmp(&y.0)));

            let Some((index, km)) = found else {
                break;
            };
            let (from_a, i) = moves[index];
            if from_a {
                b.push(a.remove(i));
            } else {
                a.push(b.remove(i));
            }
            debug!(iteration, saved_km = best - km, "boundary move");
            best = km;
        }

        (a, b, best)
    }

    /// Pack stops nearest-first, opening a new trip when the next stop
    /// would overflow the current one.
    fn greedy(&self, mut stops: Vec<Stop>) -> Vec<Vec<Stop>> {
        let depot = self.depot.location;
        stops.sort_by(|x, y| {
            haversine_km(depot, x.location).total_cmp(&haversine_km(depot, y.location))
        });

        let mut batches = Vec::new();
        let mut current: Vec<Stop> = Vec::new();
        let mut load = 0;
        for stop in stops {
            let demand = u64::from(stop.demand);
            if load + demand > self.capacity && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                load = 0;
            }
            load += demand;
            current.push(stop);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

/// Stable index order of `stops` under `key`.
fn sorted_order(stops: &[Stop], key: SortKey) -> Vec<usize> {
    let mut order: Vec<usize> = (0..stops.len()).collect();
    match key {
        SortKey::Latitude => {
            order.sort_by(|&a, &b| stops[a].location.lat.total_cmp(&stops[b].location.lat))
        }
        SortKey::Longitude => {
            order.sort_by(|&a, &b| stops[a].location.lng.total_cmp(&stops[b].location.lng))
        }
        SortKey::DemandAscending => order.sort_by_key(|&i| stops[i].demand),
        SortKey::DemandDescending => order.sort_by_key(|&i| std::cmp::Reverse(stops[i].demand)),
    }
    order
}

fn pick(stops: &[Stop], indices: &[usize]) -> Vec<Stop> {
    indices.iter().map(|&i| stops[i].clone()).collect()
}

/// Stops above `mean` on `axis`, then the rest.
fn split_on(stops: &[Stop], axis: Axis, mean: f64) -> (Vec<Stop>, Vec<Stop>) {
    stops
        .iter()
        .cloned()
        .partition(|stop| axis.of(stop.location) > mean)
}
