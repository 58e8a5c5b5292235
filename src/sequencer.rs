//! Visiting order within one batch.
//!
//! Construction starts at the stop farthest from the depot and then walks to
//! the nearest unvisited stop, so the long haul happens first rather than as a
//! there-and-back tail. 2-opt then reverses segments while that strictly
//! shortens the round trip.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Depot, DistanceEdge, Stop};
use crate::traits::TravelCost;

/// Gains below this are floating-point summation noise, not improvements.
pub(crate) const MIN_IMPROVEMENT_KM: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceOptions {
    /// Maximum 2-opt passes; each pass adopts at most one reversal.
    pub two_opt_iterations: usize,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            two_opt_iterations: 100,
        }
    }
}

/// An ordered round trip with unrounded totals.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedRoute {
    pub stops: Vec<Stop>,
    pub distance_km: f64,
    pub duration_min: f64,
    /// Distance of the construction route before 2-opt.
    pub construction_distance_km: f64,
    /// Depot to first stop, stop to stop, last stop to depot.
    pub legs: Vec<DistanceEdge>,
}

impl SequencedRoute {
    fn empty() -> Self {
        Self {
            stops: Vec::new(),
            distance_km: 0.0,
            duration_min: 0.0,
            construction_distance_km: 0.0,
            legs: Vec::new(),
        }
    }

    /// Kilometres saved by 2-opt.
    pub fn improvement_km(&self) -> f64 {
        (self.construction_distance_km - self.distance_km).max(0.0)
    }
}

/// Order `stops` into a round trip from `depot`.
pub fn sequence<T: TravelCost>(
    depot: &Depot,
    stops: &[Stop],
    cost: &T,
    options: &SequenceOptions,
) -> SequencedRoute {
    if stops.is_empty() {
        return SequencedRoute::empty();
    }

    let constructed = construct(depot, stops, cost);
    let construction_distance_km = total_distance(&route_legs(depot, stops, &constructed, cost));
    let order = two_opt(depot, stops, constructed, cost, options.two_opt_iterations);

    let legs = route_legs(depot, stops, &order, cost);
    let distance_km = total_distance(&legs);
    let duration_min = legs.iter().map(|leg| leg.duration_min).sum();
    SequencedRoute {
        stops: order.iter().map(|&i| stops[i].clone()).collect(),
        distance_km,
        duration_min,
        construction_distance_km,
        legs,
    }
}

/// Farthest-first nearest-neighbour order, as indices into `stops`.
pub fn construct<T: TravelCost>(depot: &Depot, stops: &[Stop], cost: &T) -> Vec<usize> {
    let from_depot: Vec<f64> = stops
        .par_iter()
        .map(|stop| cost.edge(depot.location, stop.location).distance_km)
        .collect();

    let mut unvisited: Vec<usize> = (0..stops.len()).collect();
    // Stable: equally distant stops keep input order.
    unvisited.sort_by(|a, b| from_depot[*b].total_cmp(&from_depot[*a]));

    let mut order = Vec::with_capacity(stops.len());
    if unvisited.is_empty() {
        return order;
    }
    let mut current = unvisited.remove(0);
    order.push(current);

    while !unvisited.is_empty() {
        let here = stops[current].location;
        let distances: Vec<f64> = unvisited
            .par_iter()
            .map(|&i| cost.edge(here, stops[i].location).distance_km)
            .collect();

        let mut nearest = 0;
        for (position, distance) in distances.iter().enumerate().skip(1) {
            if *distance < distances[nearest] {
                nearest = position;
            }
        }
        current = unvisited.remove(nearest);
        order.push(current);
    }

    order
}

/// Legs of the round trip visiting `stops` in `order`.
///
/// A single stop is priced as twice the outbound leg.
pub fn route_legs<T: TravelCost>(
    depot: &Depot,
    stops: &[Stop],
    order: &[usize],
    cost: &T,
) -> Vec<DistanceEdge> {
    match order {
        [] => Vec::new(),
        [only] => {
            let out = cost.edge(depot.location, stops[*only].location);
            vec![out, out]
        }
        _ => {
            let mut legs = Vec::with_capacity(order.len() + 1);
            let mut here = depot.location;
            for &i in order {
                legs.push(cost.edge(here, stops[i].location));
                here = stops[i].location;
            }
            legs.push(cost.edge(here, depot.location));
            legs
        }
    }
}

/// Round-trip distance of `order` in kilometres.
pub fn route_cost<T: TravelCost>(depot: &Depot, stops: &[Stop], order: &[usize], cost: &T) -> f64 {
    total_distance(&route_legs(depot, stops, order, cost))
}

/// Round-trip distance of the construction route, without 2-opt.
pub fn construction_cost<T: TravelCost>(depot: &Depot, stops: &[Stop], cost: &T) -> f64 {
    let order = construct(depot, stops, cost);
    route_cost(depot, stops, &order, cost)
}

fn total_distance(legs: &[DistanceEdge]) -> f64 {
    legs.iter().map(|leg| leg.distance_km).sum()
}

/// Repeatedly adopt the best strictly improving segment reversal.
fn two_opt<T: TravelCost>(
    depot: &Depot,
    stops: &[Stop],
    mut order: Vec<usize>,
    cost: &T,
    max_passes: usize,
) -> Vec<usize> {
    let n = order.len();
    if n < 3 {
        return order;
    }

    let candidates: Vec<(usize, usize)> = (0..n - 1)
        .flat_map(|i| (i + 2..n).map(move |j| (i, j)))
        .collect();
    let mut best = route_cost(depot, stops, &order, cost);

    for pass in 0..max_passes {
        let found = candidates
            .par_iter()
            .filter_map(|&(i, j)| {
                let mut candidate = order.clone();
                candidate[i..=j].reverse();
                let distance = route_cost(depot, stops, &candidate, cost);
                (distance < best - MIN_IMPROVEMENT_KM).then_some(((i, j), distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let Some(((i, j), distance)) = found else {
            break;
        };
        debug!(pass, i, j, saved_km = best - distance, "2-opt reversal");
        order[i..=j].reverse();
        best = distance;
    }

    order
}
