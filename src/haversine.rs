//! Haversine fallback estimate (used when the provider is unavailable).
//!
//! Uses great-circle distance scaled by a road-indirection factor, and a flat
//! minutes-per-km rate for travel time.
//! Less accurate than a road network, but always available.

use crate::model::{Coordinate, DistanceEdge, EdgeSource};
use crate::traits::TravelCost;

/// Road-indirection factor for dense urban terrain.
pub const DEFAULT_ROAD_FACTOR: f64 = 1.4;

/// Minutes of driving per estimated road kilometre.
pub const DEFAULT_MINUTES_PER_KM: f64 = 2.5;

/// Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Calculate haversine distance between two points in kilometers.
pub fn haversine_km(from: Coordinate, to: Coordinate) -> f64 {
    let lat1_rad = from.lat.to_radians();
    let lat2_rad = to.lat.to_radians();
    let delta_lat = (to.lat - from.lat).to_radians();
    let delta_lng = (to.lng - from.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Geometry-derived edge estimate.
#[derive(Debug, Clone, Copy)]
pub struct FallbackEstimator {
    /// Multiplier from straight-line to road distance.
    pub road_factor: f64,
    /// Estimated minutes per road kilometre.
    pub minutes_per_km: f64,
}

impl Default for FallbackEstimator {
    fn default() -> Self {
        Self {
            road_factor: DEFAULT_ROAD_FACTOR,
            minutes_per_km: DEFAULT_MINUTES_PER_KM,
        }
    }
}

impl FallbackEstimator {
    pub fn new(road_factor: f64, minutes_per_km: f64) -> Self {
        Self {
            road_factor,
            minutes_per_km,
        }
    }

    pub fn estimate(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        let distance_km = haversine_km(from, to) * self.road_factor;
        DistanceEdge {
            distance_km,
            duration_min: distance_km * self.minutes_per_km,
            source: EdgeSource::FallbackEstimate,
        }
    }
}

impl TravelCost for FallbackEstimator {
    fn edge(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        self.estimate(from, to)
    }
}
