//! Data model shared by every stage of an optimization run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when both components are finite and within -90..90 / -180..180.
    pub fn in_range(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Key rounded to `precision` decimal places.
    pub fn key(&self, precision: u32) -> CoordKey {
        let scale = 10f64.powi(precision as i32);
        CoordKey((self.lat * scale).round() as i64, (self.lng * scale).round() as i64)
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Rounded fixed-point coordinate, usable as a hash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordKey(pub i64, pub i64);

/// The fixed start and end of every trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Depot {
    pub location: Coordinate,
}

impl Depot {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self {
            location: Coordinate::new(lat, lng),
        }
    }
}

/// An unvalidated delivery record as it arrives from the stop source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStop {
    pub id: Option<String>,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub demand: Option<i64>,
    /// Contact/address fields carried through untouched.
    pub metadata: BTreeMap<String, String>,
}

/// A validated delivery stop. Immutable once built by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub location: Coordinate,
    pub demand: u32,
    pub metadata: BTreeMap<String, String>,
}

impl Stop {
    pub fn new(id: impl Into<String>, location: Coordinate, demand: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            location,
            demand,
            metadata: BTreeMap::new(),
        }
    }
}

/// Sum of member demands, widened so that no set of stops can overflow it.
pub fn total_demand<'a>(stops: impl IntoIterator<Item = &'a Stop>) -> u64 {
    stops.into_iter().map(|stop| u64::from(stop.demand)).sum()
}

/// Where a distance figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeSource {
    Provider,
    FallbackEstimate,
}

/// Distance (km) and duration (minutes) between two coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceEdge {
    pub distance_km: f64,
    pub duration_min: f64,
    pub source: EdgeSource,
}

impl DistanceEdge {
    pub const ZERO: Self = Self {
        distance_km: 0.0,
        duration_min: 0.0,
        source: EdgeSource::FallbackEstimate,
    };
}

/// Why a record did not end up in any batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UnassignedReason {
    MissingCoordinates,
    ZeroCoordinate,
    CoordinatesOutOfRange { lat: f64, lng: f64 },
    MissingDemand,
    NonPositiveDemand { demand: i64 },
    DemandOutOfRange { demand: i64 },
    DuplicateId,
    ExceedsCapacity { demand: u32, capacity: u32 },
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCoordinates => write!(f, "missing coordinates"),
            Self::ZeroCoordinate => write!(f, "zero coordinate"),
            Self::CoordinatesOutOfRange { lat, lng } => {
                write!(f, "coordinates out of range ({lat}, {lng})")
            }
            Self::MissingDemand => write!(f, "missing demand"),
            Self::NonPositiveDemand { demand } => write!(f, "non-positive demand ({demand})"),
            Self::DemandOutOfRange { demand } => write!(f, "demand {demand} out of range"),
            Self::DuplicateId => write!(f, "duplicate identifier"),
            Self::ExceedsCapacity { demand, capacity } => {
                write!(f, "demand {demand} exceeds capacity {capacity}")
            }
        }
    }
}

/// Round to `places` decimals for presentation.
pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
