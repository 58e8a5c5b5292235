//! Approximate positions of North and East Jakarta landmarks.
//!
//! Close enough to real streets to be routable with a Java OSRM extract.

use depot_router::model::{Coordinate, Depot, RawStop};

/// A named location with coordinates.
#[derive(Debug, Clone)]
pub struct Location {
    pub name: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(name: &'static str, lat: f64, lng: f64) -> Self {
        Self { name, lat, lng }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    /// A raw stop record for this location.
    pub fn raw_stop(&self, id: &str, demand: i64) -> RawStop {
        RawStop {
            id: Some(id.to_string()),
            name: Some(self.name.to_string()),
            latitude: Some(self.lat),
            longitude: Some(self.lng),
            demand: Some(demand),
            ..RawStop::default()
        }
    }
}

/// Warehouse in Cilincing used as the depot.
pub const DEPOT: Location = Location::new("Gudang Cilincing", -6.1126, 106.9173);

pub fn depot() -> Depot {
    Depot::new(DEPOT.lat, DEPOT.lng)
}

// ============================================================================
// Tanjung Priok / Koja
// ============================================================================

pub const PRIOK: &[Location] = &[
    Location::new("Pasar Koja Baru", -6.1172, 106.9058),
    Location::new("Terminal Tanjung Priok", -6.1095, 106.8824),
    Location::new("Stasiun Tanjung Priok", -6.1106, 106.8813),
    Location::new("Pasar Ular Plumpang", -6.1294, 106.8967),
    Location::new("RSUD Koja", -6.1138, 106.9027),
    Location::new("Jakarta International Stadium", -6.1246, 106.8583),
];

// ============================================================================
// Kelapa Gading
// ============================================================================

pub const KELAPA_GADING: &[Location] = &[
    Location::new("Mall Kelapa Gading", -6.1576, 106.9087),
    Location::new("La Piazza", -6.1567, 106.9081),
    Location::new("Pasar Gading Permai", -6.1612, 106.9035),
    Location::new("Sunter Mall", -6.1421, 106.8686),
    Location::new("Danau Sunter", -6.1409, 106.8728),
    Location::new("Pegangsaan Dua", -6.1665, 106.9142),
];

// ============================================================================
// Cakung / Cilincing / Marunda
// ============================================================================

pub const EAST: &[Location] = &[
    Location::new("Pasar Cilincing", -6.1028, 106.9421),
    Location::new("Rusun Marunda", -6.1049, 106.9602),
    Location::new("Kawasan Berikat Nusantara", -6.1197, 106.9315),
    Location::new("Pasar Cakung", -6.1846, 106.9476),
    Location::new("Terminal Pulo Gadung", -6.1838, 106.9095),
    Location::new("Pasar Semper", -6.1246, 106.9247),
];

// ============================================================================
// Ancol / Pademangan
// ============================================================================

pub const ANCOL: &[Location] = &[
    Location::new("Pasar Seni Ancol", -6.1232, 106.8331),
    Location::new("Pademangan Timur", -6.1331, 106.8415),
    Location::new("Mangga Dua Square", -6.1297, 106.8314),
    Location::new("ITC Mangga Dua", -6.1368, 106.8261),
    Location::new("Gunung Sahari", -6.1405, 106.8389),
    Location::new("Kemayoran", -6.1580, 106.8467),
];

/// Every fixture location, depot excluded.
pub fn all_locations() -> Vec<Location> {
    PRIOK
        .iter()
        .chain(KELAPA_GADING)
        .chain(EAST)
        .chain(ANCOL)
        .cloned()
        .collect()
}

/// Raw stops for the first `count` locations with cycling demands.
pub fn raw_stops(count: usize, demands: &[i64]) -> Vec<RawStop> {
    all_locations()
        .iter()
        .take(count)
        .enumerate()
        .map(|(i, location)| location.raw_stop(&format!("JKT-{i:03}"), demands[i % demands.len()]))
        .collect()
}
