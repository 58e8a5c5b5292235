//! Seams between the routing engine and the outside world.
//!
//! These are intentionally minimal. The travel-cost provider is the only
//! external collaborator the engine talks to; everything that prices an edge
//! during search goes through [`TravelCost`].

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{Coordinate, DistanceEdge};

/// One provider answer, in provider units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderLeg {
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

impl ProviderLeg {
    /// Finite and non-negative in both fields.
    pub fn is_well_formed(&self) -> bool {
        self.distance_meters.is_finite()
            && self.duration_seconds.is_finite()
            && self.distance_meters >= 0.0
            && self.duration_seconds >= 0.0
    }
}

/// Provider rows; `None` marks a cell the provider could not resolve.
pub type ProviderTable = Vec<Vec<Option<ProviderLeg>>>;

/// Failures reported by a travel-cost provider.
///
/// The oracle treats every variant the same way: as one strike against the
/// circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("provider returned {code}: {message}")]
    Service { code: String, message: String },
    #[error("response arrived after the {timeout_ms}ms deadline")]
    DeadlineExceeded { timeout_ms: u128 },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider unavailable")]
    Unavailable,
}

/// External point-to-point travel-cost service.
///
/// Implementations must honour `timeout`; the oracle additionally discards any
/// answer that arrives late.
pub trait TravelCostProvider: Send + Sync {
    /// Distance and duration from `from` to `to`.
    fn leg(
        &self,
        from: Coordinate,
        to: Coordinate,
        timeout: Duration,
    ) -> Result<ProviderLeg, ProviderError>;

    /// Full pairwise table for `points` in one round trip.
    ///
    /// `table[i][j]` is the leg from `points[i]` to `points[j]`.
    fn table(&self, points: &[Coordinate], timeout: Duration)
    -> Result<ProviderTable, ProviderError>;
}

/// Anything that can price a directed edge without failing.
pub trait TravelCost: Sync {
    fn edge(&self, from: Coordinate, to: Coordinate) -> DistanceEdge;
}

impl<T: TravelCost + ?Sized> TravelCost for &T {
    fn edge(&self, from: Coordinate, to: Coordinate) -> DistanceEdge {
        (**self).edge(from, to)
    }
}

/// Wall-clock source for cache expiry and daily quota resets.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leg_well_formedness() {
        let ok = ProviderLeg {
            distance_meters: 1200.0,
            duration_seconds: 300.0,
        };
        assert!(ok.is_well_formed());

        let negative = ProviderLeg {
            distance_meters: -1.0,
            ..ok
        };
        assert!(!negative.is_well_formed());

        let nan = ProviderLeg {
            duration_seconds: f64::NAN,
            ..ok
        };
        assert!(!nan.is_well_formed());
    }

    #[test]
    fn provider_error_messages() {
        let err = ProviderError::Status {
            url: "http://osrm/route".to_string(),
            status: 503,
        };
        assert_eq!(err.to_string(), "request to http://osrm/route failed with status 503");
    }
}
