//! Normalisation of raw stop records.
//!
//! Records that cannot be routed are discarded with a reason; nothing here is
//! fatal.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{Coordinate, RawStop, Stop, UnassignedReason};

/// A stop that did not make it into any batch, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedStop {
    /// Record identifier, or `#<position>` when the record had none.
    pub stop_id: String,
    pub reason: UnassignedReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub stops: Vec<Stop>,
    pub discarded: Vec<UnassignedStop>,
}

pub fn validate_stops(raw: &[RawStop]) -> Validated {
    let mut validated = Validated::default();
    // Explicit ids are claimed up front so a generated default never takes
    // one that a later record asks for.
    let reserved: HashSet<&str> = raw.iter().filter_map(explicit_id).collect();
    let mut seen = HashSet::new();

    for (position, record) in raw.iter().enumerate() {
        let result = check(record).and_then(|(location, demand)| {
            let id = match explicit_id(record) {
                Some(id) => id.to_string(),
                None => default_id(validated.stops.len(), &reserved, &seen),
            };
            if seen.insert(id.clone()) {
                Ok(Stop {
                    name: record.name.clone().unwrap_or_else(|| "unknown".to_string()),
                    id,
                    location,
                    demand,
                    metadata: record.metadata.clone(),
                })
            } else {
                Err(UnassignedReason::DuplicateId)
            }
        });

        match result {
            Ok(stop) => validated.stops.push(stop),
            Err(reason) => {
                let stop_id = explicit_id(record)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{position}"));
                warn!(stop_id = %stop_id, %reason, "discarding stop");
                validated.discarded.push(UnassignedStop { stop_id, reason });
            }
        }
    }

    info!(
        accepted = validated.stops.len(),
        discarded = validated.discarded.len(),
        "stop validation complete"
    );
    validated
}

fn explicit_id(record: &RawStop) -> Option<&str> {
    record.id.as_deref().filter(|id| !id.trim().is_empty())
}

/// `stop_<n>` for the first free `n` at or after `accepted`.
fn default_id(accepted: usize, reserved: &HashSet<&str>, seen: &HashSet<String>) -> String {
    (accepted..)
        .map(|n| format!("stop_{n}"))
        .find(|id| !reserved.contains(id.as_str()) && !seen.contains(id))
        .unwrap_or_default()
}

fn check(record: &RawStop) -> Result<(Coordinate, u32), UnassignedReason> {
    let (Some(lat), Some(lng)) = (record.latitude, record.longitude) else {
        return Err(UnassignedReason::MissingCoordinates);
    };
    let location = Coordinate::new(lat, lng);
    if !location.in_range() {
        return Err(UnassignedReason::CoordinatesOutOfRange { lat, lng });
    }
    if lat == 0.0 || lng == 0.0 {
        return Err(UnassignedReason::ZeroCoordinate);
    }

    let demand = record.demand.ok_or(UnassignedReason::MissingDemand)?;
    if demand <= 0 {
        return Err(UnassignedReason::NonPositiveDemand { demand });
    }
    let demand = u32::try_from(demand).map_err(|_| UnassignedReason::DemandOutOfRange { demand })?;
    Ok((location, demand))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn raw(id: &str, lat: Option<f64>, lng: Option<f64>, demand: Option<i64>) -> RawStop {
        RawStop {
            id: Some(id.to_string()),
            name: Some(format!("Toko {id}")),
            latitude: lat,
            longitude: lng,
            demand,
            ..RawStop::default()
        }
    }

    #[rstest]
    #[case(raw("a", None, Some(106.9), Some(5)), UnassignedReason::MissingCoordinates)]
    #[case(raw("b", Some(0.0), Some(106.9), Some(5)), UnassignedReason::ZeroCoordinate)]
    #[case(
        raw("c", Some(91.0), Some(106.9), Some(5)),
        UnassignedReason::CoordinatesOutOfRange { lat: 91.0, lng: 106.9 }
    )]
    #[case(raw("d", Some(-6.1), Some(106.9), None), UnassignedReason::MissingDemand)]
    #[case(
        raw("e", Some(-6.1), Some(106.9), Some(0)),
        UnassignedReason::NonPositiveDemand { demand: 0 }
    )]
    #[case(
        raw("f", Some(-6.1), Some(106.9), Some(5_000_000_000)),
        UnassignedReason::DemandOutOfRange { demand: 5_000_000_000 }
    )]
    fn invalid_records_are_discarded(#[case] record: RawStop, #[case] reason: UnassignedReason) {
        let validated = validate_stops(&[record.clone()]);
        assert!(validated.stops.is_empty());
        assert_eq!(
            validated.discarded,
            vec![UnassignedStop {
                stop_id: record.id.unwrap_or_default(),
                reason
            }]
        );
    }

    #[test]
    fn nan_coordinate_is_out_of_range() {
        let validated = validate_stops(&[raw("n", Some(f64::NAN), Some(106.9), Some(5))]);
        assert!(matches!(
            validated.discarded[0].reason,
            UnassignedReason::CoordinatesOutOfRange { .. }
        ));
    }

    #[test]
    fn defaults_fill_missing_id_and_name() {
        let record = RawStop {
            latitude: Some(-6.1),
            longitude: Some(106.9),
            demand: Some(4),
            ..RawStop::default()
        };
        let validated = validate_stops(&[raw("x", Some(-6.2), Some(106.8), Some(3)), record]);
        assert_eq!(validated.stops[1].id, "stop_1");
        assert_eq!(validated.stops[1].name, "unknown");
        assert_eq!(validated.stops[1].demand, 4);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let validated = validate_stops(&[
            raw("dup", Some(-6.1), Some(106.9), Some(5)),
            raw("dup", Some(-6.2), Some(106.8), Some(7)),
        ]);
        assert_eq!(validated.stops.len(), 1);
        assert_eq!(validated.stops[0].demand, 5);
        assert_eq!(validated.discarded[0].reason, UnassignedReason::DuplicateId);
    }

    #[test]
    fn metadata_is_carried_through() {
        let mut record = raw("m", Some(-6.1), Some(106.9), Some(2));
        record.metadata.insert("phone".to_string(), "0812".to_string());
        let validated = validate_stops(&[record]);
        assert_eq!(validated.stops[0].metadata.get("phone").map(String::as_str), Some("0812"));
    }

    #[test]
    fn default_id_skips_explicit_ids_claimed_later() {
        let unnamed = RawStop {
            latitude: Some(-6.1),
            longitude: Some(106.9),
            demand: Some(4),
            ..RawStop::default()
        };
        let validated = validate_stops(&[unnamed, raw("stop_0", Some(-6.2), Some(106.8), Some(3))]);
        let ids: Vec<&str> = validated.stops.iter().map(|stop| stop.id.as_str()).collect();
        assert_eq!(ids, vec!["stop_1", "stop_0"]);
        assert!(validated.discarded.is_empty());
    }

    #[test]
    fn blank_id_is_reported_by_position() {
        let validated = validate_stops(&[
            raw("a", Some(-6.1), Some(106.9), Some(5)),
            raw("   ", Some(-6.2), Some(106.8), None),
        ]);
        assert_eq!(validated.discarded[0].stop_id, "#1");
        assert_eq!(validated.discarded[0].reason, UnassignedReason::MissingDemand);
    }
}
