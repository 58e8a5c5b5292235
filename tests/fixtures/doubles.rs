//! Scripted provider and manual clock for driving the oracle in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::datetime;

use depot_router::haversine::haversine_km;
use depot_router::model::Coordinate;
use depot_router::oracle::{DistanceOracle, OracleConfig};
use depot_router::traits::{Clock, ProviderError, ProviderLeg, ProviderTable, TravelCostProvider};

/// Road distance the scripted provider reports, relative to straight line.
pub const PROVIDER_ROAD_FACTOR: f64 = 1.2;

#[derive(Debug, Clone, PartialEq)]
pub enum Behaviour {
    /// Answer with straight-line distance scaled by [`PROVIDER_ROAD_FACTOR`].
    Answer,
    Fail,
    /// Answer after sleeping.
    Delay(Duration),
    /// Answer tables with one unresolvable cell.
    NullCell(usize, usize),
    /// Answer tables with one row missing.
    ShortTable,
}

#[derive(Debug, Default)]
struct Calls {
    legs: AtomicUsize,
    tables: AtomicUsize,
}

/// Provider double; clones share behaviour and call counters.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    behaviour: Arc<Mutex<Behaviour>>,
    calls: Arc<Calls>,
}

impl ScriptedProvider {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Arc::new(Mutex::new(behaviour)),
            calls: Arc::default(),
        }
    }

    pub fn answering() -> Self {
        Self::new(Behaviour::Answer)
    }

    pub fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn leg_calls(&self) -> usize {
        self.calls.legs.load(Ordering::SeqCst)
    }

    pub fn table_calls(&self) -> usize {
        self.calls.tables.load(Ordering::SeqCst)
    }

    fn behaviour(&self) -> Behaviour {
        self.behaviour.lock().unwrap().clone()
    }

    pub fn expected(from: Coordinate, to: Coordinate) -> ProviderLeg {
        let meters = haversine_km(from, to) * PROVIDER_ROAD_FACTOR * 1000.0;
        ProviderLeg {
            distance_meters: meters,
            duration_seconds: meters / 1000.0 * 120.0,
        }
    }
}

impl TravelCostProvider for ScriptedProvider {
    fn leg(&self, from: Coordinate, to: Coordinate, _: Duration) -> Result<ProviderLeg, ProviderError> {
        self.calls.legs.fetch_add(1, Ordering::SeqCst);
        match self.behaviour() {
            Behaviour::Fail => Err(ProviderError::Status {
                url: "scripted://route".to_string(),
                status: 503,
            }),
            Behaviour::Delay(delay) => {
                std::thread::sleep(delay);
                Ok(Self::expected(from, to))
            }
            _ => Ok(Self::expected(from, to)),
        }
    }

    fn table(&self, points: &[Coordinate], _: Duration) -> Result<ProviderTable, ProviderError> {
        self.calls.tables.fetch_add(1, Ordering::SeqCst);
        let full = || -> ProviderTable {
            points
                .iter()
                .map(|from| points.iter().map(|to| Some(Self::expected(*from, *to))).collect())
                .collect()
        };
        match self.behaviour() {
            Behaviour::Fail => Err(ProviderError::Status {
                url: "scripted://table".to_string(),
                status: 503,
            }),
            Behaviour::Delay(delay) => {
                std::thread::sleep(delay);
                Ok(full())
            }
            Behaviour::NullCell(i, j) => {
                let mut table = full();
                table[i][j] = None;
                Ok(table)
            }
            Behaviour::ShortTable => {
                let mut table = full();
                table.pop();
                Ok(table)
            }
            Behaviour::Answer => Ok(full()),
        }
    }
}

/// Clock that only moves when told to; clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<OffsetDateTime>>);

impl ManualClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn advance(&self, by: time::Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(datetime!(2026-10-19 08:00 UTC))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

pub type TestOracle = DistanceOracle<ScriptedProvider, ManualClock>;

/// Oracle over `provider` with a manual clock; returns the clock for steering.
pub fn oracle(provider: &ScriptedProvider, config: OracleConfig) -> (TestOracle, ManualClock) {
    let clock = ManualClock::default();
    let oracle = DistanceOracle::with_clock(Some(provider.clone()), clock.clone(), config);
    (oracle, clock)
}
