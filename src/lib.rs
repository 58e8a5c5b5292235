//! depot-router core
//!
//! Capacity-constrained daily trip planning from a single depot: a resilient
//! distance oracle, a batch partitioner, and a within-batch route sequencer.

pub mod model;
pub mod traits;
pub mod haversine;
pub mod osrm;
pub mod cache;
pub mod quota;
pub mod oracle;
pub mod sequencer;
pub mod partition;
pub mod validation;
pub mod solver;
