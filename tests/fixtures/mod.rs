//! Test fixtures for depot-router.
//!
//! Provides:
//! - Approximate North/East Jakarta locations and a depot
//! - A scripted travel-cost provider and a manual clock

#![allow(dead_code)]

pub mod doubles;
pub mod jakarta_locations;

pub use doubles::*;
pub use jakarta_locations::*;
