//! # gridbridge-mapping
//!
//! Multi-resolution occupancy mapping with scan matching.
//!
//! - [`grid`] – log-odds [`OccupancyGridMap`] for one resolution level.
//! - [`raycast`] – Bresenham cell tracing used for free-space updates.
//! - [`matcher`] – Gauss–Newton [`ScanMatcher`] over the interpolated map.
//! - [`engine`] – the [`MappingEngine`] contract, shared [`GridLevel`]
//!   handles and the [`MultiResolutionEngine`] that ties them together.

pub mod engine;
pub mod grid;
pub mod matcher;
pub mod raycast;

pub use engine::{EngineParams, GridLevel, GridSnapshot, MappingEngine, MultiResolutionEngine};
pub use grid::{CellState, LogOddsParams, OccupancyGridMap};
pub use matcher::ScanMatcher;
