//! # gridbridge-perception
//!
//! Sensor-side plumbing for the mapping bridge:
//!
//! - [`scan`] – range scan to engine point-set conversion.
//! - [`transform`] – time-indexed frame graph with bounded-wait lookups.

pub mod scan;
pub mod transform;

pub use scan::{MAX_RANGE_MARGIN, scan_to_points};
pub use transform::{TfBuffer, TransformResolver};
