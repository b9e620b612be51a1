//! Shared vocabulary of the gridbridge workspace: geometry, exchange messages,
//! the bus event envelope and the workspace-wide error type.

pub mod geometry;
pub mod msgs;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use geometry::{Covariance3, Point2, Pose2D, Quaternion, Transform3D, Vec3};
pub use msgs::{
    Header, MapMetaData, OccupancyGrid, Odometry, PointSet, PoseWithCovarianceStamped, RangeScan,
    StampedTransform,
};

/// Unified event wrapper for the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Topic name the payload was published under, e.g. `"laser_scan"`.
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh envelope stamped now.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Scan(RangeScan),
    Pose(PoseWithCovarianceStamped),
    Odometry(Odometry),
    /// Occupancy grid for one resolution level.  Shared so that every
    /// subscriber sees the same allocation.
    Map { level: usize, grid: Arc<OccupancyGrid> },
    MapMetadata(MapMetaData),
    Transform(StampedTransform),
}

/// Global error type spanning transform lookups, scan decoding,
/// configuration and transport.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Transform {target} <- {source_frame} not available within {waited_ms} ms")]
    TransformTimeout {
        target: String,
        source_frame: String,
        waited_ms: u64,
    },

    #[error("Transform {target} <- {source_frame} unavailable: {reason}")]
    TransformUnavailable {
        target: String,
        source_frame: String,
        reason: String,
    },

    #[error("Malformed scan: {0}")]
    MalformedScan(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// `true` for lookup failures that callers are expected to tolerate.
    pub fn is_transform_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::TransformTimeout { .. } | BridgeError::TransformUnavailable { .. }
        )
    }
}
