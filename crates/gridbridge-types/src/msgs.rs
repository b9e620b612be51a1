//! Exchange messages carried on the event bus.
//!
//! These mirror the shape of the usual robotics wire types (laser scan,
//! pose with covariance, odometry, occupancy grid, stamped transform) without
//! tying the workspace to any particular transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::{Covariance3, Point2, Pose2D, Transform3D};

/// Occupancy value for a cell that has never been observed.
pub const CELL_UNKNOWN: i8 = -1;
/// Occupancy value for an observed free cell.
pub const CELL_FREE: i8 = 0;
/// Occupancy value for an observed occupied cell.
pub const CELL_OCCUPIED: i8 = 100;

/// 6×6 covariance over (x, y, z, roll, pitch, yaw).
pub type Covariance6 = [[f64; 6]; 6];

/// Timestamp plus the frame the payload is expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
}

impl Header {
    pub fn new(stamp: DateTime<Utc>, frame_id: impl Into<String>) -> Self {
        Self {
            stamp,
            frame_id: frame_id.into(),
        }
    }
}

/// A single planar range scan as delivered by the sensor driver.
///
/// Sample `i` was taken at bearing `angle_min + i * angle_increment` in the
/// sensor frame named by `header.frame_id`.  Distances are in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeScan {
    pub header: Header,
    pub angle_min: f32,
    pub angle_max: f32,
    pub angle_increment: f32,
    pub range_min: f32,
    pub range_max: f32,
    /// Non-finite readings serialize as `null` in JSON and come back as
    /// `f32::INFINITY`.
    #[serde(deserialize_with = "ranges_with_nulls")]
    pub ranges: Vec<f32>,
}

fn ranges_with_nulls<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<Option<f32>> = Deserialize::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|r| r.unwrap_or(f32::INFINITY)).collect())
}

/// Engine input: scan endpoints in map-cell units around a local origin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointSet {
    points: Vec<Point2>,
    origin: Point2,
}

impl PointSet {
    /// Empty set with its origin at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            origin: Point2::zero(),
        }
    }

    pub fn push(&mut self, point: Point2) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[Point2] {
        &self.points
    }

    pub fn origin(&self) -> Point2 {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Copy with every point (and the origin) multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| Point2::new(p.x * factor, p.y * factor))
                .collect(),
            origin: Point2::new(self.origin.x * factor, self.origin.y * factor),
        }
    }
}

/// Pose estimate with uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseWithCovarianceStamped {
    pub header: Header,
    pub pose: Pose2D,
    pub covariance: Covariance6,
}

impl PoseWithCovarianceStamped {
    /// The planar (x, y, yaw) block of the 6×6 covariance.
    pub fn planar_covariance(&self) -> Covariance3 {
        let idx = [0, 1, 5];
        let mut out = [[0.0_f32; 3]; 3];
        for (r, &i) in idx.iter().enumerate() {
            for (c, &j) in idx.iter().enumerate() {
                out[r][c] = self.covariance[i][j] as f32;
            }
        }
        out
    }
}

/// Pose of `child_frame_id` in `header.frame_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub header: Header,
    pub child_frame_id: String,
    pub pose: Pose2D,
    pub covariance: Covariance6,
}

/// Geometry of a published occupancy grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMetaData {
    pub map_load_time: DateTime<Utc>,
    /// Metres per cell.
    pub resolution: f32,
    pub width: u32,
    pub height: u32,
    /// World pose of the corner of cell (0, 0).
    pub origin: Pose2D,
}

/// Row-major occupancy grid valued in {[`CELL_UNKNOWN`], [`CELL_FREE`],
/// [`CELL_OCCUPIED`]}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyGrid {
    pub header: Header,
    pub info: MapMetaData,
    /// Shared so a restamped copy reuses the cells.
    pub data: Arc<[i8]>,
}

/// Pose of `child_frame_id` expressed in `header.frame_id` at `header.stamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    pub header: Header,
    pub child_frame_id: String,
    pub transform: Transform3D,
}

impl StampedTransform {
    pub fn new(
        stamp: DateTime<Utc>,
        parent_frame: impl Into<String>,
        child_frame: impl Into<String>,
        transform: Transform3D,
    ) -> Self {
        Self {
            header: Header::new(stamp, parent_frame),
            child_frame_id: child_frame.into(),
            transform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_set_starts_at_zero_origin() {
        let mut set = PointSet::new();
        assert!(set.is_empty());
        assert_eq!(set.origin(), Point2::zero());
        set.push(Point2::new(1.0, 2.0));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn point_set_scaled_halves_points() {
        let mut set = PointSet::with_capacity(2);
        set.push(Point2::new(4.0, -2.0));
        set.push(Point2::new(1.0, 1.0));
        let half = set.scaled(0.5);
        assert_eq!(half.points(), &[Point2::new(2.0, -1.0), Point2::new(0.5, 0.5)]);
        assert_eq!(half.origin(), Point2::zero());
    }

    #[test]
    fn planar_covariance_picks_xy_yaw_block() {
        let mut cov = [[0.0; 6]; 6];
        cov[0][0] = 1.0;
        cov[1][1] = 2.0;
        cov[5][5] = 3.0;
        cov[0][5] = 0.5;
        cov[5][0] = 0.5;
        let msg = PoseWithCovarianceStamped {
            header: Header::new(Utc::now(), "map"),
            pose: Pose2D::zero(),
            covariance: cov,
        };
        let planar = msg.planar_covariance();
        assert_eq!(planar[0][0], 1.0);
        assert_eq!(planar[1][1], 2.0);
        assert_eq!(planar[2][2], 3.0);
        assert_eq!(planar[0][2], 0.5);
    }
}
