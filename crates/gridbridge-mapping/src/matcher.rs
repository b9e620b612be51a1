//! Gauss–Newton scan-to-map alignment.
//!
//! Minimises `Σ (1 - M(T(ξ)·pᵢ))²` where `M` is the bilinearly interpolated
//! occupancy probability of the map and `T(ξ)` the robot pose in map
//! coordinates.  Each step solves `H·Δξ = g` with
//!
//! ```text
//! J = [∂M/∂x, ∂M/∂y, ∂M/∂x·(-sinθ·px - cosθ·py) + ∂M/∂y·(cosθ·px - sinθ·py)]
//! H = Σ Jᵀ·J        g = Σ Jᵀ·(1 - M)
//! ```
//!
//! The rotation step is clamped to ±0.2 rad.  When `H(0,0)` or `H(1,1)` is
//! zero (no map gradient under any point, e.g. a blank map) the estimate is
//! left where it is.

use gridbridge_types::{Covariance3, Point2, PointSet, Pose2D, geometry::normalize_angle};
use nalgebra::{Matrix3, Vector3};

use crate::grid::OccupancyGridMap;

/// Largest rotation change applied in a single Gauss–Newton step (rad).
const MAX_ROTATION_STEP: f32 = 0.2;

/// Covariance reported when the Hessian cannot be inverted.
pub const SINGULAR_COVARIANCE: Covariance3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Outcome of matching a scan against one level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Pose in world coordinates.
    pub pose: Pose2D,
    /// Hessian of the last iteration, in map-cell units.
    pub hessian: Matrix3<f32>,
}

/// Iteration budget for coarse-to-fine matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatcher {
    pub coarse_iterations: usize,
    pub fine_iterations: usize,
}

impl Default for ScanMatcher {
    fn default() -> Self {
        Self {
            coarse_iterations: 3,
            fine_iterations: 5,
        }
    }
}

impl ScanMatcher {
    /// Align `points` (in `grid`'s map units, robot-relative) against `grid`
    /// starting from `seed` (world frame).  Runs one initial step plus
    /// `iterations` refinements.
    pub fn match_level(
        &self,
        grid: &OccupancyGridMap,
        points: &PointSet,
        seed: Pose2D,
        iterations: usize,
    ) -> MatchResult {
        if points.is_empty() {
            return MatchResult {
                pose: seed,
                hessian: Matrix3::zeros(),
            };
        }

        let start = grid.world_pose_to_map(seed);
        let mut estimate = Vector3::new(start.x, start.y, start.theta);
        let mut hessian = Matrix3::zeros();

        for _ in 0..=iterations {
            let (h, gradient) = hessian_and_gradient(grid, points, &estimate);
            hessian = h;
            if h[(0, 0)] == 0.0 || h[(1, 1)] == 0.0 {
                continue;
            }
            let Some(inverse) = h.try_inverse() else {
                continue;
            };
            let mut step = inverse * gradient;
            step[2] = step[2].clamp(-MAX_ROTATION_STEP, MAX_ROTATION_STEP);
            estimate += step;
        }

        let map_pose = Pose2D::new(estimate[0], estimate[1], normalize_angle(estimate[2]));
        MatchResult {
            pose: grid.map_pose_to_world(map_pose),
            hessian,
        }
    }

    /// Match coarse to fine.  `levels[0]` is the finest grid; each entry pairs
    /// a grid with the scan already scaled into that grid's units.
    ///
    /// The covariance comes from the finest level.
    pub fn match_pyramid(
        &self,
        levels: &[(&OccupancyGridMap, &PointSet)],
        seed: Pose2D,
    ) -> (Pose2D, Covariance3) {
        let mut pose = seed;
        let mut covariance = SINGULAR_COVARIANCE;
        for (index, &(grid, points)) in levels.iter().enumerate().rev() {
            let iterations = if index == 0 {
                self.fine_iterations
            } else {
                self.coarse_iterations
            };
            let result = self.match_level(grid, points, pose, iterations);
            pose = result.pose;
            if index == 0 {
                covariance = covariance_from_hessian(&result.hessian, grid.cell_length());
            }
        }
        (pose, covariance)
    }
}

fn hessian_and_gradient(
    grid: &OccupancyGridMap,
    points: &PointSet,
    estimate: &Vector3<f32>,
) -> (Matrix3<f32>, Vector3<f32>) {
    let (sin, cos) = estimate[2].sin_cos();
    let mut h = Matrix3::zeros();
    let mut g = Vector3::zeros();

    for p in points.points() {
        let world = Point2::new(
            cos * p.x - sin * p.y + estimate[0],
            sin * p.x + cos * p.y + estimate[1],
        );
        let [value, dx, dy] = grid.interpolated_value_with_derivatives(world);
        let residual = 1.0 - value;
        let rot = (-sin * p.x - cos * p.y) * dx + (cos * p.x - sin * p.y) * dy;
        let j = Vector3::new(dx, dy, rot);
        g += j * residual;
        h += j * j.transpose();
    }
    (h, g)
}

/// Inverse Hessian with the translational rows and columns scaled from cells
/// to metres.
pub fn covariance_from_hessian(hessian: &Matrix3<f32>, cell_length: f32) -> Covariance3 {
    if hessian[(0, 0)] == 0.0 || hessian[(1, 1)] == 0.0 {
        return SINGULAR_COVARIANCE;
    }
    let Some(inverse) = hessian.try_inverse() else {
        return SINGULAR_COVARIANCE;
    };
    let scale = Matrix3::from_diagonal(&Vector3::new(cell_length, cell_length, 1.0));
    let metric = scale * inverse * scale;
    let mut out = [[0.0_f32; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = metric[(r, c)];
        }
    }
    out
}
