//! Mapping engine contract and the multi-resolution implementation.
//!
//! The engine owns one [`GridLevel`] per resolution.  Level `i` has cells
//! `2^i` times larger than level 0 and `2^i` times fewer per side.  Scan
//! ingestion is the only writer; map publishers hold cloned handles and read
//! concurrently.
//!
//! ```text
//!   ingestion ──update()──► MultiResolutionEngine ──write lock──► GridLevel[i]
//!                                                                   │  version++
//!   publisher ──version()/read()────────────────────────────────────┘
//! ```

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gridbridge_types::{BridgeError, Covariance3, Point2, PointSet, Pose2D, geometry::normalize_angle};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use crate::grid::{LogOddsParams, OccupancyGridMap};
use crate::matcher::{SINGULAR_COVARIANCE, ScanMatcher};

/// Scoped read view of one level; the lock is released when it drops.
pub type GridSnapshot<'a> = RwLockReadGuard<'a, OccupancyGridMap>;

// ────────────────────────────────────────────────────────────────────────────
// Engine contract
// ────────────────────────────────────────────────────────────────────────────

/// A scan-matching occupancy mapper.
pub trait MappingEngine: Send + Sync {
    /// Match `points` (engine units, robot-relative) against the map starting
    /// from `seed`, update the pose estimate, and integrate the scan into the
    /// grids when the pose left the update deadband.
    fn update(&mut self, points: &PointSet, seed: Pose2D);

    fn last_pose(&self) -> Pose2D;

    fn last_covariance(&self) -> Covariance3;

    /// Engine units per metre (reciprocal of the finest cell length).
    fn scale_to_map(&self) -> f32;

    fn map_levels(&self) -> usize;

    /// Shared handle to level `level`; `None` when out of range.
    fn grid_level(&self, level: usize) -> Option<GridLevel>;
}

// ────────────────────────────────────────────────────────────────────────────
// GridLevel
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to one resolution level and its dirty version.
///
/// The version only ever increases and is bumped while the write lock is
/// still held, so a reader that observes version `v` under the read lock sees
/// every mutation up to `v`.
#[derive(Clone, Debug)]
pub struct GridLevel {
    grid: Arc<RwLock<OccupancyGridMap>>,
    version: Arc<AtomicU64>,
}

impl GridLevel {
    pub fn new(grid: OccupancyGridMap) -> Self {
        Self {
            grid: Arc::new(RwLock::new(grid)),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current dirty version, read without taking the lock.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn read(&self) -> GridSnapshot<'_> {
        self.grid.read()
    }

    /// Run `f` under the write lock and bump the version before releasing it.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut OccupancyGridMap) -> R) -> R {
        let mut grid = self.grid.write();
        let out = f(&mut grid);
        self.version.fetch_add(1, Ordering::AcqRel);
        drop(grid);
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Parameters
// ────────────────────────────────────────────────────────────────────────────

/// Construction-time engine parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    /// Finest cell length in metres.
    pub resolution: f32,
    /// Cells per side at the finest level.
    pub size: usize,
    /// Fraction of the extent on the negative side of the world origin.
    pub start: Point2,
    pub levels: usize,
    pub update_factor_free: f32,
    pub update_factor_occupied: f32,
    /// Translation (m) that must be exceeded before the grid is updated again.
    pub min_dist_diff: f32,
    /// Rotation (rad) that must be exceeded before the grid is updated again.
    pub min_angle_diff: f32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            resolution: 0.05,
            size: 1024,
            start: Point2::new(0.5, 0.5),
            levels: 3,
            update_factor_free: 0.4,
            update_factor_occupied: 0.9,
            min_dist_diff: 0.4,
            min_angle_diff: 0.9,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(BridgeError::InvalidConfig(format!(
                "map_resolution must be positive, got {}",
                self.resolution
            )));
        }
        if self.levels == 0 {
            return Err(BridgeError::InvalidConfig(
                "map_multi_res_levels must be at least 1".to_string(),
            ));
        }
        let coarsest = self.size.checked_shr((self.levels - 1) as u32).unwrap_or(0);
        if coarsest < 2 {
            return Err(BridgeError::InvalidConfig(format!(
                "map_size {} too small for {} levels",
                self.size, self.levels
            )));
        }
        for (name, v) in [("map_start_x", self.start.x), ("map_start_y", self.start.y)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {v}"
                )));
            }
        }
        if self.min_dist_diff < 0.0 || self.min_angle_diff < 0.0 {
            return Err(BridgeError::InvalidConfig(
                "map update thresholds must be non-negative".to_string(),
            ));
        }
        LogOddsParams::from_factors(self.update_factor_free, self.update_factor_occupied)?;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MultiResolutionEngine
// ────────────────────────────────────────────────────────────────────────────

/// Grid pyramid with coarse-to-fine scan matching.
pub struct MultiResolutionEngine {
    params: EngineParams,
    levels: Vec<GridLevel>,
    matcher: ScanMatcher,
    last_pose: Pose2D,
    last_covariance: Covariance3,
    /// Pose at the last grid mutation; `None` until the first scan.
    last_map_update_pose: Option<Pose2D>,
}

impl MultiResolutionEngine {
    pub fn new(params: EngineParams) -> Result<Self, BridgeError> {
        params.validate()?;
        let log_odds =
            LogOddsParams::from_factors(params.update_factor_free, params.update_factor_occupied)?;

        let levels = (0..params.levels)
            .map(|i| {
                let factor = 1usize << i;
                let size = params.size / factor;
                let cell_length = params.resolution * factor as f32;
                GridLevel::new(OccupancyGridMap::new(
                    size,
                    size,
                    cell_length,
                    params.start,
                    log_odds,
                ))
            })
            .collect();

        debug!(
            levels = params.levels,
            size = params.size,
            resolution = params.resolution,
            "mapping engine ready"
        );

        Ok(Self {
            params,
            levels,
            matcher: ScanMatcher::default(),
            last_pose: Pose2D::zero(),
            last_covariance: SINGULAR_COVARIANCE,
            last_map_update_pose: None,
        })
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    fn moved_beyond_deadband(&self, pose: Pose2D) -> bool {
        let Some(prev) = self.last_map_update_pose else {
            return true;
        };
        let dist = ((pose.x - prev.x).powi(2) + (pose.y - prev.y).powi(2)).sqrt();
        if dist > self.params.min_dist_diff {
            return true;
        }
        normalize_angle(pose.theta - prev.theta).abs() > self.params.min_angle_diff
    }
}

/// `points` expressed in level `level`'s units.
fn level_points(points: &PointSet, level: usize) -> Cow<'_, PointSet> {
    if level == 0 {
        Cow::Borrowed(points)
    } else {
        Cow::Owned(points.scaled(1.0 / (1u32 << level) as f32))
    }
}

impl MappingEngine for MultiResolutionEngine {
    fn update(&mut self, points: &PointSet, seed: Pose2D) {
        let per_level: Vec<Cow<'_, PointSet>> =
            (0..self.levels.len()).map(|i| level_points(points, i)).collect();

        let (pose, covariance) = {
            let guards: Vec<GridSnapshot<'_>> = self.levels.iter().map(GridLevel::read).collect();
            let pairs: Vec<(&OccupancyGridMap, &PointSet)> = guards
                .iter()
                .zip(&per_level)
                .map(|(g, p)| (&**g, p.as_ref()))
                .collect();
            self.matcher.match_pyramid(&pairs, seed)
        };
        self.last_pose = pose;
        self.last_covariance = covariance;

        if !self.moved_beyond_deadband(pose) {
            trace!(x = pose.x, y = pose.y, theta = pose.theta, "pose within deadband; grid unchanged");
            return;
        }

        for (level, scan) in self.levels.iter().zip(&per_level) {
            level.mutate(|grid| grid.update_by_scan(scan, pose));
        }
        self.last_map_update_pose = Some(pose);
        debug!(x = pose.x, y = pose.y, theta = pose.theta, points = points.len(), "grid updated");
    }

    fn last_pose(&self) -> Pose2D {
        self.last_pose
    }

    fn last_covariance(&self) -> Covariance3 {
        self.last_covariance
    }

    fn scale_to_map(&self) -> f32 {
        1.0 / self.params.resolution
    }

    fn map_levels(&self) -> usize {
        self.levels.len()
    }

    fn grid_level(&self, level: usize) -> Option<GridLevel> {
        self.levels.get(level).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellState;

    fn small_params() -> EngineParams {
        EngineParams {
            size: 64,
            ..EngineParams::default()
        }
    }

    fn engine() -> MultiResolutionEngine {
        MultiResolutionEngine::new(small_params()).unwrap()
    }

    fn versions(e: &MultiResolutionEngine) -> Vec<u64> {
        (0..e.map_levels())
            .map(|i| e.grid_level(i).unwrap().version())
            .collect()
    }

    #[test]
    fn level_geometry_halves_per_level() {
        let e = engine();
        assert_eq!(e.map_levels(), 3);
        assert!((e.scale_to_map() - 20.0).abs() < 1e-4);
        for i in 0..3 {
            let level = e.grid_level(i).unwrap();
            let grid = level.read();
            assert_eq!(grid.width(), 64 >> i);
            assert!((grid.cell_length() - 0.05 * (1 << i) as f32).abs() < 1e-6);
            assert!((grid.world_offset().x + 1.6).abs() < 1e-5);
        }
        assert!(e.grid_level(3).is_none());
    }

    #[test]
    fn first_update_always_mutates() {
        let mut e = engine();
        assert_eq!(versions(&e), vec![0, 0, 0]);
        e.update(&PointSet::new(), Pose2D::zero());
        assert_eq!(versions(&e), vec![1, 1, 1]);
    }

    #[test]
    fn deadband_gates_grid_updates() {
        let mut e = engine();
        let empty = PointSet::new();

        e.update(&empty, Pose2D::zero());
        e.update(&empty, Pose2D::new(0.1, 0.1, 0.2));
        assert_eq!(versions(&e), vec![1, 1, 1]);
        assert_eq!(e.last_pose(), Pose2D::new(0.1, 0.1, 0.2));

        e.update(&empty, Pose2D::new(0.5, 0.0, 0.0));
        assert_eq!(versions(&e), vec![2, 2, 2]);

        e.update(&empty, Pose2D::new(0.5, 0.0, 1.0));
        assert_eq!(versions(&e), vec![3, 3, 3]);
    }

    #[test]
    fn deadband_angle_wraps() {
        let mut e = engine();
        let empty = PointSet::new();
        e.update(&empty, Pose2D::new(0.0, 0.0, 3.1));
        e.update(&empty, Pose2D::new(0.0, 0.0, -3.1));
        assert_eq!(versions(&e), vec![1, 1, 1]);
    }

    #[test]
    fn scan_lands_on_every_level() {
        let mut e = engine();
        let mut points = PointSet::new();
        // 0.5 m ahead in level-0 units.
        points.push(Point2::new(10.0, 0.0));
        e.update(&points, Pose2D::zero());

        let fine = e.grid_level(0).unwrap();
        assert_eq!(fine.read().cell_state(42, 32), CellState::Occupied);
        assert_eq!(fine.read().cell_state(37, 32), CellState::Free);

        let coarse = e.grid_level(1).unwrap();
        assert_eq!(coarse.read().cell_state(21, 16), CellState::Occupied);
    }

    #[test]
    fn blank_map_leaves_seed_and_broad_covariance() {
        let mut e = engine();
        let mut points = PointSet::new();
        points.push(Point2::new(10.0, 0.0));
        let seed = Pose2D::new(0.2, -0.1, 0.3);
        e.update(&points, seed);
        let pose = e.last_pose();
        assert!((pose.x - seed.x).abs() < 1e-5 && (pose.y - seed.y).abs() < 1e-5);
        assert_eq!(e.last_covariance(), SINGULAR_COVARIANCE);
    }

    #[test]
    fn handle_sees_engine_writes() {
        let mut e = engine();
        let handle = e.grid_level(0).unwrap();
        let mut points = PointSet::new();
        points.push(Point2::new(5.0, 0.0));
        e.update(&points, Pose2D::zero());
        assert_eq!(handle.version(), 1);
        assert!(handle.read().is_occupied(37, 32));
    }

    #[test]
    fn mutate_bumps_version_once() {
        let params = LogOddsParams::from_factors(0.4, 0.9).unwrap();
        let level = GridLevel::new(OccupancyGridMap::new(4, 4, 0.05, Point2::zero(), params));
        let clone = level.clone();
        level.mutate(|g| g.mark_occupied(1, 1));
        assert_eq!(clone.version(), 1);
        assert!(clone.read().is_occupied(1, 1));
    }

    #[test]
    fn invalid_params_are_rejected() {
        for params in [
            EngineParams { resolution: 0.0, ..small_params() },
            EngineParams { levels: 0, ..small_params() },
            EngineParams { size: 4, levels: 3, ..small_params() },
            EngineParams { update_factor_free: 0.7, ..small_params() },
            EngineParams { start: Point2::new(1.5, 0.5), ..small_params() },
        ] {
            assert!(
                matches!(MultiResolutionEngine::new(params.clone()), Err(BridgeError::InvalidConfig(_))),
                "accepted {params:?}"
            );
        }
    }
}
