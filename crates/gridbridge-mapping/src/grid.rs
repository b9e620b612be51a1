//! Log-odds occupancy grid for a single resolution level.
//!
//! ## Log-odds model
//!
//! ```text
//! L(p)  = ln(p / (1 - p))          update factor → log-odds increment
//! L_new = L_old + L_observation
//! P(L)  = e^L / (e^L + 1)
//!
//!   L > 0 → occupied
//!   L < 0 → free
//!   L = 0 → unknown (never observed, or observations cancelled out)
//! ```
//!
//! ## Coordinates
//!
//! Map coordinates are continuous cell units: cell `(i, j)` covers
//! `[i, i + 1) × [j, j + 1)`.  The world position of map coordinate `(0, 0)`
//! is `-size · cell_length · start`, so with `start = (0.5, 0.5)` the world
//! origin sits in the middle of the grid.
//!
//! Within one [`OccupancyGridMap::update_by_scan`] every cell is touched at
//! most once, and a ray endpoint overrides a free mark left earlier in the
//! same scan.

use gridbridge_types::{BridgeError, Point2, PointSet, Pose2D};

use crate::raycast::{Bresenham, CellIndex};

/// Occupied cells stop accumulating evidence beyond this log-odds value.
const LOG_ODDS_OCCUPIED_CAP: f32 = 50.0;

/// Convert a probability in `(0, 1)` to log-odds.
pub fn probability_to_log_odds(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

/// Tri-state classification of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Free,
    Occupied,
    Unknown,
}

/// Log-odds increments applied for a free-space pass and a ray endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogOddsParams {
    pub free: f32,
    pub occupied: f32,
}

impl LogOddsParams {
    /// Build increments from update factors (probabilities).
    ///
    /// `free_factor` must be below 0.5 and `occupied_factor` above it, both
    /// strictly inside `(0, 1)`.
    pub fn from_factors(free_factor: f32, occupied_factor: f32) -> Result<Self, BridgeError> {
        if !(free_factor > 0.0 && free_factor < 0.5) {
            return Err(BridgeError::InvalidConfig(format!(
                "update_factor_free must lie in (0, 0.5), got {free_factor}"
            )));
        }
        if !(occupied_factor > 0.5 && occupied_factor < 1.0) {
            return Err(BridgeError::InvalidConfig(format!(
                "update_factor_occupied must lie in (0.5, 1), got {occupied_factor}"
            )));
        }
        Ok(Self {
            free: probability_to_log_odds(free_factor),
            occupied: probability_to_log_odds(occupied_factor),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    log_odds: f32,
    /// Scan marker of the last update that touched this cell.
    marker: u32,
}

/// One resolution level of the occupancy map.
#[derive(Debug, Clone)]
pub struct OccupancyGridMap {
    cells: Vec<Cell>,
    width: usize,
    height: usize,
    cell_length: f32,
    world_offset: Point2,
    params: LogOddsParams,
    scan_marker: u32,
}

impl OccupancyGridMap {
    /// `start` is the fraction of the grid extent that lies on the negative
    /// side of the world origin along each axis.
    pub fn new(
        width: usize,
        height: usize,
        cell_length: f32,
        start: Point2,
        params: LogOddsParams,
    ) -> Self {
        let world_offset = Point2::new(
            -(width as f32) * cell_length * start.x,
            -(height as f32) * cell_length * start.y,
        );
        Self {
            cells: vec![Cell::default(); width * height],
            width,
            height,
            cell_length,
            world_offset,
            params,
            scan_marker: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Metres per cell.
    pub fn cell_length(&self) -> f32 {
        self.cell_length
    }

    /// Cells per metre.
    pub fn scale_to_map(&self) -> f32 {
        1.0 / self.cell_length
    }

    /// World position of map coordinate `(0, 0)`.
    pub fn world_offset(&self) -> Point2 {
        self.world_offset
    }

    /// Origin advertised in map metadata: the world offset shifted back by
    /// half a cell, identity orientation.
    pub fn published_origin(&self) -> Pose2D {
        let half = self.cell_length * 0.5;
        Pose2D::new(self.world_offset.x - half, self.world_offset.y - half, 0.0)
    }

    pub fn world_to_map(&self, world: Point2) -> Point2 {
        let scale = self.scale_to_map();
        Point2::new(
            (world.x - self.world_offset.x) * scale,
            (world.y - self.world_offset.y) * scale,
        )
    }

    pub fn map_to_world(&self, map: Point2) -> Point2 {
        Point2::new(
            map.x * self.cell_length + self.world_offset.x,
            map.y * self.cell_length + self.world_offset.y,
        )
    }

    pub fn world_pose_to_map(&self, pose: Pose2D) -> Pose2D {
        let p = self.world_to_map(Point2::new(pose.x, pose.y));
        Pose2D::new(p.x, p.y, pose.theta)
    }

    pub fn map_pose_to_world(&self, pose: Pose2D) -> Pose2D {
        let p = self.map_to_world(Point2::new(pose.x, pose.y));
        Pose2D::new(p.x, p.y, pose.theta)
    }

    /// Total number of cells (`width · height`).
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Log-odds of cell `(x, y)`, `None` outside the grid.
    pub fn log_odds(&self, x: i32, y: i32) -> Option<f32> {
        self.index(x, y).map(|i| self.cells[i].log_odds)
    }

    /// Occupancy probability of the cell at row-major `index`.
    pub fn probability(&self, index: usize) -> f32 {
        let odds = self.cells[index].log_odds.exp();
        odds / (odds + 1.0)
    }

    pub fn is_free(&self, x: i32, y: i32) -> bool {
        self.log_odds(x, y).is_some_and(|l| l < 0.0)
    }

    pub fn is_occupied(&self, x: i32, y: i32) -> bool {
        self.log_odds(x, y).is_some_and(|l| l > 0.0)
    }

    /// State of the cell at row-major `index` (`y · width + x`).
    pub fn state_at(&self, index: usize) -> CellState {
        let l = self.cells[index].log_odds;
        if l > 0.0 {
            CellState::Occupied
        } else if l < 0.0 {
            CellState::Free
        } else {
            CellState::Unknown
        }
    }

    /// State of cell `(x, y)`; anything outside the grid is unknown.
    pub fn cell_state(&self, x: i32, y: i32) -> CellState {
        self.index(x, y)
            .map_or(CellState::Unknown, |i| self.state_at(i))
    }

    /// Apply one free-space observation to `(x, y)`. Out-of-range is a no-op.
    pub fn mark_free(&mut self, x: i32, y: i32) {
        if let Some(i) = self.index(x, y) {
            self.cells[i].log_odds += self.params.free;
        }
    }

    /// Apply one endpoint observation to `(x, y)`. Out-of-range is a no-op.
    pub fn mark_occupied(&mut self, x: i32, y: i32) {
        if let Some(i) = self.index(x, y) {
            let cell = &mut self.cells[i];
            if cell.log_odds < LOG_ODDS_OCCUPIED_CAP {
                cell.log_odds += self.params.occupied;
            }
        }
    }

    /// Bilinear occupancy probability at continuous map coordinates together
    /// with its spatial gradient: `[value, d/dx, d/dy]`.
    ///
    /// Returns zeros when the 2×2 neighbourhood is not fully inside the grid.
    pub fn interpolated_value_with_derivatives(&self, coords: Point2) -> [f32; 3] {
        let limit_x = self.width as f32 - 2.0;
        let limit_y = self.height as f32 - 2.0;
        if !(coords.x >= 0.0 && coords.y >= 0.0 && coords.x <= limit_x && coords.y <= limit_y) {
            return [0.0; 3];
        }

        let min_x = coords.x.floor();
        let min_y = coords.y.floor();
        let fx = coords.x - min_x;
        let fy = coords.y - min_y;
        let base = min_y as usize * self.width + min_x as usize;

        let p00 = self.probability(base);
        let p10 = self.probability(base + 1);
        let p01 = self.probability(base + self.width);
        let p11 = self.probability(base + self.width + 1);

        let fx_inv = 1.0 - fx;
        let fy_inv = 1.0 - fy;

        let value = fy_inv * (p00 * fx_inv + p10 * fx) + fy * (p01 * fx_inv + p11 * fx);
        let dx = fy_inv * (p10 - p00) + fy * (p11 - p01);
        let dy = fx_inv * (p01 - p00) + fx * (p11 - p10);
        [value, dx, dy]
    }

    /// Integrate a scan taken at `robot_pose` (world frame).
    ///
    /// `points` are in this level's map units relative to the robot.  Each
    /// ray marks the traversed cells free and its end cell occupied; rays
    /// starting or ending outside the grid are skipped.
    pub fn update_by_scan(&mut self, points: &PointSet, robot_pose: Pose2D) {
        self.scan_marker = self.scan_marker.wrapping_add(3);
        let free_marker = self.scan_marker.wrapping_add(1);
        let occupied_marker = self.scan_marker.wrapping_add(2);

        let map_pose = self.world_pose_to_map(robot_pose);
        let (sin, cos) = map_pose.theta.sin_cos();
        let to_map = |p: Point2| {
            Point2::new(
                cos * p.x - sin * p.y + map_pose.x,
                sin * p.x + cos * p.y + map_pose.y,
            )
        };

        let begin = round_cell(to_map(points.origin()));
        for &point in points.points() {
            let end = round_cell(to_map(point));
            if begin != end {
                self.trace_ray(begin, end, free_marker, occupied_marker);
            }
        }
    }

    fn trace_ray(&mut self, begin: CellIndex, end: CellIndex, free_marker: u32, occupied_marker: u32) {
        if self.index(begin.0, begin.1).is_none() {
            return;
        }
        let Some(end_index) = self.index(end.0, end.1) else {
            return;
        };

        for (x, y) in Bresenham::new(begin, end) {
            if (x, y) == end {
                break;
            }
            if let Some(i) = self.index(x, y) {
                let cell = &mut self.cells[i];
                if cell.marker < free_marker {
                    cell.log_odds += self.params.free;
                    cell.marker = free_marker;
                }
            }
        }

        let cell = &mut self.cells[end_index];
        if cell.marker < occupied_marker {
            if cell.marker == free_marker {
                cell.log_odds -= self.params.free;
            }
            if cell.log_odds < LOG_ODDS_OCCUPIED_CAP {
                cell.log_odds += self.params.occupied;
            }
            cell.marker = occupied_marker;
        }
    }
}

fn round_cell(p: Point2) -> CellIndex {
    ((p.x + 0.5).floor() as i32, (p.y + 0.5).floor() as i32)
}
