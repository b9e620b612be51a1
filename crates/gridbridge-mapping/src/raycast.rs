//! Integer line tracing between grid cells.
//!
//! ```text
//! (0,0) → (6,2):
//!
//!     2 │             ●
//!     1 │       ● ● ●
//!     0 │ ● ● ●
//!       └──────────────
//!         0 1 2 3 4 5 6
//! ```

/// Cell index on a grid; may lie outside the grid while tracing.
pub type CellIndex = (i32, i32);

/// Bresenham iterator yielding every cell from `start` to `end`, both
/// inclusive, in travel order.
pub struct Bresenham {
    x: i32,
    y: i32,
    end: CellIndex,
    dx: i32,
    dy: i32,
    step_x: i32,
    step_y: i32,
    error: i32,
    done: bool,
}

impl Bresenham {
    pub fn new(start: CellIndex, end: CellIndex) -> Self {
        let dx = (end.0 - start.0).abs();
        let dy = -(end.1 - start.1).abs();
        Self {
            x: start.0,
            y: start.1,
            end,
            dx,
            dy,
            step_x: if start.0 < end.0 { 1 } else { -1 },
            step_y: if start.1 < end.1 { 1 } else { -1 },
            error: dx + dy,
            done: false,
        }
    }
}

impl Iterator for Bresenham {
    type Item = CellIndex;

    fn next(&mut self) -> Option<CellIndex> {
        if self.done {
            return None;
        }
        let current = (self.x, self.y);
        if current == self.end {
            self.done = true;
            return Some(current);
        }
        let doubled = 2 * self.error;
        if doubled >= self.dy {
            self.error += self.dy;
            self.x += self.step_x;
        }
        if doubled <= self.dx {
            self.error += self.dx;
            self.y += self.step_y;
        }
        Some(current)
    }
}
