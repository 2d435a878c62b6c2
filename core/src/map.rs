//! Static occupancy map and the obstacle distance field derived from it.
//!
//! Grids are row-major with row 0 at the lowest `y`. Cell `(col, row)` covers the square
//! `[origin_x + col·res, origin_x + (col+1)·res) × [origin_y + row·res, origin_y + (row+1)·res)`.
use crate::error::MapError;
use crate::sensor::DistanceField;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::fs;
use std::path::{Path, PathBuf};

/// Occupancy state of one grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellState {
    Free,
    Occupied,
    Unknown,
}
impl CellState {
    fn from_char(c: char) -> Option<CellState> {
        match c {
            '.' => Some(CellState::Free),
            '#' => Some(CellState::Occupied),
            '?' => Some(CellState::Unknown),
            _ => None,
        }
    }
    fn to_char(self) -> char {
        match self {
            CellState::Free => '.',
            CellState::Occupied => '#',
            CellState::Unknown => '?',
        }
    }
}

/// A fixed 2D occupancy grid anchored in the map frame.
#[derive(Clone, PartialEq)]
pub struct OccupancyGrid {
    width: usize,
    height: usize,
    resolution: f64,
    origin: (f64, f64),
    cells: Vec<CellState>,
}
impl Debug for OccupancyGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OccupancyGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("resolution", &self.resolution)
            .field("origin", &self.origin)
            .field("occupied_cells", &self.occupied_count())
            .finish()
    }
}
impl OccupancyGrid {
    /// An all-free grid.
    pub fn new(
        width: usize,
        height: usize,
        resolution: f64,
        origin: (f64, f64),
    ) -> Result<Self, MapError> {
        if width == 0 || height == 0 {
            return Err(MapError::Empty);
        }
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(MapError::InvalidResolution(resolution));
        }
        Ok(OccupancyGrid {
            width,
            height,
            resolution,
            origin,
            cells: vec![CellState::Free; width * height],
        })
    }
    /// Parse an ASCII map: `#` occupied, `.` free, `?` unknown. The first non-empty line is the top row.
    ///
    /// # Example
    /// ```rust
    /// use mcl::map::{CellState, OccupancyGrid};
    ///
    /// let grid = OccupancyGrid::from_ascii("###\n#..\n", 0.5, (0.0, 0.0)).unwrap();
    /// assert_eq!(grid.width(), 3);
    /// assert_eq!(grid.get_state(2, 0), Some(CellState::Free));
    /// assert_eq!(grid.get_state(2, 1), Some(CellState::Occupied));
    /// ```
    pub fn from_ascii(text: &str, resolution: f64, origin: (f64, f64)) -> Result<Self, MapError> {
        let mut rows: Vec<Vec<CellState>> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let row = line
                .chars()
                .map(|c| {
                    CellState::from_char(c).ok_or_else(|| MapError::Parse {
                        line: index + 1,
                        reason: format!("unexpected character '{c}'"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(MapError::Parse {
                        line: index + 1,
                        reason: format!("expected {} cells, found {}", first.len(), row.len()),
                    });
                }
            }
            rows.push(row);
        }
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut grid = OccupancyGrid::new(width, height, resolution, origin)?;
        for (i, row) in rows.into_iter().enumerate() {
            let r = height - 1 - i;
            grid.cells[r * width..(r + 1) * width].copy_from_slice(&row);
        }
        Ok(grid)
    }
    /// Render the grid in the format accepted by [`OccupancyGrid::from_ascii`].
    pub fn to_ascii(&self) -> String {
        let mut out = String::with_capacity((self.width + 1) * self.height);
        for row in (0..self.height).rev() {
            out.extend(
                self.cells[row * self.width..(row + 1) * self.width]
                    .iter()
                    .map(|c| c.to_char()),
            );
            out.push('\n');
        }
        out
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn resolution(&self) -> f64 {
        self.resolution
    }
    pub fn origin(&self) -> (f64, f64) {
        self.origin
    }
    pub fn get_state(&self, col: usize, row: usize) -> Option<CellState> {
        (col < self.width && row < self.height).then(|| self.cells[row * self.width + col])
    }
    /// Set a cell's state; out-of-bounds writes are ignored.
    pub fn set_state(&mut self, col: usize, row: usize, state: CellState) {
        if col < self.width && row < self.height {
            self.cells[row * self.width + col] = state;
        }
    }
    /// Cell containing the world point `(x, y)`, if any.
    pub fn world_to_cell(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin.0) / self.resolution).floor();
        let row = ((y - self.origin.1) / self.resolution).floor();
        if col >= 0.0 && row >= 0.0 && col < self.width as f64 && row < self.height as f64 {
            Some((col as usize, row as usize))
        } else {
            None
        }
    }
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin.0 + (col as f64 + 0.5) * self.resolution,
            self.origin.1 + (row as f64 + 0.5) * self.resolution,
        )
    }
    pub fn state_at(&self, x: f64, y: f64) -> Option<CellState> {
        self.world_to_cell(x, y)
            .and_then(|(col, row)| self.get_state(col, row))
    }
    pub fn is_occupied_at(&self, x: f64, y: f64) -> bool {
        self.state_at(x, y) == Some(CellState::Occupied)
    }
    pub fn occupied_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|&&c| c == CellState::Occupied)
            .count()
    }
}

const NEIGHBORS: [(isize, isize, f64); 8] = [
    (-1, 0, 1.0),
    (1, 0, 1.0),
    (0, -1, 1.0),
    (0, 1, 1.0),
    (-1, -1, std::f64::consts::SQRT_2),
    (1, -1, std::f64::consts::SQRT_2),
    (-1, 1, std::f64::consts::SQRT_2),
    (1, 1, std::f64::consts::SQRT_2),
];

/// Precomputed distance, in map units, from every cell to the nearest occupied cell.
#[derive(Clone)]
pub struct DistanceGrid {
    width: usize,
    height: usize,
    resolution: f64,
    origin: (f64, f64),
    distances: Vec<f64>,
}
impl Debug for DistanceGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max = self.distances.iter().copied().fold(0.0, f64::max);
        f.debug_struct("DistanceGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("resolution", &self.resolution)
            .field("max_distance", &max)
            .finish()
    }
}
impl DistanceGrid {
    /// Brushfire from every occupied cell at once over the 8-connected grid.
    ///
    /// Diagonal steps cost `√2` cells, so distances are exact along grid axes and diagonals and slightly
    /// overestimated in between. Free and unknown cells are both part of the mapped region.
    pub fn from_occupancy(grid: &OccupancyGrid) -> Result<Self, MapError> {
        let (width, height) = (grid.width(), grid.height());
        let mut distances = vec![f64::INFINITY; width * height];
        let mut queue: VecDeque<(usize, usize, f64)> = VecDeque::new();
        for row in 0..height {
            for col in 0..width {
                if grid.get_state(col, row) == Some(CellState::Occupied) {
                    distances[row * width + col] = 0.0;
                    queue.push_back((col, row, 0.0));
                }
            }
        }
        if queue.is_empty() {
            return Err(MapError::NoObstacles);
        }
        let resolution = grid.resolution();
        while let Some((col, row, dist)) = queue.pop_front() {
            if dist > distances[row * width + col] {
                continue;
            }
            for &(dc, dr, step) in &NEIGHBORS {
                let (Some(nc), Some(nr)) = (col.checked_add_signed(dc), row.checked_add_signed(dr))
                else {
                    continue;
                };
                if nc >= width || nr >= height {
                    continue;
                }
                let candidate = dist + step * resolution;
                let index = nr * width + nc;
                if candidate < distances[index] {
                    distances[index] = candidate;
                    queue.push_back((nc, nr, candidate));
                }
            }
        }
        Ok(DistanceGrid {
            width,
            height,
            resolution,
            origin: grid.origin(),
            distances,
        })
    }
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }
    pub fn get_distance(&self, col: usize, row: usize) -> Option<f64> {
        (col < self.width && row < self.height).then(|| self.distances[row * self.width + col])
    }
}
impl DistanceField for DistanceGrid {
    fn distance_to_nearest_obstacle(&self, x: f64, y: f64) -> Option<f64> {
        let col = ((x - self.origin.0) / self.resolution).floor();
        let row = ((y - self.origin.1) / self.resolution).floor();
        if col >= 0.0 && row >= 0.0 {
            self.get_distance(col as usize, row as usize)
        } else {
            None
        }
    }
}

/// Source of the static map, queried once at startup.
pub trait MapServer {
    fn request_map(&self) -> Result<OccupancyGrid, MapError>;
}

/// Serves an ASCII map file.
#[derive(Clone, Debug)]
pub struct FileMapServer {
    pub path: PathBuf,
    pub resolution: f64,
    pub origin: (f64, f64),
}
impl FileMapServer {
    pub fn new<P: AsRef<Path>>(path: P, resolution: f64, origin: (f64, f64)) -> Self {
        FileMapServer {
            path: path.as_ref().to_path_buf(),
            resolution,
            origin,
        }
    }
}
impl MapServer for FileMapServer {
    fn request_map(&self) -> Result<OccupancyGrid, MapError> {
        let text = fs::read_to_string(&self.path)?;
        OccupancyGrid::from_ascii(&text, self.resolution, self.origin)
    }
}
