//! Recorded scan data, synthetic scenarios, and localization results.
//!
//! This module provides:
//! - `ScanRecord` for reading and writing recorded scans with their odometry to/from CSV files
//! - Ray-cast scan synthesis against an [`OccupancyGrid`] and generation of complete synthetic runs
//! - `LocalizationResult` for storing and exporting the localizer's output over a run
use crate::Pose2D;
use crate::error::{LocalizationError, MapError};
use crate::map::{CellState, OccupancyGrid};
use crate::sensor::{LaserScan, NO_RETURN, SCAN_BEAMS};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io;
use std::path::Path;

/// Semicolon-separated list of ranges, so a full scan fits in one CSV column.
mod range_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ranges: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let joined = ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";");
        serializer.serialize_str(&joined)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        s.split(';')
            .map(|v| v.trim().parse::<f64>().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// One recorded scan together with the robot's odometry pose at the scan time.
///
/// Ranges hold one reading per degree; `0` marks a beam with no return. The ground-truth columns are only
/// present in synthetic data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub time: DateTime<Utc>,
    pub odom_x: f64,
    pub odom_y: f64,
    pub odom_theta: f64,
    #[serde(default)]
    pub truth_x: Option<f64>,
    #[serde(default)]
    pub truth_y: Option<f64>,
    #[serde(default)]
    pub truth_theta: Option<f64>,
    #[serde(with = "range_list")]
    pub ranges: Vec<f64>,
}
impl ScanRecord {
    pub fn odometry(&self) -> Pose2D {
        Pose2D::new(self.odom_x, self.odom_y, self.odom_theta)
    }
    pub fn truth(&self) -> Option<Pose2D> {
        match (self.truth_x, self.truth_y, self.truth_theta) {
            (Some(x), Some(y), Some(theta)) => Some(Pose2D::new(x, y, theta)),
            _ => None,
        }
    }
    pub fn to_scan(&self, frame_id: &str) -> LaserScan {
        LaserScan::new(self.time, frame_id, self.ranges.clone())
    }
    /// Reads a CSV file and returns a vector of `ScanRecord` structs.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes a slice of `ScanRecord` structs to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Cast one beam per degree from `pose` and report the distance to the first occupied cell.
///
/// Beams that leave the map or travel further than `max_range` report [`NO_RETURN`].
pub fn simulate_scan(grid: &OccupancyGrid, pose: &Pose2D, max_range: f64) -> Vec<f64> {
    let step = grid.resolution() / 4.0;
    (0..SCAN_BEAMS)
        .map(|bearing| {
            let angle = pose.theta + (bearing as f64).to_radians();
            let (sin, cos) = angle.sin_cos();
            let mut range = step;
            while range <= max_range {
                match grid.state_at(pose.x + range * cos, pose.y + range * sin) {
                    Some(CellState::Occupied) => return range,
                    None => return NO_RETURN,
                    Some(_) => range += step,
                }
            }
            NO_RETURN
        })
        .collect()
}

/// Gaussian odometry error added to every step of a synthetic run, in the robot frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OdometryNoise {
    pub translation_std: f64,
    pub rotation_std: f64,
}
impl Default for OdometryNoise {
    fn default() -> Self {
        OdometryNoise {
            translation_std: 0.01,
            rotation_std: 0.005,
        }
    }
}

/// Timing and sensing parameters of a synthetic run.
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub start_time: DateTime<Utc>,
    pub interval_s: f64,
    pub max_range: f64,
    pub odometry_noise: OdometryNoise,
}

/// Build recorded scans for a robot following `trajectory` (ground truth in the map frame).
///
/// Odometry starts at the origin of its own frame and integrates each true relative motion with Gaussian
/// error, so it drifts away from the truth over the run. Scans are cast from the true poses.
pub fn generate_scenario<R: Rng>(
    grid: &OccupancyGrid,
    trajectory: &[Pose2D],
    config: &ScenarioConfig,
    rng: &mut R,
) -> Result<Vec<ScanRecord>, LocalizationError> {
    let noise = &config.odometry_noise;
    let invalid = |e: rand_distr::NormalError| {
        LocalizationError::InvalidConfig(format!("odometry noise {noise:?}: {e}"))
    };
    let translation = Normal::new(0.0, noise.translation_std).map_err(invalid)?;
    let rotation = Normal::new(0.0, noise.rotation_std).map_err(invalid)?;
    let step_ms = (config.interval_s * 1000.0).round() as i64;

    let mut records = Vec::with_capacity(trajectory.len());
    let mut odometry = Pose2D::identity();
    for (k, truth) in trajectory.iter().enumerate() {
        if k > 0 {
            let relative = trajectory[k - 1].inverse().compose(truth);
            let noisy = Pose2D::new(
                relative.x + translation.sample(rng),
                relative.y + translation.sample(rng),
                relative.theta + rotation.sample(rng),
            );
            odometry = odometry.compose(&noisy);
        }
        records.push(ScanRecord {
            time: config.start_time + Duration::milliseconds(step_ms * k as i64),
            odom_x: odometry.x,
            odom_y: odometry.y,
            odom_theta: odometry.theta,
            truth_x: Some(truth.x),
            truth_y: Some(truth.y),
            truth_theta: Some(truth.theta),
            ranges: simulate_scan(grid, truth, config.max_range),
        });
    }
    Ok(records)
}

/// A 10 m × 8 m walled room at 0.1 m resolution with two interior obstacles that break its symmetry.
///
/// The room spans `[0, 10] × [0, 8]` in the map frame and is surrounded by a 1 m band of unknown cells, so
/// scan endpoints projected slightly past a wall still land inside the map.
pub fn demo_room() -> Result<OccupancyGrid, MapError> {
    const MARGIN: usize = 10;
    let (room_width, room_height) = (100, 80);
    let (width, height) = (room_width + 2 * MARGIN, room_height + 2 * MARGIN);
    let mut grid = OccupancyGrid::new(width, height, 0.1, (-1.0, -1.0))?;
    for row in 0..height {
        for col in 0..width {
            let inside = (MARGIN..MARGIN + room_width).contains(&col)
                && (MARGIN..MARGIN + room_height).contains(&row);
            if !inside {
                grid.set_state(col, row, CellState::Unknown);
            }
        }
    }
    let mut occupy = |cols: std::ops::Range<usize>, rows: std::ops::Range<usize>| {
        for col in cols {
            for row in rows.clone() {
                grid.set_state(col + MARGIN, row + MARGIN, CellState::Occupied);
            }
        }
    };
    occupy(0..room_width, 0..1);
    occupy(0..room_width, room_height - 1..room_height);
    occupy(0..1, 0..room_height);
    occupy(room_width - 1..room_width, 0..room_height);
    occupy(45..55, 35..45);
    occupy(12..15, 68..71);
    Ok(grid)
}

/// `steps` poses evenly spaced around an ellipse inside [`demo_room`], heading along the path.
pub fn demo_trajectory(steps: usize) -> Vec<Pose2D> {
    (0..steps)
        .map(|k| {
            let phi = 2.0 * PI * k as f64 / steps as f64;
            Pose2D::new(
                5.0 + 3.0 * phi.cos(),
                4.0 + 2.0 * phi.sin(),
                (2.0 * phi.cos()).atan2(-3.0 * phi.sin()),
            )
        })
        .collect()
}

/// The localizer's view of the robot pose after one handled scan.
///
/// The pose is the current correction composed with the scan's odometry, i.e. what a consumer of the
/// broadcast transform would see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationResult {
    pub time: DateTime<Utc>,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub effective_sample_size: f64,
    pub updated: bool,
}
impl LocalizationResult {
    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.theta)
    }
    pub fn to_csv<P: AsRef<Path>>(results: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for result in results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut results = Vec::new();
        for result in rdr.deserialize() {
            results.push(result?);
        }
        Ok(results)
    }
}

/// Position error against ground truth for every result whose time matches a record with truth.
pub fn position_errors(results: &[LocalizationResult], records: &[ScanRecord]) -> Vec<f64> {
    results
        .iter()
        .filter_map(|result| {
            let truth = records.iter().find(|r| r.time == result.time)?.truth()?;
            Some((result.x - truth.x).hypot(result.y - truth.y))
        })
        .collect()
}

/// Summary statistics of a series of position errors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorSummary {
    pub mean: f64,
    pub max: f64,
    pub last: f64,
}
impl ErrorSummary {
    pub fn from_errors(errors: &[f64]) -> Option<ErrorSummary> {
        let last = *errors.last()?;
        Some(ErrorSummary {
            mean: errors.iter().sum::<f64>() / errors.len() as f64,
            max: errors.iter().copied().fold(0.0, f64::max),
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }
    fn quiet_scenario() -> ScenarioConfig {
        ScenarioConfig {
            start_time: start(),
            interval_s: 0.2,
            max_range: 12.0,
            odometry_noise: OdometryNoise {
                translation_std: 0.0,
                rotation_std: 0.0,
            },
        }
    }

    #[test]
    fn test_simulated_scan_in_room() {
        let grid = demo_room().unwrap();
        let pose = Pose2D::new(2.0, 2.0, 0.0);
        let ranges = simulate_scan(&grid, &pose, 20.0);
        assert_eq!(ranges.len(), SCAN_BEAMS);
        // west wall occupies x in [0, 0.1), south wall y in [0, 0.1)
        assert_approx_eq!(ranges[180], 1.9, 0.03);
        assert_approx_eq!(ranges[270], 1.9, 0.03);
        // east ray hits the wall cells starting at x = 9.9
        assert_approx_eq!(ranges[0], 7.9, 0.03);
        assert!(ranges.iter().all(|&r| r > 0.0));
    }
    #[test]
    fn test_simulated_scan_max_range() {
        let grid = demo_room().unwrap();
        let ranges = simulate_scan(&grid, &Pose2D::new(2.0, 2.0, 0.0), 3.0);
        assert_eq!(ranges[0], NO_RETURN);
        assert!(ranges[180] > 0.0);
    }
    #[test]
    fn test_demo_trajectory_stays_clear_of_obstacles() {
        let grid = demo_room().unwrap();
        for pose in demo_trajectory(100) {
            assert_eq!(grid.state_at(pose.x, pose.y), Some(CellState::Free));
        }
    }
    #[test]
    fn test_noiseless_scenario_odometry_tracks_truth() {
        let grid = demo_room().unwrap();
        let trajectory = demo_trajectory(20);
        let mut rng = StdRng::seed_from_u64(0);
        let records = generate_scenario(&grid, &trajectory, &quiet_scenario(), &mut rng).unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(records[0].odometry(), Pose2D::identity());
        assert_eq!(records[3].time, start() + Duration::milliseconds(600));
        let odom_to_map = trajectory[0];
        for (record, truth) in records.iter().zip(trajectory.iter()) {
            let predicted = odom_to_map.compose(&record.odometry());
            assert_approx_eq!(predicted.x, truth.x, 1e-9);
            assert_approx_eq!(predicted.y, truth.y, 1e-9);
            assert_eq!(record.truth(), Some(*truth));
        }
    }
    #[test]
    fn test_noisy_scenario_drifts() {
        let grid = demo_room().unwrap();
        let trajectory = demo_trajectory(50);
        let mut rng = StdRng::seed_from_u64(5);
        let config = ScenarioConfig {
            odometry_noise: OdometryNoise {
                translation_std: 0.05,
                rotation_std: 0.02,
            },
            ..quiet_scenario()
        };
        let records = generate_scenario(&grid, &trajectory, &config, &mut rng).unwrap();
        let last = records.last().unwrap();
        let predicted = trajectory[0].compose(&last.odometry());
        let truth = last.truth().unwrap();
        assert!((predicted.x - truth.x).hypot(predicted.y - truth.y) > 1e-3);
    }
    #[test]
    fn test_negative_noise_is_rejected() {
        let grid = demo_room().unwrap();
        let config = ScenarioConfig {
            odometry_noise: OdometryNoise {
                translation_std: -1.0,
                rotation_std: 0.0,
            },
            ..quiet_scenario()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(generate_scenario(&grid, &demo_trajectory(3), &config, &mut rng).is_err());
    }
    #[test]
    fn test_scan_record_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scans.csv");
        let grid = demo_room().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let records = generate_scenario(&grid, &demo_trajectory(5), &quiet_scenario(), &mut rng).unwrap();
        ScanRecord::to_csv(&records, &path).unwrap();
        let loaded = ScanRecord::from_csv(&path).unwrap();
        assert_eq!(loaded, records);
        assert_eq!(loaded[2].to_scan("laser").ranges.len(), SCAN_BEAMS);
    }
    #[test]
    fn test_scan_record_without_truth_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recorded.csv");
        std::fs::write(
            &path,
            "time,odom_x,odom_y,odom_theta,ranges\n2024-05-01T12:00:00Z,1.0,2.0,0.5,1.5;0;2.25\n",
        )
        .unwrap();
        let records = ScanRecord::from_csv(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ranges, vec![1.5, 0.0, 2.25]);
        assert_eq!(records[0].truth(), None);
        assert_eq!(records[0].odometry(), Pose2D::new(1.0, 2.0, 0.5));
    }
    #[test]
    fn test_results_and_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let record = ScanRecord {
            time: start(),
            odom_x: 0.0,
            odom_y: 0.0,
            odom_theta: 0.0,
            truth_x: Some(1.0),
            truth_y: Some(1.0),
            truth_theta: Some(0.0),
            ranges: vec![],
        };
        let results = vec![
            LocalizationResult {
                time: start(),
                x: 4.0,
                y: 5.0,
                theta: 0.1,
                effective_sample_size: 120.5,
                updated: true,
            },
            LocalizationResult {
                time: start() + Duration::seconds(1),
                x: 0.0,
                y: 0.0,
                theta: 0.0,
                effective_sample_size: 0.0,
                updated: false,
            },
        ];
        LocalizationResult::to_csv(&results, &path).unwrap();
        assert_eq!(LocalizationResult::from_csv(&path).unwrap(), results);
        let errors = position_errors(&results, &[record]);
        assert_eq!(errors, vec![5.0]);
        let summary = ErrorSummary::from_errors(&errors).unwrap();
        assert_eq!(summary.mean, 5.0);
        assert_eq!(summary.last, 5.0);
        assert!(ErrorSummary::from_errors(&[]).is_none());
    }
}
