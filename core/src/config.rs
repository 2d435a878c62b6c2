//! Localizer configuration.
//!
//! Every field has a default, so a configuration file only needs to name the values it changes. Files are
//! read and written as JSON, YAML, or TOML, chosen by extension.
use crate::error::LocalizationError;
use crate::motion::MotionConfig;
use crate::particle::{EstimationStrategy, ResamplingStrategy};
use crate::sensor::SensorModelConfig;
use crate::transform::FrameConfig;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

/// Complete set of localizer parameters.
///
/// ## Example
///
/// ```
/// use mcl::LocalizerConfig;
///
/// let config = LocalizerConfig {
///     num_particles: 200,
///     seed: Some(42),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Fixed number of particles in the cloud.
    pub num_particles: usize,
    /// Full width of the uniform position spread used when (re)initializing the cloud.
    pub initial_linear_spread: f64,
    /// Full width of the uniform heading spread used when (re)initializing the cloud, in radians.
    pub initial_angular_spread: f64,
    /// Per-axis odometry change that triggers an update.
    pub distance_threshold: f64,
    /// Heading change, in radians, that triggers an update.
    pub angle_threshold: f64,
    pub motion: MotionConfig,
    pub sensor: SensorModelConfig,
    pub resampling: ResamplingStrategy,
    pub estimation: EstimationStrategy,
    pub frames: FrameConfig,
    /// Bound on waiting for the odometry transform during a correction.
    pub transform_timeout_s: f64,
    /// Rate at which the `map -> odom` correction is re-broadcast.
    pub broadcast_rate_hz: f64,
    /// Seed for the filter's random number generator. Drawn from entropy when absent.
    pub seed: Option<u64>,
}
impl Default for LocalizerConfig {
    fn default() -> Self {
        LocalizerConfig {
            num_particles: 500,
            initial_linear_spread: 1.0,
            initial_angular_spread: PI / 2.0,
            distance_threshold: 0.1,
            angle_threshold: PI / 12.0,
            motion: MotionConfig::default(),
            sensor: SensorModelConfig::default(),
            resampling: ResamplingStrategy::default(),
            estimation: EstimationStrategy::default(),
            frames: FrameConfig::default(),
            transform_timeout_s: 1.0,
            broadcast_rate_hz: 5.0,
            seed: None,
        }
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), LocalizationError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(LocalizationError::InvalidConfig(format!(
            "{name} must be a finite non-negative number, got {value}"
        )))
    }
}

impl LocalizerConfig {
    /// Check every parameter, reporting the first invalid one.
    pub fn validate(&self) -> Result<(), LocalizationError> {
        if self.num_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "num_particles must be positive".to_string(),
            ));
        }
        non_negative("initial_linear_spread", self.initial_linear_spread)?;
        non_negative("initial_angular_spread", self.initial_angular_spread)?;
        non_negative("distance_threshold", self.distance_threshold)?;
        non_negative("angle_threshold", self.angle_threshold)?;
        non_negative("transform_timeout_s", self.transform_timeout_s)?;
        if !(self.broadcast_rate_hz > 0.0 && self.broadcast_rate_hz.is_finite()) {
            return Err(LocalizationError::InvalidConfig(format!(
                "broadcast_rate_hz must be positive, got {}",
                self.broadcast_rate_hz
            )));
        }
        let noise = self.motion.noise_fraction;
        if !(0.0..=2.0).contains(&noise) {
            return Err(LocalizationError::InvalidConfig(format!(
                "motion.noise_fraction must be within [0, 2], got {noise}"
            )));
        }
        self.sensor.validate()?;
        let frames = &self.frames;
        for (name, frame) in [
            ("map_frame", &frames.map_frame),
            ("odom_frame", &frames.odom_frame),
            ("base_frame", &frames.base_frame),
        ] {
            if frame.is_empty() {
                return Err(LocalizationError::InvalidConfig(format!(
                    "frames.{name} must not be empty"
                )));
            }
        }
        Ok(())
    }
    /// Interval between correction broadcasts.
    pub fn broadcast_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.broadcast_rate_hz)
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Write by file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Read by file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
