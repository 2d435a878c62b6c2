//! Likelihood field sensor model.
//!
//! Each particle is scored by projecting a subsample of scan endpoints from the particle's pose and looking up
//! how far each endpoint lands from the nearest mapped obstacle. Endpoints that land on obstacles are
//! evidence for the hypothesis; endpoints far from any obstacle are evidence against it.
use crate::Pose2D;
use crate::error::LocalizationError;
use crate::particle::ParticleCloud;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Range value reported for a beam that did not hit anything.
pub const NO_RETURN: f64 = 0.0;
/// Number of one-degree beams in a full scan.
pub const SCAN_BEAMS: usize = 360;

/// A planar range scan with one reading per integer degree of bearing, counter-clockwise from the sensor's
/// forward axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub ranges: Vec<f64>,
}
impl LaserScan {
    pub fn new(stamp: DateTime<Utc>, frame_id: impl Into<String>, ranges: Vec<f64>) -> Self {
        LaserScan {
            stamp,
            frame_id: frame_id.into(),
            ranges,
        }
    }
    /// Reading at `bearing_deg`; bearings beyond the end of a short scan read as [`NO_RETURN`].
    pub fn range(&self, bearing_deg: usize) -> f64 {
        self.ranges.get(bearing_deg).copied().unwrap_or(NO_RETURN)
    }
}

/// Distance from a map-frame point to the nearest obstacle.
pub trait DistanceField: Send + Sync {
    /// `None` when the point lies outside the mapped region.
    fn distance_to_nearest_obstacle(&self, x: f64, y: f64) -> Option<f64>;
}
impl<F: DistanceField + ?Sized> DistanceField for &F {
    fn distance_to_nearest_obstacle(&self, x: f64, y: f64) -> Option<f64> {
        (**self).distance_to_nearest_obstacle(x, y)
    }
}
impl<F: DistanceField + ?Sized> DistanceField for Box<F> {
    fn distance_to_nearest_obstacle(&self, x: f64, y: f64) -> Option<f64> {
        (**self).distance_to_nearest_obstacle(x, y)
    }
}

fn default_bearing_step_deg() -> usize {
    10
}
fn default_exponent() -> i32 {
    5
}

/// Likelihood field parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorModelConfig {
    /// Spacing between evaluated bearings. Must divide 360.
    #[serde(default = "default_bearing_step_deg")]
    pub bearing_step_deg: usize,
    /// Sharpening exponent applied to each endpoint distance.
    #[serde(default = "default_exponent")]
    pub exponent: i32,
    /// Skip bearings whose reading is [`NO_RETURN`] (or not finite) instead of projecting them.
    #[serde(default)]
    pub skip_no_return: bool,
}
impl Default for SensorModelConfig {
    fn default() -> Self {
        SensorModelConfig {
            bearing_step_deg: default_bearing_step_deg(),
            exponent: default_exponent(),
            skip_no_return: false,
        }
    }
}
impl SensorModelConfig {
    pub fn validate(&self) -> Result<(), LocalizationError> {
        if self.bearing_step_deg == 0 || SCAN_BEAMS % self.bearing_step_deg != 0 {
            return Err(LocalizationError::InvalidConfig(format!(
                "bearing step must be a positive divisor of {SCAN_BEAMS}, got {}",
                self.bearing_step_deg
            )));
        }
        if self.exponent < 1 {
            return Err(LocalizationError::InvalidConfig(format!(
                "sensor exponent must be at least 1, got {}",
                self.exponent
            )));
        }
        Ok(())
    }
}

/// Scores pose hypotheses against a [`DistanceField`].
#[derive(Clone, Debug)]
pub struct LikelihoodFieldModel {
    bearings: Vec<usize>,
    exponent: i32,
    skip_no_return: bool,
}
impl LikelihoodFieldModel {
    pub fn new(config: &SensorModelConfig) -> Result<Self, LocalizationError> {
        config.validate()?;
        Ok(LikelihoodFieldModel {
            bearings: (0..SCAN_BEAMS).step_by(config.bearing_step_deg).collect(),
            exponent: config.exponent,
            skip_no_return: config.skip_no_return,
        })
    }
    /// Bearings, in degrees, evaluated for every particle.
    pub fn bearings(&self) -> &[usize] {
        &self.bearings
    }
    /// Unnormalized weight of a single pose.
    ///
    /// Returns `0.0` as soon as any endpoint falls outside the mapped region, `1.0` when every evaluated
    /// endpoint lies exactly on an obstacle, and `1 / Σ dᵏ` otherwise.
    pub fn particle_weight<F: DistanceField + ?Sized>(
        &self,
        pose: &Pose2D,
        scan: &LaserScan,
        field: &F,
    ) -> f64 {
        let mut error = 0.0;
        for &bearing in &self.bearings {
            let range = scan.range(bearing);
            if self.skip_no_return && (range == NO_RETURN || !range.is_finite()) {
                continue;
            }
            let angle = pose.theta + (bearing as f64).to_radians();
            let x = pose.x + range * angle.cos();
            let y = pose.y + range * angle.sin();
            match field.distance_to_nearest_obstacle(x, y) {
                Some(distance) => error += distance.powi(self.exponent),
                None => return 0.0,
            }
        }
        if error == 0.0 { 1.0 } else { 1.0 / error }
    }
    /// Overwrite every particle's weight with its likelihood. Particles are scored in parallel.
    pub fn apply<F: DistanceField + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        scan: &LaserScan,
        field: &F,
    ) {
        cloud.particles_mut().par_iter_mut().for_each(|particle| {
            particle.weight = self.particle_weight(&particle.pose(), scan, field);
        });
    }
}
