//! Odometry motion model.
//!
//! The robot's reported motion between two odometry poses is decomposed into an initial rotation toward the
//! direction of travel, a straight-line translation, and a final rotation onto the new heading. Each particle
//! replays that motion with every term scaled by its own multiplicative noise factor.
use crate::error::LocalizationError;
use crate::particle::{Particle, ParticleCloud};
use crate::{Pose2D, wrap_to_pi};

use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

fn default_noise_fraction() -> f64 {
    0.3
}

/// Motion model parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Width of the multiplicative noise band: each term is scaled by a factor drawn from
    /// `U[1 - ε/2, 1 + ε/2]`.
    #[serde(default = "default_noise_fraction")]
    pub noise_fraction: f64,
}
impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            noise_fraction: default_noise_fraction(),
        }
    }
}

/// Odometry difference between two poses, decomposed as `(rot1, trans, rot2)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OdometryDelta {
    pub rot1: f64,
    pub trans: f64,
    pub rot2: f64,
}
impl OdometryDelta {
    /// Decompose the motion from `last` to `current`, both expressed in the odometry frame.
    ///
    /// `rot1 = atan2(Δy, Δx) - θ_last`, `trans = |(Δx, Δy)|` and `rot2 = Δθ - rot1`, with `Δθ` wrapped to
    /// `[-π, π]` so that crossing the heading discontinuity does not register as a full turn.
    pub fn between(last: &Pose2D, current: &Pose2D) -> OdometryDelta {
        let dx = current.x - last.x;
        let dy = current.y - last.y;
        let dtheta = wrap_to_pi(current.theta - last.theta);
        let rot1 = dy.atan2(dx) - last.theta;
        OdometryDelta {
            rot1,
            trans: dx.hypot(dy),
            rot2: dtheta - rot1,
        }
    }
}

/// Samples particle motion from an [`OdometryDelta`].
#[derive(Clone, Debug)]
pub struct MotionModel {
    noise: Uniform<f64>,
    noise_fraction: f64,
}
impl MotionModel {
    pub fn new(config: &MotionConfig) -> Result<MotionModel, LocalizationError> {
        let eps = config.noise_fraction;
        if !(0.0..=2.0).contains(&eps) {
            return Err(LocalizationError::InvalidConfig(format!(
                "motion noise fraction must be within [0, 2], got {eps}"
            )));
        }
        let noise = Uniform::new_inclusive(1.0 - eps / 2.0, 1.0 + eps / 2.0).map_err(|e| {
            LocalizationError::InvalidConfig(format!("motion noise fraction {eps}: {e}"))
        })?;
        Ok(MotionModel {
            noise,
            noise_fraction: eps,
        })
    }
    pub fn noise_fraction(&self) -> f64 {
        self.noise_fraction
    }
    /// Move a single particle by `delta`, drawing three fresh noise factors.
    ///
    /// The translation is applied along the heading reached after the first rotation.
    pub fn sample<R: Rng>(&self, particle: &mut Particle, delta: &OdometryDelta, rng: &mut R) {
        let rot1 = delta.rot1 * self.noise.sample(rng);
        let trans = delta.trans * self.noise.sample(rng);
        let rot2 = delta.rot2 * self.noise.sample(rng);
        particle.theta += rot1;
        particle.x += trans * particle.theta.cos();
        particle.y += trans * particle.theta.sin();
        particle.theta += rot2;
    }
    /// Move every particle in the cloud. Particles draw from the shared generator in index order, so a
    /// seeded generator reproduces the same cloud.
    pub fn apply<R: Rng>(&self, cloud: &mut ParticleCloud, delta: &OdometryDelta, rng: &mut R) {
        for particle in cloud.particles_mut() {
            self.sample(particle, delta, rng);
        }
    }
}
