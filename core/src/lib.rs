//! Monte Carlo localization for a planar robot in a known static map
//!
//! This crate estimates the pose (position and heading) of a mobile robot inside a fixed map frame by fusing
//! noisy wheel odometry with range scans. The estimator is a particle filter: a fixed-size cloud of pose
//! hypotheses is pushed forward by the odometry motion model, scored against a precomputed obstacle distance
//! field (the likelihood field sensor model), normalized, reduced to a single pose estimate, and resampled.
//!
//! The pose estimate is not published directly. Instead the filter maintains the transform between the map
//! frame and the odometry frame, so that consumers which only track odometry can recover the corrected pose
//! by composing the two. That transform is recomputed on every update cycle and re-broadcast on a fixed tick.
//!
//! # Coordinate frames
//!
//! - `map`: fixed global frame in which the static map and the particle cloud live.
//! - `odom`: the drifting dead-reckoning frame reported by the robot's wheel odometry.
//! - `base_link`: the robot body frame.
//!
//! The transform published by this crate is `map -> odom`, i.e. the pose of the odometry origin expressed in
//! the map frame.
//!
//! # Update cycle
//!
//! A scan triggers a full update only after the robot has moved far enough since the last update (see
//! [`gate`]). A full update runs, in order:
//!
//! 1. [`motion::MotionModel`]: advance each particle by the odometry delta decomposed as
//!    $(\delta_{rot1}, \delta_{trans}, \delta_{rot2})$, each term scaled by independent uniform noise.
//! 2. [`sensor::LikelihoodFieldModel`]: project a subsample of scan endpoints from each particle and weight
//!    the particle by the inverse sum of the sharpened obstacle distances,
//!    $w = 1 / \sum_b d_b^k$.
//! 3. [`particle::ParticleCloud::normalize`]: rescale weights to sum to one.
//! 4. [`particle::EstimationStrategy`]: reduce the cloud to a single pose.
//! 5. [`particle::ResamplingStrategy`]: draw a new cloud of the same size proportional to weight.
//! 6. [`transform::TransformCorrector`]: recompute the `map -> odom` correction from the estimate.
//!
//! The whole cycle runs on a working copy of the cloud and is committed only if every step succeeds.
//!
//! # Collaborators
//!
//! The distance field ([`sensor::DistanceField`]), the transform provider ([`transform::TransformProvider`]),
//! the static map source ([`map::MapServer`]), and the output transport ([`messages::Publisher`]) are traits.
//! In-memory implementations are provided for offline replay and testing.
pub mod config;
pub mod error;
pub mod gate;
pub mod localizer;
pub mod map;
pub mod messages;
pub mod motion;
pub mod node;
pub mod particle;
pub mod sensor;
pub mod sim;
pub mod transform;

pub use crate::config::LocalizerConfig;
pub use crate::error::{LocalizationError, MapError, TransformError};
pub use crate::localizer::{Localizer, ScanOutcome, SkipReason};
pub use crate::particle::{Particle, ParticleCloud};

use nalgebra::{Isometry2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A planar pose: position in some frame plus heading about the vertical axis.
///
/// Heading is in radians. Poses built from a rigid transform have their heading wrapped to $(-\pi, \pi]$;
/// poses built directly keep whatever heading they were given.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.2}°)",
            self.x,
            self.y,
            self.theta.to_degrees()
        )
    }
}
impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D { x, y, theta }
    }
    /// The origin of a frame expressed in itself.
    pub fn identity() -> Self {
        Pose2D::default()
    }
    /// View the pose as the rigid transform taking points from the pose's child frame into its parent frame.
    pub fn to_isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    pub fn from_isometry(isometry: &Isometry2<f64>) -> Self {
        Pose2D {
            x: isometry.translation.vector.x,
            y: isometry.translation.vector.y,
            theta: isometry.rotation.angle(),
        }
    }
    /// Compose two poses: `self ⊕ other`.
    ///
    /// If `self` is the pose of frame `b` in frame `a` and `other` is the pose of frame `c` in frame `b`, the
    /// result is the pose of `c` in `a`.
    ///
    /// # Example
    /// ```rust
    /// use mcl::Pose2D;
    /// use std::f64::consts::FRAC_PI_2;
    ///
    /// let a = Pose2D::new(1.0, 0.0, FRAC_PI_2);
    /// let b = Pose2D::new(1.0, 0.0, 0.0);
    /// let c = a.compose(&b);
    /// assert!((c.x - 1.0).abs() < 1e-12);
    /// assert!((c.y - 1.0).abs() < 1e-12);
    /// ```
    pub fn compose(&self, other: &Pose2D) -> Pose2D {
        Pose2D::from_isometry(&(self.to_isometry() * other.to_isometry()))
    }
    /// The inverse transform: if `self` is the pose of `b` in `a`, the result is the pose of `a` in `b`.
    pub fn inverse(&self) -> Pose2D {
        Pose2D::from_isometry(&self.to_isometry().inverse())
    }
    /// Euclidean distance of the position from the frame origin.
    pub fn distance_from_origin(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Wrap an angle to the range $-\pi$ to $\pi$ radians
///
/// This function is generic and can be used with any type that implements the necessary traits.
///
/// # Arguments
/// * `angle` - The angle to be wrapped.
/// # Returns
/// * The wrapped angle, which will be in the range -π to π radians.
/// # Example
/// ```rust
/// use mcl::wrap_to_pi;
/// use std::f64::consts::PI;
/// let angle = 3.0 * PI / 2.0; // radians
/// let wrapped_angle = wrap_to_pi(angle);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(std::f64::consts::PI) {
        wrapped -= T::from(2.0 * std::f64::consts::PI);
    }
    while wrapped < T::from(-std::f64::consts::PI) {
        wrapped += T::from(2.0 * std::f64::consts::PI);
    }
    wrapped
}
