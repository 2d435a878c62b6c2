//! Particle cloud: the state estimated by the localizer.
//!
//! A [`ParticleCloud`] is a fixed-size, ordered collection of pose hypotheses with non-negative weights. It
//! provides the global reductions of the filter (normalization, pose estimation, resampling); the
//! per-particle steps live in [`crate::motion`] and [`crate::sensor`].
use crate::Pose2D;
use crate::error::LocalizationError;

use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// A single pose hypothesis in the map frame.
///
/// `theta` is not wrapped: motion updates accumulate heading freely and every consumer uses it only through
/// `sin`/`cos`. `weight` is only meaningful as a probability after [`ParticleCloud::normalize`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("theta_deg", &self.theta.to_degrees())
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(x: f64, y: f64, theta: f64, weight: f64) -> Particle {
        Particle {
            x,
            y,
            theta,
            weight,
        }
    }
    pub fn from_pose(pose: &Pose2D, weight: f64) -> Particle {
        Particle::new(pose.x, pose.y, pose.theta, weight)
    }
    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.theta)
    }
}
impl From<(Pose2D, f64)> for Particle {
    fn from(tuple: (Pose2D, f64)) -> Self {
        let (pose, weight) = tuple;
        Particle::from_pose(&pose, weight)
    }
}

/// How the cloud is reduced to a single pose estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimationStrategy {
    /// Weighted mean position; heading from a circular mean in which each particle's unit heading vector is
    /// additionally scaled by the particle's distance from the map origin.
    OriginWeightedMean,
    /// Weighted mean position; heading from the plain weighted circular mean.
    CircularMean,
    /// Pose of the single highest-weight particle.
    HighestWeight,
}
impl Default for EstimationStrategy {
    fn default() -> Self {
        EstimationStrategy::OriginWeightedMean
    }
}

/// How a new cloud is drawn from a weighted one.
///
/// Every strategy copies the selected particles by value, weight included. Only [`Self::Multinomial`]
/// draws each slot independently; the others trade that independence for lower variance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingStrategy {
    /// `N` independent uniform draws located in the cumulative weight distribution.
    Multinomial,
    /// One uniform offset, `N` evenly spaced pointers into the cumulative weight distribution.
    Systematic,
    /// Deterministic `floor(N·w)` copies, remainder drawn systematically from the residual weights.
    Residual,
}
impl Default for ResamplingStrategy {
    fn default() -> Self {
        ResamplingStrategy::Multinomial
    }
}
impl ResamplingStrategy {
    /// Draw `particles.len()` particles from `particles` proportional to weight.
    pub fn resample<R: Rng>(&self, particles: &[Particle], rng: &mut R) -> Vec<Particle> {
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        let n = particles.len();
        let indices = match self {
            ResamplingStrategy::Multinomial => multinomial_resample(&weights, n, rng),
            ResamplingStrategy::Systematic => systematic_resample(&weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(&weights, n, rng),
        };
        indices.into_iter().map(|i| particles[i]).collect()
    }
}

fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// Index of the last nonzero weight, or of the last entry when every weight is zero.
fn last_nonzero(weights: &[f64]) -> usize {
    weights
        .iter()
        .rposition(|&w| w > 0.0)
        .unwrap_or(weights.len().saturating_sub(1))
}

/// Draw `n` indices, each by locating an independent `U[0, 1)` sample in the cumulative weight bins.
///
/// Index `i` is chosen when `cdf[i-1] <= u < cdf[i]`, so zero-weight entries (empty bins) are never chosen.
/// Samples that land past the last bin through rounding are assigned to the last index with nonzero weight.
pub fn multinomial_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let bins = cumulative_weights(weights);
    let last = last_nonzero(weights);
    (0..n)
        .map(|_| {
            let u: f64 = rng.random();
            bins.partition_point(|&c| c <= u).min(last)
        })
        .collect()
}

/// Draw `n` indices using a single random offset and evenly spaced pointers.
pub fn systematic_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let bins = cumulative_weights(weights);
    let last = last_nonzero(weights);
    let step = bins[weights.len() - 1] / n as f64;
    let offset = rng.random::<f64>() * step;
    let mut indices = Vec::with_capacity(n);
    let mut i = 0;
    for j in 0..n {
        let pointer = offset + j as f64 * step;
        while i < last && bins[i] <= pointer {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

/// Draw `n` indices by residual resampling.
pub fn residual_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual: Vec<f64> = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let expected = w / total * n as f64;
        let copies = expected.floor() as usize;
        residual[i] = expected - copies as f64;
        for _ in 0..copies {
            if indices.len() < n {
                indices.push(i);
            }
        }
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// An ordered, fixed-size collection of particles.
#[derive(Clone, Default, PartialEq)]
pub struct ParticleCloud {
    particles: Vec<Particle>,
}
impl Debug for ParticleCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.estimate(EstimationStrategy::CircularMean);
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        f.debug_struct("ParticleCloud")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format!("[{:.4e}, {:.4e}]", min_weight, self.max_weight()),
            )
            .field("mean_pose", &mean.to_string())
            .finish()
    }
}
impl ParticleCloud {
    pub fn new(particles: Vec<Particle>) -> Self {
        ParticleCloud { particles }
    }
    /// Build a cloud of `num_particles` particles spread uniformly around `seed`.
    ///
    /// Positions are offset by `U(-L/2, L/2)` per axis and headings by `U(-A/2, A/2)`, where `L` is
    /// `linear_spread` and `A` is `angular_spread`. All weights start at 1 and the cloud is normalized
    /// before it is returned.
    ///
    /// # Example
    /// ```rust
    /// use mcl::{ParticleCloud, Pose2D};
    /// use rand::SeedableRng;
    /// use rand::rngs::StdRng;
    ///
    /// let mut rng = StdRng::seed_from_u64(7);
    /// let cloud = ParticleCloud::around(&Pose2D::new(1.0, 2.0, 0.0), 100, 1.0, 0.5, &mut rng).unwrap();
    /// assert_eq!(cloud.len(), 100);
    /// assert!((cloud.weight_sum() - 1.0).abs() < 1e-9);
    /// ```
    pub fn around<R: Rng>(
        seed: &Pose2D,
        num_particles: usize,
        linear_spread: f64,
        angular_spread: f64,
        rng: &mut R,
    ) -> Result<Self, LocalizationError> {
        if num_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "particle cloud needs at least one particle".to_string(),
            ));
        }
        let linear = Uniform::new_inclusive(-linear_spread / 2.0, linear_spread / 2.0).map_err(
            |e| LocalizationError::InvalidConfig(format!("linear spread {linear_spread}: {e}")),
        )?;
        let angular = Uniform::new_inclusive(-angular_spread / 2.0, angular_spread / 2.0)
            .map_err(|e| {
                LocalizationError::InvalidConfig(format!("angular spread {angular_spread}: {e}"))
            })?;
        let particles = (0..num_particles)
            .map(|_| {
                Particle::new(
                    seed.x + linear.sample(rng),
                    seed.y + linear.sample(rng),
                    seed.theta + angular.sample(rng),
                    1.0,
                )
            })
            .collect();
        let mut cloud = ParticleCloud::new(particles);
        cloud.normalize()?;
        Ok(cloud)
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn poses(&self) -> Vec<Pose2D> {
        self.particles.iter().map(Particle::pose).collect()
    }
    pub fn weight_sum(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }
    /// Divide every weight by the sum of all weights.
    ///
    /// A zero, negative, or non-finite sum is an invariant failure and is reported rather than producing
    /// NaN weights. The cloud is left untouched in that case.
    pub fn normalize(&mut self) -> Result<(), LocalizationError> {
        let sum = self.weight_sum();
        if !(sum > 0.0 && sum.is_finite()) {
            return Err(LocalizationError::DegenerateWeights { sum });
        }
        for particle in &mut self.particles {
            particle.weight /= sum;
        }
        Ok(())
    }
    /// `1 / Σw²` for a normalized cloud; zero when every weight is zero.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    pub fn max_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).fold(0.0, f64::max)
    }
    /// Reduce the cloud to a single pose. Weights are assumed normalized; an empty cloud yields the identity.
    pub fn estimate(&self, strategy: EstimationStrategy) -> Pose2D {
        if self.particles.is_empty() {
            return Pose2D::identity();
        }
        match strategy {
            EstimationStrategy::OriginWeightedMean => self.weighted_mean(true),
            EstimationStrategy::CircularMean => self.weighted_mean(false),
            EstimationStrategy::HighestWeight => self
                .particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .map(Particle::pose)
                .unwrap_or_default(),
        }
    }
    fn weighted_mean(&self, scale_by_origin_distance: bool) -> Pose2D {
        let mut mean = Pose2D::identity();
        let mut heading_x = 0.0;
        let mut heading_y = 0.0;
        for particle in &self.particles {
            mean.x += particle.weight * particle.x;
            mean.y += particle.weight * particle.y;
            let radius = if scale_by_origin_distance {
                particle.pose().distance_from_origin()
            } else {
                1.0
            };
            heading_x += particle.weight * radius * particle.theta.cos();
            heading_y += particle.weight * radius * particle.theta.sin();
        }
        mean.theta = heading_y.atan2(heading_x);
        mean
    }
    /// Draw a new cloud of the same size proportional to weight. No noise is added.
    pub fn resample<R: Rng>(&self, strategy: ResamplingStrategy, rng: &mut R) -> ParticleCloud {
        ParticleCloud::new(strategy.resample(&self.particles, rng))
    }
}
impl From<Vec<Particle>> for ParticleCloud {
    fn from(particles: Vec<Particle>) -> Self {
        ParticleCloud::new(particles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::{FRAC_PI_2, PI};

    const STRATEGIES: [ResamplingStrategy; 3] = [
        ResamplingStrategy::Multinomial,
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Residual,
    ];

    fn weighted_cloud() -> ParticleCloud {
        ParticleCloud::new(vec![
            Particle::new(0.0, 0.0, 0.0, 0.1),
            Particle::new(1.0, 0.5, 0.2, 0.0),
            Particle::new(2.0, -1.0, 1.3, 0.6),
            Particle::new(-3.0, 4.0, -2.0, 0.3),
        ])
    }

    #[test]
    fn test_particle_construction() {
        let pose = Pose2D::new(1.0, -2.0, 0.5);
        let particle = Particle::from((pose, 0.25));
        assert_eq!(particle.pose(), pose);
        assert_eq!(particle.weight, 0.25);
    }
    #[test]
    fn test_cloud_around_seed() {
        let mut rng = StdRng::seed_from_u64(1);
        let seed = Pose2D::new(3.0, -1.0, 0.4);
        let cloud = ParticleCloud::around(&seed, 500, 1.0, FRAC_PI_2, &mut rng).unwrap();
        assert_eq!(cloud.len(), 500);
        assert_approx_eq!(cloud.weight_sum(), 1.0, 1e-9);
        for p in cloud.iter() {
            assert!((p.x - seed.x).abs() <= 0.5);
            assert!((p.y - seed.y).abs() <= 0.5);
            assert!((p.theta - seed.theta).abs() <= FRAC_PI_2 / 2.0);
            assert_approx_eq!(p.weight, 1.0 / 500.0, 1e-12);
        }
    }
    #[test]
    fn test_cloud_around_rejects_empty_and_bad_spread() {
        let mut rng = StdRng::seed_from_u64(1);
        let seed = Pose2D::identity();
        assert!(matches!(
            ParticleCloud::around(&seed, 0, 1.0, 1.0, &mut rng),
            Err(LocalizationError::InvalidConfig(_))
        ));
        assert!(matches!(
            ParticleCloud::around(&seed, 10, f64::NAN, 1.0, &mut rng),
            Err(LocalizationError::InvalidConfig(_))
        ));
    }
    #[test]
    fn test_zero_spread_collapses_onto_seed() {
        let mut rng = StdRng::seed_from_u64(3);
        let seed = Pose2D::new(1.0, 1.0, 1.0);
        let cloud = ParticleCloud::around(&seed, 10, 0.0, 0.0, &mut rng).unwrap();
        assert!(cloud.iter().all(|p| p.pose() == seed));
    }
    #[test]
    fn test_normalize() {
        let mut cloud = ParticleCloud::new(vec![
            Particle::new(0.0, 0.0, 0.0, 3.0),
            Particle::new(0.0, 0.0, 0.0, 1.0),
            Particle::new(0.0, 0.0, 0.0, 0.0),
            Particle::new(0.0, 0.0, 0.0, 4.0),
        ]);
        cloud.normalize().unwrap();
        assert_approx_eq!(cloud.weight_sum(), 1.0, 1e-9);
        assert_approx_eq!(cloud.particles()[0].weight, 0.375, 1e-12);
        assert_eq!(cloud.particles()[2].weight, 0.0);
    }
    #[test]
    fn test_normalize_many_tiny_weights() {
        let particles = (0..1000)
            .map(|i| Particle::new(0.0, 0.0, 0.0, 1e-200 * (i + 1) as f64))
            .collect();
        let mut cloud = ParticleCloud::new(particles);
        cloud.normalize().unwrap();
        assert_approx_eq!(cloud.weight_sum(), 1.0, 1e-9);
    }
    #[test]
    fn test_normalize_zero_sum_is_an_error() {
        let mut cloud = ParticleCloud::new(vec![Particle::new(1.0, 2.0, 3.0, 0.0); 4]);
        let err = cloud.normalize().unwrap_err();
        assert!(matches!(err, LocalizationError::DegenerateWeights { sum } if sum == 0.0));
        assert!(cloud.iter().all(|p| p.weight == 0.0));
    }
    #[test]
    fn test_effective_sample_size() {
        let uniform = ParticleCloud::new(vec![Particle::new(0.0, 0.0, 0.0, 0.25); 4]);
        assert_approx_eq!(uniform.effective_sample_size(), 4.0, 1e-12);
        let mut peaked = uniform.clone();
        peaked.particles_mut()[0].weight = 1.0;
        for p in &mut peaked.particles_mut()[1..] {
            p.weight = 0.0;
        }
        assert_approx_eq!(peaked.effective_sample_size(), 1.0, 1e-12);
        assert_eq!(ParticleCloud::default().effective_sample_size(), 0.0);
    }
    #[test]
    fn test_resample_preserves_size() {
        let mut rng = StdRng::seed_from_u64(11);
        let cloud = weighted_cloud();
        for strategy in STRATEGIES {
            let resampled = cloud.resample(strategy, &mut rng);
            assert_eq!(resampled.len(), cloud.len(), "{strategy:?}");
        }
    }
    #[test]
    fn test_resample_copies_particles_by_value() {
        let mut rng = StdRng::seed_from_u64(5);
        let cloud = weighted_cloud();
        for strategy in STRATEGIES {
            for _ in 0..50 {
                let resampled = cloud.resample(strategy, &mut rng);
                for p in resampled.iter() {
                    assert!(
                        cloud.iter().any(|q| q.x == p.x && q.y == p.y && q.theta == p.theta),
                        "{strategy:?} produced a particle not in the input: {p}"
                    );
                }
            }
        }
    }
    #[test]
    fn test_resample_never_draws_zero_weight() {
        let mut rng = StdRng::seed_from_u64(17);
        let cloud = weighted_cloud();
        for strategy in STRATEGIES {
            for _ in 0..200 {
                let resampled = cloud.resample(strategy, &mut rng);
                assert!(resampled.iter().all(|p| p.x != 1.0), "{strategy:?}");
            }
        }
    }
    #[test]
    fn test_short_weight_total_skips_trailing_zero_weights() {
        // cumulative total of 0.4 leaves most uniform draws past the last bin
        let weights = [0.2, 0.2, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(29);
        let drawn = multinomial_resample(&weights, 500, &mut rng);
        assert!(drawn.iter().all(|&i| i < 2));
        assert!(drawn.contains(&1));
        let drawn = systematic_resample(&weights, 500, &mut rng);
        assert!(drawn.iter().all(|&i| i < 2));
        let first = drawn.iter().filter(|&&i| i == 0).count();
        assert!((249..=251).contains(&first), "{first}");
    }
    #[test]
    fn test_resample_single_dominant_particle() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut particles = vec![Particle::new(0.0, 0.0, 0.0, 0.0); 50];
        particles[31] = Particle::new(7.0, 8.0, 9.0, 1.0);
        let cloud = ParticleCloud::new(particles);
        for strategy in STRATEGIES {
            let resampled = cloud.resample(strategy, &mut rng);
            assert_eq!(resampled.len(), 50);
            assert!(resampled.iter().all(|p| p.x == 7.0 && p.y == 8.0 && p.theta == 9.0));
        }
    }
    #[test]
    fn test_multinomial_frequencies_follow_weights() {
        let mut rng = StdRng::seed_from_u64(99);
        let weights = [0.1, 0.0, 0.6, 0.3];
        let draws = multinomial_resample(&weights, 100_000, &mut rng);
        let mut counts = [0usize; 4];
        for i in draws {
            counts[i] += 1;
        }
        for (count, w) in counts.iter().zip(weights.iter()) {
            assert_approx_eq!(*count as f64 / 100_000.0, *w, 0.01);
        }
    }
    #[test]
    fn test_systematic_and_residual_counts_are_near_expected() {
        let mut rng = StdRng::seed_from_u64(4);
        let weights = [0.5, 0.25, 0.125, 0.125];
        for indices in [
            systematic_resample(&weights, 8, &mut rng),
            residual_resample(&weights, 8, &mut rng),
        ] {
            let mut counts = [0usize; 4];
            for i in indices {
                counts[i] += 1;
            }
            assert_eq!(counts, [4, 2, 1, 1]);
        }
    }
    #[test]
    fn test_estimate_weighted_position() {
        let mut cloud = weighted_cloud();
        cloud.normalize().unwrap();
        let estimate = cloud.estimate(EstimationStrategy::OriginWeightedMean);
        assert_approx_eq!(estimate.x, 0.6 * 2.0 - 0.3 * 3.0, 1e-12);
        assert_approx_eq!(estimate.y, -0.6 + 0.3 * 4.0, 1e-12);
    }
    #[test]
    fn test_origin_weighted_heading_differs_from_plain_circular_mean() {
        let cloud = ParticleCloud::new(vec![
            Particle::new(1.0, 0.0, 0.0, 0.5),
            Particle::new(3.0, 0.0, FRAC_PI_2, 0.5),
        ]);
        let origin_weighted = cloud.estimate(EstimationStrategy::OriginWeightedMean);
        let circular = cloud.estimate(EstimationStrategy::CircularMean);
        assert_approx_eq!(origin_weighted.theta, 1.5_f64.atan2(0.5), 1e-12);
        assert_approx_eq!(circular.theta, PI / 4.0, 1e-12);
        assert_approx_eq!(origin_weighted.x, 2.0, 1e-12);
    }
    #[test]
    fn test_opposite_headings_at_same_position() {
        let cloud = ParticleCloud::new(vec![
            Particle::new(1.0, 0.0, 0.0, 0.5),
            Particle::new(1.0, 0.0, PI, 0.5),
        ]);
        let estimate = cloud.estimate(EstimationStrategy::OriginWeightedMean);
        assert_approx_eq!(estimate.x, 1.0, 1e-12);
        assert_approx_eq!(estimate.y, 0.0, 1e-12);
        // cos terms cancel exactly; the heading comes from the residual sin(π) term
        let expected = (0.5 * PI.sin()).atan2(0.5 - 0.5);
        assert_eq!(estimate.theta, expected);
    }
    #[test]
    fn test_heading_wraparound() {
        let cloud = ParticleCloud::new(vec![
            Particle::new(2.0, 0.0, PI - 0.1, 0.5),
            Particle::new(2.0, 0.0, -PI + 0.1, 0.5),
        ]);
        let estimate = cloud.estimate(EstimationStrategy::OriginWeightedMean);
        assert_approx_eq!(estimate.theta.abs(), PI, 1e-9);
    }
    #[test]
    fn test_particle_at_origin_contributes_no_heading() {
        let cloud = ParticleCloud::new(vec![
            Particle::new(0.0, 0.0, 2.0, 0.9),
            Particle::new(0.0, 1.0, -0.5, 0.1),
        ]);
        let estimate = cloud.estimate(EstimationStrategy::OriginWeightedMean);
        assert_approx_eq!(estimate.theta, -0.5, 1e-12);
    }
    #[test]
    fn test_highest_weight_estimate() {
        let estimate = weighted_cloud().estimate(EstimationStrategy::HighestWeight);
        assert_eq!(estimate, Pose2D::new(2.0, -1.0, 1.3));
    }
}
