//! The localization filter: all mutable filter state and the transitions driven by scans and pose overrides.
//!
//! A [`Localizer`] owns the particle cloud, the last pose estimate, the odometry baseline of the update gate,
//! and the `map -> odom` correction. Each entry point takes the transform provider explicitly and either
//! commits a complete new state or leaves the previous one untouched.
use crate::Pose2D;
use crate::config::LocalizerConfig;
use crate::error::LocalizationError;
use crate::gate::{GateDecision, UpdateGate};
use crate::map::{DistanceGrid, MapServer};
use crate::motion::{MotionModel, OdometryDelta};
use crate::particle::ParticleCloud;
use crate::sensor::{DistanceField, LaserScan, LikelihoodFieldModel};
use crate::transform::{TransformCorrector, TransformProvider, TransformStamped};

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Why a scan was not used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The scan's frame cannot be related to the robot frame.
    LaserTransformUnavailable,
    /// The robot's odometry pose at the scan stamp is unknown.
    OdometryUnavailable,
    /// The `map -> odom` correction could not be recomputed; nothing was committed.
    CorrectionUnavailable,
}

/// Result of handing a scan to the localizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Skipped(SkipReason),
    /// First usable scan: odometry baseline and correction established.
    Initialized,
    /// Not enough motion since the last update; state unchanged.
    Held,
    /// A full motion, sensor, estimate, resample, and correction cycle was committed.
    Updated,
}
impl ScanOutcome {
    /// Whether the scan was used, i.e. the particle cloud should be republished.
    pub fn is_handled(&self) -> bool {
        !matches!(self, ScanOutcome::Skipped(_))
    }
}

/// Running counters and the statistics of the last committed update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterDiagnostics {
    pub scans_received: u64,
    pub scans_skipped: u64,
    pub cycles_held: u64,
    pub cycles_run: u64,
    /// Effective sample size of the weighted cloud before resampling.
    pub effective_sample_size: f64,
    /// Largest normalized weight before resampling.
    pub max_weight: f64,
}

/// Monte Carlo localizer over a distance field `F`.
pub struct Localizer<F: DistanceField> {
    config: LocalizerConfig,
    field: F,
    cloud: ParticleCloud,
    estimate: Option<Pose2D>,
    gate: UpdateGate,
    motion: MotionModel,
    sensor: LikelihoodFieldModel,
    corrector: TransformCorrector,
    rng: StdRng,
    diagnostics: FilterDiagnostics,
}

impl Localizer<DistanceGrid> {
    /// Request the static map once and build a localizer around its distance field.
    ///
    /// Any failure to obtain or prepare the map is fatal and reported as
    /// [`LocalizationError::MapUnavailable`].
    pub fn bootstrap<M: MapServer + ?Sized>(
        config: LocalizerConfig,
        server: &M,
    ) -> Result<Self, LocalizationError> {
        let grid = server.request_map()?;
        info!(
            "Received static map: {}x{} cells at {} m/cell",
            grid.width(),
            grid.height(),
            grid.resolution()
        );
        let field = DistanceGrid::from_occupancy(&grid)?;
        Localizer::new(config, field)
    }
}

impl<F: DistanceField> Localizer<F> {
    pub fn new(config: LocalizerConfig, field: F) -> Result<Self, LocalizationError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Localizer {
            gate: UpdateGate::new(config.distance_threshold, config.angle_threshold),
            motion: MotionModel::new(&config.motion)?,
            sensor: LikelihoodFieldModel::new(&config.sensor)?,
            corrector: TransformCorrector::new(config.frames.clone(), config.transform_timeout_s),
            cloud: ParticleCloud::default(),
            estimate: None,
            diagnostics: FilterDiagnostics::default(),
            config,
            field,
            rng,
        })
    }
    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }
    pub fn field(&self) -> &F {
        &self.field
    }
    pub fn cloud(&self) -> &ParticleCloud {
        &self.cloud
    }
    pub fn particle_poses(&self) -> Vec<Pose2D> {
        self.cloud.poses()
    }
    /// Latest pose estimate in the map frame; `None` until the cloud is first initialized.
    pub fn estimate(&self) -> Option<Pose2D> {
        self.estimate
    }
    /// Pose of the odometry frame in the map frame; `None` until first computed.
    pub fn correction(&self) -> Option<Pose2D> {
        self.corrector.correction()
    }
    /// Odometry pose at the last initialization or update.
    pub fn odometry_baseline(&self) -> Option<Pose2D> {
        self.gate.baseline()
    }
    pub fn diagnostics(&self) -> &FilterDiagnostics {
        &self.diagnostics
    }

    /// Replace the cloud with a fresh one around `seed` and recompute the estimate.
    pub fn initialize_cloud(&mut self, seed: &Pose2D) -> Result<(), LocalizationError> {
        let cloud = ParticleCloud::around(
            seed,
            self.config.num_particles,
            self.config.initial_linear_spread,
            self.config.initial_angular_spread,
            &mut self.rng,
        )?;
        self.estimate = Some(cloud.estimate(self.config.estimation));
        self.cloud = cloud;
        info!(
            "Initialized {} particles around {}",
            self.config.num_particles, seed
        );
        Ok(())
    }

    /// Handle an external pose override: reinitialize around `pose` and recompute the correction at `stamp`.
    ///
    /// The cloud is replaced even when the correction cannot be computed; the previous correction then stays
    /// in effect until the next update.
    pub fn handle_initial_pose<P: TransformProvider + ?Sized>(
        &mut self,
        pose: &Pose2D,
        stamp: DateTime<Utc>,
        provider: &P,
    ) -> Result<(), LocalizationError> {
        self.initialize_cloud(pose)?;
        let estimate = self.estimate.unwrap_or(*pose);
        match self.corrector.compute(&estimate, stamp, provider) {
            Ok(correction) => self.corrector.commit(correction),
            Err(e) => warn!("Pose override applied without a new map to odom correction: {e}"),
        }
        Ok(())
    }

    /// Handle an incoming scan.
    ///
    /// Missing transforms skip the scan without touching the state. A degenerate weight sum is an invariant
    /// failure and is returned as an error, again without touching the state.
    pub fn handle_scan<P: TransformProvider + ?Sized>(
        &mut self,
        scan: &LaserScan,
        provider: &P,
    ) -> Result<ScanOutcome, LocalizationError> {
        self.diagnostics.scans_received += 1;
        let stamp = scan.stamp;
        let base_frame = &self.config.frames.base_frame;
        let odom_frame = &self.config.frames.odom_frame;
        if !provider.can_transform(base_frame, &scan.frame_id, stamp) {
            warn!(
                "Skipping scan: no transform from '{}' to '{}'",
                scan.frame_id, base_frame
            );
            return Ok(self.skip(SkipReason::LaserTransformUnavailable));
        }
        if !provider.can_transform(base_frame, odom_frame, stamp) {
            warn!("Skipping scan: no odometry transform at {stamp}");
            return Ok(self.skip(SkipReason::OdometryUnavailable));
        }
        let odometry =
            match provider.transform_pose(&Pose2D::identity(), base_frame, odom_frame, stamp) {
                Ok(pose) => pose,
                Err(e) => {
                    warn!("Skipping scan: {e}");
                    return Ok(self.skip(SkipReason::OdometryUnavailable));
                }
            };

        match self.gate.evaluate(&odometry) {
            GateDecision::Initialize => self.establish_baseline(odometry, stamp, provider),
            GateDecision::Hold => {
                debug!("Odometry {odometry} within update thresholds; holding");
                self.diagnostics.cycles_held += 1;
                Ok(ScanOutcome::Held)
            }
            GateDecision::Update { previous } => {
                self.run_cycle(previous, odometry, scan, provider)
            }
        }
    }

    fn skip(&mut self, reason: SkipReason) -> ScanOutcome {
        self.diagnostics.scans_skipped += 1;
        ScanOutcome::Skipped(reason)
    }

    /// First usable scan. A cloud placed by an earlier pose override is kept.
    fn establish_baseline<P: TransformProvider + ?Sized>(
        &mut self,
        odometry: Pose2D,
        stamp: DateTime<Utc>,
        provider: &P,
    ) -> Result<ScanOutcome, LocalizationError> {
        let cloud = if self.cloud.is_empty() {
            ParticleCloud::around(
                &odometry,
                self.config.num_particles,
                self.config.initial_linear_spread,
                self.config.initial_angular_spread,
                &mut self.rng,
            )?
        } else {
            self.cloud.clone()
        };
        let estimate = cloud.estimate(self.config.estimation);
        let correction = match self.corrector.compute(&estimate, stamp, provider) {
            Ok(correction) => correction,
            Err(e) => {
                warn!("Skipping first scan: {e}");
                return Ok(self.skip(SkipReason::CorrectionUnavailable));
            }
        };
        info!(
            "Localizer started at odometry {odometry} with {} particles, estimate {estimate}",
            cloud.len()
        );
        self.cloud = cloud;
        self.estimate = Some(estimate);
        self.gate.set_baseline(odometry);
        self.corrector.commit(correction);
        Ok(ScanOutcome::Initialized)
    }

    /// Motion, sensor, normalize, estimate, resample, correct; all on a working copy.
    fn run_cycle<P: TransformProvider + ?Sized>(
        &mut self,
        previous: Pose2D,
        odometry: Pose2D,
        scan: &LaserScan,
        provider: &P,
    ) -> Result<ScanOutcome, LocalizationError> {
        let delta = OdometryDelta::between(&previous, &odometry);
        let mut working = self.cloud.clone();
        self.motion.apply(&mut working, &delta, &mut self.rng);
        self.sensor.apply(&mut working, scan, &self.field);
        if let Err(e) = working.normalize() {
            error!("Update at {} discarded: {e}", scan.stamp);
            return Err(e);
        }
        let estimate = working.estimate(self.config.estimation);
        let effective_sample_size = working.effective_sample_size();
        let max_weight = working.max_weight();
        let resampled = working.resample(self.config.resampling, &mut self.rng);
        let correction = match self.corrector.compute(&estimate, scan.stamp, provider) {
            Ok(correction) => correction,
            Err(e) => {
                warn!("Skipping update: {e}");
                return Ok(self.skip(SkipReason::CorrectionUnavailable));
            }
        };
        debug!(
            "Updated: {:?}, estimate {estimate}, ESS {effective_sample_size:.1}",
            delta
        );
        self.cloud = resampled;
        self.estimate = Some(estimate);
        self.gate.set_baseline(odometry);
        self.corrector.commit(correction);
        self.diagnostics.cycles_run += 1;
        self.diagnostics.effective_sample_size = effective_sample_size;
        self.diagnostics.max_weight = max_weight;
        Ok(ScanOutcome::Updated)
    }

    /// The current correction stamped with `now`, ready to send; `None` before the first correction.
    pub fn broadcast(&self, now: DateTime<Utc>) -> Option<TransformStamped> {
        let transform = self.corrector.broadcast(now);
        if let Some(t) = &transform {
            trace!("Broadcasting {} -> {} at {}", t.parent_frame, t.child_frame, now);
        }
        transform
    }
}
