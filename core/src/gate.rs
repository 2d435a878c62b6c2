//! Motion gate deciding whether a scan warrants a full filter update.
use crate::{Pose2D, wrap_to_pi};

/// What the localizer should do with a scan, given the robot's odometry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GateDecision {
    /// No odometry baseline yet: initialize and record a baseline without updating.
    Initialize,
    /// Not enough motion since the last update.
    Hold,
    /// Enough motion: run the full cycle from `previous`, the odometry at the last update.
    Update { previous: Pose2D },
}

/// Tracks the odometry pose at the last update and compares new odometry against per-axis thresholds.
#[derive(Clone, Debug)]
pub struct UpdateGate {
    distance_threshold: f64,
    angle_threshold: f64,
    baseline: Option<Pose2D>,
}
impl UpdateGate {
    pub fn new(distance_threshold: f64, angle_threshold: f64) -> Self {
        UpdateGate {
            distance_threshold,
            angle_threshold,
            baseline: None,
        }
    }
    /// Compare `odometry` with the baseline: an update is due when `|Δx|` or `|Δy|` exceeds the distance
    /// threshold or the wrapped `|Δθ|` exceeds the angle threshold. Does not modify the baseline.
    pub fn evaluate(&self, odometry: &Pose2D) -> GateDecision {
        let Some(previous) = self.baseline else {
            return GateDecision::Initialize;
        };
        let dx = (odometry.x - previous.x).abs();
        let dy = (odometry.y - previous.y).abs();
        let dtheta = wrap_to_pi(odometry.theta - previous.theta).abs();
        if dx > self.distance_threshold || dy > self.distance_threshold || dtheta > self.angle_threshold {
            GateDecision::Update { previous }
        } else {
            GateDecision::Hold
        }
    }
    pub fn set_baseline(&mut self, odometry: Pose2D) {
        self.baseline = Some(odometry);
    }
    pub fn baseline(&self) -> Option<Pose2D> {
        self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FRAC_PI_12: f64 = PI / 12.0;

    fn gate_at_origin() -> UpdateGate {
        let mut gate = UpdateGate::new(0.1, FRAC_PI_12);
        gate.set_baseline(Pose2D::identity());
        gate
    }

    #[test]
    fn test_first_scan_initializes() {
        let gate = UpdateGate::new(0.1, FRAC_PI_12);
        assert_eq!(gate.evaluate(&Pose2D::new(5.0, 5.0, 1.0)), GateDecision::Initialize);
    }
    #[test]
    fn test_distance_threshold() {
        let gate = gate_at_origin();
        assert_eq!(gate.evaluate(&Pose2D::new(0.05, 0.0, 0.0)), GateDecision::Hold);
        assert_eq!(
            gate.evaluate(&Pose2D::new(0.15, 0.0, 0.0)),
            GateDecision::Update {
                previous: Pose2D::identity()
            }
        );
        assert!(matches!(
            gate.evaluate(&Pose2D::new(0.0, -0.15, 0.0)),
            GateDecision::Update { .. }
        ));
    }
    #[test]
    fn test_thresholds_are_per_axis() {
        // 0.09 on each axis is ~0.127 in Euclidean distance
        let gate = gate_at_origin();
        assert_eq!(gate.evaluate(&Pose2D::new(0.09, 0.09, 0.0)), GateDecision::Hold);
    }
    #[test]
    fn test_angle_threshold() {
        let gate = gate_at_origin();
        assert_eq!(gate.evaluate(&Pose2D::new(0.0, 0.0, 0.2)), GateDecision::Hold);
        assert!(matches!(
            gate.evaluate(&Pose2D::new(0.0, 0.0, -0.3)),
            GateDecision::Update { .. }
        ));
    }
    #[test]
    fn test_heading_difference_is_wrapped() {
        let mut gate = UpdateGate::new(0.1, FRAC_PI_12);
        gate.set_baseline(Pose2D::new(0.0, 0.0, PI - 0.01));
        assert_eq!(gate.evaluate(&Pose2D::new(0.0, 0.0, -PI + 0.01)), GateDecision::Hold);
    }
    #[test]
    fn test_baseline_moves_only_when_set() {
        let mut gate = gate_at_origin();
        let odom = Pose2D::new(0.15, 0.0, 0.0);
        assert!(matches!(gate.evaluate(&odom), GateDecision::Update { .. }));
        assert!(matches!(gate.evaluate(&odom), GateDecision::Update { .. }));
        gate.set_baseline(odom);
        assert_eq!(gate.evaluate(&odom), GateDecision::Hold);
        assert_eq!(gate.baseline(), Some(odom));
    }
}
