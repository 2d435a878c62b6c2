//! Coordinate transforms between the map, odometry, and robot frames.
//!
//! The localizer never publishes its pose estimate directly. It publishes the `map -> odom` correction, the
//! pose of the odometry origin in the map frame, so that `map -> odom -> base` always composes to the current
//! best estimate of the robot pose.
use crate::Pose2D;
use crate::error::TransformError;

use chrono::{DateTime, Duration, Utc};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Names of the three frames the localizer works with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub map_frame: String,
    pub odom_frame: String,
    pub base_frame: String,
}
impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            map_frame: "map".to_string(),
            odom_frame: "odom".to_string(),
            base_frame: "base_link".to_string(),
        }
    }
}

/// Lookup of planar transforms between named frames.
pub trait TransformProvider {
    /// Whether a transform taking poses from `source` to `target` is available at `stamp`.
    fn can_transform(&self, target: &str, source: &str, stamp: DateTime<Utc>) -> bool;

    /// Wait at most `timeout_s` seconds for the transform to become available. The default answers
    /// immediately from [`can_transform`](Self::can_transform), which suits in-memory providers that never
    /// receive data asynchronously.
    fn wait_for_transform(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
        _timeout_s: f64,
    ) -> bool {
        self.can_transform(target, source, stamp)
    }

    /// Re-express `pose`, given in `source`, in `target`.
    fn transform_pose(
        &self,
        pose: &Pose2D,
        source: &str,
        target: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Pose2D, TransformError>;
}

#[derive(Clone, Debug)]
struct Edge {
    parent: String,
    /// Pose of the child frame in the parent frame.
    pose: Pose2D,
    stamp: DateTime<Utc>,
    is_static: bool,
}

/// In-memory transform tree keeping only the latest transform per child frame.
///
/// Each frame has at most one parent. Lookups walk both frames up to their common root, so direct, inverse,
/// and multi-hop chains resolve alike. Requested stamps are not interpolated; the latest edge is used as
/// long as it is static or no older than the configured maximum age.
#[derive(Clone, Debug, Default)]
pub struct TransformBuffer {
    edges: HashMap<String, Edge>,
    max_age: Option<Duration>,
}
impl TransformBuffer {
    pub fn new() -> Self {
        TransformBuffer::default()
    }
    /// Reject dynamic transforms older than `max_age` relative to the requested stamp.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
    /// Record the pose of `child` in `parent` at `stamp`, replacing any earlier transform for `child`.
    pub fn set_transform(&mut self, parent: &str, child: &str, pose: Pose2D, stamp: DateTime<Utc>) {
        self.insert(parent, child, pose, stamp, false);
    }
    /// Record a transform that never goes stale, such as a sensor mount.
    pub fn set_static_transform(&mut self, parent: &str, child: &str, pose: Pose2D) {
        self.insert(parent, child, pose, DateTime::<Utc>::MIN_UTC, true);
    }
    /// Record a broadcast correction.
    pub fn apply(&mut self, transform: &TransformStamped) {
        self.set_transform(
            &transform.parent_frame,
            &transform.child_frame,
            transform.pose(),
            transform.stamp,
        );
    }
    fn insert(&mut self, parent: &str, child: &str, pose: Pose2D, stamp: DateTime<Utc>, is_static: bool) {
        self.edges.insert(
            child.to_string(),
            Edge {
                parent: parent.to_string(),
                pose,
                stamp,
                is_static,
            },
        );
    }
    fn is_known(&self, frame: &str) -> bool {
        self.edges.contains_key(frame) || self.edges.values().any(|e| e.parent == frame)
    }
    /// Chain from `frame` to its root. Each entry holds an ancestor, the pose of `frame` in it, and whether
    /// every edge traversed so far is fresh at `stamp`.
    fn chain_to_root(
        &self,
        frame: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Vec<(String, Pose2D, bool)>, TransformError> {
        let mut chain = vec![(frame.to_string(), Pose2D::identity(), true)];
        let mut current = frame;
        let mut accumulated = Pose2D::identity();
        let mut fresh = true;
        while let Some(edge) = self.edges.get(current) {
            accumulated = edge.pose.compose(&accumulated);
            fresh &= self.is_fresh(edge, stamp);
            chain.push((edge.parent.clone(), accumulated, fresh));
            if chain.len() > self.edges.len() + 1 {
                return Err(TransformError::UnknownFrame(frame.to_string()));
            }
            current = &edge.parent;
        }
        Ok(chain)
    }
    fn is_fresh(&self, edge: &Edge, stamp: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) if !edge.is_static => stamp - edge.stamp <= max_age,
            _ => true,
        }
    }
    /// Pose of `source` in `target`, resolved through their nearest common ancestor.
    pub fn lookup(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Pose2D, TransformError> {
        for frame in [target, source] {
            if !self.is_known(frame) {
                return Err(TransformError::UnknownFrame(frame.to_string()));
            }
        }
        let unavailable = || TransformError::Unavailable {
            target: target.to_string(),
            source_frame: source.to_string(),
        };
        let source_chain = self.chain_to_root(source, stamp)?;
        let target_chain = self.chain_to_root(target, stamp)?;
        for (ancestor, source_in_ancestor, source_fresh) in &source_chain {
            if let Some((_, target_in_ancestor, target_fresh)) =
                target_chain.iter().find(|(name, _, _)| name == ancestor)
            {
                if !(*source_fresh && *target_fresh) {
                    return Err(unavailable());
                }
                return Ok(target_in_ancestor.inverse().compose(source_in_ancestor));
            }
        }
        Err(unavailable())
    }
}
impl TransformProvider for TransformBuffer {
    fn can_transform(&self, target: &str, source: &str, stamp: DateTime<Utc>) -> bool {
        self.lookup(target, source, stamp).is_ok()
    }
    fn transform_pose(
        &self,
        pose: &Pose2D,
        source: &str,
        target: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Pose2D, TransformError> {
        Ok(self.lookup(target, source, stamp)?.compose(pose))
    }
}

/// A transform ready to broadcast: the pose of `child_frame` in `parent_frame`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformStamped {
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub stamp: DateTime<Utc>,
    pub child_frame: String,
    pub parent_frame: String,
}
impl TransformStamped {
    pub fn from_pose(pose: &Pose2D, stamp: DateTime<Utc>, child_frame: &str, parent_frame: &str) -> Self {
        TransformStamped {
            translation: Vector3::new(pose.x, pose.y, 0.0),
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, pose.theta),
            stamp,
            child_frame: child_frame.to_string(),
            parent_frame: parent_frame.to_string(),
        }
    }
    /// Planar pose, keeping only the yaw of the rotation.
    pub fn pose(&self) -> Pose2D {
        let (_, _, yaw) = self.rotation.euler_angles();
        Pose2D::new(self.translation.x, self.translation.y, yaw)
    }
}

/// Maintains the `map -> odom` correction.
#[derive(Clone, Debug)]
pub struct TransformCorrector {
    frames: FrameConfig,
    timeout_s: f64,
    correction: Option<Pose2D>,
}
impl TransformCorrector {
    pub fn new(frames: FrameConfig, timeout_s: f64) -> Self {
        TransformCorrector {
            frames,
            timeout_s,
            correction: None,
        }
    }
    pub fn frames(&self) -> &FrameConfig {
        &self.frames
    }
    /// Compute the correction implied by `estimate` (robot pose in the map frame) at `stamp`.
    ///
    /// The map origin is expressed in the robot frame by inverting the estimate, moved into the odometry
    /// frame through the provider, and inverted again to give the odometry origin in the map frame. Nothing
    /// is stored; see [`TransformCorrector::commit`].
    pub fn compute<P: TransformProvider + ?Sized>(
        &self,
        estimate: &Pose2D,
        stamp: DateTime<Utc>,
        provider: &P,
    ) -> Result<Pose2D, TransformError> {
        let FrameConfig {
            odom_frame,
            base_frame,
            ..
        } = &self.frames;
        if !provider.wait_for_transform(odom_frame, base_frame, stamp, self.timeout_s) {
            return Err(TransformError::Timeout {
                target: odom_frame.clone(),
                source_frame: base_frame.clone(),
                timeout_s: self.timeout_s,
            });
        }
        let map_in_base = estimate.inverse();
        let map_in_odom = provider.transform_pose(&map_in_base, base_frame, odom_frame, stamp)?;
        Ok(map_in_odom.inverse())
    }
    pub fn commit(&mut self, correction: Pose2D) {
        self.correction = Some(correction);
    }
    pub fn correction(&self) -> Option<Pose2D> {
        self.correction
    }
    /// The last committed correction stamped with `now`, or `None` before the first one.
    pub fn broadcast(&self, now: DateTime<Utc>) -> Option<TransformStamped> {
        self.correction.map(|correction| {
            TransformStamped::from_pose(&correction, now, &self.frames.odom_frame, &self.frames.map_frame)
        })
    }
}
