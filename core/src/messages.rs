//! Events consumed by the localizer and the outputs it produces.
//!
//! The localizer reacts to three kinds of input: laser scans, external pose overrides, and a fixed-rate
//! broadcast tick. For offline replay those inputs are represented as an ordered [`EventStream`] and
//! processed by [`run_event_stream`], which plays the role of the transform tree and the output transport.
use crate::Pose2D;
use crate::error::LocalizationError;
use crate::localizer::{Localizer, ScanOutcome};
use crate::sensor::{DistanceField, LaserScan};
use crate::sim::{LocalizationResult, ScanRecord};
use crate::transform::{TransformBuffer, TransformStamped};

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::Sender;
use log::{debug, warn};

/// The particle poses published after every handled scan.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseArray {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub poses: Vec<Pose2D>,
}
impl PoseArray {
    pub fn new(stamp: DateTime<Utc>, frame_id: &str, poses: Vec<Pose2D>) -> Self {
        PoseArray {
            stamp,
            frame_id: frame_id.to_string(),
            poses,
        }
    }
}

/// Output transport for the particle cloud and the `map -> odom` correction.
pub trait Publisher {
    fn publish_cloud(&mut self, cloud: &PoseArray);
    fn send_transform(&mut self, transform: &TransformStamped);
}

/// Keeps everything it is given, in order.
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    pub clouds: Vec<PoseArray>,
    pub transforms: Vec<TransformStamped>,
}
impl Publisher for RecordingPublisher {
    fn publish_cloud(&mut self, cloud: &PoseArray) {
        self.clouds.push(cloud.clone());
    }
    fn send_transform(&mut self, transform: &TransformStamped) {
        self.transforms.push(transform.clone());
    }
}

/// Forwards outputs over channels. Sends to a disconnected receiver are dropped with a warning.
#[derive(Clone, Debug)]
pub struct ChannelPublisher {
    pub clouds: Sender<PoseArray>,
    pub transforms: Sender<TransformStamped>,
}
impl Publisher for ChannelPublisher {
    fn publish_cloud(&mut self, cloud: &PoseArray) {
        if self.clouds.send(cloud.clone()).is_err() {
            warn!("Particle cloud receiver disconnected");
        }
    }
    fn send_transform(&mut self, transform: &TransformStamped) {
        if self.transforms.send(transform.clone()).is_err() {
            warn!("Transform receiver disconnected");
        }
    }
}

/// A single input to the localizer.
///
/// ## Variants
///
/// - `Scan`: a laser scan. When `odometry` is present it is the robot's odometry pose at the scan stamp and
///   is recorded in the transform tree before the scan is handled.
/// - `InitialPose`: an external pose estimate in the map frame that resets the particle cloud.
/// - `Tick`: the fixed-rate broadcast timer.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Scan {
        scan: LaserScan,
        odometry: Option<Pose2D>,
    },
    InitialPose {
        pose: Pose2D,
        stamp: DateTime<Utc>,
    },
    Tick {
        stamp: DateTime<Utc>,
    },
}
impl Event {
    pub fn stamp(&self) -> DateTime<Utc> {
        match self {
            Event::Scan { scan, .. } => scan.stamp,
            Event::InitialPose { stamp, .. } | Event::Tick { stamp } => *stamp,
        }
    }
}

pub struct EventStream {
    pub start_time: DateTime<Utc>,
    pub events: Vec<Event>,
}

/// Turn recorded scans into a time-ordered event stream.
///
/// An optional `initial_pose` is delivered first, stamped with the first record's time. Broadcast ticks are
/// interleaved every `1 / broadcast_rate_hz` seconds from the first record on, each placed before any scan
/// recorded at the same time or later. An empty record slice yields an empty stream.
pub fn build_event_stream(
    records: &[ScanRecord],
    frame_id: &str,
    broadcast_rate_hz: f64,
    initial_pose: Option<Pose2D>,
) -> EventStream {
    let Some(first) = records.first() else {
        return EventStream {
            start_time: Utc::now(),
            events: Vec::new(),
        };
    };
    let start_time = first.time;
    let mut events = Vec::with_capacity(records.len() * 2 + 1);
    if let Some(pose) = initial_pose {
        events.push(Event::InitialPose {
            pose,
            stamp: start_time,
        });
    }
    let tick_period = if broadcast_rate_hz > 0.0 && broadcast_rate_hz.is_finite() {
        Some(Duration::microseconds((1e6 / broadcast_rate_hz).round() as i64))
    } else {
        None
    };
    let mut next_tick = start_time;
    for record in records {
        if let Some(period) = tick_period {
            while next_tick <= record.time {
                events.push(Event::Tick { stamp: next_tick });
                next_tick += period;
            }
        }
        events.push(Event::Scan {
            scan: record.to_scan(frame_id),
            odometry: Some(record.odometry()),
        });
    }
    EventStream { start_time, events }
}

/// Apply a single event to the localizer.
///
/// A scan carrying odometry first records the `odom -> base` transform in `buffer`. A handled scan publishes
/// the particle cloud and yields the resulting [`LocalizationResult`]. A scan held by the update gate and every
/// tick send the current correction, if any, and record it in `buffer`. Only invariant failures of the filter
/// are returned as errors.
pub fn process_event<F, P>(
    localizer: &mut Localizer<F>,
    buffer: &mut TransformBuffer,
    event: Event,
    publisher: &mut P,
) -> Result<Option<LocalizationResult>, LocalizationError>
where
    F: DistanceField,
    P: Publisher + ?Sized,
{
    let frames = &localizer.config().frames;
    match event {
        Event::Scan { scan, odometry } => {
            if let Some(odometry) = odometry {
                buffer.set_transform(&frames.odom_frame, &frames.base_frame, odometry, scan.stamp);
            }
            let map_frame = frames.map_frame.clone();
            let outcome = localizer.handle_scan(&scan, &*buffer)?;
            if !outcome.is_handled() {
                debug!("Scan at {} not used: {:?}", scan.stamp, outcome);
                return Ok(None);
            }
            publisher.publish_cloud(&PoseArray::new(
                scan.stamp,
                &map_frame,
                localizer.particle_poses(),
            ));
            if outcome == ScanOutcome::Held {
                send_correction(localizer, buffer, publisher, scan.stamp);
            }
            let (Some(correction), Some(odometry)) = (localizer.correction(), odometry) else {
                return Ok(None);
            };
            let pose = correction.compose(&odometry);
            let updated = outcome == ScanOutcome::Updated;
            Ok(Some(LocalizationResult {
                time: scan.stamp,
                x: pose.x,
                y: pose.y,
                theta: pose.theta,
                effective_sample_size: if updated {
                    localizer.diagnostics().effective_sample_size
                } else {
                    0.0
                },
                updated,
            }))
        }
        Event::InitialPose { pose, stamp } => {
            localizer.handle_initial_pose(&pose, stamp, &*buffer)?;
            Ok(None)
        }
        Event::Tick { stamp } => {
            send_correction(localizer, buffer, publisher, stamp);
            Ok(None)
        }
    }
}

fn send_correction<F, P>(
    localizer: &Localizer<F>,
    buffer: &mut TransformBuffer,
    publisher: &mut P,
    stamp: DateTime<Utc>,
) where
    F: DistanceField,
    P: Publisher + ?Sized,
{
    if let Some(transform) = localizer.broadcast(stamp) {
        buffer.apply(&transform);
        publisher.send_transform(&transform);
    }
}

/// Process `stream` in order with [`process_event`], collecting one result per handled scan. An invariant
/// failure in the filter aborts the replay.
pub fn run_event_stream<F, P>(
    localizer: &mut Localizer<F>,
    buffer: &mut TransformBuffer,
    stream: EventStream,
    publisher: &mut P,
) -> Result<Vec<LocalizationResult>, LocalizationError>
where
    F: DistanceField,
    P: Publisher + ?Sized,
{
    let mut results = Vec::new();
    for event in stream.events {
        if let Some(result) = process_event(localizer, buffer, event, publisher)? {
            results.push(result);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalizerConfig;
    use chrono::TimeZone;
    use crate::transform::TransformProvider;

    struct ConstantField;
    impl DistanceField for ConstantField {
        fn distance_to_nearest_obstacle(&self, _x: f64, _y: f64) -> Option<f64> {
            Some(0.5)
        }
    }

    fn records(odometry: &[(f64, f64, f64)], interval_ms: i64) -> Vec<ScanRecord> {
        let base_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        odometry
            .iter()
            .enumerate()
            .map(|(i, &(x, y, theta))| ScanRecord {
                time: base_time + Duration::milliseconds(interval_ms * i as i64),
                odom_x: x,
                odom_y: y,
                odom_theta: theta,
                truth_x: None,
                truth_y: None,
                truth_theta: None,
                ranges: vec![1.0; 360],
            })
            .collect()
    }
    fn localizer() -> Localizer<ConstantField> {
        let config = LocalizerConfig {
            num_particles: 20,
            seed: Some(9),
            ..Default::default()
        };
        Localizer::new(config, ConstantField).unwrap()
    }
    fn laser_buffer() -> TransformBuffer {
        let mut buffer = TransformBuffer::new();
        buffer.set_static_transform("base_link", "laser", Pose2D::identity());
        buffer
    }

    #[test]
    fn test_event_stream_orders_ticks_before_scans() {
        let records = records(&[(0.0, 0.0, 0.0), (0.1, 0.0, 0.0), (0.2, 0.0, 0.0)], 300);
        let stream = build_event_stream(&records, "laser", 5.0, Some(Pose2D::new(1.0, 1.0, 0.0)));
        assert_eq!(stream.start_time, records[0].time);
        let kinds: Vec<&str> = stream
            .events
            .iter()
            .map(|e| match e {
                Event::Scan { .. } => "scan",
                Event::InitialPose { .. } => "pose",
                Event::Tick { .. } => "tick",
            })
            .collect();
        // ticks at 0, 200, 400, 600 ms; scans at 0, 300, 600 ms
        assert_eq!(
            kinds,
            ["pose", "tick", "scan", "tick", "scan", "tick", "tick", "scan"]
        );
        assert!(
            stream
                .events
                .windows(2)
                .all(|w| w[0].stamp() <= w[1].stamp())
        );
    }
    #[test]
    fn test_empty_records() {
        let stream = build_event_stream(&[], "laser", 5.0, None);
        assert!(stream.events.is_empty());
    }
    #[test]
    fn test_replay_publishes_cloud_and_transforms() {
        let records = records(
            &[(0.0, 0.0, 0.0), (0.05, 0.0, 0.0), (0.2, 0.0, 0.0), (0.4, 0.0, 0.1)],
            200,
        );
        let stream = build_event_stream(&records, "laser", 5.0, None);
        let mut localizer = localizer();
        let mut buffer = laser_buffer();
        let mut publisher = RecordingPublisher::default();
        let results =
            run_event_stream(&mut localizer, &mut buffer, stream, &mut publisher).unwrap();

        assert_eq!(publisher.clouds.len(), 4);
        assert!(publisher.clouds.iter().all(|c| c.poses.len() == 20 && c.frame_id == "map"));
        // three ticks after the first correction plus the held scan
        assert_eq!(publisher.transforms.len(), 4);
        assert!(
            publisher
                .transforms
                .iter()
                .all(|t| t.parent_frame == "map" && t.child_frame == "odom")
        );
        let updated: Vec<bool> = results.iter().map(|r| r.updated).collect();
        assert_eq!(updated, [false, false, true, true]);
        assert_eq!(localizer.diagnostics().cycles_held, 1);
        assert!(buffer.can_transform("map", "base_link", records[3].time));
    }
    #[test]
    fn test_held_scan_reissues_correction() {
        let records = records(&[(0.0, 0.0, 0.0), (0.05, 0.0, 0.0)], 200);
        let mut localizer = localizer();
        let mut buffer = laser_buffer();
        let mut publisher = RecordingPublisher::default();
        for record in &records {
            let event = Event::Scan {
                scan: record.to_scan("laser"),
                odometry: Some(record.odometry()),
            };
            process_event(&mut localizer, &mut buffer, event, &mut publisher).unwrap();
        }
        assert_eq!(localizer.diagnostics().cycles_held, 1);
        assert_eq!(publisher.clouds.len(), 2);
        assert_eq!(publisher.transforms.len(), 1);
        let sent = &publisher.transforms[0];
        assert_eq!(sent.stamp, records[1].time);
        let correction = localizer.correction().unwrap();
        assert!((sent.pose().x - correction.x).abs() < 1e-9);
        assert!((sent.pose().y - correction.y).abs() < 1e-9);
        assert!(crate::wrap_to_pi(sent.pose().theta - correction.theta).abs() < 1e-9);
    }
    #[test]
    fn test_scan_without_transforms_is_not_published() {
        let records = records(&[(0.0, 0.0, 0.0)], 200);
        let stream = build_event_stream(&records, "lidar", 5.0, None);
        let mut localizer = localizer();
        let mut buffer = laser_buffer();
        let mut publisher = RecordingPublisher::default();
        let results =
            run_event_stream(&mut localizer, &mut buffer, stream, &mut publisher).unwrap();
        assert!(results.is_empty());
        assert!(publisher.clouds.is_empty());
        assert!(publisher.transforms.is_empty());
    }
    #[test]
    fn test_channel_publisher() {
        let (cloud_tx, cloud_rx) = crossbeam_channel::unbounded();
        let (tf_tx, tf_rx) = crossbeam_channel::unbounded();
        let mut publisher = ChannelPublisher {
            clouds: cloud_tx,
            transforms: tf_tx,
        };
        let now = Utc::now();
        publisher.publish_cloud(&PoseArray::new(now, "map", vec![Pose2D::identity()]));
        publisher.send_transform(&TransformStamped::from_pose(&Pose2D::identity(), now, "odom", "map"));
        assert_eq!(cloud_rx.try_recv().unwrap().poses.len(), 1);
        assert_eq!(tf_rx.try_recv().unwrap().stamp, now);
        drop(cloud_rx);
        publisher.publish_cloud(&PoseArray::new(now, "map", vec![]));
    }
}
