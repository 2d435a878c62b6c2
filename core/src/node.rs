//! Live localizer node.
//!
//! The node owns a [`Localizer`], the transform tree it consults, and an output [`Publisher`]. It runs on its
//! own thread and is driven entirely by channels: incoming [`Event`]s (scans with their odometry and pose
//! overrides) and an internal broadcast ticker at the configured rate. All state transitions happen on the
//! node's thread, one message at a time.
use crate::error::LocalizationError;
use crate::localizer::Localizer;
use crate::messages::{Event, Publisher, process_event};
use crate::sensor::DistanceField;
use crate::sim::LocalizationResult;
use crate::transform::TransformBuffer;

use chrono::Utc;
use crossbeam_channel::{Receiver, select, tick};
use log::{debug, error, info};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Counters reported when the node stops.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStats {
    pub events: u64,
    pub ticks: u64,
    pub published_results: u64,
    /// Updates discarded because the particle weights degenerated.
    pub failed_updates: u64,
}

pub struct LocalizerNode<F: DistanceField, P: Publisher> {
    localizer: Localizer<F>,
    buffer: TransformBuffer,
    publisher: P,
    last_result: Option<LocalizationResult>,
    stats: NodeStats,
}

impl<F: DistanceField, P: Publisher> LocalizerNode<F, P> {
    /// `buffer` should already hold the static transform from the robot frame to the laser frame.
    pub fn new(localizer: Localizer<F>, buffer: TransformBuffer, publisher: P) -> Self {
        LocalizerNode {
            localizer,
            buffer,
            publisher,
            last_result: None,
            stats: NodeStats::default(),
        }
    }
    pub fn localizer(&self) -> &Localizer<F> {
        &self.localizer
    }
    pub fn buffer(&self) -> &TransformBuffer {
        &self.buffer
    }
    pub fn publisher(&self) -> &P {
        &self.publisher
    }
    /// Pose of the robot in the map frame after the last handled scan.
    pub fn last_result(&self) -> Option<&LocalizationResult> {
        self.last_result.as_ref()
    }
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Handle one event. A degenerate update is logged and dropped; the node keeps its previous state.
    pub fn handle(&mut self, event: Event) {
        if matches!(event, Event::Tick { .. }) {
            self.stats.ticks += 1;
        } else {
            self.stats.events += 1;
        }
        match process_event(&mut self.localizer, &mut self.buffer, event, &mut self.publisher) {
            Ok(Some(result)) => {
                self.stats.published_results += 1;
                self.last_result = Some(result);
            }
            Ok(None) => {}
            Err(e @ LocalizationError::DegenerateWeights { .. }) => {
                self.stats.failed_updates += 1;
                error!("Dropping update: {e}");
            }
            Err(e) => error!("Event failed: {e}"),
        }
    }

    /// Run until `running` is cleared or the event channel disconnects, then return the node.
    ///
    /// The broadcast ticker also bounds how long a stop request can go unnoticed.
    pub fn run(mut self, events: Receiver<Event>, running: Arc<AtomicBool>) -> Self {
        let ticker = tick(self.localizer.config().broadcast_period());
        info!(
            "Localizer node running, broadcasting every {:?}",
            self.localizer.config().broadcast_period()
        );
        while running.load(Ordering::Relaxed) {
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle(event),
                    Err(_) => {
                        debug!("Event channel disconnected");
                        break;
                    }
                },
                recv(ticker) -> _ => self.handle(Event::Tick { stamp: Utc::now() }),
            }
        }
        info!("Localizer node stopped: {:?}", self.stats);
        self
    }
}

impl<F, P> LocalizerNode<F, P>
where
    F: DistanceField + 'static,
    P: Publisher + Send + 'static,
{
    /// Start [`run`](Self::run) on a named thread. The handle yields the node back when it stops.
    pub fn spawn(
        self,
        events: Receiver<Event>,
        running: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<Self>> {
        thread::Builder::new()
            .name("localizer".into())
            .spawn(move || self.run(events, running))
    }
}
