//! Perception feed: the three asynchronous sensor channels a visual-servo
//! controller consumes.
//!
//! | Channel | Transport | Semantics |
//! |---|---|---|
//! | centroid | [`tokio::sync::broadcast`] | every sample is delivered; slow consumers skip lagged samples |
//! | range | [`tokio::sync::watch`] | latched latest reading |
//! | intrinsics | [`tokio::sync::watch`] | latched, taken once per subscription |
//!
//! A producer (the vision pipeline, a driver bridge or a simulator) holds a
//! [`PerceptionFeed`] and publishes into it.  Each consumer calls
//! [`PerceptionFeed::subscribe`] and pulls one [`PerceptionSample`] at a time
//! from the returned [`PerceptionReceiver`], which serialises all three
//! channels into a single ordered stream.

use std::sync::Arc;

use servostack_types::{CameraIntrinsics, CentroidSample, RangeSample};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Default number of centroid samples buffered per subscriber.
const DEFAULT_CAPACITY: usize = 64;

/// One sample from any of the perception channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PerceptionSample {
    Centroid(CentroidSample),
    Range(RangeSample),
    Intrinsics(CameraIntrinsics),
}

/// Producer side of the perception channels.  Clone it cheaply; all clones
/// share the same channels.
#[derive(Clone, Debug)]
pub struct PerceptionFeed {
    centroids: broadcast::Sender<CentroidSample>,
    ranges: Arc<watch::Sender<Option<RangeSample>>>,
    intrinsics: Arc<watch::Sender<Option<CameraIntrinsics>>>,
}

impl PerceptionFeed {
    /// Create a feed buffering up to `capacity` centroid samples per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (centroids, _) = broadcast::channel(capacity);
        let (ranges, _) = watch::channel(None);
        let (intrinsics, _) = watch::channel(None);
        Self {
            centroids,
            ranges: Arc::new(ranges),
            intrinsics: Arc::new(intrinsics),
        }
    }

    /// Publish a centroid sample.
    ///
    /// Returns the number of subscribers that were handed the sample; `0`
    /// when nobody is listening, which is a normal condition for a sensor.
    pub fn publish_centroid(&self, sample: CentroidSample) -> usize {
        self.centroids.send(sample).unwrap_or(0)
    }

    /// Latch a new proximity reading.
    pub fn publish_range(&self, sample: RangeSample) {
        self.ranges.send_replace(Some(sample));
    }

    /// Latch the camera intrinsics.
    pub fn publish_intrinsics(&self, intrinsics: CameraIntrinsics) {
        self.intrinsics.send_replace(Some(intrinsics));
    }

    /// Open a new consumer.  Latched values already present (range,
    /// intrinsics) are delivered first.
    pub fn subscribe(&self) -> PerceptionReceiver {
        let mut ranges = self.ranges.subscribe();
        ranges.mark_changed();
        let mut intrinsics = self.intrinsics.subscribe();
        intrinsics.mark_changed();
        PerceptionReceiver {
            centroids: self.centroids.subscribe(),
            ranges: Some(ranges),
            intrinsics: Some(intrinsics),
        }
    }
}

impl Default for PerceptionFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Single-consumer view of a [`PerceptionFeed`].
///
/// The intrinsics receiver is dropped after the first intrinsics sample, so
/// each subscription observes them at most once.
pub struct PerceptionReceiver {
    centroids: broadcast::Receiver<CentroidSample>,
    ranges: Option<watch::Receiver<Option<RangeSample>>>,
    intrinsics: Option<watch::Receiver<Option<CameraIntrinsics>>>,
}

impl PerceptionReceiver {
    /// Wait for the next sample on any channel.
    ///
    /// Returns `None` once the centroid channel is closed; the latched
    /// channels closing on their own only stops their updates.
    pub async fn next(&mut self) -> Option<PerceptionSample> {
        loop {
            tokio::select! {
                biased;

                latched = next_latched(&mut self.intrinsics) => match latched {
                    Some(Some(intrinsics)) => {
                        debug!("camera intrinsics received; closing intrinsics channel");
                        self.intrinsics = None;
                        return Some(PerceptionSample::Intrinsics(intrinsics));
                    }
                    Some(None) => continue,
                    None => self.intrinsics = None,
                },

                latched = next_latched(&mut self.ranges) => match latched {
                    Some(Some(range)) => return Some(PerceptionSample::Range(range)),
                    Some(None) => continue,
                    None => self.ranges = None,
                },

                received = self.centroids.recv() => match received {
                    Ok(sample) => return Some(PerceptionSample::Centroid(sample)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "centroid consumer lagged; skipping stale samples");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// Resolve with the next value of a latched channel, `None` when its sender
/// is gone, or never when the slot is already empty.
async fn next_latched<T: Copy>(slot: &mut Option<watch::Receiver<Option<T>>>) -> Option<Option<T>> {
    let Some(rx) = slot.as_mut() else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(*rx.borrow_and_update()),
        Err(_) => None,
    }
}
