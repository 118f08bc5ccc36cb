//! Headless, typed, topic-based scene bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every record without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Direction | Typical traffic |
//! |---|---|---|
//! | [`Topic::TrackedObjects`] | inbound | Batches of objects reported by the tracker |
//! | [`Topic::CollisionObjects`] | outbound | One [`CollisionObject`] per record, `ADD` or `REMOVE` |
//! | [`Topic::AttachedObjects`] | outbound | [`AttachedCollisionObject`] grasp and release records |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servostack_types::{AttachedCollisionObject, CollisionObject, StackError};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the [`SceneBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Object batches from the perception-side tracker.
    TrackedObjects,
    /// Collision-scene records for the motion planner's world model.
    CollisionObjects,
    /// Objects bound to (or released from) a gripper link.
    AttachedObjects,
}

/// What a [`SceneEvent`] carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ScenePayload {
    ObjectBatch(Vec<CollisionObject>),
    CollisionObject(CollisionObject),
    AttachedCollisionObject(AttachedCollisionObject),
}

/// Envelope for everything travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event, e.g. `"servostack-runtime::registry"`.
    pub source: String,
    pub payload: ScenePayload,
}

impl SceneEvent {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: ScenePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    /// The lane this event belongs on.
    pub fn topic(&self) -> Topic {
        match self.payload {
            ScenePayload::ObjectBatch(_) => Topic::TrackedObjects,
            ScenePayload::CollisionObject(_) => Topic::CollisionObjects,
            ScenePayload::AttachedCollisionObject(_) => Topic::AttachedObjects,
        }
    }

    /// Single-line JSON rendering, used by scene monitors and log sinks.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Channel`] if the payload cannot be serialised.
    pub fn to_json(&self) -> Result<String, StackError> {
        serde_json::to_string(self)
            .map_err(|e| StackError::Channel(format!("scene event serialisation failed: {e}")))
    }
}

/// Shared scene bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct SceneBus {
    tracked_objects: broadcast::Sender<SceneEvent>,
    collision_objects: broadcast::Sender<SceneEvent>,
    attached_objects: broadcast::Sender<SceneEvent>,
}

impl SceneBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (tracked_objects, _) = broadcast::channel(capacity);
        let (collision_objects, _) = broadcast::channel(capacity);
        let (attached_objects, _) = broadcast::channel(capacity);
        Self {
            tracked_objects,
            collision_objects,
            attached_objects,
        }
    }

    /// Publish `event` on the lane its payload belongs to.
    ///
    /// Returns the number of active receivers that were handed the event.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Channel`] when nobody is subscribed to the
    /// topic, so a publisher can tell a dropped record from a delivered one.
    pub fn publish(&self, event: SceneEvent) -> Result<usize, StackError> {
        let topic = event.topic();
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| StackError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<SceneEvent> {
        match topic {
            Topic::TrackedObjects => &self.tracked_objects,
            Topic::CollisionObjects => &self.collision_objects,
            Topic::AttachedObjects => &self.attached_objects,
        }
    }
}

impl Default for SceneBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`SceneBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<SceneEvent>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Lagged receivers log and skip ahead.  Returns `None` once the bus has
    /// shut down.
    pub async fn recv(&mut self) -> Option<SceneEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "scene subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    ///
    /// Returns `None` when nothing is queued (or the bus is closed).
    pub fn try_recv(&mut self) -> Option<SceneEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "scene subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servostack_types::{Geometry, Pose, Side};
    use std::time::Duration;

    fn cube(id: &str) -> CollisionObject {
        CollisionObject::new(
            id,
            Geometry::Box {
                dimensions: [0.05, 0.05, 0.05],
            },
            Pose::default(),
        )
    }

    fn record(id: &str) -> SceneEvent {
        SceneEvent::new("test", ScenePayload::CollisionObject(cube(id)))
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SceneBus::default();
        let mut collisions = bus.subscribe_to(Topic::CollisionObjects);
        let mut attached = bus.subscribe_to(Topic::AttachedObjects);

        let event = record("cube_1");
        bus.publish(event.clone())?;
        let grasp = SceneEvent::new(
            "test",
            ScenePayload::AttachedCollisionObject(AttachedCollisionObject::for_side(
                cube("cube_1"),
                Side::Left,
            )),
        );
        bus.publish(grasp.clone())?;

        assert_eq!(collisions.recv().await.ok_or("closed")?.id, event.id);
        assert_eq!(attached.recv().await.ok_or("closed")?.id, grasp.id);
        assert!(collisions.try_recv().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SceneBus::default();
        let mut rx1 = bus.subscribe_to(Topic::TrackedObjects);
        let mut rx2 = bus.subscribe_to(Topic::TrackedObjects);

        let batch = SceneEvent::new(
            "tracker",
            ScenePayload::ObjectBatch(vec![cube("a"), cube("b")]),
        );
        assert_eq!(bus.publish(batch.clone())?, 2);

        assert_eq!(rx1.recv().await.ok_or("closed")?, batch);
        assert_eq!(rx2.recv().await.ok_or("closed")?, batch);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = SceneBus::default();
        assert!(matches!(
            bus.publish(record("ghost")),
            Err(StackError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn other_topics_stay_quiet() {
        let bus = SceneBus::default();
        let mut attached = bus.subscribe_to(Topic::AttachedObjects);
        let _collisions = bus.subscribe_to(Topic::CollisionObjects);

        bus.publish(record("cube_1")).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), attached.recv()).await;
        assert!(result.is_err(), "attached lane must not see collision records");
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let bus = SceneBus::new(4);
        let mut slow = bus.subscribe_to(Topic::CollisionObjects);
        for i in 0..32 {
            bus.publish(record(&format!("cube_{i}"))).unwrap();
        }
        match slow.recv().await.map(|e| e.payload) {
            Some(ScenePayload::CollisionObject(obj)) => assert_eq!(obj.id, "cube_28"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_json_carries_operation() {
        let json = record("cube_1").to_json().unwrap();
        assert!(json.contains("\"collision_object\""));
        assert!(json.contains("\"ADD\""));
        assert!(json.contains("cube_1"));
    }
}
