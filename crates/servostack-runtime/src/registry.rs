//! Registry of tracked objects and their lifecycle in the collision scene.
//!
//! The registry mirrors what the external scene consumer should know: every
//! object ever reported by the tracker, the operation last recorded for it
//! and which gripper (if any) holds it.  Ids are never forgotten; removing an
//! object from the scene is a recorded [`Operation::Remove`].

use std::collections::HashMap;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use servostack_middleware::{SceneBus, SceneEvent, ScenePayload};
use servostack_types::{AttachedCollisionObject, CollisionObject, Operation, Side, StackError};
use tracing::{debug, info, warn};

const SOURCE: &str = "servostack-runtime::registry";

#[derive(Debug, Clone)]
struct Entry {
    object: CollisionObject,
    operation: Operation,
    attached: Option<Side>,
}

/// Insertion-ordered, last-write-wins store of collision objects.
pub struct ObjectRegistry {
    bus: SceneBus,
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    initial_publish_done: bool,
    teardown_limiter: DefaultDirectRateLimiter,
}

impl ObjectRegistry {
    /// Registry publishing on `bus`; teardown emits at most
    /// `teardown_rate_hz` records per second.
    pub fn new(bus: SceneBus, teardown_rate_hz: NonZeroU32) -> Self {
        Self {
            bus,
            order: Vec::new(),
            entries: HashMap::new(),
            initial_publish_done: false,
            teardown_limiter: RateLimiter::direct(
                Quota::per_second(teardown_rate_hz).allow_burst(NonZeroU32::MIN),
            ),
        }
    }

    /// Merge a tracker batch.  Known ids are overwritten (object and
    /// operation), new ids are appended.  The first batch ever received is
    /// published in full.
    ///
    /// Returns the number of ids seen for the first time.
    pub fn receive(&mut self, batch: Vec<CollisionObject>) -> usize {
        let mut added = 0;
        for object in batch {
            match self.entries.get_mut(&object.id) {
                Some(entry) => {
                    entry.operation = object.operation;
                    entry.object = object;
                }
                None => {
                    debug!(object = %object.id, "tracking new object");
                    self.order.push(object.id.clone());
                    self.entries.insert(
                        object.id.clone(),
                        Entry {
                            operation: object.operation,
                            object,
                            attached: None,
                        },
                    );
                    added += 1;
                }
            }
        }

        if !self.initial_publish_done {
            self.initial_publish_done = true;
            if let Err(e) = self.publish_all() {
                warn!(error = %e, "initial scene publish incomplete");
            }
        }
        added
    }

    /// Publish `id` stamped with its recorded operation on the collision
    /// object topic.
    ///
    /// # Errors
    ///
    /// [`StackError::UnknownObject`] for an id never received, or
    /// [`StackError::Channel`] when nobody consumes the scene.
    pub fn publish(&self, id: &str) -> Result<usize, StackError> {
        let entry = self.entry(id)?;
        let mut object = entry.object.clone();
        object.operation = entry.operation;
        self.bus.publish(SceneEvent::new(
            SOURCE,
            ScenePayload::CollisionObject(object),
        ))
    }

    /// Publish every object once, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns the first publish error; the remaining objects are still
    /// attempted.
    pub fn publish_all(&self) -> Result<(), StackError> {
        let mut first_error = None;
        for id in &self.order {
            if let Err(e) = self.publish(id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Announce that `side`'s gripper holds `id`.
    ///
    /// # Errors
    ///
    /// [`StackError::UnknownObject`] or [`StackError::Channel`].
    pub fn publish_attached(&mut self, id: &str, side: Side) -> Result<usize, StackError> {
        let entry = self.entry_mut(id)?;
        entry.attached = Some(side);
        let mut object = entry.object.clone();
        object.operation = Operation::Add;
        info!(object = %id, %side, "object attached");
        self.publish_attachment(object, side)
    }

    /// Announce that `side`'s gripper released `id`.
    ///
    /// # Errors
    ///
    /// [`StackError::UnknownObject`] or [`StackError::Channel`].
    pub fn publish_detached(&mut self, id: &str, side: Side) -> Result<usize, StackError> {
        let entry = self.entry_mut(id)?;
        entry.attached = None;
        let mut object = entry.object.clone();
        object.operation = Operation::Remove;
        info!(object = %id, %side, "object detached");
        self.publish_attachment(object, side)
    }

    fn publish_attachment(&self, object: CollisionObject, side: Side) -> Result<usize, StackError> {
        self.bus.publish(SceneEvent::new(
            SOURCE,
            ScenePayload::AttachedCollisionObject(AttachedCollisionObject::for_side(object, side)),
        ))
    }

    /// Record `operation` for `id` without publishing.
    ///
    /// # Errors
    ///
    /// [`StackError::UnknownObject`].
    pub fn set_operation(&mut self, id: &str, operation: Operation) -> Result<(), StackError> {
        self.entry_mut(id)?.operation = operation;
        Ok(())
    }

    /// Every object with its recorded operation, in insertion order.
    pub fn objects(&self) -> Vec<CollisionObject> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| {
                let mut object = entry.object.clone();
                object.operation = entry.operation;
                object
            })
            .collect()
    }

    pub fn operation(&self, id: &str) -> Option<Operation> {
        self.entries.get(id).map(|e| e.operation)
    }

    pub fn attached_side(&self, id: &str) -> Option<Side> {
        self.entries.get(id).and_then(|e| e.attached)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Mark every object REMOVE and publish each one, paced by the teardown
    /// rate.  Failures are logged and skipped.
    ///
    /// Returns the number of records delivered.
    pub async fn teardown(&mut self) -> usize {
        for entry in self.entries.values_mut() {
            entry.operation = Operation::Remove;
        }
        let mut delivered = 0;
        for id in &self.order {
            self.teardown_limiter.until_ready().await;
            match self.publish(id) {
                Ok(_) => delivered += 1,
                Err(e) => warn!(object = %id, error = %e, "teardown publish failed"),
            }
        }
        info!(delivered, total = self.order.len(), "scene teardown finished");
        delivered
    }

    fn entry(&self, id: &str) -> Result<&Entry, StackError> {
        self.entries
            .get(id)
            .ok_or_else(|| StackError::UnknownObject(id.to_string()))
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry, StackError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| StackError::UnknownObject(id.to_string()))
    }
}
