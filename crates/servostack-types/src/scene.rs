//! Collision-scene records exchanged with the external scene consumer, and
//! the orchestrator's per-object view of them.

use serde::{Deserialize, Serialize};

use crate::Side;
use crate::geometry::Pose;

/// Lifecycle tag attached to every published scene record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Add,
    Remove,
}

/// Primitive shape of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// Axis-aligned box, `[x, y, z]` edge lengths in metres.
    Box { dimensions: [f32; 3] },
    Cylinder { height: f32, radius: f32 },
}

impl Geometry {
    /// Vertical extent of the shape in metres.
    pub fn height(&self) -> f32 {
        match self {
            Geometry::Box { dimensions } => dimensions[2],
            Geometry::Cylinder { height, .. } => *height,
        }
    }
}

/// Collision record for one tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionObject {
    pub id: String,
    pub geometry: Geometry,
    /// One pose per primitive; trackers in this system emit exactly one.
    pub poses: Vec<Pose>,
    pub operation: Operation,
}

impl CollisionObject {
    /// A single-primitive record with operation [`Operation::Add`].
    pub fn new(id: impl Into<String>, geometry: Geometry, pose: Pose) -> Self {
        Self {
            id: id.into(),
            geometry,
            poses: vec![pose],
            operation: Operation::Add,
        }
    }

    pub fn primary_pose(&self) -> Option<&Pose> {
        self.poses.first()
    }
}

/// Binds a [`CollisionObject`] to a robot link so the planner treats it as
/// part of the arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedCollisionObject {
    pub object: CollisionObject,
    pub link_name: String,
    /// Links allowed to touch the object without counting as a collision.
    pub touch_links: Vec<String>,
}

impl AttachedCollisionObject {
    /// Attachment of `object` to the gripper of `side`.
    pub fn for_side(object: CollisionObject, side: Side) -> Self {
        Self {
            object,
            link_name: side.gripper_link(),
            touch_links: side.touch_links(),
        }
    }
}

/// The orchestrator's working copy of one object to be stacked.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetObject {
    pub id: String,
    pub geometry: Geometry,
    /// Current pose estimate in the base frame.
    pub pose: Pose,
    /// Physical height used for approach, retreat and stacking offsets.
    pub height: f32,
    pub operation: Operation,
    /// Gripper currently holding the object, if any.
    pub attached: Option<Side>,
}

impl TargetObject {
    /// Build a target from a tracker record.
    ///
    /// Returns `None` when the record carries no pose.
    pub fn from_collision_object(object: &CollisionObject, height: f32) -> Option<Self> {
        let pose = *object.primary_pose()?;
        Some(Self {
            id: object.id.clone(),
            geometry: object.geometry,
            pose,
            height,
            operation: object.operation,
            attached: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Pose, Vec3, Quaternion};

    fn cube(id: &str) -> CollisionObject {
        CollisionObject::new(
            id,
            Geometry::Box {
                dimensions: [0.05, 0.05, 0.06],
            },
            Pose::new(Vec3::new(0.6, 0.1, -0.1), Quaternion::identity()),
        )
    }

    #[test]
    fn operation_serializes_uppercase() {
        let json = serde_json::to_string(&Operation::Remove).unwrap();
        assert_eq!(json, "\"REMOVE\"");
    }

    #[test]
    fn geometry_height() {
        assert_eq!(cube("a").geometry.height(), 0.06);
        let cyl = Geometry::Cylinder {
            height: 0.1,
            radius: 0.02,
        };
        assert_eq!(cyl.height(), 0.1);
    }

    #[test]
    fn target_from_object_without_pose_is_none() {
        let mut obj = cube("a");
        obj.poses.clear();
        assert!(TargetObject::from_collision_object(&obj, 0.06).is_none());
    }

    #[test]
    fn target_keeps_id_pose_and_operation() {
        let obj = cube("block_3");
        let target = TargetObject::from_collision_object(&obj, 0.06).unwrap();
        assert_eq!(target.id, "block_3");
        assert_eq!(target.pose, obj.poses[0]);
        assert_eq!(target.attached, None);
        assert_eq!(target.geometry, obj.geometry);
    }

    #[test]
    fn attached_record_names_gripper_link() {
        let attached = AttachedCollisionObject::for_side(cube("a"), Side::Left);
        assert_eq!(attached.link_name, "left_gripper");
        assert!(attached.touch_links.contains(&"left_hand_camera".to_string()));
        assert!(attached.touch_links.contains(&"octomap".to_string()));
    }
}
