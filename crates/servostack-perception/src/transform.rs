//! Transform Frame (TF) graph.
//!
//! Maintains a graph of named reference frames and the rigid-body transforms
//! (translation + quaternion rotation) that relate them.  Given any two frame
//! names the engine composes a chain of transforms via BFS, walking edges in
//! either direction (a reverse hop uses the edge's inverse).
//!
//! Conventions follow ROS tf: `set_transform(parent, child, T)` stores the
//! pose of `child` expressed in `parent`, and `lookup(target, source)`
//! returns the transform that maps points expressed in `source` into
//! `target`.
//!
//! # Example
//!
//! ```rust
//! use servostack_perception::transform::{TfEngine, Transform3D};
//! use servostack_types::{Quaternion, Vec3};
//!
//! let mut tf = TfEngine::new();
//! tf.set_transform("base", "left_hand",
//!     Transform3D::new(Vec3::new(0.5, 0.0, 0.3), Quaternion::identity()));
//! tf.set_transform("left_hand", "left_hand_camera",
//!     Transform3D::new(Vec3::new(0.0, 0.0, 0.05), Quaternion::identity()));
//!
//! let t = tf.lookup("base", "left_hand_camera").unwrap();
//! assert!((t.translation.z - 0.35).abs() < 1e-5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use servostack_types::{Quaternion, StackError, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// To convert a point expressed in the child frame into the parent frame,
/// rotate it by `rotation` then add `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Transform3D {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Compose two transforms: if `self` = T_A_B and `other` = T_B_C, the
    /// result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// T_B_A for `self` = T_A_B.
    pub fn inverse(self) -> Self {
        let rotation = self.rotation.conjugate();
        Self::new(rotation.rotate(self.translation).neg(), rotation)
    }

    /// Map a point from the child frame into the parent frame.
    pub fn apply(self, point: Vec3) -> Vec3 {
        self.rotation.rotate(point).add(self.translation)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Provider seam
// ────────────────────────────────────────────────────────────────────────────

/// Source of frame transforms for the servo controller.
///
/// Implementations return [`StackError::TransformUnavailable`] while the
/// requested chain is not (yet) known; callers treat that as transient.
pub trait FrameTransformProvider: Send + Sync {
    /// Latest transform mapping points expressed in `source_frame` into
    /// `target_frame`.
    fn lookup_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
    ) -> Result<Transform3D, StackError>;
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

/// A graph of named reference frames and the [`Transform3D`]s that relate
/// them.
///
/// Frames are identified by arbitrary string names (e.g. `"base"`,
/// `"left_hand_camera"`).  Each edge is stored once, parent to child, and is
/// traversable in both directions.
#[derive(Debug, Default)]
pub struct TfEngine {
    /// `edges[parent][child] = T_parent_child`
    edges: HashMap<String, HashMap<String, Transform3D>>,
}

impl TfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the pose of `child_frame` in `parent_frame`.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), transform);
    }

    /// Compute the composed [`Transform3D`] that maps points in
    /// `source_frame` into `target_frame`.
    ///
    /// Returns `None` if no chain connects the two frames.
    pub fn lookup(&self, target_frame: &str, source_frame: &str) -> Option<Transform3D> {
        if source_frame == target_frame {
            return Some(Transform3D::identity());
        }

        // BFS from the target; each queue item carries T_target_current.
        let mut queue: VecDeque<(String, Transform3D)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        queue.push_back((target_frame.to_string(), Transform3D::identity()));
        visited.insert(target_frame.to_string());

        while let Some((current, accumulated)) = queue.pop_front() {
            for (next, edge_tf) in self.neighbours(&current) {
                if visited.contains(&next) {
                    continue;
                }
                let composed = accumulated.compose(edge_tf);
                if next == source_frame {
                    return Some(composed);
                }
                visited.insert(next.clone());
                queue.push_back((next, composed));
            }
        }

        None
    }

    /// Every frame adjacent to `frame` with T_frame_neighbour.
    fn neighbours(&self, frame: &str) -> Vec<(String, Transform3D)> {
        let mut out: Vec<(String, Transform3D)> = self
            .edges
            .get(frame)
            .map(|children| {
                children
                    .iter()
                    .map(|(child, tf)| (child.clone(), *tf))
                    .collect()
            })
            .unwrap_or_default();

        for (parent, children) in &self.edges {
            if let Some(tf) = children.get(frame) {
                out.push((parent.clone(), tf.inverse()));
            }
        }
        out
    }
}

impl FrameTransformProvider for TfEngine {
    fn lookup_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
    ) -> Result<Transform3D, StackError> {
        self.lookup(target_frame, source_frame)
            .ok_or_else(|| StackError::TransformUnavailable {
                source_frame: source_frame.to_string(),
                target_frame: target_frame.to_string(),
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TfBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Shared, cheaply clonable handle to a [`TfEngine`].
///
/// A publisher task updates transforms while controllers look them up.
#[derive(Debug, Clone, Default)]
pub struct TfBuffer {
    inner: Arc<RwLock<TfEngine>>,
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        let mut engine = self.inner.write().unwrap_or_else(|e| e.into_inner());
        engine.set_transform(parent_frame, child_frame, transform);
    }
}

impl FrameTransformProvider for TfBuffer {
    fn lookup_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
    ) -> Result<Transform3D, StackError> {
        let engine = self.inner.read().unwrap_or_else(|e| e.into_inner());
        engine.lookup_transform(target_frame, source_frame)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
