//! Shared vocabulary of the servostack workspace: perception samples, servo
//! states, scene records, geometry and the workspace error type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod geometry;
pub mod scene;

pub use geometry::{GRIPPER_DOWN, Pose, Quaternion, Vec3};
pub use scene::{AttachedCollisionObject, CollisionObject, Geometry, Operation, TargetObject};

/// Coordinate value a vision pipeline reports when it has no detection.
pub const NO_DETECTION: f32 = -1.0;

/// Robot base frame; every pose in the workspace is expressed in it.
pub const BASE_FRAME: &str = "base";

// ────────────────────────────────────────────────────────────────────────────
// Manipulator side
// ────────────────────────────────────────────────────────────────────────────

/// Which arm of the robot a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    /// Link the gripper of this side is mounted on, e.g. `"left_gripper"`.
    pub fn gripper_link(&self) -> String {
        format!("{}_gripper", self.as_str())
    }

    /// Optical frame of the hand camera, e.g. `"left_hand_camera"`.
    pub fn camera_frame(&self) -> String {
        format!("{}_hand_camera", self.as_str())
    }

    /// Links an attached object may touch without counting as a collision.
    pub fn touch_links(&self) -> Vec<String> {
        let side = self.as_str();
        vec![
            format!("{side}_gripper"),
            format!("{side}_gripper_base"),
            format!("{side}_hand_camera"),
            format!("{side}_hand_range"),
            "octomap".to_string(),
        ]
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(StackError::Config(format!(
                "unknown side '{other}', expected 'left' or 'right'"
            ))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Perception samples
// ────────────────────────────────────────────────────────────────────────────

/// Horizontal pixel bounds of a detected blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    pub xmin: f32,
    pub xmax: f32,
}

impl Extents {
    /// Extents reported alongside a missing detection.
    pub const fn unknown() -> Self {
        Self {
            xmin: NO_DETECTION,
            xmax: NO_DETECTION,
        }
    }

    /// Blob width in pixels, or `None` when the bounds are degenerate.
    pub fn width(&self) -> Option<f32> {
        (self.xmax > self.xmin && self.xmin >= 0.0).then(|| self.xmax - self.xmin)
    }
}

/// Image-plane centroid of the target as reported by the vision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidSample {
    pub x: f32,
    pub y: f32,
    pub extents: Extents,
}

impl CentroidSample {
    pub fn new(x: f32, y: f32, extents: Extents) -> Self {
        Self { x, y, extents }
    }

    /// The `(-1, -1)` sentinel.
    pub fn no_detection() -> Self {
        Self::new(NO_DETECTION, NO_DETECTION, Extents::unknown())
    }

    /// `false` when either coordinate carries the sentinel value.
    #[allow(clippy::float_cmp)]
    pub fn is_detection(&self) -> bool {
        self.x != NO_DETECTION && self.y != NO_DETECTION
    }
}

/// One reading of the hand-mounted proximity sensor, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSample {
    pub range: f32,
}

/// Pinhole projection matrix `K` of the hand camera, row-major.
///
/// ```text
/// [x y w]' = K * [X Y Z]'
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub k: [f32; 9],
}

impl CameraIntrinsics {
    pub fn from_row_major(k: [f32; 9]) -> Self {
        Self { k }
    }

    pub fn fx(&self) -> f32 {
        self.k[0]
    }

    pub fn fy(&self) -> f32 {
        self.k[4]
    }

    pub fn cx(&self) -> f32 {
        self.k[2]
    }

    pub fn cy(&self) -> f32 {
        self.k[5]
    }

    /// Camera-frame point seen at pixel `(u, v)` at distance `depth` along
    /// the optical axis.  Assumes zero skew.
    ///
    /// Returns `None` when the focal lengths are zero.
    pub fn back_project(&self, u: f32, v: f32, depth: f32) -> Option<Vec3> {
        if self.fx() == 0.0 || self.fy() == 0.0 {
            return None;
        }
        Some(Vec3::new(
            (u - self.cx()) / self.fx() * depth,
            (v - self.cy()) / self.fy() * depth,
            depth,
        ))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Servo state
// ────────────────────────────────────────────────────────────────────────────

/// Phase of the visual-servo state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServoState {
    /// No valid centroid yet (or the target was lost).
    AwaitingTarget,
    /// Centering the target in the image plane.
    CorrectXy,
    /// Descending toward the target.
    CorrectZ,
    /// Within grasp range.  Terminal.
    Complete,
}

impl ServoState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServoState::Complete)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
///
/// Plan infeasibility and shutdown are reported as cycle outcomes by the
/// orchestrator, not as errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StackError {
    #[error("Transform unavailable from '{source_frame}' to '{target_frame}'")]
    TransformUnavailable {
        source_frame: String,
        target_frame: String,
    },

    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Motion command rejected by {component}: {details}")]
    MotionRejected { component: String, details: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Unknown object: {0}")]
    UnknownObject(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
