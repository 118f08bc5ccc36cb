//! Immutable tuning parameters of the servo controller and the orchestrator.
//!
//! Both structs deserialise from TOML tables with a default for every field,
//! so a partial (or empty) file is always valid input.  Call `validate()`
//! after applying any overrides.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use servostack_types::{GRIPPER_DOWN, Pose, StackError, Vec3};

/// Longest idle wait the orchestrator accepts between servo checks.
pub const MAX_IDLE_WAIT_MS: u64 = 10;

const DEFAULT_SERVO_TIMEOUT_MS: u64 = 30_000;

// ────────────────────────────────────────────────────────────────────────────
// ServoConfig
// ────────────────────────────────────────────────────────────────────────────

/// Parameters of one [`VisualServoController`][crate::servo::VisualServoController].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// Length of every incremental move, in metres.  Must stay well below
    /// the distance `pixel_threshold` spans at grasp range, or XY correction
    /// overshoots back and forth.
    pub servo_speed: f32,
    /// End-effector height (base frame) below which the arm stops descending.
    pub min_pose_height: f32,
    /// Proximity reading below which the target counts as within grasp range.
    pub min_range_depth: f32,
    /// Where the target should sit in the image, as a fraction of the
    /// resolution.
    pub goal_ratio: [f32; 2],
    /// `[width, height]` of the hand camera image in pixels.
    pub camera_resolution: [f32; 2],
    /// Centring tolerance in pixels.
    pub pixel_threshold: f32,
    /// When set, the tolerance becomes this fraction of the blob width.
    pub threshold_extent_ratio: Option<f32>,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            servo_speed: 0.002,
            min_pose_height: -0.12,
            min_range_depth: 0.02,
            goal_ratio: [0.5, 0.5],
            camera_resolution: [320.0, 200.0],
            pixel_threshold: 10.0,
            threshold_extent_ratio: None,
        }
    }
}

impl ServoConfig {
    /// Pixel the target is steered towards.
    pub fn goal_position(&self) -> (f32, f32) {
        (
            self.camera_resolution[0] * self.goal_ratio[0],
            self.camera_resolution[1] * self.goal_ratio[1],
        )
    }

    /// # Errors
    ///
    /// Returns [`StackError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), StackError> {
        if !(self.servo_speed > 0.0) {
            return Err(StackError::Config(format!(
                "servo_speed must be positive, got {}",
                self.servo_speed
            )));
        }
        if self.min_range_depth < 0.0 {
            return Err(StackError::Config(format!(
                "min_range_depth must not be negative, got {}",
                self.min_range_depth
            )));
        }
        if self.goal_ratio.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err(StackError::Config(format!(
                "goal_ratio must lie within [0, 1], got {:?}",
                self.goal_ratio
            )));
        }
        if self.camera_resolution.iter().any(|r| !(*r > 0.0)) {
            return Err(StackError::Config(format!(
                "camera_resolution must be positive, got {:?}",
                self.camera_resolution
            )));
        }
        if self.pixel_threshold < 0.0 {
            return Err(StackError::Config(format!(
                "pixel_threshold must not be negative, got {}",
                self.pixel_threshold
            )));
        }
        if let Some(ratio) = self.threshold_extent_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(StackError::Config(format!(
                    "threshold_extent_ratio must lie within [0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StackConfig
// ────────────────────────────────────────────────────────────────────────────

/// Parameters of the [`StackOrchestrator`][crate::orchestrator::StackOrchestrator].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Physical height of every object, in metres.
    pub object_height: f32,
    /// Approach pose sits this many object heights above the object.
    pub approach_height_factor: f32,
    /// Retreat moves rise this many object heights.
    pub retreat_height_factor: f32,
    /// The stack grows by this many object heights per placement.
    pub stack_step_factor: f32,
    /// `[x, y]` of the first placement.
    pub stack_xy: [f32; 2],
    /// First placement height is `object_height + stack_base_height`.
    pub stack_base_height: f32,
    /// Sleep between servo completion checks.
    pub idle_wait_ms: u64,
    /// Scene records published per second during teardown.
    pub teardown_rate_hz: u32,
    /// Give up on a servo run after this long.  Unbounded when unset or 0.
    pub servo_timeout_ms: Option<u64>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            object_height: 0.06,
            approach_height_factor: 1.7,
            retreat_height_factor: 2.0,
            stack_step_factor: 0.75,
            stack_xy: [0.593, -0.212],
            stack_base_height: -0.130,
            idle_wait_ms: MAX_IDLE_WAIT_MS,
            teardown_rate_hz: 1,
            servo_timeout_ms: Some(DEFAULT_SERVO_TIMEOUT_MS),
        }
    }
}

impl StackConfig {
    /// Pose of the first placement, gripper pointing down.
    pub fn stack_pose(&self) -> Pose {
        Pose::new(
            Vec3::new(
                self.stack_xy[0],
                self.stack_xy[1],
                self.object_height + self.stack_base_height,
            ),
            GRIPPER_DOWN,
        )
    }

    pub fn approach_offset(&self) -> f32 {
        self.approach_height_factor * self.object_height
    }

    pub fn retreat_offset(&self) -> f32 {
        self.retreat_height_factor * self.object_height
    }

    pub fn stack_step(&self) -> f32 {
        self.stack_step_factor * self.object_height
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.min(MAX_IDLE_WAIT_MS))
    }

    pub fn servo_timeout(&self) -> Option<Duration> {
        self.servo_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Teardown rate, clamped to at least one record per second.
    pub fn teardown_rate(&self) -> NonZeroU32 {
        NonZeroU32::new(self.teardown_rate_hz).unwrap_or(NonZeroU32::MIN)
    }

    /// # Errors
    ///
    /// Returns [`StackError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), StackError> {
        if !(self.object_height > 0.0) {
            return Err(StackError::Config(format!(
                "object_height must be positive, got {}",
                self.object_height
            )));
        }
        for (name, factor) in [
            ("approach_height_factor", self.approach_height_factor),
            ("retreat_height_factor", self.retreat_height_factor),
            ("stack_step_factor", self.stack_step_factor),
        ] {
            if !(factor >= 0.0) {
                return Err(StackError::Config(format!(
                    "{name} must not be negative, got {factor}"
                )));
            }
        }
        if self.idle_wait_ms > MAX_IDLE_WAIT_MS {
            return Err(StackError::Config(format!(
                "idle_wait_ms must be at most {MAX_IDLE_WAIT_MS}, got {}",
                self.idle_wait_ms
            )));
        }
        if self.teardown_rate_hz == 0 {
            return Err(StackError::Config(
                "teardown_rate_hz must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServoConfig::default().validate().unwrap();
        StackConfig::default().validate().unwrap();
    }

    #[test]
    fn goal_position_scales_resolution() {
        let config = ServoConfig {
            camera_resolution: [320.0, 240.0],
            goal_ratio: [0.5, 0.5],
            ..ServoConfig::default()
        };
        assert_eq!(config.goal_position(), (160.0, 120.0));
    }

    #[test]
    fn stack_geometry_follows_object_height() {
        let config = StackConfig {
            object_height: 0.06,
            ..StackConfig::default()
        };
        assert!((config.stack_pose().position.z - (-0.07)).abs() < 1e-6);
        assert!((config.approach_offset() - 0.102).abs() < 1e-6);
        assert!((config.retreat_offset() - 0.12).abs() < 1e-6);
        assert!((config.stack_step() - 0.045).abs() < 1e-6);
        assert_eq!(config.stack_pose().orientation, GRIPPER_DOWN);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_speed = ServoConfig {
            servo_speed: 0.0,
            ..ServoConfig::default()
        };
        assert!(matches!(bad_speed.validate(), Err(StackError::Config(_))));

        let bad_ratio = ServoConfig {
            goal_ratio: [1.5, 0.5],
            ..ServoConfig::default()
        };
        assert!(bad_ratio.validate().is_err());

        let bad_height = StackConfig {
            object_height: -0.01,
            ..StackConfig::default()
        };
        assert!(bad_height.validate().is_err());

        let slow_wait = StackConfig {
            idle_wait_ms: 50,
            ..StackConfig::default()
        };
        assert!(slow_wait.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StackConfig = serde_json::from_str(r#"{ "object_height": 0.05 }"#).unwrap();
        assert_eq!(config.object_height, 0.05);
        assert_eq!(config.approach_height_factor, 1.7);
        assert_eq!(config.servo_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_servo_timeout_is_unbounded() {
        let config = StackConfig {
            servo_timeout_ms: Some(0),
            ..StackConfig::default()
        };
        assert_eq!(config.servo_timeout(), None);
        let unset = StackConfig {
            servo_timeout_ms: None,
            ..StackConfig::default()
        };
        assert_eq!(unset.servo_timeout(), None);
    }

    #[test]
    fn default_step_stays_below_threshold_at_grasp_range() {
        // 200 px focal length, target 2 cm below the camera.
        let config = ServoConfig::default();
        let pixels_per_step = 200.0 * config.servo_speed / config.min_range_depth;
        assert!(pixels_per_step < 2.0 * config.pixel_threshold);
    }
}
