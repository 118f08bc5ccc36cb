//! Visual servoing: steer the end effector over a target seen by the hand
//! camera, then descend until the proximity sensor reports grasp range.
//!
//! # State machine
//!
//! Evaluated once per centroid sample while the controller is not
//! [`Complete`][ServoState::Complete]:
//!
//! | Condition | Next state | Command |
//! |---|---|---|
//! | no detection | `AwaitingTarget` | none |
//! | `\|ex\| > t` **and** `\|ey\| > t` | `CorrectXy` | delta towards the target |
//! | end effector out of range | `CorrectZ` | delta `(0, 0, -speed)` |
//! | otherwise | `Complete` | none |
//!
//! Each controller owns one Tokio task that consumes its
//! [`PerceptionReceiver`] one sample at a time, so state updates never race.

use std::sync::{Arc, Mutex};

use servostack_hal::{MotionCommand, MotionCommandInterface};
use servostack_perception::{
    FrameTransformProvider, PerceptionFeed, PerceptionReceiver, PerceptionSample, Transform3D,
};
use servostack_types::{
    BASE_FRAME, CameraIntrinsics, CentroidSample, ServoState, Side, StackError, Vec3,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServoConfig;

// ────────────────────────────────────────────────────────────────────────────
// Decision rules
// ────────────────────────────────────────────────────────────────────────────

/// `true` while the arm is above its minimum height and the proximity sensor
/// still reads at least `min_range_depth`.
pub fn out_of_range(
    end_effector_height: f32,
    range: f32,
    min_pose_height: f32,
    min_range_depth: f32,
) -> bool {
    end_effector_height >= min_pose_height && range >= min_range_depth
}

/// Next state for a valid centroid `error` (pixels from the goal).
///
/// XY correction needs **both** axes outside `threshold`.
pub fn select_state(error: (f32, f32), threshold: f32, out_of_range: bool) -> ServoState {
    if error.0.abs() > threshold && error.1.abs() > threshold {
        ServoState::CorrectXy
    } else if out_of_range {
        ServoState::CorrectZ
    } else {
        ServoState::Complete
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Processing core
// ────────────────────────────────────────────────────────────────────────────

/// Everything the processing task owns.
struct ServoCore {
    side: Side,
    camera_frame: String,
    config: ServoConfig,
    goal: (f32, f32),
    motion: Arc<dyn MotionCommandInterface>,
    transforms: Arc<dyn FrameTransformProvider>,
    state: Arc<watch::Sender<ServoState>>,
    estimate: Arc<Mutex<Option<Vec3>>>,
    range: Option<f32>,
    intrinsics: Option<CameraIntrinsics>,
}

impl ServoCore {
    fn state(&self) -> ServoState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ServoState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(side = %self.side, from = ?previous, to = ?next, "servo state changed");
        }
    }

    async fn handle(&mut self, sample: PerceptionSample) -> Result<(), StackError> {
        match sample {
            PerceptionSample::Intrinsics(k) => {
                self.intrinsics = Some(k);
                Ok(())
            }
            PerceptionSample::Range(r) => {
                self.range = Some(r.range);
                Ok(())
            }
            PerceptionSample::Centroid(c) => self.on_centroid(c).await,
        }
    }

    async fn on_centroid(&mut self, centroid: CentroidSample) -> Result<(), StackError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        if !centroid.is_detection() {
            debug!(side = %self.side, "waiting on a centroid");
            self.set_state(ServoState::AwaitingTarget);
            return Ok(());
        }

        let error = (centroid.x - self.goal.0, centroid.y - self.goal.1);
        let pose = self.motion.end_effector_pose().await?;
        let range = self.range.ok_or_else(|| {
            StackError::PreconditionViolation(format!(
                "no {} hand range reading before the first centroid",
                self.side
            ))
        })?;
        let out_of_range = out_of_range(
            pose.position.z,
            range,
            self.config.min_pose_height,
            self.config.min_range_depth,
        );

        let camera_to_base = self.transforms.lookup_transform(BASE_FRAME, &self.camera_frame);
        if let Ok(transform) = &camera_to_base {
            self.update_estimate(&centroid, range, transform);
        }

        let next = select_state(error, self.threshold(&centroid), out_of_range);
        self.set_state(next);

        match next {
            ServoState::CorrectXy => match camera_to_base {
                Ok(transform) => self.correct_xy(error, out_of_range, &transform).await,
                Err(e) => {
                    debug!(side = %self.side, error = %e, "camera transform not ready; retrying");
                    Ok(())
                }
            },
            ServoState::CorrectZ => {
                let delta = Vec3::new(0.0, 0.0, -self.config.servo_speed);
                self.motion.command(MotionCommand::Delta(delta), false).await
            }
            ServoState::Complete => {
                info!(side = %self.side, range, "target within grasp range");
                Ok(())
            }
            ServoState::AwaitingTarget => Ok(()),
        }
    }

    fn threshold(&self, centroid: &CentroidSample) -> f32 {
        self.config
            .threshold_extent_ratio
            .and_then(|ratio| centroid.extents.width().map(|w| w * ratio))
            .unwrap_or(self.config.pixel_threshold)
    }

    async fn correct_xy(
        &self,
        error: (f32, f32),
        out_of_range: bool,
        camera_to_base: &Transform3D,
    ) -> Result<(), StackError> {
        let speed = self.config.servo_speed;
        let rotated = camera_to_base
            .rotation
            .rotate(Vec3::new(error.0, error.1, 0.0));
        let Some(planar) = rotated.normalized() else {
            return Ok(());
        };
        let mut direction = planar.scale(speed);
        direction.z = if out_of_range { speed } else { 0.0 };
        let Some(direction) = direction.normalized() else {
            return Ok(());
        };
        let delta = direction.scale(speed);
        debug!(side = %self.side, ?delta, "translating in XY");
        self.motion.command(MotionCommand::Delta(delta), false).await
    }

    fn update_estimate(&self, centroid: &CentroidSample, range: f32, camera_to_base: &Transform3D) {
        let Some(k) = self.intrinsics else {
            return;
        };
        if let Some(in_camera) = k.back_project(centroid.x, centroid.y, range) {
            *self.estimate.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(camera_to_base.apply(in_camera));
        }
    }

    /// Consume samples until completion, failure or a closed feed.
    async fn run(mut self, mut rx: PerceptionReceiver) -> Result<(), StackError> {
        while let Some(sample) = rx.next().await {
            if let Err(e) = self.handle(sample).await {
                warn!(side = %self.side, error = %e, "visual servo stopped");
                return Err(e);
            }
            if self.state().is_terminal() {
                return Ok(());
            }
        }
        Err(StackError::Channel(format!(
            "{} perception feed closed before the servo completed",
            self.side
        )))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// VisualServoController
// ────────────────────────────────────────────────────────────────────────────

/// Drives one arm's end effector into grasp range of a visible target.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use servostack_hal::sim::SimArm;
/// # use servostack_perception::{PerceptionFeed, TfBuffer};
/// # use servostack_runtime::{ServoConfig, VisualServoController};
/// # use servostack_types::{Pose, Side};
/// # async fn demo(feed: PerceptionFeed) -> Result<(), servostack_types::StackError> {
/// let arm = Arc::new(SimArm::new(Side::Left, Pose::default()));
/// let mut servo = VisualServoController::new(
///     Side::Left, arm, Arc::new(TfBuffer::new()), ServoConfig::default());
/// servo.subscribe(&feed);
/// while !servo.done() && servo.is_running() {
///     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
/// }
/// servo.unsubscribe().await
/// # }
/// ```
pub struct VisualServoController {
    side: Side,
    config: ServoConfig,
    motion: Arc<dyn MotionCommandInterface>,
    transforms: Arc<dyn FrameTransformProvider>,
    state: Arc<watch::Sender<ServoState>>,
    estimate: Arc<Mutex<Option<Vec3>>>,
    worker: Option<JoinHandle<Result<(), StackError>>>,
}

impl VisualServoController {
    pub fn new(
        side: Side,
        motion: Arc<dyn MotionCommandInterface>,
        transforms: Arc<dyn FrameTransformProvider>,
        config: ServoConfig,
    ) -> Self {
        let (state, _) = watch::channel(ServoState::AwaitingTarget);
        Self {
            side,
            config,
            motion,
            transforms,
            state: Arc::new(state),
            estimate: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Start consuming `feed` on a dedicated task.  A second call while a
    /// task exists is a no-op.
    pub fn subscribe(&mut self, feed: &PerceptionFeed) {
        if self.worker.is_some() {
            return;
        }
        let core = ServoCore {
            side: self.side,
            camera_frame: self.side.camera_frame(),
            goal: self.config.goal_position(),
            config: self.config.clone(),
            motion: Arc::clone(&self.motion),
            transforms: Arc::clone(&self.transforms),
            state: Arc::clone(&self.state),
            estimate: Arc::clone(&self.estimate),
            range: None,
            intrinsics: None,
        };
        debug!(side = %self.side, goal = ?core.goal, "visual servo subscribed");
        self.worker = Some(tokio::spawn(core.run(feed.subscribe())));
    }

    /// Stop the task and report how it ended.  Safe to call repeatedly and
    /// without a prior [`subscribe`][Self::subscribe].
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the task, if any.
    pub async fn unsubscribe(&mut self) -> Result<(), StackError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.abort();
        match worker.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(StackError::Channel(format!("visual servo task failed: {e}"))),
        }
    }

    /// `true` once the target is within grasp range.
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn state(&self) -> ServoState {
        *self.state.borrow()
    }

    /// `true` while the processing task is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Base-frame position of the target derived from the last valid
    /// centroid, the intrinsics, the range reading and the camera pose.
    pub fn target_estimate(&self) -> Option<Vec3> {
        *self.estimate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl Drop for VisualServoController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
