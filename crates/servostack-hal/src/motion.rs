//! End-effector motion command seam.
//!
//! Drivers implement [`MotionCommandInterface`]; the servo controller and the
//! orchestrator only ever talk to the trait.

use async_trait::async_trait;
use servostack_types::{Pose, StackError, Vec3};

/// A single end-effector command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Move to an absolute pose in the base frame.
    Pose(Pose),
    /// Move the end effector by `(dx, dy, dz)` metres from its current
    /// position, keeping the current orientation.
    Delta(Vec3),
}

impl MotionCommand {
    /// Absolute target of this command given the current end-effector pose.
    pub fn resolve(&self, current: Pose) -> Pose {
        match *self {
            MotionCommand::Pose(pose) => pose,
            MotionCommand::Delta(delta) => {
                Pose::new(current.position.add(delta), current.orientation)
            }
        }
    }
}

/// Cartesian command interface of one arm.
#[async_trait]
pub trait MotionCommandInterface: Send + Sync {
    /// Stable identifier, e.g. `"left_arm"`.
    fn id(&self) -> &str;

    /// Issue `command`.  With `blocking = false` the call returns as soon as
    /// the command is accepted; with `blocking = true` it waits until the
    /// motion has been executed.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::MotionRejected`] if the command cannot be
    /// solved or executed (e.g. no inverse-kinematics solution).
    async fn command(&self, command: MotionCommand, blocking: bool) -> Result<(), StackError>;

    /// Most recently known end-effector pose in the base frame.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Channel`] if the arm state is unavailable.
    async fn end_effector_pose(&self) -> Result<Pose, StackError>;
}
