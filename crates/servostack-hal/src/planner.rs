//! Collision-aware motion planning seam.
//!
//! A planner answers "can the end effector reach this pose?" with a
//! [`Trajectory`].  An empty trajectory is the explicit "infeasible" answer;
//! it is not an error.

use async_trait::async_trait;
use servostack_types::{Pose, StackError};

/// Ordered end-effector waypoints from the current pose to a target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub waypoints: Vec<Pose>,
}

impl Trajectory {
    pub fn new(waypoints: Vec<Pose>) -> Self {
        Self { waypoints }
    }

    /// The "no plan found" trajectory.
    pub fn infeasible() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    /// Final waypoint, i.e. where execution leaves the end effector.
    pub fn end_pose(&self) -> Option<Pose> {
        self.waypoints.last().copied()
    }
}

/// Plans and executes end-effector trajectories for one arm.
#[async_trait]
pub trait MotionPlanner: Send + Sync {
    /// Plan from the current end-effector pose to `target`.
    ///
    /// Returns an empty [`Trajectory`] when no collision-free plan exists.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Channel`] if the planning backend is
    /// unreachable.
    async fn plan(&self, target: &Pose) -> Result<Trajectory, StackError>;

    /// Execute `trajectory`, blocking until the motion has finished.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::PreconditionViolation`] for an empty trajectory
    /// and [`StackError::MotionRejected`] if execution aborts.
    async fn execute(&self, trajectory: &Trajectory) -> Result<(), StackError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use servostack_types::{Quaternion, Vec3};

    #[test]
    fn infeasible_is_empty() {
        let t = Trajectory::infeasible();
        assert!(t.is_empty());
        assert_eq!(t.end_pose(), None);
    }

    #[test]
    fn end_pose_is_last_waypoint() {
        let a = Pose::new(Vec3::new(0.0, 0.0, 0.0), Quaternion::identity());
        let b = Pose::new(Vec3::new(0.1, 0.0, 0.0), Quaternion::identity());
        let t = Trajectory::new(vec![a, b]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.end_pose(), Some(b));
    }
}
