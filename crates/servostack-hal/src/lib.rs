//! `servostack-hal` – seams between the stacking runtime and the robot.
//!
//! The runtime only ever talks to these traits, so real drivers and the
//! in-process simulation are interchangeable.
//!
//! # Modules
//!
//! - [`motion`] – [`MotionCommandInterface`]: absolute and incremental
//!   end-effector commands.
//! - [`gripper`] – [`Gripper`]: close/open one side's gripper.
//! - [`planner`] – [`MotionPlanner`] and [`Trajectory`]: collision-aware
//!   planning with explicit infeasibility.
//! - [`sim`] – simulated arm, gripper, planner, camera and tracker for
//!   headless runs and tests.

pub mod gripper;
pub mod motion;
pub mod planner;
pub mod sim;

pub use gripper::Gripper;
pub use motion::{MotionCommand, MotionCommandInterface};
pub use planner::{MotionPlanner, Trajectory};
