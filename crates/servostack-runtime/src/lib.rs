//! `servostack-runtime` – Visual servoing and pick-and-stack orchestration.
//!
//! # Modules
//!
//! - [`config`] – [`ServoConfig`] and [`StackConfig`]: every tunable with
//!   its default.
//! - [`servo`] – [`VisualServoController`]: drives the end effector until
//!   the hand camera sees the target centred and the range sensor reports it
//!   within grasp range.
//! - [`registry`] – [`ObjectRegistry`]: the collision scene as the tracker
//!   reported it, with attach/detach announcements and a rate-limited
//!   teardown.
//! - [`orchestrator`] – [`StackOrchestrator`]: runs the per-object
//!   approach / servo / grasp / place cycle and moves the stack cursor.
//! - [`telemetry`] – [`init_tracing`]: console logging plus optional OTLP
//!   span export.
//!
//! # Control flow
//!
//! ```text
//!  tracker ──ObjectBatch──▶ ObjectRegistry ──CollisionObject──▶ scene
//!                                │
//!                       StackOrchestrator ──plan/execute──▶ MotionPlanner
//!                                │
//!                    VisualServoController ◀── PerceptionFeed (centroid, range, K)
//!                                │
//!                                └──Delta──▶ MotionCommandInterface
//! ```

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod servo;
pub mod telemetry;

pub use config::{ServoConfig, StackConfig};
pub use orchestrator::{
    ArmHandles, CycleOutcome, ObjectReport, PerceptionHandles, StackCursor, StackOrchestrator,
    StackReport,
};
pub use registry::ObjectRegistry;
pub use servo::VisualServoController;
pub use telemetry::{TracerProviderGuard, init_tracing};
