//! In-process simulation of the robot cell for headless runs and tests.
//!
//! Every collaborator of the stacking runtime has a simulated counterpart
//! that shares one [`SimWorld`]:
//!
//! | Component | Simulated behaviour |
//! |---|---|
//! | [`SimArm`] | Applies pose and delta commands instantly; records every command. |
//! | [`SimGripper`] | Grasps the free object under the fingertips; releases it where the arm is. |
//! | [`SimPlanner`] | Straight-line trajectories inside a reach sphere; empty plan outside it. |
//! | [`SimVision`] | Pinhole projection of the nearest free object into a down-looking hand camera. |
//! | [`SimTracker`] | Periodic batches of all free objects on the [`SceneBus`]. |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use servostack_hal::sim::{SimArm, SimPlanner};
//! use servostack_types::{Pose, Side, Vec3};
//!
//! let arm = Arc::new(SimArm::new(Side::Left, Pose::default()));
//! let planner = SimPlanner::new(arm.clone()).with_reach(Vec3::zero(), 1.0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use servostack_middleware::{SceneBus, SceneEvent, ScenePayload};
use servostack_perception::{PerceptionFeed, TfBuffer, Transform3D};
use servostack_types::{
    BASE_FRAME, CameraIntrinsics, CentroidSample, CollisionObject, Extents, Geometry, Pose, Quaternion,
    RangeSample, Side, StackError, Vec3,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gripper::Gripper;
use crate::motion::{MotionCommand, MotionCommandInterface};
use crate::planner::{MotionPlanner, Trajectory};

/// Orientation of a hand camera whose optical axis points straight down:
/// half a turn about base X (camera x = base x, camera y = −base y).
pub const CAMERA_LOOKING_DOWN: Quaternion = Quaternion::new(0.0, 1.0, 0.0, 0.0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// World
// ────────────────────────────────────────────────────────────────────────────

/// One box on the simulated table.
#[derive(Debug, Clone, PartialEq)]
pub struct SimObject {
    pub id: String,
    /// `[x, y, z]` edge lengths in metres.
    pub dimensions: [f32; 3],
    /// Box centre in the base frame.
    pub center: Vec3,
    /// Gripper currently holding the box.
    pub held_by: Option<Side>,
}

impl SimObject {
    /// Centre of the top face.
    pub fn top(&self) -> Vec3 {
        self.center.add(Vec3::new(0.0, 0.0, self.dimensions[2] / 2.0))
    }

    /// `true` when `point` lies above the box footprint.
    fn covers(&self, point: Vec3) -> bool {
        (point.x - self.center.x).abs() <= self.dimensions[0] / 2.0
            && (point.y - self.center.y).abs() <= self.dimensions[1] / 2.0
    }

    pub fn to_collision_object(&self) -> CollisionObject {
        CollisionObject::new(
            self.id.clone(),
            Geometry::Box {
                dimensions: self.dimensions,
            },
            Pose::new(self.center, Quaternion::identity()),
        )
    }
}

/// Ground truth shared by every simulated component.
#[derive(Debug, Default)]
pub struct SimWorld {
    objects: Mutex<Vec<SimObject>>,
    table_height: f32,
}

impl SimWorld {
    /// Empty table whose surface is at `table_height` in the base frame.
    pub fn new(table_height: f32) -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            table_height,
        }
    }

    pub fn table_height(&self) -> f32 {
        self.table_height
    }

    /// Put a box on the table with its bottom face on the surface.
    pub fn add_box(&self, id: impl Into<String>, x: f32, y: f32, dimensions: [f32; 3]) {
        let center = Vec3::new(x, y, self.table_height + dimensions[2] / 2.0);
        lock(&self.objects).push(SimObject {
            id: id.into(),
            dimensions,
            center,
            held_by: None,
        });
    }

    pub fn objects(&self) -> Vec<SimObject> {
        lock(&self.objects).clone()
    }

    pub fn object(&self, id: &str) -> Option<SimObject> {
        lock(&self.objects).iter().find(|o| o.id == id).cloned()
    }

    /// Free object whose top is below `eye`, nearest in the horizontal plane.
    pub fn nearest_below(&self, eye: Vec3) -> Option<SimObject> {
        let horizontal = |o: &SimObject| {
            let d = o.center.sub(eye);
            d.x * d.x + d.y * d.y
        };
        lock(&self.objects)
            .iter()
            .filter(|o| o.held_by.is_none() && o.top().z < eye.z)
            .min_by(|a, b| horizontal(a).total_cmp(&horizontal(b)))
            .cloned()
    }

    /// Highest surface directly under `point`: a free box top or the table.
    pub fn surface_below(&self, point: Vec3) -> f32 {
        lock(&self.objects)
            .iter()
            .filter(|o| o.held_by.is_none() && o.covers(point) && o.top().z < point.z)
            .map(|o| o.top().z)
            .fold(self.table_height, f32::max)
    }

    /// Attach the free box whose top is within `tolerance` of `tip` to
    /// `side`.  Returns its id.
    pub fn grasp(&self, side: Side, tip: Vec3, tolerance: f32) -> Option<String> {
        let mut objects = lock(&self.objects);
        let object = objects
            .iter_mut()
            .filter(|o| o.held_by.is_none())
            .find(|o| o.top().sub(tip).norm() <= tolerance)?;
        object.held_by = Some(side);
        Some(object.id.clone())
    }

    /// Drop whatever `side` holds so that its top face ends up at `tip`.
    pub fn release(&self, side: Side, tip: Vec3) -> Option<String> {
        let mut objects = lock(&self.objects);
        let object = objects.iter_mut().find(|o| o.held_by == Some(side))?;
        object.center = tip.sub(Vec3::new(0.0, 0.0, object.dimensions[2] / 2.0));
        object.held_by = None;
        Some(object.id.clone())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Arm
// ────────────────────────────────────────────────────────────────────────────

/// A command as received by [`SimArm`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IssuedCommand {
    pub command: MotionCommand,
    pub blocking: bool,
}

/// Arm that moves instantly to wherever it is told.
#[derive(Debug)]
pub struct SimArm {
    id: String,
    pose: Mutex<Pose>,
    history: Mutex<Vec<IssuedCommand>>,
    rejecting: AtomicBool,
}

impl SimArm {
    pub fn new(side: Side, start: Pose) -> Self {
        Self {
            id: format!("{side}_arm"),
            pose: Mutex::new(start),
            history: Mutex::new(Vec::new()),
            rejecting: AtomicBool::new(false),
        }
    }

    pub fn pose(&self) -> Pose {
        *lock(&self.pose)
    }

    /// Every accepted command, oldest first.
    pub fn history(&self) -> Vec<IssuedCommand> {
        lock(&self.history).clone()
    }

    /// Only the delta commands, oldest first.
    pub fn deltas(&self) -> Vec<Vec3> {
        lock(&self.history)
            .iter()
            .filter_map(|c| match c.command {
                MotionCommand::Delta(d) => Some(d),
                MotionCommand::Pose(_) => None,
            })
            .collect()
    }

    /// While set, every command fails as an inverse-kinematics miss.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl MotionCommandInterface for SimArm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn command(&self, command: MotionCommand, blocking: bool) -> Result<(), StackError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(StackError::MotionRejected {
                component: self.id.clone(),
                details: "no inverse-kinematics solution".to_string(),
            });
        }
        let mut pose = lock(&self.pose);
        *pose = command.resolve(*pose);
        lock(&self.history).push(IssuedCommand { command, blocking });
        debug!(arm = %self.id, ?command, blocking, "sim arm moved");
        Ok(())
    }

    async fn end_effector_pose(&self) -> Result<Pose, StackError> {
        Ok(self.pose())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Gripper
// ────────────────────────────────────────────────────────────────────────────

/// Default distance between fingertips and a box top for a grasp to hold.
const GRASP_TOLERANCE: f32 = 0.03;

/// Gripper that picks up simulated boxes when attached to a [`SimWorld`].
#[derive(Debug)]
pub struct SimGripper {
    side: Side,
    closed: AtomicBool,
    closes: AtomicUsize,
    opens: AtomicUsize,
    world: Option<(Arc<SimArm>, Arc<SimWorld>)>,
    grasp_tolerance: f32,
}

impl SimGripper {
    /// A gripper that only records its state.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            world: None,
            grasp_tolerance: GRASP_TOLERANCE,
        }
    }

    /// Make closing grasp the box under `arm`'s end effector in `world`.
    pub fn in_world(mut self, arm: Arc<SimArm>, world: Arc<SimWorld>) -> Self {
        self.world = Some((arm, world));
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gripper for SimGripper {
    fn side(&self) -> Side {
        self.side
    }

    async fn close(&self) -> Result<(), StackError> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some((arm, world)) = &self.world {
            let tip = arm.pose().position;
            match world.grasp(self.side, tip, self.grasp_tolerance) {
                Some(id) => info!(side = %self.side, object = %id, "sim gripper grasped object"),
                None => warn!(side = %self.side, "sim gripper closed on nothing"),
            }
        }
        Ok(())
    }

    async fn open(&self, _blocking: bool) -> Result<(), StackError> {
        self.closed.store(false, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some((arm, world)) = &self.world {
            if let Some(id) = world.release(self.side, arm.pose().position) {
                info!(side = %self.side, object = %id, "sim gripper released object");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Planner
// ────────────────────────────────────────────────────────────────────────────

/// Iterator of evenly spaced points on the segment from `current` to
/// `target`, at most `max_step` apart.  Yields `target` last.
struct LinearMotion {
    target: Vec3,
    current: Vec3,
    max_step: f32,
}

impl LinearMotion {
    fn new(start: Vec3, target: Vec3, max_step: f32) -> Self {
        Self {
            target,
            current: start,
            max_step,
        }
    }
}

impl Iterator for LinearMotion {
    type Item = Vec3;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.target.sub(self.current);
        let distance = remaining.norm();
        if distance == 0.0 {
            return None;
        }
        self.current = if distance <= self.max_step {
            self.target
        } else {
            self.current.add(remaining.scale(self.max_step / distance))
        };
        Some(self.current)
    }
}

/// Smallest waypoint spacing the planner accepts.
const MIN_STEP: f32 = 1e-3;

/// Planner with a spherical workspace and no obstacles.
#[derive(Debug)]
pub struct SimPlanner {
    arm: Arc<SimArm>,
    reach_center: Vec3,
    reach_radius: f32,
    max_step: f32,
    requests: Mutex<Vec<Pose>>,
}

impl SimPlanner {
    /// Unlimited reach, 5 cm waypoint spacing.
    pub fn new(arm: Arc<SimArm>) -> Self {
        Self {
            arm,
            reach_center: Vec3::zero(),
            reach_radius: f32::INFINITY,
            max_step: 0.05,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reject targets further than `radius` from `center`.
    pub fn with_reach(mut self, center: Vec3, radius: f32) -> Self {
        self.reach_center = center;
        self.reach_radius = radius;
        self
    }

    pub fn with_step(mut self, max_step: f32) -> Self {
        self.max_step = max_step.max(MIN_STEP);
        self
    }

    /// Every target passed to [`plan`][MotionPlanner::plan], oldest first.
    pub fn requests(&self) -> Vec<Pose> {
        lock(&self.requests).clone()
    }

    pub fn reachable(&self, target: &Pose) -> bool {
        target.position.sub(self.reach_center).norm() <= self.reach_radius
    }
}

#[async_trait]
impl MotionPlanner for SimPlanner {
    async fn plan(&self, target: &Pose) -> Result<Trajectory, StackError> {
        lock(&self.requests).push(*target);
        if !self.reachable(target) {
            debug!(target = ?target.position, "sim planner: target outside reach");
            return Ok(Trajectory::infeasible());
        }
        let start = self.arm.pose().position;
        let mut waypoints: Vec<Pose> = LinearMotion::new(start, target.position, self.max_step)
            .map(|p| Pose::new(p, target.orientation))
            .collect();
        if waypoints.is_empty() {
            // Already there; a single waypoint still counts as a plan.
            waypoints.push(*target);
        }
        Ok(Trajectory::new(waypoints))
    }

    async fn execute(&self, trajectory: &Trajectory) -> Result<(), StackError> {
        let end = trajectory.end_pose().ok_or_else(|| {
            StackError::PreconditionViolation("cannot execute an empty trajectory".to_string())
        })?;
        self.arm.command(MotionCommand::Pose(end), true).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vision
// ────────────────────────────────────────────────────────────────────────────

/// Ideal pinhole camera with the principal point at the image centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimCamera {
    /// `(width, height)` in pixels.
    pub resolution: (f32, f32),
    /// Focal length in pixels.
    pub focal_length: f32,
}

impl Default for SimCamera {
    fn default() -> Self {
        Self {
            resolution: (320.0, 200.0),
            focal_length: 200.0,
        }
    }
}

impl SimCamera {
    pub fn intrinsics(&self) -> CameraIntrinsics {
        let (w, h) = self.resolution;
        CameraIntrinsics::from_row_major([
            self.focal_length, 0.0, w / 2.0, //
            0.0, self.focal_length, h / 2.0, //
            0.0, 0.0, 1.0,
        ])
    }

    /// Pixel at which `point` appears from a down-looking camera at `eye`.
    ///
    /// Returns `None` when the point is not below the camera or falls outside
    /// the image.
    pub fn project(&self, eye: Vec3, point: Vec3) -> Option<(f32, f32)> {
        let depth = eye.z - point.z;
        if depth <= 0.0 {
            return None;
        }
        let (w, h) = self.resolution;
        let u = w / 2.0 + self.focal_length * (point.x - eye.x) / depth;
        let v = h / 2.0 - self.focal_length * (point.y - eye.y) / depth;
        ((0.0..w).contains(&u) && (0.0..h).contains(&v)).then_some((u, v))
    }
}

/// Hand camera and range sensor of one arm, looking straight down from the
/// end effector.
pub struct SimVision {
    side: Side,
    arm: Arc<SimArm>,
    world: Arc<SimWorld>,
    camera: SimCamera,
    feed: PerceptionFeed,
    tf: TfBuffer,
}

impl SimVision {
    pub fn new(
        side: Side,
        arm: Arc<SimArm>,
        world: Arc<SimWorld>,
        camera: SimCamera,
        feed: PerceptionFeed,
        tf: TfBuffer,
    ) -> Self {
        Self {
            side,
            arm,
            world,
            camera,
            feed,
            tf,
        }
    }

    /// Refresh the camera transform, then publish one range reading and one
    /// centroid sample for the current arm pose.
    pub fn tick(&self) {
        let eye = self.arm.pose().position;
        self.tf.set_transform(
            BASE_FRAME,
            &self.side.camera_frame(),
            Transform3D::new(eye, CAMERA_LOOKING_DOWN),
        );

        self.feed.publish_range(RangeSample {
            range: eye.z - self.world.surface_below(eye),
        });

        let sample = self
            .world
            .nearest_below(eye)
            .and_then(|object| self.observe(eye, &object))
            .unwrap_or_else(CentroidSample::no_detection);
        self.feed.publish_centroid(sample);
    }

    fn observe(&self, eye: Vec3, object: &SimObject) -> Option<CentroidSample> {
        let top = object.top();
        let (u, v) = self.camera.project(eye, top)?;
        let half_width = self.camera.focal_length * object.dimensions[0] / 2.0 / (eye.z - top.z);
        let extents = Extents {
            xmin: (u - half_width).max(0.0),
            xmax: (u + half_width).min(self.camera.resolution.0),
        };
        Some(CentroidSample::new(u, v, extents))
    }

    /// Publish the intrinsics once, then [`tick`][Self::tick] every `period`
    /// until the task is aborted.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        self.feed.publish_intrinsics(self.camera.intrinsics());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tracker
// ────────────────────────────────────────────────────────────────────────────

const TRACKER_SOURCE: &str = "servostack-hal::sim::tracker";

/// Reports every free object on [`Topic::TrackedObjects`][servostack_middleware::Topic::TrackedObjects].
pub struct SimTracker {
    world: Arc<SimWorld>,
    bus: SceneBus,
    offset: Vec3,
}

impl SimTracker {
    pub fn new(world: Arc<SimWorld>, bus: SceneBus) -> Self {
        Self {
            world,
            bus,
            offset: Vec3::zero(),
        }
    }

    /// Add a fixed error to every reported position, so the servo loop has
    /// something to correct.
    pub fn with_offset(mut self, offset: Vec3) -> Self {
        self.offset = offset;
        self
    }

    /// Current batch of free objects, as the tracker would report it.
    pub fn snapshot(&self) -> Vec<CollisionObject> {
        self.world
            .objects()
            .iter()
            .filter(|o| o.held_by.is_none())
            .map(|o| {
                let mut record = o.to_collision_object();
                for pose in &mut record.poses {
                    pose.position = pose.position.add(self.offset);
                }
                record
            })
            .collect()
    }

    /// Publish one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Channel`] when nobody is listening.
    pub fn publish_once(&self) -> Result<usize, StackError> {
        let event = SceneEvent::new(TRACKER_SOURCE, ScenePayload::ObjectBatch(self.snapshot()));
        self.bus.publish(event)
    }

    /// Publish a batch every `period` until the task is aborted.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = self.publish_once() {
                    debug!(error = %e, "sim tracker batch dropped");
                }
            }
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
