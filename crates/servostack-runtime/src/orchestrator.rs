//! Pick-and-stack orchestration.
//!
//! For every tracked object, in order:
//!
//! 1. plan to an approach pose above the object (gripper pointing down);
//! 2. execute, then visually servo into grasp range;
//! 3. close the gripper, announce the attachment, retreat upwards;
//! 4. plan to the [`StackCursor`], execute, open, announce the release,
//!    retreat, remove the object from the scene and raise the cursor.
//!
//! A failed stage ends only the current object's cycle; the next object is
//! attempted from wherever the arm is.  The loop stops early only when the
//! shared shutdown flag is raised, in which case the scene is torn down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use servostack_hal::{Gripper, MotionCommand, MotionCommandInterface, MotionPlanner};
use servostack_middleware::{SceneBus, ScenePayload, Topic};
use servostack_perception::{FrameTransformProvider, PerceptionFeed};
use servostack_types::{GRIPPER_DOWN, Operation, Pose, Side, StackError, TargetObject, Vec3};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{ServoConfig, StackConfig};
use crate::registry::ObjectRegistry;
use crate::servo::VisualServoController;

/// Poll period of [`StackOrchestrator::wait_for_objects`].
const OBJECT_POLL: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Outcomes
// ────────────────────────────────────────────────────────────────────────────

/// How one object's pick-and-place cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Placed on the stack; the cursor moved up.
    Stacked,
    /// No plan to the approach pose.  Object and cursor untouched.
    ApproachInfeasible,
    /// Picked up, but no plan to the stack.  The object stays attached.
    PlaceInfeasible,
    /// Shutdown was requested before or during the cycle.
    Cancelled,
    /// A motion, gripper or servo error ended the cycle.
    Failed(StackError),
}

/// Per-object line of a [`StackReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReport {
    pub id: String,
    pub outcome: CycleOutcome,
    /// Base-frame position the hand camera measured when the servo
    /// converged, if it got that far.
    pub target_estimate: Option<Vec3>,
}

/// Result of [`StackOrchestrator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct StackReport {
    pub cycles: Vec<ObjectReport>,
    /// Where the next object would have been placed.
    pub final_cursor: Pose,
}

impl StackReport {
    pub fn stacked(&self) -> usize {
        self.cycles
            .iter()
            .filter(|c| c.outcome == CycleOutcome::Stacked)
            .count()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cycles
            .iter()
            .any(|c| c.outcome == CycleOutcome::Cancelled)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StackCursor
// ────────────────────────────────────────────────────────────────────────────

/// Running placement pose.  Only moves up, one step per successful
/// placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackCursor {
    pose: Pose,
    step: f32,
    placed: usize,
}

impl StackCursor {
    pub fn new(initial: Pose, step: f32) -> Self {
        Self {
            pose: initial,
            step,
            placed: 0,
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Number of placements recorded so far.
    pub fn placed(&self) -> usize {
        self.placed
    }

    pub fn advance(&mut self) {
        self.pose = self.pose.with_z_offset(self.step);
        self.placed += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborator handles
// ────────────────────────────────────────────────────────────────────────────

/// The arm-side collaborators of one manipulator.
#[derive(Clone)]
pub struct ArmHandles {
    pub motion: Arc<dyn MotionCommandInterface>,
    pub planner: Arc<dyn MotionPlanner>,
    pub gripper: Arc<dyn Gripper>,
}

/// The sensing collaborators the servo controllers consume.
#[derive(Clone)]
pub struct PerceptionHandles {
    pub feed: PerceptionFeed,
    pub transforms: Arc<dyn FrameTransformProvider>,
}

enum ServoRun {
    Complete(Option<Vec3>),
    Cancelled,
}

// ────────────────────────────────────────────────────────────────────────────
// StackOrchestrator
// ────────────────────────────────────────────────────────────────────────────

/// Stacks tracked objects with one arm.
pub struct StackOrchestrator {
    side: Side,
    arm: ArmHandles,
    perception: PerceptionHandles,
    bus: SceneBus,
    registry: ObjectRegistry,
    servo_config: ServoConfig,
    config: StackConfig,
    cursor: StackCursor,
    last_estimate: Option<Vec3>,
    shutdown: Arc<AtomicBool>,
}

impl StackOrchestrator {
    pub fn new(
        side: Side,
        arm: ArmHandles,
        perception: PerceptionHandles,
        bus: SceneBus,
        servo_config: ServoConfig,
        config: StackConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let registry = ObjectRegistry::new(bus.clone(), config.teardown_rate());
        let cursor = StackCursor::new(config.stack_pose(), config.stack_step());
        Self {
            side,
            arm,
            perception,
            bus,
            registry,
            servo_config,
            config,
            cursor,
            last_estimate: None,
            shutdown,
        }
    }

    pub fn cursor(&self) -> StackCursor {
        self.cursor
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Merge a tracker batch into the registry.
    pub fn track(&mut self, batch: Vec<servostack_types::CollisionObject>) -> usize {
        self.registry.receive(batch)
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Every registered object as a stacking target, in insertion order.
    pub fn targets(&self) -> Vec<TargetObject> {
        self.registry
            .objects()
            .iter()
            .filter_map(|o| TargetObject::from_collision_object(o, self.config.object_height))
            .collect()
    }

    /// Merge tracker batches until at least one object is known.
    ///
    /// Returns the targets, or an empty list when shutdown was requested
    /// first.
    ///
    /// # Errors
    ///
    /// [`StackError::Channel`] if the bus closes while waiting.
    pub async fn wait_for_objects(&mut self) -> Result<Vec<TargetObject>, StackError> {
        let mut rx = self.bus.subscribe_to(Topic::TrackedObjects);
        while self.registry.is_empty() {
            if self.cancelled() {
                info!("shutdown requested while waiting for objects");
                return Ok(Vec::new());
            }
            match tokio::time::timeout(OBJECT_POLL, rx.recv()).await {
                Ok(Some(event)) => {
                    if let ScenePayload::ObjectBatch(batch) = event.payload {
                        let added = self.registry.receive(batch);
                        debug!(added, "tracker batch merged");
                    }
                }
                Ok(None) => {
                    return Err(StackError::Channel(
                        "scene bus closed while waiting for objects".to_string(),
                    ));
                }
                Err(_) => debug!("no tracked objects yet"),
            }
        }
        let targets = self.targets();
        info!(count = targets.len(), "objects to stack");
        Ok(targets)
    }

    /// Stack `objects` in order.  Raising the shutdown flag cancels the
    /// remaining cycles and tears the scene down.
    pub async fn run(&mut self, mut objects: Vec<TargetObject>) -> StackReport {
        let mut cycles = Vec::with_capacity(objects.len());
        let mut cancelled = false;

        for object in &mut objects {
            self.last_estimate = None;
            let outcome = if cancelled || self.cancelled() {
                CycleOutcome::Cancelled
            } else {
                self.run_cycle(object).await
            };
            cancelled |= outcome == CycleOutcome::Cancelled;
            cycles.push(ObjectReport {
                id: object.id.clone(),
                outcome,
                target_estimate: self.last_estimate.take(),
            });
        }

        if cancelled {
            self.teardown().await;
        }

        let report = StackReport {
            cycles,
            final_cursor: self.cursor.pose(),
        };
        info!(
            stacked = report.stacked(),
            total = report.cycles.len(),
            cancelled,
            "stacking finished"
        );
        report
    }

    /// Remove every tracked object from the scene, rate-limited.
    pub async fn teardown(&mut self) -> usize {
        self.registry.teardown().await
    }

    #[instrument(skip_all, fields(object = %object.id, side = self.side.as_str()))]
    async fn run_cycle(&mut self, object: &mut TargetObject) -> CycleOutcome {
        match self.try_cycle(object).await {
            Ok(outcome) => {
                info!(?outcome, "cycle finished");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "cycle failed");
                CycleOutcome::Failed(e)
            }
        }
    }

    async fn try_cycle(&mut self, object: &mut TargetObject) -> Result<CycleOutcome, StackError> {
        let approach = object
            .pose
            .with_orientation(GRIPPER_DOWN)
            .with_z_offset(self.config.approach_offset());

        let plan = self.arm.planner.plan(&approach).await?;
        if plan.is_empty() {
            warn!("unable to plan to the approach pose");
            return Ok(CycleOutcome::ApproachInfeasible);
        }
        self.arm.planner.execute(&plan).await?;

        match self.servo_to_grasp().await? {
            ServoRun::Cancelled => return Ok(CycleOutcome::Cancelled),
            ServoRun::Complete(estimate) => {
                if let Some(p) = estimate {
                    debug!(x = p.x, y = p.y, z = p.z, "target located by hand camera");
                }
                self.last_estimate = estimate;
            }
        }

        self.arm.gripper.close().await?;
        object.attached = Some(self.side);
        if let Err(e) = self.registry.publish_attached(&object.id, self.side) {
            warn!(error = %e, "attachment record not delivered");
        }
        self.move_to(approach.with_z_offset(self.config.retreat_offset()))
            .await?;

        let target = self.cursor.pose();
        let plan = self.arm.planner.plan(&target).await?;
        if plan.is_empty() {
            warn!(stack = ?target.position, "unable to plan to the stack; object stays in hand");
            return Ok(CycleOutcome::PlaceInfeasible);
        }
        self.arm.planner.execute(&plan).await?;
        self.arm.gripper.open(true).await?;
        object.attached = None;
        if let Err(e) = self.registry.publish_detached(&object.id, self.side) {
            warn!(error = %e, "release record not delivered");
        }
        self.move_to(target.with_z_offset(self.config.retreat_offset()))
            .await?;

        object.operation = Operation::Remove;
        if let Err(e) = self
            .registry
            .set_operation(&object.id, Operation::Remove)
            .and_then(|()| self.registry.publish(&object.id))
        {
            warn!(error = %e, "removal record not delivered");
        }
        self.cursor.advance();
        Ok(CycleOutcome::Stacked)
    }

    async fn move_to(&self, pose: Pose) -> Result<(), StackError> {
        self.arm
            .motion
            .command(MotionCommand::Pose(pose), true)
            .await
    }

    /// Run a fresh servo controller until it completes, fails, times out or
    /// shutdown is requested.
    async fn servo_to_grasp(&self) -> Result<ServoRun, StackError> {
        let mut servo = VisualServoController::new(
            self.side,
            Arc::clone(&self.arm.motion),
            Arc::clone(&self.perception.transforms),
            self.servo_config.clone(),
        );
        servo.subscribe(&self.perception.feed);
        let deadline = self.config.servo_timeout().map(|t| Instant::now() + t);
        let idle = self.config.idle_wait();

        loop {
            if self.cancelled() {
                if let Err(e) = servo.unsubscribe().await {
                    debug!(error = %e, "servo error ignored during shutdown");
                }
                return Ok(ServoRun::Cancelled);
            }
            if servo.done() {
                let estimate = servo.target_estimate();
                servo.unsubscribe().await?;
                return Ok(ServoRun::Complete(estimate));
            }
            if !servo.is_running() {
                servo.unsubscribe().await?;
                return Err(StackError::Channel(
                    "visual servo stopped before reaching the target".to_string(),
                ));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                servo.unsubscribe().await?;
                return Err(StackError::Timeout(format!(
                    "visual servo did not converge (last state {:?})",
                    servo.state()
                )));
            }
            tokio::time::sleep(idle).await;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use servostack_hal::sim::{
        SimArm, SimCamera, SimGripper, SimPlanner, SimTracker, SimVision, SimWorld,
    };
    use servostack_middleware::TopicReceiver;
    use servostack_perception::TfBuffer;
    use servostack_types::{
        CentroidSample, CollisionObject, Extents, Geometry, Quaternion, RangeSample, Vec3,
    };
    use tokio::task::JoinHandle;

    const SIDE: Side = Side::Left;

    struct Cell {
        arm: Arc<SimArm>,
        planner: Arc<SimPlanner>,
        gripper: Arc<SimGripper>,
        feed: PerceptionFeed,
        bus: SceneBus,
        shutdown: Arc<AtomicBool>,
        _collisions: TopicReceiver,
    }

    impl Cell {
        fn new() -> Self {
            let arm = Arc::new(SimArm::new(
                SIDE,
                Pose::new(Vec3::new(0.5, 0.0, 0.3), GRIPPER_DOWN),
            ));
            let planner = Arc::new(SimPlanner::new(arm.clone()).with_reach(Vec3::zero(), 1.5));
            let bus = SceneBus::default();
            Self {
                arm,
                planner,
                gripper: Arc::new(SimGripper::new(SIDE)),
                feed: PerceptionFeed::default(),
                _collisions: bus.subscribe_to(Topic::CollisionObjects),
                bus,
                shutdown: Arc::new(AtomicBool::new(false)),
            }
        }

        fn orchestrator(&self, config: StackConfig) -> StackOrchestrator {
            StackOrchestrator::new(
                SIDE,
                ArmHandles {
                    motion: self.arm.clone(),
                    planner: self.planner.clone(),
                    gripper: self.gripper.clone(),
                },
                PerceptionHandles {
                    feed: self.feed.clone(),
                    transforms: Arc::new(TfBuffer::new()),
                },
                self.bus.clone(),
                ServoConfig::default(),
                config,
                self.shutdown.clone(),
            )
        }

        /// Vision that always sees the target centred and within reach, so
        /// every servo run completes on its first centroid.
        fn centred_vision(&self) -> JoinHandle<()> {
            let feed = self.feed.clone();
            let (u, v) = ServoConfig::default().goal_position();
            tokio::spawn(async move {
                loop {
                    feed.publish_range(RangeSample { range: 0.01 });
                    feed.publish_centroid(CentroidSample::new(u, v, Extents::unknown()));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        }

        /// z of every pose the planner was asked to reach at the stack.
        fn placements(&self, stack_x: f32) -> Vec<f32> {
            self.planner
                .requests()
                .iter()
                .filter(|p| (p.position.x - stack_x).abs() < 1e-6)
                .map(|p| p.position.z)
                .collect()
        }
    }

    fn config(object_height: f32, stack_base_height: f32) -> StackConfig {
        StackConfig {
            object_height,
            stack_xy: [0.2, -0.4],
            stack_base_height,
            idle_wait_ms: 2,
            teardown_rate_hz: 1000,
            ..StackConfig::default()
        }
    }

    fn cube(id: &str, x: f32, y: f32) -> CollisionObject {
        CollisionObject::new(
            id,
            Geometry::Box {
                dimensions: [0.05, 0.05, 0.05],
            },
            Pose::new(Vec3::new(x, y, -0.1), Quaternion::identity()),
        )
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn cursor_only_moves_up_on_advance() {
        let mut cursor = StackCursor::new(Pose::default(), 0.045);
        assert_eq!(cursor.placed(), 0);
        cursor.advance();
        cursor.advance();
        assert!((cursor.pose().position.z - 0.09).abs() < 1e-6);
        assert_eq!(cursor.placed(), 2);
    }

    #[tokio::test]
    async fn cursor_rises_three_quarters_per_object() {
        let cell = Cell::new();
        let vision = cell.centred_vision();
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        orchestrator.track(vec![
            cube("a", 0.5, 0.0),
            cube("b", 0.6, 0.1),
            cube("c", 0.4, -0.1),
        ]);
        let targets = orchestrator.targets();

        let report = orchestrator.run(targets).await;
        vision.abort();

        assert_eq!(report.stacked(), 3);
        assert_close(&cell.placements(0.2), &[0.10, 0.145, 0.19]);
        assert!((report.final_cursor.position.z - 0.235).abs() < 1e-5);
        assert_eq!(orchestrator.cursor().placed(), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(orchestrator.registry().operation(id), Some(Operation::Remove));
            assert_eq!(orchestrator.registry().attached_side(id), None);
        }
        assert_eq!((cell.gripper.close_count(), cell.gripper.open_count()), (3, 3));
    }

    #[tokio::test]
    async fn unreachable_object_is_skipped() {
        let cell = Cell::new();
        let vision = cell.centred_vision();
        let mut orchestrator = cell.orchestrator(config(0.05, 0.05));
        orchestrator.track(vec![
            cube("a", 0.5, 0.0),
            cube("far", 3.0, 0.0),
            cube("c", 0.4, -0.1),
        ]);
        let targets = orchestrator.targets();

        let report = orchestrator.run(targets).await;
        vision.abort();

        let outcomes: Vec<_> = report.cycles.iter().map(|c| c.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                CycleOutcome::Stacked,
                CycleOutcome::ApproachInfeasible,
                CycleOutcome::Stacked
            ]
        );
        assert_close(&cell.placements(0.2), &[0.10, 0.1375]);
        assert!((report.final_cursor.position.z - 0.175).abs() < 1e-5);
        assert_eq!(orchestrator.registry().operation("far"), Some(Operation::Add));
    }

    #[tokio::test]
    async fn approach_is_above_object_with_gripper_down() {
        let cell = Cell::new();
        let vision = cell.centred_vision();
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        orchestrator.track(vec![cube("a", 0.5, 0.0)]);
        let targets = orchestrator.targets();
        orchestrator.run(targets).await;
        vision.abort();

        let approach = cell.planner.requests()[0];
        assert!((approach.position.z - (-0.1 + 1.7 * 0.06)).abs() < 1e-5);
        assert_eq!(approach.orientation, GRIPPER_DOWN);

        // Retreat after grasp: approach + 2h, absolute and blocking.
        let retreat = cell
            .arm
            .history()
            .into_iter()
            .find(|c| match &c.command {
                MotionCommand::Pose(p) => (p.position.z - (approach.position.z + 0.12)).abs() < 1e-5,
                MotionCommand::Delta(_) => false,
            })
            .expect("retreat after grasp");
        assert!(retreat.blocking);
    }

    #[tokio::test]
    async fn unreachable_stack_keeps_object_attached() {
        let cell = Cell::new();
        let vision = cell.centred_vision();
        let mut config = config(0.06, 0.04);
        config.stack_xy = [2.0, 0.0];
        let mut orchestrator = cell.orchestrator(config);
        orchestrator.track(vec![cube("a", 0.5, 0.0)]);
        let targets = orchestrator.targets();

        let report = orchestrator.run(targets).await;
        vision.abort();

        assert_eq!(report.cycles[0].outcome, CycleOutcome::PlaceInfeasible);
        assert_eq!(orchestrator.cursor().placed(), 0);
        assert_eq!(orchestrator.registry().operation("a"), Some(Operation::Add));
        assert_eq!(orchestrator.registry().attached_side("a"), Some(SIDE));
        assert_eq!(cell.gripper.open_count(), 0);
    }

    #[tokio::test]
    async fn servo_timeout_fails_only_that_cycle() {
        let cell = Cell::new();
        let mut config = config(0.06, 0.04);
        config.servo_timeout_ms = Some(30);
        let mut orchestrator = cell.orchestrator(config);
        orchestrator.track(vec![cube("a", 0.5, 0.0), cube("b", 0.6, 0.0)]);
        let targets = orchestrator.targets();

        // No vision at all: the servo never converges.
        let report = orchestrator.run(targets).await;

        assert_eq!(report.cycles.len(), 2);
        for cycle in &report.cycles {
            assert!(matches!(cycle.outcome, CycleOutcome::Failed(StackError::Timeout(_))));
        }
        assert_eq!(cell.gripper.close_count(), 0);
        assert_eq!(orchestrator.cursor().placed(), 0);
    }

    #[tokio::test]
    async fn servo_failure_is_reported_as_failed_cycle() {
        let cell = Cell::new();
        // Centroids but never a range reading.
        let feed = cell.feed.clone();
        let vision = tokio::spawn(async move {
            loop {
                feed.publish_centroid(CentroidSample::new(200.0, 150.0, Extents::unknown()));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        orchestrator.track(vec![cube("a", 0.5, 0.0)]);
        let targets = orchestrator.targets();

        let report = orchestrator.run(targets).await;
        vision.abort();

        assert!(matches!(
            report.cycles[0].outcome,
            CycleOutcome::Failed(StackError::PreconditionViolation(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_and_tears_down() {
        let cell = Cell::new();
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        orchestrator.track(vec![cube("a", 0.5, 0.0), cube("b", 0.6, 0.0)]);
        let targets = orchestrator.targets();
        cell.shutdown.store(true, Ordering::SeqCst);

        let report = orchestrator.run(targets).await;

        assert!(report.was_cancelled());
        assert!(report.cycles.iter().all(|c| c.outcome == CycleOutcome::Cancelled));
        assert!(cell.planner.requests().is_empty());
        assert_eq!(orchestrator.registry().operation("a"), Some(Operation::Remove));
        assert_eq!(orchestrator.registry().operation("b"), Some(Operation::Remove));
    }

    #[tokio::test]
    async fn grasp_and_release_are_announced() {
        let cell = Cell::new();
        let mut attached = cell.bus.subscribe_to(Topic::AttachedObjects);
        let vision = cell.centred_vision();
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        orchestrator.track(vec![cube("a", 0.5, 0.0)]);
        let targets = orchestrator.targets();
        orchestrator.run(targets).await;
        vision.abort();

        let ops: Vec<Operation> = std::iter::from_fn(|| attached.try_recv())
            .filter_map(|e| match e.payload {
                ScenePayload::AttachedCollisionObject(a) => Some(a.object.operation),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec![Operation::Add, Operation::Remove]);
    }

    #[tokio::test]
    async fn wait_for_objects_merges_tracker_batches() {
        let cell = Cell::new();
        let world = Arc::new(SimWorld::new(-0.13));
        world.add_box("cube_1", 0.5, 0.0, [0.05, 0.05, 0.05]);
        let tracker = SimTracker::new(world, cell.bus.clone()).spawn(Duration::from_millis(5));

        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        let targets = tokio::time::timeout(Duration::from_secs(3), orchestrator.wait_for_objects())
            .await
            .expect("objects in time")
            .unwrap();
        tracker.abort();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "cube_1");
        assert!((targets[0].height - 0.06).abs() < 1e-6);
    }

    #[tokio::test]
    async fn wait_for_objects_honours_shutdown() {
        let cell = Cell::new();
        cell.shutdown.store(true, Ordering::SeqCst);
        let mut orchestrator = cell.orchestrator(config(0.06, 0.04));
        let targets = orchestrator.wait_for_objects().await.unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn simulated_cell_stacks_every_box() {
        const TABLE: f32 = -0.13;
        const BOX: [f32; 3] = [0.05, 0.05, 0.06];
        let spots = [(0.62, 0.08), (0.70, -0.02), (0.52, 0.22)];

        let world = Arc::new(SimWorld::new(TABLE));
        for (i, (x, y)) in spots.iter().enumerate() {
            world.add_box(format!("cube_{}", i + 1), *x, *y, BOX);
        }
        let arm = Arc::new(SimArm::new(
            SIDE,
            Pose::new(Vec3::new(0.6, 0.0, 0.15), GRIPPER_DOWN),
        ));
        let gripper = Arc::new(SimGripper::new(SIDE).in_world(arm.clone(), world.clone()));
        let planner = Arc::new(SimPlanner::new(arm.clone()).with_reach(Vec3::zero(), 1.2));
        let feed = PerceptionFeed::default();
        let tf = TfBuffer::new();
        let vision = SimVision::new(
            SIDE,
            arm.clone(),
            world.clone(),
            SimCamera::default(),
            feed.clone(),
            tf.clone(),
        )
        .spawn(Duration::from_millis(2));

        let bus = SceneBus::default();
        let _collisions = bus.subscribe_to(Topic::CollisionObjects);
        // Tracked positions are off by ~1.5 cm; the hand camera corrects that.
        let tracked = SimTracker::new(world.clone(), bus.clone())
            .with_offset(Vec3::new(0.012, -0.01, 0.0))
            .snapshot();

        let config = StackConfig {
            servo_timeout_ms: Some(20_000),
            teardown_rate_hz: 1000,
            ..StackConfig::default()
        };
        let mut orchestrator = StackOrchestrator::new(
            SIDE,
            ArmHandles {
                motion: arm,
                planner,
                gripper: gripper.clone(),
            },
            PerceptionHandles {
                feed,
                transforms: Arc::new(tf),
            },
            bus,
            ServoConfig::default(),
            config.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        orchestrator.track(tracked);
        let targets = orchestrator.targets();

        let report = orchestrator.run(targets).await;
        vision.abort();

        assert_eq!(report.stacked(), 3, "{:?}", report.cycles);
        assert_eq!(gripper.close_count(), 3);

        // Each box was located at its true top, not at the tracked position.
        let top = TABLE + BOX[2];
        for (cycle, (x, y)) in report.cycles.iter().zip(spots) {
            let seen = cycle.target_estimate.expect("estimate after servoing");
            assert!((seen.x - x).abs() < 0.005, "{}: {seen:?}", cycle.id);
            assert!((seen.y - y).abs() < 0.005, "{}: {seen:?}", cycle.id);
            assert!((seen.z - top).abs() < 0.005, "{}: {seen:?}", cycle.id);
        }

        // Boxes sit on the stack with their tops at the successive cursor heights.
        let [sx, sy] = config.stack_xy;
        for (i, expected_top) in [-0.07, -0.025, 0.02].into_iter().enumerate() {
            let placed = world.object(&format!("cube_{}", i + 1)).unwrap();
            assert!(placed.held_by.is_none());
            assert!((placed.center.x - sx).abs() < 1e-4, "{placed:?}");
            assert!((placed.center.y - sy).abs() < 1e-4, "{placed:?}");
            assert!((placed.top().z - expected_top).abs() < 1e-4, "{placed:?}");
        }
        assert!((report.final_cursor.position.z - 0.065).abs() < 1e-4);
    }
}
