//! `servostack` – stacks every tracked object with one arm of a simulated
//! cell.
//!
//! 1. Loads `~/.servostack/config.toml` (see [`config`]).
//! 2. Installs a Ctrl-C handler that raises the shared shutdown flag.
//! 3. Wires the simulated arm, gripper, planner, hand camera and tracker.
//! 4. Waits for tracked objects, stacks them, prints a summary and removes
//!    every object from the collision scene before exiting.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use servostack_hal::sim::{SimArm, SimCamera, SimGripper, SimPlanner, SimTracker, SimVision, SimWorld};
use servostack_middleware::{SceneBus, ScenePayload, Topic};
use servostack_perception::{PerceptionFeed, TfBuffer};
use servostack_runtime::{
    ArmHandles, CycleOutcome, PerceptionHandles, StackOrchestrator, StackReport, init_tracing,
};
use servostack_types::{GRIPPER_DOWN, Pose, Side, StackError, Vec3};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Limb {
    Left,
    Right,
}

impl From<Limb> for Side {
    fn from(limb: Limb) -> Self {
        match limb {
            Limb::Left => Side::Left,
            Limb::Right => Side::Right,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "servostack", version, about = "Visual-servo pick-and-stack for one arm")]
struct Cli {
    /// Arm to stack with.
    #[arg(long, value_enum)]
    limb: Limb,

    /// Config file; defaults to $SERVOSTACK_CONFIG or ~/.servostack/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the resolved configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Before the runtime: the OTLP exporter is synchronous.
    let _guard = init_tracing("servostack");

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red().bold());
            return ExitCode::FAILURE;
        }
    };
    if cli.print_config {
        return match config::to_toml(&cfg) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", "Config error".red().bold());
                ExitCode::FAILURE
            }
        };
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received, stopping after teardown …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Ctrl-C handler unavailable; stop with SIGKILL");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let side = Side::from(cli.limb);
    println!(
        "\n  {} {} with the {} arm\n",
        "servostack".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        side.as_str().bold()
    );

    match runtime.block_on(run(side, cfg, shutdown)) {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {e}", "Error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(side: Side, cfg: Config, shutdown: Arc<AtomicBool>) -> Result<StackReport, StackError> {
    let sim = &cfg.sim;
    let world = Arc::new(SimWorld::new(sim.table_height));
    for (i, [x, y]) in sim.objects.iter().enumerate() {
        world.add_box(format!("cube_{}", i + 1), *x, *y, sim.object_dimensions);
    }

    let [sx, sy, sz] = sim.start_position;
    let arm = Arc::new(SimArm::new(side, Pose::new(Vec3::new(sx, sy, sz), GRIPPER_DOWN)));
    let gripper = Arc::new(SimGripper::new(side).in_world(arm.clone(), world.clone()));
    let planner = Arc::new(SimPlanner::new(arm.clone()).with_reach(Vec3::zero(), sim.reach_radius));

    let feed = PerceptionFeed::default();
    let tf = TfBuffer::new();
    let vision = SimVision::new(
        side,
        arm.clone(),
        world.clone(),
        SimCamera::default(),
        feed.clone(),
        tf.clone(),
    )
    .spawn(Duration::from_millis(sim.vision_period_ms));

    let bus = SceneBus::default();
    let monitor = spawn_scene_monitor(&bus);
    let [ox, oy, oz] = sim.tracker_offset;
    let tracker = SimTracker::new(world.clone(), bus.clone())
        .with_offset(Vec3::new(ox, oy, oz))
        .spawn(Duration::from_millis(sim.tracker_period_ms));

    let mut orchestrator = StackOrchestrator::new(
        side,
        ArmHandles {
            motion: arm,
            planner,
            gripper,
        },
        PerceptionHandles {
            feed,
            transforms: Arc::new(tf),
        },
        bus,
        cfg.servo.clone(),
        cfg.stack.clone(),
        shutdown,
    );

    let result = async {
        let targets = orchestrator.wait_for_objects().await?;
        tracker.abort();
        let report = orchestrator.run(targets).await;
        // A cancelled run has already torn the scene down.
        if !report.was_cancelled() {
            orchestrator.teardown().await;
        }
        Ok::<_, StackError>(report)
    }
    .await;

    tracker.abort();
    vision.abort();
    monitor.abort();
    result
}

/// Log every record the scene consumer would receive.
fn spawn_scene_monitor(bus: &SceneBus) -> JoinHandle<()> {
    let mut objects = bus.subscribe_to(Topic::CollisionObjects);
    let mut attached = bus.subscribe_to(Topic::AttachedObjects);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(e) = objects.recv() => e,
                Some(e) = attached.recv() => e,
                else => break,
            };
            match event.to_json() {
                Ok(json) => debug!(source = %event.source, "{json}"),
                Err(e) => warn!(error = %e, "scene event not serialisable"),
            }
            match &event.payload {
                ScenePayload::CollisionObject(o) => {
                    info!(object = %o.id, operation = ?o.operation, "scene object");
                }
                ScenePayload::AttachedCollisionObject(a) => {
                    info!(object = %a.object.id, link = %a.link_name, operation = ?a.object.operation, "scene attachment");
                }
                ScenePayload::ObjectBatch(_) => {}
            }
        }
    })
}

fn print_summary(report: &StackReport) {
    println!();
    println!("  {}", "Summary".bold());
    for cycle in &report.cycles {
        let outcome = match &cycle.outcome {
            CycleOutcome::Stacked => "stacked".green(),
            CycleOutcome::ApproachInfeasible => "skipped (approach unreachable)".yellow(),
            CycleOutcome::PlaceInfeasible => "held (stack unreachable)".yellow(),
            CycleOutcome::Cancelled => "cancelled".dimmed(),
            CycleOutcome::Failed(e) => format!("failed: {e}").as_str().red(),
        };
        match cycle.target_estimate {
            Some(seen) => println!(
                "    • {:<12} {outcome} {}",
                cycle.id.bold(),
                format!("(seen at {:.3}, {:.3}, {:.3})", seen.x, seen.y, seen.z).dimmed()
            ),
            None => println!("    • {:<12} {outcome}", cycle.id.bold()),
        }
    }
    let p = report.final_cursor.position;
    println!(
        "\n  {} of {} stacked; next placement at ({:.3}, {:.3}, {:.3})\n",
        report.stacked().to_string().bold(),
        report.cycles.len(),
        p.x,
        p.y,
        p.z
    );
}
