mod cli;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use clap::Parser;

use pf_core::{Point3, PathOutcome};
use pf_demo::{AStarSearch, GridGraph};
use pf_engine::{Engine, EngineConfig, EngineEvent};

use crate::cli::Cli;

/// Deterministic terrain: open ground with a thin frame of walls, optionally
/// split down the middle column so `--split-areas` can exercise the
/// flood-fill "no route between areas" short-circuit.
fn terrain(width: u32, height: u32, split_areas: bool) -> impl Fn(i32, i32) -> (bool, u32) + Send + Sync {
    move |x, y| {
        let border = x == 0 || y == 0 || x == width as i32 - 1 || y == height as i32 - 1;
        let splitting_wall = split_areas && x == width as i32 / 2 && y != 0;
        let walkable = !splitting_wall && (!border || x == 0 || y == 0);
        let penalty = if (x + y) % 7 == 0 { 2 } else { 0 };
        (walkable, penalty)
    }
}

fn demo_requests(width: u32, height: u32, count: usize) -> Vec<(Point3, Point3)> {
    let corners = [
        Point3::new(1.0, 0.0, 1.0),
        Point3::new((width - 2) as f32, 0.0, 1.0),
        Point3::new(1.0, 0.0, (height - 2) as f32),
        Point3::new((width - 2) as f32, 0.0, (height - 2) as f32),
    ];
    let center = Point3::new((width / 2) as f32, 0.0, (height / 2) as f32);
    let templates = [
        (corners[0], corners[3]),
        (corners[1], corners[2]),
        (corners[0], center),
        (center, corners[3]),
    ];
    (0..count).map(|i| templates[i % templates.len()]).collect()
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::Started => tracing::info!("engine started"),
        EngineEvent::ScanStarted => tracing::info!("scan started"),
        EngineEvent::ScanCompleted { duration_ms } => {
            tracing::info!(duration_ms, "scan completed")
        }
        EngineEvent::PathStarted { path_id } => tracing::debug!(path_id, "path started"),
        EngineEvent::PathReturned { path_id, errored, duration_ms } => {
            tracing::debug!(path_id, errored, duration_ms, "path returned")
        }
        EngineEvent::GraphsUpdated => tracing::info!("graphs updated"),
        EngineEvent::Overflow65k => tracing::warn!("path id space wrapped"),
        EngineEvent::Warning { message } => tracing::warn!(%message),
        EngineEvent::Terminated => tracing::info!("engine terminated"),
    }
}

fn print_outcome(outcome: &PathOutcome) {
    match &outcome.error {
        Some(err) => println!("path {}: error ({err}) in {:?}", outcome.id.0, outcome.duration),
        None => println!("path {}: returned in {:?}", outcome.id.0, outcome.duration),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.paths == 0 {
        anyhow::bail!("--paths must be >= 1");
    }

    let grid = GridGraph::new(cli.width as i32, cli.height as i32, 1.0, 0, terrain(cli.width, cli.height, cli.split_areas));

    let config = EngineConfig {
        workers: cli.worker_hint(),
        search_tick_budget: Duration::from_micros(cli.tick_budget_us),
        ..EngineConfig::default()
    };
    let mut engine = Engine::initialize(config, vec![Box::new(grid.clone())]);

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(event);
        }
    });

    println!("pf-cli: scanning a {}x{} grid", cli.width, cli.height);
    engine.scan();

    let requests = demo_requests(cli.width, cli.height, cli.paths);
    let (result_tx, result_rx) = mpsc::channel::<PathOutcome>();
    for (start, end) in &requests {
        let search = AStarSearch::new(grid.clone(), *start, *end);
        let tx = result_tx.clone();
        engine.start_path(Box::new(search), Some(Box::new(move |outcome| { let _ = tx.send(outcome); })), false)?;
    }
    drop(result_tx);

    let expected = requests.len();
    let drive = tokio::task::spawn_blocking(move || {
        let mut received = 0usize;
        while received < expected {
            engine.tick();
            match result_rx.recv_timeout(Duration::from_millis(5)) {
                Ok(outcome) => {
                    print_outcome(&outcome);
                    received += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        engine.destroy();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("pf-cli: interrupted, exiting immediately");
            std::process::exit(130);
        }
        result = drive => {
            result?;
        }
    }

    Ok(())
}
