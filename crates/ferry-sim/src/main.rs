//! Ferry simulator
//!
//! Drives the save controller or the operation queue against an in-process
//! backend that fails at random. Runs on a paused tokio clock by default, so
//! minutes of debounce and backoff finish instantly.

mod flaky;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ferry_core::{
    EditorSession, EngineConfig, FailureSink, OperationQueue, ResourceId, SaveEnvironment,
    SaveStatus, TerminalFailure,
};
use ferry_resilience::CircuitBreaker;
use flaky::{Canvas, Flaky, FlakyMutations, FlakyStore};
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn cli() -> Command {
    Command::new("ferry-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Exercise the Ferry sync engine against a flaky backend")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration (TOML)"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .global(true)
                .default_value("42")
                .value_parser(value_parser!(u64))
                .help("Random seed for reproducibility"),
        )
        .arg(
            Arg::new("failure-rate")
                .long("failure-rate")
                .global(true)
                .default_value("0.3")
                .value_parser(value_parser!(f64))
                .help("Probability that a remote call fails"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log filter when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("realtime")
                .long("realtime")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Use the wall clock instead of a paused clock"),
        )
        .subcommand(
            Command::new("save")
                .about("Edit one document and let the save controller keep up")
                .arg(
                    Arg::new("edits")
                        .long("edits")
                        .default_value("20")
                        .value_parser(value_parser!(u32))
                        .help("Number of local edits"),
                )
                .arg(
                    Arg::new("edit-interval-ms")
                        .long("edit-interval-ms")
                        .default_value("700")
                        .value_parser(value_parser!(u64))
                        .help("Pause between edits"),
                )
                .arg(
                    Arg::new("manual-retries")
                        .long("manual-retries")
                        .default_value("1")
                        .value_parser(value_parser!(u32))
                        .help("Times to press retry after a terminal failure"),
                ),
        )
        .subcommand(
            Command::new("queue")
                .about("Replay a batch of card mutations")
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("12")
                        .value_parser(value_parser!(u32))
                        .help("Number of operations to enqueue"),
                )
                .arg(
                    Arg::new("revive")
                        .long("revive")
                        .action(ArgAction::SetTrue)
                        .help("Revive dead operations and drain once more"),
                ),
        )
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Keeps every terminal failure so the run can press retry
#[derive(Default)]
struct CollectingSink {
    failures: Mutex<Vec<TerminalFailure>>,
}

impl CollectingSink {
    fn last(&self) -> Option<TerminalFailure> {
        self.failures.lock().last().cloned()
    }

    fn count(&self) -> usize {
        self.failures.lock().len()
    }
}

impl FailureSink for CollectingSink {
    fn terminal_failure(&self, failure: TerminalFailure) {
        tracing::warn!(resource = %failure.resource_id, "surfacing failure: {}", failure.error);
        self.failures.lock().push(failure);
    }
}

struct Common {
    config: EngineConfig,
    seed: u64,
    failure_rate: f64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    init_tracing(level);

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::new(),
    };
    let common = Common {
        config,
        seed: matches.get_one::<u64>("seed").copied().unwrap_or(42),
        failure_rate: matches.get_one::<f64>("failure-rate").copied().unwrap_or(0.3),
    };

    if !matches.get_flag("realtime") {
        tokio::time::pause();
    }

    match matches.subcommand() {
        Some(("save", args)) => run_save(&common, args).await,
        Some(("queue", args)) => run_queue(&common, args).await,
        _ => {
            cli().print_help()?;
            Ok(())
        }
    }
}

async fn run_save(common: &Common, args: &ArgMatches) -> anyhow::Result<()> {
    let edits = args.get_one::<u32>("edits").copied().unwrap_or(20);
    let interval = Duration::from_millis(args.get_one::<u64>("edit-interval-ms").copied().unwrap_or(700));
    let mut manual_retries = args.get_one::<u32>("manual-retries").copied().unwrap_or(1);

    let store = Arc::new(FlakyStore::new(Flaky::new(
        common.seed,
        common.failure_rate,
        Duration::from_millis(400),
    )));
    let breaker = Arc::new(CircuitBreaker::new("documents", common.config.breaker.breaker_config()));
    let sink = Arc::new(CollectingSink::default());
    let env = SaveEnvironment::new(store.clone(), breaker.clone(), &common.config.save)
        .with_sink(sink.clone());
    let mut session = EditorSession::new(env);

    let canvas = Arc::new(Canvas::default());
    let resource = ResourceId::new("canvas-sim");
    let handle = session.open(resource.clone(), canvas.clone())?;
    let started = tokio::time::Instant::now();

    for n in 0..edits {
        canvas.draw(n);
        handle.notify_edit();
        if n % 5 == 4 {
            handle.blur();
        }
        tokio::time::sleep(interval).await;
    }
    handle.save_now();

    let mut updates = handle.subscribe();
    loop {
        // Let the controller drain its mailbox before judging the state
        tokio::time::sleep(Duration::from_millis(1)).await;
        let settled = updates.wait_for(|s| {
            !s.in_flight() && matches!(s.status(), SaveStatus::Saved | SaveStatus::Error)
        });
        tokio::time::timeout(Duration::from_secs(600), settled)
            .await
            .context("save did not settle within 10 minutes")?
            .context("save controller stopped")?;

        if handle.status() == SaveStatus::Error && manual_retries > 0 {
            manual_retries -= 1;
            if let Some(failure) = sink.last() {
                tracing::info!("pressing retry");
                failure.retry.retry();
            }
            continue;
        }
        break;
    }

    let state = handle.state();
    println!("Save Simulation Report:");
    println!("  Resource: {}", resource);
    println!("  Edits: {}", edits);
    println!("  Status: {}", state.status());
    println!("  Remote Calls: {}", store.calls());
    println!("  Terminal Failures: {}", sink.count());
    println!("  Retry Count: {}", state.retry_count());
    println!("  Unacknowledged Changes: {}", state.has_unacknowledged_changes());
    println!(
        "  Last Save: {}",
        state
            .last_save_time()
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
    );
    println!("  Breaker: {:?}", breaker.state());
    println!("  Elapsed: {}ms", started.elapsed().as_millis());

    if let Some(closed) = session.close() {
        closed.finished().await;
    }
    Ok(())
}

async fn run_queue(common: &Common, args: &ArgMatches) -> anyhow::Result<()> {
    let operations = args.get_one::<u32>("operations").copied().unwrap_or(12);
    let revive = args.get_flag("revive");

    let remote = Arc::new(FlakyMutations::new(Flaky::new(
        common.seed,
        common.failure_rate,
        Duration::from_millis(200),
    )));
    let breaker = Arc::new(CircuitBreaker::new("cards", common.config.breaker.breaker_config()));
    let queue = OperationQueue::new("card", remote.clone(), &common.config.queue).with_breaker(breaker);

    for n in 0..operations {
        let entity = format!("card-{}", n % 5);
        match n % 4 {
            0 => queue.enqueue_create(entity, json!({ "title": format!("Task {n}") })),
            1 => queue.enqueue_update(entity, json!({ "title": format!("Task {n} (edited)") })),
            2 => queue.enqueue_reorder(entity, n, "in_progress"),
            _ => queue.enqueue_delete(entity),
        };
    }

    let mut report = queue.drain().await;
    print_drain("Drain", &report);

    if revive && report.failed > 0 {
        for id in &report.dead {
            queue.revive(*id);
        }
        report = queue.drain().await;
        print_drain("Revived Drain", &report);
    }

    let dead = queue.dead();
    if !dead.is_empty() {
        println!("Dead Operations:");
        for d in &dead {
            println!(
                "  {} {} {} after {} retries: {}",
                d.operation.id, d.operation.kind, d.operation.entity, d.operation.retry_count, d.error
            );
        }
    }
    println!("Remote Calls: {}", remote.calls());
    Ok(())
}

fn print_drain(title: &str, report: &ferry_core::DrainReport) {
    println!("{title} Report:");
    println!("  Successful: {}", report.successful);
    println!("  Failed: {}", report.failed);
}
