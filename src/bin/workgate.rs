//! workgate CLI: inspect configuration and exercise the coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use workgate::config::{Config, WorkgateFile};
use workgate::model::{ConflictPolicy, ExecutionMode, WorkRequest, WorkResult};
use workgate::telemetry::{TelemetryConfig, init_telemetry};
use workgate::WorkCoordinator;

#[derive(Parser)]
#[command(name = "workgate", about = "Background work coordinator")]
struct Cli {
    /// TOML config file (overrides WORKGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,
    /// Run a simulated upload workload through the coordinator
    Simulate {
        /// Work id to register and dispatch
        #[arg(long, default_value = "upload")]
        work_id: String,
        /// Number of requests to dispatch
        #[arg(long, default_value_t = 5)]
        requests: u32,
        /// Conflict policy: append, replace or keep_existing
        #[arg(long, default_value = "append")]
        policy: String,
        /// Every Nth attempt fails (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
        /// Rate limit applied to every request, as hits per interval
        #[arg(long)]
        rate: Option<u32>,
        /// Rate limit interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Concurrent workers slots (1 = serial)
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// How long to let the workload run
        #[arg(long, default_value_t = 10)]
        run_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if cli.config.is_some() {
        config.config_file = cli.config;
    }
    let file = config.load_file()?;

    match cli.command {
        Command::Config => cmd_config(&config, &file),
        Command::Simulate {
            work_id,
            requests,
            policy,
            fail_every,
            rate,
            interval_ms,
            concurrency,
            run_secs,
        } => {
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "workgate".to_string(),
                default_filter: config.log_level.clone(),
            })?;
            let policy = parse_policy(&policy)?;
            let mode = if concurrency > 1 {
                ExecutionMode::Concurrent(concurrency)
            } else {
                ExecutionMode::Serial
            };
            cmd_simulate(
                file,
                SimulateArgs {
                    work_id,
                    requests,
                    policy,
                    fail_every,
                    rate,
                    interval: Duration::from_millis(interval_ms),
                    mode,
                    run_for: Duration::from_secs(run_secs),
                },
            )
            .await
        }
    }
}

fn parse_policy(s: &str) -> anyhow::Result<ConflictPolicy> {
    match s {
        "append" => Ok(ConflictPolicy::Append),
        "replace" => Ok(ConflictPolicy::Replace),
        "keep_existing" | "keep" => Ok(ConflictPolicy::KeepExisting),
        other => anyhow::bail!("invalid conflict policy: {other}"),
    }
}

fn cmd_config(config: &Config, file: &WorkgateFile) -> anyhow::Result<()> {
    let c = &file.coordinator;
    println!(
        "Config File:      {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or("-".to_string())
    );
    println!("Log Level:        {}", config.log_level);
    println!(
        "OTLP Endpoint:    {}",
        config.otel_endpoint.as_deref().unwrap_or("-")
    );
    println!("Initial Backoff:  {}ms", c.initial_backoff_ms);
    println!("Max Backoff:      {}ms", c.max_backoff_ms);
    println!("Gate Retry:       {}ms", c.gate_retry_interval_ms);
    println!("Grace Period:     {}s", c.grace_period_secs);
    println!("Unrouted Buffer:  {}", c.unrouted_capacity);

    if file.rate_limits.is_empty() {
        println!("\nNo rate limits configured.");
        return Ok(());
    }

    println!("\n{:<24}  {:>6}  {:>12}", "KEY", "RATE", "INTERVAL");
    println!("{}", "-".repeat(46));
    for limit in &file.rate_limits {
        println!(
            "{:<24}  {:>6}  {:>10}ms",
            limit.key, limit.rate, limit.interval_ms
        );
    }
    Ok(())
}

struct SimulateArgs {
    work_id: String,
    requests: u32,
    policy: ConflictPolicy,
    fail_every: u64,
    rate: Option<u32>,
    interval: Duration,
    mode: ExecutionMode,
    run_for: Duration,
}

async fn cmd_simulate(file: WorkgateFile, args: SimulateArgs) -> anyhow::Result<()> {
    let coordinator = WorkCoordinator::new(file.coordinator.clone());
    coordinator.apply_rate_limits(&file.rate_limits)?;

    let rate_key = format!("{}-rl", args.work_id);
    if let Some(rate) = args.rate {
        coordinator.set_rate_limit(rate_key.clone(), rate, args.interval)?;
    }

    let attempts = Arc::new(AtomicU64::new(0));
    let successes = Arc::new(AtomicU64::new(0));
    let handler_attempts = Arc::clone(&attempts);
    let handler_successes = Arc::clone(&successes);
    let fail_every = args.fail_every;

    let handle = coordinator.register_worker(args.work_id.clone(), args.mode, move |request: WorkRequest| {
        let attempts = Arc::clone(&handler_attempts);
        let successes = Arc::clone(&handler_successes);
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let seq = request.extras.get("seq").cloned().unwrap_or_default();
            if fail_every > 0 && n % fail_every == 0 {
                tracing::info!(attempt = n, %seq, "simulated failure");
                return WorkResult::Failure;
            }
            tracing::info!(attempt = n, %seq, "simulated upload");
            successes.fetch_add(1, Ordering::SeqCst);
            WorkResult::Success
        }
    });

    for seq in 0..args.requests {
        let mut request = WorkRequest::new(args.work_id.clone())?
            .conflict_policy(args.policy)
            .extra("seq", serde_json::json!(seq));
        if args.rate.is_some() {
            request = request.rate_limit_id(rate_key.clone());
        }
        coordinator.dispatch(request);
    }

    let ctrl = coordinator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    tokio::select! {
        _ = tokio::time::sleep(args.run_for) => {}
        _ = wait_idle(&handle) => {}
    }
    coordinator.shutdown();

    println!(
        "dispatched: {}  attempts: {}  succeeded: {}  still pending: {}",
        args.requests,
        attempts.load(Ordering::SeqCst),
        successes.load(Ordering::SeqCst),
        handle.pending_count()
    );
    Ok(())
}

async fn wait_idle(handle: &workgate::WorkerHandle) {
    while handle.pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
