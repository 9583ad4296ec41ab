//! keel demo CLI
//!
//! ```bash
//! RUST_LOG=keel_core=debug keel-cli executor
//! keel-cli --reset-timeout-ms 200 breaker
//! keel-cli --config settings.json guarded
//! keel-cli limiter --algorithm window --capacity 5 --per-second 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use keel_core::config::{BreakerConfig, ExecutorConfig, Settings};
use keel_core::domain::Event;
use keel_core::impls::{MemorySink, TracingSink};
use keel_core::{
    BreakerError, BuildError, CircuitBreaker, ConfigError, LeakyBucket, RateLimiter,
    SlidingWindow, SubmitError, TaskExecutor, TokenBucket, submit_guarded,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keel-cli", about = "Demos for the keel executor, breaker and limiter")]
struct Cli {
    /// JSON settings file (`executor` and `breaker` sections, durations in ms).
    /// Without it, `KEEL_*` environment variables are read.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the breaker reset timeout so demos do not wait 30s.
    #[arg(long, global = true)]
    reset_timeout_ms: Option<u64>,

    #[command(subcommand)]
    demo: Demo,
}

#[derive(Debug, Subcommand)]
enum Demo {
    /// Submit a handful of operations and watch them run in order.
    Executor {
        #[arg(long, default_value_t = 5)]
        count: u32,
    },
    /// Drive a breaker through closed → open → half_open → closed.
    Breaker,
    /// Breaker in front of an executor, with a dependency that is down.
    Guarded {
        #[arg(long, default_value_t = 6)]
        calls: u32,
    },
    /// Burst against a rate limiter.
    Limiter {
        #[arg(long, value_enum, default_value_t = Algorithm::Token)]
        algorithm: Algorithm,
        #[arg(long, default_value_t = 3)]
        capacity: u32,
        #[arg(long, default_value_t = 2.0)]
        per_second: f64,
        #[arg(long, default_value_t = 6)]
        requests: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    /// Refills continuously, starts full.
    Token,
    /// Drains one request per `1 / per_second`.
    Leaky,
    /// At most `capacity` requests per `capacity / per_second`.
    Window,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("failed to encode events: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("dependency unavailable (attempt {0})")]
struct Unavailable(u32);

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings {
            executor: ExecutorConfig::from_env("demo"),
            breaker: BreakerConfig::from_env("demo"),
        },
    };
    if let Some(ms) = cli.reset_timeout_ms {
        settings.breaker.reset_timeout = Duration::from_millis(ms);
    }
    settings.validate()?;

    match cli.demo {
        Demo::Executor { count } => executor_demo(settings.executor, count).await,
        Demo::Breaker => breaker_demo(settings.breaker).await,
        Demo::Guarded { calls } => guarded_demo(settings, calls).await,
        Demo::Limiter {
            algorithm,
            capacity,
            per_second,
            requests,
        } => limiter_demo(algorithm, capacity, per_second, requests).await,
    }
}

async fn executor_demo(config: ExecutorConfig, count: u32) -> Result<(), CliError> {
    let sink = Arc::new(MemorySink::new());
    let executor = TaskExecutor::builder(config)
        .with_sink(sink.clone())
        .with_sink(Arc::new(TracingSink))
        .build()?;

    let mut futures = Vec::new();
    for i in 0..count {
        let future = executor
            .submit(move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if i == 2 {
                    Err(Unavailable(i))
                } else {
                    Ok(i * i)
                }
            })
            .await?;
        futures.push(future);
    }
    println!("queued {} operations, pending={}", count, executor.pending());

    for (i, future) in futures.iter().enumerate() {
        match future.wait().await {
            Ok(value) => println!("#{i}: ok {value}"),
            Err(err) => println!("#{i}: {err}"),
        }
    }

    executor.shutdown(true);
    executor.await_shutdown(Duration::from_secs(5)).await;
    print_events(&sink.events())
}

async fn breaker_demo(config: BreakerConfig) -> Result<(), CliError> {
    let sink = Arc::new(MemorySink::new());
    let reset_timeout = config.reset_timeout;
    let failures_before_recovery = config.failure_threshold;
    let breaker = CircuitBreaker::new("demo", config)?.with_sink(sink.clone());

    let attempts = &AtomicU32::new(0);
    let call = move || async move {
        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures_before_recovery {
            Err(Unavailable(n))
        } else {
            Ok(n)
        }
    };

    for _ in 0..failures_before_recovery + 2 {
        report(&breaker, breaker.execute(call).await);
    }

    info!(wait = ?reset_timeout, "Waiting for reset timeout");
    tokio::time::sleep(reset_timeout).await;

    for _ in 0..breaker.config().success_threshold {
        report(&breaker, breaker.execute(call).await);
    }

    let snapshot = breaker.snapshot();
    println!(
        "final: state={} successes={} failures={} rejections={}",
        snapshot.state,
        snapshot.total_successes,
        snapshot.total_failures,
        snapshot.total_rejections
    );
    print_events(&sink.events())
}

fn report(breaker: &CircuitBreaker, result: Result<u32, BreakerError<Unavailable>>) {
    match result {
        Ok(n) => println!("[{}] ok (attempt {n})", breaker.state()),
        Err(err) => println!("[{}] {err}", breaker.state()),
    }
}

async fn guarded_demo(settings: Settings, calls: u32) -> Result<(), CliError> {
    let executor = TaskExecutor::new(settings.executor)?;
    let breaker = Arc::new(CircuitBreaker::new("dependency", settings.breaker)?);

    for i in 0..calls {
        let future = submit_guarded(&executor, Arc::clone(&breaker), move || async move {
            Err::<(), _>(Unavailable(i))
        })
        .await?;

        match future.wait().await {
            Ok(()) => println!("call {i}: ok"),
            Err(err) if err.is_circuit_open() => println!("call {i}: short-circuited ({err})"),
            Err(err) => println!("call {i}: failed ({err})"),
        }
    }

    let snapshot = breaker.snapshot();
    println!(
        "breaker={} failures={} rejections={}",
        snapshot.state, snapshot.total_failures, snapshot.total_rejections
    );

    executor.shutdown(true);
    executor.await_shutdown(Duration::from_secs(5)).await;
    Ok(())
}

async fn limiter_demo(
    algorithm: Algorithm,
    capacity: u32,
    per_second: f64,
    requests: u32,
) -> Result<(), CliError> {
    // A rate that does not fit a Duration becomes zero and is rejected by `new`.
    let period = |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
    let limiter: Box<dyn RateLimiter> = match algorithm {
        Algorithm::Token => Box::new(TokenBucket::new(capacity, per_second)?),
        Algorithm::Leaky => Box::new(LeakyBucket::new(capacity, period(1.0 / per_second))?),
        Algorithm::Window => Box::new(SlidingWindow::new(
            capacity,
            period(f64::from(capacity) / per_second),
        )?),
    };

    for i in 0..requests {
        match limiter.try_acquire() {
            Ok(()) => println!("request {i}: allowed"),
            Err(limited) => println!("request {i}: {limited}"),
        }
    }

    keel_core::limiter::acquire(limiter.as_ref()).await;
    println!("waited for a slot ({algorithm:?})");
    Ok(())
}

fn print_events(events: &[Event]) -> Result<(), CliError> {
    for event in events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}
