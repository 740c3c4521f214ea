//! agw-itti message bus runner
//!
//! Builds a bus from a configuration file, starts a logging task on every
//! configured top-level task thread and runs until SIGINT or SIGTERM, then
//! terminates the tasks through the shutdown coordinator.
//!
//! # Usage
//!
//! ```bash
//! agw-itti -c config/gateway.yaml --log-level debug
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tracing::{debug, error, info, warn};

use agw_common::{init_logging, BusConfig, LogLevel, MessageConfig, TaskConfig};
use agw_itti::{
    install_signal_handler, Bus, LoopControl, ShutdownReport, Task, TaskContext, TimerExpired,
    TimerKind,
};

/// agw-itti - inter-task message bus runner
#[derive(Parser, Debug)]
#[command(name = "agw-itti")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the bus configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Arm a periodic heartbeat timer on the first task
    #[arg(long = "heartbeat", value_name = "SECONDS")]
    heartbeat_secs: Option<u64>,
}

/// Task logging everything it receives
struct LoggingTask;

#[async_trait(?Send)]
impl Task for LoggingTask {
    async fn run(&mut self, mut ctx: TaskContext) {
        ctx.init(&[], true);
        ctx.mark_ready();

        ctx.run_event_loop(|ctx, envelope| {
            if envelope.is_terminate() {
                info!(task = ctx.name(), "TERMINATE received");
            } else if let Some(expired) = TimerExpired::decode(&envelope) {
                info!(task = ctx.name(), timer = %expired.timer_id, "heartbeat");
                ctx.bus().timer_handle_expired(expired.timer_id);
            } else {
                debug!(
                    task = ctx.name(),
                    kind = ctx.bus().catalog().name_of(envelope.kind()),
                    number = envelope.message_number(),
                    origin = ctx.bus().registry().name_of(envelope.origin()),
                    "message received"
                );
            }
            LoopControl::Continue
        })
        .await;

        ctx.destroy();
    }
}

/// Configuration used when no file is given
fn builtin_config() -> BusConfig {
    BusConfig::new(
        vec![
            TaskConfig::new("MAIN"),
            TaskConfig::new("S1AP"),
            TaskConfig::sub_task("S1AP_SCTP", "S1AP"),
            TaskConfig::new("MME_APP"),
            TaskConfig::new("SPGW_APP"),
        ],
        vec![MessageConfig::new("TEST", 16)],
    )
}

fn load_config(path: Option<&PathBuf>) -> Result<BusConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BusConfig::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        None => {
            info!("No configuration file given, using the built-in task table");
            Ok(builtin_config())
        }
    }
}

/// Logs and aborts on any panic: invariant violations are fatal.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("fatal: {panic_info}");
        default_hook(panic_info);
        std::process::abort();
    }));
}

async fn run(args: Args) -> Result<ShutdownReport> {
    let config = load_config(args.config_file.as_ref())?;
    let bus = Bus::new(config).context("Failed to create the message bus")?;

    let owners: Vec<_> = bus.registry().thread_owners().collect();
    for task_id in &owners {
        bus.create_task(*task_id, LoggingTask)
            .await
            .with_context(|| format!("Failed to start task {}", bus.registry().name_of(*task_id)))?;
    }
    info!("{} task thread(s) running", owners.len());

    if let (Some(secs), Some(owner)) = (args.heartbeat_secs, owners.first()) {
        let timer_id = bus
            .timer_setup(secs, 0, *owner, TimerKind::Periodic, Bytes::new())
            .context("Failed to arm the heartbeat timer")?;
        info!(timer = %timer_id, "heartbeat armed every {secs}s");
    }

    install_signal_handler(bus.shutdown_signal().clone());
    info!("Message bus started, waiting for shutdown signal...");

    let report = bus.coordinator().wait_tasks_end().await?;
    info!("Router statistics: {:?}", bus.router_stats());
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);
    install_panic_hook();

    match run(args).await {
        Ok(report) => {
            if !report.is_clean() {
                warn!("Shutdown finished with forced exits: {report}");
            }
            info!("agw-itti exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("agw-itti failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
