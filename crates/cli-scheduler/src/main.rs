use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, BINARY};
use log::{info, warn};
use scheduler::{
    config::SchedulerConfig,
    convert::CommandConverter,
    coordinator::{Collaborators, Control, Coordinator, RunOutcome},
    monitor::SysinfoProbe,
    process::SysinfoProcessTable,
    queue::SidecarOracle,
    stats::{load_snapshot, StatsSnapshot},
};
use std::fs;
use std::path::PathBuf;

/// Resource-aware bulk media conversion scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Exit once the queue is empty and nothing is running
    #[arg(long)]
    once: bool,

    /// Print the current statistics snapshot and exit
    #[arg(long)]
    status: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = SchedulerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    if args.status {
        let snapshot = load_snapshot(&cfg.stats_path())?;
        print_status(&snapshot)?;
        return Ok(());
    }

    info!("convd starting");
    info!("  Target directories: {:?}", cfg.valid_target_directories());
    info!("  Parallel jobs: {}..={}", cfg.min_parallel_jobs, cfg.max_parallel_jobs);
    info!("  Check interval: {}s", cfg.check_interval);
    info!("  Lock TTL: {}s", cfg.lock_ttl_secs);
    info!("  State dir: {}", cfg.state_dir.display());

    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("Failed to create state directory: {}", cfg.state_dir.display()))?;

    let parts = Collaborators {
        probe: Box::new(SysinfoProbe::new()),
        processes: Box::new(SysinfoProcessTable::new()),
        converter: Box::new(CommandConverter::new(
            cfg.encoder_command.clone(),
            Some(cfg.state_dir.join("logs")),
        )),
        oracle: Box::new(SidecarOracle),
    };
    let mut coordinator = Coordinator::new(cfg, parts);
    coordinator.set_config_path(args.config.clone());
    info!("  Hostname: {}", coordinator.hostname());

    let control = Control::new();
    spawn_signal_handlers(&control)?;

    coordinator.boot();
    let outcome = coordinator.run(&control, args.once).await?;
    info!("convd stopped: {:?}", outcome);

    if outcome == RunOutcome::Terminated {
        std::process::exit(130);
    }
    Ok(())
}

fn spawn_signal_handlers(control: &Control) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

        let stop = control.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            warn!("Failed to listen for Ctrl+C: {}", e);
                            return;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
                announce(stop.request_stop());
            }
        });

        let reload = control.clone();
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("reload: SIGHUP received");
                reload.request_reload();
            }
        });
    }

    #[cfg(not(unix))]
    {
        let stop = control.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                announce(stop.request_stop());
            }
        });
    }

    Ok(())
}

fn announce(count: u32) {
    if count == 1 {
        warn!("drain: interrupt received, finishing running jobs (interrupt again to terminate)");
    } else {
        warn!("terminate: second interrupt received, stopping running jobs");
    }
}

fn print_status(snapshot: &StatsSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    eprintln!();
    eprintln!("host {} (pid {}), updated {}", snapshot.hostname, snapshot.pid, snapshot.updated_at);
    eprintln!(
        "jobs: {} active / target {} | {} queued | {} done, {} failed, {} skipped",
        snapshot.counts.active,
        snapshot.target_jobs,
        snapshot.counts.queued,
        snapshot.counts.succeeded,
        snapshot.counts.failed,
        snapshot.counts.skipped
    );
    eprintln!("throughput: {:.2}/h", snapshot.throughput_per_hour);
    if let Some(eta) = snapshot.estimated_completion {
        eprintln!("estimated completion: {}", eta);
    }
    if let Some(sample) = &snapshot.last_sample {
        eprintln!(
            "last sample: cpu {:.1}% | available {} | load {:.2}",
            sample.cpu_percent,
            format_size(sample.available_memory_bytes, BINARY),
            sample.load_average_1m
        );
    }
    if let Some(reason) = &snapshot.paused {
        eprintln!("paused: {}", reason);
    }
    Ok(())
}
