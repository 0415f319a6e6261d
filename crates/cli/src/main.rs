use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vigil_controller::Controller;
use vigil_core::{anno, prelude::*};
use vigil_queue::BackoffConfig;
use vigil_remote::{KubeService, MemoryService, ResourceService};
use vigil_store::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Project reconciliation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// GVK key of the project resource, e.g. "vigil.dev/v1/Project"
    #[arg(long = "gvk", global = true, default_value = "vigil.dev/v1/Project")]
    gvk: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation controller until interrupted
    Run {
        /// Number of concurrent reconciler workers
        #[arg(long = "workers", default_value_t = 2)]
        workers: usize,
        /// Resync period in seconds (0 disables resync)
        #[arg(long = "resync-secs", default_value_t = 0)]
        resync_secs: u64,
        /// Reconcile an in-memory seeded service instead of a cluster
        #[arg(long = "demo", action = ArgAction::SetTrue)]
        demo: bool,
    },
    /// List projects once
    Ls,
    /// Watch projects and print +/~/- events
    Watch,
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

fn sync_config(resync_secs: u64) -> SyncConfig {
    let defaults = SyncConfig::default();
    SyncConfig {
        resync: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
        list_retries: std::env::var("VIGIL_LIST_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.list_retries),
        watch_backoff_max: std::env::var("VIGIL_WATCH_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.watch_backoff_max),
        ..defaults
    }
}

/// A seeded in-memory service so the control loop can be exercised without
/// a cluster.
fn demo_service() -> Arc<MemoryService> {
    let mem = Arc::new(MemoryService::new());
    mem.seed_project("analytics", Some("alice"));
    mem.seed_project("billing", Some("bob"));
    mem.seed_project("web", None);
    info!("demo mode: seeded 3 in-memory projects");
    mem
}

fn print_projects(items: &[ProjectSnapshot], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<12} {:<24} DESCRIPTION", "NAME", "PHASE", "DISPLAY-NAME");
            for p in items {
                println!(
                    "{:<20} {:<12} {:<24} {}",
                    p.key,
                    p.phase,
                    p.annotation(anno::DISPLAY_NAME).unwrap_or("-"),
                    p.annotation(anno::DESCRIPTION).unwrap_or("-"),
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, resync_secs, demo } => {
            info!(workers, resync_secs, demo, "run invoked");
            let service: Arc<dyn ResourceService> = if demo {
                demo_service()
            } else {
                Arc::new(KubeService::connect(&cli.gvk).await?)
            };

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("interrupt received; shutting down");
                        cancel.cancel();
                    }
                }
            });

            let controller =
                Controller::new(service, sync_config(resync_secs), BackoffConfig::default());
            if let Err(e) = controller.run(cancel, workers).await {
                error!(error = ?e, "controller failed");
                return Err(e);
            }
        }
        Commands::Ls => {
            info!(gvk = %cli.gvk, "ls invoked");
            let service = KubeService::connect(&cli.gvk).await?;
            let mut items = service.list().await?;
            items.sort_by(|a, b| a.key.cmp(&b.key));
            print_projects(&items, cli.output)?;
        }
        Commands::Watch => {
            info!(gvk = %cli.gvk, "watch invoked");
            let service = KubeService::connect(&cli.gvk).await?;
            let mut handle = service.watch().await?;
            loop {
                tokio::select! {
                    maybe = handle.rx.recv() => match maybe {
                        Some(RemoteEvent::Added(s)) => println!("+ {}", s.key),
                        Some(RemoteEvent::Modified(s)) => println!("~ {}", s.key),
                        Some(RemoteEvent::Deleted(s)) => println!("- {}", s.key),
                        None => {
                            info!("watch stream ended");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch");
                        break;
                    }
                }
            }
            handle.cancel.cancel();
        }
    }
    Ok(())
}
