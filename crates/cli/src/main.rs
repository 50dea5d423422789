use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ixo_controller::OperatorConfig;
use ixo_core::ObjectKey;
use ixo_kubehub::events::{cluster_stream, workload_stream};
use ixo_kubehub::{crd::indexer_cluster_crd, get_kube_client, EventSource};
use ixo_queue::{Backoff, WorkQueue};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ixoctl", version, about = "IndexerCluster operator")]
struct Cli {
    /// Watch only this namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Format { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation loop until Ctrl-C
    Run {
        /// Parallel reconcile workers
        #[arg(long, env = "IXO_WORKERS")]
        workers: Option<usize>,
        /// Minimum retry delay after a transient apply error, in ms (0 disables)
        #[arg(long = "error-requeue-floor-ms", env = "IXO_ERROR_REQUEUE_FLOOR_MS")]
        error_requeue_floor_ms: Option<u64>,
        /// Base of the per-key retry backoff, in ms
        #[arg(long = "backoff-base-ms", env = "IXO_BACKOFF_BASE_MS")]
        backoff_base_ms: Option<u64>,
        /// Cap of the per-key retry backoff, in seconds
        #[arg(long = "backoff-max-secs", env = "IXO_BACKOFF_MAX_SECS")]
        backoff_max_secs: Option<u64>,
        /// Re-check interval while a rollout is in progress, in seconds
        #[arg(long = "progress-requeue-secs", env = "IXO_PROGRESS_REQUEUE_SECS")]
        progress_requeue_secs: Option<u64>,
        /// Time given to in-flight passes on shutdown, in seconds
        #[arg(long = "shutdown-grace-secs", env = "IXO_SHUTDOWN_GRACE_SECS")]
        shutdown_grace_secs: Option<u64>,
    },
    /// Print the IndexerCluster CustomResourceDefinition
    Crd {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Format::Yaml)]
        output: Format,
    },
    /// Print reconciliation keys as the event source produces them (no reconciling)
    Watch,
}

fn init_tracing() {
    let env = std::env::var("IXO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("IXO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid IXO_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_crd(output: Format) -> Result<()> {
    let crd = indexer_cluster_crd()?;
    match output {
        Format::Yaml => print!("{}", serde_yaml::to_string(&crd).context("rendering CRD as YAML")?),
        Format::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
    }
    Ok(())
}

/// Event source only: dequeue keys and print them.
async fn watch_keys(namespace: Option<&str>) -> Result<()> {
    let client = get_kube_client().await?;
    let queue: Arc<WorkQueue<ObjectKey>> = WorkQueue::new("watch", Backoff::default());
    let source = EventSource::new(Arc::clone(&queue));
    let clusters = tokio::spawn({
        let source = source.clone();
        let stream = cluster_stream(client.clone(), namespace);
        async move { source.pump_clusters(stream).await }
    });
    let workloads = tokio::spawn({
        let stream = workload_stream(client, namespace);
        async move { source.pump_workloads(stream).await }
    });

    let printer = async {
        while let Some(key) = queue.get().await {
            println!("{}", key);
            queue.done(&key);
        }
    };
    tokio::select! {
        _ = printer => {}
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
    }
    queue.shut_down();
    clusters.abort();
    workloads.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workers,
            error_requeue_floor_ms,
            backoff_base_ms,
            backoff_max_secs,
            progress_requeue_secs,
            shutdown_grace_secs,
        } => {
            let mut cfg = OperatorConfig::from_env();
            cfg.namespace = cli.namespace.filter(|s| !s.trim().is_empty());
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            if let Some(ms) = error_requeue_floor_ms {
                cfg.error_requeue_floor = Duration::from_millis(ms);
            }
            if let Some(ms) = backoff_base_ms {
                cfg.backoff.base = Duration::from_millis(ms);
            }
            if let Some(s) = backoff_max_secs {
                cfg.backoff.max = Duration::from_secs(s);
            }
            if let Some(s) = progress_requeue_secs {
                cfg.progress_requeue = Duration::from_secs(s);
            }
            if let Some(s) = shutdown_grace_secs {
                cfg.shutdown_grace = Duration::from_secs(s);
            }
            info!(?cfg, "run invoked");
            ixo_controller::operator::run(cfg).await?;
        }
        Commands::Crd { output } => print_crd(output)?,
        Commands::Watch => {
            let ns = cli.namespace.as_deref().filter(|s| !s.trim().is_empty());
            info!(ns = ?ns, "watch invoked");
            watch_keys(ns).await?;
        }
    }
    Ok(())
}
