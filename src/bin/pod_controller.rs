use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::runtime::reflector;
use kube::Api;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use inplace_update::config::{load_dotenv, resolve_kubeconfig};
use inplace_update::core::client::kube_client::build_kube_client;
use inplace_update::core::client::kube_resources::Pod;
use inplace_update::core::client::store::KubeResourceStore;
use inplace_update::core::client::watchers::run_pod_watch;
use inplace_update::core::queue::RateLimitingQueue;
use inplace_update::domain::controller::{ControllerSettings, PodController};
use inplace_update::logging::{init_logging, LogSettings};
use inplace_update::shutdown::cancel_on_signal;
use inplace_update::version::long_version;

const EVENT_BUFFER: usize = 1024;

/// Keep the in-place update condition on every annotated pod.
#[derive(Debug, Parser)]
#[command(name = "pod-controller", version, long_version = long_version(), about)]
struct Args {
    #[arg(short = 'c', long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[arg(short = 'w', long, env = "POD_CONTROLLER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Watch a single namespace; all namespaces when empty
    #[arg(long, env = "POD_CONTROLLER_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    cache_sync_timeout: Duration,

    /// Drop a pod after this many failed syncs; retries forever when unset
    #[arg(long, env = "POD_CONTROLLER_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[arg(long, env = "POD_CONTROLLER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_json: bool,

    /// Also write daily-rolled JSON logs here
    #[arg(long, env = "POD_CONTROLLER_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            cache_sync_timeout: self.cache_sync_timeout,
            max_retries: self.max_retries,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = load_dotenv();
    let args = Args::parse();

    let _guard = init_logging(&LogSettings {
        level: args.log_level.clone(),
        json: args.log_json,
        log_dir: args.log_dir.clone(),
        ..LogSettings::new("pod-controller")
    })?;
    if let Some(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    let source = resolve_kubeconfig(args.kubeconfig.as_deref());
    let client = build_kube_client(&source).await?;

    let api: Api<Pod> = match args.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => {
            info!("Watching pods in namespace {}", ns);
            Api::namespaced(client.clone(), ns)
        }
        _ => {
            info!("Watching pods in all namespaces");
            Api::all(client.clone())
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let (reader, writer) = reflector::store::<Pod>();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let watch = tokio::spawn(run_pod_watch(api, writer, tx, cancel.clone()));

    let controller = Arc::new(PodController::new(
        Arc::new(KubeResourceStore::new(client)),
        Arc::new(reader.clone()),
        RateLimitingQueue::with_default_limiter(),
        args.settings(),
    ));

    let synced = async move { reader.wait_until_ready().await.is_ok() };
    let result = controller.run(rx, synced, cancel.clone()).await;

    cancel.cancel();
    match watch.await {
        Ok(Err(e)) => error!("Pod watcher failed: {:?}", e),
        Err(e) => error!("Pod watcher task panicked: {:?}", e),
        Ok(Ok(())) => {}
    }

    result.context("pod controller stopped with an error")?;
    info!("Pod controller stopped");
    Ok(())
}
