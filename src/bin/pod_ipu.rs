use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use inplace_update::config::{load_dotenv, resolve_kubeconfig};
use inplace_update::core::client::kube_client::build_kube_client;
use inplace_update::core::client::store::KubeResourceStore;
use inplace_update::core::util::retry::ConflictRetry;
use inplace_update::domain::update::dto::{
    DeploymentUpdateRequest, PodUpdateRequest, UpdateTiming,
};
use inplace_update::domain::update::service::{DeploymentUpdateService, PodUpdateService};
use inplace_update::errors::AppError;
use inplace_update::logging::{init_logging, LogSettings};
use inplace_update::shutdown::cancel_on_signal;
use inplace_update::version::long_version;

/// Replace a container image on running pods without recreating them.
#[derive(Debug, Parser)]
#[command(name = "pod-ipu", version, long_version = long_version(), about)]
struct Args {
    #[arg(short = 'n', long, env = "POD_IPU_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Update every pod selected by this deployment
    #[arg(short = 'd', long, conflicts_with = "pod", required_unless_present = "pod")]
    deployment: Option<String>,

    /// Update a single pod
    #[arg(short = 'p', long)]
    pod: Option<String>,

    /// Container to update; defaults to the deployment or pod name
    #[arg(short = 'C', long)]
    container: Option<String>,

    #[arg(short = 'i', long)]
    image: String,

    /// Wait between marking a pod unready and changing its image
    #[arg(short = 't', long, default_value = "5s", value_parser = humantime::parse_duration)]
    grace_period: Duration,

    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Give up on a pod whose new image is not running after this long
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    poll_timeout: Duration,

    #[arg(short = 'c', long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[arg(long, env = "POD_IPU_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn timing(&self) -> UpdateTiming {
        UpdateTiming {
            grace_period: self.grace_period,
            poll_interval: self.poll_interval,
            poll_timeout: self.poll_timeout,
            conflict_retry: ConflictRetry::default(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = load_dotenv();
    let args = Args::parse();

    let settings = LogSettings {
        level: args.log_level.clone(),
        json: args.log_json,
        ..LogSettings::new("pod-ipu")
    };
    let _guard = match init_logging(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<AppError>().map_or(1, AppError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let timing = args.timing();
    let source = resolve_kubeconfig(args.kubeconfig.as_deref());
    let client = build_kube_client(&source).await?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let store = Arc::new(KubeResourceStore::new(client));
    let pods = PodUpdateService::new(store, timing, cancel);

    match (args.deployment, args.pod) {
        (Some(deployment), _) => {
            let req = DeploymentUpdateRequest {
                container: args.container.unwrap_or_else(|| deployment.clone()),
                namespace: args.namespace,
                deployment,
                image: args.image,
            };
            let report = DeploymentUpdateService::new(pods).update(&req).await?;

            info!(
                "{}/{} pod(s) of deployment {}/{} updated",
                report.succeeded(),
                report.results.len(),
                req.namespace,
                req.deployment
            );
            report.ensure_complete()?;
        }
        (None, Some(pod)) => {
            let req = PodUpdateRequest {
                container: args.container.unwrap_or_else(|| pod.clone()),
                namespace: args.namespace,
                name: pod,
                image: args.image,
            };
            let report = pods
                .update(&req)
                .await
                .with_context(|| format!("in-place update of pod {}/{}", req.namespace, req.name))?;

            info!(
                "Pod {}/{} now runs {} ({} poll(s))",
                req.namespace, req.name, report.new_image_id, report.poll_attempts
            );
        }
        (None, None) => {
            return Err(AppError::Validation("either --deployment or --pod is required".into()).into())
        }
    }

    Ok(())
}
