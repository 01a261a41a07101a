use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

/// Where the kubeconfig path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// Passed on the command line or via `KUBECONFIG`; must exist
    Explicit(PathBuf),
    /// `~/.kube/config` or `./config`; falls back to in-cluster inference when missing
    Default(PathBuf),
}

impl KubeconfigSource {
    pub fn path(&self) -> &Path {
        match self {
            KubeconfigSource::Explicit(p) | KubeconfigSource::Default(p) => p,
        }
    }
}

/// Creates a Kubernetes client from a kubeconfig file, or from the in-cluster
/// environment when no default kubeconfig is present
pub async fn build_kube_client(source: &KubeconfigSource) -> Result<Client> {
    let path = source.path();

    let config = if path.exists() {
        debug!("Using kubeconfig at {}", path.display());
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("failed to load kubeconfig")?
    } else if let KubeconfigSource::Explicit(_) = source {
        bail!("kubeconfig {} does not exist", path.display());
    } else {
        debug!(
            "No kubeconfig at {}, inferring in-cluster configuration",
            path.display()
        );
        Config::infer()
            .await
            .context("failed to infer kubernetes configuration")?
    };

    let client = Client::try_from(config).context("failed to create kube client")?;

    debug!("Kubernetes client initialized successfully");
    Ok(client)
}
