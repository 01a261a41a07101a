use std::path::{Path, PathBuf};

use crate::core::client::kube_client::KubeconfigSource;

/// Load `.env` from the working directory, if any. Existing variables win.
///
/// Runs before logging is set up, so the loaded path is returned for the
/// caller to log.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// `~/.kube/config`, when a home directory is known.
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Pick the kubeconfig to load.
///
/// An explicit path (flag or `KUBECONFIG`) wins. Otherwise `~/.kube/config`,
/// then `./config` in the working directory. When none of those exist the
/// home path is returned as a default, which lets the client fall back to
/// in-cluster configuration.
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> KubeconfigSource {
    if let Some(path) = explicit {
        return KubeconfigSource::Explicit(path.to_path_buf());
    }
    resolve_default(default_kubeconfig_path(), Path::new("config"))
}

fn resolve_default(home: Option<PathBuf>, local: &Path) -> KubeconfigSource {
    match home {
        Some(home) if home.exists() => KubeconfigSource::Default(home),
        _ if local.exists() => KubeconfigSource::Default(local.to_path_buf()),
        Some(home) => KubeconfigSource::Default(home),
        None => KubeconfigSource::Default(local.to_path_buf()),
    }
}
