//! Build metadata shown by `--version`.
//!
//! `GIT_COMMIT` and `BUILD_TIME` are read from the environment at compile time,
//! e.g. `GIT_COMMIT=$(git rev-parse HEAD) BUILD_TIME=$(date -u +%FT%TZ) cargo build`.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "Unknown",
};

pub const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
    Some(time) => time,
    None => "Unknown",
};

/// Multi-line version block for clap's `long_version`.
pub fn long_version() -> String {
    format!("{VERSION}\nGitCommit: {GIT_COMMIT}\nBuildTime: {BUILD_TIME}")
}
