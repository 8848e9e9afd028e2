use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::remote::api::{DEFAULT_API_KEY, DEFAULT_REMOTE_URL};

#[derive(Parser, Debug, Clone)]
#[command(name = "lesson-runner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed code runner for interactive programming lessons", long_about = None)]
pub struct Config {
    /// Address the JSON-lines server listens on
    #[arg(long, env = "RUNNER_LISTEN_ADDR", default_value = "127.0.0.1:50051")]
    pub listen_addr: String,

    /// Python interpreter used for Python exercises
    #[arg(long, env = "RUNNER_PYTHON", default_value = "python3")]
    pub python: PathBuf,

    /// Directory holding `<language>/compile-and-run` toolchain plugins
    #[arg(long, env = "RUNNER_TOOLCHAIN_DIR", default_value = "toolchains")]
    pub toolchain_dir: PathBuf,

    /// Program that starts toolchain plugins, e.g. a WASM runtime
    #[arg(long, env = "RUNNER_TOOLCHAIN_LAUNCHER")]
    pub toolchain_launcher: Option<PathBuf>,

    /// Scratch directory for source files
    #[arg(long, env = "RUNNER_WORK_DIR", default_value_os_t = std::env::temp_dir().join("lesson-runner"))]
    pub work_dir: PathBuf,

    #[arg(long, env = "RUNNER_REMOTE_URL", default_value = DEFAULT_REMOTE_URL)]
    pub remote_url: String,

    #[arg(long, env = "RUNNER_REMOTE_API_KEY", default_value = DEFAULT_API_KEY)]
    pub remote_api_key: String,

    /// Run timeout when a request does not carry one
    #[arg(long, env = "RUNNER_DEFAULT_TIMEOUT_MS", default_value_t = 10_000)]
    pub default_timeout_ms: u64,

    #[arg(long, env = "RUNNER_POLL_INTERVAL_MS", default_value_t = 800)]
    pub poll_interval_ms: u64,
}

impl Config {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["lesson-runner"]).unwrap();

        assert_eq!(config.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_millis(800));
        assert_eq!(config.toolchain_launcher, None);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "lesson-runner",
            "--toolchain-dir",
            "/opt/toolchains",
            "--toolchain-launcher",
            "/usr/bin/wasmtime",
            "--default-timeout-ms",
            "2500",
        ])
        .unwrap();

        assert_eq!(config.toolchain_dir, PathBuf::from("/opt/toolchains"));
        assert_eq!(config.toolchain_launcher, Some(PathBuf::from("/usr/bin/wasmtime")));
        assert_eq!(config.default_timeout_ms, 2500);
    }
}
