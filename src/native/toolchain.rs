use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};

use serde::Deserialize;
use tokio::{fs, process::Command};
use uuid::Uuid;

use crate::{
    constants::TOOLCHAIN_ENTRY,
    core::{
        context::shim::HostGlobals,
        deadline::expired,
        domain::{Language, ProgramOutput},
        traits::backend::{Backend, BackendError, ExecIo},
    },
};

/// Whether the toolchain plugin is present on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolchainCapability {
    Installed { entry: PathBuf },
    Missing { expected: PathBuf },
}

/// What a plugin prints on stdout after compiling and running a program.
#[derive(Debug, Deserialize)]
struct ToolchainReply {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
}

/// Compiles and runs source with a toolchain plugin shipped as a local asset
/// at `<toolchain_dir>/<language>/compile-and-run`.
#[derive(Clone, Debug)]
pub struct ToolchainBackend {
    language: Language,
    toolchain_dir: PathBuf,
    launcher: Option<PathBuf>,
    work_dir: PathBuf,
    entry: OnceLock<PathBuf>,
}

impl ToolchainBackend {
    pub fn new<T, U>(language: Language, toolchain_dir: T, work_dir: U) -> Self
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
    {
        ToolchainBackend {
            language,
            toolchain_dir: toolchain_dir.as_ref().into(),
            launcher: None,
            work_dir: work_dir.as_ref().into(),
            entry: OnceLock::new(),
        }
    }

    /// Starts the plugin through `launcher`, e.g. a WASM runtime.
    pub fn with_launcher<T: AsRef<Path>>(mut self, launcher: T) -> Self {
        self.launcher = Some(launcher.as_ref().into());
        self
    }

    pub fn expected_entry(&self) -> PathBuf {
        self.toolchain_dir
            .join(self.language.as_str())
            .join(TOOLCHAIN_ENTRY)
    }

    pub async fn probe(&self) -> ToolchainCapability {
        let entry = self.expected_entry();
        match fs::metadata(&entry).await {
            Ok(meta) if meta.is_file() => ToolchainCapability::Installed { entry },
            _ => ToolchainCapability::Missing { expected: entry },
        }
    }

    async fn entry(&self) -> Result<PathBuf, BackendError> {
        if let Some(entry) = self.entry.get() {
            return Ok(entry.clone());
        }
        match self.probe().await {
            ToolchainCapability::Installed { entry } => Ok(self.entry.get_or_init(|| entry).clone()),
            ToolchainCapability::Missing { expected } => Err(BackendError::NotInstalled {
                toolchain: format!("The {} toolchain", self.language),
                path: expected.display().to_string(),
            }),
        }
    }

    fn command(&self, entry: &Path, source_path: &Path) -> Command {
        let mut command = match &self.launcher {
            Some(launcher) => {
                let mut command = Command::new(launcher);
                command.arg(entry);
                command
            }
            None => Command::new(entry),
        };
        command
            .arg(source_path)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("RUNNER_NETWORK", "disabled")
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl Backend for ToolchainBackend {
    async fn load(&self, _globals: &HostGlobals) -> Result<(), BackendError> {
        let entry = self.entry().await?;
        tracing::info!("Using {} toolchain at {}", self.language, entry.display());
        Ok(())
    }

    #[tracing::instrument(skip(self, source, io), fields(language = %self.language))]
    async fn compile_and_run(
        &self,
        source: &str,
        io: &ExecIo,
    ) -> Result<ProgramOutput, BackendError> {
        let entry = self.entry().await?;
        let source_path = self.work_dir.join(format!(
            "{}.{}",
            Uuid::new_v4(),
            self.language.file_extension()
        ));

        fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| BackendError::Internal { msg: e.to_string() })?;
        fs::write(&source_path, source)
            .await
            .map_err(|e| BackendError::Internal { msg: e.to_string() })?;

        let mut command = self.command(&entry, &source_path);
        let out = tokio::select! {
            biased;
            _ = io.cancel.cancelled() => Err(BackendError::Cancelled),
            _ = expired(io.deadline) => Err(BackendError::Timeout {
                budget_ms: io.deadline.map_or(0, |deadline| deadline.budget_ms()),
            }),
            out = command.output() => {
                out.map_err(|e| BackendError::Internal { msg: e.to_string() })
            }
        };

        if let Err(e) = fs::remove_file(&source_path).await {
            tracing::warn!("Failed to remove {}: {}", source_path.display(), e);
        }
        let out = out?;

        if !out.status.success() {
            return Err(BackendError::Internal {
                msg: format!(
                    "{} toolchain exited with {}: {}",
                    self.language,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }

        let reply: ToolchainReply = serde_json::from_slice(&out.stdout)
            .map_err(|e| BackendError::Malformed { msg: e.to_string() })?;
        tracing::debug!("Toolchain reply: {:?}", reply);

        match reply.error {
            Some(msg) if !msg.trim().is_empty() => Err(BackendError::Compilation { msg }),
            _ => Ok(ProgramOutput {
                stdout: reply.stdout,
                stderr: reply.stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::traits::backend::OutputSink;

    /// A toolchain directory with a `c` plugin made of `script`, run through `/bin/sh`.
    async fn plugin(script: &str) -> (TempDir, ToolchainBackend) {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("c");
        fs::create_dir_all(&plugin_dir).await.unwrap();
        fs::write(plugin_dir.join(TOOLCHAIN_ENTRY), script)
            .await
            .unwrap();

        let backend =
            ToolchainBackend::new(Language::C, dir.path(), dir.path().join("work")).with_launcher("/bin/sh");
        (dir, backend)
    }

    fn io() -> ExecIo {
        let (sink, _rx) = OutputSink::channel(8);
        ExecIo {
            sink,
            deadline: None,
            cancel: CancellationToken::new(),
            globals: Arc::new(HostGlobals::new()),
        }
    }

    #[tokio::test]
    async fn test_missing_plugin_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ToolchainBackend::new(Language::C, dir.path(), dir.path());

        assert_eq!(
            backend.probe().await,
            ToolchainCapability::Missing {
                expected: dir.path().join("c").join(TOOLCHAIN_ENTRY)
            }
        );
        let err = backend.load(&HostGlobals::new()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("not installed"), "{err}");
    }

    #[tokio::test]
    async fn test_runs_source_through_plugin() {
        let (_dir, backend) =
            plugin(r#"printf '{"stdout":"%s\\n","stderr":""}' "$(cat "$1")""#).await;

        backend.load(&HostGlobals::new()).await.unwrap();
        let output = backend.compile_and_run("7 3", &io()).await.unwrap();
        assert_eq!(output.stdout, "7 3\n");
        assert_eq!(output.stderr, "");
    }

    #[tokio::test]
    async fn test_plugin_cannot_see_host_environment() {
        let (_dir, backend) = plugin(
            r#"printf '{"stdout":"%s|%s","stderr":""}' "$RUNNER_NETWORK" "${HOME:-unset}""#,
        )
        .await;

        let output = backend.compile_and_run("", &io()).await.unwrap();
        assert_eq!(output.stdout, "disabled|unset");
    }

    #[tokio::test]
    async fn test_compile_error_is_reported() {
        let (_dir, backend) = plugin(
            r#"printf '{"stdout":"","stderr":"","error":"main.c:3:14: error: expected %s before %s"}' "';'" "'return'""#,
        )
        .await;

        let err = backend.compile_and_run("int main() {", &io()).await.unwrap_err();
        assert!(matches!(err, BackendError::Compilation { .. }));
        assert_eq!(
            err.user_message(),
            "A semicolon (;) is missing at the end of a statement. (line 3)"
        );
    }

    #[tokio::test]
    async fn test_garbage_reply_is_malformed() {
        let (_dir, backend) = plugin("echo 'not json'").await;

        let err = backend.compile_and_run("", &io()).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_crashed_plugin_is_internal_error() {
        let (_dir, backend) = plugin("echo boom >&2; exit 3").await;

        let err = backend.compile_and_run("", &io()).await.unwrap_err();
        assert!(matches!(&err, BackendError::Internal { msg } if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_cancel_stops_plugin() {
        let (_dir, backend) = plugin("sleep 30").await;
        let io = io();
        let cancel = io.cancel.clone();

        let run = backend.compile_and_run("", &io);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("plugin should still be running"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => cancel.cancel(),
        }
        assert_eq!(run.await.unwrap_err(), BackendError::Cancelled);
    }
}
