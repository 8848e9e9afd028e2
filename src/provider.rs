use std::sync::Arc;

use crate::{
    config::Config,
    core::{
        domain::{BackendKind, Language},
        traits::backend::{Backend, BackendError, BackendProvider},
    },
    native::{interpreter::InterpreterBackend, python::PythonEngine, toolchain::ToolchainBackend},
    remote::{
        api::{HttpRemoteApi, RemoteApi},
        backend::RemoteBackend,
    },
};

/// Routes each language to its backend kind using the process configuration.
#[derive(Debug, Clone)]
pub struct Backends {
    config: Config,
    remote: Arc<dyn RemoteApi>,
}

impl Backends {
    pub fn from_config(config: Config) -> Result<Self, BackendError> {
        let remote = Arc::new(HttpRemoteApi::new(
            config.remote_url.clone(),
            config.remote_api_key.clone(),
        )?);
        Ok(Self { config, remote })
    }

    pub fn with_remote_api(config: Config, remote: Arc<dyn RemoteApi>) -> Self {
        Self { config, remote }
    }
}

impl BackendProvider for Backends {
    fn backend(&self, language: Language) -> Result<Arc<dyn Backend>, BackendError> {
        let work_dir = self.config.work_dir.join(language.as_str());
        let backend: Arc<dyn Backend> = match language.backend_kind() {
            BackendKind::Interpreter => Arc::new(InterpreterBackend::new(Arc::new(
                PythonEngine::new(&self.config.python, work_dir),
            ))),
            BackendKind::LocalToolchain => {
                let toolchain = ToolchainBackend::new(language, &self.config.toolchain_dir, work_dir);
                match &self.config.toolchain_launcher {
                    Some(launcher) => Arc::new(toolchain.with_launcher(launcher)),
                    None => Arc::new(toolchain),
                }
            }
            BackendKind::Remote => Arc::new(
                RemoteBackend::new(language, self.remote.clone())
                    .with_poll_interval(self.config.poll_interval())
                    .with_default_timeout(self.config.default_timeout()),
            ),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::{
        core::runner::{RunOptions, Runner},
        remote::api::{MockRemoteApi, Session, SessionDetails, SessionStatus},
    };

    #[tokio::test]
    async fn test_missing_toolchain_degrades_runner() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::try_parse_from([
            "lesson-runner",
            "--toolchain-dir",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let provider = Backends::with_remote_api(config, Arc::new(MockRemoteApi::new()));
        let runner = Runner::new(Language::C, Arc::new(provider));

        let err = runner.warmup().await.unwrap_err();
        assert!(err.to_string().contains("c toolchain is not installed"), "{err}");

        let result = runner
            .run("int main() { return 0; }", RunOptions::default())
            .unwrap()
            .wait()
            .await;
        assert!(result.error().is_some_and(|msg| msg.contains("not installed")));
    }

    #[tokio::test]
    async fn test_cpp_goes_to_remote_api() {
        let config = Config::try_parse_from(["lesson-runner"]).unwrap();
        let mut api = MockRemoteApi::new();
        api.expect_create().returning(|_, _, _| {
            Ok(Session {
                id: "r1".to_string(),
                status: SessionStatus::Completed,
            })
        });
        api.expect_details().returning(|_, _| {
            Ok(SessionDetails {
                build_result: Some("success".to_string()),
                stdout: "7 3\n".to_string(),
                result: Some("success".to_string()),
                exit_code: Some(0),
                ..Default::default()
            })
        });
        let runner = Runner::new(
            Language::Cpp,
            Arc::new(Backends::with_remote_api(config, Arc::new(api))),
        );

        let result = runner
            .run("int main() {}", RunOptions::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(result.stdout(), "7 3\n");
        assert!(result.is_success());
    }
}
