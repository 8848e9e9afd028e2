use std::sync::Arc;

use crate::core::{
    context::shim::HostGlobals,
    deadline::expired,
    domain::ProgramOutput,
    traits::{
        backend::{Backend, BackendError, ExecIo},
        engine::InterpreterEngine,
    },
};

/// Runs source through a general-purpose interpreter, streaming output as
/// the engine produces it.
#[derive(Debug, Clone)]
pub struct InterpreterBackend {
    engine: Arc<dyn InterpreterEngine>,
}

impl InterpreterBackend {
    pub fn new(engine: Arc<dyn InterpreterEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl Backend for InterpreterBackend {
    async fn load(&self, _globals: &HostGlobals) -> Result<(), BackendError> {
        let info = self.engine.load().await?;
        tracing::info!("Interpreter loaded: {} {}", info.name, info.version);
        Ok(())
    }

    async fn compile_and_run(
        &self,
        source: &str,
        io: &ExecIo,
    ) -> Result<ProgramOutput, BackendError> {
        tokio::select! {
            biased;
            _ = io.cancel.cancelled() => Err(BackendError::Cancelled),
            _ = expired(io.deadline) => Err(BackendError::Timeout {
                budget_ms: io.deadline.map_or(0, |deadline| deadline.budget_ms()),
            }),
            result = self.engine.execute(source, &io.globals, &io.sink) => {
                result.map(|()| ProgramOutput::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::{
        deadline::Deadline,
        traits::{
            backend::{OutputChunk, OutputSink},
            engine::{EngineInfo, MockInterpreterEngine},
        },
    };

    fn io(deadline: Option<Deadline>) -> (ExecIo, tokio::sync::mpsc::Receiver<OutputChunk>) {
        let (sink, rx) = OutputSink::channel(8);
        let io = ExecIo {
            sink,
            deadline,
            cancel: CancellationToken::new(),
            globals: Arc::new(HostGlobals::new()),
        };
        (io, rx)
    }

    #[tokio::test]
    async fn test_load_reports_engine_failure() {
        let mut engine = MockInterpreterEngine::new();
        engine.expect_load().times(1).returning(|| {
            Err(BackendError::NotInstalled {
                toolchain: "python".to_string(),
                path: "python3".to_string(),
            })
        });
        let backend = InterpreterBackend::new(Arc::new(engine));

        let err = backend.load(&HostGlobals::new()).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_output_is_streamed_not_returned() {
        let mut engine = MockInterpreterEngine::new();
        engine.expect_load().returning(|| {
            Ok(EngineInfo {
                name: "python".to_string(),
                version: "3.12".to_string(),
            })
        });
        engine.expect_execute().returning(|_, _, _| Ok(()));
        let backend = InterpreterBackend::new(Arc::new(engine));
        let (io, _rx) = io(None);

        backend.load(&io.globals).await.unwrap();
        let output = backend.compile_and_run("print(1)", &io).await.unwrap();
        assert_eq!(output, ProgramOutput::default());
    }

    #[tokio::test]
    async fn test_engine_error_passes_through() {
        let mut engine = MockInterpreterEngine::new();
        engine.expect_execute().returning(|_, _, _| {
            Err(BackendError::Execution {
                msg: "NameError: name 'x' is not defined".to_string(),
            })
        });
        let backend = InterpreterBackend::new(Arc::new(engine));
        let (io, _rx) = io(None);

        let err = backend.compile_and_run("x", &io).await.unwrap_err();
        assert!(err.user_message().starts_with("`x` is used before"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_engine_hits_deadline() {
        let backend = InterpreterBackend::new(Arc::new(crate::stubs::engine::ScriptEngine::new()));
        let (io, _rx) = io(Some(Deadline::after(Duration::from_millis(250))));

        let err = backend.compile_and_run("hang", &io).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout { budget_ms: 250 });
    }
}
