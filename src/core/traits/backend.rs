use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{
    context::shim::HostGlobals,
    deadline::Deadline,
    domain::{Language, ProgramOutput},
    normalize::normalize_error,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{toolchain} is not installed (expected it at {path})")]
    NotInstalled { toolchain: String, path: String },
    #[error("Failed to initialize: {msg}")]
    Init { msg: String },
    /// User code raised. Carries the raw trace.
    #[error("{msg}")]
    Execution { msg: String },
    /// Compiler rejected the source. Carries the raw diagnostics.
    #[error("{msg}")]
    Compilation { msg: String },
    #[error("Network access disabled")]
    NetworkDisabled,
    #[error("Request failed: {msg}")]
    Transport { msg: String },
    #[error("Unexpected response: {msg}")]
    Malformed { msg: String },
    #[error("Execution timed out after {budget_ms} ms")]
    Timeout { budget_ms: u64 },
    #[error("Run cancelled")]
    Cancelled,
    #[error("Internal error: {msg}")]
    Internal { msg: String },
}

impl BackendError {
    /// Message shown to the learner. Raw traces and diagnostics go through the
    /// normalizer; everything else is already phrased for humans.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Execution { msg } | BackendError::Compilation { msg } => {
                normalize_error(msg)
            }
            other => other.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BackendError::NotInstalled { .. } | BackendError::Init { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Ordered, bounded queue a backend pushes output into while it runs.
#[derive(Clone, Debug)]
pub struct OutputSink {
    tx: mpsc::Sender<OutputChunk>,
}

impl OutputSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputChunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn stdout(&self, data: impl Into<String>) -> Result<(), BackendError> {
        self.push(OutputChunk::Stdout(data.into())).await
    }

    pub async fn stderr(&self, data: impl Into<String>) -> Result<(), BackendError> {
        self.push(OutputChunk::Stderr(data.into())).await
    }

    async fn push(&self, chunk: OutputChunk) -> Result<(), BackendError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| BackendError::Cancelled)
    }
}

/// Everything a backend gets from its context for one run.
#[derive(Clone, Debug)]
pub struct ExecIo {
    pub sink: OutputSink,
    pub deadline: Option<Deadline>,
    pub cancel: CancellationToken,
    pub globals: Arc<HostGlobals>,
}

/// One concrete execution technology.
///
/// Output pushed through [`ExecIo::sink`] must not be repeated in the
/// returned [`ProgramOutput`].
#[mockall::automock]
#[async_trait::async_trait]
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// Loads the toolchain. Called at most once per execution context.
    async fn load(&self, globals: &HostGlobals) -> Result<(), BackendError>;

    async fn compile_and_run(
        &self,
        source: &str,
        io: &ExecIo,
    ) -> Result<ProgramOutput, BackendError>;
}

/// Hands out a fresh backend for every execution context.
pub trait BackendProvider: std::fmt::Debug + Send + Sync {
    fn backend(&self, language: Language) -> Result<Arc<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_normalizes_traces_only() {
        let trace = "Traceback (most recent call last):\n  File \"<exercise>\", line 2, in <module>\nZeroDivisionError: division by zero";
        let err = BackendError::Execution {
            msg: trace.to_string(),
        };
        assert!(err.user_message().contains("divide by zero"));

        let err = BackendError::Timeout { budget_ms: 1500 };
        assert_eq!(err.user_message(), "Execution timed out after 1500 ms");
    }

    #[tokio::test]
    async fn test_sink_preserves_order_and_reports_closed_queue() {
        let (sink, mut rx) = OutputSink::channel(4);
        sink.stdout("a").await.unwrap();
        sink.stderr("b").await.unwrap();
        sink.stdout("c").await.unwrap();

        assert_eq!(rx.recv().await, Some(OutputChunk::Stdout("a".into())));
        assert_eq!(rx.recv().await, Some(OutputChunk::Stderr("b".into())));
        assert_eq!(rx.recv().await, Some(OutputChunk::Stdout("c".into())));

        drop(rx);
        assert_eq!(sink.stdout("late").await, Err(BackendError::Cancelled));
    }
}
