use crate::core::{
    context::shim::HostGlobals,
    traits::backend::{BackendError, OutputSink},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
}

/// A general-purpose language interpreter the interpreter backend drives.
#[mockall::automock]
#[async_trait::async_trait]
pub trait InterpreterEngine: std::fmt::Debug + Send + Sync {
    async fn load(&self) -> Result<EngineInfo, BackendError>;

    /// Runs `source`, pushing every output chunk into `sink` as it is produced.
    ///
    /// An uncaught exception in user code is `BackendError::Execution` with the raw trace.
    async fn execute(
        &self,
        source: &str,
        globals: &HostGlobals,
        sink: &OutputSink,
    ) -> Result<(), BackendError>;
}
