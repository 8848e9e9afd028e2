use std::time::Duration;

use crate::core::{
    context::shim::HostGlobals,
    domain::ProgramOutput,
    traits::backend::{Backend, BackendError, ExecIo},
};

/// Backend that answers every run with a fixed result after a delay.
#[derive(Debug, Clone)]
pub struct BackendStub {
    result: Result<ProgramOutput, BackendError>,
    delay: Duration,
}

impl BackendStub {
    pub fn new(result: Result<ProgramOutput, BackendError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Backend for BackendStub {
    async fn load(&self, _globals: &HostGlobals) -> Result<(), BackendError> {
        Ok(())
    }

    #[tracing::instrument(skip(io))]
    async fn compile_and_run(
        &self,
        source: &str,
        io: &ExecIo,
    ) -> Result<ProgramOutput, BackendError> {
        tracing::debug!("Start execution: source={:?}", source);
        tokio::select! {
            _ = io.cancel.cancelled() => return Err(BackendError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}
