use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    constants::{DEFAULT_RUN_TIMEOUT, REMOTE_POLL_INTERVAL},
    core::{
        context::shim::HostGlobals,
        deadline::Deadline,
        domain::{Language, ProgramOutput},
        traits::backend::{Backend, BackendError, ExecIo},
    },
    remote::{
        api::{RemoteApi, SessionStatus},
        warnings::strip_warnings,
    },
};

/// Compiles and runs source on a remote API, polling until the session completes.
///
/// Every call is bounded by what is left of the run's single deadline.
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    language: Language,
    api: Arc<dyn RemoteApi>,
    poll_interval: Duration,
    default_timeout: Duration,
}

impl RemoteBackend {
    pub fn new(language: Language, api: Arc<dyn RemoteApi>) -> Self {
        Self {
            language,
            api,
            poll_interval: REMOTE_POLL_INTERVAL,
            default_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Issues one API call with the remaining budget. Nothing is sent once
    /// the deadline has passed.
    async fn call<T, F, Fut>(
        &self,
        deadline: &Deadline,
        io: &ExecIo,
        request: F,
    ) -> Result<T, BackendError>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let timed_out = || BackendError::Timeout {
            budget_ms: deadline.budget_ms(),
        };
        let budget = deadline.remaining().ok_or_else(timed_out)?;

        tokio::select! {
            biased;
            _ = io.cancel.cancelled() => Err(BackendError::Cancelled),
            _ = tokio::time::sleep_until(deadline.instant()) => Err(timed_out()),
            result = request(budget) => result.map_err(|e| {
                if deadline.is_expired() { timed_out() } else { e }
            }),
        }
    }
}

#[async_trait::async_trait]
impl Backend for RemoteBackend {
    async fn load(&self, _globals: &HostGlobals) -> Result<(), BackendError> {
        tracing::info!("Using remote API for {}", self.language);
        Ok(())
    }

    #[tracing::instrument(skip(self, source, io), fields(language = %self.language))]
    async fn compile_and_run(
        &self,
        source: &str,
        io: &ExecIo,
    ) -> Result<ProgramOutput, BackendError> {
        let deadline = io
            .deadline
            .unwrap_or_else(|| Deadline::after(self.default_timeout));

        let session = self
            .call(&deadline, io, |budget| {
                self.api.create(self.language, source, budget)
            })
            .await?;
        tracing::debug!("Remote session {} created", session.id);

        let mut status = session.status;
        while status.is_running() {
            tokio::select! {
                biased;
                _ = io.cancel.cancelled() => return Err(BackendError::Cancelled),
                slept = deadline.sleep_within(self.poll_interval) => {
                    if !slept {
                        return Err(BackendError::Timeout { budget_ms: deadline.budget_ms() });
                    }
                }
            }
            status = self
                .call(&deadline, io, |budget| self.api.status(&session.id, budget))
                .await?;
            tracing::debug!("Remote session {} is {:?}", session.id, status);
        }

        let details = self
            .call(&deadline, io, |budget| self.api.details(&session.id, budget))
            .await?;

        if details.build_failed() {
            let diagnostics = strip_warnings(&details.build_stderr);
            let msg = if diagnostics.trim().is_empty() {
                details.build_stdout
            } else {
                diagnostics
            };
            return Err(BackendError::Compilation { msg });
        }

        if details.run_failed() {
            if !details.stdout.is_empty() {
                io.sink.stdout(details.stdout).await?;
            }
            let msg = if details.stderr.trim().is_empty() {
                format!(
                    "Program exited with {} (exit code {})",
                    details.result.as_deref().unwrap_or("failure"),
                    details.exit_code.map_or("unknown".to_string(), |code| code.to_string())
                )
            } else {
                details.stderr
            };
            return Err(BackendError::Execution { msg });
        }

        Ok(ProgramOutput {
            stdout: details.stdout,
            stderr: details.stderr,
        })
    }
}
