use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    constants::{CANCELLED_MSG, DEFAULT_RUN_TIMEOUT},
    core::{
        context::ExecutionContext,
        deadline::Deadline,
        domain::{ExecutionRequest, Language, RunResult, RunUpdate},
        protocol::{HostMessage, WorkerMessage},
        traits::backend::{BackendError, BackendProvider},
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    Warming,
    Ready,
    /// The backend could not be loaded. Every run fails fast with `reason`.
    Degraded { reason: String },
    Running { run: Uuid },
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("Runner has been disposed")]
    Disposed,
    #[error("A run is already in progress")]
    Busy,
    #[error("{0}")]
    InitFailed(String),
    #[error("Execution context terminated unexpectedly")]
    ContextTerminated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Falls back to the runner's default timeout.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// A pending run. Resolves exactly once.
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    result: oneshot::Receiver<RunResult>,
    cancel: CancellationToken,
    updates: Option<mpsc::UnboundedReceiver<RunUpdate>>,
}

impl RunHandle {
    fn finished(result: RunResult) -> Self {
        let (result_tx, result_rx) = oneshot::channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        for update in &result.updates {
            let _ = live_tx.send(update.clone());
        }
        let _ = result_tx.send(result);

        Self {
            id: Uuid::new_v4(),
            result: result_rx,
            cancel: CancellationToken::new(),
            updates: Some(live_rx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Updates as they are produced. Available once.
    pub fn updates(&mut self) -> Option<UnboundedReceiverStream<RunUpdate>> {
        self.updates.take().map(UnboundedReceiverStream::new)
    }

    /// Resolves the run as cancelled unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> RunResult {
        match self.result.await {
            Ok(result) => result,
            Err(_) => RunResult::failed(RunnerError::ContextTerminated.to_string()),
        }
    }
}

#[derive(Debug)]
struct Shared {
    language: Language,
    state: RunnerState,
    context: Option<Arc<ExecutionContext>>,
    active: Option<CancellationToken>,
}

impl Shared {
    /// The current context, or a fresh one when there is none or it was killed.
    fn live_context(
        &mut self,
        provider: &dyn BackendProvider,
    ) -> Result<Arc<ExecutionContext>, BackendError> {
        match &self.context {
            Some(context) if !context.is_terminated() => Ok(context.clone()),
            _ => {
                let backend = provider.backend(self.language)?;
                let context = Arc::new(ExecutionContext::spawn(backend));
                tracing::debug!(language = %self.language, context = %context.id(), "Created execution context");
                self.context = Some(context.clone());
                Ok(context)
            }
        }
    }

    fn shutdown_context(&mut self) {
        if let Some(token) = self.active.take() {
            token.cancel();
        }
        if let Some(context) = self.context.take() {
            context.terminate();
        }
    }
}

/// Host-side facade over one execution context.
#[derive(Debug)]
pub struct Runner {
    provider: Arc<dyn BackendProvider>,
    default_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl Runner {
    pub fn new(language: Language, provider: Arc<dyn BackendProvider>) -> Self {
        Self {
            provider,
            default_timeout: DEFAULT_RUN_TIMEOUT,
            shared: Arc::new(Mutex::new(Shared {
                language,
                state: RunnerState::Uninitialized,
                context: None,
                active: None,
            })),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn language(&self) -> Language {
        self.lock().language
    }

    pub fn state(&self) -> RunnerState {
        self.lock().state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    /// Loads the backend ahead of the first run. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn warmup(&self) -> Result<(), RunnerError> {
        let context = {
            let mut shared = self.lock();
            match &shared.state {
                RunnerState::Disposed => return Err(RunnerError::Disposed),
                RunnerState::Degraded { reason } => {
                    return Err(RunnerError::InitFailed(reason.clone()));
                }
                RunnerState::Ready | RunnerState::Running { .. } => return Ok(()),
                RunnerState::Uninitialized | RunnerState::Warming => {}
            }
            match shared.live_context(self.provider.as_ref()) {
                Ok(context) => {
                    shared.state = RunnerState::Warming;
                    context
                }
                Err(err) => {
                    let reason = err.user_message();
                    tracing::warn!("Backend unavailable: {}", reason);
                    shared.state = RunnerState::Degraded {
                        reason: reason.clone(),
                    };
                    return Err(RunnerError::InitFailed(reason));
                }
            }
        };

        // Lock before posting so replies cannot interleave with another exchange.
        let mut outbox = context.outbox().lock_owned().await;
        context
            .post(HostMessage::Warmup)
            .await
            .map_err(|_| RunnerError::ContextTerminated)?;

        loop {
            match outbox.recv().await {
                Some(WorkerMessage::Ready) => {
                    let mut shared = self.lock();
                    if shared.state == RunnerState::Warming {
                        shared.state = RunnerState::Ready;
                    }
                    tracing::info!("Runner ready");
                    return Ok(());
                }
                Some(WorkerMessage::InitError { message }) => {
                    let mut shared = self.lock();
                    if shared.state != RunnerState::Disposed {
                        shared.state = RunnerState::Degraded {
                            reason: message.clone(),
                        };
                    }
                    return Err(RunnerError::InitFailed(message));
                }
                Some(other) => tracing::debug!("Ignoring message during warmup: {:?}", other),
                None => return Err(RunnerError::ContextTerminated),
            }
        }
    }

    /// Starts a run. The returned handle resolves with a terminal update no
    /// later than the timeout.
    pub fn run(&self, code: impl Into<String>, options: RunOptions) -> Result<RunHandle, RunnerError> {
        let mut shared = self.lock();
        match &shared.state {
            RunnerState::Disposed => return Err(RunnerError::Disposed),
            RunnerState::Running { .. } => return Err(RunnerError::Busy),
            RunnerState::Degraded { reason } => {
                return Ok(RunHandle::finished(RunResult::failed(reason.clone())));
            }
            RunnerState::Uninitialized | RunnerState::Warming | RunnerState::Ready => {}
        }

        let context = match shared.live_context(self.provider.as_ref()) {
            Ok(context) => context,
            Err(err) => {
                let reason = err.user_message();
                tracing::warn!("Backend unavailable: {}", reason);
                shared.state = RunnerState::Degraded {
                    reason: reason.clone(),
                };
                return Ok(RunHandle::finished(RunResult::failed(reason)));
            }
        };

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let deadline = Deadline::after(options.timeout.unwrap_or(self.default_timeout));
        shared.state = RunnerState::Running { run: id };
        shared.active = Some(cancel.clone());
        drop(shared);

        let (result_tx, result_rx) = oneshot::channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();

        tracing::info!(run = %id, budget_ms = deadline.budget_ms(), "Starting run");
        tokio::spawn(collect(
            Collector {
                shared: self.shared.clone(),
                context,
                run: id,
                deadline,
                cancel: cancel.clone(),
                live: live_tx,
            },
            code.into(),
            result_tx,
        ));

        Ok(RunHandle {
            id,
            result: result_rx,
            cancel,
            updates: Some(live_rx),
        })
    }

    /// Runs a request to completion, switching language first if needed.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<RunResult, RunnerError> {
        if request.language != self.language() {
            self.switch_language(request.language)?;
        }
        let handle = self.run(
            request.source,
            RunOptions::with_timeout(Duration::from_millis(request.timeout_ms)),
        )?;
        Ok(handle.wait().await)
    }

    /// Cancels the run in progress, if any.
    pub fn cancel(&self) {
        if let Some(token) = &self.lock().active {
            token.cancel();
        }
    }

    /// Drops the context and starts over with a different backend. Refused
    /// while a run is pending.
    pub fn switch_language(&self, language: Language) -> Result<(), RunnerError> {
        let mut shared = self.lock();
        match shared.state {
            RunnerState::Disposed => return Err(RunnerError::Disposed),
            RunnerState::Running { .. } => return Err(RunnerError::Busy),
            _ => {}
        }
        tracing::info!(from = %shared.language, to = %language, "Switching language");
        shared.shutdown_context();
        shared.language = language;
        shared.state = RunnerState::Uninitialized;
        Ok(())
    }

    /// Terminates the context. The runner is unusable afterwards.
    pub fn dispose(&self) {
        let mut shared = self.lock();
        shared.shutdown_context();
        shared.state = RunnerState::Disposed;
        tracing::debug!("Runner disposed");
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.lock().shutdown_context();
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Collector {
    shared: Arc<Mutex<Shared>>,
    context: Arc<ExecutionContext>,
    run: Uuid,
    deadline: Deadline,
    cancel: CancellationToken,
    live: mpsc::UnboundedSender<RunUpdate>,
}

enum Outcome {
    Finished,
    InitFailed(String),
    TimedOut,
    Cancelled,
    Lost,
}

impl Collector {
    fn record(&self, updates: &mut Vec<RunUpdate>, update: RunUpdate) {
        // The caller may have dropped the live stream; the result still gets it.
        let _ = self.live.send(update.clone());
        updates.push(update);
    }

    async fn exchange(&self, code: String, updates: &mut Vec<RunUpdate>) -> Outcome {
        let mut outbox = self.context.outbox().lock_owned().await;
        let posted = self
            .context
            .post(HostMessage::Run {
                code,
                deadline: Some(self.deadline),
            })
            .await;
        if posted.is_err() {
            return Outcome::Lost;
        }

        while let Some(msg) = outbox.recv().await {
            match msg {
                WorkerMessage::Ready => continue,
                WorkerMessage::InitError { message } => {
                    self.record(updates, RunUpdate::error(message.clone()));
                    return Outcome::InitFailed(message);
                }
                msg => {
                    let update = RunUpdate::from(msg);
                    let terminal = update.is_terminal();
                    self.record(updates, update);
                    if terminal {
                        return Outcome::Finished;
                    }
                }
            }
        }
        Outcome::Lost
    }

    fn settle(&self, outcome: &Outcome) {
        let mut shared = lock_shared(&self.shared);
        if shared.state != (RunnerState::Running { run: self.run }) {
            return;
        }
        shared.active = None;
        shared.state = match outcome {
            Outcome::Finished => RunnerState::Ready,
            Outcome::InitFailed(reason) => RunnerState::Degraded {
                reason: reason.clone(),
            },
            Outcome::TimedOut | Outcome::Cancelled | Outcome::Lost => {
                RunnerState::Uninitialized
            }
        };
    }
}

#[tracing::instrument(skip_all, fields(run = %collector.run))]
async fn collect(collector: Collector, code: String, done: oneshot::Sender<RunResult>) {
    let started_at = Utc::now();
    let clock = Instant::now();
    let mut updates = Vec::new();

    let outcome = tokio::select! {
        biased;
        _ = collector.cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep_until(collector.deadline.instant()) => Outcome::TimedOut,
        outcome = collector.exchange(code, &mut updates) => outcome,
    };

    match &outcome {
        Outcome::Finished | Outcome::InitFailed(_) => {}
        Outcome::TimedOut => {
            tracing::info!("Run timed out, terminating context");
            collector.context.terminate();
            let message = BackendError::Timeout {
                budget_ms: collector.deadline.budget_ms(),
            }
            .to_string();
            collector.record(&mut updates, RunUpdate::error(message));
        }
        Outcome::Cancelled => {
            tracing::info!("Run cancelled, terminating context");
            collector.context.terminate();
            collector.record(&mut updates, RunUpdate::error(CANCELLED_MSG));
        }
        Outcome::Lost => {
            tracing::error!("Execution context went away mid-run");
            collector.context.terminate();
            collector.record(
                &mut updates,
                RunUpdate::error(RunnerError::ContextTerminated.to_string()),
            );
        }
    }
    collector.settle(&outcome);

    let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(elapsed_ms, "Run finished");
    let _ = done.send(RunResult {
        updates,
        started_at,
        elapsed_ms,
    });
}
