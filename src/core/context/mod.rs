//! Isolated execution context: one worker task per Runner, reached only
//! through message channels.

pub mod shim;

use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    constants::{CHUNK_QUEUE_CAPACITY, INBOX_CAPACITY, OUTBOX_CAPACITY},
    core::{
        context::shim::HostGlobals,
        deadline::Deadline,
        protocol::{HostMessage, WorkerMessage},
        traits::backend::{Backend, BackendError, ExecIo, OutputChunk, OutputSink},
    },
};

pub type Outbox = Arc<Mutex<mpsc::Receiver<WorkerMessage>>>;

#[derive(Debug, thiserror::Error)]
#[error("execution context {id} has terminated")]
pub struct ContextTerminated {
    pub id: Uuid,
}

/// Per-context record of the backend's load state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

/// Kill switch for a context.
#[derive(Debug)]
struct ContextHandle {
    id: Uuid,
    cancel: CancellationToken,
    abort: AbortHandle,
}

impl ContextHandle {
    /// Kills the worker. Nothing is emitted afterwards.
    fn terminate(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(context = %self.id, "Terminating execution context");
        }
        self.cancel.cancel();
        self.abort.abort();
    }

    fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.is_finished()
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    handle: ContextHandle,
    inbox: mpsc::Sender<HostMessage>,
    outbox: Outbox,
    globals: Arc<HostGlobals>,
    task: JoinHandle<()>,
}

impl ExecutionContext {
    /// Starts a worker for `backend`. The network shim is installed before
    /// the worker handles its first message.
    pub fn spawn(backend: Arc<dyn Backend>) -> Self {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let globals = Arc::new(HostGlobals::new());
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let worker = Worker {
            id,
            backend,
            globals: globals.clone(),
            cancel: cancel.clone(),
            outbox: outbox_tx,
            state: LoadState::Uninitialized,
        };
        let task = tokio::spawn(worker.serve(inbox_rx));

        tracing::debug!(context = %id, "Execution context spawned");
        Self {
            handle: ContextHandle {
                id,
                cancel,
                abort: task.abort_handle(),
            },
            inbox: inbox_tx,
            outbox: Arc::new(Mutex::new(outbox_rx)),
            globals,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn globals(&self) -> &Arc<HostGlobals> {
        &self.globals
    }

    /// Messages the worker sends back. Locked by whoever is waiting on the
    /// current exchange.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub async fn post(&self, msg: HostMessage) -> Result<(), ContextTerminated> {
        if self.is_terminated() {
            return Err(ContextTerminated { id: self.id() });
        }
        self.inbox
            .send(msg)
            .await
            .map_err(|_| ContextTerminated { id: self.id() })
    }

    pub fn terminate(&self) {
        self.handle.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.handle.is_terminated() || self.task.is_finished()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.handle.terminate();
    }
}

struct Worker {
    id: Uuid,
    backend: Arc<dyn Backend>,
    globals: Arc<HostGlobals>,
    cancel: CancellationToken,
    outbox: mpsc::Sender<WorkerMessage>,
    state: LoadState,
}

impl Worker {
    async fn serve(mut self, mut inbox: mpsc::Receiver<HostMessage>) {
        self.globals.install_network_shim();

        while let Some(msg) = inbox.recv().await {
            let delivered = match msg {
                HostMessage::Warmup => self.warmup().await,
                HostMessage::Run { code, deadline } => self.run(&code, deadline).await,
            };
            if !delivered {
                tracing::debug!(context = %self.id, "Host went away, stopping worker");
                break;
            }
        }
    }

    /// Loads the backend unless this context already tried.
    async fn ensure_loaded(&mut self) -> Result<(), String> {
        match &self.state {
            LoadState::Ready => return Ok(()),
            LoadState::Failed(reason) => return Err(reason.clone()),
            LoadState::Uninitialized | LoadState::Loading => {}
        }

        self.state = LoadState::Loading;
        tracing::info!(context = %self.id, "Loading backend");
        match self.backend.load(&self.globals).await {
            Ok(()) => {
                self.state = LoadState::Ready;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(context = %self.id, "Backend unavailable: {}", err);
                let reason = err.user_message();
                self.state = LoadState::Failed(reason.clone());
                Err(reason)
            }
        }
    }

    async fn warmup(&mut self) -> bool {
        let reply = match self.ensure_loaded().await {
            Ok(()) => WorkerMessage::Ready,
            Err(message) => WorkerMessage::InitError { message },
        };
        self.send(reply).await
    }

    #[tracing::instrument(skip(self, code), fields(context = %self.id))]
    async fn run(&mut self, code: &str, deadline: Option<Deadline>) -> bool {
        if let Err(message) = self.ensure_loaded().await {
            return self.send(WorkerMessage::InitError { message }).await;
        }

        let (sink, mut chunks) = OutputSink::channel(CHUNK_QUEUE_CAPACITY);
        let io = ExecIo {
            sink,
            deadline,
            cancel: self.cancel.child_token(),
            globals: self.globals.clone(),
        };

        let backend = self.backend.clone();
        let exec = backend.compile_and_run(code, &io);
        tokio::pin!(exec);

        let result = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunks.recv() => {
                    if !self.forward(chunk).await {
                        return false;
                    }
                }
                result = &mut exec => break result,
            }
        };

        while let Ok(chunk) = chunks.try_recv() {
            if !self.forward(chunk).await {
                return false;
            }
        }

        match result {
            Ok(output) => {
                tracing::debug!("Backend finished");
                if !output.stdout.is_empty()
                    && !self.send(WorkerMessage::Stdout { data: output.stdout }).await
                {
                    return false;
                }
                if !output.stderr.is_empty()
                    && !self.send(WorkerMessage::Stderr { data: output.stderr }).await
                {
                    return false;
                }
                self.send(WorkerMessage::Done).await
            }
            Err(err) => {
                if !matches!(err, BackendError::Execution { .. }) {
                    tracing::warn!("Run failed: {}", err);
                }
                self.send(WorkerMessage::Error {
                    message: err.user_message(),
                })
                .await
            }
        }
    }

    async fn forward(&self, chunk: OutputChunk) -> bool {
        let msg = match chunk {
            OutputChunk::Stdout(data) => WorkerMessage::Stdout { data },
            OutputChunk::Stderr(data) => WorkerMessage::Stderr { data },
        };
        self.send(msg).await
    }

    async fn send(&self, msg: WorkerMessage) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.outbox.send(msg).await.is_ok()
    }
}
