use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    constants::OUTBOX_CAPACITY,
    core::{
        domain::{Language, RunUpdate},
        grading::{DesiredOutput, ProgressGate},
        runner::{RunHandle, RunOptions, Runner, RunnerError},
        traits::backend::BackendProvider,
    },
    pipeline::SessionRegistry,
};

/// One line from the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    Warmup {
        language: Language,
    },
    Run {
        language: Language,
        code: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        expect: Option<DesiredOutput>,
    },
    Cancel,
}

/// One line to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Ready,
    InitError {
        message: String,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Error {
        message: String,
    },
    Done,
    Verdict {
        passed: bool,
        explanation: String,
        can_continue: bool,
    },
    /// The request was not accepted, e.g. it was not valid JSON.
    Rejected {
        message: String,
    },
}

impl From<RunUpdate> for ServerMessage {
    fn from(update: RunUpdate) -> Self {
        match update {
            RunUpdate::Stdout { data } => ServerMessage::Stdout { data },
            RunUpdate::Stderr { data } => ServerMessage::Stderr { data },
            RunUpdate::Error { message } => ServerMessage::Error { message },
            RunUpdate::Done => ServerMessage::Done,
            RunUpdate::Ready => ServerMessage::Ready,
        }
    }
}

/// Spawns a session for every connection coming out of `session_rx`.
pub fn handle_sessions(
    mut session_rx: Receiver<TcpStream>,
    provider: Arc<dyn BackendProvider>,
    default_timeout: Duration,
    sessions: SessionRegistry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(socket) = session_rx.recv().await {
            let id = Uuid::new_v4();
            let shutdown = CancellationToken::new();
            sessions.insert(id, shutdown.clone());

            let provider = provider.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                serve_session(id, socket, provider, default_timeout, shutdown).await;
                sessions.remove(&id);
            });
        }
    })
}

#[tracing::instrument(skip(socket, provider, default_timeout, shutdown))]
pub async fn serve_session(
    id: Uuid,
    socket: TcpStream,
    provider: Arc<dyn BackendProvider>,
    default_timeout: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("Session opened");
    let (read_half, write_half) = socket.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer = tokio::spawn(write_messages(write_half, out_rx));

    let mut session = Session {
        provider,
        default_timeout,
        runner: None,
        out: out_tx,
    };
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => session.handle(&line).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read from session socket: {}", e);
                break;
            }
        }
    }

    session.close();
    drop(session);
    if let Err(e) = writer.await {
        tracing::error!("Session writer failed: {}", e);
    }
    tracing::info!("Session closed");
}

struct Session {
    provider: Arc<dyn BackendProvider>,
    default_timeout: Duration,
    runner: Option<Arc<Runner>>,
    out: Sender<ServerMessage>,
}

impl Session {
    async fn handle(&mut self, line: &str) {
        let request = match serde_json::from_str::<ClientRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Rejecting request {:?}: {}", line, e);
                send(
                    &self.out,
                    ServerMessage::Rejected {
                        message: format!("Invalid request: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        match request {
            ClientRequest::Warmup { language } => {
                let Some(runner) = self.runner_for(language).await else {
                    return;
                };
                let out = self.out.clone();
                tokio::spawn(async move {
                    let reply = match runner.warmup().await {
                        Ok(()) => ServerMessage::Ready,
                        Err(RunnerError::InitFailed(message)) => ServerMessage::InitError { message },
                        Err(e) => ServerMessage::Rejected {
                            message: e.to_string(),
                        },
                    };
                    send(&out, reply).await;
                });
            }
            ClientRequest::Run {
                language,
                code,
                timeout_ms,
                expect,
            } => {
                let Some(runner) = self.runner_for(language).await else {
                    return;
                };
                let options = RunOptions {
                    timeout: timeout_ms.map(Duration::from_millis),
                };
                match runner.run(code.clone(), options) {
                    Ok(handle) => {
                        tokio::spawn(stream_run(handle, code, expect, self.out.clone()));
                    }
                    Err(e) => {
                        send(
                            &self.out,
                            ServerMessage::Rejected {
                                message: e.to_string(),
                            },
                        )
                        .await
                    }
                }
            }
            ClientRequest::Cancel => {
                if let Some(runner) = &self.runner {
                    runner.cancel();
                }
            }
        }
    }

    /// The session's Runner, switched to `language` if it was set up for another one.
    /// A switch the Runner refuses is reported to the client as `rejected`.
    async fn runner_for(&mut self, language: Language) -> Option<Arc<Runner>> {
        if let Some(runner) = &self.runner {
            if runner.language() != language {
                if let Err(e) = runner.switch_language(language) {
                    tracing::debug!("Refusing to switch to {}: {}", language, e);
                    send(
                        &self.out,
                        ServerMessage::Rejected {
                            message: e.to_string(),
                        },
                    )
                    .await;
                    return None;
                }
            }
            return Some(runner.clone());
        }

        let runner = Arc::new(
            Runner::new(language, self.provider.clone()).with_default_timeout(self.default_timeout),
        );
        self.runner = Some(runner.clone());
        Some(runner)
    }

    fn close(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.dispose();
        }
    }
}

/// Forwards a run's updates as they come, then grades it if a rule was sent.
async fn stream_run(
    mut handle: RunHandle,
    code: String,
    expect: Option<DesiredOutput>,
    out: Sender<ServerMessage>,
) {
    if let Some(mut updates) = handle.updates() {
        while let Some(update) = updates.next().await {
            send(&out, update.into()).await;
        }
    }

    let result = handle.wait().await;
    let Some(desired) = expect else {
        return;
    };
    let progress = ProgressGate::evaluate(Some(&desired), Some((&result, code.as_str())));
    if let Some(verdict) = progress.verdict {
        send(
            &out,
            ServerMessage::Verdict {
                passed: verdict.passed,
                explanation: verdict.explanation,
                can_continue: progress.can_continue,
            },
        )
        .await;
    }
}

async fn send(out: &Sender<ServerMessage>, msg: ServerMessage) {
    if out.send(msg).await.is_err() {
        tracing::debug!("Session writer is gone, dropping message");
    }
}

async fn write_messages(mut socket: OwnedWriteHalf, mut out_rx: Receiver<ServerMessage>) {
    while let Some(msg) = out_rx.recv().await {
        let mut line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", msg, e);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = socket.write_all(line.as_bytes()).await {
            tracing::debug!("Session socket closed: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::Lines,
        net::{TcpListener, tcp::OwnedReadHalf},
    };

    use super::*;
    use crate::{
        pipeline::{accepting::accept_connections, shutdown_sessions},
        stubs::{engine::ScriptEngine, provider::StubProvider},
    };

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, line: &str) {
            self.write
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("server did not answer in time")
                .unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }
    }

    async fn start() -> (SocketAddr, SessionRegistry) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (session_tx, session_rx) = mpsc::channel(4);
        let sessions = SessionRegistry::default();
        let provider = StubProvider::default().with_engine(Language::Python, Arc::new(ScriptEngine::new()));

        accept_connections(listener, session_tx);
        handle_sessions(
            session_rx,
            Arc::new(provider),
            Duration::from_secs(5),
            sessions.clone(),
        );
        (addr, sessions)
    }

    #[tokio::test]
    async fn test_warmup_then_graded_run() {
        let (addr, _sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client.send(r#"{"type":"warmup","language":"python"}"#).await;
        assert_eq!(client.recv().await, Some(ServerMessage::Ready));

        client
            .send(r#"{"type":"run","language":"python","code":"print 7 3","expect":{"kind":"exact","value":"7 3"}}"#)
            .await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Stdout {
                data: "7 3\n".to_string()
            })
        );
        assert_eq!(client.recv().await, Some(ServerMessage::Done));
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Verdict {
                passed: true,
                explanation: "Output matches exactly.".to_string(),
                can_continue: true,
            })
        );
    }

    #[tokio::test]
    async fn test_unavailable_language_reports_init_error() {
        let (addr, _sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client.send(r#"{"type":"warmup","language":"c"}"#).await;
        assert!(matches!(
            client.recv().await,
            Some(ServerMessage::InitError { message }) if message.contains("not installed")
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (addr, _sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client.send("{not json").await;
        assert!(matches!(client.recv().await, Some(ServerMessage::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_cancel_and_busy() {
        let (addr, _sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client
            .send(r#"{"type":"run","language":"python","code":"print a\nhang"}"#)
            .await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Stdout {
                data: "a\n".to_string()
            })
        );

        client
            .send(r#"{"type":"run","language":"python","code":"print b"}"#)
            .await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Rejected {
                message: "A run is already in progress".to_string()
            })
        );

        client.send(r#"{"type":"cancel"}"#).await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Error {
                message: "Run cancelled".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_language_change_during_run_is_rejected() {
        let (addr, _sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client
            .send(r#"{"type":"run","language":"python","code":"print a\nhang"}"#)
            .await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Stdout {
                data: "a\n".to_string()
            })
        );

        client.send(r#"{"type":"warmup","language":"c"}"#).await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Rejected {
                message: "A run is already in progress".to_string()
            })
        );
        client
            .send(r#"{"type":"run","language":"cpp","code":"int main() {}"}"#)
            .await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Rejected {
                message: "A run is already in progress".to_string()
            })
        );

        client.send(r#"{"type":"cancel"}"#).await;
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Error {
                message: "Run cancelled".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (addr, sessions) = start().await;
        let mut client = Client::connect(addr).await;

        client
            .send(r#"{"type":"run","language":"python","code":"print up\nhang"}"#)
            .await;
        assert!(matches!(client.recv().await, Some(ServerMessage::Stdout { .. })));
        assert_eq!(sessions.len(), 1);

        shutdown_sessions(&sessions);
        assert_eq!(
            client.recv().await,
            Some(ServerMessage::Error {
                message: "Run cancelled".to_string()
            })
        );
        assert_eq!(client.recv().await, None);
    }
}
