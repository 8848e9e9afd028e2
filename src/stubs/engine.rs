use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::core::{
    context::shim::{HostGlobals, NetPrimitive},
    traits::{
        backend::{BackendError, OutputSink},
        engine::{EngineInfo, InterpreterEngine},
    },
};

/// Interpreter engine for a tiny line language, one instruction per line:
///
/// * `print <text>` / `eprint <text>` write a line to stdout / stderr
/// * `sleep <ms>` pauses
/// * `fetch|socket|events|http <target>` call a network primitive
/// * `raise <message>` fails with an execution error
/// * `hang` never returns
#[derive(Debug, Default)]
pub struct ScriptEngine {
    unavailable: bool,
    loads: AtomicUsize,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose load always fails as if it were not installed.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl InterpreterEngine for ScriptEngine {
    async fn load(&self) -> Result<EngineInfo, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(BackendError::NotInstalled {
                toolchain: "The script engine".to_string(),
                path: "stub://script".to_string(),
            });
        }
        Ok(EngineInfo {
            name: "script".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn execute(
        &self,
        source: &str,
        globals: &HostGlobals,
        sink: &OutputSink,
    ) -> Result<(), BackendError> {
        for line in source.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
            match op {
                "print" => sink.stdout(format!("{arg}\n")).await?,
                "eprint" => sink.stderr(format!("{arg}\n")).await?,
                "sleep" => {
                    let ms = arg.parse().map_err(|_| BackendError::Execution {
                        msg: format!("bad sleep duration {arg:?}"),
                    })?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "fetch" => globals.invoke(NetPrimitive::Fetch, arg)?,
                "socket" => globals.invoke(NetPrimitive::Socket, arg)?,
                "events" => globals.invoke(NetPrimitive::EventStream, arg)?,
                "http" => globals.invoke(NetPrimitive::HttpRequest, arg)?,
                "raise" => {
                    return Err(BackendError::Execution {
                        msg: arg.to_string(),
                    });
                }
                "hang" => std::future::pending::<()>().await,
                other => {
                    return Err(BackendError::Execution {
                        msg: format!("SyntaxError: unknown instruction {other:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}
