use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use itertools::Itertools;
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};
use uuid::Uuid;

use crate::core::{
    context::shim::HostGlobals,
    traits::{
        backend::{BackendError, OutputSink},
        engine::{EngineInfo, InterpreterEngine},
    },
};

/// Prefix of the stderr line the driver uses to report an uncaught exception.
const FAULT_SENTINEL: &str = "\u{0}runner-fault\u{0}";
/// Stderr line the driver writes when user code calls `sys.exit`.
const EXIT_SENTINEL: &str = "\u{0}runner-exit\u{0}";

/// Runs `argv[1]` as `<exercise>` after disabling the primitives named in
/// `argv[2]`. Everything the network modules subclass is imported first.
const DRIVER: &str = r#"
import _socket, asyncio, http.client, json, socket, ssl, sys, traceback, urllib.request

MESSAGE = "Network access disabled"

def _deny(*args, **kwargs):
    raise OSError(MESSAGE)

class _Denied:
    def __init__(self, *args, **kwargs):
        raise OSError(MESSAGE)

blocked = set(filter(None, sys.argv[2].split(","))) if len(sys.argv) > 2 else set()
if "fetch" in blocked:
    urllib.request.urlopen = _deny
if "socket" in blocked:
    _Socket = socket.socket

    class _AdoptOnly(_Socket):
        # Wrapping an existing descriptor stays allowed: socketpair needs it.
        def __init__(self, family=-1, type=-1, proto=-1, fileno=None):
            if fileno is None:
                raise OSError(MESSAGE)
            super().__init__(family, type, proto, fileno)

    for name in ("connect", "connect_ex", "sendto", "sendmsg"):
        setattr(_Socket, name, _deny)
    socket.socket = socket.SocketType = _AdoptOnly
    _socket.socket = _socket.SocketType = _Denied
    socket.create_connection = _deny
    socket.getaddrinfo = _deny
if "event-stream" in blocked:
    asyncio.open_connection = _deny
if "http-request" in blocked:
    http.client.HTTPConnection = _Denied
    http.client.HTTPSConnection = _Denied

with open(sys.argv[1], encoding="utf-8") as f:
    source = f.read()
sys.argv = ["<exercise>"]

try:
    exec(compile(source, "<exercise>", "exec"), {"__name__": "__main__"})
except SystemExit:
    sys.stdout.flush()
    sys.stderr.write("\x00runner-exit\x00\n")
    sys.stderr.flush()
    raise
except BaseException as exc:
    tb = exc.__traceback__
    while tb is not None and tb.tb_frame.f_code.co_filename != "<exercise>":
        tb = tb.tb_next
    text = "".join(traceback.format_exception_only(type(exc), exc))
    if tb is not None:
        text = "Traceback (most recent call last):\n" + "".join(traceback.format_tb(tb)) + text
    sys.stdout.flush()
    sys.stderr.write("\x00runner-fault\x00" + json.dumps(text) + "\n")
    sys.stderr.flush()
    sys.exit(1)
"#;

/// Python interpreter binary driven as an [`InterpreterEngine`].
#[derive(Clone, Debug)]
pub struct PythonEngine {
    program: PathBuf,
    work_dir: PathBuf,
}

impl PythonEngine {
    pub fn new<T, U>(program: T, work_dir: U) -> Self
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
    {
        PythonEngine {
            program: program.as_ref().into(),
            work_dir: work_dir.as_ref().into(),
        }
    }

    fn not_installed(&self) -> BackendError {
        BackendError::NotInstalled {
            toolchain: "Python".to_string(),
            path: self.program.display().to_string(),
        }
    }
}

#[async_trait::async_trait]
impl InterpreterEngine for PythonEngine {
    async fn load(&self) -> Result<EngineInfo, BackendError> {
        let out = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => self.not_installed(),
                _ => BackendError::Init { msg: e.to_string() },
            })?;

        if !out.status.success() {
            return Err(BackendError::Init {
                msg: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        // Old interpreters print the version on stderr.
        let banner = if out.stdout.is_empty() {
            out.stderr
        } else {
            out.stdout
        };
        let banner = String::from_utf8_lossy(&banner);
        Ok(EngineInfo {
            name: "python".to_string(),
            version: banner.trim().trim_start_matches("Python ").to_string(),
        })
    }

    #[tracing::instrument(skip(self, source, globals, sink))]
    async fn execute(
        &self,
        source: &str,
        globals: &HostGlobals,
        sink: &OutputSink,
    ) -> Result<(), BackendError> {
        let script_path = self.work_dir.join(format!("{}.py", Uuid::new_v4()));
        fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| BackendError::Internal { msg: e.to_string() })?;
        fs::write(&script_path, source)
            .await
            .map_err(|e| BackendError::Internal { msg: e.to_string() })?;

        let result = self.drive(&script_path, globals, sink).await;

        if let Err(e) = fs::remove_file(&script_path).await {
            tracing::warn!("Failed to remove {}: {}", script_path.display(), e);
        }
        result
    }
}

impl PythonEngine {
    async fn drive(
        &self,
        script_path: &Path,
        globals: &HostGlobals,
        sink: &OutputSink,
    ) -> Result<(), BackendError> {
        let blocked = globals.blocked().iter().map(|p| p.name()).join(",");

        let mut child = Command::new(&self.program)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .arg(script_path)
            .arg(blocked)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => self.not_installed(),
                _ => BackendError::Internal { msg: e.to_string() },
            })?;

        let internal = || BackendError::Internal {
            msg: "interpreter pipes unavailable".to_string(),
        };
        let mut stdout = child.stdout.take().ok_or_else(internal)?;
        let mut stderr = BufReader::new(child.stderr.take().ok_or_else(internal)?);

        let mut fault = None;
        let mut exited = false;
        let mut pending = Vec::new();
        let mut err_line = Vec::new();
        let mut buf = [0u8; 4096];
        let (mut stdout_open, mut stderr_open) = (true, true);

        loop {
            tokio::select! {
                read = stdout.read(&mut buf), if stdout_open => {
                    let n = read.map_err(|e| BackendError::Internal { msg: e.to_string() })?;
                    if n == 0 {
                        stdout_open = false;
                        if !pending.is_empty() {
                            sink.stdout(String::from_utf8_lossy(&pending).into_owned()).await?;
                            pending.clear();
                        }
                        continue;
                    }
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut pending);
                    if !text.is_empty() {
                        sink.stdout(text).await?;
                    }
                }
                read = stderr.read_until(b'\n', &mut err_line), if stderr_open => {
                    let n = read.map_err(|e| BackendError::Internal { msg: e.to_string() })?;
                    if n == 0 {
                        stderr_open = false;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&err_line).into_owned();
                    err_line.clear();
                    let bare = line.trim_end_matches(['\r', '\n']);
                    if let Some(payload) = bare.strip_prefix(FAULT_SENTINEL) {
                        fault = Some(
                            serde_json::from_str::<String>(payload)
                                .unwrap_or_else(|_| payload.to_string()),
                        );
                    } else if bare == EXIT_SENTINEL {
                        exited = true;
                    } else {
                        sink.stderr(line).await?;
                    }
                }
                else => break,
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Internal { msg: e.to_string() })?;
        tracing::debug!("Interpreter exited with {}", status);

        match fault {
            Some(trace) => Err(BackendError::Execution { msg: trace }),
            None if status.success() || exited => Ok(()),
            None => Err(BackendError::Execution {
                msg: describe_exit(status),
            }),
        }
    }
}

/// Why the interpreter stopped when it did not report an exception itself.
fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), signal_of(&status)) {
        (_, Some(signal)) => format!("The program was killed by signal {signal}"),
        (Some(code), None) => format!("The program exited with code {code}"),
        (None, None) => format!("The program stopped unexpectedly ({status})"),
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Removes and returns the longest valid UTF-8 prefix of `bytes`. Invalid
/// sequences are replaced; an incomplete trailing one stays for the next read.
fn take_utf8(bytes: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    };
    let text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
    bytes.drain(..valid);
    text
}
