//! Subprocess transport session: one plugin process, one request/response
//! channel over its stdio, serialized calls with explicit deadlines.

use crate::protocol::{
    CodecError, Envelope, Handshake, PluginRequest, PluginResponse, method, MAGIC_COOKIE_KEY,
    MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Deadline for the best-effort shutdown request sent by [`PluginHost::stop`].
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from transport session operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn plugin process: {0}")]
    Spawn(std::io::Error),
    #[error("plugin process has no {stream} pipe")]
    MissingPipe { stream: &'static str },
    #[error("failed to write to plugin: {0}")]
    Write(std::io::Error),
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },
    #[error("protocol version mismatch: host speaks {host}, plugin speaks {plugin}")]
    ProtocolMismatch { host: u32, plugin: u32 },
    #[error("{0}")]
    Codec(#[from] CodecError),
    #[error("request/response id mismatch: sent {sent}, received {received}")]
    IdMismatch { sent: u64, received: u64 },
    #[error("plugin did not respond within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("plugin process terminated")]
    Terminated,
    #[error("plugin session is not started")]
    NotStarted,
}

impl HostError {
    /// True for failures of the process boundary itself, as opposed to
    /// malformed traffic or handshake refusal.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_)
                | Self::MissingPipe { .. }
                | Self::Write(_)
                | Self::DeadlineExceeded(_)
                | Self::Terminated
                | Self::NotStarted
        )
    }

    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRejected { .. } | Self::ProtocolMismatch { .. }
        )
    }
}

/// How to launch one plugin subprocess.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the plugin executable.
    pub executable: PathBuf,
    /// Arguments to pass to the plugin.
    pub args: Vec<String>,
    /// Working directory for the plugin process.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables; the trust cookie is always added.
    pub env: Vec<(String, String)>,
    /// Deadline applied to every call on this session, handshake included.
    pub call_timeout: Duration,
}

impl LaunchConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// The write half plus the response channel; held together under one lock
/// so a request/response exchange is atomic and calls on a session are
/// serialized.
struct SessionIo {
    stdin: ChildStdin,
    lines: Receiver<String>,
}

/// Owns one plugin subprocess and one bidirectional request/response
/// connection to it.
///
/// The session validates the handshake before any call, serializes
/// in-flight calls, bounds every wait with a deadline, and forwards the
/// plugin's stderr into the host's tracing stream as a diagnostics
/// side-channel. A subprocess that exits mid-call resolves the call with
/// [`HostError::Terminated`]; one that wedges resolves it with
/// [`HostError::DeadlineExceeded`]. Neither hangs the caller.
pub struct PluginHost {
    config: LaunchConfig,
    child: Mutex<Option<Child>>,
    io: Mutex<Option<SessionIo>>,
    request_id: AtomicU64,
}

impl PluginHost {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            io: Mutex::new(None),
            request_id: AtomicU64::new(1),
        }
    }

    /// The configured per-call deadline, for stubs that thread it through
    /// their calls.
    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Spawn the subprocess and validate its handshake.
    ///
    /// A cookie or protocol version mismatch tears the subprocess down and
    /// is fatal to this plugin instance; it is never retried here.
    pub fn start(&self) -> Result<(), HostError> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(HostError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or(HostError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(HostError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(HostError::MissingPipe { stream: "stderr" })?;

        let plugin_name = self
            .config
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.executable.display().to_string());

        // Diagnostics side-channel: plugin stderr lines become host trace
        // events tagged with the plugin name.
        let stderr_name = plugin_name.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => tracing::debug!(plugin = %stderr_name, "{line}"),
                    Err(_) => break,
                }
            }
        });

        let (tx, rx) = std::sync::mpsc::channel::<String>();
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        *self.child.lock().unwrap() = Some(child);
        *self.io.lock().unwrap() = Some(SessionIo { stdin, lines: rx });

        if let Err(err) = self.await_handshake() {
            self.teardown();
            return Err(err);
        }

        tracing::info!(plugin = %plugin_name, "plugin session established");
        Ok(())
    }

    fn await_handshake(&self) -> Result<(), HostError> {
        let mut io_guard = self.io.lock().unwrap();
        let io = io_guard.as_mut().ok_or(HostError::NotStarted)?;
        let line = recv_line(&io.lines, self.config.call_timeout)?;

        let handshake: Handshake =
            serde_json::from_str(&line).map_err(|_| HostError::HandshakeRejected {
                reason: "first line from plugin is not a handshake".to_owned(),
            })?;

        if handshake.magic_cookie != MAGIC_COOKIE_VALUE {
            return Err(HostError::HandshakeRejected {
                reason: "magic cookie mismatch".to_owned(),
            });
        }
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(HostError::ProtocolMismatch {
                host: PROTOCOL_VERSION,
                plugin: handshake.protocol_version,
            });
        }
        Ok(())
    }

    /// Send one request and wait for its response, at most `deadline`.
    ///
    /// Calls on a session are serialized: the session lock is held across
    /// the whole exchange.
    pub fn call(&self, method: &str, args: Envelope, deadline: Duration) -> Result<Envelope, HostError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = PluginRequest {
            id,
            method: method.to_owned(),
            args,
        };
        let line = serde_json::to_string(&request).map_err(CodecError::Encode)?;

        let mut io_guard = self.io.lock().unwrap();
        let io = io_guard.as_mut().ok_or(HostError::NotStarted)?;

        writeln!(io.stdin, "{line}").map_err(HostError::Write)?;
        io.stdin.flush().map_err(HostError::Write)?;

        let response_line = recv_line(&io.lines, deadline)?;
        let response: PluginResponse =
            serde_json::from_str(&response_line).map_err(CodecError::Decode)?;

        if response.id != id {
            return Err(HostError::IdMismatch {
                sent: id,
                received: response.id,
            });
        }

        Ok(response.result)
    }

    /// Ask the plugin to exit, then make sure it does.
    pub fn stop(&self) {
        let shutdown_sent = {
            let io_present = self.io.lock().unwrap().is_some();
            io_present
                && self
                    .call(method::SHUTDOWN, Envelope::empty(), SHUTDOWN_TIMEOUT)
                    .is_ok()
        };
        if !shutdown_sent {
            tracing::debug!("plugin did not acknowledge shutdown; killing");
        }
        self.teardown();
    }

    /// Check if the plugin process is still running.
    pub fn is_running(&self) -> bool {
        self.child
            .lock()
            .unwrap()
            .as_mut()
            .map(|c| c.try_wait().ok().flatten().is_none())
            .unwrap_or(false)
    }

    fn teardown(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *self.io.lock().unwrap() = None;
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn recv_line(lines: &Receiver<String>, deadline: Duration) -> Result<String, HostError> {
    match lines.recv_timeout(deadline) {
        Ok(line) => Ok(line),
        Err(RecvTimeoutError::Timeout) => Err(HostError::DeadlineExceeded(deadline)),
        Err(RecvTimeoutError::Disconnected) => Err(HostError::Terminated),
    }
}
