//! Child process ownership and line-framed stdio channels.
//!
//! `Transport` knows nothing about the protocol: it spawns one child, hands
//! out a `FrameWriter` for the child's stdin and a `FrameReader` for its
//! stdout, and stops the process. The child's stderr is drained by a
//! background task into `tracing`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Environment variable extended with an extra search-path entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    /// Variable name, e.g. `PYTHONPATH`.
    pub var: String,
    /// Entry placed in front of any inherited value.
    pub entry: PathBuf,
}

/// Everything needed to launch the child process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra variables set on top of the inherited environment (replace semantics).
    pub env: Vec<(String, String)>,
    /// Search-path style variable merged with the inherited value (prepend semantics).
    pub search_path: Option<SearchPath>,
    /// Working directory for the child; inherits ours when `None`.
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Prepend `entry` to an inherited search-path value.
///
/// The inherited value is preserved after the platform's path-list separator.
/// Fails if `entry` itself contains the separator.
pub fn merge_search_path(existing: Option<OsString>, entry: &Path) -> Result<OsString> {
    let mut parts: Vec<PathBuf> = vec![entry.to_path_buf()];
    if let Some(existing) = existing.filter(|v| !v.is_empty()) {
        parts.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(parts).map_err(|e| BridgeError::Spawn {
        command: entry.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

/// Reads newline-terminated frames from the child's output stream.
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
    line: String,
}

impl FrameReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: BufReader::new(Box::new(reader)),
            line: String::new(),
        }
    }

    /// Block until one full frame is available.
    ///
    /// Returns `Ok(None)` once the stream is closed. Blank lines are skipped
    /// and the trailing record separator is stripped.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            self.line.clear();
            let n = self
                .inner
                .read_line(&mut self.line)
                .await
                .map_err(|e| BridgeError::Transport(format!("read from child failed: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            let frame = self.line.trim_end_matches(['\n', '\r']);
            if frame.trim().is_empty() {
                continue;
            }
            return Ok(Some(frame.to_string()));
        }
    }
}

/// Writes newline-terminated frames to the child's input stream.
pub struct FrameWriter {
    inner: Option<BufWriter<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Some(BufWriter::new(Box::new(writer))),
        }
    }

    /// Write one frame followed by `\n` and flush.
    pub async fn write_line(&mut self, frame: &[u8]) -> Result<()> {
        if frame.contains(&b'\n') {
            return Err(BridgeError::Protocol(
                "frame contains an embedded record separator".to_string(),
            ));
        }
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("input stream is closed".to_string()))?;

        let result = async {
            writer.write_all(frame).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.inner = None;
            BridgeError::Transport(format!("write to child failed: {e}"))
        })
    }

    /// Flush and close the stream so the child sees EOF. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Drop the stream without flushing. Used when a frame may have been
    /// left half written; the child sees EOF once the handle is gone.
    pub fn discard(&mut self) {
        self.inner = None;
    }
}

/// Handle on the spawned child process.
pub struct ChildProcess {
    child: Option<Child>,
    stderr_task: Option<JoinHandle<()>>,
    command: String,
}

impl ChildProcess {
    /// A handle with no process behind it, used for in-memory streams.
    pub fn detached() -> Self {
        Self {
            child: None,
            stderr_task: None,
            command: String::from("<in-memory>"),
        }
    }

    /// Wait up to `timeout` for the child to exit, then force-terminate it.
    ///
    /// The caller is expected to have closed the input stream first so a
    /// well-behaved child can exit on EOF. Idempotent.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(command = %self.command, %status, "tool server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %self.command, error = %e, "waiting for tool server failed");
                let _ = child.kill().await;
            }
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    timeout_ms = timeout.as_millis() as u64,
                    "tool server did not exit in time, killing it"
                );
                let _ = child.kill().await;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// One child process plus its framed stdio pair.
pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
    process: ChildProcess,
}

impl Transport {
    /// Spawn the child described by `spec` with piped stdio.
    pub fn start(spec: &LaunchSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(search_path) = &spec.search_path {
            let existing = spec
                .env
                .iter()
                .rev()
                .find(|(key, _)| *key == search_path.var)
                .map(|(_, value)| OsString::from(value))
                .or_else(|| std::env::var_os(&search_path.var));
            let merged = merge_search_path(existing, &search_path.entry)?;
            cmd.env(&search_path.var, merged);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let command = spec.display();
        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            command: command.clone(),
            source,
        })?;

        let missing = |stream: &str| BridgeError::Spawn {
            command: command.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("child {stream} was not captured"),
            ),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "toolbridge::child", "{line}");
            }
        });

        tracing::info!(command = %command, pid = ?child.id(), "tool server spawned");

        Ok(Self {
            reader: FrameReader::new(stdout),
            writer: FrameWriter::new(stdin),
            process: ChildProcess {
                child: Some(child),
                stderr_task: Some(stderr_task),
                command,
            },
        })
    }

    /// Build a transport over arbitrary streams with no process attached.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            process: ChildProcess::detached(),
        }
    }

    pub async fn write_line(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_line(frame).await
    }

    pub async fn read_line(&mut self) -> Result<Option<String>> {
        self.reader.read_line().await
    }

    /// Close the input stream, wait up to `timeout`, then force-terminate. Idempotent.
    pub async fn stop(&mut self, timeout: Duration) {
        self.writer.close().await;
        self.process.stop(timeout).await;
    }

    /// Split into the independently owned reader, writer and process handle.
    pub fn into_parts(self) -> (FrameReader, FrameWriter, ChildProcess) {
        (self.reader, self.writer, self.process)
    }
}
