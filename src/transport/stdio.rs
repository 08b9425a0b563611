//! Subprocess transport: newline-delimited JSON over a child's stdin/stdout
//!
//! The server's stderr is drained on a separate task and logged under the
//! `mcplink::stderr` target; it is never parsed as protocol data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::wrappers::LinesStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::shared::{TransportCore, TRANSIENT_ERROR_BACKOFF};
use super::{NotificationCallback, RequestCallback, ResponseSink, Transport};
use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};

/// Longest line accepted from the server
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Lines queued for the stdin writer
const OUTGOING_CAPACITY: usize = 100;

/// Stdio transport for MCP servers run as child processes
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    inner: Arc<StdioInner>,
}

struct StdioInner {
    core: TransportCore,
    conn: RwLock<Option<StdioConnection>>,
    generation: AtomicU64,
    shutdown_grace: Duration,
    display: String,
}

struct StdioConnection {
    generation: u64,
    child: Child,
    outgoing: mpsc::Sender<OutgoingLine>,
    cancel: CancellationToken,
}

/// One line for the child's stdin and the slot its write result goes to
struct OutgoingLine {
    line: String,
    written: oneshot::Sender<Result<(), Error>>,
}

impl StdioTransport {
    /// Describe the server process; nothing is spawned until `connect`
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let display = if args.is_empty() {
            command.clone()
        } else {
            format!("{} {}", command, args.join(" "))
        };

        Self {
            command,
            args,
            env: HashMap::new(),
            cwd: None,
            inner: Arc::new(StdioInner {
                core: TransportCore::new("stdio"),
                conn: RwLock::new(None),
                generation: AtomicU64::new(0),
                shutdown_grace: Duration::from_secs(2),
                display,
            }),
        }
    }

    /// Set an environment variable for the child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the child's working directory
    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// How long `close` waits for the child to exit after its stdin is
    /// closed before killing it. Must be set before connecting.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.shutdown_grace = grace;
        }
        self
    }

    /// The command line, for diagnostics
    pub fn command_line(&self) -> &str {
        &self.inner.display
    }

    /// OS process id of the running server
    pub async fn child_id(&self) -> Option<u32> {
        self.inner.conn.read().await.as_ref().and_then(|c| c.child.id())
    }

    /// Queue one line for the writer task and wait until it is on the pipe.
    /// The connection lock is only held long enough to clone the queue.
    async fn write_message(&self, message: &JSONRPCMessage) -> Result<(), Error> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let outgoing = self
            .inner
            .conn
            .read()
            .await
            .as_ref()
            .map(|c| c.outgoing.clone())
            .ok_or(Error::NotConnected)?;

        let (written, result) = oneshot::channel();
        outgoing
            .send(OutgoingLine { line, written })
            .await
            .map_err(|_| Error::ConnectionClosed("server stdin writer stopped".to_string()))?;
        result.await.map_err(|_| {
            Error::ConnectionClosed("connection closed before the message was written".to_string())
        })?
    }
}

impl StdioInner {
    /// Release the process regardless of who noticed the connection ending.
    /// Safe to call from the receive loop and from `close` concurrently.
    ///
    /// With `Some(generation)` only that connection is torn down, so a
    /// reader outliving its connection leaves a newer one alone.
    async fn teardown(&self, reason: &str, generation: Option<u64>) -> Result<(), Error> {
        let conn = {
            let mut guard = self.conn.write().await;
            if let Some(generation) = generation {
                match guard.as_ref() {
                    Some(current) if current.generation == generation => {}
                    Some(_) => {
                        debug!("Stale reader for `{}` leaves the new connection alone", self.display);
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
            guard.take()
        };
        self.core.mark_disconnected();
        self.core.fail_pending(reason);

        let Some(conn) = conn else {
            return Ok(());
        };
        // Stops the writer, which closes stdin: the polite way to ask a
        // stdio server to exit.
        conn.cancel.cancel();
        let StdioConnection { mut child, .. } = conn;

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("MCP server `{}` exited with {}", self.display, status);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::IoError(format!("Failed to reap server process: {}", e))),
            Err(_) => {
                warn!(
                    "MCP server `{}` did not exit within {:?}, killing it",
                    self.display, self.shutdown_grace
                );
                child
                    .kill()
                    .await
                    .map_err(|e| Error::IoError(format!("Failed to kill server process: {}", e)))
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<(), Error> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::TransportError(format!("Failed to write to server stdin: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| Error::TransportError(format!("Failed to flush server stdin: {}", e)))
}

/// Sole owner of the child's stdin. Lines are written whole even if the
/// caller that queued one stops waiting; cancelling drops stdin.
async fn write_stdin(
    mut stdin: ChildStdin,
    mut outgoing: mpsc::Receiver<OutgoingLine>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some(OutgoingLine { line, written }) = next else {
            break;
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = write_line(&mut stdin, &line) => result,
        };
        let _ = written.send(result);
    }
}

async fn read_stdout(
    inner: Arc<StdioInner>,
    stdout: ChildStdout,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => inner.core.route_text(&line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("MCP server `{}` sent an oversized line, skipping it", inner.display);
                tokio::time::sleep(TRANSIENT_ERROR_BACKOFF).await;
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::Interrupted => {
                tokio::time::sleep(TRANSIENT_ERROR_BACKOFF).await;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                error!("Failed to read from MCP server `{}`: {}", inner.display, e);
                break format!("server stdout failed: {}", e);
            }
            None => {
                info!("MCP server `{}` closed its stdout", inner.display);
                break "server closed stdout".to_string();
            }
        }
    };

    if let Err(e) = inner.teardown(&reason, Some(generation)).await {
        warn!("Error while tearing down `{}`: {}", inner.display, e);
    }
}

async fn drain_stderr(display: String, stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = LinesStream::new(BufReader::new(stderr).lines());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => info!(target: "mcplink::stderr", "[{}] {}", display, line),
            Some(Err(e)) => {
                debug!("Stopped reading stderr of `{}`: {}", display, e);
                break;
            }
            None => break,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, _timeout: Duration) -> Result<(), Error> {
        let mut guard = self.inner.conn.write().await;
        if guard.is_some() || self.inner.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::TransportError(format!("Failed to spawn `{}`: {}", self.inner.display, e))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(Error::InternalError("Child process pipes unavailable".to_string()));
        };

        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        self.inner.core.mark_connected();

        tokio::spawn(write_stdin(stdin, outgoing_rx, cancel.clone()));
        tokio::spawn(read_stdout(
            self.inner.clone(),
            stdout,
            generation,
            cancel.clone(),
        ));
        tokio::spawn(drain_stderr(
            self.inner.display.clone(),
            stderr,
            cancel.clone(),
        ));

        info!("Spawned MCP server `{}` (pid {:?})", self.inner.display, child.id());
        *guard = Some(StdioConnection {
            generation,
            child,
            outgoing,
            cancel,
        });

        Ok(())
    }

    async fn send_request(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
    ) -> Result<JSONRPCMessage, Error> {
        self.inner
            .core
            .round_trip(request, timeout, |message| async move {
                self.write_message(&message).await
            })
            .await
    }

    async fn send_request_async(
        &self,
        request: JSONRPCRequest,
        sink: ResponseSink,
    ) -> Result<(), Error> {
        self.inner
            .core
            .register_then_write(request, sink, |message| async move {
                self.write_message(&message).await
            })
            .await
    }

    async fn send_message(&self, message: JSONRPCMessage) -> Result<(), Error> {
        self.inner.core.ensure_connected()?;
        self.write_message(&message).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.teardown("transport closed", None).await
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn set_notification_handler(&self, handler: NotificationCallback) {
        self.inner.core.set_notification_handler(handler);
    }

    fn set_request_handler(&self, handler: RequestCallback) {
        self.inner.core.set_request_handler(handler);
    }

    fn drain_notifications(&self) -> Vec<JSONRPCNotification> {
        self.inner.core.drain_notifications()
    }
}
