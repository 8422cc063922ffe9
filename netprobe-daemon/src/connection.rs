//! The client's single, multiplexed connection to the helper daemon.
//!
//! Lifecycle is explicit: construct a [`Connection`], `connect`, hand it to an
//! [`OperationClient`](crate::client::OperationClient) by reference, and
//! `disconnect` (or drop) when done. A background reader task owns the read
//! half of the socket and routes every frame to its operation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use netprobe_core::{Config, OperationId};

use crate::error::{io_err, DaemonError};
use crate::operation::{OperationError, Router};
use crate::protocol::{decode_line, write_frame, ClientFrame, DaemonEvent, DaemonFrame};

pub struct Connection {
    socket_path: PathBuf,
    connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    ping_timeout: Duration,
    pub(crate) operation_timeout: Option<Duration>,
    link: Mutex<Option<Arc<Link>>>,
    next_id: AtomicU64,
}

impl Connection {
    /// A disconnected connection to `socket_path` with default timeouts.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let config = Config {
            socket_path: socket_path.into(),
            ..Config::default()
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            ping_timeout: config.ping_timeout(),
            operation_timeout: config.operation_timeout(),
            link: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open the socket and start the reader task. No-op while a live link
    /// exists; a dead one is replaced.
    pub async fn connect(&self) -> Result<(), DaemonError> {
        if self.is_connected() {
            return Ok(());
        }

        let socket = self.socket_path.clone();
        let stream =
            match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&socket)).await {
                Err(_) => return Err(DaemonError::ConnectTimeout { socket }),
                Ok(Err(err))
                    if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) =>
                {
                    return Err(DaemonError::DaemonNotRunning { socket })
                }
                Ok(Err(err)) => return Err(io_err(socket, err)),
                Ok(Ok(stream)) => stream,
            };

        let link = Arc::new(Link::open(stream));
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| current.is_alive()) {
            // Lost a race with a concurrent connect; keep the winner.
            link.kill(OperationError::NotConnected);
            return Ok(());
        }
        *slot = Some(link);
        tracing::info!(socket = %self.socket_path.display(), "connected to helper daemon");
        Ok(())
    }

    /// Tear down the link. Every in-flight operation ends with
    /// [`OperationError::NotConnected`]. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(link) = self.slot().take() {
            link.kill(OperationError::NotConnected);
            tracing::info!(socket = %self.socket_path.display(), "disconnected from helper daemon");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot().as_ref().is_some_and(|link| link.is_alive())
    }

    /// `true` iff the daemon answered within the ping timeout.
    pub async fn ping(&self) -> bool {
        match self
            .request("ping", |id| ClientFrame::Ping { id }, self.ping_timeout)
            .await
        {
            Ok(DaemonEvent::Pong) => true,
            Ok(other) => {
                tracing::warn!(reply = ?other, "unexpected reply to ping");
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "ping failed");
                false
            }
        }
    }

    pub(crate) fn next_operation_id(&self, prefix: &str) -> OperationId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        OperationId::from(format!("{prefix}-{n}"))
    }

    pub(crate) fn link(&self) -> Result<Arc<Link>, OperationError> {
        match self.slot().as_ref() {
            Some(link) if link.is_alive() => Ok(Arc::clone(link)),
            _ => Err(OperationError::NotConnected),
        }
    }

    /// One request, one reply, bounded by `limit`.
    pub(crate) async fn request(
        &self,
        prefix: &str,
        frame: impl FnOnce(OperationId) -> ClientFrame,
        limit: Duration,
    ) -> Result<DaemonEvent, OperationError> {
        let link = self.link()?;
        let id = self.next_operation_id(prefix);
        let reply = link.router.register_reply(id.clone())?;

        if let Err(err) = link.send(&frame(id.clone())).await {
            link.router.abandon(&id);
            link.kill(OperationError::ConnectionLost);
            return Err(err);
        }

        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OperationError::ConnectionLost),
            Err(_) => {
                link.router.terminate(&id, OperationError::Timeout);
                Err(OperationError::Timeout)
            }
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Link>>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One open socket: the shared write half, the router, and the reader task.
pub(crate) struct Link {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pub(crate) router: Arc<Router>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn open(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let router = Arc::new(Router::default());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&router),
            Arc::clone(&alive),
        ));
        Self {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            router,
            alive,
            reader,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Write one frame. Writers from every operation serialize here.
    pub(crate) async fn send(&self, frame: &ClientFrame) -> Result<(), OperationError> {
        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            writer.take();
            return Err(OperationError::NotConnected);
        }
        let Some(half) = writer.as_mut() else {
            return Err(OperationError::NotConnected);
        };
        write_frame(half, frame).await.map_err(|err| {
            tracing::warn!(operation_id = %frame.id(), error = %err, "writing to helper daemon failed");
            OperationError::ConnectionLost
        })
    }

    /// Mark the link dead and end every live operation with `error`.
    pub(crate) fn kill(&self, error: OperationError) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.router.fail_all(error);
    }
}

async fn read_loop(read_half: OwnedReadHalf, router: Arc<Router>, alive: Arc<AtomicBool>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<DaemonFrame>(&line) {
                    Ok(frame) => router.dispatch(frame),
                    Err(err) => tracing::warn!(error = %err, "skipping malformed frame from helper daemon"),
                }
            }
            Ok(None) => {
                tracing::info!("helper daemon closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "reading from helper daemon failed");
                break;
            }
        }
    }

    if alive.swap(false, Ordering::SeqCst) {
        router.fail_all(OperationError::ConnectionLost);
    }
}
