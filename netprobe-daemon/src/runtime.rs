use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};

use netprobe_core::{Config, OperationId, OperationKind};

use crate::engine::{EngineError, ScanEngine, SidecarEngine};
use crate::error::{io_err, DaemonError};
use crate::logging::init_tracing;
use crate::protocol::{decode_line, write_frame, ClientFrame, DaemonEvent, DaemonFrame};

const FRAME_QUEUE: usize = 256;
const PROGRESS_QUEUE: usize = 64;

/// Cancel signals of one client's live operations.
type LiveOperations = Arc<Mutex<HashMap<OperationId, watch::Sender<bool>>>>;

/// Start the daemon and block the current thread until it exits.
pub fn start_blocking(config: Config) -> Result<(), DaemonError> {
    init_tracing(config.log_format, "info");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let engine = SidecarEngine::from_config(&config);
    runtime.block_on(run(config, engine))
}

/// Bind the configured socket and serve until ctrl-c or SIGTERM.
pub async fn run<E: ScanEngine>(config: Config, engine: E) -> Result<(), DaemonError> {
    let socket = config.socket_path.clone();
    if let Some(parent) = socket.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket, config.socket_mode)?;
    tracing::info!(socket = %socket.display(), "helper daemon listening");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(name) => tracing::info!(signal = name, "shutting down helper daemon"),
                Err(err) => tracing::error!(error = %err, "signal handler failed, shutting down"),
            }
            let _ = shutdown.send(());
        })
    };

    let result = serve(listener, Arc::new(engine), shutdown_tx).await;
    signal_handle.abort();

    match fs::remove_file(&socket) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(socket = %socket.display(), error = %err, "could not remove socket"),
    }
    result
}

/// Accept clients until `shutdown` fires. Every client task observes the
/// same shutdown and drops its connection.
pub async fn serve<E: ScanEngine>(
    listener: UnixListener,
    engine: Arc<E>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err("daemon socket accept", e))?;
                let engine = Arc::clone(&engine);
                let client_shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, engine, client_shutdown).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_client<E: ScanEngine>(
    stream: UnixStream,
    engine: Arc<E>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (reader, writer) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::channel::<DaemonFrame>(FRAME_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, frames_rx));
    let live: LiveOperations = Arc::default();
    tracing::debug!("client connected");

    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(io_err("daemon socket read", err)),
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_line::<ClientFrame>(&line) {
            Ok(frame) => handle_frame(frame, &engine, &frames_tx, &live).await,
            Err(err) => match recover_id(&line) {
                Some(id) => {
                    let message = format!("invalid request: {err}");
                    let _ = frames_tx
                        .send(DaemonFrame::new(id, DaemonEvent::Rejected { message }))
                        .await;
                }
                None => tracing::warn!(error = %err, "dropping unparseable request"),
            },
        }
    };

    let orphaned = cancel_all(&live);
    if orphaned > 0 {
        tracing::info!(count = orphaned, "client went away, cancelling its operations");
    }
    writer_task.abort();
    tracing::debug!("client disconnected");
    result
}

async fn handle_frame<E: ScanEngine>(
    frame: ClientFrame,
    engine: &Arc<E>,
    frames: &mpsc::Sender<DaemonFrame>,
    live: &LiveOperations,
) {
    match frame {
        ClientFrame::Ping { id } => {
            let _ = frames.send(DaemonFrame::new(id, DaemonEvent::Pong)).await;
        }
        ClientFrame::CheckPrivileges { id } => {
            let engine = Arc::clone(engine);
            let frames = frames.clone();
            tokio::spawn(async move {
                let event = match engine.check_privileges().await {
                    Ok(privileged) => DaemonEvent::Privileges { privileged },
                    Err(err) => DaemonEvent::Failed {
                        message: err.to_string(),
                    },
                };
                let _ = frames.send(DaemonFrame::new(id, event)).await;
            });
        }
        ClientFrame::Discover { id, payload } => {
            start_operation(OperationKind::Discover, id, payload, engine, frames, live).await;
        }
        ClientFrame::Scan { id, payload } => {
            start_operation(OperationKind::Scan, id, payload, engine, frames, live).await;
        }
        ClientFrame::Cancel { id } => {
            let signalled = lock(live).get(&id).map(|cancel| cancel.send(true));
            match signalled {
                Some(_) => tracing::info!(operation_id = %id, "cancel requested"),
                None => tracing::debug!(operation_id = %id, "cancel for unknown operation ignored"),
            }
        }
    }
}

async fn start_operation<E: ScanEngine>(
    kind: OperationKind,
    id: OperationId,
    payload: Vec<u8>,
    engine: &Arc<E>,
    frames: &mpsc::Sender<DaemonFrame>,
    live: &LiveOperations,
) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let duplicate = {
        let mut operations = lock(live);
        if operations.contains_key(&id) {
            true
        } else {
            operations.insert(id.clone(), cancel_tx);
            false
        }
    };
    if duplicate {
        let message = format!("operation id {id} is already in flight");
        let _ = frames
            .send(DaemonFrame::new(id, DaemonEvent::Rejected { message }))
            .await;
        return;
    }

    tracing::info!(operation_id = %id, kind = %kind, bytes = payload.len(), "operation started");
    tokio::spawn(run_operation(
        Arc::clone(engine),
        kind,
        id,
        payload,
        frames.clone(),
        Arc::clone(live),
        cancel_rx,
    ));
}

async fn run_operation<E: ScanEngine>(
    engine: Arc<E>,
    kind: OperationKind,
    id: OperationId,
    payload: Vec<u8>,
    frames: mpsc::Sender<DaemonFrame>,
    live: LiveOperations,
    cancel: watch::Receiver<bool>,
) {
    let (progress_tx, mut progress_rx) = mpsc::channel::<Vec<u8>>(PROGRESS_QUEUE);
    let forwarder = {
        let frames = frames.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(data) = progress_rx.recv().await {
                let frame = DaemonFrame::new(id.clone(), DaemonEvent::Progress { data });
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    let cancel_requested = cancel.clone();
    let result = engine.run(kind, payload, progress_tx, cancel).await;
    // Progress must precede the terminal frame.
    let _ = forwarder.await;

    let cancelled = *cancel_requested.borrow();
    let event = match result {
        Ok(payload) => DaemonEvent::Completed { payload },
        Err(EngineError::Cancelled) => DaemonEvent::Cancelled,
        Err(EngineError::Failed(_)) if cancelled => DaemonEvent::Cancelled,
        Err(EngineError::Failed(message)) => DaemonEvent::Failed { message },
        Err(EngineError::Rejected(message)) => DaemonEvent::Rejected { message },
    };
    tracing::info!(operation_id = %id, kind = %kind, outcome = outcome_name(&event), "operation finished");

    lock(&live).remove(&id);
    let _ = frames.send(DaemonFrame::new(id, event)).await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<DaemonFrame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %err, "client write failed");
            break;
        }
    }
}

fn cancel_all(live: &LiveOperations) -> usize {
    let operations = lock(live);
    for cancel in operations.values() {
        let _ = cancel.send(true);
    }
    operations.len()
}

fn recover_id(line: &str) -> Option<OperationId> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(OperationId::from)
}

fn outcome_name(event: &DaemonEvent) -> &'static str {
    match event {
        DaemonEvent::Completed { .. } => "completed",
        DaemonEvent::Failed { .. } => "failed",
        DaemonEvent::Rejected { .. } => "rejected",
        DaemonEvent::Cancelled => "cancelled",
        DaemonEvent::Pong | DaemonEvent::Privileges { .. } | DaemonEvent::Progress { .. } => {
            "none"
        }
    }
}

fn lock(live: &LiveOperations) -> MutexGuard<'_, HashMap<OperationId, watch::Sender<bool>>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

async fn shutdown_signal() -> Result<&'static str, DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| DaemonError::Protocol(format!("SIGTERM handler failed: {e}")))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result
            .map(|()| "ctrl-c")
            .map_err(|e| DaemonError::Protocol(format!("ctrl-c handler failed: {e}"))),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Streams `payload` back byte by byte, then completes with it.
    struct Echo;

    impl ScanEngine for Echo {
        async fn check_privileges(&self) -> Result<bool, EngineError> {
            Ok(false)
        }

        async fn run(
            &self,
            _kind: OperationKind,
            payload: Vec<u8>,
            progress: mpsc::Sender<Vec<u8>>,
            _cancel: watch::Receiver<bool>,
        ) -> Result<Option<Vec<u8>>, EngineError> {
            for byte in &payload {
                let _ = progress.send(vec![*byte]).await;
            }
            Ok(Some(payload))
        }
    }

    async fn raw_client(socket: &Path) -> (BufReader<tokio::net::unix::OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(socket).await.expect("connect");
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn next_frame(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> DaemonFrame {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("frame within timeout")
            .expect("read frame");
        decode_line(&line).expect("decode frame")
    }

    #[tokio::test]
    async fn progress_precedes_terminal_and_bad_lines_are_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("netprobe.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(serve(listener, Arc::new(Echo), shutdown.clone()));

        let (mut reader, mut writer) = raw_client(&socket).await;
        writer
            .write_all(b"{\"type\":\"discover\",\"id\":\"op-1\",\"payload\":\"YWI=\"}\n")
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_frame(&mut reader).await.event);
        }
        assert_eq!(
            seen,
            vec![
                DaemonEvent::Progress { data: b"a".to_vec() },
                DaemonEvent::Progress { data: b"b".to_vec() },
                DaemonEvent::Completed {
                    payload: Some(b"ab".to_vec())
                },
            ]
        );

        writer
            .write_all(b"{\"type\":\"teleport\",\"id\":\"op-2\"}\n")
            .await
            .unwrap();
        let rejected = next_frame(&mut reader).await;
        assert_eq!(rejected.id, OperationId::from("op-2"));
        assert!(matches!(rejected.event, DaemonEvent::Rejected { .. }));

        let _ = shutdown.send(());
    }

    #[test]
    fn stale_socket_is_removed_but_live_one_is_kept() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        prepare_socket_for_bind(&stale).unwrap();
        assert!(!stale.exists());

        let live = dir.path().join("live.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&live).unwrap();
        assert!(matches!(
            prepare_socket_for_bind(&live),
            Err(DaemonError::Protocol(_))
        ));
    }

    #[test]
    fn socket_mode_comes_from_config() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sock");
        fs::write(&path, b"").unwrap();
        set_socket_permissions(&path, 0o660).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);
    }
}
