//! Request/progress/terminal operations over a [`Connection`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use netprobe_core::{OperationId, OperationKind};

use crate::connection::{Connection, Link};
use crate::operation::{OperationError, Outcome, ProgressSink};
use crate::protocol::{ClientFrame, DaemonEvent};

/// Issues operations on a borrowed connection. Cheap to create; any number of
/// clients may share one connection.
pub struct OperationClient<'c> {
    connection: &'c Connection,
}

impl<'c> OperationClient<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    /// Ask the daemon whether it holds the privileges raw scanning needs.
    pub async fn check_privileges(&self) -> Result<bool, OperationError> {
        let reply = self
            .connection
            .request(
                "check",
                |id| ClientFrame::CheckPrivileges { id },
                self.connection.request_timeout,
            )
            .await?;

        match reply {
            DaemonEvent::Privileges { privileged } => Ok(privileged),
            DaemonEvent::Failed { message } => Err(OperationError::DaemonError(message)),
            DaemonEvent::Rejected { message } => Err(OperationError::DaemonRejected(message)),
            other => Err(OperationError::DaemonError(format!(
                "unexpected reply to privilege check: {other:?}"
            ))),
        }
    }

    /// Run a discovery and wait for its outcome.
    pub async fn discover(
        &self,
        payload: &[u8],
        sink: impl ProgressSink + 'static,
    ) -> Outcome {
        self.start(OperationKind::Discover, payload, sink)
            .await?
            .wait()
            .await
    }

    /// Run a scan and wait for its outcome.
    pub async fn scan(&self, payload: &[u8], sink: impl ProgressSink + 'static) -> Outcome {
        self.start(OperationKind::Scan, payload, sink)
            .await?
            .wait()
            .await
    }

    /// Start an operation under a fresh id.
    pub async fn start(
        &self,
        kind: OperationKind,
        payload: &[u8],
        sink: impl ProgressSink + 'static,
    ) -> Result<OperationHandle, OperationError> {
        let id = self.connection.next_operation_id("op");
        self.start_with_id(id, kind, payload, sink).await
    }

    /// Start an operation under a caller-chosen id, which must not belong to
    /// another live operation on this connection.
    ///
    /// An error here means the operation never started: the sink is dropped
    /// without any callback.
    pub async fn start_with_id(
        &self,
        id: OperationId,
        kind: OperationKind,
        payload: &[u8],
        sink: impl ProgressSink + 'static,
    ) -> Result<OperationHandle, OperationError> {
        let frame = ClientFrame::start(kind, id.clone(), payload.to_vec()).ok_or_else(|| {
            OperationError::DaemonRejected(format!("{kind} is not a streaming operation"))
        })?;
        let link = self.connection.link()?;
        let done = link.router.register_stream(id.clone(), kind, Box::new(sink))?;

        if let Err(err) = link.send(&frame).await {
            link.router.abandon(&id);
            link.kill(OperationError::ConnectionLost);
            return Err(err);
        }
        link.router.mark_running(&id);
        tracing::debug!(operation_id = %id, kind = %kind, bytes = payload.len(), "operation started");

        Ok(OperationHandle {
            id,
            done,
            timeout: self.connection.operation_timeout,
            link,
        })
    }

    /// Request cancellation of a live operation.
    ///
    /// `true` only if the operation was live and the cancel frame was
    /// written. From then on its remaining progress is discarded; the
    /// terminal outcome is still delivered.
    pub async fn cancel(&self, id: &OperationId) -> bool {
        let Ok(link) = self.connection.link() else {
            return false;
        };
        if !link.router.mark_cancel_sent(id) {
            tracing::debug!(operation_id = %id, "cancel for unknown or finished operation ignored");
            return false;
        }
        match link.send(&ClientFrame::Cancel { id: id.clone() }).await {
            Ok(()) => {
                tracing::debug!(operation_id = %id, "cancel sent");
                true
            }
            Err(err) => {
                tracing::warn!(operation_id = %id, error = %err, "cancel could not be sent");
                link.kill(OperationError::ConnectionLost);
                false
            }
        }
    }
}

/// A started operation. Dropping it does not cancel the operation; its sink
/// keeps receiving progress until the terminal outcome.
pub struct OperationHandle {
    id: OperationId,
    done: oneshot::Receiver<Outcome>,
    timeout: Option<Duration>,
    link: Arc<Link>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OperationHandle {
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Wait for the terminal outcome.
    pub async fn wait(mut self) -> Outcome {
        let Some(limit) = self.timeout else {
            return self.done.await.unwrap_or(Err(OperationError::ConnectionLost));
        };

        let waited = tokio::time::timeout(limit, &mut self.done).await;
        match waited {
            Ok(outcome) => outcome.unwrap_or(Err(OperationError::ConnectionLost)),
            Err(_) => {
                if !self.link.router.terminate(&self.id, OperationError::Timeout) {
                    // The terminal frame won the race.
                    return self.done.await.unwrap_or(Err(OperationError::ConnectionLost));
                }
                tracing::warn!(operation_id = %self.id, ?limit, "operation timed out");
                if let Err(err) = self.link.send(&ClientFrame::Cancel { id: self.id.clone() }).await {
                    tracing::debug!(operation_id = %self.id, error = %err, "cancel after timeout not sent");
                }
                Err(OperationError::Timeout)
            }
        }
    }
}
