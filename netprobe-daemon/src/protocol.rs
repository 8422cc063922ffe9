//! Newline-delimited JSON frames exchanged over the daemon socket.
//!
//! Every frame carries the operation id it belongs to, so one connection can
//! multiplex any number of concurrent operations. Payload and progress bytes
//! are opaque to both sides and travel base64-encoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use netprobe_core::{OperationId, OperationKind};

use crate::error::{io_err, DaemonError};

/// Client → daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping {
        id: OperationId,
    },
    CheckPrivileges {
        id: OperationId,
    },
    Discover {
        id: OperationId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    Scan {
        id: OperationId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    Cancel {
        id: OperationId,
    },
}

impl ClientFrame {
    /// Frame that starts a streaming operation of `kind`.
    pub fn start(kind: OperationKind, id: OperationId, payload: Vec<u8>) -> Option<Self> {
        match kind {
            OperationKind::Discover => Some(ClientFrame::Discover { id, payload }),
            OperationKind::Scan => Some(ClientFrame::Scan { id, payload }),
            OperationKind::PrivilegeCheck => None,
        }
    }

    pub fn id(&self) -> &OperationId {
        match self {
            ClientFrame::Ping { id }
            | ClientFrame::CheckPrivileges { id }
            | ClientFrame::Discover { id, .. }
            | ClientFrame::Scan { id, .. }
            | ClientFrame::Cancel { id } => id,
        }
    }
}

/// Daemon → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonFrame {
    pub id: OperationId,
    #[serde(flatten)]
    pub event: DaemonEvent,
}

impl DaemonFrame {
    pub fn new(id: OperationId, event: DaemonEvent) -> Self {
        Self { id, event }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    Pong,
    Privileges {
        privileged: bool,
    },
    Progress {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Completed {
        #[serde(
            default,
            with = "base64_opt_bytes",
            skip_serializing_if = "Option::is_none"
        )]
        payload: Option<Vec<u8>>,
    },
    Failed {
        message: String,
    },
    Rejected {
        message: String,
    },
    Cancelled,
}

impl DaemonEvent {
    /// Whether the event ends its operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DaemonEvent::Completed { .. }
                | DaemonEvent::Failed { .. }
                | DaemonEvent::Rejected { .. }
                | DaemonEvent::Cancelled
        )
    }
}

/// Serialize one frame as a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<Vec<u8>, DaemonError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, DaemonError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(frame)?;
    writer
        .write_all(&line)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|encoded| STANDARD.decode(encoded.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
