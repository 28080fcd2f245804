use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::record::RecordKind;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("list unsynced {kind}: {reason}")]
    Retrieval { kind: RecordKind, reason: String },

    #[error("update {kind} {id} syncing_at: {reason}")]
    Update {
        kind: RecordKind,
        id: Uuid,
        reason: String,
    },

    #[error("sync {kind} {id} status: {reason}")]
    Sync {
        kind: RecordKind,
        id: Uuid,
        reason: String,
    },

    #[error("dispatch did not finish within {0:?}")]
    BatchTimeout(Duration),

    #[error("selection and claim did not finish within {0:?}")]
    SelectTimeout(Duration),

    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: Uuid },

    #[error("record store error: {0}")]
    Store(String),

    #[error("remote status source error: {0}")]
    Remote(String),

    #[error("sync task cancelled")]
    Cancelled,

    #[error("sync task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
