use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("`{0}` is not a valid HH:MM time")]
    InvalidTime(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access store file `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode stored value `{key}`")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a delivery adapter. A missing id on cancel is not one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery api unavailable: {0}")]
pub struct DeliveryError(pub String);

/// Failure reported by the remote feed or the appointment status lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote source failed: {0}")]
pub struct FeedError(pub String);

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("appointment `{key}` at {at} has already elapsed")]
    PastEvent { key: String, at: DateTime<Utc> },
    #[error("delivery api rejected reminder `{key}`")]
    DeliveryUnavailable {
        key: String,
        #[source]
        source: DeliveryError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{source_name} unreachable while reconciling `{user_id}`: {reason}")]
    SourceUnreachable {
        source_name: &'static str,
        user_id: String,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
