use thiserror::Error;
use tokio::io;

pub type SyncResult<T> = core::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("push is disabled under the current sync policy")]
    PushDisabled,
    #[error("no active user session")]
    NoSession,
}
