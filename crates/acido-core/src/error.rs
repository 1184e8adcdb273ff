use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("shard upload failed: {0}")]
    ShardUpload(#[source] CloudError),
    #[error("network stack {name}: {source}")]
    NetworkStack {
        name: String,
        #[source]
        source: CloudError,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("bad pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

pub type Result<T> = core::result::Result<T, Error>;
