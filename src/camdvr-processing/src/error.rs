//! Recording error types

use std::path::PathBuf;
use thiserror::Error;

/// Failure to produce a segment on disk
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("cannot create destination {path:?}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start encoder for {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write to {path:?} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder exited with {status} for {path:?}: {stderr}")]
    Finish {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("invalid recording config: {0}")]
    InvalidConfig(String),
}

/// Failure while enforcing retention
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("cannot list {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot delete {path:?}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
