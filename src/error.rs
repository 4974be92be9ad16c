//! Typed errors returned by the public API.
//!
//! `anyhow` stays at the CLI boundary (see `main.rs`); every library-facing
//! function here returns this enum so callers can match on failure kind
//! instead of parsing error strings.

use crate::job::JobId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no job with id {0}")]
    NotFound(JobId),

    #[error("failed to spawn job: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to attach job {job} to memory cgroup: {source}")]
    CgroupFailed {
        job: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot stop job {job}: {reason}")]
    StopFailed { job: JobId, reason: String },

    #[error("stream is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
