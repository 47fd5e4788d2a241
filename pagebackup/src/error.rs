//! The error kinds a backup session can surface. Workers log failures at
//! WARNING and convert them into a per-worker result; the orchestrator turns
//! any worker failure into a session-level `ERROR` status.

use std::io;

use utils::lsn::Lsn;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("page error: {0}")]
    Page(String),

    #[error("database protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    WalWait(#[from] WalWaitError),

    #[error("interrupted")]
    Interrupted,
}

/// The WAL waiter distinguishes "segment never appeared" from "segment is
/// there but the LSN is not", preserving the debug signal.
#[derive(Debug, thiserror::Error)]
pub enum WalWaitError {
    #[error("switched WAL segment {segment} could not be archived in {timeout} seconds")]
    SegmentNotArchived { segment: String, timeout: u64 },

    #[error(
        "WAL segment {segment} was archived, but target LSN {lsn} could not be archived in {timeout} seconds"
    )]
    LsnNotReached {
        segment: String,
        lsn: Lsn,
        timeout: u64,
    },

    #[error("target LSN {lsn} could not be streamed in {timeout} seconds")]
    NotStreamed { lsn: Lsn, timeout: u64 },

    #[error("target LSN {lsn} could not be received by replica in {timeout} seconds")]
    NotReplayed { lsn: Lsn, timeout: u64 },
}

pub type Result<T> = std::result::Result<T, BackupError>;

// `postgres::Error` is a re-export of `tokio_postgres::Error`, so this
// covers both the blocking SQL connections and the replication stream.
impl From<postgres::Error> for BackupError {
    fn from(e: postgres::Error) -> Self {
        BackupError::Protocol(e.to_string())
    }
}

/// Attach a path-ish context to an io::Error, yielding the `Io` kind.
pub trait IoResultExt<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| BackupError::Io {
            context: context(),
            source,
        })
    }
}
