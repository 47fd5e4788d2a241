//!
//! Physical, page-level incremental backups for a PostgreSQL cluster.
//!
//! The catalog layout, control files and page framing are described in the
//! module docs of [`catalog`] and [`datafile`]. The `pagebackup` binary in
//! `src/bin` is a thin front-end over [`backup::do_backup`] and
//! [`validate`].
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

pub mod backup;
pub mod catalog;
pub mod compress;
pub mod config;
pub mod datafile;
pub mod db;
pub mod error;
pub mod filelist;
pub mod fio;
pub mod pagemap;
pub mod stream;
pub mod validate;
pub mod walscan;
pub mod walwait;

/// Version written into every backup's control file. Restore-side quirks key
/// off this (see [`compress::page_may_be_compressed`]).
pub const PROGRAM_VERSION: &str = "2.1.0";

/// Parse a "x.y.z" version string into the number format used for
/// comparisons, e.g. "2.0.23" -> 20023.
pub fn parse_program_version(version: &str) -> u32 {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    major * 10000 + minor * 100 + patch
}

/// Set from a signal handler when the user asked us to stop. Long loops poll
/// this at natural points (page boundaries, retries, waits).
pub static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn install_signal_handlers() -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&INTERRUPTED))?;
    }
    Ok(())
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Return an `Interrupted` error if either the process-wide flag or the
/// session's orderly-shutdown flag is raised.
pub fn check_interrupt(thread_interrupted: &AtomicBool) -> error::Result<()> {
    if interrupted() || thread_interrupted.load(Ordering::Relaxed) {
        return Err(error::BackupError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_program_version() {
        assert_eq!(parse_program_version("2.0.23"), 20023);
        assert_eq!(parse_program_version("2.1.0"), 20100);
        assert_eq!(parse_program_version("10.3"), 100300);
        assert_eq!(parse_program_version(""), 0);
    }
}
