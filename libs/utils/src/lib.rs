//! `utils` is intended to be a place to put code that is shared
//! between the other crates in this repository.

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

// helper functions for crash-safe file and directory manipulation
pub mod crashsafe;

// small extensions over std::fs
pub mod fs_ext;

// common log initialisation routine
pub mod logging;
