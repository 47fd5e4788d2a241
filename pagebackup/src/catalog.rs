//! The backup catalog: an on-disk, flat-file registry of backups.
//!
//! Layout under `<backup-path>/backups/<instance>/<backup-id>/`:
//!
//! ```text
//! backup.control           key = value metadata, crash-safe rewrite
//! backup_content.control   file list, one JSON object per line
//! backup.pid               lockfile while some process owns the backup
//! database/                page-level copies of the data files
//! external_directories/    externaldir1, externaldir2, ...
//! ```
//!
//! The directory name is the backup id: the session's start time encoded in
//! base 36. The control file's `start-time` is authoritative when the two
//! disagree.

use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use tracing::{error, warn};
use utils::lsn::Lsn;

use crate::compress::CompressAlg;
use crate::error::{BackupError, Result};

pub const BACKUP_CONTROL_FILE: &str = "backup.control";
pub const DATABASE_FILE_LIST: &str = "backup_content.control";
pub const BACKUP_LOCK_FILE: &str = "backup.pid";
pub const DATABASE_DIR: &str = "database";
pub const EXTERNAL_DIR: &str = "external_directories";
pub const PG_XLOG_DIR: &str = "pg_wal";

pub const DIR_PERMISSION: u32 = 0o700;
pub const FILE_PERMISSION: u32 = 0o600;

/// Retry ceiling for lockfile creation, so that an unwritable catalog
/// directory cannot loop forever.
const LOCK_ATTEMPTS: u32 = 100;

/// A backup's identifier: its start time, rendered in base 36.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(pub i64);

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base36enc(self.0))
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupId({self})")
    }
}

impl FromStr for BackupId {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<BackupId> {
        base36dec(s)
            .map(BackupId)
            .ok_or_else(|| BackupError::Catalog(format!("invalid backup ID \"{s}\"")))
    }
}

pub fn base36enc(mut value: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

pub fn base36dec(s: &str) -> Option<i64> {
    i64::from_str_radix(s, 36).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl BackupMode {
    pub fn is_incremental(self) -> bool {
        self != BackupMode::Full
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
            BackupMode::Ptrack => "PTRACK",
            BackupMode::Delta => "DELTA",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<BackupMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupMode::Full),
            "page" => Ok(BackupMode::Page),
            "ptrack" => Ok(BackupMode::Ptrack),
            "delta" => Ok(BackupMode::Delta),
            other => Err(BackupError::Config(format!(
                "invalid backup-mode \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    /// No or corrupt control file
    Invalid,
    Ok,
    Error,
    Running,
    Merging,
    Deleting,
    Deleted,
    Done,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    /// OK and DONE backups can serve as incremental parents.
    pub fn is_complete(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<BackupStatus> {
        match s.trim() {
            "OK" => Ok(BackupStatus::Ok),
            "ERROR" => Ok(BackupStatus::Error),
            "RUNNING" => Ok(BackupStatus::Running),
            "MERGING" => Ok(BackupStatus::Merging),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "DONE" => Ok(BackupStatus::Done),
            "ORPHAN" => Ok(BackupStatus::Orphan),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            other => Err(BackupError::Catalog(format!("invalid STATUS \"{other}\""))),
        }
    }
}

/// Everything `backup.control` records about one backup, plus the in-memory
/// parent link resolved after enumeration.
#[derive(Debug, Clone)]
pub struct Backup {
    pub backup_mode: BackupMode,
    pub status: BackupStatus,
    pub tli: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,

    /// Unix seconds; doubles as the backup id.
    pub start_time: i64,
    pub merge_time: Option<i64>,
    pub end_time: Option<i64>,
    pub recovery_xid: u64,
    pub recovery_time: Option<i64>,

    /// `None` renders as "invalid" - the key is omitted from the control file.
    pub data_bytes: Option<i64>,
    pub wal_bytes: Option<i64>,

    pub compress_alg: CompressAlg,
    pub compress_level: u32,

    pub block_size: u32,
    pub wal_block_size: u32,
    pub checksum_version: u32,

    pub stream: bool,
    pub from_replica: bool,

    pub parent_backup: Option<BackupId>,
    /// Index of the parent in the enumeration-sorted list; resolved by
    /// [`get_backup_list`], never persisted.
    pub parent_index: Option<usize>,

    pub primary_conninfo: Option<String>,
    pub program_version: String,
    pub server_version: String,
    pub external_dir_str: Option<String>,
}

impl Backup {
    pub fn new(mode: BackupMode, start_time: i64) -> Backup {
        Backup {
            backup_mode: mode,
            status: BackupStatus::Invalid,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time,
            merge_time: None,
            end_time: None,
            recovery_xid: 0,
            recovery_time: None,
            data_bytes: None,
            wal_bytes: None,
            compress_alg: CompressAlg::None,
            compress_level: 1,
            block_size: postgres_ffi::BLCKSZ as u32,
            wal_block_size: postgres_ffi::XLOG_BLCKSZ as u32,
            checksum_version: 0,
            stream: false,
            from_replica: false,
            parent_backup: None,
            parent_index: None,
            primary_conninfo: None,
            program_version: String::new(),
            server_version: String::new(),
            external_dir_str: None,
        }
    }

    pub fn id(&self) -> BackupId {
        BackupId(self.start_time)
    }
}

/// Render a unix timestamp the way the control files spell timestamps:
/// ISO-8601 in local time with a numeric zone offset.
pub fn time2iso(ts: i64) -> String {
    let dt = Local.timestamp_opt(ts, 0).single().unwrap_or_else(|| {
        Local
            .timestamp_opt(0, 0)
            .single()
            .expect("epoch is representable")
    });
    dt.format("%Y-%m-%d %H:%M:%S%z").to_string()
}

/// Total parser for the timestamp spellings we meet: our own control files
/// ("+0300"), server results ("+03"), and zoneless strings (taken as local).
pub fn parse_iso_time(s: &str) -> Option<i64> {
    let s = s.trim().trim_matches('\'');
    for format in ["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.timestamp());
        }
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        if let Some(dt) = Local.from_local_datetime(&naive).single() {
            return Some(dt.timestamp());
        }
    }
    None
}

/// `<instance>/<backup-id>` and friends.
pub fn backup_path(instance_path: &Utf8Path, id: BackupId) -> Utf8PathBuf {
    instance_path.join(id.to_string())
}

pub fn backup_subpath(instance_path: &Utf8Path, id: BackupId, subdir: &str) -> Utf8PathBuf {
    backup_path(instance_path, id).join(subdir)
}

/// Serialize the control file content, in the original section layout.
pub fn serialize_control(backup: &Backup) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    writeln!(out, "#Configuration").unwrap();
    writeln!(out, "backup-mode = {}", backup.backup_mode).unwrap();
    writeln!(out, "stream = {}", backup.stream).unwrap();
    writeln!(out, "compress-alg = {}", backup.compress_alg).unwrap();
    writeln!(out, "compress-level = {}", backup.compress_level).unwrap();
    writeln!(out, "from-replica = {}", backup.from_replica).unwrap();

    writeln!(out, "\n#Compatibility").unwrap();
    writeln!(out, "block-size = {}", backup.block_size).unwrap();
    writeln!(out, "xlog-block-size = {}", backup.wal_block_size).unwrap();
    writeln!(out, "checksum-version = {}", backup.checksum_version).unwrap();
    if !backup.program_version.is_empty() {
        writeln!(out, "program-version = {}", backup.program_version).unwrap();
    }
    if !backup.server_version.is_empty() {
        writeln!(out, "server-version = {}", backup.server_version).unwrap();
    }

    writeln!(out, "\n#Result backup info").unwrap();
    writeln!(out, "timelineid = {}", backup.tli).unwrap();
    writeln!(out, "start-lsn = {}", backup.start_lsn).unwrap();
    writeln!(out, "stop-lsn = {}", backup.stop_lsn).unwrap();
    writeln!(out, "start-time = '{}'", time2iso(backup.start_time)).unwrap();
    if let Some(t) = backup.merge_time {
        writeln!(out, "merge-time = '{}'", time2iso(t)).unwrap();
    }
    if let Some(t) = backup.end_time {
        writeln!(out, "end-time = '{}'", time2iso(t)).unwrap();
    }
    writeln!(out, "recovery-xid = {}", backup.recovery_xid).unwrap();
    if let Some(t) = backup.recovery_time {
        writeln!(out, "recovery-time = '{}'", time2iso(t)).unwrap();
    }
    if let Some(bytes) = backup.data_bytes {
        writeln!(out, "data-bytes = {bytes}").unwrap();
    }
    if let Some(bytes) = backup.wal_bytes {
        writeln!(out, "wal-bytes = {bytes}").unwrap();
    }
    writeln!(out, "status = {}", backup.status).unwrap();
    if let Some(parent) = backup.parent_backup {
        writeln!(out, "parent-backup-id = '{parent}'").unwrap();
    }
    if let Some(conninfo) = &backup.primary_conninfo {
        writeln!(out, "primary_conninfo = '{conninfo}'").unwrap();
    }
    if let Some(dirs) = &backup.external_dir_str {
        writeln!(out, "external-dirs = '{dirs}'").unwrap();
    }
    out
}

fn unquote(v: &str) -> &str {
    v.trim().trim_matches('\'')
}

/// Parse `backup.control` content. Comments start with '#'; unknown keys are
/// warned about and skipped. A missing or zero `start-time` marks the file
/// corrupt.
pub fn parse_control(text: &str, path: &Utf8Path) -> Result<Backup> {
    let mut backup = Backup::new(BackupMode::Full, 0);
    let mut seen_any = false;
    let mut start_time: Option<i64> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("syntax error in \"{path}\": {line}");
            continue;
        };
        let key = key.trim();
        let value = unquote(value);
        seen_any = true;

        match key {
            "backup-mode" => backup.backup_mode = value.parse()?,
            "stream" => backup.stream = value.parse().unwrap_or(false),
            "compress-alg" => {
                backup.compress_alg = value
                    .parse()
                    .map_err(|e: String| BackupError::Catalog(e))?
            }
            "compress-level" => backup.compress_level = value.parse().unwrap_or(1),
            "from-replica" => backup.from_replica = value.parse().unwrap_or(false),
            "block-size" => backup.block_size = value.parse().unwrap_or(0),
            "xlog-block-size" => backup.wal_block_size = value.parse().unwrap_or(0),
            "checksum-version" => backup.checksum_version = value.parse().unwrap_or(0),
            "program-version" => backup.program_version = value.to_string(),
            "server-version" => backup.server_version = value.to_string(),
            "timelineid" => backup.tli = value.parse().unwrap_or(0),
            "start-lsn" => match value.parse() {
                Ok(lsn) => backup.start_lsn = lsn,
                Err(_) => warn!("invalid START_LSN \"{value}\" in \"{path}\""),
            },
            "stop-lsn" => match value.parse() {
                Ok(lsn) => backup.stop_lsn = lsn,
                Err(_) => warn!("invalid STOP_LSN \"{value}\" in \"{path}\""),
            },
            "start-time" => start_time = parse_iso_time(value),
            "merge-time" => backup.merge_time = parse_iso_time(value),
            "end-time" => backup.end_time = parse_iso_time(value),
            "recovery-xid" => backup.recovery_xid = value.parse().unwrap_or(0),
            "recovery-time" => backup.recovery_time = parse_iso_time(value),
            "data-bytes" => backup.data_bytes = value.parse().ok(),
            "wal-bytes" => backup.wal_bytes = value.parse().ok(),
            "status" => match value.parse() {
                Ok(status) => backup.status = status,
                Err(e) => warn!("{e}"),
            },
            "parent-backup-id" => backup.parent_backup = value.parse().ok(),
            "primary_conninfo" => backup.primary_conninfo = Some(value.to_string()),
            "external-dirs" => backup.external_dir_str = Some(value.to_string()),
            other => warn!("invalid option \"{other}\" in file \"{path}\""),
        }
    }

    if !seen_any {
        return Err(BackupError::Catalog(format!(
            "control file \"{path}\" is empty"
        )));
    }
    match start_time {
        Some(t) if t != 0 => backup.start_time = t,
        _ => {
            return Err(BackupError::Catalog(format!(
                "invalid ID/start-time, control file \"{path}\" is corrupted"
            )))
        }
    }
    Ok(backup)
}

/// Crash-safe rewrite of `backup.control`: serialize to `<path>.tmp`, fsync,
/// rename over the final name.
pub fn write_backup(instance_path: &Utf8Path, backup: &Backup) -> Result<()> {
    let path = backup_subpath(instance_path, backup.id(), BACKUP_CONTROL_FILE);
    let tmp_path = utils::crashsafe::path_with_suffix_extension(&path, "tmp");
    let content = serialize_control(backup);

    utils::crashsafe::overwrite(&path, &tmp_path, content.as_bytes()).map_err(|e| {
        // on any error the tmp file must not linger
        let _ = std::fs::remove_file(&tmp_path);
        BackupError::Io {
            context: format!("cannot write configuration file \"{path}\""),
            source: e,
        }
    })
}

/// Read one backup's control file. Returns `None` (with a warning) when the
/// file is missing or corrupt, like the original does: enumeration degrades
/// to a placeholder, it does not abort.
pub fn read_backup(instance_path: &Utf8Path, id: BackupId) -> Option<Backup> {
    let path = backup_subpath(instance_path, id, BACKUP_CONTROL_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("control file \"{path}\" doesn't exist");
            return None;
        }
        Err(e) => {
            warn!("cannot read control file \"{path}\": {e}");
            return None;
        }
    };
    match parse_control(&text, &path) {
        Ok(backup) => Some(backup),
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}

/// Re-read the backup from disk and persist only a status change, so that a
/// concurrent writer's fields are not clobbered.
pub fn write_backup_status(
    instance_path: &Utf8Path,
    backup: &mut Backup,
    status: BackupStatus,
) -> Result<()> {
    let Some(mut on_disk) = read_backup(instance_path, backup.id()) else {
        // read_backup already logged the warning
        return Ok(());
    };
    backup.status = status;
    on_disk.status = status;
    write_backup(instance_path, &on_disk)
}

/// Create the backup directory skeleton: `database/` plus one
/// `external_directories/externaldir<N>` per external directory
/// (numeration starts with 1).
pub fn create_backup_dir(
    instance_path: &Utf8Path,
    backup: &Backup,
    external_dirs: &[Utf8PathBuf],
) -> Result<()> {
    let path = backup_path(instance_path, backup.id());
    if path.exists() {
        return Err(BackupError::Catalog(format!(
            "backup destination is not empty \"{path}\""
        )));
    }
    let mut subdirs = vec![Utf8PathBuf::from(DATABASE_DIR)];
    for num in 1..=external_dirs.len() {
        subdirs.push(Utf8PathBuf::from(format!("{EXTERNAL_DIR}/externaldir{num}")));
    }
    for subdir in subdirs {
        let dir = path.join(subdir);
        utils::crashsafe::create_dir_all(&dir).map_err(|e| BackupError::Io {
            context: format!("cannot create backup directory \"{dir}\""),
            source: e,
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lockfile protocol
// ---------------------------------------------------------------------------

/// Paths of every lockfile this process holds; unlinked from the at-exit
/// hook even on abnormal termination.
static LOCK_FILES: Lazy<Mutex<Vec<Utf8PathBuf>>> = Lazy::new(|| Mutex::new(Vec::new()));
static EXIT_HOOK_REGISTERED: std::sync::Once = std::sync::Once::new();

extern "C" fn unlink_lock_atexit() {
    let lock_files = match LOCK_FILES.lock() {
        Ok(files) => files,
        Err(poisoned) => poisoned.into_inner(),
    };
    for path in lock_files.iter() {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // stderr directly: the tracing subscriber may be gone by now
            Err(e) => eprintln!("{path}: {e}"),
        }
    }
}

/// An acquired backup lock. Dropping it unlinks the lockfile and removes it
/// from the at-exit registry.
pub struct BackupLock {
    path: Utf8PathBuf,
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("{}: {e}", self.path);
            }
        }
        if let Ok(mut files) = LOCK_FILES.lock() {
            files.retain(|p| p != &self.path);
        }
    }
}

/// Create the exclusive lockfile in the backup's directory.
///
/// Returns `Ok(None)` ("busy", not an error) when another live process holds
/// the lock. A lockfile naming our own PID, or our parent's, is necessarily
/// stale (PID reuse after reboot) and is silently replaced, as is one naming
/// a PID that no longer exists.
pub fn lock_backup(instance_path: &Utf8Path, id: BackupId) -> Result<Option<BackupLock>> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let lock_file = backup_subpath(instance_path, id, BACKUP_LOCK_FILE);
    let my_pid = std::process::id() as i32;
    let my_p_pid = nix::unistd::getppid().as_raw();

    let mut ntries = 0u32;
    let mut file = loop {
        ntries += 1;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(FILE_PERMISSION)
            .open(&lock_file)
        {
            Ok(file) => break file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists && ntries <= LOCK_ATTEMPTS => {}
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("could not create lock file \"{lock_file}\""),
                    source: e,
                })
            }
        }

        // The file exists; read it to get the old owner's PID. Race: it may
        // have been deleted since we tried to create it.
        let content = match std::fs::read_to_string(&lock_file) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("could not open lock file \"{lock_file}\""),
                    source: e,
                })
            }
        };

        if content.is_empty() {
            return Err(BackupError::Catalog(format!(
                "lock file \"{lock_file}\" is empty"
            )));
        }
        let encoded_pid: i32 = content.trim().parse().map_err(|_| {
            BackupError::Catalog(format!(
                "bogus data in lock file \"{lock_file}\": \"{}\"",
                content.trim()
            ))
        })?;
        if encoded_pid <= 0 {
            return Err(BackupError::Catalog(format!(
                "bogus data in lock file \"{lock_file}\": \"{encoded_pid}\""
            )));
        }

        // Our own PID or our parent's can only be left over from a previous
        // boot cycle; everything else is probed with a zero signal.
        if encoded_pid != my_pid && encoded_pid != my_p_pid {
            match nix::sys::signal::kill(nix::unistd::Pid::from_raw(encoded_pid), None) {
                // EPERM still proves the process exists, it just belongs to
                // somebody else
                Ok(()) | Err(nix::errno::Errno::EPERM) => {
                    warn!(
                        "process {encoded_pid} is using backup {id} and still is running"
                    );
                    return Ok(None);
                }
                Err(nix::errno::Errno::ESRCH) => {
                    warn!("process {encoded_pid} which used backup {id} no longer exists");
                }
                Err(e) => {
                    return Err(BackupError::Catalog(format!(
                        "failed to send signal 0 to a process {encoded_pid}: {e}"
                    )))
                }
            }
        }

        // Looks like nobody's home. Unlink and retry; another would-be owner
        // may beat us to the create, hence the loop.
        if let Err(e) = std::fs::remove_file(&lock_file) {
            if e.kind() != ErrorKind::NotFound {
                return Err(BackupError::Io {
                    context: format!("could not remove old lock file \"{lock_file}\""),
                    source: e,
                });
            }
        }
    };

    let write_result = file
        .write_all(format!("{my_pid}\n").as_bytes())
        .and_then(|()| file.sync_all());
    if let Err(e) = write_result {
        drop(file);
        let _ = std::fs::remove_file(&lock_file);
        return Err(BackupError::Io {
            context: format!("could not write lock file \"{lock_file}\""),
            source: e,
        });
    }
    drop(file);

    EXIT_HOOK_REGISTERED.call_once(|| unsafe {
        libc::atexit(unlink_lock_atexit);
    });
    LOCK_FILES
        .lock()
        .expect("lockfile registry poisoned")
        .push(lock_file.clone());

    Ok(Some(BackupLock { path: lock_file }))
}

// ---------------------------------------------------------------------------
// Enumeration and chain queries
// ---------------------------------------------------------------------------

/// List all backups of the instance, sorted by start time descending, with
/// in-memory parent links resolved. A directory without a readable control
/// file yields an `INVALID` placeholder whose start time is decoded from the
/// directory name.
pub fn get_backup_list(instance_path: &Utf8Path) -> Result<Vec<Backup>> {
    let dir = match std::fs::read_dir(instance_path) {
        Ok(dir) => dir,
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot open directory \"{instance_path}\""),
                source: e,
            })
        }
    };

    let mut backups: Vec<Backup> = Vec::new();
    for entry in dir {
        let entry = entry.map_err(|e| BackupError::Io {
            context: format!("cannot read directory \"{instance_path}\""),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // skip hidden entries and anything that is not a directory
        if name.starts_with('.') {
            continue;
        }
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(decoded) = base36dec(&name) else {
            continue;
        };

        let backup = match read_backup(instance_path, BackupId(decoded)) {
            Some(backup) => {
                if base36enc(backup.start_time) != name {
                    warn!(
                        "backup ID in control file \"{}\" doesn't match name of the backup folder \"{name}\"",
                        base36enc(backup.start_time),
                    );
                }
                backup
            }
            None => Backup::new(BackupMode::Full, decoded),
        };
        backups.push(backup);
    }

    // descending by id; the newest backup comes first
    backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    // Link incremental backups with their ancestors.
    for i in 0..backups.len() {
        if backups[i].backup_mode == BackupMode::Full {
            continue;
        }
        let Some(parent) = backups[i].parent_backup else {
            continue;
        };
        if let Ok(parent_index) =
            backups.binary_search_by(|probe| parent.0.cmp(&probe.start_time))
        {
            backups[i].parent_index = Some(parent_index);
        }
    }

    Ok(backups)
}

/// Find the newest completed backup on the given timeline.
pub fn last_data_backup(backups: &[Backup], tli: u32) -> Option<usize> {
    backups
        .iter()
        .position(|b| b.status.is_complete() && b.tli == tli)
}

/// Walk the parent links to the base FULL backup. `None` (with a warning)
/// when the chain does not end in a FULL backup.
pub fn find_parent_full(backups: &[Backup], index: usize) -> Option<usize> {
    let mut index = index;
    while let Some(parent) = backups[index].parent_index {
        debug_assert!(parent > index, "parent links must point at older backups");
        index = parent;
    }

    if backups[index].backup_mode != BackupMode::Full {
        match backups[index].parent_backup {
            Some(parent) => warn!("backup {parent} is missing"),
            None => warn!(
                "failed to find parent FULL backup for {}",
                backups[index].id()
            ),
        }
        return None;
    }
    Some(index)
}

/// Verdict of walking a backup's ancestry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// A link is missing; `oldest` is the oldest node still present.
    Broken { oldest: usize },
    /// All links present, but at least one ancestor is not OK/DONE;
    /// `oldest_invalid` is the oldest such node.
    IntactInvalid { oldest_invalid: usize },
    /// All links present, everything OK/DONE; `full` is the base backup.
    Intact { full: usize },
}

/// Iterate over the parent chain and look for problems.
pub fn scan_parent_chain(backups: &[Backup], index: usize) -> ChainState {
    let mut current = index;
    let mut invalid: Option<usize> = None;

    while let Some(parent) = backups[current].parent_index {
        if !backups[current].status.is_complete() {
            // walking child -> root, so the last assignment is the oldest
            invalid = Some(current);
        }
        current = parent;
    }

    // the loop does not examine the final node
    if backups[current].backup_mode == BackupMode::Full
        && !backups[current].status.is_complete()
    {
        invalid = Some(current);
    }

    if backups[current].backup_mode != BackupMode::Full {
        return ChainState::Broken { oldest: current };
    }
    if let Some(oldest_invalid) = invalid {
        return ChainState::IntactInvalid { oldest_invalid };
    }
    ChainState::Intact { full: current }
}

/// Is `parent_time` an ancestor start-time of `child`? With `inclusive`,
/// a backup also counts as its own ancestor. This check does NOT guarantee
/// that the chain is intact.
pub fn is_parent(backups: &[Backup], parent_time: i64, child: usize, inclusive: bool) -> bool {
    if inclusive && backups[child].start_time == parent_time {
        return true;
    }

    let mut current = child;
    while backups[current].parent_index.is_some()
        && backups[current].parent_backup != Some(BackupId(parent_time))
    {
        current = backups[current].parent_index.unwrap();
    }

    backups[current].parent_backup == Some(BackupId(parent_time))
}

/// Does more than one OK/DONE backup name `target` as its direct parent?
pub fn is_prolific(backups: &[Backup], target: usize) -> bool {
    let target_id = backups[target].id();
    backups
        .iter()
        .filter(|b| b.parent_backup == Some(target_id) && b.status.is_complete())
        .count()
        > 1
}

/// DELETE command core: refuse while completed children still reference the
/// backup, take the lock, and remove the directory tree.
pub fn do_delete(instance_path: &Utf8Path, id: BackupId) -> Result<()> {
    let backups = get_backup_list(instance_path)?;
    let index = backups
        .iter()
        .position(|b| b.id() == id)
        .ok_or_else(|| BackupError::Catalog(format!("backup {id} not found")))?;

    for (i, b) in backups.iter().enumerate() {
        if i != index && b.status.is_complete() && is_parent(&backups, id.0, i, false) {
            return Err(BackupError::Catalog(format!(
                "backup {id} is an ancestor of completed backup {}, delete it first",
                b.id()
            )));
        }
    }

    let Some(_lock) = lock_backup(instance_path, id)? else {
        return Err(BackupError::Catalog(format!(
            "cannot lock backup {id} directory"
        )));
    };
    let mut backup = backups[index].clone();
    delete_backup_files(instance_path, &mut backup)
}

/// Remove the backup from disk: data first, lockfile last, so a concurrent
/// enumeration never sees a locked-but-vanishing backup.
pub fn delete_backup_files(instance_path: &Utf8Path, backup: &mut Backup) -> Result<()> {
    if backup.status == BackupStatus::Deleted {
        return Ok(());
    }
    write_backup_status(instance_path, backup, BackupStatus::Deleting)?;

    let dir = backup_path(instance_path, backup.id());
    let lock_path = backup_subpath(instance_path, backup.id(), BACKUP_LOCK_FILE);
    let mut entries: Vec<Utf8PathBuf> = Vec::new();
    collect_paths(&dir, &mut entries)?;
    // children before parents, lockfile at the very end
    entries.sort_by(|a, b| b.as_str().len().cmp(&a.as_str().len()));
    entries.retain(|p| p != &lock_path);
    entries.push(lock_path);
    entries.push(dir.clone());

    for path in entries {
        let md = match std::fs::symlink_metadata(&path) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("cannot stat \"{path}\""),
                    source: e,
                })
            }
        };
        let result = if md.is_dir() {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                error!("cannot remove \"{path}\": {e}");
                return Err(BackupError::Io {
                    context: format!("cannot remove \"{path}\""),
                    source: e,
                });
            }
        }
    }
    backup.status = BackupStatus::Deleted;
    Ok(())
}

fn collect_paths(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| BackupError::Io {
        context: format!("cannot open directory \"{dir}\""),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::Io {
            context: format!("cannot read directory \"{dir}\""),
            source: e,
        })?;
        let path = dir.join(entry.file_name().to_string_lossy().as_ref());
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            collect_paths(&path, out)?;
        }
        out.push(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_roundtrip() {
        for value in [0i64, 1, 35, 36, 1566545635, i64::from(u32::MAX)] {
            let encoded = base36enc(value);
            assert_eq!(base36dec(&encoded), Some(value));
        }
        assert_eq!(base36enc(1566545635), "pxbs9n7");
        // canonical digits survive a decode-encode cycle
        assert_eq!(base36enc(base36dec("pxbs9n7").unwrap()), "pxbs9n7");
    }

    #[test]
    fn test_time2iso_roundtrip() {
        let ts = 1_700_000_000;
        assert_eq!(parse_iso_time(&time2iso(ts)), Some(ts));
        // server-style two-digit offsets parse too
        assert!(parse_iso_time("2024-05-05 10:00:00+02").is_some());
        assert_eq!(parse_iso_time("yesterday"), None);
    }

    fn sample_backup() -> Backup {
        let mut backup = Backup::new(BackupMode::Delta, 1566545635);
        backup.status = BackupStatus::Ok;
        backup.tli = 3;
        backup.start_lsn = Lsn(0x2000028);
        backup.stop_lsn = Lsn(0x2000130);
        backup.end_time = Some(1566545700);
        backup.recovery_xid = 12345;
        backup.recovery_time = Some(1566545690);
        backup.data_bytes = Some(4096);
        backup.compress_alg = CompressAlg::Zlib;
        backup.compress_level = 4;
        backup.checksum_version = 1;
        backup.stream = true;
        backup.parent_backup = Some(BackupId(1566545000));
        backup.program_version = crate::PROGRAM_VERSION.to_string();
        backup.server_version = "14".to_string();
        backup.primary_conninfo = Some("host=localhost port=5432 user=backup".to_string());
        backup
    }

    #[test]
    fn test_control_file_roundtrip() {
        let backup = sample_backup();
        let text = serialize_control(&backup);
        let parsed = parse_control(&text, Utf8Path::new("backup.control")).unwrap();

        assert_eq!(parsed.backup_mode, backup.backup_mode);
        assert_eq!(parsed.status, backup.status);
        assert_eq!(parsed.tli, backup.tli);
        assert_eq!(parsed.start_lsn, backup.start_lsn);
        assert_eq!(parsed.stop_lsn, backup.stop_lsn);
        assert_eq!(parsed.start_time, backup.start_time);
        assert_eq!(parsed.end_time, backup.end_time);
        assert_eq!(parsed.recovery_xid, backup.recovery_xid);
        assert_eq!(parsed.recovery_time, backup.recovery_time);
        assert_eq!(parsed.data_bytes, backup.data_bytes);
        assert_eq!(parsed.wal_bytes, None);
        assert_eq!(parsed.compress_alg, backup.compress_alg);
        assert_eq!(parsed.compress_level, backup.compress_level);
        assert_eq!(parsed.stream, backup.stream);
        assert_eq!(parsed.parent_backup, backup.parent_backup);
        assert_eq!(parsed.primary_conninfo, backup.primary_conninfo);
        assert_eq!(parsed.program_version, backup.program_version);
    }

    #[test]
    fn test_corrupt_control_file() {
        // empty file
        assert!(parse_control("", Utf8Path::new("x")).is_err());
        // missing start-time
        assert!(parse_control("status = OK\n", Utf8Path::new("x")).is_err());
    }

    #[test]
    fn test_lockfile_protocol() {
        let dir = camino_tempfile::tempdir().unwrap();
        let id = BackupId(1234567);
        let backup_dir = backup_path(dir.path(), id);
        std::fs::create_dir_all(&backup_dir).unwrap();

        // fresh acquisition succeeds and the lockfile holds our PID
        let lock = lock_backup(dir.path(), id).unwrap().expect("lock acquired");
        let lock_path = backup_subpath(dir.path(), id, BACKUP_LOCK_FILE);
        let content = std::fs::read_to_string(&lock_path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());

        // a second acquisition by this very process sees its own PID,
        // treats the file as stale and succeeds
        drop(lock);
        std::fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();
        let lock = lock_backup(dir.path(), id).unwrap().expect("stale lock reclaimed");
        drop(lock);
        assert!(!lock_path.exists());

        // a live foreign process (PID 1) keeps the lock busy
        std::fs::write(&lock_path, "1\n").unwrap();
        assert!(lock_backup(dir.path(), id).unwrap().is_none());
        // and the lockfile is untouched
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "1\n");
        std::fs::remove_file(&lock_path).unwrap();

        // garbage in the lockfile is a hard error
        std::fs::write(&lock_path, "not-a-pid\n").unwrap();
        assert!(lock_backup(dir.path(), id).is_err());
    }

    fn chain_fixture() -> Vec<Backup> {
        // index 0 newest .. 3 oldest: DELTA <- PAGE <- DELTA <- FULL
        let mut b3 = Backup::new(BackupMode::Full, 1000);
        b3.status = BackupStatus::Ok;
        let mut b2 = Backup::new(BackupMode::Delta, 2000);
        b2.status = BackupStatus::Ok;
        b2.parent_backup = Some(BackupId(1000));
        let mut b1 = Backup::new(BackupMode::Page, 3000);
        b1.status = BackupStatus::Done;
        b1.parent_backup = Some(BackupId(2000));
        let mut b0 = Backup::new(BackupMode::Delta, 4000);
        b0.status = BackupStatus::Ok;
        b0.parent_backup = Some(BackupId(3000));

        let mut list = vec![b0, b1, b2, b3];
        for i in 0..list.len() {
            if let Some(parent) = list[i].parent_backup {
                list[i].parent_index = list.iter().position(|b| b.start_time == parent.0);
            }
        }
        list
    }

    #[test]
    fn test_chain_queries() {
        let mut list = chain_fixture();

        assert_eq!(find_parent_full(&list, 0), Some(3));
        assert_eq!(scan_parent_chain(&list, 0), ChainState::Intact { full: 3 });

        assert!(is_parent(&list, 1000, 0, false));
        assert!(is_parent(&list, 3000, 0, false));
        assert!(!is_parent(&list, 4000, 0, false));
        assert!(is_parent(&list, 4000, 0, true));
        assert!(!is_parent(&list, 1234, 0, true));

        assert_eq!(last_data_backup(&list, 0), Some(0));
        assert!(!is_prolific(&list, 2));

        // invalidate the middle of the chain
        list[2].status = BackupStatus::Error;
        assert_eq!(
            scan_parent_chain(&list, 0),
            ChainState::IntactInvalid { oldest_invalid: 2 }
        );

        // break the chain: drop the FULL backup from the list
        let mut broken = chain_fixture();
        broken.truncate(3);
        broken[2].parent_index = None;
        assert_eq!(
            scan_parent_chain(&broken, 0),
            ChainState::Broken { oldest: 2 }
        );
        assert_eq!(find_parent_full(&broken, 0), None);
    }

    #[test]
    fn test_delete_backup() {
        let dir = camino_tempfile::tempdir().unwrap();

        let mut full = Backup::new(BackupMode::Full, 1000);
        full.status = BackupStatus::Ok;
        let full_dir = backup_path(dir.path(), full.id());
        std::fs::create_dir_all(full_dir.join("database/base/1")).unwrap();
        std::fs::write(full_dir.join("database/base/1/123"), b"data").unwrap();
        write_backup(dir.path(), &full).unwrap();

        let mut child = Backup::new(BackupMode::Delta, 2000);
        child.status = BackupStatus::Ok;
        child.parent_backup = Some(BackupId(1000));
        std::fs::create_dir_all(backup_path(dir.path(), child.id())).unwrap();
        write_backup(dir.path(), &child).unwrap();

        // a parent with a completed child stays
        assert!(do_delete(dir.path(), full.id()).is_err());
        assert!(full_dir.exists());

        // children go first, then the parent; no lockfile remains
        do_delete(dir.path(), child.id()).unwrap();
        assert!(!backup_path(dir.path(), child.id()).exists());
        do_delete(dir.path(), full.id()).unwrap();
        assert!(!full_dir.exists());

        assert!(do_delete(dir.path(), BackupId(9999)).is_err());
    }

    #[test]
    fn test_enumeration_and_placeholders() {
        let dir = camino_tempfile::tempdir().unwrap();

        // a complete backup
        let full = {
            let mut b = Backup::new(BackupMode::Full, 1000);
            b.status = BackupStatus::Ok;
            b.program_version = crate::PROGRAM_VERSION.to_string();
            b
        };
        std::fs::create_dir_all(backup_path(dir.path(), full.id())).unwrap();
        write_backup(dir.path(), &full).unwrap();

        // a child referencing it
        let child = {
            let mut b = Backup::new(BackupMode::Delta, 2000);
            b.status = BackupStatus::Ok;
            b.parent_backup = Some(BackupId(1000));
            b
        };
        std::fs::create_dir_all(backup_path(dir.path(), child.id())).unwrap();
        write_backup(dir.path(), &child).unwrap();

        // a directory with no control file at all
        std::fs::create_dir_all(backup_path(dir.path(), BackupId(3000))).unwrap();
        // hidden directories and stray files are ignored
        std::fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();

        let list = get_backup_list(dir.path()).unwrap();
        assert_eq!(list.len(), 3);
        // sorted newest first
        assert_eq!(list[0].start_time, 3000);
        assert_eq!(list[0].status, BackupStatus::Invalid);
        assert_eq!(list[1].start_time, 2000);
        assert_eq!(list[2].start_time, 1000);
        // parent link resolved to an index
        assert_eq!(list[1].parent_index, Some(2));
    }
}
