//! The backup's file list: directory walking, relation-file classification,
//! and the `backup_content.control` format (one JSON object per line).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use postgres_ffi::pg_constants::{
    DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID, PG_TBLSPC_DIR, TABLESPACE_VERSION_DIRECTORY,
};
use postgres_ffi::relfile_utils::split_relfilename;
use tracing::{debug, trace, warn};

use crate::catalog::{backup_subpath, Backup, DATABASE_FILE_LIST};
use crate::compress::CompressAlg;
use crate::error::{BackupError, Result};
use crate::fio::{FileKind, FileSystem};
use crate::pagemap::PageMap;

/// `write_size` sentinel: the file did not change since the parent backup
/// and was not copied.
pub const BYTES_INVALID: i64 = -1;
/// `write_size` sentinel: the file disappeared while the backup ran (deleted
/// by a concurrent transaction).
pub const FILE_NOT_FOUND: i64 = -2;

/// The contents of these directories are removed or recreated during server
/// start, so they are not included in backups. The directories themselves
/// are kept, as empty, to preserve access permissions.
const PGDATA_EXCLUDE_DIR: &[&str] = &[
    crate::catalog::PG_XLOG_DIR,
    "pg_stat_tmp",
    "pgsql_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

const PGDATA_EXCLUDE_FILES: &[&str] = &[
    "postgresql.auto.conf.tmp",
    "current_logfiles.tmp",
    "recovery.conf",
    "postmaster.pid",
    "postmaster.opts",
];

/// In non-exclusive mode the server hands us these through stop-backup
/// instead; the copies in PGDATA are leftovers.
const PGDATA_EXCLUDE_FILES_NON_EXCLUSIVE: &[&str] = &["backup_label", "tablespace_map"];

/// Mutable-per-worker portion of a file entry. Only the worker that claimed
/// the entry writes here, but the lead worker reads everything while
/// checkpointing the file list, hence the mutex.
#[derive(Debug, Default, Clone)]
pub struct FileState {
    pub write_size: i64,
    pub read_size: i64,
    pub crc: u32,
    pub compress_alg: CompressAlg,
    /// Blocks seen while copying; recorded for DELTA so restore can truncate.
    pub n_blocks: Option<u32>,
    pub exists_in_prev: bool,
    pub pagemap: Option<PageMap>,
    pub pagemap_isabsent: bool,
}

#[derive(Debug)]
pub struct FileEntry {
    /// Absolute source path.
    pub path: Utf8PathBuf,
    /// Path relative to PGDATA / the external directory; used at restore.
    pub rel_path: Utf8PathBuf,
    pub kind: FileKind,
    /// Full st_mode (format bits | permissions).
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    /// 0 for PGDATA; external directories are numbered from 1.
    pub external_dir_num: usize,

    pub is_datafile: bool,
    /// Lives in a tablespace compressed at rest.
    pub is_cfs: bool,
    /// A per-database directory (relevant to ptrack handling).
    pub is_database: bool,
    pub tblspc_oid: u32,
    pub db_oid: u32,
    pub rel_oid: u32,
    pub fork_name: Option<String>,
    pub segno: u32,
    pub linked: Option<Utf8PathBuf>,

    /// Claimed by a worker via test-and-set; distributes work without a queue.
    pub claim: AtomicBool,
    pub state: Mutex<FileState>,
}

impl FileEntry {
    pub fn new(
        path: Utf8PathBuf,
        rel_path: Utf8PathBuf,
        kind: FileKind,
        mode: u32,
        size: u64,
        mtime: i64,
        external_dir_num: usize,
    ) -> FileEntry {
        let format_bits = match kind {
            FileKind::Directory => 0o040000,
            FileKind::Regular => 0o100000,
            FileKind::Symlink => 0o120000,
            FileKind::Other => 0,
        };
        FileEntry {
            path,
            rel_path,
            kind,
            mode: format_bits | (mode & 0o7777),
            size,
            mtime,
            external_dir_num,
            is_datafile: false,
            is_cfs: false,
            is_database: false,
            tblspc_oid: 0,
            db_oid: 0,
            rel_oid: 0,
            fork_name: None,
            segno: 0,
            linked: None,
            claim: AtomicBool::new(false),
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn file_name(&self) -> &str {
        self.rel_path.file_name().unwrap_or(self.rel_path.as_str())
    }

    /// Claim this entry for the calling worker. True exactly once.
    pub fn try_claim(&self) -> bool {
        !self.claim.swap(true, Ordering::AcqRel)
    }

    pub fn reset_claim(&self) {
        self.claim.store(false, Ordering::Release);
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FileState> {
        self.state.lock().expect("file entry state poisoned")
    }
}

enum FileCheck {
    Keep,
    Skip,
    /// Keep the directory entry itself but do not descend.
    KeepDirOnly,
}

/// Check one file or directory against the exclusion lists and extract
/// relation information from its name. Port of pg_probackup's
/// dir_check_file.
fn dir_check_file(entry: &mut FileEntry, exclusive: bool) -> FileCheck {
    let name = entry.file_name().to_string();
    let in_tablespace = entry.rel_path.starts_with(PG_TBLSPC_DIR);

    if entry.kind == FileKind::Regular {
        if !exclusive
            && PGDATA_EXCLUDE_FILES_NON_EXCLUSIVE.contains(&name.as_str())
        {
            trace!("excluding file: {name}");
            return FileCheck::Skip;
        }
        if PGDATA_EXCLUDE_FILES.contains(&name.as_str()) {
            trace!("excluding file: {name}");
            return FileCheck::Skip;
        }
    } else if entry.kind == FileKind::Directory && !in_tablespace {
        if PGDATA_EXCLUDE_DIR.contains(&name.as_str()) {
            trace!("excluding directory content: {name}");
            return FileCheck::KeepDirOnly;
        }
    }

    if in_tablespace {
        // pg_tblspc/<tblspcOid>/<TABLESPACE_VERSION_DIRECTORY>/<dbOid>/...
        let mut parts = entry.rel_path.components().map(|c| c.as_str()).skip(1);
        let tblspc = parts.next().and_then(|s| s.parse::<u32>().ok());
        let version_dir = parts.next();
        let db = parts.next().and_then(|s| s.parse::<u32>().ok());

        if let Some(tblspc) = tblspc {
            entry.tblspc_oid = tblspc;
        }
        // skip recursive tablespace content that is not under the version dir
        if let Some(version_dir) = version_dir {
            if version_dir != TABLESPACE_VERSION_DIRECTORY {
                return FileCheck::Skip;
            }
        }
        if let Some(db) = db {
            entry.db_oid = db;
            if entry.kind == FileKind::Directory
                && entry.rel_path.components().count() == 4
            {
                entry.is_database = true;
            }
        }
    } else if entry.rel_path.starts_with("global") {
        entry.tblspc_oid = GLOBALTABLESPACE_OID;
        if entry.kind == FileKind::Directory && name == "global" {
            entry.is_database = true;
        }
    } else if entry.rel_path.starts_with("base") {
        entry.tblspc_oid = DEFAULTTABLESPACE_OID;
        if let Some(db) = entry.rel_path.components().nth(1) {
            if let Ok(db_oid) = db.as_str().parse::<u32>() {
                entry.db_oid = db_oid;
            }
        }
        if entry.kind == FileKind::Directory && name != "base" {
            entry.is_database = true;
        }
    }

    // ptrack's own bookkeeping is never backed up
    if entry.kind == FileKind::Regular && name == "ptrack_init" {
        return FileCheck::Skip;
    }

    // Files inside database directories, including 'global'
    if entry.kind == FileKind::Regular && entry.tblspc_oid != 0 && !name.is_empty() {
        if name == "pg_internal.init" {
            return FileCheck::Skip;
        }
        let bytes = name.as_bytes();
        // temp relations: t<digit>...
        if bytes[0] == b't' && bytes.len() > 1 && bytes[1].is_ascii_digit() {
            return FileCheck::Skip;
        }
        if bytes[0].is_ascii_digit() {
            // <reloid>.cfm companion files of compressed tablespaces are
            // copied whole
            if name.ends_with(".cfm") {
                return FileCheck::Keep;
            }
            match split_relfilename(&name) {
                Ok((rel_oid, fork_name, segno)) => {
                    if fork_name == Some("ptrack") {
                        return FileCheck::Skip;
                    }
                    entry.rel_oid = rel_oid;
                    entry.fork_name = fork_name.map(|f| f.to_string());
                    entry.segno = segno;
                    // only main-fork segments go through the page engine
                    entry.is_datafile = fork_name.is_none();
                }
                Err(_) => {
                    warn!("cannot parse file name \"{name}\"");
                }
            }
        }
    }

    FileCheck::Keep
}

fn list_dir_internal(
    fs: &dyn FileSystem,
    files: &mut Vec<FileEntry>,
    root: &Utf8Path,
    parent_rel: &Utf8Path,
    exclude: bool,
    exclusive: bool,
    external_dir_num: usize,
) -> Result<()> {
    let parent_abs = if parent_rel.as_str().is_empty() {
        root.to_owned()
    } else {
        root.join(parent_rel)
    };
    let entries = match fs.read_dir(&parent_abs) {
        Ok(entries) => entries,
        // the directory may be removed under us
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot open directory \"{parent_abs}\""),
                source: e,
            })
        }
    };

    for dirent in entries {
        let rel_child = parent_rel.join(&dirent.name);
        let abs_child = root.join(&rel_child);

        // stat following symlinks: a symlinked directory (tablespace) is
        // listed as the directory it points at
        let st = match fs.stat(&abs_child, true) {
            Ok(st) => st,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("cannot stat file \"{abs_child}\""),
                    source: e,
                })
            }
        };

        if st.kind != FileKind::Regular && st.kind != FileKind::Directory {
            warn!("skip \"{abs_child}\": unexpected file format");
            continue;
        }

        let mut entry = FileEntry::new(
            abs_child,
            rel_child.clone(),
            st.kind,
            st.mode,
            st.size,
            st.mtime,
            external_dir_num,
        );
        if dirent.kind == FileKind::Symlink {
            if let Ok(target) = fs.read_link(&entry.path) {
                entry.linked = Some(target);
            }
        }

        let check = if exclude {
            dir_check_file(&mut entry, exclusive)
        } else {
            FileCheck::Keep
        };

        match check {
            FileCheck::Skip => continue,
            FileCheck::KeepDirOnly => {
                files.push(entry);
                continue;
            }
            FileCheck::Keep => {
                let is_dir = entry.kind == FileKind::Directory;
                files.push(entry);
                if is_dir {
                    list_dir_internal(
                        fs,
                        files,
                        root,
                        &rel_child,
                        exclude,
                        exclusive,
                        external_dir_num,
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Recursively list a data directory (or an external directory) into file
/// entries with relation classification applied.
pub fn list_data_directory(
    fs: &dyn FileSystem,
    root: &Utf8Path,
    external_dir_num: usize,
    exclude: bool,
    exclusive: bool,
) -> Result<Vec<FileEntry>> {
    match fs.stat(root, true) {
        Ok(st) if st.kind == FileKind::Directory => {}
        Ok(_) | Err(_) if external_dir_num > 0 => {
            return Err(BackupError::Config(format!(
                "external directory is not found: \"{root}\""
            )))
        }
        Ok(_) => {
            warn!("skip \"{root}\": unexpected file format");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot stat directory \"{root}\""),
                source: e,
            })
        }
    }

    let mut files = Vec::new();
    list_dir_internal(
        fs,
        &mut files,
        root,
        Utf8Path::new(""),
        exclude,
        exclusive,
        external_dir_num,
    )?;
    Ok(files)
}

/// Post-listing passes over the path-sorted list:
/// mark every datafile of a compressed (cfs) tablespace, and drop the files
/// of unlogged relations, keeping only the init fork.
pub fn parse_filelist_filenames(files: &mut Vec<FileEntry>) {
    // tablespaces compressed at rest announce themselves with a
    // "pg_compression" marker next to the database directories
    let mut cfs_prefixes: Vec<Utf8PathBuf> = Vec::new();
    for entry in files.iter() {
        if entry.kind == FileKind::Regular && entry.file_name() == "pg_compression" {
            if let Some(parent) = entry.rel_path.parent() {
                if parent.starts_with(PG_TBLSPC_DIR)
                    && parent.file_name() == Some(TABLESPACE_VERSION_DIRECTORY)
                {
                    debug!("cfs tablespace found: {parent}");
                    cfs_prefixes.push(parent.to_owned());
                }
            }
        }
    }
    if !cfs_prefixes.is_empty() {
        for entry in files.iter_mut() {
            if entry.is_datafile
                && cfs_prefixes
                    .iter()
                    .any(|prefix| entry.rel_path.starts_with(prefix))
            {
                entry.is_cfs = true;
            }
        }
    }

    // unlogged relations: the init fork marks the relation; everything else
    // of it is skipped
    let unlogged: Vec<(u32, u32, u32)> = files
        .iter()
        .filter(|f| f.fork_name.as_deref() == Some("init"))
        .map(|f| (f.tblspc_oid, f.db_oid, f.rel_oid))
        .collect();
    if !unlogged.is_empty() {
        files.retain(|f| {
            f.rel_oid == 0
                || f.fork_name.as_deref() == Some("init")
                || !unlogged.contains(&(f.tblspc_oid, f.db_oid, f.rel_oid))
        });
    }
}

pub fn compare_paths(a: &FileEntry, b: &FileEntry) -> std::cmp::Ordering {
    a.path.cmp(&b.path)
}

/// Sort order used for distributing work: small files first keeps workers
/// busy evenly near the end of the run.
pub fn compare_sizes(a: &FileEntry, b: &FileEntry) -> std::cmp::Ordering {
    a.size.cmp(&b.size)
}

/// Sort key for looking up a file in the parent backup's list.
pub fn compare_rel_paths(a: &FileEntry, b: &FileEntry) -> std::cmp::Ordering {
    a.rel_path
        .cmp(&b.rel_path)
        .then(a.external_dir_num.cmp(&b.external_dir_num))
}

/// Serialize one entry as the file list spells it: every value is a quoted
/// string, optional keys only when meaningful.
fn filelist_line(entry: &FileEntry) -> String {
    let state = entry.state();
    let mut line = format!(
        "{{\"path\":\"{}\", \"size\":\"{}\", \"mode\":\"{}\", \"is_datafile\":\"{}\", \"is_cfs\":\"{}\", \"crc\":\"{}\", \"compress_alg\":\"{}\", \"external_dir_num\":\"{}\"",
        entry.rel_path,
        state.write_size,
        entry.mode,
        entry.is_datafile as u8,
        entry.is_cfs as u8,
        state.crc,
        state.compress_alg,
        entry.external_dir_num,
    );
    if entry.is_datafile {
        line.push_str(&format!(",\"segno\":\"{}\"", entry.segno));
    }
    if let Some(linked) = &entry.linked {
        line.push_str(&format!(",\"linked\":\"{linked}\""));
    }
    if let Some(n_blocks) = state.n_blocks {
        line.push_str(&format!(",\"n_blocks\":\"{n_blocks}\""));
    }
    line.push_str("}\n");
    line
}

/// Write `backup_content.control` with the crash-safe tmp+rename discipline,
/// buffering about 500 pages worth of lines between writes. Returns the
/// on-disk data size accounted the way `data-bytes` wants it.
pub fn write_filelist(
    instance_path: &Utf8Path,
    backup: &Backup,
    files: &[FileEntry],
) -> Result<i64> {
    const BUFFER_SIZE: usize = postgres_ffi::BLCKSZ as usize * 500;

    let path = backup_subpath(instance_path, backup.id(), DATABASE_FILE_LIST);
    let tmp_path = utils::crashsafe::path_with_suffix_extension(&path, "tmp");

    let result = (|| -> std::io::Result<i64> {
        let mut out = std::fs::File::create(&tmp_path)?;
        let mut buf = String::with_capacity(BUFFER_SIZE);
        let mut backup_size_on_disk: i64 = 0;

        for entry in files {
            if entry.kind == FileKind::Directory {
                backup_size_on_disk += 4096;
            }
            if entry.kind == FileKind::Regular {
                let write_size = entry.state().write_size;
                if write_size > 0 {
                    backup_size_on_disk += write_size;
                }
            }

            buf.push_str(&filelist_line(entry));
            if buf.len() >= BUFFER_SIZE {
                out.write_all(buf.as_bytes())?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            out.write_all(buf.as_bytes())?;
        }
        out.sync_all()?;
        drop(out);
        std::fs::rename(&tmp_path, &path)?;
        Ok(backup_size_on_disk)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        BackupError::Io {
            context: format!("cannot write file list \"{path}\""),
            source: e,
        }
    })
}

fn json_str<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn json_i64(value: &serde_json::Value, key: &str) -> Option<i64> {
    json_str(value, key).and_then(|s| s.parse().ok())
}

/// Read a `backup_content.control` back into file entries. `root`, when
/// given, is prepended to relative paths to form absolute source paths.
pub fn read_filelist(path: &Utf8Path, root: Option<&Utf8Path>) -> Result<Vec<FileEntry>> {
    let text = std::fs::read_to_string(path).map_err(|e| BackupError::Io {
        context: format!("cannot open \"{path}\""),
        source: e,
    })?;

    let mut files = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            BackupError::Catalog(format!("file list \"{path}\" has invalid format: {e}"))
        })?;

        let rel_path = Utf8PathBuf::from(json_str(&value, "path").ok_or_else(|| {
            BackupError::Catalog(format!("field \"path\" is not found in \"{path}\""))
        })?);
        let write_size = json_i64(&value, "size").ok_or_else(|| {
            BackupError::Catalog(format!("field \"size\" is not found in \"{path}\""))
        })?;
        let mode = json_i64(&value, "mode").ok_or_else(|| {
            BackupError::Catalog(format!("field \"mode\" is not found in \"{path}\""))
        })? as u32;

        let kind = match mode & 0o170000 {
            0o040000 => FileKind::Directory,
            0o120000 => FileKind::Symlink,
            _ => FileKind::Regular,
        };
        let abs_path = match root {
            Some(root) => root.join(&rel_path),
            None => rel_path.clone(),
        };

        let mut entry = FileEntry::new(
            abs_path,
            rel_path,
            kind,
            mode & 0o7777,
            write_size.max(0) as u64,
            0,
            json_i64(&value, "external_dir_num").unwrap_or(0) as usize,
        );
        entry.is_datafile = json_i64(&value, "is_datafile").unwrap_or(0) != 0;
        entry.is_cfs = json_i64(&value, "is_cfs").unwrap_or(0) != 0;
        if let Some(linked) = json_str(&value, "linked") {
            if !linked.is_empty() {
                entry.linked = Some(Utf8PathBuf::from(linked));
            }
        }
        if let Some(segno) = json_i64(&value, "segno") {
            entry.segno = segno as u32;
        }
        if entry.is_datafile {
            // recover the relation identity from the path for ptrack lookups
            if let Ok((rel_oid, fork, segno)) = split_relfilename(
                entry.rel_path.file_name().unwrap_or_default(),
            ) {
                entry.rel_oid = rel_oid;
                entry.fork_name = fork.map(|f| f.to_string());
                entry.segno = segno;
            }
        }

        {
            let mut state = entry.state();
            state.write_size = write_size;
            state.crc = json_i64(&value, "crc").unwrap_or(0) as u32;
            state.compress_alg = json_str(&value, "compress_alg")
                .and_then(|s| s.parse().ok())
                .unwrap_or(CompressAlg::None);
            state.n_blocks = json_i64(&value, "n_blocks").map(|n| n as u32);
        }

        files.push(entry);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{backup_path, BackupMode};
    use crate::fio::LocalFs;

    fn touch(path: &Utf8Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn make_pgdata(root: &Utf8Path) {
        touch(&root.join("PG_VERSION"), b"14\n");
        touch(&root.join("global/pg_control"), &[0u8; 512]);
        touch(&root.join("global/1262"), &[0u8; 8192]);
        touch(&root.join("base/13000/123"), &[0u8; 16384]);
        touch(&root.join("base/13000/123_fsm"), &[0u8; 8192]);
        touch(&root.join("base/13000/123.1"), &[0u8; 8192]);
        touch(&root.join("base/13000/123_ptrack"), &[0u8; 8192]);
        touch(&root.join("base/13000/t3_999"), &[0u8; 8192]);
        touch(&root.join("base/13000/pg_internal.init"), &[0u8; 16]);
        touch(&root.join("base/13000/ptrack_init"), b"");
        // unlogged relation 456: everything but the init fork is dropped
        touch(&root.join("base/13000/456"), &[0u8; 8192]);
        touch(&root.join("base/13000/456_fsm"), &[0u8; 8192]);
        touch(&root.join("base/13000/456_init"), &[0u8; 8192]);
        // excluded directories keep only the directory entry
        touch(&root.join("pg_wal/000000010000000000000001"), &[0u8; 64]);
        touch(&root.join("pg_notify/0000"), &[0u8; 16]);
        touch(&root.join("postmaster.pid"), b"42\n");
        touch(&root.join("backup_label"), b"LABEL");
    }

    fn find<'a>(files: &'a [FileEntry], rel: &str) -> Option<&'a FileEntry> {
        files.iter().find(|f| f.rel_path == Utf8Path::new(rel))
    }

    #[test]
    fn test_listing_and_classification() {
        let dir = camino_tempfile::tempdir().unwrap();
        make_pgdata(dir.path());

        let mut files = list_data_directory(&LocalFs, dir.path(), 0, true, false).unwrap();
        files.sort_by(compare_paths);
        parse_filelist_filenames(&mut files);

        // relation segments are classified
        let rel = find(&files, "base/13000/123").unwrap();
        assert!(rel.is_datafile);
        assert_eq!(rel.rel_oid, 123);
        assert_eq!(rel.db_oid, 13000);
        assert_eq!(rel.tblspc_oid, DEFAULTTABLESPACE_OID);
        assert_eq!(rel.segno, 0);

        let seg = find(&files, "base/13000/123.1").unwrap();
        assert!(seg.is_datafile);
        assert_eq!(seg.segno, 1);

        // non-main forks are kept but are not datafiles
        let fsm = find(&files, "base/13000/123_fsm").unwrap();
        assert!(!fsm.is_datafile);
        assert_eq!(fsm.fork_name.as_deref(), Some("fsm"));

        // database directory flag
        let dbdir = find(&files, "base/13000").unwrap();
        assert!(dbdir.is_database);

        // exclusions
        assert!(find(&files, "base/13000/123_ptrack").is_none());
        assert!(find(&files, "base/13000/t3_999").is_none());
        assert!(find(&files, "base/13000/pg_internal.init").is_none());
        assert!(find(&files, "base/13000/ptrack_init").is_none());
        assert!(find(&files, "postmaster.pid").is_none());
        assert!(find(&files, "backup_label").is_none());
        assert!(find(&files, "pg_wal").is_some());
        assert!(find(&files, "pg_wal/000000010000000000000001").is_none());
        assert!(find(&files, "pg_notify").is_some());
        assert!(find(&files, "pg_notify/0000").is_none());

        // unlogged relation: init fork stays, the rest is gone
        assert!(find(&files, "base/13000/456_init").is_some());
        assert!(find(&files, "base/13000/456").is_none());
        assert!(find(&files, "base/13000/456_fsm").is_none());
    }

    #[test]
    fn test_cfs_tablespace_detection() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ts_dir = format!("{PG_TBLSPC_DIR}/16500/{TABLESPACE_VERSION_DIRECTORY}");
        touch(&dir.path().join(format!("{ts_dir}/16401/8000")), &[0u8; 8192]);
        touch(&dir.path().join(format!("{ts_dir}/16401/8000.cfm")), &[0u8; 64]);
        touch(&dir.path().join(format!("{ts_dir}/pg_compression")), b"");
        touch(&dir.path().join("base/1/7000"), &[0u8; 8192]);

        let mut files = list_data_directory(&LocalFs, dir.path(), 0, true, false).unwrap();
        files.sort_by(compare_paths);
        parse_filelist_filenames(&mut files);

        let compressed = find(&files, &format!("{ts_dir}/16401/8000")).unwrap();
        assert!(compressed.is_datafile);
        assert!(compressed.is_cfs);
        assert_eq!(compressed.tblspc_oid, 16500);
        assert_eq!(compressed.db_oid, 16401);

        let plain = find(&files, "base/1/7000").unwrap();
        assert!(!plain.is_cfs);
    }

    #[test]
    fn test_filelist_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backup = {
            let mut b = Backup::new(BackupMode::Full, 7777);
            b.status = crate::catalog::BackupStatus::Running;
            b
        };
        std::fs::create_dir_all(backup_path(dir.path(), backup.id())).unwrap();

        let mut entry = FileEntry::new(
            Utf8PathBuf::from("/pgdata/base/1/123.2"),
            Utf8PathBuf::from("base/1/123.2"),
            FileKind::Regular,
            0o600,
            16384,
            0,
            0,
        );
        entry.is_datafile = true;
        entry.rel_oid = 123;
        entry.segno = 2;
        {
            let mut state = entry.state();
            state.write_size = 8240;
            state.crc = 0xDEADBEEF;
            state.compress_alg = CompressAlg::Pglz;
            state.n_blocks = Some(2);
        }
        let dir_entry = FileEntry::new(
            Utf8PathBuf::from("/pgdata/base"),
            Utf8PathBuf::from("base"),
            FileKind::Directory,
            0o700,
            4096,
            0,
            0,
        );
        let skipped = {
            let e = FileEntry::new(
                Utf8PathBuf::from("/pgdata/base/1/200"),
                Utf8PathBuf::from("base/1/200"),
                FileKind::Regular,
                0o600,
                8192,
                0,
                0,
            );
            e.state().write_size = BYTES_INVALID;
            e
        };

        let files = vec![dir_entry, entry, skipped];
        let data_bytes = write_filelist(dir.path(), &backup, &files).unwrap();
        // 4096 for the directory + the stored bytes; BYTES_INVALID adds nothing
        assert_eq!(data_bytes, 4096 + 8240);

        let list_path = backup_subpath(dir.path(), backup.id(), DATABASE_FILE_LIST);
        let restored = read_filelist(&list_path, Some(Utf8Path::new("/restore"))).unwrap();
        assert_eq!(restored.len(), 3);

        let r = &restored[1];
        assert_eq!(r.rel_path, Utf8Path::new("base/1/123.2"));
        assert_eq!(r.path, Utf8Path::new("/restore/base/1/123.2"));
        assert!(r.is_datafile);
        assert_eq!(r.segno, 2);
        assert_eq!(r.rel_oid, 123);
        let state = r.state();
        assert_eq!(state.write_size, 8240);
        assert_eq!(state.crc, 0xDEADBEEF);
        assert_eq!(state.compress_alg, CompressAlg::Pglz);
        assert_eq!(state.n_blocks, Some(2));
        drop(state);

        assert_eq!(restored[0].kind, FileKind::Directory);
        assert_eq!(restored[2].state().write_size, BYTES_INVALID);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let entry = FileEntry::new(
            Utf8PathBuf::from("/x"),
            Utf8PathBuf::from("x"),
            FileKind::Regular,
            0o600,
            0,
            0,
            0,
        );
        assert!(entry.try_claim());
        assert!(!entry.try_claim());
        entry.reset_claim();
        assert!(entry.try_claim());
    }
}
