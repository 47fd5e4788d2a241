//! The backup orchestrator: one session's walk through
//! `INIT -> CONNECTED -> STARTED -> LISTED -> MAPPED -> COPYING -> STOPPED ->
//! FINALIZED -> (OK|ERROR)`.
//!
//! The orchestrator runs on the main thread, file workers on a small thread
//! pool claiming entries through per-entry flags, and WAL streaming (when
//! enabled) on its own thread bound to the shared stop LSN.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use crc32c::crc32c_append;
use postgres_ffi::{BLCKSZ, XLOG_BLCKSZ};
use tracing::{debug, error, info, trace, warn};
use utils::lsn::{AtomicLsn, Lsn};

use crate::catalog::{
    self, backup_path, backup_subpath, time2iso, Backup, BackupMode, BackupStatus,
    DATABASE_DIR, DATABASE_FILE_LIST, DIR_PERMISSION, EXTERNAL_DIR, PG_XLOG_DIR,
};
use crate::config::InstanceConfig;
use crate::datafile::{self, PageCtx};
use crate::db::{self, DbConn, PtrackBlockSource};
use crate::error::{BackupError, IoResultExt, Result};
use crate::filelist::{
    self, compare_paths, compare_rel_paths, compare_sizes, FileEntry, BYTES_INVALID,
    FILE_NOT_FOUND,
};
use crate::fio::{FileKind, FioRouter, Location, WritableFile};
use crate::pagemap::{self, PageMapBuilder};
use crate::stream::{self, StreamArgs};
use crate::validate;
use crate::walscan;
use crate::walwait::{wait_replica_wal_lsn, WalWaiter};

/// A PGDATA with fewer entries than this is either being deleted underneath
/// us or we cannot actually read it.
const PGDATA_MIN_ENTRIES: usize = 100;

/// How often the lead worker checkpoints the file list and control file.
const FILELIST_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);

pub struct BackupOptions {
    pub mode: BackupMode,
    pub smooth_checkpoint: bool,
    pub no_validate: bool,
}

/// Everything the file workers share. Workers mutate only the state of
/// entries they claimed; the lead worker additionally rewrites the catalog
/// files, which is safe because those writes go through tmp+rename.
struct WorkerShared<'a> {
    config: &'a InstanceConfig,
    fio: &'a FioRouter,
    instance_path: Utf8PathBuf,
    database_path: Utf8PathBuf,
    external_prefix: Utf8PathBuf,
    files: &'a [FileEntry],
    /// Parent backup's list, sorted by (rel_path, external_dir_num).
    prev_filelist: &'a [FileEntry],
    prev_start_lsn: Lsn,
    current: &'a Mutex<Backup>,
    checksum_version: u32,
    ptrack_available: bool,
    thread_interrupted: &'a AtomicBool,
}

/// Entry point of the BACKUP subcommand.
pub fn do_backup(config: &InstanceConfig, options: BackupOptions) -> Result<catalog::BackupId> {
    let pgdata = config.pgdata()?.to_owned();
    let instance_path = config.backup_instance_path();
    let fio = FioRouter::default();

    // INIT -> CONNECTED: open the connection, verify compatibility, and make
    // sure catalog, connection and data directory all describe one cluster.
    let mut db = DbConn::connect(&config.conn)?;
    db.confirm_block_size("block_size", BLCKSZ as u32)?;
    db.confirm_block_size("wal_block_size", XLOG_BLCKSZ as u32)?;
    let from_replica = db.is_in_recovery()?;

    let checksum_version = if db.checksum_enabled()? { 1 } else { 0 };
    if checksum_version != 0 {
        debug!(
            "this PostgreSQL instance was initialized with data block checksums, \
             data block corruption will be detected"
        );
    } else {
        warn!(
            "this PostgreSQL instance was initialized without data block checksums, \
             there is no way to detect data block corruption without them"
        );
    }

    let system_id_conn = db.system_identifier()?;
    let system_id_pgdata = db::local_system_identifier(&pgdata)?;
    if system_id_conn != system_id_pgdata {
        return Err(BackupError::Config(format!(
            "data directory initialized with system id {system_id_pgdata}, \
             but connected instance system id is {system_id_conn}"
        )));
    }
    if config.system_identifier != 0 && system_id_conn != config.system_identifier {
        return Err(BackupError::Config(format!(
            "backup catalog was initialized for system id {}, \
             but connected instance system id is {system_id_conn}",
            config.system_identifier
        )));
    }

    let ptrack_support = db.ptrack_support()?;
    let ptrack_enabled = ptrack_support && db.ptrack_enabled()?;
    if options.mode == BackupMode::Ptrack {
        if !ptrack_support {
            return Err(BackupError::Config(
                "this PostgreSQL instance does not support ptrack".to_string(),
            ));
        }
        if !ptrack_enabled {
            return Err(BackupError::Config("ptrack is disabled".to_string()));
        }
    }

    // The change-tracking extension needs a session-level backup state on
    // the server side, which only the exclusive flavor provides.
    let exclusive = options.mode == BackupMode::Ptrack;

    let start_time = chrono::Utc::now().timestamp();
    let mut current = Backup::new(options.mode, start_time);
    current.status = BackupStatus::Running;
    current.stream = config.stream;
    current.compress_alg = config.compress_alg;
    current.compress_level = config.compress_level;
    current.checksum_version = checksum_version;
    current.from_replica = from_replica;
    current.program_version = crate::PROGRAM_VERSION.to_string();
    current.server_version = db.server_version_str.clone();
    current.primary_conninfo = Some(config.conn.conninfo_string());
    current.external_dir_str = config.external_dirs.clone();

    let external_dirs = config.external_dir_list()?;

    // Create the backup directory, take the lock, and commit RUNNING state.
    catalog::create_backup_dir(&instance_path, &current, &external_dirs)?;
    let _lock = catalog::lock_backup(&instance_path, current.id())?.ok_or_else(|| {
        BackupError::Catalog(format!("cannot lock backup {} directory", current.id()))
    })?;
    catalog::write_backup(&instance_path, &current)?;
    debug!("backup destination is initialized");

    let result = do_backup_instance(
        config,
        &fio,
        &mut db,
        &instance_path,
        &pgdata,
        &external_dirs,
        &mut current,
        &options,
        exclusive,
        checksum_version,
        ptrack_support,
        ptrack_enabled,
        from_replica,
    );

    if let Err(e) = result {
        // The INIT-level cleanup: a RUNNING backup whose session died is
        // marked ERROR with an end time, so enumeration shows the truth.
        if current.status == BackupStatus::Running && current.end_time.is_none() {
            warn!(
                "backup {} is running, setting its status to ERROR",
                current.id()
            );
            current.end_time = Some(chrono::Utc::now().timestamp());
            current.status = BackupStatus::Error;
            if let Err(write_err) = catalog::write_backup(&instance_path, &current) {
                error!("{write_err}");
            }
        }
        return Err(e);
    }

    if !options.no_validate {
        validate::validate_backup(&instance_path, &mut current, config.num_threads)?;
    }

    if current.status.is_complete() {
        info!("backup {} completed", current.id());
        Ok(current.id())
    } else {
        Err(BackupError::Catalog(format!(
            "backup {} failed",
            current.id()
        )))
    }
}

/// CHECKDB: page-by-page scan of the live data files in non-strict mode,
/// reporting corruption and continuing. Returns whether every datafile was
/// valid.
pub fn do_checkdb(config: &InstanceConfig) -> Result<bool> {
    let pgdata = config.pgdata()?.to_owned();
    let fio = FioRouter::default();

    let mut db = DbConn::connect(&config.conn)?;
    db.confirm_block_size("block_size", BLCKSZ as u32)?;
    db.confirm_block_size("wal_block_size", XLOG_BLCKSZ as u32)?;
    let checksum_version = if db.checksum_enabled()? { 1 } else { 0 };

    let system_id_conn = db.system_identifier()?;
    let system_id_pgdata = db::local_system_identifier(&pgdata)?;
    if system_id_conn != system_id_pgdata {
        return Err(BackupError::Config(format!(
            "data directory initialized with system id {system_id_pgdata}, \
             but connected instance system id is {system_id_conn}"
        )));
    }

    let mut files = filelist::list_data_directory(fio.at(Location::DbHost), &pgdata, 0, true, false)?;
    if files.len() < PGDATA_MIN_ENTRIES {
        return Err(BackupError::Config(
            "PGDATA is almost empty, either it was concurrently deleted or \
             this process does not possess sufficient permissions to list PGDATA content"
                .to_string(),
        ));
    }
    files.sort_by(compare_paths);
    filelist::parse_filelist_filenames(&mut files);

    let thread_interrupted = AtomicBool::new(false);
    let ctx = PageCtx {
        fio: &fio,
        mode: BackupMode::Full,
        prev_start_lsn: Lsn::INVALID,
        calg: crate::compress::CompressAlg::None,
        clevel: 1,
        checksum_version,
        ptrack_available: false,
        thread_interrupted: &thread_interrupted,
    };

    info!("start checking data files");
    let all_valid = Mutex::new(true);
    let scan_isok = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..config.num_threads.max(1) {
            let files = &files;
            let ctx = &ctx;
            let all_valid = &all_valid;
            handles.push(scope.spawn(move || -> Result<()> {
                for entry in files.iter() {
                    if !entry.is_datafile || entry.is_cfs {
                        continue;
                    }
                    if !entry.try_claim() {
                        continue;
                    }
                    if !datafile::check_data_file(ctx, entry, checksum_version)? {
                        *all_valid.lock().expect("checkdb flag poisoned") = false;
                    }
                }
                Ok(())
            }));
        }
        let mut ok = true;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("checkdb worker failed: {e}");
                    ok = false;
                }
                Err(_) => {
                    warn!("checkdb worker panicked");
                    ok = false;
                }
            }
        }
        ok
    });
    if !scan_isok {
        return Err(BackupError::Catalog("data files check failed".to_string()));
    }

    let all_valid = *all_valid.lock().expect("checkdb flag poisoned");
    if all_valid {
        info!("data files are valid");
    } else {
        warn!("checkdb failed: some data files are corrupted");
    }
    Ok(all_valid)
}

/// Tablespaces must not live inside user-listed external directories (they
/// are copied through the data-file engine already), and external
/// directories must not nest.
fn check_external_for_tablespaces(
    tablespaces: &[String],
    external_dirs: &[Utf8PathBuf],
) -> Result<()> {
    for tablespace in tablespaces {
        let tablespace = Utf8Path::new(tablespace.trim_end_matches('/'));
        for external in external_dirs {
            if tablespace.starts_with(external) {
                return Err(BackupError::Config(format!(
                    "external directory path \"{external}\" contains tablespace \"{tablespace}\""
                )));
            }
            if external.starts_with(tablespace) {
                warn!(
                    "external directory path \"{external}\" is in tablespace directory \"{tablespace}\""
                );
            }
        }
    }
    for (i, a) in external_dirs.iter().enumerate() {
        for (j, b) in external_dirs.iter().enumerate() {
            if i != j && b.starts_with(a) {
                return Err(BackupError::Config(format!(
                    "external directory path \"{a}\" contains another external directory \"{b}\""
                )));
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn do_backup_instance(
    config: &InstanceConfig,
    fio: &FioRouter,
    db: &mut DbConn,
    instance_path: &Utf8Path,
    pgdata: &Utf8Path,
    external_dirs: &[Utf8PathBuf],
    current: &mut Backup,
    options: &BackupOptions,
    exclusive: bool,
    checksum_version: u32,
    ptrack_support: bool,
    ptrack_enabled: bool,
    from_replica: bool,
) -> Result<()> {
    debug!("database backup start");

    if !external_dirs.is_empty() {
        let tablespaces = db.tablespace_locations()?;
        check_external_for_tablespaces(&tablespaces, external_dirs)?;
    }

    current.tli = db.current_timeline()?;

    // In incremental mode a completed backup on this timeline must exist;
    // its file list feeds the unchanged-file and DELTA decisions.
    let mut prev_backup: Option<Backup> = None;
    let mut prev_filelist: Vec<FileEntry> = Vec::new();
    let mut prev_start_lsn = Lsn::INVALID;
    if current.backup_mode.is_incremental() {
        let backup_list = catalog::get_backup_list(instance_path)?;
        let prev_index = catalog::last_data_backup(&backup_list, current.tli).ok_or_else(|| {
            BackupError::Catalog(
                "valid backup on current timeline is not found, \
                 create new FULL backup before an incremental one"
                    .to_string(),
            )
        })?;
        let prev = backup_list[prev_index].clone();

        let prev_filelist_path = backup_subpath(instance_path, prev.id(), DATABASE_FILE_LIST);
        prev_filelist = filelist::read_filelist(&prev_filelist_path, None)?;
        prev_start_lsn = prev.start_lsn;
        current.parent_backup = Some(prev.id());
        catalog::write_backup(instance_path, current)?;
        prev_backup = Some(prev);
    }

    // A PTRACK increment is only sound if the maps have tracked every change
    // since the previous backup.
    if current.backup_mode == BackupMode::Ptrack {
        let prev = prev_backup.as_ref().expect("incremental mode");
        let ptrack_lsn = db.ptrack_control_lsn()?;
        if !ptrack_lsn.is_valid() || ptrack_lsn > prev.stop_lsn {
            return Err(BackupError::Config(format!(
                "LSN from ptrack_control {ptrack_lsn} differs from stop LSN of previous backup {}, \
                 create new full backup before an incremental one",
                prev.stop_lsn
            )));
        }
    }

    // FULL and PAGE invalidate the maps for the next PTRACK taker.
    if current.backup_mode != BackupMode::Ptrack && ptrack_enabled {
        db.ptrack_clear()?;
    }

    // CONNECTED -> STARTED
    let label = format!("{} with pagebackup", time2iso(current.start_time));
    current.start_lsn = db.start_backup(&label, options.smooth_checkpoint, exclusive)?;
    let mut backup_in_progress = true;

    let arclog_path = config.arclog_path();
    let database_path = backup_path(instance_path, current.id()).join(DATABASE_DIR);
    let stream_wal_path = database_path.join(PG_XLOG_DIR);

    // Everything from here to stop-of-backup runs under the promise that the
    // server is told to stop even if we fail half-way.
    let stop_lsn_shared = Arc::new(AtomicLsn::new(0));
    let thread_interrupted = Arc::new(AtomicBool::new(false));
    let mut stream_handle: Option<std::thread::JoinHandle<Result<Lsn>>> = None;

    let copy_result = (|| -> Result<()> {
        if current.backup_mode == BackupMode::Page && !(from_replica && !exclusive) {
            // a switch makes the segment with our start LSN reach the archive
            db.switch_wal()?;
        }

        let waiter = WalWaiter {
            wal_dir: &arclog_path,
            tli: current.tli,
            seg_size: config.xlog_seg_size,
            timeout: config.archive_timeout,
            from_replica,
            start_lsn: current.start_lsn,
            archive_mode_hint: !config.stream,
        };
        if current.backup_mode == BackupMode::Page {
            // PAGE needs the archived segment itself: the page map is built
            // from archived WAL
            waiter.wait_wal_lsn(current.start_lsn, false)?;
        } else if !config.stream {
            // others only need the previous segment; the current one will
            // follow with stop-of-backup
            waiter.wait_wal_lsn(current.start_lsn, true)?;
        }
        // In stream mode there is nothing to wait for: the stream worker
        // fetches the segment with the start LSN itself.

        if from_replica && exclusive {
            wait_replica_wal_lsn(db, current.start_lsn, true, config.replica_timeout)?;
        }

        if let Some(prev) = &prev_backup {
            if prev.start_lsn > current.start_lsn {
                return Err(BackupError::Catalog(format!(
                    "current START LSN {} is lower than START LSN {} of previous backup {}, \
                     it may indicate that we are trying to backup a PostgreSQL instance from the past",
                    current.start_lsn,
                    prev.start_lsn,
                    prev.id()
                )));
            }
        }
        catalog::write_backup(instance_path, current)?;

        if config.stream {
            let checkpoint_timeout = db.checkpoint_timeout()?;
            let stream_stop_timeout =
                Duration::from_secs(checkpoint_timeout + checkpoint_timeout / 10);

            fio.at(Location::BackupHost)
                .mkdir(&stream_wal_path, DIR_PERMISSION)
                .io_context(|| format!("cannot create directory \"{stream_wal_path}\""))?;

            let args = StreamArgs {
                basedir: stream_wal_path.clone(),
                conn_opts: config.conn.clone(),
                startpos: current.start_lsn,
                tli: current.tli,
                seg_size: config.xlog_seg_size,
                stop_lsn: Arc::clone(&stop_lsn_shared),
                stream_stop_timeout,
                temp_slot: config.temp_slot,
                thread_interrupted: Arc::clone(&thread_interrupted),
            };
            stream_handle = Some(
                std::thread::Builder::new()
                    .name("wal-stream".to_string())
                    .spawn(move || stream::stream_log(args))
                    .io_context(|| "cannot spawn stream worker".to_string())?,
            );
        }

        // STARTED -> LISTED
        let mut files =
            filelist::list_data_directory(fio.at(Location::DbHost), pgdata, 0, true, exclusive)?;
        for (num, external) in external_dirs.iter().enumerate() {
            // external dirs numeration starts with 1; 0 is PGDATA
            let mut external_files = filelist::list_data_directory(
                fio.at(Location::DbHost),
                external,
                num + 1,
                false,
                exclusive,
            )?;
            files.append(&mut external_files);
        }

        if files.len() < PGDATA_MIN_ENTRIES {
            return Err(BackupError::Config(
                "PGDATA is almost empty, either it was concurrently deleted or \
                 this process does not possess sufficient permissions to list PGDATA content"
                    .to_string(),
            ));
        }

        // Sort pathname ascending: intermediate directories have to be
        // created before their contents, and the classification passes and
        // the page-map builders rely on this order.
        files.sort_by(compare_paths);
        filelist::parse_filelist_filenames(&mut files);

        if current.backup_mode.is_incremental() {
            debug!("current_tli: {}", current.tli);
            debug!("prev_backup start_lsn: {prev_start_lsn}");
            debug!("current start_lsn: {}", current.start_lsn);
        }

        // LISTED -> MAPPED
        match current.backup_mode {
            BackupMode::Page => {
                // changed pages are whatever archived WAL since the parent
                // says changed
                let builder = PageMapBuilder::new(&files);
                walscan::extract_page_map(
                    &arclog_path,
                    current.tli,
                    config.xlog_seg_size,
                    prev_start_lsn,
                    current.start_lsn,
                    &builder,
                )?;
            }
            BackupMode::Ptrack => {
                pagemap::make_pagemap_from_ptrack(&files, db)?;
            }
            BackupMode::Full | BackupMode::Delta => {}
        }

        // Mirror the directory skeleton into the backup before any worker
        // needs it.
        for entry in &files {
            if entry.kind != FileKind::Directory {
                continue;
            }
            let dirpath = if entry.external_dir_num != 0 {
                backup_path(instance_path, current.id())
                    .join(EXTERNAL_DIR)
                    .join(format!("externaldir{}", entry.external_dir_num))
                    .join(&entry.rel_path)
            } else {
                database_path.join(&entry.rel_path)
            };
            trace!("create directory \"{}\"", entry.rel_path);
            fio.at(Location::BackupHost)
                .mkdir(&dirpath, DIR_PERMISSION)
                .io_context(|| format!("cannot create directory \"{dirpath}\""))?;
        }

        // Small files first balances the tail of the copy phase.
        files.sort_by(compare_sizes);
        prev_filelist.sort_by(compare_rel_paths);

        // Write the initial catalog entry so a crash from here on leaves a
        // partial but readable backup behind.
        let data_bytes = filelist::write_filelist(instance_path, current, &files)?;
        current.data_bytes = Some(data_bytes);
        catalog::write_backup(instance_path, current)?;

        // MAPPED -> COPYING
        let current_shared = Mutex::new(current.clone());
        let shared = WorkerShared {
            config,
            fio,
            instance_path: instance_path.to_owned(),
            database_path: database_path.clone(),
            external_prefix: backup_path(instance_path, current.id()).join(EXTERNAL_DIR),
            files: &files,
            prev_filelist: &prev_filelist,
            prev_start_lsn,
            current: &current_shared,
            checksum_version,
            ptrack_available: ptrack_support,
            thread_interrupted: &thread_interrupted,
        };

        info!("start transferring data files");
        let backup_isok = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for thread_num in 1..=config.num_threads.max(1) {
                let shared = &shared;
                handles.push(scope.spawn(move || backup_files(shared, thread_num)));
            }
            let mut ok = true;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("worker failed: {e}");
                        ok = false;
                    }
                    Err(_) => {
                        warn!("worker panicked");
                        ok = false;
                    }
                }
            }
            ok
        });
        if !backup_isok {
            return Err(BackupError::Catalog(
                "data files transferring failed".to_string(),
            ));
        }
        info!("data files are transferred");

        // Files that disappeared mid-backup are dropped from the final list.
        files.retain(|f| f.state().write_size != FILE_NOT_FOUND);

        // COPYING -> STOPPED
        let restore_point = format!("pagebackup, backup_id {}", current.id());
        let restore_point = (!from_replica || exclusive).then_some(restore_point.as_str());
        let stop = db::stop_backup(
            db,
            exclusive,
            from_replica,
            config.archive_timeout,
            restore_point,
        )?;
        backup_in_progress = false;
        // make the stream worker's stop predicate live before we block on it
        stop_lsn_shared.store(stop.lsn);

        let wal_dir = if config.stream {
            &stream_wal_path
        } else {
            &arclog_path
        };
        let stop_waiter = WalWaiter {
            wal_dir,
            tli: current.tli,
            seg_size: config.xlog_seg_size,
            timeout: config.archive_timeout,
            from_replica,
            start_lsn: current.start_lsn,
            archive_mode_hint: false,
        };

        // Segment-boundary corner case: a stop LSN with a zero offset points
        // at WAL that will never be written. Substitute the last valid LSN
        // before it.
        let mut stop_lsn = stop.lsn;
        let mut stop_lsn_exists = false;
        if stop.lsn.segment_offset(config.xlog_seg_size) == 0 {
            stop_waiter.wait_wal_lsn(stop.lsn, true)?;
            stop_lsn = walscan::get_last_wal_lsn(
                wal_dir,
                current.start_lsn,
                stop.lsn,
                current.tli,
                true,
                config.xlog_seg_size,
            )?
            .ok_or_else(|| {
                BackupError::Catalog(format!(
                    "cannot find a valid record below stop LSN {}",
                    stop.lsn
                ))
            })?;
            stop_lsn_shared.store(stop_lsn);
            // no further wait is needed for a record we just read
            stop_lsn_exists = true;
        }

        // Non-exclusive stop-backup hands back the label and tablespace map;
        // they become regular members of the backup.
        if let Some(label_content) = &stop.backup_label {
            files.push(write_meta_file(
                fio,
                &database_path,
                "backup_label",
                label_content,
            )?);
        }
        if let Some(map_content) = &stop.tablespace_map {
            files.push(write_meta_file(
                fio,
                &database_path,
                "tablespace_map",
                map_content,
            )?);
        }

        // STOPPED -> FINALIZED
        if let Some(handle) = stream_handle.take() {
            match handle.join() {
                Ok(Ok(stop_stream_lsn)) => {
                    debug!("WAL streaming stopped at {stop_stream_lsn}");
                }
                Ok(Err(e)) => {
                    return Err(BackupError::Protocol(format!("WAL streaming failed: {e}")))
                }
                Err(_) => {
                    return Err(BackupError::Protocol("WAL streaming panicked".to_string()))
                }
            }
        }

        if !stop_lsn_exists {
            stop_lsn = stop_waiter.wait_wal_lsn(stop_lsn, false)?;
        }

        current.tli = db.current_timeline()?;
        current.stop_lsn = stop_lsn;

        debug!("getting the recovery time from WAL");
        match walscan::read_recovery_info(
            wal_dir,
            current.tli,
            config.xlog_seg_size,
            current.start_lsn,
            current.stop_lsn,
        )? {
            Some((recovery_time, recovery_xid)) => {
                current.recovery_time = Some(recovery_time);
                current.recovery_xid = recovery_xid as u64;
            }
            None => {
                debug!("failed to find recovery time in WAL, forced to trust current_timestamp");
                current.recovery_time = Some(stop.recovery_time);
                current.recovery_xid = stop.recovery_xid;
            }
        }

        // Streamed WAL segments become part of the backup's file list.
        if config.stream {
            for dirent in fio
                .at(Location::BackupHost)
                .read_dir(&stream_wal_path)
                .io_context(|| format!("cannot read directory \"{stream_wal_path}\""))?
            {
                if dirent.kind != FileKind::Regular {
                    continue;
                }
                let path = stream_wal_path.join(&dirent.name);
                let st = fio
                    .at(Location::BackupHost)
                    .stat(&path, true)
                    .io_context(|| format!("cannot stat \"{path}\""))?;
                let entry = FileEntry::new(
                    path.clone(),
                    Utf8PathBuf::from(PG_XLOG_DIR).join(&dirent.name),
                    FileKind::Regular,
                    st.mode,
                    st.size,
                    st.mtime,
                    0,
                );
                let crc = file_crc(fio, &path)?;
                {
                    let mut state = entry.state();
                    state.crc = crc;
                    state.read_size = st.size as i64;
                    state.write_size = st.size as i64;
                }
                files.push(entry);
            }
        }

        // Final catalog commit for the data phase.
        let data_bytes = filelist::write_filelist(instance_path, current, &files)?;
        current.data_bytes = Some(data_bytes);

        if !config.stream {
            // archived segments live outside the backup; account for the
            // span we depend on
            let seg_size = config.xlog_seg_size as i64;
            current.wal_bytes = Some(
                seg_size
                    * (current.stop_lsn.0 as i64 / seg_size - current.start_lsn.0 as i64 / seg_size
                        + 1),
            );
        }

        current.end_time = Some(chrono::Utc::now().timestamp());
        current.status = BackupStatus::Done;
        catalog::write_backup(instance_path, current)?;
        Ok(())
    })();

    if let Err(e) = copy_result {
        // STARTED-level cleanup: the server must never be left in backup
        // mode, and the stream worker must not outlive the session.
        thread_interrupted.store(true, Ordering::Relaxed);
        if backup_in_progress {
            warn!("backup in progress, stop backup");
            let _ = db::stop_backup(db, exclusive, from_replica, config.archive_timeout, None);
        }
        if let Some(handle) = stream_handle.take() {
            let _ = handle.join();
        }
        return Err(e);
    }

    Ok(())
}

/// Write backup_label / tablespace_map content into the backup's database
/// directory and produce the file-list entry for it.
fn write_meta_file(
    fio: &FioRouter,
    database_path: &Utf8Path,
    name: &str,
    content: &str,
) -> Result<FileEntry> {
    use std::io::Write;

    let path = database_path.join(name);
    let mut out = fio
        .at(Location::BackupHost)
        .create_write(&path)
        .io_context(|| format!("can't open file \"{path}\""))?;
    out.write_all(content.as_bytes())
        .and_then(|()| out.sync())
        .io_context(|| format!("can't write file \"{path}\""))?;
    drop(out);

    let entry = FileEntry::new(
        path,
        Utf8PathBuf::from(name),
        FileKind::Regular,
        0o600,
        content.len() as u64,
        chrono::Utc::now().timestamp(),
        0,
    );
    {
        let mut state = entry.state();
        state.crc = crc32c_append(0, content.as_bytes());
        state.read_size = content.len() as i64;
        state.write_size = content.len() as i64;
    }
    Ok(entry)
}

fn file_crc(fio: &FioRouter, path: &Utf8Path) -> Result<u32> {
    use std::io::Read;

    let mut input = fio
        .at(Location::BackupHost)
        .open_read(path)
        .io_context(|| format!("cannot open file \"{path}\""))?;
    let mut crc = 0u32;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = input
            .read(&mut buf)
            .io_context(|| format!("cannot read \"{path}\""))?;
        if n == 0 {
            break;
        }
        crc = crc32c_append(crc, &buf[..n]);
    }
    Ok(crc)
}

/// A file worker: claim entries, drive the data-file engine for relation
/// segments and plain copies for everything else. Worker #1 is the lead and
/// periodically checkpoints the catalog entry.
fn backup_files(shared: &WorkerShared<'_>, thread_num: usize) -> Result<()> {
    let config = shared.config;
    let mut ptrack_source = shared
        .ptrack_available
        .then(|| PtrackBlockSource::new(config.conn.clone()));
    let mut last_checkpoint = Instant::now();

    let current_snapshot = shared
        .current
        .lock()
        .expect("current backup mutex poisoned")
        .clone();
    let mode = current_snapshot.backup_mode;
    let parent_start_time = current_snapshot.parent_backup.map(|id| id.0).unwrap_or(0);

    let page_ctx = PageCtx {
        fio: shared.fio,
        mode,
        prev_start_lsn: shared.prev_start_lsn,
        calg: current_snapshot.compress_alg,
        clevel: current_snapshot.compress_level,
        checksum_version: shared.checksum_version,
        ptrack_available: shared.ptrack_available,
        thread_interrupted: shared.thread_interrupted,
    };

    let n_files = shared.files.len();
    for (i, entry) in shared.files.iter().enumerate() {
        if thread_num == 1 && last_checkpoint.elapsed() > FILELIST_CHECKPOINT_INTERVAL {
            // keep the catalog entry readable for whoever looks while we run
            last_checkpoint = Instant::now();
            let data_bytes =
                filelist::write_filelist(&shared.instance_path, &current_snapshot, shared.files)?;
            let mut current = shared.current.lock().expect("current backup mutex poisoned");
            current.data_bytes = Some(data_bytes);
            catalog::write_backup(&shared.instance_path, &current)?;
        }

        if !entry.try_claim() {
            continue;
        }
        crate::check_interrupt(shared.thread_interrupted)?;
        trace!("copying file ({}/{n_files}): \"{}\"", i + 1, entry.path);

        // Re-stat: the listing is minutes old by now.
        let st = match shared.fio.at(Location::DbHost).stat(&entry.path, true) {
            Ok(st) => st,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // deleted by a concurrent postgres transaction
                entry.state().write_size = FILE_NOT_FOUND;
                debug!("file \"{}\" is not found", entry.path);
                continue;
            }
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("can't stat file to backup \"{}\"", entry.path),
                    source: e,
                })
            }
        };

        // directories were created up front
        if st.kind == FileKind::Directory {
            continue;
        }
        if st.kind != FileKind::Regular {
            warn!("unexpected file type {:?} of \"{}\"", st.kind, entry.path);
            continue;
        }

        // Look the file up in the parent backup's list.
        let mut prev_entry: Option<&FileEntry> = None;
        if mode.is_incremental() {
            if let Ok(found) = shared.prev_filelist.binary_search_by(|probe| {
                probe
                    .rel_path
                    .cmp(&entry.rel_path)
                    .then(probe.external_dir_num.cmp(&entry.external_dir_num))
            }) {
                prev_entry = Some(&shared.prev_filelist[found]);
                entry.state().exists_in_prev = true;
            }
        }

        let to_path = if entry.external_dir_num != 0 {
            shared
                .external_prefix
                .join(format!("externaldir{}", entry.external_dir_num))
                .join(&entry.rel_path)
        } else {
            shared.database_path.join(&entry.rel_path)
        };

        if entry.is_datafile && !entry.is_cfs {
            // block by block, through the page engine
            let copied =
                datafile::backup_data_file(&page_ctx, ptrack_source.as_mut(), entry, &to_path, true)?;
            if !copied {
                let mut state = entry.state();
                if state.write_size != FILE_NOT_FOUND {
                    // not copied is not the same as disappeared
                    state.write_size = BYTES_INVALID;
                }
                trace!("file \"{}\" was not copied to backup", entry.path);
                continue;
            }
        } else {
            // Non-data files whose mtime precedes the parent backup and
            // whose CRC matches the parent's entry are recorded but not
            // copied again.
            let mut skip = false;
            if let Some(prev_entry) = prev_entry {
                if st.mtime < parent_start_time {
                    let crc = {
                        let mut input = shared
                            .fio
                            .at(Location::DbHost)
                            .open_read(&entry.path)
                            .io_context(|| format!("cannot open file \"{}\"", entry.path))?;
                        let mut crc = 0u32;
                        let mut buf = vec![0u8; 1024];
                        let mut total: i64 = 0;
                        loop {
                            let n = std::io::Read::read(&mut input, &mut buf)
                                .io_context(|| format!("cannot read \"{}\"", entry.path))?;
                            if n == 0 {
                                break;
                            }
                            crc = crc32c_append(crc, &buf[..n]);
                            total += n as i64;
                        }
                        let mut state = entry.state();
                        state.crc = crc;
                        state.read_size = total;
                        state.write_size = total;
                        crc
                    };
                    if crc == prev_entry.state().crc {
                        skip = true;
                    }
                }
            }

            if !skip
                && !datafile::copy_file(
                    shared.fio,
                    Location::DbHost,
                    Location::BackupHost,
                    entry,
                    &to_path,
                    true,
                )?
            {
                let mut state = entry.state();
                if state.write_size != FILE_NOT_FOUND {
                    state.write_size = BYTES_INVALID;
                }
                trace!("file \"{}\" was not copied to backup", entry.path);
                continue;
            }
        }

        trace!(
            "file \"{}\", copied {} bytes",
            entry.path,
            entry.state().write_size
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_external_for_tablespaces() {
        let externals = vec![Utf8PathBuf::from("/mnt/ext1"), Utf8PathBuf::from("/mnt/ext2")];

        // disjoint paths are fine
        check_external_for_tablespaces(&["/var/tblspc".to_string()], &externals).unwrap();

        // a tablespace inside an external directory is fatal
        assert!(check_external_for_tablespaces(
            &["/mnt/ext1/ts1".to_string()],
            &externals
        )
        .is_err());

        // nested external directories are fatal
        let nested = vec![
            Utf8PathBuf::from("/mnt/ext1"),
            Utf8PathBuf::from("/mnt/ext1/sub"),
        ];
        assert!(check_external_for_tablespaces(&[], &nested).is_err());
    }
}
