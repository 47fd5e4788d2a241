//! Backup validation: recompute file CRCs, re-check every data page, and
//! keep the catalog's status and orphan bookkeeping truthful.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use camino::Utf8Path;
use crc32c::crc32c_append;
use tracing::{info, warn};

use crate::catalog::{
    self, backup_path, backup_subpath, Backup, BackupMode, BackupStatus, ChainState,
    DATABASE_DIR, DATABASE_FILE_LIST, EXTERNAL_DIR,
};
use crate::config::InstanceConfig;
use crate::error::{BackupError, IoResultExt, Result};
use crate::filelist::{self, FileEntry, BYTES_INVALID};
use crate::fio::FileKind;
use crate::{datafile, parse_program_version};

/// Validate one backup's files and flip its status to OK or CORRUPT.
///
/// Returns `Ok(())` even when the backup turns out corrupt; the status
/// carries the verdict. Only infrastructure failures produce errors.
pub fn validate_backup(
    instance_path: &Utf8Path,
    backup: &mut Backup,
    num_threads: usize,
) -> Result<()> {
    if parse_program_version(&backup.program_version) > parse_program_version(crate::PROGRAM_VERSION)
    {
        return Err(BackupError::Config(format!(
            "this binary version is {}, but backup {} version is {}. \
             Forward compatibility is not guaranteed, please upgrade",
            crate::PROGRAM_VERSION,
            backup.id(),
            backup.program_version
        )));
    }

    if backup.status == BackupStatus::Running {
        warn!(
            "backup {} has status {}, change it to ERROR and skip validation",
            backup.id(),
            backup.status
        );
        catalog::write_backup_status(instance_path, backup, BackupStatus::Error)?;
        return Ok(());
    }

    // Revalidation is attempted for DONE, ORPHAN and CORRUPT backups.
    if !matches!(
        backup.status,
        BackupStatus::Ok | BackupStatus::Done | BackupStatus::Orphan | BackupStatus::Corrupt
    ) {
        warn!(
            "backup {} has status {}. Skip validation",
            backup.id(),
            backup.status
        );
        return Ok(());
    }

    if backup.status.is_complete() {
        info!("validating backup {}", backup.id());
    } else {
        info!("revalidating backup {}", backup.id());
    }

    let base_path = backup_path(instance_path, backup.id()).join(DATABASE_DIR);
    let external_prefix = backup_path(instance_path, backup.id()).join(EXTERNAL_DIR);
    let filelist_path = backup_subpath(instance_path, backup.id(), DATABASE_FILE_LIST);

    let mut files = filelist::read_filelist(&filelist_path, None)?;
    // resolve each entry to its location inside this backup
    for entry in &mut files {
        entry.path = if entry.external_dir_num != 0 {
            external_prefix
                .join(format!("externaldir{}", entry.external_dir_num))
                .join(&entry.rel_path)
        } else {
            base_path.join(&entry.rel_path)
        };
    }

    let corrupted = Mutex::new(false);
    let thread_interrupted = AtomicBool::new(false);
    let backup_snapshot = backup.clone();

    let validation_isok = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..num_threads.max(1) {
            let files = &files;
            let corrupted = &corrupted;
            let backup_snapshot = &backup_snapshot;
            let thread_interrupted = &thread_interrupted;
            handles.push(scope.spawn(move || {
                validate_files(files, backup_snapshot, corrupted, thread_interrupted)
            }));
        }
        let mut ok = true;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("validation worker failed: {e}");
                    ok = false;
                }
                Err(_) => {
                    warn!("validation worker panicked");
                    ok = false;
                }
            }
        }
        ok
    });
    if !validation_isok {
        return Err(BackupError::Catalog("data files validation failed".to_string()));
    }

    let corrupted = *corrupted.lock().expect("corrupted flag poisoned");
    catalog::write_backup_status(
        instance_path,
        backup,
        if corrupted {
            BackupStatus::Corrupt
        } else {
            BackupStatus::Ok
        },
    )?;

    if corrupted {
        warn!("backup {} data files are corrupted", backup.id());
    } else {
        info!("backup {} data files are valid", backup.id());
    }
    Ok(())
}

/// One validation worker: claims entries off the shared list. A file that
/// fails any check raises the shared corrupted flag with a WARNING; only
/// infrastructure trouble becomes an error.
fn validate_files(
    files: &[FileEntry],
    backup: &Backup,
    corrupted: &Mutex<bool>,
    thread_interrupted: &AtomicBool,
) -> Result<()> {
    let mark_corrupted = || *corrupted.lock().expect("corrupted flag poisoned") = true;

    for entry in files {
        crate::check_interrupt(thread_interrupted)?;

        if entry.kind != FileKind::Regular {
            continue;
        }
        // cfs files carry no page-level checksums of our own making
        if entry.is_cfs {
            continue;
        }
        if !entry.try_claim() {
            continue;
        }

        let (write_size, expected_crc) = {
            let state = entry.state();
            (state.write_size, state.crc)
        };

        // Unchanged files of an incremental backup carry no data here.
        if write_size == BYTES_INVALID {
            if backup.backup_mode == BackupMode::Full {
                warn!(
                    "backup file \"{}\" has invalid size, possible metadata corruption",
                    entry.path
                );
                mark_corrupted();
                break;
            }
            continue;
        }

        let st = match std::fs::metadata(&entry.path) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("backup file \"{}\" is not found", entry.path);
                mark_corrupted();
                break;
            }
            Err(e) => {
                warn!("cannot stat backup file \"{}\": {e}", entry.path);
                mark_corrupted();
                break;
            }
        };

        if write_size != st.len() as i64 {
            warn!(
                "invalid size of backup file \"{}\": {}. Expected {write_size}",
                entry.path,
                st.len()
            );
            mark_corrupted();
            break;
        }

        if entry.is_datafile {
            // page by page: headers, checksums, CRC of the frame stream
            let valid = datafile::check_file_pages(
                entry,
                &entry.path,
                backup.stop_lsn,
                backup.checksum_version,
                &backup.program_version,
                thread_interrupted,
            )?;
            if !valid {
                mark_corrupted();
            }
        } else {
            let crc = whole_file_crc(&entry.path)?;
            if crc != expected_crc {
                warn!(
                    "invalid CRC of backup file \"{}\": {crc:X}. Expected {expected_crc:X}",
                    entry.path
                );
                mark_corrupted();
            }
        }
    }
    Ok(())
}

fn whole_file_crc(path: &Utf8Path) -> Result<u32> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .io_context(|| format!("cannot open file \"{path}\""))?;
    let mut crc = 0u32;
    let mut buf = vec![0u8; 1024];
    loop {
        let n = file
            .read(&mut buf)
            .io_context(|| format!("cannot read \"{path}\""))?;
        if n == 0 {
            break;
        }
        crc = crc32c_append(crc, &buf[..n]);
    }
    Ok(crc)
}

/// Validate every backup of the instance, newest first: chain checks,
/// orphan propagation, and a revalidation chance for orphans whose chain
/// healed. Returns true when everything checked out.
pub fn validate_instance(config: &InstanceConfig) -> Result<bool> {
    let instance_path = config.backup_instance_path();
    info!("validate backups of the instance '{}'", config.instance_name);

    let mut corrupted_found = false;
    let mut skipped_due_to_lock = false;

    let mut backups = catalog::get_backup_list(&instance_path)?;

    for i in 0..backups.len() {
        // Find the ancestry for incremental backups and orphan the ones
        // whose chain is broken or passes through an invalid backup.
        if backups[i].backup_mode.is_incremental() {
            match catalog::scan_parent_chain(&backups, i) {
                ChainState::Broken { oldest } => {
                    corrupted_found = true;
                    let missing = backups[oldest]
                        .parent_backup
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    if backups[i].status.is_complete() {
                        let mut backup = backups[i].clone();
                        catalog::write_backup_status(
                            &instance_path,
                            &mut backup,
                            BackupStatus::Orphan,
                        )?;
                        backups[i].status = BackupStatus::Orphan;
                        warn!(
                            "backup {} is orphaned because its parent {missing} is missing",
                            backups[i].id()
                        );
                    } else {
                        warn!(
                            "backup {} has missing parent {missing}",
                            backups[i].id()
                        );
                    }
                    continue;
                }
                ChainState::IntactInvalid { oldest_invalid } => {
                    if oldest_invalid != i {
                        corrupted_found = true;
                        if backups[i].status.is_complete() {
                            let mut backup = backups[i].clone();
                            catalog::write_backup_status(
                                &instance_path,
                                &mut backup,
                                BackupStatus::Orphan,
                            )?;
                            backups[i].status = BackupStatus::Orphan;
                            warn!(
                                "backup {} is orphaned because its parent {} has status: {}",
                                backups[i].id(),
                                backups[oldest_invalid].id(),
                                backups[oldest_invalid].status
                            );
                        } else {
                            warn!(
                                "backup {} has parent {} with status: {}",
                                backups[i].id(),
                                backups[oldest_invalid].id(),
                                backups[oldest_invalid].status
                            );
                        }
                        continue;
                    }
                    // The oldest invalid backup is this one: it gets its
                    // revalidation chance below.
                    if catalog::find_parent_full(&backups, i).is_none() {
                        return Err(BackupError::Catalog(format!(
                            "parent full backup for the given backup {} was not found",
                            backups[i].id()
                        )));
                    }
                }
                ChainState::Intact { .. } => {}
            }
        }

        // Do not interrupt the whole pass over one busy backup.
        let lock = catalog::lock_backup(&instance_path, backups[i].id())?;
        let Some(_lock) = lock else {
            warn!(
                "cannot lock backup {} directory, skip validation",
                backups[i].id()
            );
            skipped_due_to_lock = true;
            continue;
        };

        let mut backup = backups[i].clone();
        validate_backup(&instance_path, &mut backup, config.num_threads)?;
        backups[i].status = backup.status;

        if backups[i].status != BackupStatus::Ok {
            corrupted_found = true;
            // Mark every descendant of the corrupted backup as orphan.
            let corrupt_time = backups[i].start_time;
            for j in (0..i).rev() {
                if catalog::is_parent(&backups, corrupt_time, j, false)
                    && backups[j].status.is_complete()
                {
                    let mut descendant = backups[j].clone();
                    catalog::write_backup_status(
                        &instance_path,
                        &mut descendant,
                        BackupStatus::Orphan,
                    )?;
                    backups[j].status = BackupStatus::Orphan;
                    warn!(
                        "backup {} is orphaned because its parent {} has status: {}",
                        backups[j].id(),
                        backups[i].id(),
                        backups[i].status
                    );
                }
            }
        } else {
            // A healthy backup gives its orphaned descendants with an
            // otherwise intact chain another chance.
            let healthy_time = backups[i].start_time;
            for j in (0..i).rev() {
                if !catalog::is_parent(&backups, healthy_time, j, false) {
                    continue;
                }
                let ChainState::IntactInvalid { oldest_invalid } =
                    catalog::scan_parent_chain(&backups, j)
                else {
                    continue;
                };
                // revalidation makes sense only when this backup is the
                // oldest invalid link of its own chain
                if oldest_invalid != j || backups[j].status != BackupStatus::Orphan {
                    continue;
                }

                let Some(_lock) = catalog::lock_backup(&instance_path, backups[j].id())? else {
                    warn!(
                        "cannot lock backup {} directory, skip validation",
                        backups[j].id()
                    );
                    skipped_due_to_lock = true;
                    continue;
                };
                let mut orphan = backups[j].clone();
                validate_backup(&instance_path, &mut orphan, config.num_threads)?;
                backups[j].status = orphan.status;
                if backups[j].status != BackupStatus::Ok {
                    corrupted_found = true;
                }
            }
        }
    }

    if skipped_due_to_lock {
        warn!("some backups weren't locked and they were skipped");
    }
    if corrupted_found {
        warn!("some backups are not valid");
    } else if !skipped_due_to_lock {
        info!("all backups are valid");
    }
    Ok(!corrupted_found && !skipped_due_to_lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{write_backup, BackupId};
    use crate::compress::CompressAlg;
    use crate::datafile::PageCtx;
    use crate::fio::FioRouter;
    use camino::Utf8PathBuf;
    use utils::lsn::Lsn;

    /// Lay down a minimal real backup: one datafile through the page engine,
    /// one plain file, a written file list and control file.
    fn make_backup(instance_path: &Utf8Path, id: i64) -> Backup {
        let mut backup = Backup::new(BackupMode::Full, id);
        backup.status = BackupStatus::Done;
        backup.checksum_version = 1;
        backup.stop_lsn = Lsn(0x10000);
        backup.program_version = crate::PROGRAM_VERSION.to_string();

        let backup_dir = backup_path(instance_path, backup.id());
        let database_dir = backup_dir.join(DATABASE_DIR);
        std::fs::create_dir_all(database_dir.join("base/1")).unwrap();

        // source relation with one valid page
        let src_dir = camino_tempfile::tempdir().unwrap();
        let src = src_dir.path().join("123");
        let mut page = vec![0u8; postgres_ffi::BLCKSZ as usize];
        postgres_ffi::page_set_lsn(&mut page, Lsn(0x1000));
        page[12..14].copy_from_slice(&24u16.to_le_bytes());
        page[14..16].copy_from_slice(&postgres_ffi::BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&postgres_ffi::BLCKSZ.to_le_bytes());
        page[18..20].copy_from_slice(&(postgres_ffi::BLCKSZ | 4).to_le_bytes());
        let checksum = postgres_ffi::pg_checksum_page(&page, 0);
        postgres_ffi::page_set_checksum(&mut page, checksum);
        std::fs::write(&src, &page).unwrap();

        let mut datafile_entry = FileEntry::new(
            src.clone(),
            Utf8PathBuf::from("base/1/123"),
            FileKind::Regular,
            0o600,
            postgres_ffi::BLCKSZ as u64,
            0,
            0,
        );
        datafile_entry.is_datafile = true;
        datafile_entry.rel_oid = 123;

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let ctx = PageCtx {
            fio: &fio,
            mode: BackupMode::Full,
            prev_start_lsn: Lsn::INVALID,
            calg: CompressAlg::None,
            clevel: 1,
            checksum_version: 1,
            ptrack_available: false,
            thread_interrupted: &interrupted,
        };
        assert!(datafile::backup_data_file(
            &ctx,
            None,
            &datafile_entry,
            &database_dir.join("base/1/123"),
            false,
        )
        .unwrap());

        // one plain file
        let plain = FileEntry::new(
            database_dir.join("PG_VERSION"),
            Utf8PathBuf::from("PG_VERSION"),
            FileKind::Regular,
            0o600,
            3,
            0,
            0,
        );
        std::fs::write(database_dir.join("PG_VERSION"), b"14\n").unwrap();
        {
            let mut state = plain.state();
            state.write_size = 3;
            state.read_size = 3;
            state.crc = crc32c_append(0, b"14\n");
        }

        let files = vec![datafile_entry, plain];
        filelist::write_filelist(instance_path, &backup, &files).unwrap();
        write_backup(instance_path, &backup).unwrap();
        backup
    }

    #[test]
    fn test_validate_good_backup() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut backup = make_backup(dir.path(), 5000);

        validate_backup(dir.path(), &mut backup, 2).unwrap();
        assert_eq!(backup.status, BackupStatus::Ok);

        // and the on-disk status agrees
        let on_disk = catalog::read_backup(dir.path(), backup.id()).unwrap();
        assert_eq!(on_disk.status, BackupStatus::Ok);
    }

    #[test]
    fn test_validate_detects_modified_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut backup = make_backup(dir.path(), 5001);

        // corrupt the plain file after the CRC was recorded
        let victim = backup_path(dir.path(), backup.id())
            .join(DATABASE_DIR)
            .join("PG_VERSION");
        std::fs::write(&victim, b"15\n").unwrap();

        validate_backup(dir.path(), &mut backup, 1).unwrap();
        assert_eq!(backup.status, BackupStatus::Corrupt);
    }

    #[test]
    fn test_validate_running_backup_becomes_error() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut backup = make_backup(dir.path(), 5002);
        backup.status = BackupStatus::Running;
        write_backup(dir.path(), &backup).unwrap();

        validate_backup(dir.path(), &mut backup, 1).unwrap();
        assert_eq!(backup.status, BackupStatus::Error);
    }

    #[test]
    fn test_instance_validation_orphans_broken_chains() {
        // layout: <backup_path>/backups/<instance>/<backup-id>
        let root = camino_tempfile::tempdir().unwrap();
        let config: InstanceConfig = toml::from_str(&format!(
            "backup_path = \"{}\"\ninstance_name = \"main\"",
            root.path()
        ))
        .unwrap();
        let instance_path = config.backup_instance_path();
        std::fs::create_dir_all(&instance_path).unwrap();

        // a good FULL backup plus a DELTA whose parent does not exist
        let full = make_backup(&instance_path, 6000);
        let mut orphan = Backup::new(BackupMode::Delta, 7000);
        orphan.status = BackupStatus::Ok;
        orphan.program_version = crate::PROGRAM_VERSION.to_string();
        orphan.parent_backup = Some(BackupId(6999));
        std::fs::create_dir_all(backup_path(&instance_path, orphan.id())).unwrap();
        write_backup(&instance_path, &orphan).unwrap();
        filelist::write_filelist(&instance_path, &orphan, &[]).unwrap();

        let all_valid = validate_instance(&config).unwrap();
        assert!(!all_valid);

        // the broken child is orphaned, the intact FULL validated OK
        let on_disk = catalog::read_backup(&instance_path, orphan.id()).unwrap();
        assert_eq!(on_disk.status, BackupStatus::Orphan);
        let on_disk = catalog::read_backup(&instance_path, full.id()).unwrap();
        assert_eq!(on_disk.status, BackupStatus::Ok);
    }
}
