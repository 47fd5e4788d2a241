//! The page-level data-file engine: read pages with retry under torn-write
//! conditions, verify headers and checksums, compress, and frame them into
//! the backup's on-disk layout - plus the restore-side inverse and the
//! page-by-page validation used by validate/checkdb.
//!
//! On-disk frame: `{u32 block; i32 compressed_size}` little-endian, followed
//! by `MAXALIGN(compressed_size)` payload bytes. `compressed_size` equal to
//! the page size means the payload is stored raw.

use std::io::{Seek, Write};
use std::sync::atomic::AtomicBool;

use camino::Utf8Path;
use crc32c::crc32c_append;
use postgres_ffi::{
    page_get_checksum, page_get_lsn, page_header_is_valid, page_is_zeroed, page_set_checksum,
    pg_checksum_page, BLCKSZ, RELSEG_SIZE,
};
use tracing::{debug, trace, warn};
use utils::lsn::Lsn;

use crate::catalog::{BackupMode, FILE_PERMISSION};
use crate::compress::{do_compress, do_decompress, page_may_be_compressed, CompressAlg};
use crate::db::PtrackBlockSource;
use crate::error::{BackupError, IoResultExt, Result};
use crate::filelist::{FileEntry, FILE_NOT_FOUND};
use crate::fio::{FioRouter, Location, ReadableFile, UpdatableFile, WritableFile};

/// `compressed_size` sentinel: the end-of-file truncation point. This is the
/// only negative value that appears on disk; skipped and corrupt pages are
/// expressed through [`PreparedPage`] and never persisted.
pub const PAGE_IS_TRUNCATED: i32 = -2;

/// How many times a block is reread before it is declared corrupt. The
/// server may be mid-flush, so the first reads of a hot page can be torn.
pub const PAGE_READ_ATTEMPTS: u32 = 100;

pub const BACKUP_PAGE_HEADER_SIZE: usize = 8;

fn maxalign(len: usize) -> usize {
    (len + 7) & !7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPageHeader {
    pub block: u32,
    pub compressed_size: i32,
}

impl BackupPageHeader {
    pub fn to_bytes(self) -> [u8; BACKUP_PAGE_HEADER_SIZE] {
        let mut buf = [0u8; BACKUP_PAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.block.to_le_bytes());
        buf[4..8].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> BackupPageHeader {
        BackupPageHeader {
            block: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            compressed_size: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// Shared, read-only inputs of the per-file engine.
pub struct PageCtx<'a> {
    pub fio: &'a FioRouter,
    pub mode: BackupMode,
    /// Parent backup's start LSN; `INVALID` for FULL.
    pub prev_start_lsn: Lsn,
    pub calg: CompressAlg,
    pub clevel: u32,
    pub checksum_version: u32,
    /// Whether the change-tracking extension can serve single blocks.
    pub ptrack_available: bool,
    pub thread_interrupted: &'a AtomicBool,
}

enum ReadOutcome {
    /// Zero bytes at the offset: the file was truncated underneath us.
    Truncated,
    Valid { lsn: Lsn },
    Invalid,
}

/// Read one page directly from disk and check it syntactically.
fn read_page_from_file(
    reader: &mut dyn crate::fio::ReadableFile,
    entry: &FileEntry,
    blknum: u32,
    page: &mut [u8],
    checksum_version: u32,
) -> Result<ReadOutcome> {
    let offset = blknum as u64 * BLCKSZ as u64;
    let read_len = reader
        .read_at(page, offset)
        .io_context(|| format!("cannot read block {blknum} of \"{}\"", entry.path))?;

    if read_len != BLCKSZ as usize {
        // The block could have been truncated. It is fine.
        if read_len == 0 {
            debug!("file {}, block {blknum}, file was truncated", entry.path);
            return Ok(ReadOutcome::Truncated);
        }
        warn!(
            "file: {}, block {blknum}, expected block size {BLCKSZ}, but read {read_len}, try again",
            entry.path
        );
        return Ok(ReadOutcome::Invalid);
    }

    // A page with a broken header may simply be all-zeros, which is a valid
    // state; otherwise we may have caught a partly flushed page and should
    // reread it.
    if !page_header_is_valid(page) {
        if page_is_zeroed(page) {
            debug!("file: {} blknum {blknum}, empty page", entry.path);
            return Ok(ReadOutcome::Valid { lsn: Lsn::INVALID });
        }
        debug!(
            "file: {} blknum {blknum} have wrong page header, try again",
            entry.path
        );
        return Ok(ReadOutcome::Invalid);
    }

    if checksum_version != 0 {
        let blkno = entry.segno * RELSEG_SIZE + blknum;
        if pg_checksum_page(page, blkno) != page_get_checksum(page) {
            debug!(
                "file: {} blknum {blknum} have wrong checksum, try again",
                entry.path
            );
            return Ok(ReadOutcome::Invalid);
        }
    }

    Ok(ReadOutcome::Valid {
        lsn: page_get_lsn(page),
    })
}

enum PreparedPage {
    Copy,
    Truncated,
    Skipped,
    /// Non-strict mode only; the scan continues.
    Corrupted,
}

/// Retrieve a page taking the backup mode into account. In strict mode a
/// page that stays invalid after the retries is fatal unless the
/// change-tracking extension can hand us a clean copy; in non-strict mode
/// (checkdb) it is reported and the scan continues - the extension is not
/// consulted.
#[allow(clippy::too_many_arguments)]
fn prepare_page(
    ctx: &PageCtx,
    ptrack: Option<&mut PtrackBlockSource>,
    entry: &FileEntry,
    reader: &mut dyn crate::fio::ReadableFile,
    blknum: u32,
    page: &mut [u8],
    strict: bool,
    n_skipped: &mut u32,
) -> Result<PreparedPage> {
    let mut page_lsn = Lsn::INVALID;
    let mut page_is_valid = false;
    let mut page_is_truncated = false;
    let absolute_blknum = entry.segno * RELSEG_SIZE + blknum;

    crate::check_interrupt(ctx.thread_interrupted)?;

    let fetch_via_ptrack = ctx.ptrack_available && strict;

    if ctx.mode != BackupMode::Ptrack {
        let mut try_again = PAGE_READ_ATTEMPTS;
        while !page_is_valid && try_again > 0 {
            let result = read_page_from_file(reader, entry, blknum, page, ctx.checksum_version)?;
            try_again -= 1;

            match result {
                ReadOutcome::Truncated => {
                    // the page is absent; nothing to reread or validate
                    page_is_truncated = true;
                    page_is_valid = true;
                }
                ReadOutcome::Valid { lsn } => {
                    page_lsn = lsn;
                    page_is_valid = true;
                }
                ReadOutcome::Invalid => {
                    // with the extension available there is no point in
                    // rereading the block 99 times
                    if fetch_via_ptrack {
                        warn!(
                            "file {}, block {blknum}, try to fetch via SQL",
                            entry.path
                        );
                        break;
                    }
                }
            }
        }

        if !page_is_valid && !fetch_via_ptrack {
            warn!("CORRUPTION in file {}, block {blknum}", entry.path);
        }
        if !page_is_valid && strict && !ctx.ptrack_available {
            return Err(BackupError::Page(format!(
                "data file corruption in \"{}\", block {blknum}, canceling backup",
                entry.path
            )));
        }
        // Checkdb does not go further.
        if !strict {
            return Ok(if page_is_valid {
                PreparedPage::Copy
            } else {
                PreparedPage::Corrupted
            });
        }
    }

    if ctx.mode == BackupMode::Ptrack || (!page_is_valid && ctx.ptrack_available) {
        let source = ptrack.ok_or_else(|| {
            BackupError::Page(format!(
                "no block source for \"{}\", block {blknum}",
                entry.path
            ))
        })?;
        match source.get_block(entry.db_oid, entry.tblspc_oid, entry.rel_oid, absolute_blknum)? {
            None => {
                page_is_truncated = true;
            }
            Some(block) if block.len() != BLCKSZ as usize => {
                return Err(BackupError::Page(format!(
                    "file: {}, block {absolute_blknum}, expected block size {BLCKSZ}, but read {}",
                    entry.path,
                    block.len()
                )));
            }
            Some(block) => {
                page.copy_from_slice(&block);
                // the checksum is outdated in a block served from shared
                // buffers; recompute before it is framed
                if ctx.checksum_version != 0 {
                    let checksum = pg_checksum_page(page, absolute_blknum);
                    page_set_checksum(page, checksum);
                }
                page_lsn = page_get_lsn(page);
                if ctx.mode == BackupMode::Delta
                    && entry.state().exists_in_prev
                    && !page_header_is_valid(page)
                    && !page_is_zeroed(page)
                {
                    return Err(BackupError::Page(format!(
                        "cannot parse page after fetching it via the change-tracking extension: \"{}\", block {blknum}",
                        entry.path
                    )));
                }
            }
        }
    }

    // Nullified pages must be copied by DELTA backup, just to be safe.
    if ctx.mode == BackupMode::Delta
        && entry.state().exists_in_prev
        && !page_is_truncated
        && page_lsn.is_valid()
        && page_lsn < ctx.prev_start_lsn
    {
        trace!("skipping blknum: {blknum} in file: {}", entry.path);
        *n_skipped += 1;
        return Ok(PreparedPage::Skipped);
    }

    if page_is_truncated {
        return Ok(PreparedPage::Truncated);
    }
    Ok(PreparedPage::Copy)
}

struct FrameWriter<'a> {
    out: Box<dyn crate::fio::WritableFile>,
    path: &'a Utf8Path,
    crc: u32,
    write_size: i64,
}

impl<'a> FrameWriter<'a> {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.crc = crc32c_append(self.crc, buf);
        self.write_size += buf.len() as i64;
        self.out
            .write_all(buf)
            .io_context(|| format!("cannot write backup file \"{}\"", self.path))
    }
}

/// Frame one prepared page: `{BackupPageHeader, compressed-or-raw payload}`
/// aligned to the next machine word, CRC accumulated over the exact bytes
/// written. On compression failure the raw page is stored with
/// `compressed_size` set to the page size.
fn compress_and_backup_page(
    writer: &mut FrameWriter,
    entry: &FileEntry,
    blknum: u32,
    state: &PreparedPage,
    page: &[u8],
    calg: CompressAlg,
    clevel: u32,
) -> Result<()> {
    if matches!(state, PreparedPage::Skipped) {
        return Ok(());
    }

    if matches!(state, PreparedPage::Truncated) {
        // write only the header, so restore knows where to truncate
        let header = BackupPageHeader {
            block: blknum,
            compressed_size: PAGE_IS_TRUNCATED,
        };
        return writer.write_all(&header.to_bytes());
    }

    let compressed = match calg {
        CompressAlg::None => None,
        _ => match do_compress(calg, clevel, page) {
            Ok(buf) if buf.len() < BLCKSZ as usize => Some(buf),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "an error occurred during compressing block {blknum} of file \"{}\": {e}",
                    entry.path
                );
                None
            }
        },
    };

    match compressed {
        Some(mut payload) => {
            let header = BackupPageHeader {
                block: blknum,
                compressed_size: payload.len() as i32,
            };
            payload.resize(maxalign(payload.len()), 0);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&payload)
        }
        None => {
            // raw page; a size equal to BLCKSZ marks it uncompressed
            let header = BackupPageHeader {
                block: blknum,
                compressed_size: BLCKSZ as i32,
            };
            writer.write_all(&header.to_bytes())?;
            writer.write_all(page)
        }
    }
}

/// Copy a data file into the backup, page by page. Returns false when the
/// file was not copied: unchanged in an incremental backup, deleted by a
/// concurrent transaction (`FILE_NOT_FOUND` is recorded), or empty after
/// skipping every block.
pub fn backup_data_file(
    ctx: &PageCtx,
    mut ptrack: Option<&mut PtrackBlockSource>,
    entry: &FileEntry,
    to_path: &Utf8Path,
    missing_ok: bool,
) -> Result<bool> {
    // Skip unchanged files, but only if they exist in the previous backup:
    // null-sized files are not tracked by the page map and always look
    // unchanged.
    if matches!(ctx.mode, BackupMode::Page | BackupMode::Ptrack) {
        let state = entry.state();
        let map_empty = state.pagemap.as_ref().map_or(true, |m| m.is_empty());
        if map_empty && state.exists_in_prev && !state.pagemap_isabsent {
            trace!("skipping the unchanged file: {}", entry.path);
            return Ok(false);
        }
    }

    let source = ctx.fio.at(Location::DbHost);
    let mut reader = match source.open_read(&entry.path) {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // deleted by a concurrent postgres transaction
            if missing_ok {
                debug!("file \"{}\" is not found", entry.path);
                entry.state().write_size = FILE_NOT_FOUND;
                return Ok(false);
            }
            return Err(BackupError::Io {
                context: format!("file \"{}\" is not found", entry.path),
                source: e,
            });
        }
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot open file \"{}\"", entry.path),
                source: e,
            })
        }
    };

    if entry.size % BLCKSZ as u64 != 0 {
        warn!("file: {}, invalid file size {}", entry.path, entry.size);
    }
    // Normal situation: the size may have changed since we listed the file.
    let nblocks = (entry.size / BLCKSZ as u64) as u32;

    let out = ctx
        .fio
        .at(Location::BackupHost)
        .create_write(to_path)
        .io_context(|| format!("cannot open backup file \"{to_path}\""))?;
    let mut writer = FrameWriter {
        out,
        path: to_path,
        crc: 0,
        write_size: 0,
    };

    let mut n_blocks_read: u32 = 0;
    let mut n_blocks_skipped: u32 = 0;
    let mut read_size: i64 = 0;
    let mut page = vec![0u8; BLCKSZ as usize];

    let pagemap = {
        let state = entry.state();
        let use_pagemap = state
            .pagemap
            .as_ref()
            .map_or(false, |m| !m.is_empty())
            && !state.pagemap_isabsent
            && state.exists_in_prev;
        if use_pagemap {
            state.pagemap.clone()
        } else {
            None
        }
    };

    let blocks: Vec<u32> = match &pagemap {
        // only the blocks listed in the page map (PAGE and PTRACK)
        Some(map) => map.iter().collect(),
        // every block of the file (FULL and DELTA, or a missing map)
        None => (0..nblocks).collect(),
    };

    for blknum in blocks {
        let prepared = prepare_page(
            ctx,
            ptrack.as_deref_mut(),
            entry,
            reader.as_mut(),
            blknum,
            &mut page,
            true,
            &mut n_blocks_skipped,
        )?;
        if matches!(prepared, PreparedPage::Copy) {
            read_size += BLCKSZ as i64;
        }
        compress_and_backup_page(&mut writer, entry, blknum, &prepared, &page, ctx.calg, ctx.clevel)?;
        n_blocks_read += 1;
        if matches!(prepared, PreparedPage::Truncated) {
            break;
        }
    }

    writer
        .out
        .sync()
        .io_context(|| format!("cannot write backup file \"{to_path}\""))?;
    let crc = writer.crc;
    let write_size = writer.write_size;
    drop(writer);

    ctx.fio
        .at(Location::BackupHost)
        .chmod(to_path, FILE_PERMISSION)
        .io_context(|| format!("cannot change mode of \"{to_path}\""))?;

    // An empty incremental copy would leave a zero-byte placeholder; remove
    // it instead.
    if n_blocks_read != 0 && n_blocks_read == n_blocks_skipped {
        ctx.fio
            .at(Location::BackupHost)
            .unlink(to_path)
            .io_context(|| format!("cannot remove file \"{to_path}\""))?;
        return Ok(false);
    }

    let mut state = entry.state();
    state.crc = crc;
    state.write_size = write_size;
    state.read_size = read_size;
    state.compress_alg = ctx.calg;
    if ctx.mode == BackupMode::Delta {
        state.n_blocks = Some(n_blocks_read);
    }
    Ok(true)
}

fn read_exact_or_eof(
    reader: &mut dyn std::io::Read,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Restore one data file: iterate the frames, seek to the block's position,
/// decompress when indicated, write. A truncation sentinel - or, for DELTA,
/// a recorded final block count shorter than the target - ends with an
/// ftruncate.
pub fn restore_data_file(
    fio: &FioRouter,
    entry: &FileEntry,
    from_path: &Utf8Path,
    to_path: &Utf8Path,
    allow_truncate: bool,
    write_header: bool,
    backup_version: &str,
) -> Result<()> {
    let state_snapshot = entry.state().clone();

    // BYTES_INVALID means the file did not change; only legal when restoring
    // on top of an earlier increment.
    if state_snapshot.write_size == crate::filelist::BYTES_INVALID {
        return Ok(());
    }

    let mut input = fio
        .at(Location::BackupHost)
        .open_read(from_path)
        .io_context(|| format!("cannot open backup file \"{from_path}\""))?;
    let mut out = fio
        .at(Location::DbHost)
        .open_update(to_path)
        .io_context(|| format!("cannot open restore target file \"{to_path}\""))?;

    let frame_size = if write_header {
        BLCKSZ as u64 + BACKUP_PAGE_HEADER_SIZE as u64
    } else {
        BLCKSZ as u64
    };

    let mut blknum: u32 = 0;
    let mut truncate_from: Option<u32> = None;

    loop {
        // DELTA knows the exact file length at backup time; do not restore
        // past it
        if let Some(n_blocks) = state_snapshot.n_blocks {
            if blknum + 1 > n_blocks && truncate_from.is_none() {
                truncate_from = Some(blknum);
                break;
            }
        }

        let mut header_buf = [0u8; BACKUP_PAGE_HEADER_SIZE];
        let read_len = read_exact_or_eof(&mut input, &mut header_buf)
            .io_context(|| format!("cannot read header of block {blknum} of \"{from_path}\""))?;
        if read_len == 0 {
            break; // EOF found
        }
        if read_len != BACKUP_PAGE_HEADER_SIZE {
            return Err(BackupError::Page(format!(
                "odd size page found at block {blknum} of \"{from_path}\""
            )));
        }
        let header = BackupPageHeader::from_bytes(&header_buf);

        if header.block == 0 && header.compressed_size == 0 {
            trace!("skip empty block of \"{from_path}\"");
            continue;
        }
        if header.block < blknum {
            return Err(BackupError::Page(format!(
                "backup is broken at block {blknum} of \"{from_path}\""
            )));
        }
        blknum = header.block;

        if header.compressed_size == PAGE_IS_TRUNCATED {
            // the file must become exactly this short
            truncate_from = Some(blknum);
            break;
        }
        if header.compressed_size < 0 || header.compressed_size > BLCKSZ as i32 {
            return Err(BackupError::Page(format!(
                "invalid compressed size {} at block {blknum} of \"{from_path}\"",
                header.compressed_size
            )));
        }

        let payload_len = maxalign(header.compressed_size as usize);
        let mut payload = vec![0u8; payload_len];
        let read_len = read_exact_or_eof(&mut input, &mut payload)
            .io_context(|| format!("cannot read block {blknum} of \"{from_path}\""))?;
        if read_len != payload_len {
            return Err(BackupError::Page(format!(
                "cannot read block {blknum} of \"{from_path}\" read {read_len} of {payload_len}"
            )));
        }
        payload.truncate(header.compressed_size as usize);

        // A page smaller than BLCKSZ is compressed; one exactly BLCKSZ may
        // still be, for backups from versions below 2.0.23.
        let page = if header.compressed_size != BLCKSZ as i32
            || page_may_be_compressed(&payload, state_snapshot.compress_alg, backup_version)
        {
            let uncompressed =
                do_decompress(state_snapshot.compress_alg, &payload, BLCKSZ as usize).map_err(
                    |e| {
                        BackupError::Page(format!(
                            "an error occurred during decompressing block {blknum} of file \"{from_path}\": {e}"
                        ))
                    },
                )?;
            if uncompressed.len() != BLCKSZ as usize {
                return Err(BackupError::Page(format!(
                    "page of file \"{from_path}\" uncompressed to {} bytes. != BLCKSZ",
                    uncompressed.len()
                )));
            }
            uncompressed
        } else {
            payload
        };

        let write_pos = blknum as u64 * frame_size;
        out.seek(std::io::SeekFrom::Start(write_pos))
            .io_context(|| format!("cannot seek block {blknum} of \"{to_path}\""))?;
        if write_header {
            // the page is stored uncompressed in a merged intermediate
            let header = BackupPageHeader {
                block: blknum,
                compressed_size: BLCKSZ as i32,
            };
            out.write_all(&header.to_bytes())
                .io_context(|| format!("cannot write header of block {blknum} of \"{to_path}\""))?;
        }
        out.write_all(&page)
            .io_context(|| format!("cannot write block {blknum} of \"{to_path}\""))?;
    }

    // DELTA reads every file whole, so it knows each file's exact size at
    // backup time and the restored file can be cut down to it.
    if allow_truncate && truncate_from.is_none() {
        if let Some(n_blocks) = state_snapshot.n_blocks {
            let st = out
                .stat()
                .io_context(|| format!("cannot stat \"{to_path}\""))?;
            if st.size > n_blocks as u64 * BLCKSZ as u64 {
                truncate_from = Some(n_blocks);
            }
        }
    }

    if let Some(from_block) = truncate_from {
        let len = from_block as u64 * frame_size;
        out.truncate(len)
            .io_context(|| format!("cannot truncate \"{to_path}\""))?;
        trace!("truncate file {to_path} to block {from_block}");
    }

    out.sync()
        .io_context(|| format!("cannot write \"{to_path}\""))?;
    drop(out);

    fio.at(Location::DbHost)
        .chmod(to_path, entry.mode & 0o7777)
        .io_context(|| format!("cannot change mode of \"{to_path}\""))?;
    Ok(())
}

/// Copy a non-data file whole, without page framing, CRC-computed. Returns
/// false when the source disappeared and `missing_ok` allows that.
pub fn copy_file(
    fio: &FioRouter,
    from_location: Location,
    to_location: Location,
    entry: &FileEntry,
    to_path: &Utf8Path,
    missing_ok: bool,
) -> Result<bool> {
    let mut crc: u32 = 0;
    {
        let mut state = entry.state();
        state.read_size = 0;
        state.write_size = 0;
    }

    let mut input = match fio.at(from_location).open_read(&entry.path) {
        Ok(input) => input,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            entry.state().crc = crc;
            // maybe deleted, which is fine for a backup
            if missing_ok {
                debug!("file \"{}\" is not found", entry.path);
                entry.state().write_size = FILE_NOT_FOUND;
                return Ok(false);
            }
            return Err(BackupError::Io {
                context: format!("file \"{}\" is not found", entry.path),
                source: e,
            });
        }
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot open source file \"{}\"", entry.path),
                source: e,
            })
        }
    };

    let mut out = fio
        .at(to_location)
        .create_write(to_path)
        .io_context(|| format!("cannot open destination file \"{to_path}\""))?;

    let mut read_size: i64 = 0;
    let mut buf = vec![0u8; BLCKSZ as usize];
    loop {
        let n = read_exact_or_eof(&mut input, &mut buf)
            .io_context(|| format!("cannot read source file \"{}\"", entry.path))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .io_context(|| format!("cannot write to \"{to_path}\""))?;
        crc = crc32c_append(crc, &buf[..n]);
        read_size += n as i64;
        if n < buf.len() {
            break;
        }
    }

    out.sync()
        .io_context(|| format!("cannot write \"{to_path}\""))?;
    drop(out);

    fio.at(to_location)
        .chmod(to_path, entry.mode & 0o7777)
        .io_context(|| format!("cannot change mode of \"{to_path}\""))?;

    let mut state = entry.state();
    state.read_size = read_size;
    state.write_size = read_size;
    state.crc = crc;
    Ok(true)
}

enum PageVerdict {
    Valid,
    Invalid,
}

/// Validate a single (uncompressed) page from a backup: zeroed pages pass,
/// then checksum, header sanity, and no LSN from the future.
fn validate_one_page(
    page: &[u8],
    entry: &FileEntry,
    blknum: u32,
    stop_lsn: Lsn,
    checksum_version: u32,
) -> PageVerdict {
    if postgres_ffi::page_is_new(page) {
        if !page_is_zeroed(page) {
            warn!(
                "file: {} blknum {blknum}, page is new, but not zeroed",
                entry.path
            );
        }
        // Page is zeroed. No sense in checking header and checksum.
        return PageVerdict::Valid;
    }

    if checksum_version != 0 {
        let blkno = entry.segno * RELSEG_SIZE + blknum;
        if pg_checksum_page(page, blkno) != page_get_checksum(page) {
            warn!("file: {} blknum {blknum} have wrong checksum", entry.path);
            return PageVerdict::Invalid;
        }
    }

    if !page_header_is_valid(page) {
        warn!(
            "page header is looking insane: {}, block {blknum}",
            entry.path
        );
        return PageVerdict::Invalid;
    }

    if stop_lsn.is_valid() {
        // Ensure the page is from our time.
        let lsn = page_get_lsn(page);
        if lsn > stop_lsn {
            warn!(
                "file: {}, block {blknum}, checksum is {}. page is from future: pageLSN {lsn} stopLSN {stop_lsn}",
                entry.path,
                if checksum_version != 0 { "correct" } else { "not enabled" },
            );
            return PageVerdict::Invalid;
        }
    }

    PageVerdict::Valid
}

/// Validate the pages of a datafile inside a backup, one frame at a time,
/// recomputing the file CRC along the way. Returns whether the file is
/// valid; problems are reported at WARNING.
pub fn check_file_pages(
    entry: &FileEntry,
    backup_file_path: &Utf8Path,
    stop_lsn: Lsn,
    checksum_version: u32,
    backup_version: &str,
    thread_interrupted: &AtomicBool,
) -> Result<bool> {
    trace!("validate relation blocks for file {backup_file_path}");

    let mut input = match std::fs::File::open(backup_file_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("file \"{backup_file_path}\" is not found");
            return Ok(false);
        }
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot open file \"{backup_file_path}\""),
                source: e,
            })
        }
    };

    let state_snapshot = entry.state().clone();
    let mut crc: u32 = 0;
    let mut is_valid = true;
    let mut blknum: u32 = 0;

    loop {
        crate::check_interrupt(thread_interrupted)?;

        let mut header_buf = [0u8; BACKUP_PAGE_HEADER_SIZE];
        let read_len = read_exact_or_eof(&mut input, &mut header_buf)
            .io_context(|| format!("cannot read header of block {blknum} of \"{backup_file_path}\""))?;
        if read_len == 0 {
            break;
        }
        if read_len != BACKUP_PAGE_HEADER_SIZE {
            warn!("odd size page found at block {blknum} of \"{backup_file_path}\"");
            return Ok(false);
        }
        crc = crc32c_append(crc, &header_buf);
        let header = BackupPageHeader::from_bytes(&header_buf);

        if header.block == 0 && header.compressed_size == 0 {
            continue;
        }
        if header.block < blknum {
            warn!("backup is broken at block {blknum} of \"{backup_file_path}\"");
            return Ok(false);
        }
        blknum = header.block;

        if header.compressed_size == PAGE_IS_TRUNCATED {
            debug!("block {blknum} of \"{backup_file_path}\" is truncated");
            continue;
        }
        if header.compressed_size < 0 || header.compressed_size > BLCKSZ as i32 {
            warn!(
                "invalid compressed size {} at block {blknum} of \"{backup_file_path}\"",
                header.compressed_size
            );
            return Ok(false);
        }

        let payload_len = maxalign(header.compressed_size as usize);
        let mut payload = vec![0u8; payload_len];
        let read_len = read_exact_or_eof(&mut input, &mut payload)
            .io_context(|| format!("cannot read block {blknum} of \"{backup_file_path}\""))?;
        if read_len != payload_len {
            warn!(
                "cannot read block {blknum} of \"{backup_file_path}\" read {read_len} of {payload_len}"
            );
            return Ok(false);
        }
        crc = crc32c_append(crc, &payload);
        payload.truncate(header.compressed_size as usize);

        if header.compressed_size != BLCKSZ as i32
            || page_may_be_compressed(&payload, state_snapshot.compress_alg, backup_version)
        {
            match do_decompress(state_snapshot.compress_alg, &payload, BLCKSZ as usize) {
                Ok(page) if page.len() == BLCKSZ as usize => {
                    if matches!(
                        validate_one_page(&page, entry, blknum, stop_lsn, checksum_version),
                        PageVerdict::Invalid
                    ) {
                        is_valid = false;
                    }
                }
                Ok(page) => {
                    warn!(
                        "page of file \"{backup_file_path}\" uncompressed to {} bytes. != BLCKSZ",
                        page.len()
                    );
                    return Ok(false);
                }
                Err(e) => {
                    warn!(
                        "an error occurred during decompressing block {blknum} of file \"{backup_file_path}\": {e}"
                    );
                    if header.compressed_size == BLCKSZ as i32 {
                        // the legacy probe guessed wrong; treat as raw
                        is_valid = false;
                        continue;
                    }
                    return Ok(false);
                }
            }
        } else if matches!(
            validate_one_page(&payload, entry, blknum, stop_lsn, checksum_version),
            PageVerdict::Invalid
        ) {
            is_valid = false;
        }
    }

    if crc != state_snapshot.crc {
        warn!(
            "invalid CRC of backup file \"{backup_file_path}\": {crc:X}. Expected {:X}",
            state_snapshot.crc
        );
        is_valid = false;
    }

    Ok(is_valid)
}

/// Checkdb-style scan of a live datafile: non-strict page loop that reports
/// corruption and keeps going. The file not existing is fine - concurrent
/// transactions delete relations.
pub fn check_data_file(
    ctx: &PageCtx,
    entry: &FileEntry,
    checksum_version: u32,
) -> Result<bool> {
    let source = ctx.fio.at(Location::DbHost);
    let mut reader = match source.open_read(&entry.path) {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("file \"{}\" is not found", entry.path);
            return Ok(true);
        }
        Err(e) => {
            warn!("cannot open file \"{}\": {e}", entry.path);
            return Ok(false);
        }
    };

    if entry.size % BLCKSZ as u64 != 0 {
        warn!("file: {}, invalid file size {}", entry.path, entry.size);
    }
    let nblocks = (entry.size / BLCKSZ as u64) as u32;

    let mut is_valid = true;
    let mut page = vec![0u8; BLCKSZ as usize];
    let mut n_skipped = 0u32;
    for blknum in 0..nblocks {
        let prepared = prepare_page(
            ctx,
            None,
            entry,
            reader.as_mut(),
            blknum,
            &mut page,
            false,
            &mut n_skipped,
        )?;
        match prepared {
            PreparedPage::Truncated => break,
            PreparedPage::Corrupted => {
                // prepare_page already reported it
                is_valid = false;
                continue;
            }
            PreparedPage::Copy => {
                if matches!(
                    validate_one_page(&page, entry, blknum, Lsn::INVALID, checksum_version),
                    PageVerdict::Invalid
                ) {
                    is_valid = false;
                }
            }
            PreparedPage::Skipped => {}
        }
    }

    Ok(is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::{FileKind, FileSystem, LocalFs, ReadableFile};
    use crate::pagemap::PageMap;
    use camino::Utf8PathBuf;
    use std::sync::atomic::Ordering;

    fn make_page(lsn: Lsn, absolute_blkno: u32, filler: u8) -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ as usize];
        postgres_ffi::page_set_lsn(&mut page, lsn);
        page[12..14].copy_from_slice(&24u16.to_le_bytes());
        page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[18..20].copy_from_slice(&(BLCKSZ | 4).to_le_bytes());
        for b in page[256..512].iter_mut() {
            *b = filler;
        }
        let checksum = pg_checksum_page(&page, absolute_blkno);
        page_set_checksum(&mut page, checksum);
        page
    }

    fn write_relation(path: &Utf8Path, pages: &[Vec<u8>]) {
        let mut data = Vec::new();
        for page in pages {
            data.extend_from_slice(page);
        }
        std::fs::write(path, data).unwrap();
    }

    fn entry_for(path: &Utf8Path, rel_path: &str, size: u64) -> FileEntry {
        let mut entry = FileEntry::new(
            path.to_owned(),
            Utf8PathBuf::from(rel_path),
            FileKind::Regular,
            0o600,
            size,
            0,
            0,
        );
        entry.is_datafile = true;
        entry.rel_oid = 123;
        entry.db_oid = 1;
        entry
    }

    fn full_ctx<'a>(
        fio: &'a FioRouter,
        interrupted: &'a AtomicBool,
        calg: CompressAlg,
    ) -> PageCtx<'a> {
        PageCtx {
            fio,
            mode: BackupMode::Full,
            prev_start_lsn: Lsn::INVALID,
            calg,
            clevel: 1,
            checksum_version: 1,
            ptrack_available: false,
            thread_interrupted: interrupted,
        }
    }

    #[test]
    fn test_full_backup_restore_roundtrip() {
        for calg in [CompressAlg::None, CompressAlg::Zlib, CompressAlg::Pglz] {
            let dir = camino_tempfile::tempdir().unwrap();
            let src = dir.path().join("123");
            let pages = vec![
                make_page(Lsn(0x1000), 0, 0xAA),
                make_page(Lsn(0x2000), 1, 0xBB),
            ];
            write_relation(&src, &pages);

            let entry = entry_for(&src, "base/1/123", 2 * BLCKSZ as u64);
            let fio = FioRouter::default();
            let interrupted = AtomicBool::new(false);
            let ctx = full_ctx(&fio, &interrupted, calg);

            let to_path = dir.path().join("backup_123");
            assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
            {
                let state = entry.state();
                assert_eq!(state.read_size, 2 * BLCKSZ as i64);
                assert!(state.write_size > 0);
                assert_ne!(state.crc, 0);
            }

            // frames validate
            assert!(check_file_pages(
                &entry,
                &to_path,
                Lsn(0x10000),
                1,
                crate::PROGRAM_VERSION,
                &interrupted,
            )
            .unwrap());

            // restoring reproduces the original bytes
            let restored = dir.path().join("restored_123");
            restore_data_file(
                &fio,
                &entry,
                &to_path,
                &restored,
                false,
                false,
                crate::PROGRAM_VERSION,
            )
            .unwrap();
            let original = std::fs::read(&src).unwrap();
            let result = std::fs::read(&restored).unwrap();
            assert_eq!(original, result, "restore mismatch with {calg}");
        }
    }

    #[test]
    fn test_delta_skips_old_pages_and_empty_copy_is_removed() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        let pages = vec![
            make_page(Lsn(0x1000), 0, 0x01),
            make_page(Lsn(0x1500), 1, 0x02),
        ];
        write_relation(&src, &pages);

        let entry = entry_for(&src, "base/1/123", 2 * BLCKSZ as u64);
        entry.state().exists_in_prev = true;

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let mut ctx = full_ctx(&fio, &interrupted, CompressAlg::None);
        ctx.mode = BackupMode::Delta;
        ctx.prev_start_lsn = Lsn(0x2000); // both pages predate the parent

        let to_path = dir.path().join("backup_123");
        assert!(!backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
        // all blocks skipped: no zero-byte placeholder left behind
        assert!(!to_path.exists());

        // now one page moves past the parent's start LSN
        let pages = vec![
            make_page(Lsn(0x1000), 0, 0x01),
            make_page(Lsn(0x3000), 1, 0x02),
        ];
        write_relation(&src, &pages);
        entry.reset_claim();
        assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
        let state = entry.state();
        assert_eq!(state.n_blocks, Some(2));
        // one page copied, one skipped
        assert_eq!(
            state.write_size,
            (BACKUP_PAGE_HEADER_SIZE + BLCKSZ as usize) as i64
        );
    }

    #[test]
    fn test_pagemap_limits_copied_blocks() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        let pages = vec![
            make_page(Lsn(0x1000), 0, 0x0A),
            make_page(Lsn(0x2000), 1, 0x0B),
            make_page(Lsn(0x3000), 2, 0x0C),
        ];
        write_relation(&src, &pages);

        let entry = entry_for(&src, "base/1/123", 3 * BLCKSZ as u64);
        {
            let mut state = entry.state();
            state.exists_in_prev = true;
            let mut map = PageMap::new();
            map.add(1);
            state.pagemap = Some(map);
        }

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let mut ctx = full_ctx(&fio, &interrupted, CompressAlg::None);
        ctx.mode = BackupMode::Page;

        let to_path = dir.path().join("backup_123");
        assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
        // exactly one frame: header + raw page
        assert_eq!(
            entry.state().write_size,
            (BACKUP_PAGE_HEADER_SIZE + BLCKSZ as usize) as i64
        );

        // restoring over a copy of the old file updates only block 1
        let target = dir.path().join("target");
        std::fs::copy(&src, &target).unwrap();
        restore_data_file(
            &fio,
            &entry,
            &to_path,
            &target,
            false,
            false,
            crate::PROGRAM_VERSION,
        )
        .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), std::fs::read(&src).unwrap());
    }

    #[test]
    fn test_read_past_eof_writes_truncation_sentinel() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        write_relation(&src, &[make_page(Lsn(0x1000), 0, 0x55)]);

        let entry = entry_for(&src, "base/1/123", BLCKSZ as u64);
        {
            // the page map claims blocks beyond current EOF
            let mut state = entry.state();
            state.exists_in_prev = true;
            let mut map = PageMap::new();
            map.add(0);
            map.add(5);
            state.pagemap = Some(map);
        }

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let mut ctx = full_ctx(&fio, &interrupted, CompressAlg::None);
        ctx.mode = BackupMode::Page;

        let to_path = dir.path().join("backup_123");
        assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());

        // last frame is a bare truncation header
        let bytes = std::fs::read(&to_path).unwrap();
        let tail = BackupPageHeader::from_bytes(&bytes[bytes.len() - BACKUP_PAGE_HEADER_SIZE..]);
        assert_eq!(tail.block, 5);
        assert_eq!(tail.compressed_size, PAGE_IS_TRUNCATED);

        // restore truncates the over-long target back to the sentinel block
        let target = dir.path().join("target");
        std::fs::write(&target, vec![0xFFu8; 7 * BLCKSZ as usize]).unwrap();
        restore_data_file(
            &fio,
            &entry,
            &to_path,
            &target,
            false,
            false,
            crate::PROGRAM_VERSION,
        )
        .unwrap();
        assert_eq!(
            std::fs::metadata(&target).unwrap().len(),
            5 * BLCKSZ as u64
        );
    }

    #[test]
    fn test_missing_source_file_is_tolerated() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("does_not_exist");
        let entry = entry_for(&src, "base/1/999", BLCKSZ as u64);

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let ctx = full_ctx(&fio, &interrupted, CompressAlg::None);

        let to_path = dir.path().join("backup_999");
        assert!(!backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
        assert_eq!(entry.state().write_size, FILE_NOT_FOUND);

        // and is fatal when the caller forbids it
        entry.state().write_size = 0;
        assert!(backup_data_file(&ctx, None, &entry, &to_path, false).is_err());
    }

    /// A file system that serves a corrupted page image on the first read of
    /// each block and the true bytes afterwards, like a torn in-flight write.
    struct TornPageFs;

    struct TornReader {
        inner: Box<dyn ReadableFile>,
        torn_served: std::collections::HashSet<u64>,
    }

    impl std::io::Read for TornReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl ReadableFile for TornReader {
        fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            let n = self.inner.read_at(buf, offset)?;
            if self.torn_served.insert(offset) && !buf.is_empty() {
                // garble the tail, as if the second half was not flushed yet
                let mid = buf.len() / 2;
                for b in buf[mid..].iter_mut() {
                    *b = 0x5A;
                }
            }
            Ok(n)
        }
    }

    impl FileSystem for TornPageFs {
        fn open_read(&self, path: &Utf8Path) -> std::io::Result<Box<dyn ReadableFile>> {
            Ok(Box::new(TornReader {
                inner: LocalFs.open_read(path)?,
                torn_served: Default::default(),
            }))
        }
        fn create_write(&self, path: &Utf8Path) -> std::io::Result<Box<dyn crate::fio::WritableFile>> {
            LocalFs.create_write(path)
        }
        fn open_update(&self, path: &Utf8Path) -> std::io::Result<Box<dyn crate::fio::UpdatableFile>> {
            LocalFs.open_update(path)
        }
        fn stat(&self, path: &Utf8Path, follow: bool) -> std::io::Result<crate::fio::FileStat> {
            LocalFs.stat(path, follow)
        }
        fn chmod(&self, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
            LocalFs.chmod(path, mode)
        }
        fn mkdir(&self, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
            LocalFs.mkdir(path, mode)
        }
        fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
            LocalFs.rename(from, to)
        }
        fn unlink(&self, path: &Utf8Path) -> std::io::Result<()> {
            LocalFs.unlink(path)
        }
        fn read_dir(&self, path: &Utf8Path) -> std::io::Result<Vec<crate::fio::DirEntryInfo>> {
            LocalFs.read_dir(path)
        }
        fn read_link(&self, path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
            LocalFs.read_link(path)
        }
    }

    #[test]
    fn test_torn_page_recovers_on_retry() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        write_relation(&src, &[make_page(Lsn(0x1000), 0, 0x77)]);

        let entry = entry_for(&src, "base/1/123", BLCKSZ as u64);
        let fio = FioRouter::new(Box::new(LocalFs), Box::new(TornPageFs));
        let interrupted = AtomicBool::new(false);
        let ctx = full_ctx(&fio, &interrupted, CompressAlg::None);

        let to_path = dir.path().join("backup_123");
        // one retry, then success
        assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());
        assert!(check_file_pages(
            &entry,
            &to_path,
            Lsn(0x10000),
            1,
            crate::PROGRAM_VERSION,
            &interrupted,
        )
        .unwrap());
    }

    #[test]
    fn test_check_file_pages_detects_bitrot() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        write_relation(&src, &[make_page(Lsn(0x1000), 0, 0x11)]);
        let entry = entry_for(&src, "base/1/123", BLCKSZ as u64);

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(false);
        let ctx = full_ctx(&fio, &interrupted, CompressAlg::None);
        let to_path = dir.path().join("backup_123");
        assert!(backup_data_file(&ctx, None, &entry, &to_path, true).unwrap());

        // flip one payload byte
        let mut bytes = std::fs::read(&to_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&to_path, bytes).unwrap();

        assert!(!check_file_pages(
            &entry,
            &to_path,
            Lsn(0x10000),
            1,
            crate::PROGRAM_VERSION,
            &interrupted,
        )
        .unwrap());
    }

    #[test]
    fn test_interrupt_cancels_page_loop() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("123");
        write_relation(&src, &[make_page(Lsn(0x1000), 0, 0x11)]);
        let entry = entry_for(&src, "base/1/123", BLCKSZ as u64);

        let fio = FioRouter::default();
        let interrupted = AtomicBool::new(true);
        let ctx = full_ctx(&fio, &interrupted, CompressAlg::None);
        let to_path = dir.path().join("backup_123");
        assert!(matches!(
            backup_data_file(&ctx, None, &entry, &to_path, true),
            Err(BackupError::Interrupted)
        ));
    }
}
