//! Reading WAL segments off disk: walking records across page boundaries,
//! verifying record CRCs, and decoding the per-record block references.
//!
//! Serves three consumers: the WAL waiter (`wal_contains_lsn`,
//! `get_last_wal_lsn`), the PAGE-mode page-map builder (`extract_page_map`),
//! and end-of-backup recovery info (`read_recovery_info`). Compressed
//! (`.gz`) archived segments are read transparently.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use camino::{Utf8Path, Utf8PathBuf};
use crc32c::crc32c_append;
use postgres_ffi::pg_constants::{
    BKPBLOCK_FORK_MASK, BKPBLOCK_HAS_DATA, BKPBLOCK_HAS_IMAGE, BKPBLOCK_SAME_REL,
    BKPIMAGE_HAS_HOLE, BKPIMAGE_IS_COMPRESSED, RM_XACT_ID, XLOG_PAGE_MAGIC, XLOG_XACT_ABORT,
    XLOG_XACT_COMMIT, XLOG_XACT_OPMASK, XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER,
    XLR_BLOCK_ID_DATA_LONG, XLR_BLOCK_ID_DATA_SHORT, XLR_BLOCK_ID_ORIGIN,
    XLR_BLOCK_ID_TOPLEVEL_XID, XLR_MAX_BLOCK_ID,
};
use postgres_ffi::xlog_utils::{
    from_pg_timestamp, XLogFileName, XLOG_RECORD_CRC_OFFS, XLOG_SIZE_OF_XLOG_LONG_PHD,
    XLOG_SIZE_OF_XLOG_RECORD, XLOG_SIZE_OF_XLOG_SHORT_PHD, XLP_REM_LEN_OFFS,
};
use postgres_ffi::XLOG_BLCKSZ;
use tracing::{debug, warn};
use utils::lsn::Lsn;

use crate::error::{BackupError, Result};
use crate::pagemap::PageMapBuilder;

fn maxalign(len: usize) -> usize {
    (len + 7) & !7
}

/// Load one segment, accepting a compressed `.gz` variant as equivalent.
/// `Ok(None)` when neither exists.
fn load_segment(
    wal_dir: &Utf8Path,
    tli: u32,
    segno: u64,
    seg_size: usize,
) -> Result<Option<Vec<u8>>> {
    let fname = XLogFileName(tli, segno, seg_size);
    let path = wal_dir.join(&fname);

    match std::fs::read(&path) {
        Ok(data) => return Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BackupError::Io {
                context: format!("cannot read WAL segment \"{path}\""),
                source: e,
            })
        }
    }

    let gz_path = Utf8PathBuf::from(format!("{path}.gz"));
    match std::fs::File::open(&gz_path) {
        Ok(file) => {
            let mut decoder = flate2::read::GzDecoder::new(file);
            let mut data = Vec::with_capacity(seg_size);
            decoder.read_to_end(&mut data).map_err(|e| BackupError::Io {
                context: format!("cannot decompress WAL segment \"{gz_path}\""),
                source: e,
            })?;
            Ok(Some(data))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BackupError::Io {
            context: format!("cannot read WAL segment \"{gz_path}\""),
            source: e,
        }),
    }
}

/// Sequential reader over the WAL records of one timeline, starting at (the
/// page containing) a given LSN. Yields `(record start LSN, record bytes)`
/// and stops at the first invalid or missing piece of WAL.
pub struct WalReader<'a> {
    wal_dir: &'a Utf8Path,
    tli: u32,
    seg_size: usize,
    segno: u64,
    buf: Option<Vec<u8>>,
    offs: usize,
    /// Reassembly of the record in flight (starts with its 4 length bytes).
    rec: Vec<u8>,
    rec_start: Lsn,
    contlen: usize,
    /// True while consuming a continuation whose start we never saw.
    discard: bool,
    /// Set when iteration ended because a segment file was absent.
    hit_missing_segment: bool,
}

impl<'a> WalReader<'a> {
    pub fn new(wal_dir: &'a Utf8Path, tli: u32, seg_size: usize, start_lsn: Lsn) -> WalReader<'a> {
        // Start at the beginning of the page holding start_lsn; a record
        // already in flight there is consumed via the contrecord flag.
        let byte_pos = start_lsn.0 - (start_lsn.0 % XLOG_BLCKSZ as u64);
        WalReader {
            wal_dir,
            tli,
            seg_size,
            segno: byte_pos / seg_size as u64,
            buf: None,
            offs: (byte_pos % seg_size as u64) as usize,
            rec: Vec::new(),
            rec_start: Lsn::INVALID,
            contlen: 0,
            discard: false,
            hit_missing_segment: false,
        }
    }

    /// LSN of the position the reader will look at next.
    pub fn position(&self) -> Lsn {
        Lsn(self.segno * self.seg_size as u64 + self.offs as u64)
    }

    pub fn hit_missing_segment(&self) -> bool {
        self.hit_missing_segment
    }

    pub fn next_record(&mut self) -> Result<Option<(Lsn, Vec<u8>)>> {
        loop {
            if self.buf.is_none() {
                match load_segment(self.wal_dir, self.tli, self.segno, self.seg_size)? {
                    Some(buf) => self.buf = Some(buf),
                    None => {
                        self.hit_missing_segment = true;
                        return Ok(None);
                    }
                }
            }
            let buf = self.buf.as_ref().unwrap();

            if self.offs >= buf.len() {
                if buf.len() < self.seg_size {
                    // a partial (streamed) segment ends here
                    return Ok(None);
                }
                self.segno += 1;
                self.buf = None;
                self.offs = 0;
                continue;
            }

            // At a page boundary: step over the page header first.
            if self.offs % XLOG_BLCKSZ == 0 {
                if self.offs + XLOG_SIZE_OF_XLOG_SHORT_PHD > buf.len() {
                    return Ok(None);
                }
                let magic = LittleEndian::read_u16(&buf[self.offs..self.offs + 2]);
                let info = LittleEndian::read_u16(&buf[self.offs + 2..self.offs + 4]);
                if magic != XLOG_PAGE_MAGIC {
                    debug!(
                        "invalid WAL page magic {magic:#x} at {}, stopping",
                        self.position()
                    );
                    return Ok(None);
                }
                let rem_len = LittleEndian::read_u32(
                    &buf[self.offs + XLP_REM_LEN_OFFS..self.offs + XLP_REM_LEN_OFFS + 4],
                ) as usize;
                let header_len = if info & XLP_LONG_HEADER != 0 {
                    XLOG_SIZE_OF_XLOG_LONG_PHD
                } else {
                    XLOG_SIZE_OF_XLOG_SHORT_PHD
                };
                self.offs += header_len;

                // A continuation of a record whose beginning we never read is
                // consumed and dropped.
                if self.contlen == 0 && info & XLP_FIRST_IS_CONTRECORD != 0 {
                    self.discard = true;
                    self.contlen = rem_len;
                    self.rec.clear();
                }
                continue;
            }

            if self.contlen == 0 {
                // Start of a record; xl_tot_len always fits the page because
                // records are 8-byte aligned.
                let xl_tot_len =
                    LittleEndian::read_u32(&buf[self.offs..self.offs + 4]) as usize;
                if xl_tot_len == 0 {
                    // zeros: reached the end of written WAL
                    return Ok(None);
                }
                if xl_tot_len < XLOG_SIZE_OF_XLOG_RECORD {
                    warn!(
                        "invalid record length {xl_tot_len} at {}, stopping",
                        self.position()
                    );
                    return Ok(None);
                }
                self.rec_start = self.position();
                self.rec.clear();
                self.rec.extend_from_slice(&buf[self.offs..self.offs + 4]);
                self.contlen = xl_tot_len - 4;
                self.offs += 4;
                continue;
            }

            // Continue the record, with as much as this page still holds.
            let page_left = XLOG_BLCKSZ - self.offs % XLOG_BLCKSZ;
            let n = self.contlen.min(page_left).min(buf.len() - self.offs);
            if n == 0 {
                return Ok(None);
            }
            if !self.discard {
                self.rec.extend_from_slice(&buf[self.offs..self.offs + n]);
            }
            self.offs += n;
            self.contlen -= n;

            if self.contlen == 0 {
                // records are aligned on 8-byte boundaries
                self.offs = maxalign(self.offs);
                if self.discard {
                    self.discard = false;
                    continue;
                }

                let rec = std::mem::take(&mut self.rec);
                let wal_crc =
                    LittleEndian::read_u32(&rec[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4]);
                let mut crc = crc32c_append(0, &rec[XLOG_SIZE_OF_XLOG_RECORD..]);
                crc = crc32c_append(crc, &rec[0..XLOG_RECORD_CRC_OFFS]);
                if crc != wal_crc {
                    debug!("record CRC mismatch at {}, stopping", self.rec_start);
                    return Ok(None);
                }
                return Ok(Some((self.rec_start, rec)));
            }
        }
    }
}

/// If the LSN points at a page header, bump it to the first record position
/// behind it, the way the server's WAL reader does.
pub fn normalize_lsn(lsn: Lsn, seg_size: usize) -> Lsn {
    if lsn.0 % XLOG_BLCKSZ as u64 == 0 {
        let hdr_size = if lsn.0 % seg_size as u64 == 0 {
            XLOG_SIZE_OF_XLOG_LONG_PHD
        } else {
            XLOG_SIZE_OF_XLOG_SHORT_PHD
        };
        lsn + hdr_size as u64
    } else {
        lsn.align()
    }
}

/// Does the (already present) WAL contain a valid record at `target_lsn`?
pub fn wal_contains_lsn(
    wal_dir: &Utf8Path,
    target_lsn: Lsn,
    tli: u32,
    seg_size: usize,
) -> Result<bool> {
    let target = normalize_lsn(target_lsn, seg_size);
    let mut reader = WalReader::new(wal_dir, tli, seg_size, target);
    while let Some((lsn, _rec)) = reader.next_record()? {
        if lsn == target {
            return Ok(true);
        }
        if lsn > target {
            break;
        }
    }
    Ok(false)
}

/// The start LSN of the last valid record at-or-before `stop_lsn`, scanning
/// forward from `start_lsn`. With `seek_prev_segment`, records in
/// `stop_lsn`'s own segment are not considered (used when a stop LSN sits
/// exactly on a segment boundary).
pub fn get_last_wal_lsn(
    wal_dir: &Utf8Path,
    start_lsn: Lsn,
    stop_lsn: Lsn,
    tli: u32,
    seek_prev_segment: bool,
    seg_size: usize,
) -> Result<Option<Lsn>> {
    let stop_segno = stop_lsn.segment_number(seg_size);
    let mut reader = WalReader::new(wal_dir, tli, seg_size, start_lsn);
    let mut last: Option<Lsn> = None;

    while let Some((lsn, _rec)) = reader.next_record()? {
        if lsn > stop_lsn || (seek_prev_segment && lsn.segment_number(seg_size) >= stop_segno) {
            break;
        }
        last = Some(lsn);
    }
    Ok(last)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub spc_oid: u32,
    pub db_oid: u32,
    pub rel_oid: u32,
    pub forknum: u8,
    pub blkno: u32,
}

#[derive(Debug, Default)]
pub struct DecodedRecord {
    pub xid: u32,
    pub info: u8,
    pub rmid: u8,
    pub blocks: Vec<BlockRef>,
    pub main_data: Vec<u8>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn get_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(record_too_short());
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(record_too_short());
        }
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(record_too_short());
        }
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(record_too_short());
        }
        self.pos += n;
        Ok(())
    }
}

fn record_too_short() -> BackupError {
    BackupError::Page("WAL record is shorter than its headers claim".to_string())
}

/// Decode the headers of one WAL record: which blocks it touches and where
/// its main data lies.
///
/// The overall layout of an XLOG record is:
/// ```text
///   fixed-size header (XLogRecord struct)
///   XLogRecordBlockHeader struct (repeated, ids 0..=32)
///   XLogRecordDataHeader[Short|Long] struct
///   block data, block images
///   main data
/// ```
pub fn decode_record(rec: &[u8]) -> Result<DecodedRecord> {
    if rec.len() < XLOG_SIZE_OF_XLOG_RECORD {
        return Err(record_too_short());
    }
    let mut decoded = DecodedRecord {
        xid: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
        info: rec[16],
        rmid: rec[17],
        ..Default::default()
    };

    let mut cur = Cursor {
        buf: rec,
        pos: XLOG_SIZE_OF_XLOG_RECORD,
    };

    let mut rnode: Option<(u32, u32, u32)> = None;
    let mut main_data_len: usize = 0;
    let mut datatotal: usize = 0;

    while cur.remaining() > datatotal {
        let block_id = cur.get_u8()?;
        match block_id {
            XLR_BLOCK_ID_DATA_SHORT => {
                main_data_len = cur.get_u8()? as usize;
                datatotal += main_data_len;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                main_data_len = cur.get_u32()? as usize;
                datatotal += main_data_len;
            }
            XLR_BLOCK_ID_ORIGIN => {
                cur.advance(2)?;
            }
            XLR_BLOCK_ID_TOPLEVEL_XID => {
                cur.advance(4)?;
            }
            0..=XLR_MAX_BLOCK_ID => {
                let fork_flags = cur.get_u8()?;
                let forknum = fork_flags & BKPBLOCK_FORK_MASK;
                let has_image = fork_flags & BKPBLOCK_HAS_IMAGE != 0;
                let has_data = fork_flags & BKPBLOCK_HAS_DATA != 0;
                let data_len = cur.get_u16()? as usize;
                if has_data {
                    datatotal += data_len;
                }

                if has_image {
                    let bimg_len = cur.get_u16()? as usize;
                    let _hole_offset = cur.get_u16()?;
                    let bimg_info = cur.get_u8()?;
                    if bimg_info & BKPIMAGE_IS_COMPRESSED != 0
                        && bimg_info & BKPIMAGE_HAS_HOLE != 0
                    {
                        let _hole_length = cur.get_u16()?;
                    }
                    datatotal += bimg_len;
                }

                if fork_flags & BKPBLOCK_SAME_REL == 0 {
                    let spc = cur.get_u32()?;
                    let db = cur.get_u32()?;
                    let rel = cur.get_u32()?;
                    rnode = Some((spc, db, rel));
                }
                let Some((spc_oid, db_oid, rel_oid)) = rnode else {
                    return Err(BackupError::Page(
                        "BKPBLOCK_SAME_REL set but no previous rel in WAL record".to_string(),
                    ));
                };
                let blkno = cur.get_u32()?;

                decoded.blocks.push(BlockRef {
                    spc_oid,
                    db_oid,
                    rel_oid,
                    forknum,
                    blkno,
                });
            }
            _ => {
                return Err(BackupError::Page(format!(
                    "invalid block_id {block_id} in WAL record"
                )));
            }
        }
    }

    // main data occupies the record's tail
    if main_data_len > 0 {
        if rec.len() < main_data_len {
            return Err(record_too_short());
        }
        decoded.main_data = rec[rec.len() - main_data_len..].to_vec();
    }
    Ok(decoded)
}

/// Scan archived WAL in `(start_lsn, end_lsn]` and record every touched
/// relation block in the per-file page maps. The whole range must be
/// present; a hole in the archive fails the PAGE backup.
pub fn extract_page_map(
    wal_dir: &Utf8Path,
    tli: u32,
    seg_size: usize,
    start_lsn: Lsn,
    end_lsn: Lsn,
    builder: &PageMapBuilder,
) -> Result<()> {
    let mut reader = WalReader::new(wal_dir, tli, seg_size, start_lsn);
    let mut reached = start_lsn;

    while let Some((lsn, rec)) = reader.next_record()? {
        if lsn > end_lsn {
            break;
        }
        reached = lsn;
        if lsn <= start_lsn {
            continue;
        }
        let decoded = decode_record(&rec)
            .map_err(|e| BackupError::Page(format!("cannot decode WAL record at {lsn}: {e}")))?;
        for block in decoded.blocks {
            builder.process_block_change(
                block.spc_oid,
                block.db_oid,
                block.rel_oid,
                block.forknum,
                block.blkno,
            );
        }
    }

    if reached < end_lsn {
        return Err(BackupError::Page(format!(
            "could not read WAL up to {end_lsn}: valid records end at {reached}{}",
            if reader.hit_missing_segment() {
                " (segment file is missing)"
            } else {
                ""
            }
        )));
    }
    Ok(())
}

/// Latest transaction commit/abort at-or-before `stop_lsn`: its timestamp
/// (unix seconds) and transaction id. `None` when the range holds no
/// transaction end at all.
pub fn read_recovery_info(
    wal_dir: &Utf8Path,
    tli: u32,
    seg_size: usize,
    start_lsn: Lsn,
    stop_lsn: Lsn,
) -> Result<Option<(i64, u32)>> {
    let mut reader = WalReader::new(wal_dir, tli, seg_size, start_lsn);
    let mut last: Option<(i64, u32)> = None;

    while let Some((lsn, rec)) = reader.next_record()? {
        if lsn > stop_lsn {
            break;
        }
        let Ok(decoded) = decode_record(&rec) else {
            // an undecodable record ends the scan but does not fail it
            break;
        };
        if decoded.rmid == RM_XACT_ID {
            let op = decoded.info & XLOG_XACT_OPMASK;
            if (op == XLOG_XACT_COMMIT || op == XLOG_XACT_ABORT) && decoded.main_data.len() >= 8 {
                // xl_xact_commit and xl_xact_abort both start with the
                // transaction timestamp
                let ts = i64::from_le_bytes(decoded.main_data[0..8].try_into().unwrap());
                let unix = from_pg_timestamp(ts)
                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                last = Some((unix, decoded.xid));
            }
        }
    }
    Ok(last)
}

#[cfg(test)]
pub(crate) mod test_wal {
    //! A miniature WAL writer for tests: emits page headers, records and
    //! contrecords the way the server lays them out.

    use super::*;

    pub const TEST_SEG_SIZE: usize = 1024 * 1024;

    pub struct WalBuilder {
        pub tli: u32,
        pub seg_size: usize,
        pub buf: Vec<u8>,
        pub pos: usize,
    }

    impl WalBuilder {
        pub fn new(tli: u32, seg_size: usize) -> WalBuilder {
            WalBuilder {
                tli,
                seg_size,
                buf: Vec::new(),
                pos: 0,
            }
        }

        fn page_header(&mut self, rem_len: u32) {
            let page_start = self.pos;
            let long = page_start % self.seg_size == 0;
            let mut info: u16 = 0;
            if long {
                info |= XLP_LONG_HEADER;
            }
            if rem_len > 0 {
                info |= XLP_FIRST_IS_CONTRECORD;
            }
            let tli = self.tli;
            let seg_size = self.seg_size as u32;
            self.put(&XLOG_PAGE_MAGIC.to_le_bytes());
            self.put(&info.to_le_bytes());
            self.put(&tli.to_le_bytes());
            self.put(&(page_start as u64).to_le_bytes());
            self.put(&rem_len.to_le_bytes());
            self.put(&[0u8; 4]); // padding to 24
            if long {
                self.put(&0xDEAD_BEEF_u64.to_le_bytes()); // system identifier
                self.put(&seg_size.to_le_bytes());
                self.put(&(XLOG_BLCKSZ as u32).to_le_bytes());
            }
        }

        fn put(&mut self, bytes: &[u8]) {
            if self.buf.len() < self.pos + bytes.len() {
                self.buf.resize(self.pos + bytes.len(), 0);
            }
            self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
            self.pos += bytes.len();
        }

        /// Append one record (header + body), splitting it over page
        /// boundaries with continuation headers as needed. Returns the
        /// record's start LSN.
        pub fn append_record(&mut self, xid: u32, info: u8, rmid: u8, body: &[u8]) -> Lsn {
            // lay down a page header if we sit at a boundary
            if self.pos % XLOG_BLCKSZ == 0 {
                self.page_header(0);
            }

            let tot_len = XLOG_SIZE_OF_XLOG_RECORD + body.len();
            let mut rec = Vec::with_capacity(tot_len);
            rec.extend_from_slice(&(tot_len as u32).to_le_bytes());
            rec.extend_from_slice(&xid.to_le_bytes());
            rec.extend_from_slice(&0u64.to_le_bytes()); // xl_prev: not checked
            rec.push(info);
            rec.push(rmid);
            rec.extend_from_slice(&[0u8; 2]); // padding
            let mut crc = crc32c_append(0, body);
            crc = crc32c_append(crc, &rec[0..XLOG_RECORD_CRC_OFFS]);
            rec.extend_from_slice(&crc.to_le_bytes());
            rec.extend_from_slice(body);

            let start = Lsn(self.pos as u64);
            let mut written = 0;
            while written < rec.len() {
                if self.pos % XLOG_BLCKSZ == 0 {
                    self.page_header((rec.len() - written) as u32);
                }
                let page_left = XLOG_BLCKSZ - self.pos % XLOG_BLCKSZ;
                let n = page_left.min(rec.len() - written);
                let chunk = rec[written..written + n].to_vec();
                self.put(&chunk);
                written += n;
            }
            // records start on 8-byte boundaries
            self.pos = super::maxalign(self.pos);
            start
        }

        /// A no-op record body of the given size, for spacing.
        pub fn append_filler(&mut self, body_len: usize) -> Lsn {
            let mut body = Vec::with_capacity(body_len + 5);
            if body_len > 255 {
                body.push(XLR_BLOCK_ID_DATA_LONG);
                body.extend_from_slice(&(body_len as u32).to_le_bytes());
            } else {
                body.push(XLR_BLOCK_ID_DATA_SHORT);
                body.push(body_len as u8);
            }
            body.extend(std::iter::repeat(0x42u8).take(body_len));
            self.append_record(7, 0, 0xFE, &body)
        }

        /// A record with one block reference.
        pub fn append_block_ref(
            &mut self,
            spc: u32,
            db: u32,
            rel: u32,
            forknum: u8,
            blkno: u32,
        ) -> Lsn {
            let payload = [0xAAu8; 4];
            let mut body = Vec::new();
            body.push(0); // block_id 0
            body.push(forknum | BKPBLOCK_HAS_DATA);
            body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            body.extend_from_slice(&spc.to_le_bytes());
            body.extend_from_slice(&db.to_le_bytes());
            body.extend_from_slice(&rel.to_le_bytes());
            body.extend_from_slice(&blkno.to_le_bytes());
            body.extend_from_slice(&payload);
            self.append_record(8, 0, 10, &body)
        }

        /// A transaction commit record carrying the given timestamp.
        pub fn append_commit(&mut self, xid: u32, pg_ts: i64) -> Lsn {
            let mut body = vec![XLR_BLOCK_ID_DATA_SHORT, 12];
            body.extend_from_slice(&pg_ts.to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes()); // xinfo-ish tail
            self.append_record(xid, XLOG_XACT_COMMIT, RM_XACT_ID, &body)
        }

        /// Write out every touched segment under `dir`.
        pub fn store(&self, dir: &Utf8Path) {
            let nsegs = self.buf.len().div_ceil(self.seg_size);
            for segno in 0..nsegs {
                let mut seg = vec![0u8; self.seg_size];
                let start = segno * self.seg_size;
                let end = (start + self.seg_size).min(self.buf.len());
                seg[0..end - start].copy_from_slice(&self.buf[start..end]);
                let fname = XLogFileName(self.tli, segno as u64, self.seg_size);
                std::fs::write(dir.join(fname), seg).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_wal::{WalBuilder, TEST_SEG_SIZE};
    use super::*;
    use crate::filelist::FileEntry;
    use crate::fio::FileKind;
    use postgres_ffi::pg_constants::DEFAULTTABLESPACE_OID;
    use postgres_ffi::xlog_utils::to_pg_timestamp;

    #[test]
    fn test_record_walk_and_crc() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        let l1 = wal.append_filler(16);
        let l2 = wal.append_filler(32);
        let l3 = wal.append_filler(8);
        wal.store(dir.path());

        let mut reader = WalReader::new(dir.path(), 1, TEST_SEG_SIZE, Lsn(0));
        let (r1, _) = reader.next_record().unwrap().unwrap();
        let (r2, _) = reader.next_record().unwrap().unwrap();
        let (r3, _) = reader.next_record().unwrap().unwrap();
        assert_eq!((r1, r2, r3), (l1, l2, l3));
        // zeros after the last record end the iteration
        assert!(reader.next_record().unwrap().is_none());
        assert!(!reader.hit_missing_segment());

        // a missing directory reports a missing segment
        let empty = camino_tempfile::tempdir().unwrap();
        let mut reader = WalReader::new(empty.path(), 1, TEST_SEG_SIZE, Lsn(0));
        assert!(reader.next_record().unwrap().is_none());
        assert!(reader.hit_missing_segment());
    }

    #[test]
    fn test_record_crossing_page_boundary() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        // fill most of the first page, then a record too big to fit it
        wal.append_filler(XLOG_BLCKSZ - XLOG_SIZE_OF_XLOG_LONG_PHD - 200);
        let spanning = wal.append_filler(500);
        let after = wal.append_filler(16);
        wal.store(dir.path());

        let mut reader = WalReader::new(dir.path(), 1, TEST_SEG_SIZE, Lsn(0));
        let mut seen = Vec::new();
        while let Some((lsn, _)) = reader.next_record().unwrap() {
            seen.push(lsn);
        }
        assert!(seen.contains(&spanning));
        assert!(seen.contains(&after));

        // starting inside the second page drops the continuation and yields
        // the first whole record of that page
        let mut reader = WalReader::new(dir.path(), 1, TEST_SEG_SIZE, Lsn(XLOG_BLCKSZ as u64));
        let (first, _) = reader.next_record().unwrap().unwrap();
        assert_eq!(first, after);
    }

    #[test]
    fn test_wal_contains_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        let l1 = wal.append_filler(16);
        let l2 = wal.append_filler(16);
        wal.store(dir.path());

        assert!(wal_contains_lsn(dir.path(), l1, 1, TEST_SEG_SIZE).unwrap());
        assert!(wal_contains_lsn(dir.path(), l2, 1, TEST_SEG_SIZE).unwrap());
        // the very start of the segment normalizes to the first record
        assert!(wal_contains_lsn(dir.path(), Lsn(0), 1, TEST_SEG_SIZE).unwrap());
        // an LSN between records is not a record
        assert!(!wal_contains_lsn(dir.path(), l2 + 4u64, 1, TEST_SEG_SIZE).unwrap());
    }

    #[test]
    fn test_get_last_wal_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        let l1 = wal.append_filler(16);
        let l2 = wal.append_filler(16);
        let l3 = wal.append_filler(16);
        wal.store(dir.path());

        // everything up to and including l3
        assert_eq!(
            get_last_wal_lsn(dir.path(), Lsn(0), l3, 1, false, TEST_SEG_SIZE).unwrap(),
            Some(l3)
        );
        // bounded below l3
        assert_eq!(
            get_last_wal_lsn(dir.path(), Lsn(0), l2 + 4u64, 1, false, TEST_SEG_SIZE).unwrap(),
            Some(l2)
        );
        let _ = l1;
    }

    #[test]
    fn test_extract_page_map() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        let start = wal.append_filler(16);
        wal.append_block_ref(DEFAULTTABLESPACE_OID, 5, 123, 0, 2);
        wal.append_block_ref(DEFAULTTABLESPACE_OID, 5, 123, 0, 7);
        // a change in another relation we do not track
        wal.append_block_ref(DEFAULTTABLESPACE_OID, 5, 999, 0, 1);
        let end = wal.append_filler(16);
        wal.store(dir.path());

        let mut entry = FileEntry::new(
            "/pgdata/base/5/123".into(),
            "base/5/123".into(),
            FileKind::Regular,
            0o600,
            0,
            0,
            0,
        );
        entry.is_datafile = true;
        entry.rel_oid = 123;
        entry.db_oid = 5;
        entry.tblspc_oid = DEFAULTTABLESPACE_OID;
        let files = vec![entry];
        let builder = PageMapBuilder::new(&files);

        extract_page_map(dir.path(), 1, TEST_SEG_SIZE, start, end, &builder).unwrap();

        let state = files[0].state();
        let blocks: Vec<u32> = state.pagemap.as_ref().unwrap().iter().collect();
        assert_eq!(blocks, vec![2, 7]);
        drop(state);

        // a range past the end of the archive is an error
        let err = extract_page_map(
            dir.path(),
            1,
            TEST_SEG_SIZE,
            start,
            end + 0x100000u64,
            &builder,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_read_recovery_info() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        let start = wal.append_filler(16);
        let commit_time = std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(1_700_000_000);
        wal.append_commit(101, to_pg_timestamp(commit_time));
        wal.append_commit(102, to_pg_timestamp(
            commit_time + std::time::Duration::from_secs(10),
        ));
        let end = wal.append_filler(16);
        wal.store(dir.path());

        let info = read_recovery_info(dir.path(), 1, TEST_SEG_SIZE, start, end)
            .unwrap()
            .expect("recovery info found");
        // the newest transaction end wins
        assert_eq!(info, (1_700_000_010, 102));

        // a range with no transaction ends yields nothing
        let info = read_recovery_info(dir.path(), 1, TEST_SEG_SIZE, start, start).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn test_decode_block_refs() {
        let mut wal = WalBuilder::new(1, TEST_SEG_SIZE);
        wal.append_block_ref(1663, 5, 123, 0, 42);
        // pull the record back out through the reader
        let dir = camino_tempfile::tempdir().unwrap();
        wal.store(dir.path());
        let mut reader = WalReader::new(dir.path(), 1, TEST_SEG_SIZE, Lsn(0));
        let (_, rec) = reader.next_record().unwrap().unwrap();

        let decoded = decode_record(&rec).unwrap();
        assert_eq!(decoded.xid, 8);
        assert_eq!(
            decoded.blocks,
            vec![BlockRef {
                spc_oid: 1663,
                db_oid: 5,
                rel_oid: 123,
                forknum: 0,
                blkno: 42,
            }]
        );
    }
}
