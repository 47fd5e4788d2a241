//
// This file contains common utilities for dealing with PostgreSQL WAL files and
// LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

#![allow(non_snake_case)]

use std::time::{Duration, SystemTime};

use crate::{TimeLineID, XLogSegNo};

pub const XLOG_FNAME_LEN: usize = 24;

/// Size of the fixed part of XLogPageHeaderData, maxaligned.
pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
/// Size of XLogLongPageHeaderData (the short header plus the system
/// identifier, segment size and block size), maxaligned.
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;
/// Size of the XLogRecord header.
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of xl_crc within XLogRecord: tot_len + xid + prev + info + rmid + padding.
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;
/// Offset of xlp_rem_len within XLogPageHeaderData: magic + info + tli + pageaddr.
pub const XLP_REM_LEN_OFFS: usize = 2 + 2 + 4 + 8;

pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

pub fn XLogSegNoOffsetToRecPtr(segno: XLogSegNo, offset: u32, wal_segsz_bytes: usize) -> u64 {
    segno * (wal_segsz_bytes as u64) + (offset as u64)
}

pub fn XLogFileName(tli: TimeLineID, logSegNo: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logSegNo / XLogSegmentsPerXLogId(wal_segsz_bytes),
        logSegNo % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> (XLogSegNo, TimeLineID) {
    let tli = u32::from_str_radix(&fname[0..8], 16).unwrap();
    let log = u32::from_str_radix(&fname[8..16], 16).unwrap() as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).unwrap() as XLogSegNo;
    (log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli)
}

pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname.ends_with(".partial") && IsXLogFileName(&fname[0..fname.len() - 8])
}

const UNIX_EPOCH_JDATE: u64 = 2440588; /* == date2j(1970, 1, 1) */
const POSTGRES_EPOCH_JDATE: u64 = 2451545; /* == date2j(2000, 1, 1) */
const SECS_PER_DAY: u64 = 86400;
const USECS_PER_SEC: u64 = 1000000;
const PG_EPOCH_OFFSET_USECS: u64 =
    (POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY * USECS_PER_SEC;

pub fn get_current_timestamp() -> i64 {
    to_pg_timestamp(SystemTime::now())
}

pub fn to_pg_timestamp(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => (n.as_micros() as u64 - PG_EPOCH_OFFSET_USECS) as i64,
        Err(_) => panic!("SystemTime before UNIX EPOCH!"),
    }
}

/// Convert a TimestampTz from a WAL record back to wall clock time.
pub fn from_pg_timestamp(ts: i64) -> SystemTime {
    let usecs_since_unix_epoch = (ts as u64).wrapping_add(PG_EPOCH_OFFSET_USECS);
    SystemTime::UNIX_EPOCH + Duration::from_micros(usecs_since_unix_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG_SIZE: usize = 16 * 1024 * 1024;

    #[test]
    fn test_XLogFileName() {
        assert_eq!(XLogFileName(1, 0, SEG_SIZE), "000000010000000000000000");
        assert_eq!(XLogFileName(1, 1, SEG_SIZE), "000000010000000000000001");
        // 256 segments of 16 MiB per xlog id
        assert_eq!(XLogFileName(1, 256, SEG_SIZE), "000000010000000100000000");
        assert_eq!(XLogFileName(3, 257, SEG_SIZE), "000000030000000100000001");
    }

    #[test]
    fn test_XLogFromFileName() {
        for (segno, tli) in [(0u64, 1u32), (1, 1), (255, 2), (256, 2), (123456, 7)] {
            let fname = XLogFileName(tli, segno, SEG_SIZE);
            assert_eq!(XLogFromFileName(&fname, SEG_SIZE), (segno, tli));
        }
    }

    #[test]
    fn test_IsXLogFileName() {
        assert!(IsXLogFileName("000000010000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000001"));
        assert!(!IsXLogFileName("0000000100000000000000011"));
        assert!(!IsXLogFileName("00000001000000000000000g"));
        assert!(IsPartialXLogFileName("000000010000000000000001.partial"));
        assert!(!IsPartialXLogFileName("000000010000000000000001.gz"));
    }

    #[test]
    fn test_pg_timestamp_roundtrip() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let ts = to_pg_timestamp(now);
        assert_eq!(from_pg_timestamp(ts), now);
    }
}
