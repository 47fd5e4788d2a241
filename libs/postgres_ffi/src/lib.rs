//!
//! Constants and algorithms ported from PostgreSQL, needed to work with
//! relation data files and WAL at the byte level.
//!
//! Many of the functions have been copied from PostgreSQL and rewritten in
//! Rust; where the names look un-Rusty, they have been kept the same as the
//! corresponding PostgreSQL functions instead.
//!

use utils::lsn::Lsn;

pub mod pg_constants;
pub mod pglz;
pub mod relfile_utils;
pub mod xlog_utils;

mod checksum;
pub use checksum::pg_checksum_page;

// from pg_config.h. These can be changed with configure options --with-blocksize=BLOCKSIZE and
// --with-segsize=SEGSIZE, but assume the defaults for now.
pub const BLCKSZ: u16 = 8192;
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / (BLCKSZ as u32);
pub const XLOG_BLCKSZ: usize = 8192;
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// The PostgreSQL major version this tool is built against.
pub const PG_MAJORVERSION: &str = "14";

pub type Oid = u32;
pub type BlockNumber = u32;
pub type TransactionId = u32;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;

// Check if page is not yet initialized (port of Postgres PageIsNew() macro)
pub fn page_is_new(pg: &[u8]) -> bool {
    pg[14] == 0 && pg[15] == 0 // pd_upper == 0
}

// Extract LSN from page header
pub fn page_get_lsn(pg: &[u8]) -> Lsn {
    Lsn(
        ((u32::from_le_bytes(pg[0..4].try_into().unwrap()) as u64) << 32)
            | u32::from_le_bytes(pg[4..8].try_into().unwrap()) as u64,
    )
}

pub fn page_set_lsn(pg: &mut [u8], lsn: Lsn) {
    pg[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
    pg[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
}

pub fn page_get_checksum(pg: &[u8]) -> u16 {
    u16::from_le_bytes(pg[8..10].try_into().unwrap())
}

pub fn page_set_checksum(pg: &mut [u8], checksum: u16) {
    pg[8..10].copy_from_slice(&checksum.to_le_bytes());
}

fn page_get_u16(pg: &[u8], offs: usize) -> u16 {
    u16::from_le_bytes(pg[offs..offs + 2].try_into().unwrap())
}

/// Port of the header sanity checks that PageHeaderIsValid and pg_probackup's
/// parse_page perform: the size field, the flag bits and the pd_lower /
/// pd_upper / pd_special chain must all be coherent.
pub fn page_header_is_valid(pg: &[u8]) -> bool {
    let pd_flags = page_get_u16(pg, 10);
    let pd_lower = page_get_u16(pg, 12);
    let pd_upper = page_get_u16(pg, 14);
    let pd_special = page_get_u16(pg, 16);
    let pd_pagesize_version = page_get_u16(pg, 18);

    // PageGetPageSize() masks out the layout version stored in the low byte
    let page_size = pd_pagesize_version & 0xFF00;

    page_size == BLCKSZ
        && (pd_flags & !pg_constants::PD_VALID_FLAG_BITS) == 0
        && pd_lower >= pg_constants::SIZE_OF_PAGE_HEADER_DATA as u16
        && pd_lower <= pd_upper
        && pd_upper <= pd_special
        && pd_special <= BLCKSZ
        && pd_special % 8 == 0
}

pub fn page_is_zeroed(pg: &[u8]) -> bool {
    pg.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A well-formed empty heap page, as PageInit would lay it out.
    pub(crate) fn valid_empty_page() -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ as usize];
        page_set_lsn(&mut page, Lsn(0x16_00000000));
        // pd_lower = header, pd_upper = pd_special = BLCKSZ
        page[12..14].copy_from_slice(&(pg_constants::SIZE_OF_PAGE_HEADER_DATA as u16).to_le_bytes());
        page[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        page[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        // pd_pagesize_version: 8192 | layout version 4
        page[18..20].copy_from_slice(&(BLCKSZ | 4).to_le_bytes());
        page
    }

    #[test]
    fn test_page_header_validation() {
        let page = valid_empty_page();
        assert!(page_header_is_valid(&page));
        assert!(!page_is_new(&page));

        // an all-zeros page is "new" but fails the header check
        let zeroed = vec![0u8; BLCKSZ as usize];
        assert!(page_is_new(&zeroed));
        assert!(page_is_zeroed(&zeroed));
        assert!(!page_header_is_valid(&zeroed));

        // bad size field
        let mut bad = valid_empty_page();
        bad[18..20].copy_from_slice(&(4096u16 | 4).to_le_bytes());
        assert!(!page_header_is_valid(&bad));

        // pd_lower below the header size
        let mut bad = valid_empty_page();
        bad[12..14].copy_from_slice(&4u16.to_le_bytes());
        assert!(!page_header_is_valid(&bad));

        // pd_upper above pd_special
        let mut bad = valid_empty_page();
        bad[16..18].copy_from_slice(&64u16.to_le_bytes());
        assert!(!page_header_is_valid(&bad));

        // undefined flag bits set
        let mut bad = valid_empty_page();
        bad[10..12].copy_from_slice(&0x0008u16.to_le_bytes());
        assert!(!page_header_is_valid(&bad));

        // unaligned pd_special
        let mut bad = valid_empty_page();
        bad[16..18].copy_from_slice(&8191u16.to_le_bytes());
        assert!(!page_header_is_valid(&bad));
    }

    #[test]
    fn test_page_lsn_roundtrip() {
        let mut page = valid_empty_page();
        page_set_lsn(&mut page, Lsn(0x1234_5678_9ABC_DEF0));
        assert_eq!(page_get_lsn(&page), Lsn(0x1234_5678_9ABC_DEF0));
    }
}
