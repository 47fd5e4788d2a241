//! Per-segment bitmaps of changed pages, and the builders that fill them:
//! from archived WAL (PAGE mode) or from the change-tracking extension
//! (PTRACK mode).

use std::sync::Mutex;

use camino::Utf8PathBuf;
use postgres_ffi::pg_constants::{
    DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID, PG_TBLSPC_DIR, TABLESPACE_VERSION_DIRECTORY,
};
use postgres_ffi::relfile_utils::relfilename;
use postgres_ffi::{BlockNumber, RELSEG_SIZE};
use tracing::{debug, trace};

use crate::db::DbConn;
use crate::error::Result;
use crate::filelist::FileEntry;

/// One bit per page of a relation segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMap {
    bitmap: Vec<u8>,
}

impl PageMap {
    pub fn new() -> PageMap {
        PageMap::default()
    }

    /// Adopt a raw ptrack slice.
    pub fn from_bytes(bitmap: Vec<u8>) -> PageMap {
        PageMap { bitmap }
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|&b| b == 0)
    }

    pub fn add(&mut self, blkno: BlockNumber) {
        let byte = (blkno / 8) as usize;
        if byte >= self.bitmap.len() {
            self.bitmap.resize(byte + 1, 0);
        }
        self.bitmap[byte] |= 1 << (blkno % 8);
    }

    pub fn contains(&self, blkno: BlockNumber) -> bool {
        let byte = (blkno / 8) as usize;
        byte < self.bitmap.len() && self.bitmap[byte] & (1 << (blkno % 8)) != 0
    }

    /// Set block numbers, ascending.
    pub fn iter(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(byte, &bits)| {
            (0..8)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| (byte * 8 + bit) as BlockNumber)
        })
    }
}

/// Bytes of ptrack map covering one relation segment.
pub const PTRACK_BYTES_PER_SEGMENT: usize = (RELSEG_SIZE / 8) as usize;

/// Compute the relation file path (relative to PGDATA) for a block
/// reference from WAL, the way relpathperm() spells it.
pub fn rel_block_path(spc_oid: u32, db_oid: u32, rel_oid: u32, forknum: u8, segno: u32) -> Utf8PathBuf {
    let file = relfilename(rel_oid, forknum, segno);
    if spc_oid == GLOBALTABLESPACE_OID {
        Utf8PathBuf::from(format!("global/{file}"))
    } else if spc_oid == DEFAULTTABLESPACE_OID || spc_oid == 0 {
        Utf8PathBuf::from(format!("base/{db_oid}/{file}"))
    } else {
        Utf8PathBuf::from(format!(
            "{PG_TBLSPC_DIR}/{spc_oid}/{TABLESPACE_VERSION_DIRECTORY}/{db_oid}/{file}"
        ))
    }
}

/// An index from relation-segment path to position in the (shared, sorted)
/// file list, plus the single mutex that serializes bitmap updates from the
/// WAL readers.
pub struct PageMapBuilder<'a> {
    files: &'a [FileEntry],
    /// (rel_path, index into `files`), sorted by path for binary search.
    index: Vec<(Utf8PathBuf, usize)>,
    /// Updates are serialized; contention is acceptable because WAL scanning
    /// is read-dominated.
    mutex: Mutex<()>,
}

impl<'a> PageMapBuilder<'a> {
    pub fn new(files: &'a [FileEntry]) -> PageMapBuilder<'a> {
        let mut index: Vec<(Utf8PathBuf, usize)> = files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_datafile && f.external_dir_num == 0)
            .map(|(i, f)| (f.rel_path.clone(), i))
            .collect();
        index.sort();
        PageMapBuilder {
            files,
            index,
            mutex: Mutex::new(()),
        }
    }

    /// Record one changed block from a WAL record. A block of a relation we
    /// have no entry for is a relation created after the file listing; the
    /// backup copies such files whole anyway, so it is safely ignored.
    pub fn process_block_change(&self, spc_oid: u32, db_oid: u32, rel_oid: u32, forknum: u8, blkno: BlockNumber) {
        let segno = blkno / RELSEG_SIZE;
        let blkno_inseg = blkno % RELSEG_SIZE;
        let rel_path = rel_block_path(spc_oid, db_oid, rel_oid, forknum, segno);

        let Ok(found) = self.index.binary_search_by(|(path, _)| path.cmp(&rel_path)) else {
            trace!("no file entry for changed block {blkno} of {rel_path}");
            return;
        };
        let entry = &self.files[self.index[found].1];

        let _guard = self.mutex.lock().expect("pagemap mutex poisoned");
        let mut state = entry.state();
        state.pagemap.get_or_insert_with(PageMap::new).add(blkno_inseg);
    }
}

/// Build ptrack-based page maps: for each relation, fetch-and-clear the
/// bitmap once (at segment 0) and slice it per segment file. A database
/// whose `ptrack_init` flag is set, and any slice the map does not cover,
/// degrade to whole-file copy via `pagemap_isabsent`.
///
/// Relies on `files` being sorted by path, so that a relation's segments are
/// adjacent and the database directory precedes its files.
pub fn make_pagemap_from_ptrack(files: &[FileEntry], db: &mut DbConn) -> Result<()> {
    debug!("compiling pagemap");

    let mut db_with_init: Option<(u32, u32)> = None;
    let mut current_map: Option<(u32, u32, u32, Option<Vec<u8>>)> = None;

    for entry in files {
        if entry.is_database {
            // pg_ptrack_get_and_clear_db returns true when the database had
            // a ptrack_init file; the global tablespace is always treated
            // that way to dodge extension corner cases
            if entry.tblspc_oid == GLOBALTABLESPACE_OID
                || db.ptrack_get_and_clear_db(entry.db_oid, entry.tblspc_oid)?
            {
                db_with_init = Some((entry.db_oid, entry.tblspc_oid));
            }
        }

        if !entry.is_datafile {
            continue;
        }

        if db_with_init == Some((entry.db_oid, entry.tblspc_oid)) {
            trace!("ignoring ptrack because of ptrack_init for file: {}", entry.path);
            entry.state().pagemap_isabsent = true;
            continue;
        }

        // fetch the bitmap once for all segments of the relation
        let key = (entry.tblspc_oid, entry.db_oid, entry.rel_oid);
        if current_map.as_ref().map(|m| (m.0, m.1, m.2)) != Some(key) {
            let map = db.ptrack_get_and_clear(entry.tblspc_oid, entry.db_oid, entry.rel_oid)?;
            current_map = Some((key.0, key.1, key.2, map));
        }

        let Some((_, _, _, Some(map))) = &current_map else {
            // relation deleted, or created bypassing the buffer manager
            trace!("ptrack is missing for file: {}", entry.path);
            entry.state().pagemap_isabsent = true;
            continue;
        };

        let start = entry.segno as usize * PTRACK_BYTES_PER_SEGMENT;
        if start > map.len() {
            // segment created after the map was read
            trace!("ptrack is missing for file: {}", entry.path);
            entry.state().pagemap_isabsent = true;
        } else {
            let end = (start + PTRACK_BYTES_PER_SEGMENT).min(map.len());
            let slice = map[start..end].to_vec();
            trace!("pagemap size: {} for {}", slice.len(), entry.path);
            entry.state().pagemap = Some(PageMap::from_bytes(slice));
        }
    }

    debug!("pagemap compiled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::FileKind;

    #[test]
    fn test_pagemap_bits() {
        let mut map = PageMap::new();
        assert!(map.is_empty());

        map.add(0);
        map.add(9);
        map.add(131071);
        assert!(!map.is_empty());
        assert!(map.contains(0));
        assert!(map.contains(9));
        assert!(map.contains(131071));
        assert!(!map.contains(1));
        assert!(!map.contains(131070));

        let blocks: Vec<u32> = map.iter().collect();
        assert_eq!(blocks, vec![0, 9, 131071]);
    }

    #[test]
    fn test_pagemap_from_ptrack_slice() {
        // bit 3 of byte 0 and bit 0 of byte 1
        let map = PageMap::from_bytes(vec![0b0000_1000, 0b0000_0001]);
        let blocks: Vec<u32> = map.iter().collect();
        assert_eq!(blocks, vec![3, 8]);

        assert!(PageMap::from_bytes(vec![0, 0, 0]).is_empty());
    }

    #[test]
    fn test_rel_block_path() {
        assert_eq!(
            rel_block_path(DEFAULTTABLESPACE_OID, 13000, 123, 0, 0),
            Utf8PathBuf::from("base/13000/123")
        );
        assert_eq!(
            rel_block_path(GLOBALTABLESPACE_OID, 0, 1262, 0, 0),
            Utf8PathBuf::from("global/1262")
        );
        assert_eq!(
            rel_block_path(16500, 16401, 8000, 0, 3),
            Utf8PathBuf::from(format!(
                "{PG_TBLSPC_DIR}/16500/{TABLESPACE_VERSION_DIRECTORY}/16401/8000.3"
            ))
        );
    }

    #[test]
    fn test_block_change_lands_in_the_right_segment() {
        let mut entry = FileEntry::new(
            "/pgdata/base/1/123".into(),
            "base/1/123".into(),
            FileKind::Regular,
            0o600,
            8192,
            0,
            0,
        );
        entry.is_datafile = true;
        entry.rel_oid = 123;
        entry.db_oid = 1;
        entry.tblspc_oid = DEFAULTTABLESPACE_OID;

        let mut seg1 = FileEntry::new(
            "/pgdata/base/1/123.1".into(),
            "base/1/123.1".into(),
            FileKind::Regular,
            0o600,
            8192,
            0,
            0,
        );
        seg1.is_datafile = true;
        seg1.rel_oid = 123;
        seg1.db_oid = 1;
        seg1.tblspc_oid = DEFAULTTABLESPACE_OID;
        seg1.segno = 1;

        let files = vec![entry, seg1];
        let builder = PageMapBuilder::new(&files);

        // block 5 of segment 0, block RELSEG_SIZE + 7 lands in segment 1
        builder.process_block_change(DEFAULTTABLESPACE_OID, 1, 123, 0, 5);
        builder.process_block_change(DEFAULTTABLESPACE_OID, 1, 123, 0, RELSEG_SIZE + 7);
        // unknown relation: ignored
        builder.process_block_change(DEFAULTTABLESPACE_OID, 1, 999, 0, 1);

        let state0 = files[0].state();
        let map0 = state0.pagemap.as_ref().unwrap();
        assert_eq!(map0.iter().collect::<Vec<_>>(), vec![5]);
        drop(state0);

        let state1 = files[1].state();
        let map1 = state1.pagemap.as_ref().unwrap();
        assert_eq!(map1.iter().collect::<Vec<_>>(), vec![7]);
    }
}
