//! Page payload compression: zlib (via flate2) or the database's own LZ
//! variant (pglz). `none` is represented explicitly so the control files can
//! spell it out.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use postgres_ffi::{pglz, BLCKSZ};
use serde::{Deserialize, Serialize};

use crate::parse_program_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlg {
    #[default]
    None,
    Pglz,
    Zlib,
}

impl FromStr for CompressAlg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(CompressAlg::None),
            "pglz" => Ok(CompressAlg::Pglz),
            "zlib" => Ok(CompressAlg::Zlib),
            other => Err(format!("invalid compress algorithm value \"{other}\"")),
        }
    }
}

impl fmt::Display for CompressAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressAlg::None => "none",
            CompressAlg::Pglz => "pglz",
            CompressAlg::Zlib => "zlib",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("invalid compression algorithm")]
    InvalidAlg,
    #[error("input does not compress")]
    Incompressible,
    #[error("zlib: {0}")]
    Zlib(std::io::Error),
    #[error("pglz: {0}")]
    Pglz(#[from] pglz::PglzError),
}

/// Compress `src`. The caller must not call this with `CompressAlg::None`.
/// An `Incompressible` result means the page should be stored raw, which the
/// page framing expresses with `compressed_size == BLCKSZ`.
pub fn do_compress(alg: CompressAlg, level: u32, src: &[u8]) -> Result<Vec<u8>, CompressError> {
    match alg {
        CompressAlg::None => Err(CompressError::InvalidAlg),
        CompressAlg::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(src).map_err(CompressError::Zlib)?;
            encoder.finish().map_err(CompressError::Zlib)
        }
        CompressAlg::Pglz => pglz::compress(src).ok_or(CompressError::Incompressible),
    }
}

/// Decompress `src` into exactly `dst_len` bytes.
pub fn do_decompress(
    alg: CompressAlg,
    src: &[u8],
    dst_len: usize,
) -> Result<Vec<u8>, CompressError> {
    match alg {
        CompressAlg::None => Err(CompressError::InvalidAlg),
        CompressAlg::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(src);
            let mut out = Vec::with_capacity(dst_len);
            decoder
                .read_to_end(&mut out)
                .map_err(CompressError::Zlib)?;
            Ok(out)
        }
        CompressAlg::Pglz => Ok(pglz::decompress(src, dst_len)?),
    }
}

const ZLIB_MAGIC: u8 = 0x78;

/// Backups produced by versions below 2.0.23 could store a page whose
/// compressed size came out exactly BLCKSZ without marking it as raw. There
/// is no 100% criteria to tell such a page apart, so this probe only fires
/// for payloads that fail page header validation, and for zlib additionally
/// checks the stream magic. Backups from newer versions never need it.
pub fn page_may_be_compressed(page: &[u8], alg: CompressAlg, backup_version: &str) -> bool {
    if postgres_ffi::page_header_is_valid(page) {
        return false;
    }
    if parse_program_version(backup_version) >= 20023 {
        /* Versions 2.0.23 and higher don't have such a bug */
        return false;
    }
    if alg == CompressAlg::Zlib && page[0] != ZLIB_MAGIC {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_page() -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ as usize];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 13) as u8;
        }
        page
    }

    #[test]
    fn test_alg_parse_roundtrip() {
        for alg in [CompressAlg::None, CompressAlg::Pglz, CompressAlg::Zlib] {
            assert_eq!(alg.to_string().parse::<CompressAlg>(), Ok(alg));
        }
        assert_eq!(" ZLIB ".parse::<CompressAlg>(), Ok(CompressAlg::Zlib));
        assert!("lz4".parse::<CompressAlg>().is_err());
    }

    #[test]
    fn test_compress_roundtrip() {
        let page = sample_page();
        for alg in [CompressAlg::Zlib, CompressAlg::Pglz] {
            let compressed = do_compress(alg, 1, &page).unwrap();
            assert!(compressed.len() < page.len());
            let restored = do_decompress(alg, &compressed, page.len()).unwrap();
            assert_eq!(restored, page);
        }
    }

    #[test]
    fn test_none_alg_is_a_caller_bug() {
        assert!(matches!(
            do_compress(CompressAlg::None, 1, b"x"),
            Err(CompressError::InvalidAlg)
        ));
        assert!(matches!(
            do_decompress(CompressAlg::None, b"x", 1),
            Err(CompressError::InvalidAlg)
        ));
    }

    #[test]
    fn test_legacy_compressed_page_probe() {
        // a zlib stream starts with 0x78 and fails header validation
        let compressed = do_compress(CompressAlg::Zlib, 1, &sample_page()).unwrap();
        assert!(page_may_be_compressed(&compressed, CompressAlg::Zlib, "2.0.22"));
        // newer backups never rely on the probe
        assert!(!page_may_be_compressed(&compressed, CompressAlg::Zlib, "2.0.23"));
        // a valid raw page is never taken for a compressed one
        let mut raw = vec![0u8; BLCKSZ as usize];
        raw[12..14].copy_from_slice(&24u16.to_le_bytes());
        raw[14..16].copy_from_slice(&BLCKSZ.to_le_bytes());
        raw[16..18].copy_from_slice(&BLCKSZ.to_le_bytes());
        raw[18..20].copy_from_slice(&(BLCKSZ | 4).to_le_bytes());
        assert!(!page_may_be_compressed(&raw, CompressAlg::Zlib, "2.0.22"));
    }
}
