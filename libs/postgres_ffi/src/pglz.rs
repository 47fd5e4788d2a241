//!
//! Port of the PostgreSQL LZ compression scheme (common/pg_lzcompress.c).
//!
//! The output format is byte-compatible with PostgreSQL's: the stream is a
//! sequence of control bytes, each covering up to eight items. A zero control
//! bit means one literal byte follows; a set bit means a two- or three-byte
//! back-reference follows:
//!
//! ```text
//!   [lll oooo] [oooooooo]            length 3..17, offset 1..4095
//!   [1111 oooo] [oooooooo] [llllllll] length 18 + l (up to 273)
//! ```
//!
//! The compressor here uses a simpler last-occurrence hash table than
//! PostgreSQL's history chains, so it does not produce byte-identical
//! streams, but everything it emits decompresses with pglz_decompress in
//! either codebase, and it decompresses any stream PostgreSQL produces.
//!

const PGLZ_MAX_OFFSET: usize = 4095;
const PGLZ_MIN_MATCH: usize = 3;
const PGLZ_MAX_MATCH: usize = 273;

const HASH_SIZE: usize = 8192;

fn hash4(src: &[u8]) -> usize {
    let v = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    (v.wrapping_mul(2654435761) >> 19) as usize & (HASH_SIZE - 1)
}

/// Compress `src`. Returns `None` when the data does not shrink, mirroring
/// pglz_compress returning -1 for incompressible input.
pub fn compress(src: &[u8]) -> Option<Vec<u8>> {
    if src.len() < PGLZ_MIN_MATCH + 1 {
        return None;
    }

    let mut dst: Vec<u8> = Vec::with_capacity(src.len());
    // last position each hash value was seen at, or usize::MAX
    let mut table = vec![usize::MAX; HASH_SIZE];

    let mut pos = 0usize;
    let mut ctrl_pos = 0usize;
    let mut ctrl_bit = 0u8;

    while pos < src.len() {
        if ctrl_bit == 0 {
            // start a new control byte
            ctrl_pos = dst.len();
            dst.push(0);
            ctrl_bit = 1;
        }

        // the compressor must not outgrow the source
        if dst.len() >= src.len() {
            return None;
        }

        let mut match_len = 0usize;
        let mut match_off = 0usize;

        if pos + 4 <= src.len() {
            let h = hash4(&src[pos..]);
            let cand = table[h];
            table[h] = pos;

            if cand != usize::MAX && pos - cand <= PGLZ_MAX_OFFSET {
                let limit = (src.len() - pos).min(PGLZ_MAX_MATCH);
                let mut l = 0usize;
                while l < limit && src[cand + l] == src[pos + l] {
                    l += 1;
                }
                if l >= PGLZ_MIN_MATCH {
                    match_len = l;
                    match_off = pos - cand;
                }
            }
        }

        if match_len > 0 {
            dst[ctrl_pos] |= ctrl_bit;
            if match_len > 17 {
                dst.push((0xf0 | (match_off >> 8)) as u8);
                dst.push((match_off & 0xff) as u8);
                dst.push((match_len - 18) as u8);
            } else {
                dst.push((((match_len - 3) << 4) | (match_off >> 8)) as u8);
                dst.push((match_off & 0xff) as u8);
            }
            // enter the skipped positions into the table as well, so that
            // runs of the same bytes keep finding nearby matches
            let end = (pos + match_len).min(src.len().saturating_sub(4));
            for p in pos + 1..end {
                table[hash4(&src[p..])] = p;
            }
            pos += match_len;
        } else {
            dst.push(src[pos]);
            pos += 1;
        }

        ctrl_bit = ctrl_bit.wrapping_shl(1);
    }

    if dst.len() < src.len() {
        Some(dst)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PglzError {
    #[error("compressed pglz data is truncated")]
    Truncated,
    #[error("invalid pglz back-reference (offset {offset} at output position {pos})")]
    BadOffset { offset: usize, pos: usize },
    #[error("pglz output does not fit destination: expected {expected}, got {got}")]
    BadLength { expected: usize, got: usize },
}

/// Decompress `src` into exactly `dst_len` bytes.
pub fn decompress(src: &[u8], dst_len: usize) -> Result<Vec<u8>, PglzError> {
    let mut dst: Vec<u8> = Vec::with_capacity(dst_len);
    let mut sp = 0usize;

    while sp < src.len() && dst.len() < dst_len {
        let ctrl = src[sp];
        sp += 1;

        for bit in 0..8 {
            if sp >= src.len() || dst.len() >= dst_len {
                break;
            }
            if ctrl & (1 << bit) != 0 {
                if sp + 1 >= src.len() {
                    return Err(PglzError::Truncated);
                }
                let b0 = src[sp] as usize;
                let b1 = src[sp + 1] as usize;
                sp += 2;
                let mut len = (b0 >> 4) + 3;
                let off = ((b0 & 0x0f) << 8) | b1;
                if len == 18 {
                    if sp >= src.len() {
                        return Err(PglzError::Truncated);
                    }
                    len += src[sp] as usize;
                    sp += 1;
                }
                if off == 0 || off > dst.len() {
                    return Err(PglzError::BadOffset {
                        offset: off,
                        pos: dst.len(),
                    });
                }
                // byte-at-a-time copy: the regions may overlap
                for _ in 0..len {
                    let b = dst[dst.len() - off];
                    dst.push(b);
                }
            } else {
                dst.push(src[sp]);
                sp += 1;
            }
        }
    }

    if dst.len() != dst_len {
        return Err(PglzError::BadLength {
            expected: dst_len,
            got: dst.len(),
        });
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn roundtrip(data: &[u8]) {
        let compressed = compress(data).expect("compressible input");
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_roundtrip_repetitive() {
        roundtrip(&[0u8; 8192]);
        roundtrip(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        roundtrip(&b"abcabcabcabc".repeat(100));
    }

    #[test]
    fn test_roundtrip_mixed_page() {
        // something page-like: sparse header plus repeated tuples
        let mut page = vec![0u8; 8192];
        for i in 0..64 {
            let tuple = format!("tuple data number {:>4} padding padding", i % 7);
            let offs = 128 + i * tuple.len();
            page[offs..offs + tuple.len()].copy_from_slice(tuple.as_bytes());
        }
        roundtrip(&page);
    }

    #[test]
    fn test_incompressible_input_is_rejected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let data: Vec<u8> = (0..8192).map(|_| rng.gen()).collect();
        // random bytes do not shrink; pglz refuses rather than expands
        assert!(compress(&data).is_none());
    }

    #[test]
    fn test_long_matches_use_extended_encoding() {
        // a run much longer than 18 forces the three-byte form
        let data = vec![7u8; 2048];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < 64);
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decompress_detects_garbage() {
        // back-reference before the start of the output
        let bogus = [0x01u8, 0x00, 0x05];
        assert!(decompress(&bogus, 16).is_err());
        // truncated stream
        let bogus = [0x01u8, 0x30];
        assert!(decompress(&bogus, 16).is_err());
    }
}
