///
///  Port of Postgres pg_checksum_page
///
use crate::BLCKSZ;

const N_SUMS: usize = 32;
/* prime multiplier of FNV-1a hash */
const FNV_PRIME: u32 = 16777619;

/*
 * Base offsets to initialize each of the parallel FNV hashes into a
 * different initial state.
 */
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

/*
 * Calculate one round of the checksum.
 */
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/*
 * Compute the checksum for a Postgres page.
 *
 * The checksum includes the block number (to detect the case where a page is
 * somehow moved to a different location), the page header (excluding the
 * checksum itself), and the page data. The pd_checksum field (bytes 8..10)
 * is treated as zero for the computation, so the caller does not need to
 * clear it first.
 */
pub fn pg_checksum_page(data: &[u8], blkno: u32) -> u16 {
    assert_eq!(data.len(), BLCKSZ as usize);

    let mut checksum: u32 = 0;
    let mut sums = CHECKSUM_BASE_OFFSETS;

    /* main checksum calculation */
    for i in 0..(BLCKSZ as usize / (4 * N_SUMS)) {
        for (j, sum) in sums.iter_mut().enumerate() {
            let offs = (i * N_SUMS + j) * 4;
            let mut word = u32::from_le_bytes(data[offs..offs + 4].try_into().unwrap());
            // pd_checksum occupies bytes 8..10, the low half of this word
            if offs == 8 {
                word &= 0xFFFF_0000;
            }
            *sum = checksum_comp(*sum, word);
        }
    }
    /* finally add in two rounds of zeroes for additional mixing */
    for _i in 0..2 {
        for s in sums.iter_mut().take(N_SUMS) {
            *s = checksum_comp(*s, 0);
        }
    }

    /* xor fold partial checksums together */
    for sum in sums {
        checksum ^= sum;
    }

    /* Mix in the block number to detect transposed pages */
    checksum ^= blkno;

    /*
     * Reduce to a uint16 (to fit in the pd_checksum field) with an offset of
     * one. That avoids checksums of zero, which seems like a good idea.
     */
    ((checksum % 65535) + 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_set_checksum;

    #[test]
    fn test_checksum_ignores_stored_checksum() {
        let mut page = vec![0u8; BLCKSZ as usize];
        page[100] = 0xAB;

        let before = pg_checksum_page(&page, 0);
        page_set_checksum(&mut page, before);
        let after = pg_checksum_page(&page, 0);
        assert_eq!(before, after);
    }

    #[test]
    fn test_checksum_depends_on_block_number() {
        let mut page = vec![0u8; BLCKSZ as usize];
        page[100] = 0xAB;

        assert_ne!(pg_checksum_page(&page, 0), pg_checksum_page(&page, 1));
    }

    #[test]
    fn test_checksum_detects_flipped_bits() {
        let mut page = vec![0u8; BLCKSZ as usize];
        page[100] = 0xAB;

        let good = pg_checksum_page(&page, 7);
        page[4242] ^= 0x01;
        assert_ne!(good, pg_checksum_page(&page, 7));
    }
}
