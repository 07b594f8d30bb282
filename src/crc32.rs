//! CRC32 helpers for joined files
//!
//! Segments are checksummed individually as they are written. When a file is
//! assembled, the per-segment values are folded into the checksum of the whole
//! file with [`combine`], without reading the data again.

use crc32fast::Hasher;

/// CRC32 of a byte slice
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC32 of `A ++ B` given `crc(A)`, `crc(B)` and the length of `B`
#[must_use]
pub fn combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    let mut whole = Hasher::new_with_initial_len(crc1, 0);
    whole.combine(&Hasher::new_with_initial_len(crc2, len2));
    whole.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn checksum_matches_reference_value() {
        assert_eq!(checksum(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn combine_equals_crc_of_concatenation() {
        let lengths = [
            (1usize, 1usize),
            (100, 50),
            (7, 4096),
            (24, 100_003),
            (384_000, 1),
            (3, 1_000_003),
        ];
        for &(la, lb) in &lengths {
            let a = pattern(la, 1);
            let b = pattern(lb, 77);
            let whole: Vec<u8> = a.iter().chain(b.iter()).copied().collect();

            let combined = combine(checksum(&a), checksum(&b), lb as u64);

            assert_eq!(combined, checksum(&whole), "lengths {la}+{lb}");
        }
    }

    #[test]
    fn combine_with_empty_second_part_keeps_first() {
        let a = pattern(10, 3);
        assert_eq!(combine(checksum(&a), 0, 0), checksum(&a));
    }

    #[test]
    fn combine_with_empty_first_part() {
        let b = pattern(513, 9);
        assert_eq!(combine(checksum(&[]), checksum(&b), b.len() as u64), checksum(&b));
    }

    #[test]
    fn combine_folds_many_segments_left_to_right() {
        let parts: Vec<Vec<u8>> = (0..5).map(|i| pattern(1000 + i * 17, i as u8)).collect();
        let whole: Vec<u8> = parts.iter().flatten().copied().collect();

        let mut crc = checksum(&parts[0]);
        for part in &parts[1..] {
            crc = combine(crc, checksum(part), part.len() as u64);
        }

        assert_eq!(crc, checksum(&whole));
    }
}
