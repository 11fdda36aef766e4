//! Precode Validity Check via Compressed Histograms
//!
//! The hot inner test of speculative block-boundary search: given the
//! 4-bit code-length count and the up-to-57 bits of packed precode
//! (19 x 3-bit code lengths) of a candidate dynamic DEFLATE block, decide
//! branchlessly whether the precode alphabet can form a valid canonical
//! prefix code.
//!
//! The histogram over the 3-bit code lengths is bit-packed into a single
//! 32-bit word with variable field widths. The widths exploit DEFLATE's
//! no-bloating rule:
//!
//! ```text
//! Counted value:    7     6     5     4    3   2  1   non-0
//!                 +----+-----+-----+-----+---+---+--+ +-----+
//! Storage bits:   | 4  |  5  |  5  |  4  | 3 | 2 |1 | |  5  |
//!                 +----+-----+-----+-----+---+---+--+ +-----+
//! ```
//!
//! Summation works on whole packed words: a 12-bit LUT maps four 3-bit
//! lengths to a partial histogram, five lookups and four additions cover
//! all 19 lengths. Carries across field boundaries are detected without
//! branches by XOR-ing the carryless sum against the real sum and
//! OR-accumulating the masks.
//!
//! The 24 histogram bits above the non-zero count index a 2 MiB bit table
//! of realizable histograms. Histograms whose counts overflow their packed
//! fields (2, 4, 8, or 16 codes of a single length) are caught beforehand
//! by comparing against the per-non-zero-count special-case table.

use std::sync::LazyLock;

use crate::error::{PargzError, PargzResult};

/// Bits per precode code length in the DEFLATE stream.
pub const PRECODE_BITS: u32 = 3;

/// Maximum number of precode code lengths (HCLEN + 4).
pub const MAX_PRECODE_COUNT: u32 = 19;

/// Packed histogram word.
pub type Histogram = u32;

/// Field widths for counted values 0..=7; value 0 is the non-zero count.
const MEMBER_BIT_WIDTHS: [u32; 8] = [5, 1, 2, 3, 4, 5, 5, 4];

const MEMBER_OFFSETS: [u32; 8] = {
    let mut offsets = [0u32; 8];
    let mut sum = 0;
    let mut i = 0;
    while i < 8 {
        offsets[i] = sum;
        sum += MEMBER_BIT_WIDTHS[i];
        i += 1;
    }
    offsets
};

/// First bit above the topmost count field; everything from here up is
/// overflow-tracking space.
const OVERFLOW_MEMBER_OFFSET: u32 = MEMBER_OFFSETS[7] + MEMBER_BIT_WIDTHS[7];

/// Lowest bit of every field, including the non-zero count.
const LOWEST_MEMBER_BITS_MASK: Histogram = {
    let mut mask = 0;
    let mut i = 0;
    while i < 8 {
        mask |= 1 << MEMBER_OFFSETS[i];
        i += 1;
    }
    mask
};

/// Bits whose being set after the carryless-XOR comparison indicates a
/// carry into a field (or out of the topmost one).
const OVERFLOW_BITS_MASK: Histogram =
    LOWEST_MEMBER_BITS_MASK | (!0u32 << OVERFLOW_MEMBER_OFFSET);

/// How many of the packed histogram's bits participate in the validity
/// lookup (everything except the non-zero count).
const HISTOGRAM_TO_LOOK_UP_BITS: u32 =
    MEMBER_OFFSETS[7] - MEMBER_BIT_WIDTHS[0] + MEMBER_BIT_WIDTHS[7];

const fn n_lowest_bits_u32(count: u32) -> u32 {
    if count >= 32 {
        !0
    } else {
        (1u32 << count) - 1
    }
}

const fn n_lowest_bits_u64(count: u32) -> u64 {
    if count >= 64 {
        !0
    } else {
        (1u64 << count) - 1
    }
}

const fn get_count(histogram: Histogram, value: usize) -> u32 {
    (histogram >> MEMBER_OFFSETS[value]) & n_lowest_bits_u32(MEMBER_BIT_WIDTHS[value])
}

/// Plain addition no matter the overflow, to keep summation associative;
/// an overflowing increment additionally sets the lowest overflow bit.
const fn increment_count(histogram: Histogram, value: usize) -> Histogram {
    let old_count = get_count(histogram, value);
    let new_histogram = histogram.wrapping_add(1 << MEMBER_OFFSETS[value]);
    if old_count + 1 < (1 << MEMBER_BIT_WIDTHS[value]) {
        new_histogram
    } else {
        new_histogram | (1 << OVERFLOW_MEMBER_OFFSET)
    }
}

const fn calculate_histogram(values: u64, value_count: u32) -> Histogram {
    let mut histogram: Histogram = 0;
    let mut i = 0;
    while i < value_count {
        let value = (values >> (i * PRECODE_BITS)) & 0b111;
        if value > 0 {
            histogram = increment_count(histogram, value as usize);
            // Non-zero count, value 0 at offset 0. Cannot overflow: at most
            // 19 values are ever summed into the 5-bit field.
            histogram += 1;
        }
        i += 1;
    }
    histogram
}

/// Number of 3-bit code lengths folded into one LUT key.
const PRECODES_PER_CHUNK: u32 = 4;
const CACHED_BITS: u32 = PRECODE_BITS * PRECODES_PER_CHUNK;
const CHUNK_COUNT: usize =
    ((MAX_PRECODE_COUNT + PRECODES_PER_CHUNK - 1) / PRECODES_PER_CHUNK) as usize;

/// 12-bit key (four 3-bit lengths) -> partial packed histogram. 16 KiB.
static PRECODE_X4_TO_HISTOGRAM_LUT: [Histogram; 1 << CACHED_BITS] = {
    let mut lut = [0u32; 1 << CACHED_BITS];
    let mut i = 0;
    while i < lut.len() {
        lut[i] = calculate_histogram(i as u64, PRECODES_PER_CHUNK);
        i += 1;
    }
    lut
};

/// Pack a plain `counts[depth-1]` histogram into the compressed format, or
/// `None` when a count does not fit its field (those cases are covered by
/// [`POWER_OF_TWO_SPECIAL_CASES`]).
fn pack_histogram(counts: &[u8; 7]) -> Option<Histogram> {
    let mut packed: Histogram = 0;
    for (i, &count) in counts.iter().enumerate() {
        let value = i + 1;
        if u32::from(count) >= (1 << MEMBER_BIT_WIDTHS[value]) {
            return None;
        }
        packed |= Histogram::from(count) << MEMBER_OFFSETS[value];
    }
    Some(packed)
}

/// Recursively enumerate every histogram of a complete prefix tree (Kraft
/// sum exactly one) with at most [`MAX_PRECODE_COUNT`] codes of depth <= 7
/// and set its bit in the validity table.
fn mark_valid_histograms(
    lut: &mut [u64],
    counts: &mut [u8; 7],
    depth: usize,
    free_leaves: u32,
    total: u32,
) {
    if depth > 7 {
        if free_leaves == 0 && total > 0 {
            if let Some(packed) = pack_histogram(counts) {
                let index = packed >> MEMBER_BIT_WIDTHS[0];
                lut[(index / 64) as usize] |= 1u64 << (index % 64);
            }
        }
        return;
    }

    let max_count = free_leaves.min(MAX_PRECODE_COUNT - total);
    for count in 0..=max_count {
        counts[depth - 1] = count as u8;
        mark_valid_histograms(
            lut,
            counts,
            depth + 1,
            (free_leaves - count) * 2,
            total + count,
        );
    }
    counts[depth - 1] = 0;
}

/// 2^24 bits (2 MiB): whether a 24-bit compressed histogram is realizable
/// as a valid canonical prefix code. Built once at first use; the
/// enumeration of complete trees is too heavy for const evaluation.
static PRECODE_HISTOGRAM_VALID_LUT: LazyLock<Vec<u64>> = LazyLock::new(|| {
    let mut lut = vec![0u64; (1usize << HISTOGRAM_TO_LOOK_UP_BITS) / 64];
    let mut counts = [0u8; 7];
    mark_valid_histograms(&mut lut, &mut counts, 1, 2, 0);
    lut
});

/// Maps a non-zero count to the single valid histogram whose packed
/// representation overflows its field, or to a sentinel that never compares
/// equal. Counts 2, 4, 8, and 16 of one length are complete trees whose
/// field-overflowed representation carries into the next field; they are
/// accepted here instead of through the validity table. A lone 1-bit code
/// (index 1) is incomplete but permitted for precodes.
#[allow(clippy::unusual_byte_groupings)]
const POWER_OF_TWO_SPECIAL_CASES: [Histogram; 32] = {
    let mut lut = [!0u32; 32];
    /* An empty alphabet is not legal for the precode. */
    lut[1] = 0b0000_00000_00000_0000_000_00_1;
    lut[2] = 0b0000_00000_00000_0000_000_01_0; /* carry out of the 1-count bin */
    lut[4] = 0b0000_00000_00000_0000_001_00_0; /* carry out of the 2-count bin */
    lut[8] = 0b0000_00000_00000_0001_000_00_0; /* carry out of the 3-count bin */
    lut[16] = 0b0000_00000_00001_0000_000_00_0; /* carry out of the 4-count bin */
    lut
};

/// Check a candidate precode for validity.
///
/// `next4_bits` is the HCLEN field (code length count - 4), `next57_bits`
/// the following 57 bits of the stream holding up to 19 packed 3-bit code
/// lengths. Reading all 57 bits unconditionally avoids a data dependency
/// on the count; excess high bits are masked off here.
pub fn check_precode(next4_bits: u64, next57_bits: u64) -> PargzResult<()> {
    let code_length_count = 4 + (next4_bits & 0b1111) as u32;
    let precode_bits = next57_bits & n_lowest_bits_u64(code_length_count * PRECODE_BITS);

    let mut bit_length_frequencies: Histogram = 0;
    let mut overflows_in_sum: Histogram = 0;
    let mut overflows_in_lut: Histogram = 0;

    for chunk in 0..CHUNK_COUNT {
        let mut precode_chunk = precode_bits >> (chunk as u32 * CACHED_BITS);
        // The last chunk is already masked via precode_bits.
        if chunk != CHUNK_COUNT - 1 {
            precode_chunk &= n_lowest_bits_u64(CACHED_BITS);
        }

        let partial_histogram = PRECODE_X4_TO_HISTOGRAM_LUT[precode_chunk as usize];

        // The XOR of the operands is the carryless sum; XOR-ing it against
        // the real sum leaves exactly the bits a carry flowed into.
        let carryless_sum = bit_length_frequencies ^ partial_histogram;
        bit_length_frequencies = bit_length_frequencies.wrapping_add(partial_histogram);
        overflows_in_sum |= carryless_sum ^ bit_length_frequencies;
        overflows_in_lut |= partial_histogram;
    }

    // Drop the non-zero count and the overflow region for the lookup.
    let histogram_to_look_up = (bit_length_frequencies >> MEMBER_BIT_WIDTHS[0])
        & n_lowest_bits_u32(HISTOGRAM_TO_LOOK_UP_BITS);
    let non_zero_count = bit_length_frequencies & n_lowest_bits_u32(MEMBER_BIT_WIDTHS[0]);

    if POWER_OF_TWO_SPECIAL_CASES[non_zero_count as usize] == histogram_to_look_up {
        return Ok(());
    }

    if (overflows_in_sum & OVERFLOW_BITS_MASK) != 0
        || (overflows_in_lut & (!0u32 << OVERFLOW_MEMBER_OFFSET)) != 0
    {
        return Err(PargzError::InvalidCodeLengths);
    }

    let bit_to_look_up = 1u64 << (histogram_to_look_up % 64);
    let element_index = (histogram_to_look_up / 64) as usize;
    if PRECODE_HISTOGRAM_VALID_LUT[element_index] & bit_to_look_up == 0 {
        // Also covers the all-zero histogram; an empty alphabet and a
        // merely bloating one are not distinguished here.
        return Err(PargzError::BloatingHuffmanCoding);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack code lengths into the LSB-first 57-bit precode field.
    fn pack_lengths(lengths: &[u8]) -> (u64, u64) {
        assert!(lengths.len() >= 4 && lengths.len() <= 19);
        let next4 = (lengths.len() - 4) as u64;
        let mut next57 = 0u64;
        for (i, &len) in lengths.iter().enumerate() {
            assert!(len <= 7);
            next57 |= u64::from(len) << (i as u32 * PRECODE_BITS);
        }
        (next4, next57)
    }

    #[test]
    fn test_member_layout() {
        assert_eq!(MEMBER_OFFSETS, [0, 5, 6, 8, 11, 15, 20, 25]);
        assert_eq!(OVERFLOW_MEMBER_OFFSET, 29);
        assert_eq!(HISTOGRAM_TO_LOOK_UP_BITS, 24);
        assert_eq!(
            LOWEST_MEMBER_BITS_MASK,
            0b0001_00001_00001_0001_001_01_1_00001
        );
        assert_eq!(
            OVERFLOW_BITS_MASK,
            0b111_0001_00001_00001_0001_001_01_1_00001
        );
    }

    #[test]
    fn test_chunk_lut_counts_values() {
        // Key 0b011_011_010_001 = lengths [1, 2, 3, 3].
        let key = 0b011_011_010_001usize;
        let histogram = PRECODE_X4_TO_HISTOGRAM_LUT[key];
        assert_eq!(get_count(histogram, 0), 4);
        assert_eq!(get_count(histogram, 1), 1);
        assert_eq!(get_count(histogram, 2), 1);
        assert_eq!(get_count(histogram, 3), 2);
        assert_eq!(get_count(histogram, 7), 0);
    }

    #[test]
    fn test_complete_small_tree_is_valid() {
        // 1/2 + 1/4 + 2/8 = 1: a complete tree.
        let (next4, next57) = pack_lengths(&[1, 2, 3, 3]);
        assert!(check_precode(next4, next57).is_ok());
    }

    #[test]
    fn test_complete_full_alphabet_is_valid() {
        // 19 codes: 1/4 + 2/8 + 4/16 + 4/32 + 8/64 = 1.
        let mut lengths = vec![2u8];
        lengths.extend_from_slice(&[3, 3]);
        lengths.extend_from_slice(&[4; 4]);
        lengths.extend_from_slice(&[5; 4]);
        lengths.extend_from_slice(&[6; 8]);
        let (next4, next57) = pack_lengths(&lengths);
        assert!(check_precode(next4, next57).is_ok());
    }

    #[test]
    fn test_single_length_one_code_is_valid() {
        // Incomplete but explicitly permitted via the special-case table.
        let (next4, next57) = pack_lengths(&[1, 0, 0, 0]);
        assert!(check_precode(next4, next57).is_ok());
    }

    #[test]
    fn test_power_of_two_trees_are_valid() {
        // Exactly 2^k codes of length k form complete trees whose packed
        // counts overflow their fields.
        let (next4, next57) = pack_lengths(&[1, 1, 0, 0]);
        assert!(check_precode(next4, next57).is_ok());

        let (next4, next57) = pack_lengths(&[2, 2, 2, 2]);
        assert!(check_precode(next4, next57).is_ok());

        let (next4, next57) = pack_lengths(&[3; 8]);
        assert!(check_precode(next4, next57).is_ok());

        let (next4, next57) = pack_lengths(&[4; 16]);
        assert!(check_precode(next4, next57).is_ok());
    }

    #[test]
    fn test_all_zero_lengths_are_bloating() {
        assert!(matches!(
            check_precode(0, 0),
            Err(PargzError::BloatingHuffmanCoding)
        ));
    }

    #[test]
    fn test_incomplete_tree_is_bloating() {
        // 1/2 + 1/4 < 1: unused leaves.
        let (next4, next57) = pack_lengths(&[1, 2, 0, 0]);
        assert!(matches!(
            check_precode(next4, next57),
            Err(PargzError::BloatingHuffmanCoding)
        ));
    }

    #[test]
    fn test_oversubscribed_tree_is_invalid() {
        // Three codes of length 1 overflow the 1-count bin.
        let (next4, next57) = pack_lengths(&[1, 1, 1, 0]);
        assert!(matches!(
            check_precode(next4, next57),
            Err(PargzError::InvalidCodeLengths)
        ));
    }

    #[test]
    fn test_excess_bits_beyond_count_are_ignored() {
        // Four lengths [1, 2, 3, 3] with garbage above them.
        let (next4, next57) = pack_lengths(&[1, 2, 3, 3]);
        let garbage = 0b111_111_111u64 << 12;
        assert!(check_precode(next4, next57 | garbage).is_ok());
    }

    #[test]
    fn test_special_cases_are_accepted_per_table() {
        for (count, &histogram) in POWER_OF_TWO_SPECIAL_CASES.iter().enumerate() {
            if histogram == !0 || count == 0 {
                continue;
            }
            // The special-cased histograms are exactly the representations
            // of 2^k codes of one length; reconstruct and verify.
            let lengths: Vec<u8> = match count {
                1 => vec![1, 0, 0, 0],
                2 => vec![1, 1, 0, 0],
                4 => vec![2; 4],
                8 => vec![3; 8],
                16 => vec![4; 16],
                _ => panic!("unexpected special case index {count}"),
            };
            let (next4, next57) = pack_lengths(&lengths);
            assert!(
                check_precode(next4, next57).is_ok(),
                "special case for count {count} rejected"
            );
        }
    }

    #[test]
    fn test_validity_lut_spot_checks() {
        // {1: 1, 2: 2} is complete and packs without overflow.
        let packed = pack_histogram(&[1, 2, 0, 0, 0, 0, 0]).unwrap();
        let index = packed >> MEMBER_BIT_WIDTHS[0];
        assert!(
            PRECODE_HISTOGRAM_VALID_LUT[(index / 64) as usize] & (1 << (index % 64)) != 0
        );

        // {1: 1} alone is incomplete and must not be in the table.
        let packed = pack_histogram(&[1, 0, 0, 0, 0, 0, 0]).unwrap();
        let index = packed >> MEMBER_BIT_WIDTHS[0];
        assert!(
            PRECODE_HISTOGRAM_VALID_LUT[(index / 64) as usize] & (1 << (index % 64)) == 0
        );
    }
}
