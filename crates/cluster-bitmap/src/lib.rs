//! One-bit-per-cluster bitmaps. Used by the FAT engine both as the exFAT
//! allocation bitmap window and as the scratch "reachable clusters" map built
//! by the consistency checker.
//!
//! Bit `n` lives in byte `n / 8` at bit position `n % 8` (least significant
//! bit first), which is the exFAT on-disk layout.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_hasher,
    clippy::implicit_return,
    clippy::len_without_is_empty,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::redundant_pub_crate,
    clippy::suboptimal_flops,
    clippy::upper_case_acronyms,
    clippy::wildcard_imports
)]

use core::ops::Range;

/// A bitmap over some backing bytes. A 1 bit means the cluster is in use.
///
/// The backing storage is generic so the same code works over a borrowed
/// window of a sector buffer and over an owned buffer.
#[derive(Debug, Clone)]
pub struct ClusterBitmap<B> {
    bitmap: B,
    len: usize,
}

impl<B: AsRef<[u8]>> ClusterBitmap<B> {
    pub const BITS_PER_CHUNK: usize = u8::BITS as usize;

    /// Creates a bitmap covering every bit of `bitmap`.
    pub fn new(bitmap: B) -> Self {
        let len = bitmap.as_ref().len() * Self::BITS_PER_CHUNK;
        Self { bitmap, len }
    }

    /// Creates a bitmap covering only the first `len` bits of `bitmap`. Bits
    /// past `len` are never looked at or modified.
    pub fn with_len(bitmap: B, len: usize) -> Self {
        assert!(
            len <= bitmap.as_ref().len() * Self::BITS_PER_CHUNK,
            "bitmap of {} bytes cannot hold {len} bits",
            bitmap.as_ref().len()
        );
        Self { bitmap, len }
    }

    /// Number of tracked bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bitmap.as_ref()
    }

    /// Returns `None` if `bit` is out of range.
    pub fn is_used(&self, bit: usize) -> Option<bool> {
        if bit >= self.len {
            return None;
        }
        let byte = self.bitmap.as_ref()[bit / Self::BITS_PER_CHUNK];
        let mask = 1 << (bit % Self::BITS_PER_CHUNK);
        Some(byte & mask != 0)
    }

    /// Finds the first clear bit in `bits`, which is clipped to the bitmap.
    pub fn find_unused_in(&self, bits: Range<usize>) -> Option<usize> {
        let to = bits.end.min(self.len);
        let mut bit = bits.start;
        while bit < to {
            // Shortcut: if the whole byte is in range and all of its bits are
            // set, we can skip it.
            if bit % Self::BITS_PER_CHUNK == 0
                && bit + Self::BITS_PER_CHUNK <= to
                && self.bitmap.as_ref()[bit / Self::BITS_PER_CHUNK] == 0xFF
            {
                bit += Self::BITS_PER_CHUNK;
                continue;
            }
            if self.is_used(bit) == Some(false) {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }

    /// Number of set bits in `bits`, which is clipped to the bitmap.
    pub fn count_used_in(&self, bits: Range<usize>) -> usize {
        let to = bits.end.min(self.len);
        let mut bit = bits.start;
        let mut used = 0;
        while bit < to {
            if bit % Self::BITS_PER_CHUNK == 0 && bit + Self::BITS_PER_CHUNK <= to {
                used += self.bitmap.as_ref()[bit / Self::BITS_PER_CHUNK].count_ones() as usize;
                bit += Self::BITS_PER_CHUNK;
                continue;
            }
            if self.is_used(bit) == Some(true) {
                used += 1;
            }
            bit += 1;
        }
        used
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ClusterBitmap<B> {
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bitmap.as_mut()
    }

    /// Marks `bit` as used. Returns `false` if it was already used, which the
    /// checker relies on to spot two chains claiming the same cluster.
    pub fn mark_used(&mut self, bit: usize) -> bool {
        assert!(bit < self.len, "bit {bit} out of range (len {})", self.len);
        let index = bit / Self::BITS_PER_CHUNK;
        let mask = 1 << (bit % Self::BITS_PER_CHUNK);
        let bytes = self.bitmap.as_mut();
        let was_unused = bytes[index] & mask == 0;
        bytes[index] |= mask;
        was_unused
    }

    /// Marks `bit` as unused. Returns `false` if it was already unused.
    pub fn mark_unused(&mut self, bit: usize) -> bool {
        assert!(bit < self.len, "bit {bit} out of range (len {})", self.len);
        let index = bit / Self::BITS_PER_CHUNK;
        let mask = 1 << (bit % Self::BITS_PER_CHUNK);
        let bytes = self.bitmap.as_mut();
        let was_used = bytes[index] & mask != 0;
        bytes[index] &= !mask;
        was_used
    }

    pub fn set(&mut self, bit: usize, used: bool) {
        if used {
            self.mark_used(bit);
        } else {
            self.mark_unused(bit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use proptest::prelude::*;

    #[test]
    fn simple_test() {
        let mut bitmap = ClusterBitmap::new([0_u8; 2]);
        assert_eq!(bitmap.len(), 16);

        assert!(bitmap.mark_used(0));
        assert!(bitmap.mark_used(3));
        assert!(!bitmap.mark_used(3));
        bitmap.set(9, true);
        assert_eq!(bitmap.as_bytes(), [0b0000_1001, 0b0000_0010]);
        assert_eq!(bitmap.count_used_in(0..16), 3);
        assert_eq!(bitmap.find_unused_in(0..16), Some(1));

        assert!(bitmap.mark_unused(0));
        assert!(!bitmap.mark_unused(0));
        bitmap.set(9, false);
        assert_eq!(bitmap.as_bytes(), [0b0000_1000, 0]);
        assert_eq!(bitmap.is_used(3), Some(true));
        assert_eq!(bitmap.is_used(16), None);
    }

    #[test]
    fn with_len_ignores_trailing_bits() {
        let mut bitmap = ClusterBitmap::with_len([0xFF_u8, 0b0000_0011], 10);
        assert_eq!(bitmap.find_unused_in(0..100), None);
        assert_eq!(bitmap.count_used_in(0..100), 10);
        assert_eq!(bitmap.is_used(10), None);

        bitmap.mark_unused(9);
        assert_eq!(bitmap.find_unused_in(0..100), Some(9));
        assert_eq!(bitmap.count_used_in(8..10), 1);
    }

    #[test]
    fn find_unused_skips_full_bytes() {
        let mut bitmap = ClusterBitmap::new([0xFF_u8; 4]);
        bitmap.mark_unused(2);
        bitmap.mark_unused(21);
        assert_eq!(bitmap.find_unused_in(0..32), Some(2));
        assert_eq!(bitmap.find_unused_in(3..32), Some(21));
        assert_eq!(bitmap.find_unused_in(3..21), None);
        assert_eq!(bitmap.find_unused_in(20..20), None);
    }

    #[test]
    fn as_bytes_mut_writes_through() {
        let mut bitmap = ClusterBitmap::new(vec![0_u8; 2]);
        bitmap.as_bytes_mut()[1] = 0b1000_0000;
        assert_eq!(bitmap.is_used(15), Some(true));
        assert_eq!(bitmap.count_used_in(0..16), 1);
    }

    #[derive(Debug, Clone)]
    enum MarkOrClear {
        Mark(usize),
        Clear(usize),
    }

    fn mark_or_clear_strategy(max_bit: usize) -> impl Strategy<Value = MarkOrClear> {
        prop_oneof![
            (0..max_bit).prop_map(MarkOrClear::Mark),
            (0..max_bit).prop_map(MarkOrClear::Clear),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 2_000, .. ProptestConfig::default()
        })]

        #[test]
        fn matches_set_model(
            len in 1..120_usize,
            ops in prop::collection::vec(mark_or_clear_strategy(120), 1..60),
            range_start in 0..130_usize,
            range_len in 0..130_usize,
        ) {
            let mut bitmap = ClusterBitmap::with_len(vec![0_u8; 16], len);
            let mut used = BTreeSet::new();

            for op in ops {
                match op {
                    MarkOrClear::Mark(bit) if bit < len => {
                        prop_assert_eq!(bitmap.mark_used(bit), used.insert(bit));
                    }
                    MarkOrClear::Clear(bit) if bit < len => {
                        prop_assert_eq!(bitmap.mark_unused(bit), used.remove(&bit));
                    }
                    _ => {}
                }
            }

            let range = range_start..range_start + range_len;
            let expected_free = range
                .clone()
                .take_while(|&bit| bit < len)
                .find(|bit| !used.contains(bit));
            prop_assert_eq!(bitmap.find_unused_in(range.clone()), expected_free);
            let expected_used = used.iter().filter(|bit| range.contains(bit)).count();
            prop_assert_eq!(bitmap.count_used_in(range), expected_used);
        }
    }
}
