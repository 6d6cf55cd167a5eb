// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Page bitmaps are arrays of u64 words; page `n` is bit `n % 64` of word `n / 64`, which matches
// the kernel's little-endian `unsigned long` bitmaps on the hosts KVM runs on.

const BITS: u64 = u64::BITS as u64;

/// Number of words needed to hold `bits` bits.
pub fn words_for(bits: u64) -> usize {
    bits.div_ceil(BITS) as usize
}

pub fn set_bit(bitmap: &mut [u64], bit: u64) {
    bitmap[(bit / BITS) as usize] |= 1 << (bit % BITS);
}

pub fn test_bit(bitmap: &[u64], bit: u64) -> bool {
    bitmap[(bit / BITS) as usize] & (1 << (bit % BITS)) != 0
}

/// Clears `count` bits starting at `start`.
pub fn clear_range(bitmap: &mut [u64], start: u64, count: u64) {
    let mut bit = start;
    let end = start + count;
    while bit < end {
        let word = (bit / BITS) as usize;
        let shift = bit % BITS;
        let span = (BITS - shift).min(end - bit);
        let mask = if span == BITS {
            u64::MAX
        } else {
            ((1u64 << span) - 1) << shift
        };
        bitmap[word] &= !mask;
        bit += span;
    }
}

/// Copies `count` bits of `src` starting at bit `src_offset` to the start of `dst`. Bits of `dst`
/// past `count` are cleared.
pub fn copy_with_src_offset(dst: &mut [u64], src: &[u64], src_offset: u64, count: u64) {
    dst.fill(0);
    for i in 0..count {
        if test_bit(src, src_offset + i) {
            set_bit(dst, i);
        }
    }
}

pub fn count_ones(bitmap: &[u64]) -> u64 {
    bitmap.iter().map(|w| w.count_ones() as u64).sum()
}
