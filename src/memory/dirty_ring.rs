// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-vCPU dirty rings.
//!
//! The kernel publishes an entry by storing `KVM_DIRTY_GFN_F_DIRTY` into its flags; the collector
//! reads the entry after an acquire load of the flags and hands it back by storing
//! `KVM_DIRTY_GFN_F_RESET` with release ordering. `KVM_RESET_DIRTY_RINGS` then recycles every
//! reset entry.

use std::mem::size_of;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use kvm_sys::kvm_dirty_gfn;
use kvm_sys::KVM_DIRTY_GFN_F_DIRTY;
use kvm_sys::KVM_DIRTY_GFN_F_RESET;

use crate::mmap::MemoryMapping;

/// Size in bytes of a ring with `entries` entries.
pub fn ring_bytes(entries: u32) -> u64 {
    entries as u64 * size_of::<kvm_dirty_gfn>() as u64
}

/// Returns the flags word of entry `index` in a mapping of `kvm_dirty_gfn`s.
///
/// `index` must be below the number of entries in `mapping`.
pub(crate) fn entry_flags(mapping: &MemoryMapping, index: u32) -> &AtomicU32 {
    debug_assert!((index as usize + 1) * size_of::<kvm_dirty_gfn>() <= mapping.size());
    // SAFETY: the entry lies inside the mapping, `flags` is the first field of the 16 byte aligned
    // entry and the mapping outlives the returned reference.
    unsafe {
        &*(mapping.as_ptr().add(index as usize * size_of::<kvm_dirty_gfn>()) as *const AtomicU32)
    }
}

/// Returns a pointer to entry `index` in a mapping of `kvm_dirty_gfn`s.
pub(crate) fn entry_ptr(mapping: &MemoryMapping, index: u32) -> *mut kvm_dirty_gfn {
    debug_assert!((index as usize + 1) * size_of::<kvm_dirty_gfn>() <= mapping.size());
    // SAFETY: the entry lies inside the mapping.
    unsafe {
        mapping.as_ptr().add(index as usize * size_of::<kvm_dirty_gfn>()) as *mut kvm_dirty_gfn
    }
}

/// A page reported dirty by a ring entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyGfn {
    pub as_id: u16,
    pub slot: u16,
    pub offset: u64,
}

pub struct DirtyRing {
    mapping: MemoryMapping,
    size: u32,
    fetch_index: u32,
}

impl DirtyRing {
    /// Wraps a ring mapping of `size` entries. `size` must be a power of two.
    pub fn new(mapping: MemoryMapping, size: u32) -> DirtyRing {
        DirtyRing {
            mapping,
            size,
            fetch_index: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn fetch_index(&self) -> u32 {
        self.fetch_index
    }

    /// Collects every published entry starting at the fetch index, calling `mark` for each, and
    /// returns the number collected.
    pub fn collect(&mut self, mut mark: impl FnMut(DirtyGfn)) -> u32 {
        let mut count = 0;
        while count < self.size {
            let index = self.fetch_index & (self.size - 1);
            let flags = entry_flags(&self.mapping, index);
            if flags.load(Ordering::Acquire) != KVM_DIRTY_GFN_F_DIRTY {
                break;
            }
            // SAFETY: the entry is inside the mapping and the acquire load above orders this read
            // after the kernel's writes to the entry.
            let entry = unsafe { std::ptr::read_volatile(entry_ptr(&self.mapping, index)) };
            mark(DirtyGfn {
                as_id: (entry.slot >> 16) as u16,
                slot: entry.slot as u16,
                offset: entry.offset,
            });
            flags.store(KVM_DIRTY_GFN_F_RESET, Ordering::Release);
            self.fetch_index = self.fetch_index.wrapping_add(1);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(mapping: &MemoryMapping, index: u32, slot: u32, offset: u64) {
        // SAFETY: test entries are inside the mapping.
        unsafe {
            let entry = entry_ptr(mapping, index);
            (*entry).slot = slot;
            (*entry).offset = offset;
        }
        entry_flags(mapping, index).store(KVM_DIRTY_GFN_F_DIRTY, Ordering::Release);
    }

    #[test]
    fn collect_stops_at_unpublished_entry() {
        let mapping = MemoryMapping::new(ring_bytes(4) as usize).unwrap();
        publish(&mapping, 0, 1, 3);
        publish(&mapping, 1, 0x1_0002, 7);
        let mut ring = DirtyRing::new(mapping, 4);
        let mut seen = Vec::new();
        assert_eq!(ring.collect(|gfn| seen.push(gfn)), 2);
        assert_eq!(
            seen,
            vec![
                DirtyGfn {
                    as_id: 0,
                    slot: 1,
                    offset: 3
                },
                DirtyGfn {
                    as_id: 1,
                    slot: 2,
                    offset: 7
                },
            ]
        );
        assert_eq!(ring.fetch_index(), 2);
        assert_eq!(
            entry_flags(&ring.mapping, 0).load(Ordering::Acquire),
            KVM_DIRTY_GFN_F_RESET
        );
        assert_eq!(ring.collect(|_| ()), 0);
    }

    #[test]
    fn collect_wraps() {
        let mapping = MemoryMapping::new(ring_bytes(2) as usize).unwrap();
        let mut ring = DirtyRing::new(mapping, 2);
        publish(&ring.mapping, 0, 0, 0);
        publish(&ring.mapping, 1, 0, 1);
        assert_eq!(ring.collect(|_| ()), 2);
        entry_flags(&ring.mapping, 0).store(0, Ordering::Release);
        publish(&ring.mapping, 0, 0, 2);
        let mut offsets = Vec::new();
        assert_eq!(ring.collect(|gfn| offsets.push(gfn.offset)), 1);
        assert_eq!(offsets, vec![2]);
    }
}
