// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use log::error;

use crate::hypervisor::MemFlags;
use crate::memory::align_section;
use crate::memory::bitmap;
use crate::memory::slots::MemSlot;
use crate::memory::MemorySection;
use crate::memory::MemorySlots;
use crate::Error;
use crate::Result;

/// Pages covered by one 64-bit word of a dirty bitmap.
const PAGES_PER_WORD: u64 = 64;

/// Allocates the dirty bitmap of a logging slot if it does not have one yet.
///
/// The bitmap is sized in whole words so the kernel can always write full words.
pub fn init_bitmap(slot: &mut MemSlot, page_size: u64) {
    if !slot.flags.contains(MemFlags::LOG_DIRTY_PAGES) || slot.dirty_bmap.is_some() {
        return;
    }
    let pages = slot.pages(page_size).next_multiple_of(PAGES_PER_WORD);
    slot.dirty_bmap = Some(vec![0u64; bitmap::words_for(pages)].into_boxed_slice());
}

impl MemorySlots {
    /// Fetches the kernel dirty log of `slot` into its bitmap.
    ///
    /// A slot the kernel keeps no log for reports no dirty pages.
    pub(super) fn get_dirty_log(&self, slot: &mut MemSlot) -> Result<()> {
        let kernel_slot = slot.kernel_slot();
        let Some(bmap) = slot.dirty_bmap.as_mut() else {
            return Ok(());
        };
        match self.vm.get_dirty_log(kernel_slot, bmap) {
            Ok(()) => Ok(()),
            Err(e) if e.errno() == libc::ENOENT => {
                bmap.fill(0);
                Ok(())
            }
            Err(err) => Err(Error::GetDirtyLog {
                slot: kernel_slot,
                err,
            }),
        }
    }

    /// Fetches the dirty logs of the slots of `section` and forwards them to the dirty sink.
    ///
    /// With dirty rings the kernel keeps no per-slot log; callers use `sync_global` instead.
    pub fn log_sync(&self, as_id: u16, section: &MemorySection) -> Result<()> {
        if self.policy.dirty_ring {
            return Ok(());
        }
        let (mut start_addr, mut size) = align_section(section, self.policy.page_size);
        let mut state = self.state.lock();
        let Some(table) = state.spaces.get_mut(as_id as usize) else {
            return Ok(());
        };
        while size > 0 {
            let slot_size = self.policy.max_slot_size.min(size);
            let Some(index) = table.find_by_range(start_addr, slot_size) else {
                return Ok(());
            };
            if let Some(slot) = table
                .get_mut(index)
                .filter(|s| s.flags.contains(MemFlags::LOG_DIRTY_PAGES))
            {
                match self.get_dirty_log(slot) {
                    Ok(()) => self.sync_dirty_pages(slot),
                    Err(e) => error!("{}", e),
                }
            }
            start_addr += slot_size;
            size -= slot_size;
        }
        Ok(())
    }

    /// Re-protects the pages of `section` that were reported dirty so later writes are logged
    /// again. Only meaningful with manual dirty log protection.
    pub fn log_clear(&self, as_id: u16, section: &MemorySection) -> Result<()> {
        if !self.policy.manual_protect {
            return Ok(());
        }
        // The range is not page aligned here; clear_one_slot works on pages inside it.
        let start = section.offset_within_address_space;
        let size = section.size;
        if size == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let Some(table) = state.spaces.get_mut(as_id as usize) else {
            return Ok(());
        };
        for slot in table.iter_mut() {
            if slot.is_empty()
                || slot.start_addr > start + size - 1
                || start > slot.start_addr + slot.memory_size - 1
            {
                continue;
            }
            let (offset, count) = if start >= slot.start_addr {
                let offset = start - slot.start_addr;
                (offset, (slot.memory_size - offset).min(size))
            } else {
                (0, slot.memory_size.min(size - (slot.start_addr - start)))
            };
            self.clear_one_slot(slot, offset, count)?;
        }
        Ok(())
    }

    /// Clears `[start, start + size)`, in bytes relative to the slot, from both the kernel log
    /// and the cached bitmap of `slot`.
    ///
    /// The kernel takes the range as 64-page aligned windows of bitmap. When the window does not
    /// match the request a temporary bitmap holding only the requested bits is handed to the
    /// kernel, so pages outside `[start, start + size)` stay protected as they were.
    pub(super) fn clear_one_slot(&self, slot: &mut MemSlot, start: u64, size: u64) -> Result<()> {
        let psize = self.policy.page_size;
        let align = psize * PAGES_PER_WORD;
        let kernel_slot = slot.kernel_slot();
        let end_page = slot.memory_size / psize;
        let Some(bmap) = slot.dirty_bmap.as_mut() else {
            return Ok(());
        };

        let bmap_start_bytes = start & !(align - 1);
        let start_delta_bytes = start - bmap_start_bytes;
        let bmap_start = bmap_start_bytes / psize;
        let mut bmap_npages = (size + start_delta_bytes).div_ceil(align) * align / psize;
        if bmap_npages > end_page - bmap_start {
            bmap_npages = end_page - bmap_start;
        }
        let start_delta = start_delta_bytes / psize;
        let count = size / psize;

        let result = if start_delta != 0 || bmap_npages != count {
            let mut clear = vec![0u64; bitmap::words_for(bmap_npages)];
            bitmap::copy_with_src_offset(&mut clear, &bmap[..], bmap_start, start_delta + count);
            bitmap::clear_range(&mut clear, 0, start_delta);
            self.vm
                .clear_dirty_log(kernel_slot, bmap_start, bmap_npages as u32, &clear)
        } else {
            let first_word = (bmap_start / PAGES_PER_WORD) as usize;
            self.vm
                .clear_dirty_log(kernel_slot, bmap_start, bmap_npages as u32, &bmap[first_word..])
        };
        if let Err(err) = result {
            if err.errno() != libc::ENOENT {
                return Err(Error::ClearDirtyLog {
                    slot: kernel_slot,
                    err,
                });
            }
        }

        debug!(
            "cleared dirty log of slot {:#x}: pages {}..{}",
            kernel_slot,
            bmap_start + start_delta,
            bmap_start + start_delta + count
        );
        bitmap::clear_range(bmap, bmap_start + start_delta, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_rounds_up_to_words() {
        let mut slot = MemSlot {
            memory_size: 65 * 0x1000,
            flags: MemFlags::LOG_DIRTY_PAGES,
            ..Default::default()
        };
        init_bitmap(&mut slot, 0x1000);
        assert_eq!(slot.dirty_bmap.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn no_bitmap_without_logging() {
        let mut slot = MemSlot {
            memory_size: 0x1000,
            ..Default::default()
        };
        init_bitmap(&mut slot, 0x1000);
        assert!(slot.dirty_bmap.is_none());
    }
}
