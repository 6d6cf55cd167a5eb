// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory slots and dirty page tracking.

pub mod bitmap;
mod dirty_log;
pub mod dirty_ring;
pub mod shadow;
pub mod slots;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;
use sync::Mutex;
use thiserror::Error as ThisError;

use crate::hypervisor::MemFlags;
use crate::hypervisor::Vm;
use crate::memory::dirty_ring::DirtyGfn;
use crate::memory::dirty_ring::DirtyRing;
use crate::memory::shadow::ShadowSlotTable;
use crate::memory::slots::commit_slot;
use crate::memory::slots::MemSlot;
use crate::memory::slots::SlotTable;
use crate::Error;
use crate::Result;

pub use dirty_log::init_bitmap;

/// A page-granular piece of a memory region as seen in one address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySection {
    /// Guest physical address of the section.
    pub offset_within_address_space: u64,
    pub size: u64,
    /// Offset of the section inside its memory region.
    pub offset_within_region: u64,
    /// Host virtual address of the start of the region.
    pub host_base: u64,
    /// Offset of the start of the region in the ram address space.
    pub ram_offset: u64,
    pub is_ram: bool,
    pub readonly: bool,
    pub rom_device: bool,
    /// A ROM device in ROMD mode reads directly from memory.
    pub romd_mode: bool,
    /// The region wants its dirty pages tracked.
    pub dirty_log: bool,
}

impl MemorySection {
    fn writable(&self) -> bool {
        !self.readonly && !self.rom_device
    }

    fn is_romd(&self) -> bool {
        self.rom_device && self.romd_mode
    }
}

/// A failed guest physical memory access.
#[derive(ThisError, Clone, Copy, Debug, PartialEq, Eq)]
#[error("guest memory access faulted at {0:#x}")]
pub struct GuestMemoryFault(pub u64);

impl From<GuestMemoryFault> for Error {
    fn from(fault: GuestMemoryFault) -> Self {
        Error::GuestMemoryFault(fault.0)
    }
}

/// Guest physical memory access.
pub trait GuestMemory: Send + Sync {
    fn read_at(&self, gpa: u64, buf: &mut [u8]) -> std::result::Result<(), GuestMemoryFault>;
    fn write_at(&self, gpa: u64, buf: &[u8]) -> std::result::Result<(), GuestMemoryFault>;
}

/// Receives dirty page bitmaps collected from the kernel.
pub trait DirtyPageSink: Send + Sync {
    /// Marks the set bits of the first `pages` bits of `bitmap` dirty, starting at `ram_offset`.
    fn set_dirty_bitmap(&self, ram_offset: u64, bitmap: &[u64], pages: u64);
}

/// Gets the host page size.
pub fn pagesize() -> usize {
    // SAFETY: sysconf has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds the section start up and its size down to host pages.
///
/// Returns the aligned start and size. The size is zero when the section covers no whole page.
pub fn align_section(section: &MemorySection, page_size: u64) -> (u64, u64) {
    let mask = page_size - 1;
    let delta = (page_size - (section.offset_within_address_space & mask)) & mask;
    let start = section.offset_within_address_space + delta;
    if delta > section.size {
        return (start, 0);
    }
    (start, (section.size - delta) & !mask)
}

/// Kernel features and limits that shape slot layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPolicy {
    pub page_size: u64,
    pub max_slot_size: u64,
    pub readonly_mem: bool,
    pub manual_protect: bool,
    pub dirty_ring: bool,
}

impl SlotPolicy {
    fn flags_for(&self, section: &MemorySection) -> MemFlags {
        let mut flags = MemFlags::empty();
        if section.dirty_log {
            flags |= MemFlags::LOG_DIRTY_PAGES;
        }
        if (section.readonly || section.is_romd()) && self.readonly_mem {
            flags |= MemFlags::READONLY;
        }
        flags
    }
}

pub(crate) struct SlotsState {
    spaces: Vec<SlotTable>,
    rings: BTreeMap<usize, DirtyRing>,
}

/// The slot tables of every address space plus the dirty rings that feed them.
pub struct MemorySlots {
    vm: Arc<dyn Vm>,
    state: Mutex<SlotsState>,
    shadow: Arc<Mutex<ShadowSlotTable>>,
    sink: Arc<dyn DirtyPageSink>,
    policy: SlotPolicy,
}

impl MemorySlots {
    pub fn new(
        vm: Arc<dyn Vm>,
        nr_as: u16,
        nr_slots: u32,
        policy: SlotPolicy,
        sink: Arc<dyn DirtyPageSink>,
        shadow: Arc<Mutex<ShadowSlotTable>>,
    ) -> MemorySlots {
        MemorySlots {
            vm,
            state: Mutex::new(SlotsState {
                spaces: (0..nr_as).map(|as_id| SlotTable::new(as_id, nr_slots)).collect(),
                rings: BTreeMap::new(),
            }),
            shadow,
            sink,
            policy,
        }
    }

    pub fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    pub fn nr_address_spaces(&self) -> usize {
        self.state.lock().spaces.len()
    }

    /// Number of slots available per address space.
    pub fn max_memslots(&self) -> usize {
        self.state.lock().spaces.first().map_or(0, SlotTable::len)
    }

    pub fn has_free_slot(&self, as_id: u16) -> bool {
        self.state
            .lock()
            .spaces
            .get(as_id as usize)
            .is_some_and(SlotTable::has_free_slot)
    }

    /// Snapshot of the non-empty slots of `as_id`.
    pub fn slots(&self, as_id: u16) -> Vec<MemSlot> {
        let state = self.state.lock();
        state
            .spaces
            .get(as_id as usize)
            .map(|t| t.iter().filter(|s| !s.is_empty()).cloned().collect())
            .unwrap_or_default()
    }

    /// Translates a host virtual address inside address space 0 back to a guest physical address.
    pub fn physical_memory_addr_from_host(&self, host_addr: u64) -> Option<u64> {
        let state = self.state.lock();
        let addr = state.spaces.first()?.iter().find_map(|s| {
            if !s.is_empty() && host_addr >= s.ram && host_addr - s.ram < s.memory_size {
                Some(s.start_addr + (host_addr - s.ram))
            } else {
                None
            }
        });
        addr
    }

    /// Adds or removes the slots that back `section` in address space `as_id`.
    pub fn set_phys_mem(&self, as_id: u16, section: &MemorySection, mut add: bool) -> Result<()> {
        if !section.is_ram {
            if section.writable() || !self.policy.readonly_mem {
                return Ok(());
            } else if !section.romd_mode {
                // Reads of the device must trap, so the memory goes away.
                add = false;
            }
        }

        let (mut start_addr, mut size) = align_section(section, self.policy.page_size);
        if size == 0 {
            return Ok(());
        }
        let mr_offset =
            section.offset_within_region + start_addr - section.offset_within_address_space;
        let mut ram = section.host_base + mr_offset;
        let mut ram_start_offset = section.ram_offset + mr_offset;

        let mut state = self.state.lock();
        if as_id as usize >= state.spaces.len() {
            return Err(Error::InvalidConfig(format!("address space {} not bound", as_id)));
        }

        if !add {
            while size > 0 {
                let slot_size = self.policy.max_slot_size.min(size);
                let Some(index) = state.spaces[as_id as usize].find_by_range(start_addr, slot_size)
                else {
                    break;
                };
                self.remove_slot(&mut state, as_id, index)?;
                start_addr += slot_size;
                size -= slot_size;
            }
            return Ok(());
        }

        let flags = self.policy.flags_for(section);
        while size > 0 {
            let slot_size = self.policy.max_slot_size.min(size);
            let table = &mut state.spaces[as_id as usize];
            let index = table.alloc()?;
            let Some(slot) = table.get_mut(index) else {
                return Err(Error::NoFreeMemSlot);
            };
            slot.memory_size = slot_size;
            slot.start_addr = start_addr;
            slot.ram_start_offset = ram_start_offset;
            slot.ram = ram;
            slot.flags = flags;
            init_bitmap(slot, self.policy.page_size);
            if let Err(e) = commit_slot(&*self.vm, &self.shadow, slot, true) {
                slot.memory_size = 0;
                slot.dirty_bmap = None;
                table.release(index);
                return Err(e);
            }
            start_addr += slot_size;
            ram_start_offset += slot_size;
            ram += slot_size;
            size -= slot_size;
        }
        Ok(())
    }

    fn remove_slot(&self, state: &mut SlotsState, as_id: u16, index: u32) -> Result<()> {
        let logging = state.spaces[as_id as usize]
            .get(index)
            .is_some_and(|s| s.flags.contains(MemFlags::LOG_DIRTY_PAGES));
        if logging {
            // The slot goes away regardless; pages dirtied since the last sync may be lost.
            if self.policy.dirty_ring {
                if let Err(e) = self.reap_locked(state, None) {
                    error!("failed to reap dirty rings before removing slot {}: {}", index, e);
                }
            } else if let Some(slot) = state.spaces[as_id as usize].get_mut(index) {
                if let Err(e) = self.get_dirty_log(slot) {
                    error!("failed to fetch the final dirty log of slot {}: {}", index, e);
                }
            }
        }

        let table = &mut state.spaces[as_id as usize];
        let Some(slot) = table.get_mut(index) else {
            return Ok(());
        };
        if logging {
            self.sync_dirty_pages(slot);
        }
        slot.dirty_bmap = None;
        slot.memory_size = 0;
        slot.flags = MemFlags::empty();
        commit_slot(&*self.vm, &self.shadow, slot, false)?;
        table.release(index);
        Ok(())
    }

    /// Starts dirty logging for the slots of `section` if it was not logging before.
    pub fn log_start(&self, as_id: u16, section: &MemorySection, old_logging: bool) -> Result<()> {
        if old_logging {
            return Ok(());
        }
        self.update_section_flags(as_id, section)
    }

    /// Stops dirty logging for the slots of `section` if it no longer logs.
    pub fn log_stop(&self, as_id: u16, section: &MemorySection, new_logging: bool) -> Result<()> {
        if new_logging {
            return Ok(());
        }
        self.update_section_flags(as_id, section)
    }

    fn update_section_flags(&self, as_id: u16, section: &MemorySection) -> Result<()> {
        let (mut start_addr, mut size) = align_section(section, self.policy.page_size);
        let flags = self.policy.flags_for(section);
        let mut state = self.state.lock();
        let Some(table) = state.spaces.get_mut(as_id as usize) else {
            return Ok(());
        };
        while size > 0 {
            let slot_size = self.policy.max_slot_size.min(size);
            // No slot means every access traps; nothing to log.
            let Some(index) = table.find_by_range(start_addr, slot_size) else {
                return Ok(());
            };
            if let Some(slot) = table.get_mut(index) {
                slot.flags = flags;
                if slot.flags != slot.old_flags {
                    init_bitmap(slot, self.policy.page_size);
                    commit_slot(&*self.vm, &self.shadow, slot, false)?;
                }
            }
            start_addr += slot_size;
            size -= slot_size;
        }
        Ok(())
    }

    /// Attaches the dirty ring of `vcpu_id`.
    pub fn register_ring(&self, vcpu_id: usize, ring: DirtyRing) {
        self.state.lock().rings.insert(vcpu_id, ring);
    }

    /// Drains and drops the dirty ring of `vcpu_id`.
    pub fn unregister_ring(&self, vcpu_id: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.rings.contains_key(&vcpu_id) {
            return Ok(());
        }
        let result = self.reap_locked(&mut state, Some(vcpu_id));
        state.rings.remove(&vcpu_id);
        result.map(|_| ())
    }

    /// Collects the dirty rings of `vcpu_id`, or of every vcpu, into the slot bitmaps.
    pub fn reap(&self, vcpu_id: Option<usize>) -> Result<u64> {
        let mut state = self.state.lock();
        self.reap_locked(&mut state, vcpu_id)
    }

    fn reap_locked(&self, state: &mut SlotsState, vcpu_id: Option<usize>) -> Result<u64> {
        let SlotsState { spaces, rings } = state;
        let page_size = self.policy.page_size;
        let mut mark = |gfn: DirtyGfn| mark_page(spaces, page_size, gfn);
        let total: u64 = match vcpu_id {
            Some(id) => rings
                .get_mut(&id)
                .map_or(0, |ring| ring.collect(&mut mark) as u64),
            None => rings
                .values_mut()
                .map(|ring| ring.collect(&mut mark) as u64)
                .sum(),
        };
        if total > 0 {
            let reset = self.vm.reset_dirty_rings().map_err(Error::ResetDirtyRings)? as u64;
            if reset != total {
                return Err(Error::DirtyRingResetMismatch {
                    reaped: total,
                    reset,
                });
            }
            debug!("reaped {} dirty ring entries", total);
        }
        Ok(total)
    }

    /// Pushes the bitmap of every logging slot of `as_id` to the dirty sink and zeroes it.
    pub fn sync_global(&self, as_id: u16) {
        let mut state = self.state.lock();
        let Some(table) = state.spaces.get_mut(as_id as usize) else {
            return;
        };
        for slot in table
            .iter_mut()
            .filter(|s| !s.is_empty() && s.flags.contains(MemFlags::LOG_DIRTY_PAGES))
        {
            self.sync_dirty_pages(slot);
            if let Some(bmap) = slot.dirty_bmap.as_mut() {
                bmap.fill(0);
            }
        }
    }

    fn sync_dirty_pages(&self, slot: &MemSlot) {
        match slot.dirty_bmap.as_deref() {
            Some(bmap) => {
                let pages = slot.pages(self.policy.page_size);
                self.sink.set_dirty_bitmap(slot.ram_start_offset, bmap, pages);
            }
            None => warn!("slot {} logs dirty pages without a bitmap", slot.slot),
        }
    }
}

// Marks the page named by a ring entry dirty in its slot's bitmap. Entries naming an unknown
// address space, an unknown or empty slot, or a page past the slot end are dropped.
fn mark_page(spaces: &mut [SlotTable], page_size: u64, gfn: DirtyGfn) {
    let Some(table) = spaces.get_mut(gfn.as_id as usize) else {
        return;
    };
    let Some(slot) = table.get_mut(gfn.slot as u32) else {
        return;
    };
    if slot.is_empty() || gfn.offset >= slot.pages(page_size) {
        return;
    }
    if let Some(bmap) = slot.dirty_bmap.as_mut() {
        bitmap::set_bit(bmap, gfn.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(start: u64, size: u64) -> MemorySection {
        MemorySection {
            offset_within_address_space: start,
            size,
            is_ram: true,
            ..Default::default()
        }
    }

    #[test]
    fn align_rounds_inward() {
        assert_eq!(align_section(&section(0x1000, 0x3000), 0x1000), (0x1000, 0x3000));
        assert_eq!(align_section(&section(0x1800, 0x3000), 0x1000), (0x2000, 0x2000));
        assert_eq!(align_section(&section(0x1800, 0x1000), 0x1000).1, 0);
        assert_eq!(align_section(&section(0x1800, 0x100), 0x1000).1, 0);
    }

    #[test]
    fn flags_follow_section_and_kernel_support() {
        let mut policy = SlotPolicy {
            page_size: 0x1000,
            max_slot_size: u64::MAX,
            readonly_mem: true,
            manual_protect: false,
            dirty_ring: false,
        };
        let mut s = section(0, 0x1000);
        s.dirty_log = true;
        s.readonly = true;
        assert_eq!(
            policy.flags_for(&s),
            MemFlags::LOG_DIRTY_PAGES | MemFlags::READONLY
        );
        policy.readonly_mem = false;
        assert_eq!(policy.flags_for(&s), MemFlags::LOG_DIRTY_PAGES);
    }
}
