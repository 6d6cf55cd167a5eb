// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;
use sync::Mutex;

use crate::hypervisor::MemFlags;
use crate::hypervisor::MemoryRegionUpdate;
use crate::hypervisor::Vm;
use crate::memory::shadow::ShadowSlotTable;
use crate::Error;
use crate::Result;

/// A kernel memory slot. A slot with `memory_size == 0` is free.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemSlot {
    pub slot: u32,
    pub as_id: u16,
    pub start_addr: u64,
    pub memory_size: u64,
    /// Host virtual address backing `start_addr`.
    pub ram: u64,
    /// Offset of the slot within the ram address space, used to report dirty pages.
    pub ram_start_offset: u64,
    pub flags: MemFlags,
    pub old_flags: MemFlags,
    pub dirty_bmap: Option<Box<[u64]>>,
}

impl MemSlot {
    pub fn is_empty(&self) -> bool {
        self.memory_size == 0
    }

    pub fn kernel_slot(&self) -> u32 {
        self.slot | ((self.as_id as u32) << 16)
    }

    pub fn pages(&self, page_size: u64) -> u64 {
        self.memory_size / page_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        !self.is_empty() && addr >= self.start_addr && addr - self.start_addr < self.memory_size
    }
}

/// Slot arena of one address space. Free indices are kept in a min-heap so allocation always
/// returns the lowest free slot.
#[derive(Debug)]
pub struct SlotTable {
    as_id: u16,
    slots: Vec<MemSlot>,
    free: BinaryHeap<Reverse<u32>>,
    used: usize,
}

impl SlotTable {
    pub fn new(as_id: u16, nr_slots: u32) -> SlotTable {
        SlotTable {
            as_id,
            slots: (0..nr_slots)
                .map(|slot| MemSlot {
                    slot,
                    as_id,
                    ..Default::default()
                })
                .collect(),
            free: (0..nr_slots).map(Reverse).collect(),
            used: 0,
        }
    }

    pub fn as_id(&self) -> u16 {
        self.as_id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn has_free_slot(&self) -> bool {
        self.used < self.slots.len()
    }

    /// Index of the lowest free slot without taking it.
    pub fn find_free(&mut self) -> Option<u32> {
        loop {
            let Reverse(slot) = *self.free.peek()?;
            if self.slots[slot as usize].is_empty() {
                return Some(slot);
            }
            // A stale entry for a slot that was filled behind the free list's back.
            self.free.pop();
        }
    }

    /// Takes the lowest free slot.
    pub fn alloc(&mut self) -> Result<u32> {
        let slot = self.find_free().ok_or(Error::NoFreeMemSlot)?;
        self.free.pop();
        self.used += 1;
        Ok(slot)
    }

    /// Returns an emptied slot to the free list.
    pub fn release(&mut self, slot: u32) {
        if self.slots[slot as usize].is_empty() {
            self.free.push(Reverse(slot));
            self.used = self.used.saturating_sub(1);
        }
    }

    /// Finds the slot that exactly covers `[start, start + size)`.
    pub fn find_by_range(&self, start: u64, size: u64) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| !s.is_empty() && s.start_addr == start && s.memory_size == size)
            .map(|s| s.slot)
    }

    pub fn get(&self, slot: u32) -> Option<&MemSlot> {
        self.slots.get(slot as usize)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut MemSlot> {
        self.slots.get_mut(slot as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemSlot> {
        self.slots.iter_mut()
    }
}

/// Pushes the state of `slot` to the kernel.
///
/// When an existing slot only changes its READONLY flag the kernel refuses an in-place update,
/// so the slot is deleted first and then recreated.
pub fn commit_slot(
    vm: &dyn Vm,
    shadow: &Mutex<ShadowSlotTable>,
    slot: &mut MemSlot,
    new: bool,
) -> Result<()> {
    let mut region = MemoryRegionUpdate {
        slot: slot.kernel_slot(),
        flags: slot.flags,
        guest_phys_addr: slot.start_addr,
        memory_size: 0,
        userspace_addr: slot.ram,
    };
    let set = |region: &MemoryRegionUpdate| {
        vm.set_user_memory_region(region)
            .map_err(|err| Error::SetUserMemoryRegion {
                slot: region.slot,
                err,
            })
    };

    if slot.memory_size != 0
        && !new
        && (slot.flags ^ slot.old_flags).contains(MemFlags::READONLY)
    {
        set(&region)?;
    }
    region.memory_size = slot.memory_size;
    set(&region)?;
    slot.old_flags = slot.flags;

    debug!(
        "slot {} as {}: gpa {:#x} size {:#x} host {:#x} flags {:?}",
        slot.slot, slot.as_id, slot.start_addr, slot.memory_size, slot.ram, slot.flags
    );
    if slot.as_id == 0 {
        shadow
            .lock()
            .record(slot.slot, slot.start_addr, slot.memory_size, slot.ram);
    }
    Ok(())
}
