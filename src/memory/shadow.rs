// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Copy of the address space 0 slot layout that extension programs read through shared maps.

/// Number of slots mirrored.
pub const SHADOW_SLOTS: usize = 128;

const PAGE_SHIFT: u32 = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowSlotTable {
    pub base_gfns: [u64; SHADOW_SLOTS],
    pub npages: [u64; SHADOW_SLOTS],
    pub userspace_addrs: [u64; SHADOW_SLOTS],
    /// One past the highest slot index ever written.
    pub used: usize,
}

impl Default for ShadowSlotTable {
    fn default() -> Self {
        ShadowSlotTable {
            base_gfns: [0; SHADOW_SLOTS],
            npages: [0; SHADOW_SLOTS],
            userspace_addrs: [0; SHADOW_SLOTS],
            used: 0,
        }
    }
}

impl ShadowSlotTable {
    /// Records the state of `slot`. A zero `memory_size` clears the entry.
    pub fn record(
        &mut self,
        slot: u32,
        guest_phys_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) {
        let index = slot as usize;
        if index >= SHADOW_SLOTS {
            return;
        }
        if memory_size == 0 {
            self.base_gfns[index] = 0;
            self.npages[index] = 0;
            self.userspace_addrs[index] = 0;
        } else {
            self.base_gfns[index] = guest_phys_addr >> PAGE_SHIFT;
            self.npages[index] = memory_size >> PAGE_SHIFT;
            self.userspace_addrs[index] = userspace_addr;
        }
        self.used = self.used.max(index + 1);
    }

    /// The three exported columns, truncated to the used entries.
    pub fn columns(&self) -> [(&'static str, &[u64]); 3] {
        [
            ("l0_memslots_base_gfns", &self.base_gfns[..self.used]),
            ("l0_memslots_npages", &self.npages[..self.used]),
            ("l0_memslots_userspace_addr", &self.userspace_addrs[..self.used]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_clear() {
        let mut table = ShadowSlotTable::default();
        table.record(2, 0x10_0000, 0x2000, 0x7f00_0000_0000);
        assert_eq!(table.used, 3);
        assert_eq!(table.base_gfns[2], 0x100);
        assert_eq!(table.npages[2], 2);
        table.record(2, 0x10_0000, 0, 0x7f00_0000_0000);
        assert_eq!(table.npages[2], 0);
        assert_eq!(table.used, 3);
        table.record(500, 0, 0x1000, 0);
        assert_eq!(table.used, 3);
        assert_eq!(table.columns()[2].1.len(), 3);
    }
}
