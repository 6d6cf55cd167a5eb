// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The kernel-facing seam of the accelerator.
//!
//! [`Vm`] and [`Vcpu`] describe the subset of KVM file descriptor operations the control plane
//! issues. [`crate::kvm`] implements them with real ioctls and the `fake` module implements them in
//! memory for tests.

use std::fs::File;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use vmm_sys_util::errno::Result;

use crate::mmap::MemoryMapping;

bitflags! {
    /// Flags of a kernel memory slot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const LOG_DIRTY_PAGES = kvm_sys::KVM_MEM_LOG_DIRTY_PAGES;
        const READONLY = kvm_sys::KVM_MEM_READONLY;
    }
}

/// Arguments of `KVM_SET_USER_MEMORY_REGION`. A `memory_size` of zero deletes the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRegionUpdate {
    /// Slot index with the address space id in bits 16 and up.
    pub slot: u32,
    pub flags: MemFlags,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

/// A source of IRQs in an `IrqRoute`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqSource {
    Irqchip {
        chip: u32,
        pin: u32,
    },
    Msi {
        address: u64,
        data: u32,
        devid: Option<u32>,
    },
    S390Adapter {
        summary_addr: u64,
        ind_addr: u64,
        summary_offset: u64,
        ind_offset: u64,
        adapter_id: u32,
    },
    HvSint {
        vcpu: u32,
        sint: u32,
    },
}

/// A single route for an IRQ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqRoute {
    pub gsi: u32,
    pub source: IrqSource,
}

/// Arguments of `KVM_IRQFD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqfdRequest {
    pub fd: RawFd,
    pub gsi: u32,
    pub resample_fd: Option<RawFd>,
    pub deassign: bool,
}

/// A wrapper for using a VM file descriptor.
pub trait Vm: Send + Sync {
    /// Returns the raw value of `KVM_CHECK_EXTENSION` for `cap`. Zero or negative means absent.
    fn check_extension(&self, cap: u32) -> i32;

    fn enable_cap(&self, cap: u32, args: [u64; 4]) -> Result<()>;

    fn set_user_memory_region(&self, region: &MemoryRegionUpdate) -> Result<()>;

    /// Fills `bitmap` with the dirty pages of `slot` since the previous call.
    fn get_dirty_log(&self, slot: u32, bitmap: &mut [u64]) -> Result<()>;

    /// Write-protects again the pages of `slot` set in `bitmap`, starting at `first_page`.
    fn clear_dirty_log(
        &self,
        slot: u32,
        first_page: u64,
        num_pages: u32,
        bitmap: &[u64],
    ) -> Result<()>;

    /// Returns the number of dirty ring entries the kernel recycled.
    fn reset_dirty_rings(&self) -> Result<u32>;

    /// Replaces the whole GSI routing table.
    fn set_gsi_routing(&self, routes: &[IrqRoute]) -> Result<()>;

    /// Injects an MSI directly. Returns the delivery status reported by the kernel.
    fn signal_msi(&self, msi: &MsiMessage) -> Result<i32>;

    /// Sets the level of `gsi`. With `status` the kernel reports the delivery status, otherwise
    /// the injection counts as delivered and 1 is returned.
    fn set_irq_line(&self, gsi: u32, level: bool, status: bool) -> Result<i32>;

    fn irqfd(&self, request: &IrqfdRequest) -> Result<()>;

    fn get_stats_fd(&self) -> Result<File>;
}

/// A reason why a VCPU exited. One of these returns every time `Vcpu::run` is called.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// An out port instruction was run on the given port with the given data.
    IoOut {
        port: u16,
        size: usize,
        data: [u8; 8],
    },
    /// An in port instruction was run on the given port. The result is passed back with
    /// `Vcpu::set_data`.
    IoIn {
        port: u16,
        size: usize,
    },
    MmioRead {
        address: u64,
        size: usize,
    },
    MmioWrite {
        address: u64,
        size: usize,
        data: [u8; 8],
    },
    /// The guest issued a hypercall. The result is passed back with
    /// `Vcpu::set_hypercall_result`.
    Hypercall {
        nr: u64,
        args: [u64; 6],
    },
    IrqWindowOpen,
    Shutdown,
    Unknown {
        hardware_exit_reason: u64,
    },
    /// The kernel failed to handle an exit; `data` is only filled when the kernel reports it.
    InternalError {
        suberror: u32,
        data: Vec<u64>,
    },
    DirtyRingFull,
    SystemEvent {
        event_type: u32,
        data: Vec<u64>,
    },
    /// Any exit reason the generic loop does not interpret. `payload` holds the raw bytes of the
    /// exit information for the architecture handler to decode.
    Arch {
        exit_reason: u32,
        payload: Vec<u8>,
    },
}

/// A wrapper around a VCPU file descriptor.
pub trait Vcpu: Send {
    fn id(&self) -> usize;

    /// Binds the vcpu to the calling thread so the kick signal handler can reach it.
    fn bind_to_current_thread(&self) -> Result<()> {
        Ok(())
    }

    /// Runs the VCPU until it exits, returning the reason for the exit.
    fn run(&mut self) -> Result<VcpuExit>;

    /// Sets the bit that requests an immediate exit.
    fn set_immediate_exit(&self, exit: bool);

    /// Sets the data received by an `IoIn` or `MmioRead`.
    fn set_data(&mut self, data: &[u8]) -> Result<()>;

    fn set_hypercall_result(&mut self, result: u64) -> Result<()>;

    /// Maps the vcpu's dirty ring of `entries` entries.
    fn map_dirty_ring(&self, entries: u32) -> Result<MemoryMapping>;

    fn get_stats_fd(&self) -> Result<File>;
}
