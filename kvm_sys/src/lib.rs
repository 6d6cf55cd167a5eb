// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel ABI used by the accelerator: the `kvm-bindings` structures plus the ioctl numbers,
//! dirty-ring entry and binary statistics layouts that the control plane depends on bit-exactly.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

#[macro_use]
extern crate vmm_sys_util;

use std::mem::size_of;

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use kvm_bindings::*;

pub const KVMIO: u32 = 0xAE;

// System ioctls.
ioctl_io_nr!(KVM_GET_API_VERSION, KVMIO, 0x00);
ioctl_io_nr!(KVM_CREATE_VM, KVMIO, 0x01);
ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);
ioctl_io_nr!(KVM_GET_VCPU_MMAP_SIZE, KVMIO, 0x04);

// VM ioctls.
ioctl_io_nr!(KVM_CREATE_VCPU, KVMIO, 0x41);
ioctl_iow_nr!(KVM_GET_DIRTY_LOG, KVMIO, 0x42, kvm_dirty_log);
ioctl_iow_nr!(
    KVM_SET_USER_MEMORY_REGION,
    KVMIO,
    0x46,
    kvm_userspace_memory_region
);
ioctl_io_nr!(KVM_CREATE_IRQCHIP, KVMIO, 0x60);
ioctl_iow_nr!(KVM_IRQ_LINE, KVMIO, 0x61, kvm_irq_level);
ioctl_iowr_nr!(KVM_IRQ_LINE_STATUS, KVMIO, 0x67, kvm_irq_level);
ioctl_iow_nr!(KVM_SET_GSI_ROUTING, KVMIO, 0x6a, kvm_irq_routing);
ioctl_iow_nr!(KVM_IRQFD, KVMIO, 0x76, kvm_irqfd);
ioctl_iow_nr!(KVM_ENABLE_CAP, KVMIO, 0xa3, kvm_enable_cap);
ioctl_iow_nr!(KVM_SIGNAL_MSI, KVMIO, 0xa5, kvm_msi);
ioctl_iowr_nr!(KVM_CLEAR_DIRTY_LOG, KVMIO, 0xc0, kvm_clear_dirty_log);
ioctl_io_nr!(KVM_RESET_DIRTY_RINGS, KVMIO, 0xc7);
ioctl_io_nr!(KVM_GET_STATS_FD, KVMIO, 0xce);
ioctl_iowr_nr!(KVM_CREATE_DEVICE, KVMIO, 0xe0, kvm_create_device);
ioctl_iow_nr!(KVM_SET_DEVICE_ATTR, KVMIO, 0xe1, kvm_device_attr);

// vCPU ioctls.
ioctl_io_nr!(KVM_RUN, KVMIO, 0x80);
#[cfg(target_arch = "x86_64")]
ioctl_ior_nr!(KVM_GET_REGS, KVMIO, 0x81, kvm_regs);
#[cfg(target_arch = "x86_64")]
ioctl_iow_nr!(KVM_SET_REGS, KVMIO, 0x82, kvm_regs);

// Capabilities probed at accelerator init.
pub const KVM_CAP_IRQCHIP: u32 = 0;
pub const KVM_CAP_USER_MEMORY: u32 = 3;
pub const KVM_CAP_NR_MEMSLOTS: u32 = 10;
pub const KVM_CAP_IRQ_ROUTING: u32 = 25;
pub const KVM_CAP_IRQ_INJECT_STATUS: u32 = 26;
pub const KVM_CAP_IRQFD: u32 = 32;
pub const KVM_CAP_INTERNAL_ERROR_DATA: u32 = 40;
pub const KVM_CAP_SIGNAL_MSI: u32 = 77;
pub const KVM_CAP_READONLY_MEM: u32 = 81;
pub const KVM_CAP_IRQFD_RESAMPLE: u32 = 82;
pub const KVM_CAP_MULTI_ADDRESS_SPACE: u32 = 118;
pub const KVM_CAP_HYPERV_SYNIC: u32 = 123;
pub const KVM_CAP_IMMEDIATE_EXIT: u32 = 136;
pub const KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2: u32 = 168;
pub const KVM_CAP_DIRTY_LOG_RING: u32 = 192;
pub const KVM_CAP_BINARY_STATS_FD: u32 = 203;

pub const KVM_DIRTY_LOG_MANUAL_PROTECT_ENABLE: u64 = 1 << 0;
pub const KVM_DIRTY_LOG_INITIALLY_SET: u64 = 1 << 1;

// Memory slot flags.
pub const KVM_MEM_LOG_DIRTY_PAGES: u32 = 1 << 0;
pub const KVM_MEM_READONLY: u32 = 1 << 1;

// Interrupt routing.
pub const KVM_IRQ_ROUTING_IRQCHIP: u32 = 1;
pub const KVM_IRQ_ROUTING_MSI: u32 = 2;
pub const KVM_IRQ_ROUTING_S390_ADAPTER: u32 = 3;
pub const KVM_IRQ_ROUTING_HV_SINT: u32 = 4;
pub const KVM_MSI_VALID_DEVID: u32 = 1 << 0;
pub const KVM_IRQFD_FLAG_DEASSIGN: u32 = 1 << 0;
pub const KVM_IRQFD_FLAG_RESAMPLE: u32 = 1 << 1;

// Exit reasons and their sub-codes.
pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_HYPERCALL: u32 = 3;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;
pub const KVM_EXIT_SYSTEM_EVENT: u32 = 24;
pub const KVM_EXIT_DIRTY_RING_FULL: u32 = 31;
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;
pub const KVM_INTERNAL_ERROR_EMULATION: u32 = 1;
pub const KVM_SYSTEM_EVENT_SHUTDOWN: u32 = 1;
pub const KVM_SYSTEM_EVENT_RESET: u32 = 2;
pub const KVM_SYSTEM_EVENT_CRASH: u32 = 3;

/// Page offset of the per-vCPU dirty ring within the vCPU file descriptor mapping.
pub const KVM_DIRTY_LOG_PAGE_OFFSET: u64 = 64;
pub const KVM_DIRTY_GFN_F_DIRTY: u32 = 1 << 0;
pub const KVM_DIRTY_GFN_F_RESET: u32 = 1 << 1;

/// One entry of a vCPU dirty ring, shared with the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct kvm_dirty_gfn {
    pub flags: u32,
    pub slot: u32,
    pub offset: u64,
}
const_assert_eq!(size_of::<kvm_dirty_gfn>(), 16);

// Binary statistics.
pub const KVM_STATS_TYPE_SHIFT: u32 = 0;
pub const KVM_STATS_TYPE_MASK: u32 = 0xF << KVM_STATS_TYPE_SHIFT;
pub const KVM_STATS_TYPE_CUMULATIVE: u32 = 0 << KVM_STATS_TYPE_SHIFT;
pub const KVM_STATS_TYPE_INSTANT: u32 = 1 << KVM_STATS_TYPE_SHIFT;
pub const KVM_STATS_TYPE_PEAK: u32 = 2 << KVM_STATS_TYPE_SHIFT;
pub const KVM_STATS_TYPE_LINEAR_HIST: u32 = 3 << KVM_STATS_TYPE_SHIFT;
pub const KVM_STATS_TYPE_LOG_HIST: u32 = 4 << KVM_STATS_TYPE_SHIFT;

pub const KVM_STATS_UNIT_SHIFT: u32 = 4;
pub const KVM_STATS_UNIT_MASK: u32 = 0xF << KVM_STATS_UNIT_SHIFT;
pub const KVM_STATS_UNIT_NONE: u32 = 0 << KVM_STATS_UNIT_SHIFT;
pub const KVM_STATS_UNIT_BYTES: u32 = 1 << KVM_STATS_UNIT_SHIFT;
pub const KVM_STATS_UNIT_SECONDS: u32 = 2 << KVM_STATS_UNIT_SHIFT;
pub const KVM_STATS_UNIT_CYCLES: u32 = 3 << KVM_STATS_UNIT_SHIFT;
pub const KVM_STATS_UNIT_BOOLEAN: u32 = 4 << KVM_STATS_UNIT_SHIFT;

pub const KVM_STATS_BASE_SHIFT: u32 = 8;
pub const KVM_STATS_BASE_MASK: u32 = 0xF << KVM_STATS_BASE_SHIFT;
pub const KVM_STATS_BASE_POW10: u32 = 0 << KVM_STATS_BASE_SHIFT;
pub const KVM_STATS_BASE_POW2: u32 = 1 << KVM_STATS_BASE_SHIFT;

/// Header at offset 0 of a binary statistics file descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct kvm_stats_header {
    pub flags: u32,
    pub name_size: u32,
    pub num_desc: u32,
    pub id_offset: u32,
    pub desc_offset: u32,
    pub data_offset: u32,
}
const_assert_eq!(size_of::<kvm_stats_header>(), 24);

/// Fixed part of a statistics descriptor. It is followed by `name_size` bytes of name.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct kvm_stats_desc {
    pub flags: u32,
    pub exponent: i16,
    pub size: u16,
    pub offset: u32,
    pub bucket_size: u32,
}
const_assert_eq!(size_of::<kvm_stats_desc>(), 16);

// Perf events, used to drive sampling extension programs.
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
pub const PERF_ATTR_SIZE_VER8: u32 = 136;
ioctl_io_nr!(PERF_EVENT_IOC_ENABLE, 0x24, 0);

// Bit positions in `perf_event_attr::flags`.
pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const PERF_ATTR_FLAG_MMAP: u64 = 1 << 8;
pub const PERF_ATTR_FLAG_COMM: u64 = 1 << 9;
pub const PERF_ATTR_FLAG_FREQ: u64 = 1 << 10;
pub const PERF_ATTR_FLAG_TASK: u64 = 1 << 13;
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const PERF_ATTR_FLAG_EXCLUDE_HOST: u64 = 1 << 19;
pub const PERF_ATTR_FLAG_MMAP2: u64 = 1 << 23;

/// `struct perf_event_attr` as of `PERF_ATTR_SIZE_VER8`. Bitfields are folded into `flags`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// `sample_period`, or `sample_freq` when the FREQ flag is set.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
    pub aux_sample_size: u32,
    pub reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}
const_assert_eq!(size_of::<perf_event_attr>(), PERF_ATTR_SIZE_VER8 as usize);

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = size_in_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

/// Allocates a `Vec<T>` large enough to hold a `T` followed by `count` trailing `F` entries.
///
/// Kernel structures such as `kvm_irq_routing` end in a zero-length array. Only the first element
/// of the returned vector is used as a `T`; the remaining storage backs the trailing entries and
/// stays aligned for `T`.
pub fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers() {
        assert_eq!(KVM_RUN(), 0xae80);
        assert_eq!(KVM_CHECK_EXTENSION(), 0xae03);
        assert_eq!(KVM_RESET_DIRTY_RINGS(), 0xaec7);
        assert_eq!(KVM_GET_STATS_FD(), 0xaece);
        assert_eq!(KVM_SET_USER_MEMORY_REGION(), 0x4020_ae46);
        assert_eq!(KVM_CLEAR_DIRTY_LOG(), 0xc018_aec0);
        assert_eq!(KVM_SIGNAL_MSI(), 0x4020_aea5);
        assert_eq!(KVM_IRQFD(), 0x4020_ae76);
        assert_eq!(PERF_EVENT_IOC_ENABLE(), 0x2400);
    }

    #[test]
    fn array_field_allocation_covers_entries() {
        let v = vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(3);
        assert!(
            v.len() * size_of::<kvm_irq_routing>()
                >= size_of::<kvm_irq_routing>() + 3 * size_of::<kvm_irq_routing_entry>()
        );
    }
}
