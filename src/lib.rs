// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side control plane of the Linux KVM accelerator.
//!
//! [`accel::KvmAccel`] owns the per-VM state: kernel memory slots and their dirty tracking,
//! GSI/MSI routing, and the registry of guest loaded extension programs. [`vcpu::VcpuRunner`]
//! drives one vcpu through `KVM_RUN` and dispatches its exits.

pub mod accel;
pub mod config;
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod hypercall;
pub mod hypervisor;
pub mod irq;
pub mod kvm;
pub mod memory;
pub mod mmap;
pub mod reaper;
pub mod stats;
pub mod syslog;
pub mod vcpu;

pub use crate::accel::KvmAccel;
pub use crate::config::AccelConfig;
pub use crate::error::Error;
pub use crate::error::Result;
