// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![allow(dead_code)]

use std::sync::Arc;

use kvm_accel::accel::Collaborators;
use kvm_accel::fake::FakeExtensionHost;
use kvm_accel::fake::FakeExtensionLoader;
use kvm_accel::fake::FakeVm;
use kvm_accel::fake::RecordingDirtySink;
use kvm_accel::memory::pagesize;
use kvm_accel::memory::MemorySection;
use kvm_accel::AccelConfig;
use kvm_accel::KvmAccel;

/// An accelerator on a fake VM, with handles on every fake it talks to.
pub struct Harness {
    pub vm: Arc<FakeVm>,
    pub sink: Arc<RecordingDirtySink>,
    pub loader: Arc<FakeExtensionLoader>,
    pub host: Arc<FakeExtensionHost>,
    pub accel: Arc<KvmAccel>,
}

pub fn page() -> u64 {
    pagesize() as u64
}

pub fn harness(config: AccelConfig) -> Harness {
    harness_with(FakeVm::new(), FakeExtensionLoader::new(), config)
}

pub fn harness_with(vm: FakeVm, loader: FakeExtensionLoader, config: AccelConfig) -> Harness {
    let _ = kvm_accel::syslog::init();
    let vm = Arc::new(vm);
    let sink = Arc::new(RecordingDirtySink::new());
    let loader = Arc::new(loader);
    let host = Arc::new(FakeExtensionHost::new());
    let accel = KvmAccel::new(
        vm.clone(),
        config,
        Collaborators {
            dirty_sink: sink.clone(),
            dirty_limiter: None,
            extension_loader: loader.clone(),
            extension_host: host.clone(),
        },
    )
    .expect("failed to create accelerator");
    Harness {
        vm,
        sink,
        loader,
        host,
        accel,
    }
}

/// RAM of `pages` pages at guest address `gpa`, backed by host memory at `host_base`.
pub fn ram(gpa: u64, pages: u64, host_base: u64) -> MemorySection {
    MemorySection {
        offset_within_address_space: gpa,
        size: pages * page(),
        host_base,
        ram_offset: gpa,
        is_ram: true,
        ..Default::default()
    }
}

/// Like [`ram`] but with dirty logging requested.
pub fn logged_ram(gpa: u64, pages: u64, host_base: u64) -> MemorySection {
    MemorySection {
        dirty_log: true,
        ..ram(gpa, pages, host_base)
    }
}

/// Collaborators for building an accelerator by hand.
pub fn collaborators() -> Collaborators {
    Collaborators {
        dirty_sink: Arc::new(RecordingDirtySink::new()),
        dirty_limiter: None,
        extension_loader: Arc::new(FakeExtensionLoader::new()),
        extension_host: Arc::new(FakeExtensionHost::new()),
    }
}
