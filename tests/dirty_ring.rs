// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use common::*;
use kvm_accel::accel::MemoryListener;
use kvm_accel::fake::FakeExtensionLoader;
use kvm_accel::fake::FakeVcpu;
use kvm_accel::fake::FakeVm;
use kvm_accel::AccelConfig;
use kvm_accel::Error;
use kvm_accel::KvmAccel;
use kvm_sys::KVM_CAP_DIRTY_LOG_RING;
use kvm_sys::KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2;

const GPA: u64 = 0x100_0000;
const HOST: u64 = 0x7f00_0000_0000;

fn ring_config(entries: u32) -> AccelConfig {
    AccelConfig {
        dirty_ring_size: entries,
        ..Default::default()
    }
}

#[test]
fn ring_is_enabled_instead_of_manual_protect() {
    let h = harness(ring_config(64));
    assert!(h.accel.uses_dirty_ring());
    assert_eq!(h.accel.caps().dirty_ring_size, 64);
    assert!(!h.accel.caps().manual_dirty_log_protect);
    let caps = h.vm.enabled_caps();
    assert!(caps.contains(&(KVM_CAP_DIRTY_LOG_RING, [1024, 0, 0, 0])));
    assert!(caps
        .iter()
        .all(|(cap, _)| *cap != KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2));
}

#[test]
fn ring_larger_than_kernel_limit() {
    let result = KvmAccel::new(Arc::new(FakeVm::new()), ring_config(8192), collaborators());
    let Err(Error::DirtyRingTooLarge { requested, max }) = result else {
        panic!("oversized ring was accepted");
    };
    assert_eq!(requested, 8192 * 16);
    assert_eq!(max, 65536);
}

#[test]
fn falls_back_to_bitmaps_without_kernel_support() {
    let vm = FakeVm::new();
    vm.set_cap(KVM_CAP_DIRTY_LOG_RING, 0);
    let h = harness_with(vm, FakeExtensionLoader::new(), ring_config(64));
    assert!(!h.accel.uses_dirty_ring());
    assert!(h.accel.caps().manual_dirty_log_protect);
    assert!(h.accel.start_reaper().unwrap().is_none());
}

#[test]
fn reap_collects_and_resets() {
    let h = harness(ring_config(64));
    let listener = h.accel.memory_listener(0).unwrap();
    listener.region_add(&logged_ram(GPA, 16, HOST));
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();

    assert!(h.vm.push_dirty_gfn(0, 0, 3));
    assert!(h.vm.push_dirty_gfn(0, 0, 7));
    // Unknown slot and a page past the slot end are collected but dropped.
    assert!(h.vm.push_dirty_gfn(0, 5, 1));
    assert!(h.vm.push_dirty_gfn(0, 0, 100));

    assert_eq!(h.accel.slots().reap(None).unwrap(), 4);
    assert_eq!(h.vm.ring_resets(), 1);
    assert_eq!(h.accel.slots().reap(None).unwrap(), 0);
    assert_eq!(h.vm.ring_resets(), 1);

    let big = h.accel.big_lock().lock();
    listener.log_sync_global(&big);
    drop(big);
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([3, 7]));
}

#[test]
fn sync_global_flushes_pending_entries() {
    let h = harness(ring_config(64));
    let listener = h.accel.memory_listener(0).unwrap();
    listener.region_add(&logged_ram(GPA, 16, HOST));
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();

    h.vm.push_dirty_gfn(0, 0, 2);
    {
        let big = h.accel.big_lock().lock();
        assert_eq!(h.accel.dirty_ring_flush(&big).unwrap(), 1);
        h.accel.log_sync_global(&big, 0).unwrap();
    }
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([2]));

    // The bitmap was handed over and starts empty again.
    let slot = &h.accel.slots().slots(0)[0];
    assert!(slot.dirty_bmap.as_ref().unwrap().iter().all(|w| *w == 0));
}

#[test]
fn reset_count_mismatch_is_an_error() {
    let h = harness(ring_config(64));
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();
    h.vm.set_reset_override(Some(1));
    h.vm.push_dirty_gfn(0, 0, 0);
    h.vm.push_dirty_gfn(0, 0, 1);
    let err = h.accel.slots().reap(None).unwrap_err();
    assert!(matches!(
        err,
        Error::DirtyRingResetMismatch {
            reaped: 2,
            reset: 1
        }
    ));
}

#[test]
fn region_removal_reaps_first() {
    let h = harness(ring_config(64));
    let listener = h.accel.memory_listener(0).unwrap();
    let section = logged_ram(GPA, 16, HOST);
    listener.region_add(&section);
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();

    h.vm.push_dirty_gfn(0, 0, 4);
    listener.region_del(&section);
    assert_eq!(h.vm.ring_resets(), 1);
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([4]));
}

#[test]
fn region_removal_survives_a_reset_mismatch() {
    let h = harness(ring_config(64));
    let listener = h.accel.memory_listener(0).unwrap();
    let section = logged_ram(GPA, 16, HOST);
    listener.region_add(&section);
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();
    h.vm.set_reset_override(Some(0));

    h.vm.push_dirty_gfn(0, 0, 4);
    listener.region_del(&section);
    assert!(h.accel.slots().slots(0).is_empty());
    assert!(h.vm.live_slots().is_empty());
    // The collected page is still delivered.
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([4]));
}

#[test]
fn unregistered_vcpu_ring_is_drained() {
    let h = harness(ring_config(64));
    let listener = h.accel.memory_listener(0).unwrap();
    listener.region_add(&logged_ram(GPA, 16, HOST));
    let vcpu = FakeVcpu::new(3, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();
    assert_eq!(h.accel.kickers().len(), 1);

    h.vm.push_dirty_gfn(3, 0, 11);
    h.accel.unregister_vcpu(3).unwrap();
    assert!(h.accel.kickers().is_empty());
    assert_eq!(h.vm.ring_resets(), 1);

    let big = h.accel.big_lock().lock();
    listener.log_sync_global(&big);
    drop(big);
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([11]));
}

#[test]
fn reaper_thread_collects_periodically() {
    let h = harness(AccelConfig {
        reaper_interval_ms: 10,
        ..ring_config(64)
    });
    let listener = h.accel.memory_listener(0).unwrap();
    listener.region_add(&logged_ram(GPA, 16, HOST));
    let vcpu = FakeVcpu::new(0, h.vm.clone());
    h.accel.register_vcpu(&vcpu, None).unwrap();

    let reaper = h.accel.start_reaper().unwrap().unwrap();
    h.vm.push_dirty_gfn(0, 0, 6);
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.vm.ring_resets() == 0 {
        assert!(Instant::now() < deadline, "reaper never collected the ring");
        thread::sleep(Duration::from_millis(5));
    }
    drop(reaper);

    h.accel.slots().sync_global(0);
    assert_eq!(h.sink.dirty_pages(GPA), BTreeSet::from([6]));
}

#[test]
fn bitmap_mode_has_no_reaper() {
    let h = harness(AccelConfig::default());
    assert!(h.accel.start_reaper().unwrap().is_none());
    let big = h.accel.big_lock().lock();
    assert_eq!(h.accel.dirty_ring_flush(&big).unwrap(), 0);
}
