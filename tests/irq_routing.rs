// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod common;

use std::os::unix::io::AsRawFd;

use common::*;
use kvm_accel::config::KernelIrqchip;
use kvm_accel::fake::FakeExtensionLoader;
use kvm_accel::fake::FakeVm;
use kvm_accel::hypervisor::IrqSource;
use kvm_accel::hypervisor::MsiMessage;
use kvm_accel::AccelConfig;
use kvm_accel::Error;
use kvm_sys::KVM_CAP_IRQ_INJECT_STATUS;
use kvm_sys::KVM_CAP_IRQ_ROUTING;
use kvm_sys::KVM_CAP_SIGNAL_MSI;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::eventfd::EFD_NONBLOCK;

fn msi(address: u64, data: u32) -> MsiMessage {
    MsiMessage { address, data }
}

/// A VM routing four GSIs and lacking direct MSI injection.
fn small_table() -> Harness {
    let vm = FakeVm::new();
    vm.set_cap(KVM_CAP_IRQ_ROUTING, 5);
    vm.set_cap(KVM_CAP_SIGNAL_MSI, 0);
    harness_with(vm, FakeExtensionLoader::new(), AccelConfig::default())
}

#[test]
fn last_gsi_is_reserved() {
    let h = harness(AccelConfig::default());
    assert!(h.accel.routing().has_gsi_routing());
    assert_eq!(h.accel.routing().gsi_count(), 1023);
}

#[test]
fn released_gsi_is_reused() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    assert_eq!(routing.alloc_gsi().unwrap(), 0);
    let a = routing.add_msi_route(msi(0xfee0_0000, 0x41), None).unwrap();
    let b = routing.add_msi_route(msi(0xfee0_0000, 0x42), None).unwrap();
    assert_eq!((a, b), (1, 2));

    routing.release_route(a);
    assert!(routing.route(a).is_none());
    assert_eq!(routing.add_msi_route(msi(0xfee0_0000, 0x43), None).unwrap(), 1);
    assert_eq!(routing.route_count(), 2);
}

#[test]
fn irqchip_routes_use_the_pin_as_gsi() {
    let h = small_table();
    let routing = h.accel.routing();
    routing.add_irqchip_route(0, 3).unwrap();
    assert_eq!(
        routing.route(3).unwrap().source,
        IrqSource::Irqchip { chip: 0, pin: 3 }
    );
    let err = routing.add_irqchip_route(0, 4).unwrap_err();
    assert!(matches!(
        err,
        Error::IrqPinOutOfRange {
            pin: 4,
            gsi_count: 4
        }
    ));
}

#[test]
fn msi_routes_keep_the_device_id() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    let gsi = routing.add_msi_route(msi(0xfee0_1000, 0x30), Some(0x0800)).unwrap();
    routing.commit_routes().unwrap();
    let tables = h.vm.routing_tables();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0][0].gsi, gsi);
    assert_eq!(
        tables[0][0].source,
        IrqSource::Msi {
            address: 0xfee0_1000,
            data: 0x30,
            devid: Some(0x0800)
        }
    );
}

#[test]
fn batched_changes_commit_once() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    let mut changes = routing.begin_changes();
    let a = changes.add_msi_route(msi(0xfee0_0000, 1), None).unwrap();
    let b = changes.add_msi_route(msi(0xfee0_0000, 2), None).unwrap();
    changes.update_msi_route(b, msi(0xfee0_0000, 3), None).unwrap();
    assert_eq!(changes.changes(), 3);
    changes.commit().unwrap();
    assert_eq!(routing.commit_count(), 1);
    assert_eq!(h.vm.routing_tables()[0].len(), 2);

    // Rewriting a route with the same message is not a change.
    let mut changes = routing.begin_changes();
    changes.update_msi_route(a, msi(0xfee0_0000, 1), None).unwrap();
    assert_eq!(changes.changes(), 0);
    changes.commit().unwrap();
    assert_eq!(routing.commit_count(), 1);
}

#[test]
fn update_of_missing_route() {
    let h = harness(AccelConfig::default());
    let err = h
        .accel
        .routing()
        .update_msi_route(77, msi(0, 0), None)
        .unwrap_err();
    assert!(matches!(err, Error::RouteNotFound(77)));
    assert_eq!(err.errno(), libc::ESRCH);
}

#[test]
fn direct_msi_skips_the_routing_table() {
    let h = harness(AccelConfig::default());
    let status = h.accel.routing().send_msi(msi(0xfee0_0000, 0x25)).unwrap();
    assert_eq!(status, 1);
    assert_eq!(h.vm.msis(), vec![msi(0xfee0_0000, 0x25)]);
    assert!(h.vm.routing_tables().is_empty());
}

#[test]
fn msi_routes_are_cached_by_payload() {
    let h = small_table();
    let routing = h.accel.routing();
    // Same hash bucket, different destination.
    let first = msi(0xfee0_0000, 0x0141);
    let second = msi(0xfee0_1000, 0x0241);

    routing.send_msi(first).unwrap();
    routing.send_msi(second).unwrap();
    assert_eq!(routing.commit_count(), 2);
    assert_eq!(routing.route_count(), 2);

    routing.send_msi(first).unwrap();
    routing.send_msi(second).unwrap();
    assert_eq!(routing.commit_count(), 2);
    assert_eq!(
        h.vm.irq_lines(),
        vec![(0, true), (1, true), (0, true), (1, true)]
    );
    assert!(h.vm.msis().is_empty());
}

#[test]
fn full_table_drops_cached_msi_routes() {
    let h = small_table();
    let routing = h.accel.routing();
    for data in 0..4 {
        routing.send_msi(msi(0xfee0_0000, data)).unwrap();
    }
    assert_eq!(routing.route_count(), 4);

    routing.send_msi(msi(0xfee0_0000, 9)).unwrap();
    assert_eq!(routing.route_count(), 1);
    assert_eq!(
        routing.route(0).unwrap().source,
        IrqSource::Msi {
            address: 0xfee0_0000,
            data: 9,
            devid: None
        }
    );
    assert_eq!(h.vm.irq_lines().last(), Some(&(0, true)));
}

#[test]
fn explicit_routes_survive_a_cache_flush() {
    let h = small_table();
    let routing = h.accel.routing();
    let owned = routing.add_msi_route(msi(0xfee0_0000, 0x80), None).unwrap();
    for data in 0..3 {
        routing.send_msi(msi(0xfee0_0000, data)).unwrap();
    }
    routing.send_msi(msi(0xfee0_0000, 0x90)).unwrap();
    assert!(routing.route(owned).is_some());
    assert_eq!(routing.route_count(), 2);
}

#[test]
fn table_exhaustion() {
    let h = small_table();
    let routing = h.accel.routing();
    for data in 0..4 {
        routing.add_msi_route(msi(0xfee0_0000, data), None).unwrap();
    }
    let err = routing.add_msi_route(msi(0xfee0_0000, 5), None).unwrap_err();
    assert!(err.is_exhaustion());
}

#[test]
fn hyperv_sint_routes_commit_immediately() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    let gsi = routing.add_hv_sint_route(1, 2).unwrap();
    assert_eq!(routing.commit_count(), 1);
    assert_eq!(
        h.vm.routing_tables()[0],
        vec![kvm_accel::hypervisor::IrqRoute {
            gsi,
            source: IrqSource::HvSint { vcpu: 1, sint: 2 }
        }]
    );
}

#[test]
fn userspace_irqchip_has_no_kernel_routing() {
    let h = harness(AccelConfig {
        kernel_irqchip: KernelIrqchip::Off,
        ..Default::default()
    });
    let routing = h.accel.routing();
    assert!(!routing.has_gsi_routing());
    assert!(matches!(
        routing.add_msi_route(msi(0, 0), None),
        Err(Error::NotSupported(_))
    ));
    let event = EventFd::new(0).unwrap();
    assert!(matches!(
        routing.assign_irqfd(&event, None, 1),
        Err(Error::NotSupported(_))
    ));
    routing.commit_routes().unwrap();
    assert!(h.vm.routing_tables().is_empty());
}

#[test]
fn kernel_resample_is_passed_through() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    let event = EventFd::new(EFD_NONBLOCK).unwrap();
    let resample = EventFd::new(EFD_NONBLOCK).unwrap();
    routing.assign_irqfd(&event, Some(&resample), 5).unwrap();
    routing.deassign_irqfd(&event, Some(&resample), 5).unwrap();

    let irqfds = h.vm.irqfds();
    assert_eq!(irqfds.len(), 2);
    assert_eq!(irqfds[0].fd, event.as_raw_fd());
    assert_eq!(irqfds[0].gsi, 5);
    assert_eq!(irqfds[0].resample_fd, Some(resample.as_raw_fd()));
    assert!(!irqfds[0].deassign);
    assert!(irqfds[1].deassign);
}

#[test]
fn split_irqchip_resamples_in_user_space() {
    let h = harness(AccelConfig {
        kernel_irqchip: KernelIrqchip::Split,
        ..Default::default()
    });
    let routing = h.accel.routing();
    let event = EventFd::new(EFD_NONBLOCK).unwrap();
    let resample = EventFd::new(EFD_NONBLOCK).unwrap();
    routing.assign_irqfd(&event, Some(&resample), 7).unwrap();
    assert_eq!(h.vm.irqfds()[0].resample_fd, None);

    routing.resample_notify(6);
    assert!(resample.read().is_err());
    routing.resample_notify(7);
    assert_eq!(resample.read().unwrap(), 1);

    routing.deassign_irqfd(&event, Some(&resample), 7).unwrap();
    routing.resample_notify(7);
    assert!(resample.read().is_err());
}

#[test]
fn adapter_routes_wait_for_commit() {
    let h = harness(AccelConfig::default());
    let routing = h.accel.routing();
    let gsi = routing.add_adapter_route(0x1000, 0x2000, 3, 5, 1).unwrap();
    assert!(h.vm.routing_tables().is_empty());
    routing.commit_routes().unwrap();
    assert_eq!(
        h.vm.routing_tables()[0][0].source,
        IrqSource::S390Adapter {
            summary_addr: 0x1000,
            ind_addr: 0x2000,
            summary_offset: 3,
            ind_offset: 5,
            adapter_id: 1
        }
    );
    assert_eq!(h.vm.routing_tables()[0][0].gsi, gsi);
}

#[test]
fn line_status_follows_the_kernel_capability() {
    let h = small_table();
    h.accel.routing().set_irq(2, true).unwrap();
    assert_eq!(h.vm.irq_line_status(), vec![true]);

    let vm = FakeVm::new();
    vm.set_cap(KVM_CAP_IRQ_INJECT_STATUS, 0);
    let h = harness_with(vm, FakeExtensionLoader::new(), AccelConfig::default());
    assert_eq!(h.accel.routing().set_irq(2, false).unwrap(), 1);
    assert_eq!(h.vm.irq_lines(), vec![(2, false)]);
    assert_eq!(h.vm.irq_line_status(), vec![false]);
}

#[test]
fn failed_commit_returns_the_msi_gsi() {
    let h = small_table();
    let routing = h.accel.routing();
    h.vm.fail_gsi_routing(Some(libc::ENOMEM));
    for data in 0..8 {
        assert!(routing.send_msi(msi(0xfee0_0000, data)).is_err());
    }
    assert_eq!(routing.route_count(), 0);
    assert_eq!(routing.commit_count(), 0);

    h.vm.fail_gsi_routing(None);
    routing.send_msi(msi(0xfee0_0000, 0x31)).unwrap();
    assert_eq!(routing.route(0).unwrap().gsi, 0);
    assert_eq!(h.vm.irq_lines(), vec![(0, true)]);
}
