// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod common;

use common::*;
use kvm_accel::accel::MemoryListener;
use kvm_accel::fake::ExtensionEvent;
use kvm_accel::fake::FakeExtensionLoader;
use kvm_accel::fake::FakeGuestMemory;
use kvm_accel::fake::FakeVm;
use kvm_accel::hypercall::extension::AttachTarget;
use kvm_accel::hypercall::extension::TcAttachPoint;
use kvm_accel::hypercall::extension::TcHook;
use kvm_accel::hypercall::extension::TcOpts;
use kvm_accel::hypercall::host::NetDeviceRequest;
use kvm_accel::hypercall::MAX_MAPS;
use kvm_accel::hypercall::MAX_PROGRAMS;
use kvm_accel::memory::GuestMemory;
use kvm_accel::AccelConfig;
use kvm_accel::Error;

const LOAD: u64 = 13;
const UNLOAD: u64 = 14;
const LINK: u64 = 15;
const UNLINK: u64 = 16;
const MAP: u64 = 17;
const UNMAP: u64 = 18;
const MAP_ELEM: u64 = 19;
const VDPA: u64 = 23;

const XDP: u64 = 0;
const PAGE_FAULT: u64 = 1;
const TC_EGRESS: u64 = 2;
const DIRECT_EXEC: u64 = 3;
const TC_INGRESS: u64 = 4;
const PROFILING: u64 = 5;

const TABLE_GPA: u64 = 0x1000;
const IMAGE_GPA: u64 = 0x2000;
const NAME_GPA: u64 = 0x8000;
const MAP_NAME_GPA: u64 = 0x9000;
const IMAGE_LEN: u64 = 5000;
const HOST: u64 = 0x7f00_0000_0000;

struct Guest {
    h: Harness,
    mem: FakeGuestMemory,
}

impl Guest {
    fn new(loader: FakeExtensionLoader, config: AccelConfig) -> Guest {
        let guest = Guest {
            h: harness_with(FakeVm::new(), loader, config),
            mem: FakeGuestMemory::new(0x10000),
        };
        guest.put_image(IMAGE_LEN);
        guest.put_name(NAME_GPA, "probe");
        guest.put_name(MAP_NAME_GPA, "counters");
        guest
    }

    fn call(&self, op: u64, args: [u64; 4]) -> i64 {
        self.h.accel.hypercalls().handle(op, args, &self.mem)
    }

    fn put_name(&self, gpa: u64, name: &str) {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        self.mem.write_at(gpa, &bytes).unwrap();
    }

    // Lays out an image of `len` bytes one guest page after another, with the page table at
    // TABLE_GPA. Byte i of the image is i modulo 251.
    fn put_image(&self, len: u64) {
        let image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        for (i, page) in image.chunks(4096).enumerate() {
            let gpa = IMAGE_GPA + i as u64 * 4096;
            self.mem
                .write_at(TABLE_GPA + i as u64 * 8, &gpa.to_le_bytes())
                .unwrap();
            self.mem.write_at(gpa, page).unwrap();
        }
    }

    fn load(&self) -> i64 {
        self.call(LOAD, [TABLE_GPA, IMAGE_LEN, 0, 0])
    }

    fn link(&self, obj: i64, major: u64, minor: u64) -> i64 {
        self.call(LINK, [obj as u64, NAME_GPA, major, minor])
    }
}

fn loader() -> FakeExtensionLoader {
    FakeExtensionLoader::new()
        .with_program("probe")
        .with_map("counters", 16, 8)
        .with_map("l0_memslots_base_gfns", 128, 8)
        .with_map("l0_memslots_npages", 128, 8)
        .with_map("l0_memslots_userspace_addr", 128, 8)
}

fn read_u64(bytes: Option<Vec<u8>>) -> u64 {
    let bytes = bytes.expect("map data not found");
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

#[test]
fn object_lifecycle() {
    let g = Guest::new(loader(), AccelConfig::default());
    let listener = g.h.accel.memory_listener(0).unwrap();
    listener.region_add(&ram(0x10_0000, 4, HOST));

    assert_eq!(g.load(), 0);
    let images = g.h.loader.images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].len(), IMAGE_LEN as usize);
    assert_eq!(images[0][4097], (4097 % 251) as u8);
    assert_eq!(
        g.h.loader.events(),
        vec![
            ExtensionEvent::Opened {
                len: IMAGE_LEN as usize
            },
            ExtensionEvent::Loaded
        ]
    );

    assert_eq!(g.link(0, PAGE_FAULT, 0), 0);
    assert!(g.h.loader.events().contains(&ExtensionEvent::Attached {
        program: "probe".to_string(),
        target: AttachTarget::Kprobe {
            function: "alloc_bypass",
            retprobe: true
        },
    }));
    // The slot layout is visible to the page fault program.
    assert_eq!(
        read_u64(g.h.loader.map_contents("l0_memslots_base_gfns", 8)),
        0x100
    );
    assert_eq!(
        read_u64(g.h.loader.map_contents("l0_memslots_npages", 8)),
        4 * page() / 4096
    );
    assert_eq!(
        read_u64(g.h.loader.map_contents("l0_memslots_userspace_addr", 8)),
        HOST
    );

    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);
    let published = g.h.host.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].backend_id, "bpf_map_obj0");
    assert_eq!(published[0].device_id, "bpf_map_dev0");
    assert_eq!(published[0].bus, "hp0");
    assert_eq!(published[0].size, page());
    assert!(published[0].share);
    assert_ne!(published[0].host_addr, 0);
    assert_eq!(g.h.accel.hypercalls().registry().maps(0), vec![0]);

    assert_eq!(g.call(UNMAP, [0, 0, 0, 0]), 0);
    assert_eq!(g.h.host.unplugged(), vec!["bpf_map_dev0".to_string()]);
    assert_eq!(
        g.h.accel.hypercalls().registry().pending_backends(),
        vec!["bpf_map_obj0".to_string()]
    );

    // Deferred backends are retried ahead of every hypercall.
    assert_eq!(g.call(UNLINK, [0, 0, 0, 0]), 0);
    assert_eq!(g.h.host.released(), vec!["bpf_map_obj0".to_string()]);
    assert!(g.h.loader.events().contains(&ExtensionEvent::LinkDestroyed {
        program: "probe".to_string()
    }));
    assert!(g.h.accel.hypercalls().registry().programs(0).is_empty());

    assert_eq!(g.call(UNLOAD, [0, 0, 0, 0]), 0);
    assert_eq!(g.h.loader.events().last(), Some(&ExtensionEvent::Closed));
    assert!(!g.h.accel.hypercalls().registry().is_loaded(0));

    assert_eq!(g.call(UNLINK, [0, 0, 0, 0]), -1);
    assert_eq!(g.call(UNLOAD, [0, 0, 0, 0]), -1);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), -1);
}

#[test]
fn unload_detaches_everything() {
    let g = Guest::new(loader(), AccelConfig::default());
    g.h.host.add_netdev(0, 7);
    assert_eq!(g.load(), 0);
    assert_eq!(g.link(0, DIRECT_EXEC, 0), 0);
    assert_eq!(g.link(0, TC_INGRESS, 0), 1);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);

    assert_eq!(g.call(UNLOAD, [0, 0, 0, 0]), 0);
    let hook = TcHook {
        ifindex: 7,
        attach_point: TcAttachPoint::Ingress,
    };
    let events = g.h.loader.events();
    let tail = &events[events.len() - 4..];
    assert_eq!(
        tail,
        &[
            ExtensionEvent::LinkDestroyed {
                program: "probe".to_string()
            },
            ExtensionEvent::TcDetached(hook),
            ExtensionEvent::TcHookDestroyed(hook),
            ExtensionEvent::Closed,
        ]
    );
    assert_eq!(g.h.host.unplugged(), vec!["bpf_map_dev0".to_string()]);
    assert_eq!(
        g.h.accel.hypercalls().registry().pending_backends(),
        vec!["bpf_map_obj0".to_string()]
    );
}

#[test]
fn xdp_links_resolve_the_guest_interface() {
    let g = Guest::new(loader(), AccelConfig::default());
    g.h.host.add_netdev(1, 42);
    assert_eq!(g.load(), 0);
    assert_eq!(g.link(0, XDP, 1), 0);
    assert!(g.h.loader.events().contains(&ExtensionEvent::Attached {
        program: "probe".to_string(),
        target: AttachTarget::Xdp { ifindex: 42 },
    }));
    assert_eq!(g.link(0, XDP, 2), -1);
}

#[test]
fn invalid_link_requests() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    assert_eq!(g.link(0, PAGE_FAULT, 2), -1);
    assert_eq!(g.link(0, DIRECT_EXEC, 1), -1);
    assert_eq!(g.link(0, 9, 0), -1);
    assert_eq!(g.link(3, PAGE_FAULT, 0), -1);
    g.put_name(NAME_GPA, "missing");
    assert_eq!(g.link(0, PAGE_FAULT, 0), -1);
    assert!(g.h.accel.hypercalls().registry().programs(0).is_empty());
}

#[test]
fn page_fault_update_hook_exports_nothing() {
    let g = Guest::new(loader(), AccelConfig::default());
    let listener = g.h.accel.memory_listener(0).unwrap();
    listener.region_add(&ram(0x10_0000, 4, HOST));
    assert_eq!(g.load(), 0);
    assert_eq!(g.link(0, PAGE_FAULT, 1), 0);
    assert!(g.h.loader.events().contains(&ExtensionEvent::Attached {
        program: "probe".to_string(),
        target: AttachTarget::Kprobe {
            function: "update_mapping",
            retprobe: true
        },
    }));
    assert_eq!(
        read_u64(g.h.loader.map_contents("l0_memslots_base_gfns", 8)),
        0
    );
}

#[test]
fn failed_attach_leaves_the_program_slot_free() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    g.h.loader.fail_attach(true);
    assert_eq!(g.link(0, PAGE_FAULT, 0), -1);
    g.h.loader.fail_attach(false);
    assert_eq!(g.link(0, PAGE_FAULT, 0), 0);
}

#[test]
fn program_slots_run_out() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    for expected in 0..MAX_PROGRAMS {
        assert_eq!(g.link(0, DIRECT_EXEC, 0), expected as i64);
    }
    assert_eq!(g.link(0, DIRECT_EXEC, 0), -1);
    assert_eq!(g.call(UNLINK, [0, 3, 0, 0]), 0);
    assert_eq!(g.link(0, DIRECT_EXEC, 0), 3);
    assert_eq!(g.call(UNLINK, [0, MAX_PROGRAMS as u64, 0, 0]), -1);
}

#[test]
fn tc_failure_destroys_the_hook() {
    let g = Guest::new(loader(), AccelConfig::default());
    g.h.host.add_netdev(0, 9);
    assert_eq!(g.load(), 0);
    g.h.loader.fail_tc_attach(true);
    assert_eq!(g.link(0, TC_EGRESS, 0), -1);
    let hook = TcHook {
        ifindex: 9,
        attach_point: TcAttachPoint::Egress,
    };
    let events = g.h.loader.events();
    assert_eq!(
        &events[events.len() - 2..],
        &[
            ExtensionEvent::TcHookCreated(hook),
            ExtensionEvent::TcHookDestroyed(hook)
        ]
    );

    g.h.loader.fail_tc_attach(false);
    assert_eq!(g.link(0, TC_EGRESS, 0), 0);
    assert_eq!(
        g.h.loader.events().last(),
        Some(&ExtensionEvent::TcAttached {
            hook,
            program: "probe".to_string(),
            opts: TcOpts::filter().replacing(),
        })
    );
}

#[test]
fn profiling_samples_the_configured_cpu() {
    let g = Guest::new(
        loader(),
        AccelConfig {
            profiling_cpu: 3,
            ..Default::default()
        },
    );
    assert_eq!(g.load(), 0);
    assert_eq!(g.link(0, PROFILING, 997), 0);
    assert_eq!(g.h.host.counters(), vec![(997, 3)]);
    assert_eq!(g.h.host.enabled_counters(), 1);
    assert!(g.h.loader.events().iter().any(|e| matches!(
        e,
        ExtensionEvent::Attached {
            target: AttachTarget::PerfEvent { .. },
            ..
        }
    )));

    g.h.host.fail_enable(true);
    assert_eq!(g.link(0, PROFILING, 997), -1);
    assert_eq!(
        g.h.loader.events().last(),
        Some(&ExtensionEvent::LinkDestroyed {
            program: "probe".to_string()
        })
    );
    assert_eq!(g.h.accel.hypercalls().registry().programs(0), vec![0]);
}

#[test]
fn busy_backend_is_released_later() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);
    g.h.host.set_backend_busy("bpf_map_obj0", true);
    assert_eq!(g.call(UNMAP, [0, 0, 0, 0]), 0);

    // The slot stays reserved while its backend exists.
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 1);
    assert!(g.h.host.released().is_empty());

    g.h.host.set_backend_busy("bpf_map_obj0", false);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);
    assert_eq!(g.h.host.released(), vec!["bpf_map_obj0".to_string()]);
    assert!(g
        .h
        .accel
        .hypercalls()
        .registry()
        .pending_backends()
        .is_empty());
}

#[test]
fn failed_unplug_keeps_the_map() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);
    g.h.host.fail_unplug(true);
    assert_eq!(g.call(UNMAP, [0, 0, 0, 0]), -1);
    assert_eq!(g.h.accel.hypercalls().registry().maps(0), vec![0]);
    assert_eq!(g.call(UNMAP, [0, 5, 0, 0]), -1);
}

#[test]
fn map_slots_are_shared_between_objects() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    assert_eq!(g.load(), 1);
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), 0);
    assert_eq!(g.call(MAP, [1, MAP_NAME_GPA, 0, 0]), 1);
    assert_eq!(g.h.host.published()[1].device_id, "bpf_map_dev1");

    // Unmapping from the wrong object is rejected.
    assert_eq!(g.call(UNMAP, [0, 1, 0, 0]), -1);
    assert_eq!(g.call(UNMAP, [1, 1, 0, 0]), 0);

    for _ in 1..MAX_MAPS {
        assert!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]) > 0);
    }
    assert_eq!(g.call(MAP, [1, MAP_NAME_GPA, 0, 0]), -1);
}

#[test]
fn unknown_map_name() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.load(), 0);
    g.put_name(MAP_NAME_GPA, "nope");
    assert_eq!(g.call(MAP, [0, MAP_NAME_GPA, 0, 0]), -1);
    assert!(g.h.host.published().is_empty());
}

#[test]
fn load_failures() {
    let g = Guest::new(loader(), AccelConfig::default());
    g.h.loader.fail_load(true);
    assert_eq!(g.load(), -1);
    assert!(!g.h.accel.hypercalls().registry().is_loaded(0));
    assert_eq!(g.h.loader.events().last(), Some(&ExtensionEvent::Closed));
    g.h.loader.fail_load(false);

    // The page table lies outside guest memory.
    assert_eq!(g.call(LOAD, [0x10_0000, IMAGE_LEN, 0, 0]), -1);

    let err = g
        .h
        .accel
        .hypercalls()
        .registry()
        .load(&g.mem, TABLE_GPA, 4096 * 512 + 1)
        .unwrap_err();
    assert!(matches!(err, Error::ImageTooLarge(_)));
    assert_eq!(g.load(), 0);
}

#[test]
fn unknown_and_unimplemented_opcodes() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.call(20, [0; 4]), 0);
    assert_eq!(g.call(12, [0; 4]), 0);
    assert_eq!(g.call(MAP_ELEM, [0; 4]), -1);
}

#[test]
fn vdpa_net_devices() {
    let g = Guest::new(loader(), AccelConfig::default());
    assert_eq!(g.call(VDPA, [1, 2, 0, 0]), 0);
    assert_eq!(g.call(VDPA, [2, 2, 0, 0]), 0);
    // Unknown commands are logged; the guest still sees success.
    assert_eq!(g.call(VDPA, [7, 2, 0, 0]), 0);
    assert_eq!(
        g.h.host.net_requests(),
        vec![NetDeviceRequest::create(2), NetDeviceRequest::destroy(2)]
    );
}
