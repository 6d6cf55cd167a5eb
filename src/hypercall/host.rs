// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host services that extension hypercalls reach outside the accelerator.

use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use anyhow::Context;

use crate::hypercall::perf;

/// Backend type of shared map memory.
pub const MAP_BACKEND_TYPE: &str = "memory-backend-memfd";
/// Driver of the device that exposes a map to the guest.
pub const MAP_DEVICE_DRIVER: &str = "ivshmem-plain";

/// A region of host memory exposed to the guest as a hotplugged shared memory device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedMemoryDevice {
    pub backend_id: String,
    pub backend_type: &'static str,
    /// Page rounded size of the backend.
    pub size: u64,
    /// Host address of the memory that backs the device.
    pub host_addr: u64,
    pub share: bool,
    pub prealloc: bool,
    pub device_id: String,
    pub driver: &'static str,
    pub bus: String,
}

impl SharedMemoryDevice {
    /// Describes the device for map slot `slot` backed by `size` bytes at `host_addr`.
    pub fn for_map_slot(slot: usize, host_addr: u64, size: u64, page_size: u64) -> Self {
        SharedMemoryDevice {
            backend_id: format!("bpf_map_obj{}", slot),
            backend_type: MAP_BACKEND_TYPE,
            size: size.next_multiple_of(page_size),
            host_addr,
            share: true,
            prealloc: true,
            device_id: format!("bpf_map_dev{}", slot),
            driver: MAP_DEVICE_DRIVER,
            bus: format!("hp{}", slot),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetDeviceRequest {
    Create {
        id: String,
        vhost_dev: PathBuf,
        interface: u64,
    },
    Destroy {
        id: String,
        interface: u64,
    },
}

impl NetDeviceRequest {
    pub fn create(interface: u64) -> Self {
        NetDeviceRequest::Create {
            id: format!("Nvdpa-{}", interface),
            vhost_dev: PathBuf::from(format!("/dev/vhost-vdpa-{}", interface)),
            interface,
        }
    }

    pub fn destroy(interface: u64) -> Self {
        NetDeviceRequest::Destroy {
            id: format!("Nvdpa-{}", interface),
            interface,
        }
    }
}

/// Host side of the extension hypercalls.
pub trait ExtensionHost: Send + Sync {
    /// Host interface index of the guest's network interface `guest_netindex`.
    fn netdev_ifindex(&self, guest_netindex: u64) -> Option<i32>;

    /// Opens a disabled CPU cycle counter sampling at `sample_freq` on `cpu`.
    fn open_cycle_counter(&self, sample_freq: u64, cpu: i32) -> anyhow::Result<OwnedFd> {
        perf::open_cycle_counter(sample_freq, cpu).context("failed to open cycle counter")
    }

    fn enable_counter(&self, counter: &OwnedFd) -> anyhow::Result<()> {
        perf::enable(counter).context("failed to enable cycle counter")
    }

    /// Creates the backend and plugs the device.
    fn publish_shared_memory(&self, device: &SharedMemoryDevice) -> anyhow::Result<()>;

    /// Requests removal of the device. The guest may complete the unplug later.
    fn unplug_shared_memory(&self, device_id: &str) -> anyhow::Result<()>;

    /// Deletes a backend whose device is gone. Fails while the backend is still in use.
    fn release_backend(&self, backend_id: &str) -> anyhow::Result<()>;

    fn net_device(&self, request: &NetDeviceRequest) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_device_names_follow_slot() {
        let dev = SharedMemoryDevice::for_map_slot(3, 0x7f00_0000_0000, 0x1800, 0x1000);
        assert_eq!(dev.backend_id, "bpf_map_obj3");
        assert_eq!(dev.device_id, "bpf_map_dev3");
        assert_eq!(dev.bus, "hp3");
        assert_eq!(dev.size, 0x2000);
    }

    #[test]
    fn vdpa_names() {
        assert_eq!(
            NetDeviceRequest::create(2),
            NetDeviceRequest::Create {
                id: "Nvdpa-2".to_string(),
                vhost_dev: PathBuf::from("/dev/vhost-vdpa-2"),
                interface: 2,
            }
        );
    }
}
