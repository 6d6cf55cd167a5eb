// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest hypercalls that manage host extension programs ("hyperupcalls").
//!
//! The guest passes an opcode and four arguments. A successful call returns a slot index or 0,
//! any failure returns -1. Guest pointers are guest physical addresses.

pub mod extension;
pub mod host;
pub mod perf;
mod registry;

use std::sync::Arc;
use std::sync::MutexGuard;

use enumn::N;
use log::error;
use log::warn;
use sync::Mutex;

use crate::hypercall::extension::ExtensionLoader;
use crate::hypercall::host::ExtensionHost;
use crate::hypercall::host::NetDeviceRequest;
use crate::memory::shadow::ShadowSlotTable;
use crate::memory::GuestMemory;
use crate::Error;
use crate::Result;

pub use registry::ExtensionRegistry;
pub use registry::HookMajor;
pub use registry::MAX_MAPS;
pub use registry::MAX_OBJECTS;
pub use registry::MAX_PROGRAMS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u64)]
pub enum HypercallOp {
    /// `(page_table_gpa, len)`: returns the object slot.
    Load = 13,
    /// `(slot)`
    Unload = 14,
    /// `(slot, name_gpa, major, minor)`: returns the program slot.
    Link = 15,
    /// `(slot, program_slot)`
    Unlink = 16,
    /// `(slot, name_gpa)`: returns the map slot.
    Map = 17,
    /// `(slot, map_slot)`
    Unmap = 18,
    MapElemGetSet = 19,
    /// `(command, interface)`
    VdpaNetDevice = 23,
}

const VDPA_CREATE: u64 = 1;
const VDPA_DESTROY: u64 = 2;

pub struct HypercallHandler {
    registry: Mutex<ExtensionRegistry>,
    host: Arc<dyn ExtensionHost>,
}

impl HypercallHandler {
    pub fn new(
        loader: Arc<dyn ExtensionLoader>,
        host: Arc<dyn ExtensionHost>,
        shadow: Arc<Mutex<ShadowSlotTable>>,
        profiling_cpu: i32,
    ) -> Self {
        HypercallHandler {
            registry: Mutex::new(ExtensionRegistry::new(
                loader,
                host.clone(),
                shadow,
                profiling_cpu,
            )),
            host,
        }
    }

    pub fn registry(&self) -> MutexGuard<ExtensionRegistry> {
        self.registry.lock()
    }

    /// Runs hypercall `nr` and returns the value for the guest's result register.
    pub fn handle(&self, nr: u64, args: [u64; 4], mem: &dyn GuestMemory) -> i64 {
        let mut registry = self.registry.lock();
        registry.release_deferred_backends();

        let Some(op) = HypercallOp::n(nr) else {
            warn!("unknown hypercall {}", nr);
            return 0;
        };
        let result = match op {
            HypercallOp::Load => registry.load(mem, args[0], args[1]).map(|s| s as i64),
            HypercallOp::Unload => registry.unload(args[0]).map(|_| 0),
            HypercallOp::Link => registry
                .link(mem, args[0], args[1], args[2], args[3])
                .map(|s| s as i64),
            HypercallOp::Unlink => registry.unlink(args[0], args[1]).map(|_| 0),
            HypercallOp::Map => registry.map(mem, args[0], args[1]).map(|s| s as i64),
            HypercallOp::Unmap => registry.unmap(args[0], args[1]).map(|_| 0),
            HypercallOp::MapElemGetSet => Err(Error::NotImplemented("map element get/set")),
            HypercallOp::VdpaNetDevice => {
                if let Err(e) = self.vdpa_net_device(args[0], args[1]) {
                    error!("vdpa hypercall failed: {}", e);
                }
                Ok(0)
            }
        };
        match result {
            Ok(ret) => ret,
            Err(e) => {
                error!("hypercall {:?} failed: {}", op, e);
                -1
            }
        }
    }

    fn vdpa_net_device(&self, command: u64, interface: u64) -> Result<()> {
        let request = match command {
            VDPA_CREATE => NetDeviceRequest::create(interface),
            VDPA_DESTROY => NetDeviceRequest::destroy(interface),
            _ => return Err(Error::InvalidVdpaCommand(command)),
        };
        self.host.net_device(&request).map_err(Error::Collaborator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes() {
        assert_eq!(HypercallOp::n(13), Some(HypercallOp::Load));
        assert_eq!(HypercallOp::n(19), Some(HypercallOp::MapElemGetSet));
        assert_eq!(HypercallOp::n(23), Some(HypercallOp::VdpaNetDevice));
        assert_eq!(HypercallOp::n(20), None);
        assert_eq!(HookMajor::n(4), Some(HookMajor::TcIngress));
        assert_eq!(HookMajor::n(6), None);
    }
}
