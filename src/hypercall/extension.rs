// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the bytecode library that opens, loads and attaches extension objects.
//!
//! The registry never looks inside an object. It names programs and maps by string, attaches
//! programs to host hook points and maps map data into the host address space by file
//! descriptor.

use std::os::unix::io::RawFd;

/// Handle of a program inside its object.
pub type ProgramId = usize;

/// A data table of a loaded object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapInfo {
    /// Borrowed from the object; valid while the object is open.
    pub fd: RawFd,
    pub max_entries: u32,
    pub value_size: u32,
}

impl MapInfo {
    /// Bytes of map data that can be mapped into memory.
    pub fn data_size(&self) -> u64 {
        u64::from(self.max_entries) * u64::from(self.value_size)
    }
}

/// Where a program gets attached by [`ExtensionObject::attach`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachTarget {
    Xdp { ifindex: i32 },
    Kprobe { function: &'static str, retprobe: bool },
    PerfEvent { fd: RawFd },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcAttachPoint {
    Ingress,
    Egress,
}

/// A traffic control hook on a host interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcHook {
    pub ifindex: i32,
    pub attach_point: TcAttachPoint,
}

/// Options of a traffic control filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcOpts {
    pub priority: u32,
    pub handle: u32,
    pub replace: bool,
}

impl TcOpts {
    /// The single filter the registry installs on a hook.
    pub const fn filter() -> TcOpts {
        TcOpts {
            priority: 1,
            handle: 1,
            replace: false,
        }
    }

    pub const fn replacing(self) -> TcOpts {
        TcOpts {
            replace: true,
            ..self
        }
    }
}

/// An attachment made by [`ExtensionObject::attach`].
pub trait ExtensionLink: Send {
    /// Detaches the program.
    fn destroy(self: Box<Self>) -> anyhow::Result<()>;
}

/// An opened extension object.
///
/// Dropping the object closes it and releases everything the library allocated for it.
pub trait ExtensionObject: Send {
    /// Verifies and loads every program of the object into the kernel.
    fn load(&mut self) -> anyhow::Result<()>;

    fn find_program(&self, name: &str) -> Option<ProgramId>;

    fn find_map(&self, name: &str) -> Option<MapInfo>;

    fn attach(
        &mut self,
        program: ProgramId,
        target: AttachTarget,
    ) -> anyhow::Result<Box<dyn ExtensionLink>>;

    fn tc_hook_create(&mut self, hook: &TcHook) -> anyhow::Result<()>;

    fn tc_hook_destroy(&mut self, hook: &TcHook) -> anyhow::Result<()>;

    fn tc_attach(&mut self, hook: &TcHook, program: ProgramId, opts: &TcOpts)
        -> anyhow::Result<()>;

    fn tc_detach(&mut self, hook: &TcHook, opts: &TcOpts) -> anyhow::Result<()>;
}

/// Opens extension objects from in-memory images.
pub trait ExtensionLoader: Send + Sync {
    fn open(&self, image: &[u8]) -> anyhow::Result<Box<dyn ExtensionObject>>;
}
