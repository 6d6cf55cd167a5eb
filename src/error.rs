// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;
use vmm_sys_util::errno::Error as SysError;

/// Errors produced by the accelerator control plane.
#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to assign or deassign irqfd for gsi {gsi}: {err}")]
    AssignIrqfd { gsi: u32, err: SysError },
    #[error("failed to clear dirty log of slot {slot:#x}: {err}")]
    ClearDirtyLog { slot: u32, err: SysError },
    #[error("extension collaborator failed: {0:#}")]
    Collaborator(anyhow::Error),
    #[error("dirty ring reset {reset} entries but {reaped} were reaped")]
    DirtyRingResetMismatch { reaped: u64, reset: u64 },
    #[error("dirty ring of {requested} bytes exceeds the kernel limit of {max} bytes")]
    DirtyRingTooLarge { requested: u64, max: u64 },
    #[error("failed to enable capability {cap}: {err}")]
    EnableCap { cap: u32, err: SysError },
    #[error("failed to get dirty log of slot {slot:#x}: {err}")]
    GetDirtyLog { slot: u32, err: SysError },
    #[error("failed to get statistics descriptor: {0}")]
    GetStatsFd(SysError),
    #[error("guest memory access faulted at {0:#x}")]
    GuestMemoryFault(u64),
    #[error("extension image of {0} bytes does not fit the page table")]
    ImageTooLarge(u64),
    #[error("invalid accelerator configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid hook major id {0}")]
    InvalidMajorId(u64),
    #[error("invalid map slot {0}")]
    InvalidMapSlot(u64),
    #[error("invalid hook minor id {minor} for major id {major}")]
    InvalidMinorId { major: u64, minor: u64 },
    #[error("guest supplied name is not valid")]
    InvalidName,
    #[error("invalid extension object slot {0}")]
    InvalidObjectSlot(u64),
    #[error("invalid program slot {0}")]
    InvalidProgramSlot(u64),
    #[error("invalid vdpa command {0}")]
    InvalidVdpaCommand(u64),
    #[error("irqchip pin {pin} is beyond the gsi count {gsi_count}")]
    IrqPinOutOfRange { pin: u32, gsi_count: u32 },
    #[error("map {0} not found in extension object")]
    MapNotFound(String),
    #[error("failed to map memory: {0}")]
    Mmap(SysError),
    #[error("no free gsi")]
    NoFreeGsi,
    #[error("no free map slot")]
    NoFreeMapSlot,
    #[error("no free memory slot")]
    NoFreeMemSlot,
    #[error("no free extension object slot")]
    NoFreeObjectSlot,
    #[error("no free program slot")]
    NoFreeProgramSlot,
    #[error("program slot {0} has neither a link nor a hook")]
    NoProgramAttachment(u64),
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("{0} is not supported by the kernel")]
    NotSupported(&'static str),
    #[error("program {0} not found in extension object")]
    ProgramNotFound(String),
    #[error("failed to read statistics: {0}")]
    ReadStats(std::io::Error),
    #[error("failed to reset dirty rings: {0}")]
    ResetDirtyRings(SysError),
    #[error("no route for gsi {0}")]
    RouteNotFound(u32),
    #[error("failed to run vcpu {id}: {err}")]
    RunVcpu { id: usize, err: SysError },
    #[error("failed to set gsi routing: {0}")]
    SetGsiRouting(SysError),
    #[error("failed to set irq line {gsi}: {err}")]
    SetIrqLine { gsi: u32, err: SysError },
    #[error("failed to set memory slot {slot:#x}: {err}")]
    SetUserMemoryRegion { slot: u32, err: SysError },
    #[error("failed to signal msi: {0}")]
    SignalMsi(SysError),
    #[error("failed to spawn thread: {0}")]
    SpawnThread(std::io::Error),
    #[error("unknown guest network interface {0}")]
    UnknownNetdev(u64),
    #[error("vcpu {id} exited fatally: {reason}")]
    VcpuFatalExit { id: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Linux errno that best describes this error, for callers that report numeric codes.
    pub fn errno(&self) -> i32 {
        use Error::*;
        match self {
            AssignIrqfd { err, .. }
            | ClearDirtyLog { err, .. }
            | EnableCap { err, .. }
            | GetDirtyLog { err, .. }
            | RunVcpu { err, .. }
            | SetIrqLine { err, .. }
            | SetUserMemoryRegion { err, .. } => err.errno(),
            GetStatsFd(err) | Mmap(err) | ResetDirtyRings(err) | SetGsiRouting(err)
            | SignalMsi(err) => err.errno(),
            NoFreeGsi | NoFreeMapSlot | NoFreeMemSlot | NoFreeObjectSlot | NoFreeProgramSlot => {
                libc::ENOSPC
            }
            GuestMemoryFault(_) => libc::EFAULT,
            RouteNotFound(_) => libc::ESRCH,
            NotImplemented(_) | NotSupported(_) => libc::ENOSYS,
            MapNotFound(_) | ProgramNotFound(_) | UnknownNetdev(_) => libc::ENOENT,
            ReadStats(e) | SpawnThread(e) => e.raw_os_error().unwrap_or(libc::EIO),
            DirtyRingResetMismatch { .. } | VcpuFatalExit { .. } | Collaborator(_) => libc::EIO,
            DirtyRingTooLarge { .. }
            | ImageTooLarge(_)
            | InvalidConfig(_)
            | InvalidMajorId(_)
            | InvalidMapSlot(_)
            | InvalidMinorId { .. }
            | InvalidName
            | InvalidObjectSlot(_)
            | InvalidProgramSlot(_)
            | InvalidVdpaCommand(_)
            | IrqPinOutOfRange { .. }
            | NoProgramAttachment(_) => libc::EINVAL,
        }
    }

    /// Whether the error reports that a fixed-size table ran out of entries.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::NoFreeGsi
                | Error::NoFreeMapSlot
                | Error::NoFreeMemSlot
                | Error::NoFreeObjectSlot
                | Error::NoFreeProgramSlot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_distinct_from_kernel_failures() {
        assert!(Error::NoFreeGsi.is_exhaustion());
        assert!(Error::NoFreeMemSlot.is_exhaustion());
        assert!(!Error::SetGsiRouting(SysError::new(libc::EINVAL)).is_exhaustion());
        assert_eq!(Error::GuestMemoryFault(0x1000).errno(), libc::EFAULT);
        assert_eq!(Error::RouteNotFound(4).errno(), libc::ESRCH);
    }
}
