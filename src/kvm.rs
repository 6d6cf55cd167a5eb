// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`Vm`] and [`Vcpu`] on top of `/dev/kvm`.

use std::cell::Cell;
use std::cmp::min;
use std::ffi::CString;
use std::fs::File;
use std::mem::size_of_val;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::copy_nonoverlapping;
use std::ptr::null_mut;

use kvm_sys::*;
use libc::c_int;
use libc::c_ulong;
use libc::c_void;
use libc::siginfo_t;
use libc::EBUSY;
use libc::EINVAL;
use libc::O_CLOEXEC;
use libc::O_RDWR;
use vmm_sys_util::errno::Error;
use vmm_sys_util::errno::Result;
use vmm_sys_util::ioctl::ioctl;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::ioctl::ioctl_with_val;
use vmm_sys_util::signal::register_signal_handler;
use vmm_sys_util::signal::SIGRTMIN;

use crate::hypervisor::IrqRoute;
use crate::hypervisor::IrqSource;
use crate::hypervisor::IrqfdRequest;
use crate::hypervisor::MemoryRegionUpdate;
use crate::hypervisor::MsiMessage;
use crate::hypervisor::Vcpu;
use crate::hypervisor::VcpuExit;
use crate::hypervisor::Vm;
use crate::memory::dirty_ring::ring_bytes;
use crate::memory::pagesize;
use crate::mmap::MemoryMapping;

fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

/// Wraps a descriptor returned by an ioctl.
fn file_from_ret(ret: c_int) -> Result<File> {
    if ret < 0 {
        return errno_result();
    }
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(ret) })
}

/// A handle to `/dev/kvm`, used to create VMs and query system wide capabilities.
pub struct Kvm {
    kvm: File,
}

impl Kvm {
    pub fn new() -> Result<Kvm> {
        Kvm::new_with_path(Path::new("/dev/kvm"))
    }

    pub fn new_with_path(device_path: &Path) -> Result<Kvm> {
        let c_path =
            CString::new(device_path.as_os_str().as_bytes()).map_err(|_| Error::new(EINVAL))?;
        // SAFETY: c_path is a valid NUL terminated string and the result is checked.
        let ret = unsafe { libc::open64(c_path.as_ptr(), O_RDWR | O_CLOEXEC) };
        Ok(Kvm {
            kvm: file_from_ret(ret)?,
        })
    }

    pub fn check_extension(&self, cap: u32) -> i32 {
        // SAFETY: KVM_CHECK_EXTENSION only reads its integer argument.
        unsafe { ioctl_with_val(&self.kvm, KVM_CHECK_EXTENSION(), cap as c_ulong) }
    }

    /// Size of the `kvm_run` area of every vcpu.
    pub fn get_vcpu_mmap_size(&self) -> Result<usize> {
        // SAFETY: the ioctl takes no argument and the result is checked.
        let res = unsafe { ioctl(&self.kvm, KVM_GET_VCPU_MMAP_SIZE()) };
        if res > 0 {
            Ok(res as usize)
        } else {
            errno_result()
        }
    }

    pub fn create_vm(&self) -> Result<KvmVm> {
        let run_mmap_size = self.get_vcpu_mmap_size()?;
        // SAFETY: type 0 is the default machine type and the result is checked.
        let ret = unsafe { ioctl_with_val(&self.kvm, KVM_CREATE_VM(), 0) };
        Ok(KvmVm {
            vm: file_from_ret(ret)?,
            run_mmap_size,
        })
    }
}

pub struct KvmVm {
    vm: File,
    run_mmap_size: usize,
}

impl KvmVm {
    pub fn create_vcpu(&self, id: usize) -> Result<KvmVcpu> {
        // SAFETY: the vcpu id is passed by value and the result is checked.
        let ret = unsafe { ioctl_with_val(&self.vm, KVM_CREATE_VCPU(), id as c_ulong) };
        let vcpu = file_from_ret(ret)?;
        let run_mmap = MemoryMapping::from_fd_offset(&vcpu, self.run_mmap_size, 0)?;
        Ok(KvmVcpu { id, vcpu, run_mmap })
    }
}

impl AsRawFd for KvmVm {
    fn as_raw_fd(&self) -> RawFd {
        self.vm.as_raw_fd()
    }
}

impl Vm for KvmVm {
    fn check_extension(&self, cap: u32) -> i32 {
        // SAFETY: KVM_CHECK_EXTENSION only reads its integer argument.
        unsafe { ioctl_with_val(&self.vm, KVM_CHECK_EXTENSION(), cap as c_ulong) }
    }

    fn enable_cap(&self, cap: u32, args: [u64; 4]) -> Result<()> {
        let enable = kvm_enable_cap {
            cap,
            args,
            ..Default::default()
        };
        // SAFETY: the kernel reads exactly one kvm_enable_cap and the capabilities enabled here
        // take no pointers.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_ENABLE_CAP(), &enable) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn set_user_memory_region(&self, region: &MemoryRegionUpdate) -> Result<()> {
        let kregion = kvm_userspace_memory_region {
            slot: region.slot,
            flags: region.flags.bits(),
            guest_phys_addr: region.guest_phys_addr,
            memory_size: region.memory_size,
            userspace_addr: region.userspace_addr,
        };
        // SAFETY: the userspace address belongs to a mapping owned by the memory region the slot
        // was carved from, which outlives the slot.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_SET_USER_MEMORY_REGION(), &kregion) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn get_dirty_log(&self, slot: u32, bitmap: &mut [u64]) -> Result<()> {
        let mut log = kvm_dirty_log {
            slot,
            ..Default::default()
        };
        log.__bindgen_anon_1.dirty_bitmap = bitmap.as_mut_ptr() as *mut c_void;
        // SAFETY: bitmap is sized by the caller for the whole slot and lives across the call.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_GET_DIRTY_LOG(), &log) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn clear_dirty_log(
        &self,
        slot: u32,
        first_page: u64,
        num_pages: u32,
        bitmap: &[u64],
    ) -> Result<()> {
        let mut clear = kvm_clear_dirty_log {
            slot,
            num_pages,
            first_page,
            ..Default::default()
        };
        clear.__bindgen_anon_1.dirty_bitmap = bitmap.as_ptr() as *mut c_void;
        // SAFETY: the kernel only reads `num_pages` bits of bitmap, which covers them.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_CLEAR_DIRTY_LOG(), &clear) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn reset_dirty_rings(&self) -> Result<u32> {
        // SAFETY: the ioctl takes no argument and the result is checked.
        let ret = unsafe { ioctl(&self.vm, KVM_RESET_DIRTY_RINGS()) };
        if ret < 0 {
            return errno_result();
        }
        Ok(ret as u32)
    }

    fn set_gsi_routing(&self, routes: &[IrqRoute]) -> Result<()> {
        let mut irq_routing =
            vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(routes.len());
        irq_routing[0].nr = routes.len() as u32;

        // SAFETY: irq_routing was allocated with room for `routes.len()` entries.
        let entries = unsafe { irq_routing[0].entries.as_mut_slice(routes.len()) };
        for (route, entry) in routes.iter().zip(entries.iter_mut()) {
            entry.gsi = route.gsi;
            match route.source {
                IrqSource::Irqchip { chip, pin } => {
                    entry.type_ = KVM_IRQ_ROUTING_IRQCHIP;
                    entry.u.irqchip = kvm_irq_routing_irqchip { irqchip: chip, pin };
                }
                IrqSource::Msi {
                    address,
                    data,
                    devid,
                } => {
                    entry.type_ = KVM_IRQ_ROUTING_MSI;
                    let mut msi = kvm_irq_routing_msi {
                        address_lo: address as u32,
                        address_hi: (address >> 32) as u32,
                        data,
                        ..Default::default()
                    };
                    if let Some(devid) = devid {
                        entry.flags = KVM_MSI_VALID_DEVID;
                        msi.__bindgen_anon_1.devid = devid;
                    }
                    entry.u.msi = msi;
                }
                IrqSource::S390Adapter {
                    summary_addr,
                    ind_addr,
                    summary_offset,
                    ind_offset,
                    adapter_id,
                } => {
                    entry.type_ = KVM_IRQ_ROUTING_S390_ADAPTER;
                    entry.u.adapter = kvm_irq_routing_s390_adapter {
                        ind_addr,
                        summary_addr,
                        ind_offset,
                        summary_offset: summary_offset as u32,
                        adapter_id,
                    };
                }
                IrqSource::HvSint { vcpu, sint } => {
                    entry.type_ = KVM_IRQ_ROUTING_HV_SINT;
                    entry.u.hv_sint = kvm_irq_routing_hv_sint { vcpu, sint };
                }
            }
        }

        // SAFETY: the kernel reads `nr` entries, all of which were initialized above.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_SET_GSI_ROUTING(), &irq_routing[0]) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn signal_msi(&self, msi: &MsiMessage) -> Result<i32> {
        let kmsi = kvm_msi {
            address_lo: msi.address as u32,
            address_hi: (msi.address >> 32) as u32,
            data: msi.data,
            ..Default::default()
        };
        // SAFETY: the kernel reads exactly one kvm_msi.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_SIGNAL_MSI(), &kmsi) };
        if ret < 0 {
            return errno_result();
        }
        Ok(ret)
    }

    fn set_irq_line(&self, gsi: u32, level: bool, status: bool) -> Result<i32> {
        let mut irq_level = kvm_irq_level {
            level: level.into(),
            ..Default::default()
        };
        irq_level.__bindgen_anon_1.irq = gsi;
        if !status {
            // SAFETY: the kernel reads exactly one kvm_irq_level.
            let ret = unsafe { ioctl_with_ref(&self.vm, KVM_IRQ_LINE(), &irq_level) };
            if ret < 0 {
                return errno_result();
            }
            return Ok(1);
        }
        // SAFETY: the kernel reads and updates exactly one kvm_irq_level.
        let ret = unsafe { ioctl_with_mut_ref(&self.vm, KVM_IRQ_LINE_STATUS(), &mut irq_level) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: KVM_IRQ_LINE_STATUS stores the delivery status over the irq number.
        Ok(unsafe { irq_level.__bindgen_anon_1.status })
    }

    fn irqfd(&self, request: &IrqfdRequest) -> Result<()> {
        let mut irqfd = kvm_irqfd {
            fd: request.fd as u32,
            gsi: request.gsi,
            ..Default::default()
        };
        if request.deassign {
            irqfd.flags |= KVM_IRQFD_FLAG_DEASSIGN;
        }
        if let Some(resample_fd) = request.resample_fd {
            irqfd.flags |= KVM_IRQFD_FLAG_RESAMPLE;
            irqfd.resamplefd = resample_fd as u32;
        }
        // SAFETY: the kernel reads exactly one kvm_irqfd and takes its own references to the
        // event descriptors.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_IRQFD(), &irqfd) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn get_stats_fd(&self) -> Result<File> {
        // SAFETY: the ioctl takes no argument and returns a new descriptor that is checked.
        file_from_ret(unsafe { ioctl(&self.vm, KVM_GET_STATS_FD()) })
    }
}

thread_local!(static VCPU_RUN: Cell<*mut kvm_run> = const { Cell::new(null_mut()) });

extern "C" fn handle_kick_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {
    KvmVcpu::set_local_immediate_exit(true);
}

/// Installs the handler of the signal that kicks vcpu threads out of `KVM_RUN` and returns its
/// number.
pub fn install_kick_signal_handler() -> Result<c_int> {
    let signum = SIGRTMIN();
    register_signal_handler(signum, handle_kick_signal)?;
    Ok(signum)
}

pub struct KvmVcpu {
    id: usize,
    vcpu: File,
    run_mmap: MemoryMapping,
}

impl KvmVcpu {
    fn run_ptr(&self) -> *mut kvm_run {
        self.run_mmap.as_ptr() as *mut kvm_run
    }

    #[allow(clippy::mut_from_ref)]
    fn kvm_run(&self) -> &mut kvm_run {
        // SAFETY: the mapping is at least as large as kvm_run, as reported by the kernel, and is
        // page aligned.
        unsafe { &mut *self.run_ptr() }
    }

    /// Sets or clears the immediate exit request of the vcpu bound to the calling thread.
    pub fn set_local_immediate_exit(exit: bool) {
        VCPU_RUN.with(|run| {
            let run = run.get();
            if !run.is_null() {
                // SAFETY: a bound pointer stays valid until the vcpu is dropped, which unbinds it.
                unsafe { (*run).immediate_exit = exit.into() };
            }
        });
    }

    fn decode_exit(&self) -> Result<VcpuExit> {
        let run = self.kvm_run();
        Ok(match run.exit_reason {
            KVM_EXIT_IO => {
                // SAFETY: exit_reason selects the union field.
                let io = unsafe { run.__bindgen_anon_1.io };
                let port = io.port;
                let size = (io.count as usize) * (io.size as usize);
                match io.direction {
                    KVM_EXIT_IO_IN => VcpuExit::IoIn { port, size },
                    KVM_EXIT_IO_OUT => {
                        let mut data = [0; 8];
                        let run_start = run as *const kvm_run as *const u8;
                        // SAFETY: data_offset points inside the kvm_run mapping.
                        unsafe {
                            let data_ptr = run_start.offset(io.data_offset as isize);
                            copy_nonoverlapping(
                                data_ptr,
                                data.as_mut_ptr(),
                                min(size, data.len()),
                            );
                        }
                        VcpuExit::IoOut { port, size, data }
                    }
                    _ => return Err(Error::new(EINVAL)),
                }
            }
            KVM_EXIT_MMIO => {
                // SAFETY: exit_reason selects the union field.
                let mmio = unsafe { &run.__bindgen_anon_1.mmio };
                let address = mmio.phys_addr;
                let size = min(mmio.len as usize, mmio.data.len());
                if mmio.is_write != 0 {
                    VcpuExit::MmioWrite {
                        address,
                        size,
                        data: mmio.data,
                    }
                } else {
                    VcpuExit::MmioRead { address, size }
                }
            }
            KVM_EXIT_HYPERCALL => {
                // SAFETY: exit_reason selects the union field.
                let hypercall = unsafe { &run.__bindgen_anon_1.hypercall };
                VcpuExit::Hypercall {
                    nr: hypercall.nr,
                    args: hypercall.args,
                }
            }
            KVM_EXIT_IRQ_WINDOW_OPEN => VcpuExit::IrqWindowOpen,
            KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown,
            KVM_EXIT_UNKNOWN => {
                // SAFETY: exit_reason selects the union field.
                let hw = unsafe { run.__bindgen_anon_1.hw };
                VcpuExit::Unknown {
                    hardware_exit_reason: hw.hardware_exit_reason,
                }
            }
            KVM_EXIT_INTERNAL_ERROR => {
                // SAFETY: exit_reason selects the union field.
                let internal = unsafe { &run.__bindgen_anon_1.internal };
                let ndata = min(internal.ndata as usize, internal.data.len());
                VcpuExit::InternalError {
                    suberror: internal.suberror,
                    data: internal.data[..ndata].to_vec(),
                }
            }
            KVM_EXIT_DIRTY_RING_FULL => VcpuExit::DirtyRingFull,
            KVM_EXIT_SYSTEM_EVENT => {
                // SAFETY: exit_reason selects the union field.
                let event = unsafe { &run.__bindgen_anon_1.system_event };
                // SAFETY: data is the union member used by kernels that report ndata.
                let data = unsafe { event.__bindgen_anon_1.data };
                let ndata = min(event.ndata as usize, data.len());
                VcpuExit::SystemEvent {
                    event_type: event.type_,
                    data: data[..ndata].to_vec(),
                }
            }
            exit_reason => {
                let info = &run.__bindgen_anon_1;
                // SAFETY: the exit information is plain data of `size_of_val(info)` bytes inside
                // the kvm_run mapping.
                let payload = unsafe {
                    std::slice::from_raw_parts(info as *const _ as *const u8, size_of_val(info))
                };
                VcpuExit::Arch {
                    exit_reason,
                    payload: payload.to_vec(),
                }
            }
        })
    }
}

impl Vcpu for KvmVcpu {
    fn id(&self) -> usize {
        self.id
    }

    fn bind_to_current_thread(&self) -> Result<()> {
        VCPU_RUN.with(|run| {
            let current = run.get();
            if !current.is_null() && current != self.run_ptr() {
                return Err(Error::new(EBUSY));
            }
            run.set(self.run_ptr());
            Ok(())
        })
    }

    fn run(&mut self) -> Result<VcpuExit> {
        // SAFETY: KVM_RUN only touches the kvm_run mapping owned by this vcpu.
        let ret = unsafe { ioctl(&self.vcpu, KVM_RUN()) };
        if ret != 0 {
            return errno_result();
        }
        self.decode_exit()
    }

    fn set_immediate_exit(&self, exit: bool) {
        self.kvm_run().immediate_exit = exit.into();
    }

    fn set_data(&mut self, data: &[u8]) -> Result<()> {
        let run = self.kvm_run();
        match run.exit_reason {
            KVM_EXIT_IO => {
                let run_start = run as *mut kvm_run as *mut u8;
                // SAFETY: exit_reason selects the union field.
                let io = unsafe { run.__bindgen_anon_1.io };
                if io.direction != KVM_EXIT_IO_IN {
                    return Err(Error::new(EINVAL));
                }
                let data_size = (io.count as usize) * (io.size as usize);
                if data_size != data.len() {
                    return Err(Error::new(EINVAL));
                }
                // SAFETY: data_offset points inside the kvm_run mapping, which has room for
                // data_size bytes there.
                unsafe {
                    let data_ptr = run_start.offset(io.data_offset as isize);
                    copy_nonoverlapping(data.as_ptr(), data_ptr, data_size);
                }
                Ok(())
            }
            KVM_EXIT_MMIO => {
                // SAFETY: exit_reason selects the union field.
                let mmio = unsafe { &mut run.__bindgen_anon_1.mmio };
                if mmio.is_write != 0 {
                    return Err(Error::new(EINVAL));
                }
                let len = mmio.len as usize;
                if len != data.len() {
                    return Err(Error::new(EINVAL));
                }
                mmio.data[..len].copy_from_slice(data);
                Ok(())
            }
            _ => Err(Error::new(EINVAL)),
        }
    }

    fn set_hypercall_result(&mut self, result: u64) -> Result<()> {
        let run = self.kvm_run();
        if run.exit_reason != KVM_EXIT_HYPERCALL {
            return Err(Error::new(EINVAL));
        }
        // SAFETY: exit_reason selects the union field.
        unsafe { run.__bindgen_anon_1.hypercall.ret = result };
        Ok(())
    }

    fn map_dirty_ring(&self, entries: u32) -> Result<MemoryMapping> {
        let offset = pagesize() as u64 * KVM_DIRTY_LOG_PAGE_OFFSET;
        MemoryMapping::from_fd_offset(&self.vcpu, ring_bytes(entries) as usize, offset)
    }

    fn get_stats_fd(&self) -> Result<File> {
        // SAFETY: the ioctl takes no argument and returns a new descriptor that is checked.
        file_from_ret(unsafe { ioctl(&self.vcpu, KVM_GET_STATS_FD()) })
    }
}

impl Drop for KvmVcpu {
    fn drop(&mut self) {
        let ours = self.run_ptr();
        VCPU_RUN.with(|run| {
            if run.get() == ours {
                run.set(null_mut());
            }
        });
    }
}
