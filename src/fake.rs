// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory stand-ins for the kernel and for every collaborator of the accelerator.
//!
//! They record what they are asked to do so tests can assert on it, and they simulate just enough
//! kernel behavior (dirty logs, dirty rings, scripted vcpu exits) to drive the control plane.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use kvm_sys::*;
use libc::c_int;
use libc::c_void;
use libc::siginfo_t;
use sync::Mutex;
use vmm_sys_util::errno::Error as SysError;
use vmm_sys_util::errno::Result as SysResult;
use vmm_sys_util::signal::register_signal_handler;
use vmm_sys_util::signal::SIGRTMIN;

use crate::hypercall::extension::AttachTarget;
use crate::hypercall::extension::ExtensionLink;
use crate::hypercall::extension::ExtensionLoader;
use crate::hypercall::extension::ExtensionObject;
use crate::hypercall::extension::MapInfo;
use crate::hypercall::extension::ProgramId;
use crate::hypercall::extension::TcHook;
use crate::hypercall::extension::TcOpts;
use crate::hypercall::host::ExtensionHost;
use crate::hypercall::host::NetDeviceRequest;
use crate::hypercall::host::SharedMemoryDevice;
use crate::hypervisor::IrqRoute;
use crate::hypervisor::IrqfdRequest;
use crate::hypervisor::MemoryRegionUpdate;
use crate::hypervisor::MsiMessage;
use crate::hypervisor::Vcpu;
use crate::hypervisor::VcpuExit;
use crate::hypervisor::Vm;
use crate::memory::dirty_ring::entry_flags;
use crate::memory::dirty_ring::entry_ptr;
use crate::memory::dirty_ring::ring_bytes;
use crate::memory::pagesize;
use crate::memory::DirtyPageSink;
use crate::memory::GuestMemory;
use crate::memory::GuestMemoryFault;
use crate::mmap::MemoryMapping;
use crate::vcpu::ExitAction;
use crate::vcpu::ExitState;
use crate::vcpu::IoBus;
use crate::vcpu::ShutdownCause;
use crate::vcpu::StopReason;
use crate::vcpu::VcpuArch;
use crate::vcpu::VmRunControl;

/// Creates an anonymous file of `size` bytes.
fn memfd(name: &CStr, size: u64) -> SysResult<File> {
    // SAFETY: `name` is a valid C string and the returned descriptor is checked.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(SysError::last());
    }
    // SAFETY: `fd` was just created and nothing else owns it.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size)
        .map_err(|e| SysError::new(e.raw_os_error().unwrap_or(libc::EIO)))?;
    Ok(file)
}

/// A `KVM_CLEAR_DIRTY_LOG` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClearedLog {
    pub slot: u32,
    pub first_page: u64,
    pub num_pages: u32,
    pub bitmap: Vec<u64>,
}

struct FakeRing {
    mapping: MemoryMapping,
    size: u32,
    produce: u32,
}

#[derive(Default)]
struct FakeVmState {
    enabled_caps: Vec<(u32, [u64; 4])>,
    regions: Vec<MemoryRegionUpdate>,
    dirty: BTreeMap<u32, BTreeSet<u64>>,
    cleared: Vec<ClearedLog>,
    rings: BTreeMap<usize, FakeRing>,
    resets: u32,
    reset_override: Option<u32>,
    routing: Vec<Vec<IrqRoute>>,
    msis: Vec<MsiMessage>,
    irq_lines: Vec<(u32, bool)>,
    irq_line_status: Vec<bool>,
    irqfds: Vec<IrqfdRequest>,
    region_errno: Option<i32>,
    dirty_log_errno: Option<i32>,
    routing_errno: Option<i32>,
    stats: Option<File>,
}

/// A VM that keeps kernel state in memory.
pub struct FakeVm {
    caps: Mutex<BTreeMap<u32, i32>>,
    state: Mutex<FakeVmState>,
}

impl Default for FakeVm {
    fn default() -> Self {
        FakeVm::new()
    }
}

impl FakeVm {
    /// A VM whose kernel offers everything the accelerator can use.
    pub fn new() -> FakeVm {
        let caps = [
            (KVM_CAP_USER_MEMORY, 1),
            (KVM_CAP_NR_MEMSLOTS, 32),
            (KVM_CAP_MULTI_ADDRESS_SPACE, 2),
            (KVM_CAP_READONLY_MEM, 1),
            (KVM_CAP_IRQ_ROUTING, 1024),
            (KVM_CAP_SIGNAL_MSI, 1),
            (KVM_CAP_IRQFD, 1),
            (KVM_CAP_IRQFD_RESAMPLE, 1),
            (KVM_CAP_IRQ_INJECT_STATUS, 1),
            (KVM_CAP_HYPERV_SYNIC, 1),
            (KVM_CAP_IMMEDIATE_EXIT, 1),
            (KVM_CAP_INTERNAL_ERROR_DATA, 1),
            (KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2, 3),
            (KVM_CAP_DIRTY_LOG_RING, 65536),
            (KVM_CAP_BINARY_STATS_FD, 1),
        ];
        FakeVm {
            caps: Mutex::new(caps.into_iter().collect()),
            state: Mutex::new(FakeVmState::default()),
        }
    }

    /// Sets the value `KVM_CHECK_EXTENSION` reports for `cap`. Zero removes it.
    pub fn set_cap(&self, cap: u32, value: i32) {
        self.caps.lock().insert(cap, value);
    }

    pub fn enabled_caps(&self) -> Vec<(u32, [u64; 4])> {
        self.state.lock().enabled_caps.clone()
    }

    /// Every `KVM_SET_USER_MEMORY_REGION` call, in order.
    pub fn regions(&self) -> Vec<MemoryRegionUpdate> {
        self.state.lock().regions.clone()
    }

    /// The current state of every kernel slot that is not empty.
    pub fn live_slots(&self) -> BTreeMap<u32, MemoryRegionUpdate> {
        let mut live = BTreeMap::new();
        for region in &self.state.lock().regions {
            if region.memory_size == 0 {
                live.remove(&region.slot);
            } else {
                live.insert(region.slot, *region);
            }
        }
        live
    }

    /// Makes every following slot update fail with `errno`, or succeed again with `None`.
    pub fn fail_memory_regions(&self, errno: Option<i32>) {
        self.state.lock().region_errno = errno;
    }

    /// Makes every following `KVM_GET_DIRTY_LOG` fail with `errno`, or succeed again with `None`.
    pub fn fail_dirty_logs(&self, errno: Option<i32>) {
        self.state.lock().dirty_log_errno = errno;
    }

    /// Makes every following `KVM_SET_GSI_ROUTING` fail with `errno`, or succeed again with
    /// `None`.
    pub fn fail_gsi_routing(&self, errno: Option<i32>) {
        self.state.lock().routing_errno = errno;
    }

    /// Records a guest write to `page` of kernel slot `slot` in its dirty log.
    pub fn mark_dirty(&self, slot: u32, page: u64) {
        self.state.lock().dirty.entry(slot).or_default().insert(page);
    }

    pub fn cleared_logs(&self) -> Vec<ClearedLog> {
        self.state.lock().cleared.clone()
    }

    /// Publishes a dirty page in the ring of vcpu `vcpu_id`, like the kernel does on a guest
    /// write. Returns false when the vcpu has no ring or the ring is full.
    pub fn push_dirty_gfn(&self, vcpu_id: usize, slot: u32, offset: u64) -> bool {
        let mut state = self.state.lock();
        let Some(ring) = state.rings.get_mut(&vcpu_id) else {
            return false;
        };
        let index = ring.produce & (ring.size - 1);
        let flags = entry_flags(&ring.mapping, index);
        if flags.load(Ordering::Acquire) != 0 {
            return false;
        }
        let entry = entry_ptr(&ring.mapping, index);
        // SAFETY: the entry is inside the ring mapping and is not published yet, so the collector
        // does not read it concurrently.
        unsafe {
            std::ptr::addr_of_mut!((*entry).slot).write_volatile(slot);
            std::ptr::addr_of_mut!((*entry).offset).write_volatile(offset);
        }
        flags.store(KVM_DIRTY_GFN_F_DIRTY, Ordering::Release);
        ring.produce = ring.produce.wrapping_add(1);
        true
    }

    /// Makes `KVM_RESET_DIRTY_RINGS` report `count` instead of the number it recycled.
    pub fn set_reset_override(&self, count: Option<u32>) {
        self.state.lock().reset_override = count;
    }

    /// Number of `KVM_RESET_DIRTY_RINGS` calls.
    pub fn ring_resets(&self) -> u32 {
        self.state.lock().resets
    }

    /// Every table passed to `KVM_SET_GSI_ROUTING`, in order.
    pub fn routing_tables(&self) -> Vec<Vec<IrqRoute>> {
        self.state.lock().routing.clone()
    }

    pub fn msis(&self) -> Vec<MsiMessage> {
        self.state.lock().msis.clone()
    }

    pub fn irq_lines(&self) -> Vec<(u32, bool)> {
        self.state.lock().irq_lines.clone()
    }

    /// For each `irq_lines` entry, whether it went through `KVM_IRQ_LINE_STATUS`.
    pub fn irq_line_status(&self) -> Vec<bool> {
        self.state.lock().irq_line_status.clone()
    }

    pub fn irqfds(&self) -> Vec<IrqfdRequest> {
        self.state.lock().irqfds.clone()
    }

    /// Backs `KVM_GET_STATS_FD` with `file`.
    pub fn set_stats_file(&self, file: File) {
        self.state.lock().stats = Some(file);
    }

    fn attach_ring(&self, vcpu_id: usize, mapping: MemoryMapping, size: u32) {
        self.state.lock().rings.insert(
            vcpu_id,
            FakeRing {
                mapping,
                size,
                produce: 0,
            },
        );
    }
}

impl Vm for FakeVm {
    fn check_extension(&self, cap: u32) -> i32 {
        self.caps.lock().get(&cap).copied().unwrap_or(0)
    }

    fn enable_cap(&self, cap: u32, args: [u64; 4]) -> SysResult<()> {
        if self.check_extension(cap) <= 0 {
            return Err(SysError::new(libc::EINVAL));
        }
        self.state.lock().enabled_caps.push((cap, args));
        Ok(())
    }

    fn set_user_memory_region(&self, region: &MemoryRegionUpdate) -> SysResult<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.region_errno {
            return Err(SysError::new(errno));
        }
        if region.memory_size == 0 {
            state.dirty.remove(&region.slot);
        }
        state.regions.push(*region);
        Ok(())
    }

    fn get_dirty_log(&self, slot: u32, bitmap: &mut [u64]) -> SysResult<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.dirty_log_errno {
            return Err(SysError::new(errno));
        }
        bitmap.fill(0);
        if let Some(pages) = state.dirty.remove(&slot) {
            for page in pages {
                if let Some(word) = bitmap.get_mut((page / 64) as usize) {
                    *word |= 1 << (page % 64);
                }
            }
        }
        Ok(())
    }

    fn clear_dirty_log(
        &self,
        slot: u32,
        first_page: u64,
        num_pages: u32,
        bitmap: &[u64],
    ) -> SysResult<()> {
        self.state.lock().cleared.push(ClearedLog {
            slot,
            first_page,
            num_pages,
            bitmap: bitmap.to_vec(),
        });
        Ok(())
    }

    fn reset_dirty_rings(&self) -> SysResult<u32> {
        let mut state = self.state.lock();
        state.resets += 1;
        let mut count = 0;
        for ring in state.rings.values() {
            for index in 0..ring.size {
                let flags = entry_flags(&ring.mapping, index);
                if flags.load(Ordering::Acquire) == KVM_DIRTY_GFN_F_RESET {
                    flags.store(0, Ordering::Release);
                    count += 1;
                }
            }
        }
        Ok(state.reset_override.unwrap_or(count))
    }

    fn set_gsi_routing(&self, routes: &[IrqRoute]) -> SysResult<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.routing_errno {
            return Err(SysError::new(errno));
        }
        state.routing.push(routes.to_vec());
        Ok(())
    }

    fn signal_msi(&self, msi: &MsiMessage) -> SysResult<i32> {
        self.state.lock().msis.push(*msi);
        Ok(1)
    }

    fn set_irq_line(&self, gsi: u32, level: bool, status: bool) -> SysResult<i32> {
        let mut state = self.state.lock();
        state.irq_lines.push((gsi, level));
        state.irq_line_status.push(status);
        Ok(1)
    }

    fn irqfd(&self, request: &IrqfdRequest) -> SysResult<()> {
        self.state.lock().irqfds.push(*request);
        Ok(())
    }

    fn get_stats_fd(&self) -> SysResult<File> {
        match self.state.lock().stats.as_ref() {
            Some(file) => file
                .try_clone()
                .map_err(|e| SysError::new(e.raw_os_error().unwrap_or(libc::EIO))),
            None => Err(SysError::new(libc::ENOTTY)),
        }
    }
}

/// The outcome of one simulated `KVM_RUN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedRun {
    Exit(VcpuExit),
    Errno(i32),
    /// Stays in the guest until the immediate exit flag is set, then fails with EINTR.
    BlockUntilKicked,
}

thread_local! {
    static KICK_TARGET: Cell<*const AtomicBool> = const { Cell::new(std::ptr::null()) };
}

extern "C" fn handle_fake_kick(_: c_int, _: *mut siginfo_t, _: *mut c_void) {
    KICK_TARGET.with(|target| {
        let target = target.get();
        if !target.is_null() {
            // SAFETY: a bound flag is kept alive by its vcpu, which unbinds it on drop.
            unsafe { (*target).store(true, Ordering::SeqCst) };
        }
    });
}

/// Installs the handler of the signal that kicks [`FakeVcpu`]s and returns its number. The
/// handler sets the immediate exit flag of the vcpu bound to the interrupted thread.
pub fn install_kick_signal_handler() -> SysResult<c_int> {
    let signum = SIGRTMIN() + 1;
    register_signal_handler(signum, handle_fake_kick)?;
    Ok(signum)
}

/// A vcpu whose `KVM_RUN` replays a script. Once the script is exhausted every run reports a
/// shutdown exit.
pub struct FakeVcpu {
    id: usize,
    vm: Arc<FakeVm>,
    script: VecDeque<ScriptedRun>,
    immediate_exit: Arc<AtomicBool>,
    in_guest: Arc<AtomicBool>,
    runs: u64,
    data: Vec<Vec<u8>>,
    hypercall_results: Vec<u64>,
    stats: Option<File>,
}

impl FakeVcpu {
    pub fn new(id: usize, vm: Arc<FakeVm>) -> FakeVcpu {
        FakeVcpu {
            id,
            vm,
            script: VecDeque::new(),
            immediate_exit: Arc::new(AtomicBool::new(false)),
            in_guest: Arc::new(AtomicBool::new(false)),
            runs: 0,
            data: Vec::new(),
            hypercall_results: Vec::new(),
            stats: None,
        }
    }

    pub fn push_exit(&mut self, exit: VcpuExit) {
        self.script.push_back(ScriptedRun::Exit(exit));
    }

    pub fn push_errno(&mut self, errno: i32) {
        self.script.push_back(ScriptedRun::Errno(errno));
    }

    pub fn push_block(&mut self) {
        self.script.push_back(ScriptedRun::BlockUntilKicked);
    }

    /// A flag that is set while a `BlockUntilKicked` run waits in the guest.
    pub fn in_guest(&self) -> Arc<AtomicBool> {
        self.in_guest.clone()
    }

    pub fn set_stats_file(&mut self, file: File) {
        self.stats = Some(file);
    }

    /// Number of `run` calls so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Data handed back for each I/O read, in order.
    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }

    pub fn hypercall_results(&self) -> &[u64] {
        &self.hypercall_results
    }

    pub fn immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }
}

impl Vcpu for FakeVcpu {
    fn id(&self) -> usize {
        self.id
    }

    fn bind_to_current_thread(&self) -> SysResult<()> {
        KICK_TARGET.with(|target| target.set(Arc::as_ptr(&self.immediate_exit)));
        Ok(())
    }

    fn run(&mut self) -> SysResult<VcpuExit> {
        self.runs += 1;
        if self.immediate_exit.load(Ordering::SeqCst) {
            return Err(SysError::new(libc::EINTR));
        }
        match self.script.pop_front() {
            Some(ScriptedRun::Exit(exit)) => Ok(exit),
            Some(ScriptedRun::Errno(errno)) => Err(SysError::new(errno)),
            Some(ScriptedRun::BlockUntilKicked) => {
                self.in_guest.store(true, Ordering::SeqCst);
                while !self.immediate_exit.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                self.in_guest.store(false, Ordering::SeqCst);
                Err(SysError::new(libc::EINTR))
            }
            None => Ok(VcpuExit::Shutdown),
        }
    }

    fn set_immediate_exit(&self, exit: bool) {
        self.immediate_exit.store(exit, Ordering::SeqCst);
    }

    fn set_data(&mut self, data: &[u8]) -> SysResult<()> {
        self.data.push(data.to_vec());
        Ok(())
    }

    fn set_hypercall_result(&mut self, result: u64) -> SysResult<()> {
        self.hypercall_results.push(result);
        Ok(())
    }

    fn map_dirty_ring(&self, entries: u32) -> SysResult<MemoryMapping> {
        let size = ring_bytes(entries);
        let file = memfd(c"fake-dirty-ring", size)?;
        let user = MemoryMapping::from_fd_offset(&file, size as usize, 0)?;
        let kernel = MemoryMapping::from_fd_offset(&file, size as usize, 0)?;
        self.vm.attach_ring(self.id, kernel, entries);
        Ok(user)
    }

    fn get_stats_fd(&self) -> SysResult<File> {
        match self.stats.as_ref() {
            Some(file) => file
                .try_clone()
                .map_err(|e| SysError::new(e.raw_os_error().unwrap_or(libc::EIO))),
            None => Err(SysError::new(libc::ENOTTY)),
        }
    }
}

impl Drop for FakeVcpu {
    fn drop(&mut self) {
        let ours = Arc::as_ptr(&self.immediate_exit);
        KICK_TARGET.with(|target| {
            if target.get() == ours {
                target.set(std::ptr::null());
            }
        });
    }
}

/// Flat guest memory starting at guest physical address 0.
pub struct FakeGuestMemory {
    mem: Mutex<Vec<u8>>,
}

impl FakeGuestMemory {
    pub fn new(size: usize) -> FakeGuestMemory {
        FakeGuestMemory {
            mem: Mutex::new(vec![0; size]),
        }
    }
}

impl GuestMemory for FakeGuestMemory {
    fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<(), GuestMemoryFault> {
        let mem = self.mem.lock();
        let start = usize::try_from(gpa).map_err(|_| GuestMemoryFault(gpa))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| mem.get(start..end))
            .ok_or(GuestMemoryFault(gpa))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, gpa: u64, buf: &[u8]) -> Result<(), GuestMemoryFault> {
        let mut mem = self.mem.lock();
        let start = usize::try_from(gpa).map_err(|_| GuestMemoryFault(gpa))?;
        let dst = start
            .checked_add(buf.len())
            .and_then(|end| mem.get_mut(start..end))
            .ok_or(GuestMemoryFault(gpa))?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

/// What the fake bytecode library was asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtensionEvent {
    Opened { len: usize },
    Loaded,
    Attached { program: String, target: AttachTarget },
    LinkDestroyed { program: String },
    TcHookCreated(TcHook),
    TcAttached { hook: TcHook, program: String, opts: TcOpts },
    TcDetached(TcHook),
    TcHookDestroyed(TcHook),
    Closed,
}

#[derive(Clone)]
struct MapDef {
    name: String,
    max_entries: u32,
    value_size: u32,
}

#[derive(Default)]
struct Faults {
    load: AtomicBool,
    attach: AtomicBool,
    tc_attach: AtomicBool,
}

type EventLog = Arc<Mutex<Vec<ExtensionEvent>>>;

/// Opens objects that contain a fixed set of programs and maps. Map data lives in anonymous
/// files so it can be mapped like real map memory.
#[derive(Default)]
pub struct FakeExtensionLoader {
    programs: Vec<String>,
    maps: Vec<MapDef>,
    events: EventLog,
    images: Mutex<Vec<Vec<u8>>>,
    map_files: Mutex<Vec<(String, File)>>,
    faults: Arc<Faults>,
}

impl FakeExtensionLoader {
    pub fn new() -> FakeExtensionLoader {
        FakeExtensionLoader::default()
    }

    pub fn with_program(mut self, name: &str) -> Self {
        self.programs.push(name.to_string());
        self
    }

    pub fn with_map(mut self, name: &str, max_entries: u32, value_size: u32) -> Self {
        self.maps.push(MapDef {
            name: name.to_string(),
            max_entries,
            value_size,
        });
        self
    }

    pub fn events(&self) -> Vec<ExtensionEvent> {
        self.events.lock().clone()
    }

    /// Every image passed to `open`.
    pub fn images(&self) -> Vec<Vec<u8>> {
        self.images.lock().clone()
    }

    /// Reads `len` bytes of the data of the most recently created map called `name`.
    pub fn map_contents(&self, name: &str, len: usize) -> Option<Vec<u8>> {
        let files = self.map_files.lock();
        let (_, file) = files.iter().rev().find(|(n, _)| n == name)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, 0).ok()?;
        Some(buf)
    }

    pub fn fail_load(&self, fail: bool) {
        self.faults.load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_attach(&self, fail: bool) {
        self.faults.attach.store(fail, Ordering::SeqCst);
    }

    pub fn fail_tc_attach(&self, fail: bool) {
        self.faults.tc_attach.store(fail, Ordering::SeqCst);
    }
}

impl ExtensionLoader for FakeExtensionLoader {
    fn open(&self, image: &[u8]) -> anyhow::Result<Box<dyn ExtensionObject>> {
        self.images.lock().push(image.to_vec());
        let page = pagesize() as u64;
        let mut maps = Vec::with_capacity(self.maps.len());
        for def in &self.maps {
            let size = (u64::from(def.max_entries) * u64::from(def.value_size))
                .max(page)
                .next_multiple_of(page);
            let file = memfd(c"fake-extension-map", size)?;
            self.map_files
                .lock()
                .push((def.name.clone(), file.try_clone()?));
            maps.push((def.clone(), file));
        }
        self.events
            .lock()
            .push(ExtensionEvent::Opened { len: image.len() });
        Ok(Box::new(FakeExtensionObject {
            programs: self.programs.clone(),
            maps,
            events: self.events.clone(),
            faults: self.faults.clone(),
        }))
    }
}

struct FakeExtensionObject {
    programs: Vec<String>,
    maps: Vec<(MapDef, File)>,
    events: EventLog,
    faults: Arc<Faults>,
}

impl FakeExtensionObject {
    fn program_name(&self, program: ProgramId) -> anyhow::Result<String> {
        match self.programs.get(program) {
            Some(name) => Ok(name.clone()),
            None => bail!("no program {}", program),
        }
    }

    fn record(&self, event: ExtensionEvent) {
        self.events.lock().push(event);
    }
}

impl ExtensionObject for FakeExtensionObject {
    fn load(&mut self) -> anyhow::Result<()> {
        if self.faults.load.load(Ordering::SeqCst) {
            bail!("verifier rejected the object");
        }
        self.record(ExtensionEvent::Loaded);
        Ok(())
    }

    fn find_program(&self, name: &str) -> Option<ProgramId> {
        self.programs.iter().position(|p| p == name)
    }

    fn find_map(&self, name: &str) -> Option<MapInfo> {
        self.maps
            .iter()
            .find(|(def, _)| def.name == name)
            .map(|(def, file)| MapInfo {
                fd: file.as_raw_fd(),
                max_entries: def.max_entries,
                value_size: def.value_size,
            })
    }

    fn attach(
        &mut self,
        program: ProgramId,
        target: AttachTarget,
    ) -> anyhow::Result<Box<dyn ExtensionLink>> {
        let program = self.program_name(program)?;
        if self.faults.attach.load(Ordering::SeqCst) {
            bail!("failed to attach {}", program);
        }
        self.record(ExtensionEvent::Attached {
            program: program.clone(),
            target,
        });
        Ok(Box::new(FakeLink {
            program,
            events: self.events.clone(),
        }))
    }

    fn tc_hook_create(&mut self, hook: &TcHook) -> anyhow::Result<()> {
        self.record(ExtensionEvent::TcHookCreated(*hook));
        Ok(())
    }

    fn tc_hook_destroy(&mut self, hook: &TcHook) -> anyhow::Result<()> {
        self.record(ExtensionEvent::TcHookDestroyed(*hook));
        Ok(())
    }

    fn tc_attach(
        &mut self,
        hook: &TcHook,
        program: ProgramId,
        opts: &TcOpts,
    ) -> anyhow::Result<()> {
        let program = self.program_name(program)?;
        if self.faults.tc_attach.load(Ordering::SeqCst) {
            bail!("failed to attach {} to tc hook", program);
        }
        self.record(ExtensionEvent::TcAttached {
            hook: *hook,
            program,
            opts: *opts,
        });
        Ok(())
    }

    fn tc_detach(&mut self, hook: &TcHook, _opts: &TcOpts) -> anyhow::Result<()> {
        self.record(ExtensionEvent::TcDetached(*hook));
        Ok(())
    }
}

impl Drop for FakeExtensionObject {
    fn drop(&mut self) {
        self.record(ExtensionEvent::Closed);
    }
}

struct FakeLink {
    program: String,
    events: EventLog,
}

impl ExtensionLink for FakeLink {
    fn destroy(self: Box<Self>) -> anyhow::Result<()> {
        self.events.lock().push(ExtensionEvent::LinkDestroyed {
            program: self.program,
        });
        Ok(())
    }
}

#[derive(Default)]
struct FakeHostState {
    netdevs: BTreeMap<u64, i32>,
    published: Vec<SharedMemoryDevice>,
    unplugged: Vec<String>,
    released: Vec<String>,
    busy: BTreeSet<String>,
    net_requests: Vec<NetDeviceRequest>,
    counters: Vec<(u64, i32)>,
    enabled_counters: usize,
    fail_enable: bool,
    fail_unplug: bool,
}

/// Host services that only record requests. Cycle counters are anonymous files.
#[derive(Default)]
pub struct FakeExtensionHost {
    state: Mutex<FakeHostState>,
}

impl FakeExtensionHost {
    pub fn new() -> FakeExtensionHost {
        FakeExtensionHost::default()
    }

    /// Makes guest interface `guest_netindex` resolve to host interface `ifindex`.
    pub fn add_netdev(&self, guest_netindex: u64, ifindex: i32) {
        self.state.lock().netdevs.insert(guest_netindex, ifindex);
    }

    pub fn published(&self) -> Vec<SharedMemoryDevice> {
        self.state.lock().published.clone()
    }

    pub fn unplugged(&self) -> Vec<String> {
        self.state.lock().unplugged.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }

    /// Makes the deletion of `backend_id` fail until `busy` is set back to false.
    pub fn set_backend_busy(&self, backend_id: &str, busy: bool) {
        let mut state = self.state.lock();
        if busy {
            state.busy.insert(backend_id.to_string());
        } else {
            state.busy.remove(backend_id);
        }
    }

    pub fn net_requests(&self) -> Vec<NetDeviceRequest> {
        self.state.lock().net_requests.clone()
    }

    /// Sample frequency and cpu of every cycle counter opened.
    pub fn counters(&self) -> Vec<(u64, i32)> {
        self.state.lock().counters.clone()
    }

    pub fn enabled_counters(&self) -> usize {
        self.state.lock().enabled_counters
    }

    pub fn fail_enable(&self, fail: bool) {
        self.state.lock().fail_enable = fail;
    }

    pub fn fail_unplug(&self, fail: bool) {
        self.state.lock().fail_unplug = fail;
    }
}

impl ExtensionHost for FakeExtensionHost {
    fn netdev_ifindex(&self, guest_netindex: u64) -> Option<i32> {
        self.state.lock().netdevs.get(&guest_netindex).copied()
    }

    fn open_cycle_counter(&self, sample_freq: u64, cpu: i32) -> anyhow::Result<OwnedFd> {
        let file = memfd(c"fake-cycle-counter", 0)?;
        self.state.lock().counters.push((sample_freq, cpu));
        Ok(OwnedFd::from(file))
    }

    fn enable_counter(&self, _counter: &OwnedFd) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_enable {
            bail!("counter cannot be enabled");
        }
        state.enabled_counters += 1;
        Ok(())
    }

    fn publish_shared_memory(&self, device: &SharedMemoryDevice) -> anyhow::Result<()> {
        self.state.lock().published.push(device.clone());
        Ok(())
    }

    fn unplug_shared_memory(&self, device_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_unplug {
            bail!("device {} cannot be unplugged", device_id);
        }
        state.unplugged.push(device_id.to_string());
        Ok(())
    }

    fn release_backend(&self, backend_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.busy.contains(backend_id) {
            bail!("backend {} is still in use", backend_id);
        }
        state.released.push(backend_id.to_string());
        Ok(())
    }

    fn net_device(&self, request: &NetDeviceRequest) -> anyhow::Result<()> {
        self.state.lock().net_requests.push(request.clone());
        Ok(())
    }
}

/// One `set_dirty_bitmap` call, with the set bits expanded to page numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyReport {
    pub ram_offset: u64,
    pub pages: Vec<u64>,
}

#[derive(Default)]
pub struct RecordingDirtySink {
    reports: Mutex<Vec<DirtyReport>>,
}

impl RecordingDirtySink {
    pub fn new() -> RecordingDirtySink {
        RecordingDirtySink::default()
    }

    pub fn reports(&self) -> Vec<DirtyReport> {
        self.reports.lock().clone()
    }

    /// Pages reported dirty at `ram_offset`, over all reports.
    pub fn dirty_pages(&self, ram_offset: u64) -> BTreeSet<u64> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.ram_offset == ram_offset)
            .flat_map(|r| r.pages.iter().copied())
            .collect()
    }
}

impl DirtyPageSink for RecordingDirtySink {
    fn set_dirty_bitmap(&self, ram_offset: u64, bitmap: &[u64], pages: u64) {
        let pages = (0..pages)
            .filter(|&p| {
                bitmap
                    .get((p / 64) as usize)
                    .is_some_and(|w| w & (1 << (p % 64)) != 0)
            })
            .collect();
        self.reports.lock().push(DirtyReport { ram_offset, pages });
    }
}

#[derive(Default)]
struct RunControlLog {
    shutdowns: Vec<ShutdownCause>,
    resets: Vec<ShutdownCause>,
    panics: Vec<usize>,
    stops: Vec<StopReason>,
    pending: Option<ExitState>,
}

/// Records run state requests. The first request decides the pending transition.
#[derive(Default)]
pub struct RecordingRunControl {
    log: Mutex<RunControlLog>,
}

impl RecordingRunControl {
    pub fn new() -> RecordingRunControl {
        RecordingRunControl::default()
    }

    pub fn shutdowns(&self) -> Vec<ShutdownCause> {
        self.log.lock().shutdowns.clone()
    }

    pub fn resets(&self) -> Vec<ShutdownCause> {
        self.log.lock().resets.clone()
    }

    pub fn panics(&self) -> Vec<usize> {
        self.log.lock().panics.clone()
    }

    pub fn stops(&self) -> Vec<StopReason> {
        self.log.lock().stops.clone()
    }
}

impl VmRunControl for RecordingRunControl {
    fn request_shutdown(&self, cause: ShutdownCause) {
        let mut log = self.log.lock();
        log.shutdowns.push(cause);
        log.pending.get_or_insert(ExitState::Stop);
    }

    fn request_reset(&self, cause: ShutdownCause) {
        let mut log = self.log.lock();
        log.resets.push(cause);
        log.pending.get_or_insert(ExitState::Reset);
    }

    fn report_guest_panic(&self, vcpu_id: usize) {
        let mut log = self.log.lock();
        log.panics.push(vcpu_id);
        log.pending.get_or_insert(ExitState::GuestPanic);
    }

    fn stop(&self, reason: StopReason) {
        let mut log = self.log.lock();
        log.stops.push(reason);
        log.pending.get_or_insert(ExitState::Crash);
    }

    fn pending_exit(&self) -> Option<ExitState> {
        self.log.lock().pending
    }
}

/// An I/O bus that answers every read with a fixed byte and records writes.
#[derive(Default)]
pub struct RecordingIoBus {
    fill: u8,
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
    reads: Mutex<Vec<u64>>,
}

impl RecordingIoBus {
    pub fn new(fill: u8) -> RecordingIoBus {
        RecordingIoBus {
            fill,
            ..Default::default()
        }
    }

    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.writes.lock().clone()
    }

    pub fn reads(&self) -> Vec<u64> {
        self.reads.lock().clone()
    }
}

impl IoBus for RecordingIoBus {
    fn read(&self, addr: u64, data: &mut [u8]) {
        self.reads.lock().push(addr);
        data.fill(self.fill);
    }

    fn write(&self, addr: u64, data: &[u8]) {
        self.writes.lock().push((addr, data.to_vec()));
    }
}

/// Architecture hooks that answer every unhandled exit with the same action.
pub struct FakeArch {
    action: ExitAction,
    handled: Arc<Mutex<Vec<VcpuExit>>>,
}

impl FakeArch {
    pub fn new(action: ExitAction) -> FakeArch {
        FakeArch {
            action,
            handled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Exits passed to `handle_exit`, shared with the caller.
    pub fn handled(&self) -> Arc<Mutex<Vec<VcpuExit>>> {
        self.handled.clone()
    }
}

impl VcpuArch for FakeArch {
    fn handle_exit(&mut self, _vcpu: &mut dyn Vcpu, exit: &VcpuExit) -> anyhow::Result<ExitAction> {
        self.handled.lock().push(exit.clone());
        Ok(self.action)
    }
}
