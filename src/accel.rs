// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The accelerator context: capabilities probed from the kernel plus the slot, routing and
//! extension state of one VM.

use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::time::Duration;

use kvm_sys::*;
use libc::c_int;
use log::error;
use log::info;
use log::warn;
use sync::Mutex;

use crate::config::AccelConfig;
use crate::config::KernelIrqchip;
use crate::hypercall::extension::ExtensionLoader;
use crate::hypercall::host::ExtensionHost;
use crate::hypercall::HypercallHandler;
use crate::hypervisor::Vcpu;
use crate::hypervisor::Vm;
use crate::irq::IrqCaps;
use crate::irq::IrqRouting;
use crate::memory::dirty_ring::ring_bytes;
use crate::memory::dirty_ring::DirtyRing;
use crate::memory::pagesize;
use crate::memory::shadow::ShadowSlotTable;
use crate::memory::DirtyPageSink;
use crate::memory::MemorySection;
use crate::memory::MemorySlots;
use crate::memory::SlotPolicy;
use crate::reaper::DirtyRateLimiter;
use crate::reaper::DirtyRingReaper;
use crate::stats::KvmStats;
use crate::stats::Stat;
use crate::stats::StatDescriptor;
use crate::vcpu::kick_all_sync;
use crate::vcpu::VcpuKicker;
use crate::Error;
use crate::Result;

/// Kernel features the accelerator runs with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelCaps {
    pub nr_slots: u32,
    pub nr_address_spaces: u16,
    pub readonly_mem: bool,
    pub immediate_exit: bool,
    pub internal_error_data: bool,
    pub manual_dirty_log_protect: bool,
    /// Entries per vcpu dirty ring, zero in bitmap mode.
    pub dirty_ring_size: u32,
    pub binary_stats: bool,
    pub irq: IrqCaps,
}

/// Serializes the VM wide operations that must not overlap with each other: dirty ring
/// flushes, reaps from vcpu threads and guest panic reports.
#[derive(Default)]
pub struct BigLock {
    lock: Mutex<()>,
}

/// Proof that the big lock is held.
pub struct BigLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl BigLock {
    pub fn lock(&self) -> BigLockGuard {
        BigLockGuard {
            _guard: self.lock.lock(),
        }
    }
}

/// Services the accelerator calls out to.
pub struct Collaborators {
    pub dirty_sink: Arc<dyn DirtyPageSink>,
    pub dirty_limiter: Option<Arc<dyn DirtyRateLimiter>>,
    pub extension_loader: Arc<dyn ExtensionLoader>,
    pub extension_host: Arc<dyn ExtensionHost>,
}

/// Statistics source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsTarget {
    Vm,
    Vcpu(usize),
}

struct VcpuRecord {
    kicker: Arc<VcpuKicker>,
    stats: Option<Arc<KvmStats>>,
}

pub struct KvmAccel {
    vm: Arc<dyn Vm>,
    config: AccelConfig,
    caps: AccelCaps,
    big_lock: BigLock,
    slots: MemorySlots,
    routing: IrqRouting,
    hypercalls: HypercallHandler,
    dirty_limiter: Option<Arc<dyn DirtyRateLimiter>>,
    vcpus: Mutex<BTreeMap<usize, VcpuRecord>>,
    listeners: Mutex<Vec<bool>>,
    vm_stats: Mutex<Option<Arc<KvmStats>>>,
}

fn has_cap(vm: &dyn Vm, cap: u32) -> bool {
    vm.check_extension(cap) > 0
}

/// Enables the dirty ring if the kernel supports it. Returns the ring size, zero for bitmap mode.
fn init_dirty_ring(vm: &dyn Vm, entries: u32) -> Result<u32> {
    if entries == 0 {
        return Ok(0);
    }
    let bytes = ring_bytes(entries);
    let max = vm.check_extension(KVM_CAP_DIRTY_LOG_RING);
    if max <= 0 {
        warn!("dirty ring not supported by the kernel, using dirty bitmaps");
        return Ok(0);
    }
    if bytes > max as u64 {
        return Err(Error::DirtyRingTooLarge {
            requested: bytes,
            max: max as u64,
        });
    }
    vm.enable_cap(KVM_CAP_DIRTY_LOG_RING, [bytes, 0, 0, 0])
        .map_err(|err| Error::EnableCap {
            cap: KVM_CAP_DIRTY_LOG_RING,
            err,
        })?;
    info!("dirty ring enabled, {} entries per vcpu", entries);
    Ok(entries)
}

/// Turns on manual dirty log protection when offered. Failure leaves automatic protection on.
fn init_manual_protect(vm: &dyn Vm) -> bool {
    let offered = vm.check_extension(KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2);
    if offered <= 0 {
        return false;
    }
    let mode = offered as u64 & (KVM_DIRTY_LOG_MANUAL_PROTECT_ENABLE | KVM_DIRTY_LOG_INITIALLY_SET);
    match vm.enable_cap(KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2, [mode, 0, 0, 0]) {
        Ok(()) => true,
        Err(e) => {
            warn!("cannot enable manual dirty log protection: {}", e);
            false
        }
    }
}

impl KvmAccel {
    /// Probes `vm` and sets up the accelerator state for it. Must run before any vcpu exists so
    /// the dirty ring can still be enabled.
    pub fn new(
        vm: Arc<dyn Vm>,
        config: AccelConfig,
        collab: Collaborators,
    ) -> Result<Arc<KvmAccel>> {
        config.validate()?;
        if !has_cap(&*vm, KVM_CAP_USER_MEMORY) {
            return Err(Error::NotSupported("user memory regions"));
        }

        let nr_slots = match vm.check_extension(KVM_CAP_NR_MEMSLOTS) {
            n if n > 0 => n as u32,
            _ => config.default_nr_slots,
        };
        let nr_address_spaces = match vm.check_extension(KVM_CAP_MULTI_ADDRESS_SPACE) {
            n if n > 0 => n as u16,
            _ => 1,
        };
        let dirty_ring_size = init_dirty_ring(&*vm, config.dirty_ring_size)?;
        let manual_dirty_log_protect =
            dirty_ring_size == 0 && config.manual_dirty_log_protect && init_manual_protect(&*vm);

        let kernel_irqchip = config.kernel_irqchip != KernelIrqchip::Off;
        let irq = IrqCaps {
            irq_routing: if kernel_irqchip {
                vm.check_extension(KVM_CAP_IRQ_ROUTING)
            } else {
                0
            },
            direct_msi: kernel_irqchip && has_cap(&*vm, KVM_CAP_SIGNAL_MSI),
            irqfd: kernel_irqchip && has_cap(&*vm, KVM_CAP_IRQFD),
            irqfd_resample: kernel_irqchip && has_cap(&*vm, KVM_CAP_IRQFD_RESAMPLE),
            inject_status: has_cap(&*vm, KVM_CAP_IRQ_INJECT_STATUS),
            synic: has_cap(&*vm, KVM_CAP_HYPERV_SYNIC),
            split_irqchip: config.split_irqchip(),
        };
        let caps = AccelCaps {
            nr_slots,
            nr_address_spaces,
            readonly_mem: has_cap(&*vm, KVM_CAP_READONLY_MEM),
            immediate_exit: has_cap(&*vm, KVM_CAP_IMMEDIATE_EXIT),
            internal_error_data: has_cap(&*vm, KVM_CAP_INTERNAL_ERROR_DATA),
            manual_dirty_log_protect,
            dirty_ring_size,
            binary_stats: has_cap(&*vm, KVM_CAP_BINARY_STATS_FD),
            irq,
        };
        if !caps.immediate_exit {
            warn!("kernel lacks immediate exit, vcpu kicks rely on the signal alone");
        }

        let page_size = pagesize() as u64;
        let max_slot_size = config
            .max_slot_size
            .map_or(u64::MAX, |s| (s & !(page_size - 1)).max(page_size));
        let policy = SlotPolicy {
            page_size,
            max_slot_size,
            readonly_mem: caps.readonly_mem,
            manual_protect: manual_dirty_log_protect,
            dirty_ring: dirty_ring_size > 0,
        };
        let shadow = Arc::new(Mutex::new(ShadowSlotTable::default()));
        let slots = MemorySlots::new(
            vm.clone(),
            nr_address_spaces,
            nr_slots,
            policy,
            collab.dirty_sink,
            shadow.clone(),
        );
        let routing = IrqRouting::new(vm.clone(), irq);
        let hypercalls = HypercallHandler::new(
            collab.extension_loader,
            collab.extension_host,
            shadow,
            config.profiling_cpu,
        );

        info!(
            "kvm accelerator: {} slots x {} address spaces, {}",
            nr_slots,
            nr_address_spaces,
            if dirty_ring_size > 0 {
                "dirty ring"
            } else {
                "dirty bitmap"
            }
        );
        Ok(Arc::new(KvmAccel {
            vm,
            config,
            caps,
            big_lock: BigLock::default(),
            slots,
            routing,
            hypercalls,
            dirty_limiter: collab.dirty_limiter,
            vcpus: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(vec![false; nr_address_spaces as usize]),
            vm_stats: Mutex::new(None),
        }))
    }

    pub fn vm(&self) -> &Arc<dyn Vm> {
        &self.vm
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn caps(&self) -> &AccelCaps {
        &self.caps
    }

    pub fn big_lock(&self) -> &BigLock {
        &self.big_lock
    }

    pub fn slots(&self) -> &MemorySlots {
        &self.slots
    }

    pub fn routing(&self) -> &IrqRouting {
        &self.routing
    }

    pub fn hypercalls(&self) -> &HypercallHandler {
        &self.hypercalls
    }

    pub fn dirty_limiter(&self) -> Option<Arc<dyn DirtyRateLimiter>> {
        self.dirty_limiter.clone()
    }

    pub fn uses_dirty_ring(&self) -> bool {
        self.caps.dirty_ring_size > 0
    }

    /// Attaches a new vcpu: maps its dirty ring and reads its statistics schema. Returns the
    /// handle other threads kick it with.
    pub fn register_vcpu(&self, vcpu: &dyn Vcpu, signal: Option<c_int>) -> Result<Arc<VcpuKicker>> {
        let id = vcpu.id();
        if self.uses_dirty_ring() {
            let mapping = vcpu
                .map_dirty_ring(self.caps.dirty_ring_size)
                .map_err(Error::Mmap)?;
            self.slots
                .register_ring(id, DirtyRing::new(mapping, self.caps.dirty_ring_size));
        }
        let stats = if self.caps.binary_stats {
            match vcpu
                .get_stats_fd()
                .map_err(Error::GetStatsFd)
                .and_then(KvmStats::new)
            {
                Ok(stats) => Some(Arc::new(stats)),
                Err(e) => {
                    warn!("no statistics for vcpu {}: {}", id, e);
                    None
                }
            }
        } else {
            None
        };
        let kicker = Arc::new(VcpuKicker::new(id, signal));
        self.vcpus.lock().insert(
            id,
            VcpuRecord {
                kicker: kicker.clone(),
                stats,
            },
        );
        Ok(kicker)
    }

    /// Detaches a vcpu, collecting what is left in its dirty ring.
    pub fn unregister_vcpu(&self, id: usize) -> Result<()> {
        self.vcpus.lock().remove(&id);
        if self.uses_dirty_ring() {
            self.slots.unregister_ring(id)?;
        }
        Ok(())
    }

    pub fn kickers(&self) -> Vec<Arc<VcpuKicker>> {
        self.vcpus
            .lock()
            .values()
            .map(|r| r.kicker.clone())
            .collect()
    }

    /// Brings every vcpu out of the guest so that no entry is being produced, then reaps all
    /// rings. Returns the number of entries collected.
    pub fn dirty_ring_flush(&self, _big: &BigLockGuard) -> Result<u64> {
        if !self.uses_dirty_ring() {
            return Ok(0);
        }
        kick_all_sync(&self.kickers());
        self.slots.reap(None)
    }

    /// Delivers every page dirtied in `as_id` to the dirty sink, when running on dirty rings.
    pub fn log_sync_global(&self, big: &BigLockGuard, as_id: u16) -> Result<()> {
        if !self.uses_dirty_ring() {
            return Ok(());
        }
        self.dirty_ring_flush(big)?;
        self.slots.sync_global(as_id);
        Ok(())
    }

    /// Starts the thread that periodically reaps dirty rings. Bitmap mode needs none.
    pub fn start_reaper(self: &Arc<Self>) -> Result<Option<DirtyRingReaper>> {
        if !self.uses_dirty_ring() {
            return Ok(None);
        }
        let interval = Duration::from_millis(self.config.reaper_interval_ms);
        DirtyRingReaper::start(self.clone(), interval).map(Some)
    }

    /// Binds address space `as_id` to a memory listener. Each address space is bound once.
    pub fn memory_listener(self: &Arc<Self>, as_id: u16) -> Result<KvmMemoryListener> {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(as_id as usize) {
            Some(bound) if !*bound => *bound = true,
            Some(_) => {
                return Err(Error::InvalidConfig(format!(
                    "address space {} already bound",
                    as_id
                )))
            }
            None => {
                return Err(Error::InvalidConfig(format!(
                    "address space {} beyond the {} supported",
                    as_id, self.caps.nr_address_spaces
                )))
            }
        }
        Ok(KvmMemoryListener {
            accel: self.clone(),
            as_id,
        })
    }

    fn stats(&self, target: StatsTarget) -> Result<Arc<KvmStats>> {
        if !self.caps.binary_stats {
            return Err(Error::NotSupported("binary statistics"));
        }
        match target {
            StatsTarget::Vm => {
                let mut cached = self.vm_stats.lock();
                if let Some(stats) = cached.as_ref() {
                    return Ok(stats.clone());
                }
                let file = self.vm.get_stats_fd().map_err(Error::GetStatsFd)?;
                let stats = Arc::new(KvmStats::new(file)?);
                *cached = Some(stats.clone());
                Ok(stats)
            }
            StatsTarget::Vcpu(id) => self
                .vcpus
                .lock()
                .get(&id)
                .and_then(|r| r.stats.clone())
                .ok_or(Error::NotSupported("statistics of this vcpu")),
        }
    }

    /// Reads the statistics in `names` of `target`; all of them when `names` is empty.
    pub fn query_stats(&self, target: StatsTarget, names: &[&str]) -> Result<Vec<Stat>> {
        self.stats(target)?.query(names)
    }

    pub fn stats_schema(&self, target: StatsTarget) -> Result<Vec<StatDescriptor>> {
        Ok(self.stats(target)?.schema().to_vec())
    }
}

/// Callbacks of the memory map of one address space.
pub trait MemoryListener {
    fn region_add(&self, section: &MemorySection);
    fn region_del(&self, section: &MemorySection);
    fn log_start(&self, section: &MemorySection, old_logging: bool, new_logging: bool);
    fn log_stop(&self, section: &MemorySection, old_logging: bool, new_logging: bool);
    fn log_sync(&self, section: &MemorySection);
    fn log_sync_global(&self, big: &BigLockGuard);
    fn log_clear(&self, section: &MemorySection) -> Result<()>;
}

/// Connects the memory map of one address space to the kernel slots.
pub struct KvmMemoryListener {
    accel: Arc<KvmAccel>,
    as_id: u16,
}

impl KvmMemoryListener {
    pub fn as_id(&self) -> u16 {
        self.as_id
    }
}

impl MemoryListener for KvmMemoryListener {
    fn region_add(&self, section: &MemorySection) {
        if let Err(e) = self.accel.slots.set_phys_mem(self.as_id, section, true) {
            error!(
                "failed to add memory at {:#x}+{:#x}: {}",
                section.offset_within_address_space, section.size, e
            );
            process::abort();
        }
    }

    fn region_del(&self, section: &MemorySection) {
        if let Err(e) = self.accel.slots.set_phys_mem(self.as_id, section, false) {
            error!(
                "failed to remove memory at {:#x}+{:#x}: {}",
                section.offset_within_address_space, section.size, e
            );
            process::abort();
        }
    }

    fn log_start(&self, section: &MemorySection, old_logging: bool, _new_logging: bool) {
        if let Err(e) = self.accel.slots.log_start(self.as_id, section, old_logging) {
            error!("failed to start dirty logging: {}", e);
            process::abort();
        }
    }

    fn log_stop(&self, section: &MemorySection, _old_logging: bool, new_logging: bool) {
        if let Err(e) = self.accel.slots.log_stop(self.as_id, section, new_logging) {
            error!("failed to stop dirty logging: {}", e);
            process::abort();
        }
    }

    fn log_sync(&self, section: &MemorySection) {
        if let Err(e) = self.accel.slots.log_sync(self.as_id, section) {
            error!("failed to sync dirty log: {}", e);
        }
    }

    fn log_sync_global(&self, big: &BigLockGuard) {
        if let Err(e) = self.accel.log_sync_global(big, self.as_id) {
            error!("failed to sync dirty rings: {}", e);
        }
    }

    fn log_clear(&self, section: &MemorySection) -> Result<()> {
        self.accel.slots.log_clear(self.as_id, section)
    }
}
