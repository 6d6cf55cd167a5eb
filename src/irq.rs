// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GSI routing, MSI delivery and irqfds.

use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::debug;
use log::warn;
use sync::Mutex;
use vmm_sys_util::errno::Error as SysError;
use vmm_sys_util::eventfd::EventFd;

use crate::hypervisor::IrqRoute;
use crate::hypervisor::IrqSource;
use crate::hypervisor::IrqfdRequest;
use crate::hypervisor::MsiMessage;
use crate::hypervisor::Vm;
use crate::Error;
use crate::Result;

const MSI_HASH_BUCKETS: usize = 256;
const MIN_ROUTE_CAPACITY: usize = 64;

/// Kernel interrupt features probed at init.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqCaps {
    /// Value of `KVM_CAP_IRQ_ROUTING`. The last GSI is reserved.
    pub irq_routing: i32,
    pub direct_msi: bool,
    pub irqfd: bool,
    pub irqfd_resample: bool,
    pub inject_status: bool,
    pub synic: bool,
    /// IOAPIC and PIC are emulated in user space.
    pub split_irqchip: bool,
}

struct CachedMsiRoute {
    gsi: u32,
    msg: MsiMessage,
}

struct ResampleNotifier {
    gsi: u32,
    /// Descriptor the caller registered, used to match the deassignment.
    source_fd: RawFd,
    event: EventFd,
}

struct RoutingTable {
    gsi_count: u32,
    used_gsi: Vec<u64>,
    routes: Vec<IrqRoute>,
    capacity: usize,
    msi_cache: Vec<Vec<CachedMsiRoute>>,
    resamplers: Vec<ResampleNotifier>,
    commits: u64,
}

impl RoutingTable {
    fn gsi_used(&self, gsi: u32) -> bool {
        self.used_gsi
            .get((gsi / 64) as usize)
            .is_some_and(|w| w & (1 << (gsi % 64)) != 0)
    }

    fn set_gsi(&mut self, gsi: u32) {
        if let Some(w) = self.used_gsi.get_mut((gsi / 64) as usize) {
            *w |= 1 << (gsi % 64);
        }
    }

    fn clear_gsi(&mut self, gsi: u32) {
        if let Some(w) = self.used_gsi.get_mut((gsi / 64) as usize) {
            *w &= !(1 << (gsi % 64));
        }
    }

    fn add_route(&mut self, route: IrqRoute) {
        if self.routes.len() == self.capacity {
            self.capacity = (self.capacity * 2).max(MIN_ROUTE_CAPACITY);
            self.routes.reserve_exact(self.capacity - self.routes.len());
        }
        self.set_gsi(route.gsi);
        self.routes.push(route);
    }

    fn release_route(&mut self, gsi: u32) {
        if let Some(pos) = self.routes.iter().position(|r| r.gsi == gsi) {
            self.routes.swap_remove(pos);
        }
        for bucket in self.msi_cache.iter_mut() {
            bucket.retain(|c| c.gsi != gsi);
        }
        self.clear_gsi(gsi);
    }

    fn flush_msi_cache(&mut self) {
        let cached: Vec<u32> = self
            .msi_cache
            .iter_mut()
            .flat_map(|bucket| bucket.drain(..))
            .map(|c| c.gsi)
            .collect();
        for gsi in cached {
            self.release_route(gsi);
        }
    }
}

/// The GSI routing table of a VM.
pub struct IrqRouting {
    vm: Arc<dyn Vm>,
    caps: IrqCaps,
    table: Mutex<RoutingTable>,
}

impl IrqRouting {
    pub fn new(vm: Arc<dyn Vm>, caps: IrqCaps) -> IrqRouting {
        let gsi_count = if caps.irq_routing > 0 {
            (caps.irq_routing - 1) as u32
        } else {
            0
        };
        IrqRouting {
            vm,
            caps,
            table: Mutex::new(RoutingTable {
                gsi_count,
                used_gsi: vec![0; gsi_count.div_ceil(64) as usize],
                routes: Vec::new(),
                capacity: 0,
                msi_cache: (0..MSI_HASH_BUCKETS).map(|_| Vec::new()).collect(),
                resamplers: Vec::new(),
                commits: 0,
            }),
        }
    }

    pub fn caps(&self) -> &IrqCaps {
        &self.caps
    }

    /// Whether the kernel routes GSIs at all.
    pub fn has_gsi_routing(&self) -> bool {
        self.caps.irq_routing > 0
    }

    pub fn gsi_count(&self) -> u32 {
        self.table.lock().gsi_count
    }

    /// Number of routes in the table.
    pub fn route_count(&self) -> usize {
        self.table.lock().routes.len()
    }

    pub fn route(&self, gsi: u32) -> Option<IrqRoute> {
        self.table.lock().routes.iter().find(|r| r.gsi == gsi).copied()
    }

    /// Number of times the table was pushed to the kernel.
    pub fn commit_count(&self) -> u64 {
        self.table.lock().commits
    }

    /// Reserves the lowest unused GSI.
    ///
    /// Without direct MSI injection, MSI routes cached by `send_msi` are dropped when the table
    /// is full so their GSIs can be reused.
    pub fn alloc_gsi(&self) -> Result<u32> {
        let mut table = self.table.lock();
        Self::alloc_gsi_locked(&mut table, &self.caps)
    }

    fn alloc_gsi_locked(table: &mut RoutingTable, caps: &IrqCaps) -> Result<u32> {
        if !caps.direct_msi && table.routes.len() as u32 >= table.gsi_count {
            table.flush_msi_cache();
        }
        let gsi = (0..table.gsi_count)
            .find(|&gsi| !table.gsi_used(gsi))
            .ok_or(Error::NoFreeGsi)?;
        table.set_gsi(gsi);
        Ok(gsi)
    }

    /// Routes `pin` of `irqchip` to the GSI of the same number.
    pub fn add_irqchip_route(&self, irqchip: u32, pin: u32) -> Result<()> {
        let mut table = self.table.lock();
        if pin >= table.gsi_count {
            return Err(Error::IrqPinOutOfRange {
                pin,
                gsi_count: table.gsi_count,
            });
        }
        table.add_route(IrqRoute {
            gsi: pin,
            source: IrqSource::Irqchip { chip: irqchip, pin },
        });
        Ok(())
    }

    /// Allocates a GSI for `msg` and routes it. The table still has to be committed.
    pub fn add_msi_route(&self, msg: MsiMessage, devid: Option<u32>) -> Result<u32> {
        if !self.has_gsi_routing() {
            return Err(Error::NotSupported("gsi routing"));
        }
        let mut table = self.table.lock();
        let gsi = Self::alloc_gsi_locked(&mut table, &self.caps)?;
        table.add_route(IrqRoute {
            gsi,
            source: msi_source(msg, devid),
        });
        debug!("msi route gsi {} -> {:#x}/{:#x}", gsi, msg.address, msg.data);
        Ok(gsi)
    }

    /// Points an existing MSI route at `msg`.
    ///
    /// Returns whether the route changed.
    pub fn update_msi_route(&self, gsi: u32, msg: MsiMessage, devid: Option<u32>) -> Result<bool> {
        self.update_route(IrqRoute {
            gsi,
            source: msi_source(msg, devid),
        })
    }

    fn update_route(&self, route: IrqRoute) -> Result<bool> {
        let mut table = self.table.lock();
        let existing = table
            .routes
            .iter_mut()
            .find(|r| r.gsi == route.gsi)
            .ok_or(Error::RouteNotFound(route.gsi))?;
        if *existing == route {
            return Ok(false);
        }
        *existing = route;
        Ok(true)
    }

    /// Routes an s390 adapter interrupt to a new GSI.
    pub fn add_adapter_route(
        &self,
        summary_addr: u64,
        ind_addr: u64,
        summary_offset: u64,
        ind_offset: u64,
        adapter_id: u32,
    ) -> Result<u32> {
        if !self.has_gsi_routing() {
            return Err(Error::NotSupported("gsi routing"));
        }
        let mut table = self.table.lock();
        let gsi = Self::alloc_gsi_locked(&mut table, &self.caps)?;
        table.add_route(IrqRoute {
            gsi,
            source: IrqSource::S390Adapter {
                summary_addr,
                ind_addr,
                summary_offset,
                ind_offset,
                adapter_id,
            },
        });
        Ok(gsi)
    }

    /// Routes a Hyper-V SynIC interrupt source to a new GSI and commits the table.
    pub fn add_hv_sint_route(&self, vcpu: u32, sint: u32) -> Result<u32> {
        if !self.caps.synic {
            return Err(Error::NotSupported("hyper-v synic"));
        }
        if !self.has_gsi_routing() {
            return Err(Error::NotSupported("gsi routing"));
        }
        let gsi = {
            let mut table = self.table.lock();
            let gsi = Self::alloc_gsi_locked(&mut table, &self.caps)?;
            table.add_route(IrqRoute {
                gsi,
                source: IrqSource::HvSint { vcpu, sint },
            });
            gsi
        };
        self.commit_routes()?;
        Ok(gsi)
    }

    /// Removes the route of `gsi` and frees the GSI.
    pub fn release_route(&self, gsi: u32) {
        self.table.lock().release_route(gsi);
    }

    /// Pushes the whole table to the kernel.
    pub fn commit_routes(&self) -> Result<()> {
        if !self.has_gsi_routing() {
            return Ok(());
        }
        let mut table = self.table.lock();
        self.vm
            .set_gsi_routing(&table.routes)
            .map_err(Error::SetGsiRouting)?;
        table.commits += 1;
        Ok(())
    }

    /// Starts a batch of route changes that is committed once.
    pub fn begin_changes(&self) -> RouteChanges<'_> {
        RouteChanges {
            routing: self,
            changes: 0,
        }
    }

    /// Sets the level of `gsi`. Returns the delivery status.
    pub fn set_irq(&self, gsi: u32, level: bool) -> Result<i32> {
        self.vm
            .set_irq_line(gsi, level, self.caps.inject_status)
            .map_err(|err| Error::SetIrqLine { gsi, err })
    }

    /// Delivers `msg` to the guest.
    ///
    /// Without direct MSI injection the message is given a GSI of its own the first time it is
    /// seen; routes are cached by payload so later sends reuse them.
    pub fn send_msi(&self, msg: MsiMessage) -> Result<i32> {
        if self.caps.direct_msi {
            return self.vm.signal_msi(&msg).map_err(Error::SignalMsi);
        }

        let bucket = (msg.data & 0xff) as usize;
        let cached = self.table.lock().msi_cache[bucket]
            .iter()
            .find(|c| c.msg == msg)
            .map(|c| c.gsi);
        let gsi = match cached {
            Some(gsi) => gsi,
            None => {
                let gsi = self.add_msi_route(msg, None)?;
                if let Err(e) = self.commit_routes() {
                    self.release_route(gsi);
                    return Err(e);
                }
                self.table.lock().msi_cache[bucket].push(CachedMsiRoute { gsi, msg });
                gsi
            }
        };
        self.set_irq(gsi, true)
    }

    /// Connects `event` to `gsi`. With a `resample` event, level-triggered interrupts are
    /// re-asserted after the guest acknowledges them.
    pub fn assign_irqfd(
        &self,
        event: &EventFd,
        resample: Option<&EventFd>,
        gsi: u32,
    ) -> Result<()> {
        self.irqfd(event, resample, gsi, true)
    }

    pub fn deassign_irqfd(
        &self,
        event: &EventFd,
        resample: Option<&EventFd>,
        gsi: u32,
    ) -> Result<()> {
        self.irqfd(event, resample, gsi, false)
    }

    fn irqfd(
        &self,
        event: &EventFd,
        resample: Option<&EventFd>,
        gsi: u32,
        assign: bool,
    ) -> Result<()> {
        if !self.caps.irqfd {
            return Err(Error::NotSupported("irqfd"));
        }
        let mut resample_fd = None;
        if let Some(resample) = resample {
            if self.caps.split_irqchip {
                // The EOI reaches user space instead of the kernel, so user space signals the
                // resample event itself.
                let mut table = self.table.lock();
                if assign {
                    let event = resample.try_clone().map_err(|e| Error::AssignIrqfd {
                        gsi,
                        err: SysError::new(e.raw_os_error().unwrap_or(libc::EIO)),
                    })?;
                    table.resamplers.push(ResampleNotifier {
                        gsi,
                        source_fd: resample.as_raw_fd(),
                        event,
                    });
                } else {
                    let fd = resample.as_raw_fd();
                    table
                        .resamplers
                        .retain(|n| !(n.gsi == gsi && n.source_fd == fd));
                }
            } else {
                if !self.caps.irqfd_resample {
                    return Err(Error::NotSupported("irqfd resample"));
                }
                resample_fd = Some(resample.as_raw_fd());
            }
        }

        self.vm
            .irqfd(&IrqfdRequest {
                fd: event.as_raw_fd(),
                gsi,
                resample_fd,
                deassign: !assign,
            })
            .map_err(|err| Error::AssignIrqfd { gsi, err })
    }

    /// Signals the user space resample events of `gsi` after the guest acknowledged it.
    pub fn resample_notify(&self, gsi: u32) {
        let table = self.table.lock();
        for notifier in table.resamplers.iter().filter(|n| n.gsi == gsi) {
            if let Err(e) = notifier.event.write(1) {
                warn!("failed to signal resample event of gsi {}: {}", gsi, e);
            }
        }
    }
}

fn msi_source(msg: MsiMessage, devid: Option<u32>) -> IrqSource {
    IrqSource::Msi {
        address: msg.address,
        data: msg.data,
        devid,
    }
}

/// A batch of MSI route edits committed to the kernel once, when at least one route changed.
pub struct RouteChanges<'a> {
    routing: &'a IrqRouting,
    changes: usize,
}

impl RouteChanges<'_> {
    pub fn add_msi_route(&mut self, msg: MsiMessage, devid: Option<u32>) -> Result<u32> {
        let gsi = self.routing.add_msi_route(msg, devid)?;
        self.changes += 1;
        Ok(gsi)
    }

    pub fn update_msi_route(
        &mut self,
        gsi: u32,
        msg: MsiMessage,
        devid: Option<u32>,
    ) -> Result<()> {
        if self.routing.update_msi_route(gsi, msg, devid)? {
            self.changes += 1;
        }
        Ok(())
    }

    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Commits the batch if anything changed.
    pub fn commit(self) -> Result<()> {
        if self.changes > 0 {
            self.routing.commit_routes()?;
        }
        Ok(())
    }
}
