// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extension objects loaded on behalf of the guest, with their attached programs and shared maps.

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use enumn::N;
use log::debug;
use log::info;
use log::warn;
use sync::Mutex;
use zerocopy::IntoBytes;

use crate::hypercall::extension::AttachTarget;
use crate::hypercall::extension::ExtensionLink;
use crate::hypercall::extension::ExtensionLoader;
use crate::hypercall::extension::ExtensionObject;
use crate::hypercall::extension::ProgramId;
use crate::hypercall::extension::TcAttachPoint;
use crate::hypercall::extension::TcHook;
use crate::hypercall::extension::TcOpts;
use crate::hypercall::host::ExtensionHost;
use crate::hypercall::host::SharedMemoryDevice;
use crate::memory::pagesize;
use crate::memory::shadow::ShadowSlotTable;
use crate::memory::GuestMemory;
use crate::mmap::MemoryMapping;
use crate::Error;
use crate::Result;

pub const MAX_OBJECTS: usize = 16;
pub const MAX_PROGRAMS: usize = 8;
/// Map slots are shared by all objects so that device names stay unique.
pub const MAX_MAPS: usize = 8;

const GUEST_PAGE_SIZE: u64 = 4096;
/// The guest passes the image as a single page of page addresses.
const MAX_IMAGE_PAGES: u64 = GUEST_PAGE_SIZE / 8;
const NAME_LEN: usize = 1024;
/// Bytes mapped of each map that receives the shadow slot table.
const SHADOW_MAP_BYTES: usize = 4096;

/// Host hook points a program can be linked to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u64)]
pub enum HookMajor {
    Xdp = 0,
    PageFault = 1,
    TcEgress = 2,
    DirectExec = 3,
    TcIngress = 4,
    Profiling = 5,
}

enum Attachment {
    Link {
        link: Box<dyn ExtensionLink>,
        /// Perf event the link samples from. Closed after the link is destroyed.
        counter: Option<OwnedFd>,
    },
    Tc(TcHook),
}

struct ProgramSlot {
    name: String,
    major: HookMajor,
    minor: u64,
    attachment: Attachment,
}

impl ProgramSlot {
    fn detach(self, object: &mut dyn ExtensionObject) -> anyhow::Result<()> {
        match self.attachment {
            Attachment::Link { link, counter } => {
                let result = link.destroy();
                drop(counter);
                result
            }
            Attachment::Tc(hook) => {
                object.tc_detach(&hook, &TcOpts::filter())?;
                object.tc_hook_destroy(&hook)
            }
        }
    }
}

struct MapSlot {
    name: String,
    mapping: MemoryMapping,
    device: SharedMemoryDevice,
}

struct LoadedObject {
    object: Box<dyn ExtensionObject>,
    programs: Vec<Option<ProgramSlot>>,
    maps: BTreeMap<usize, MapSlot>,
}

/// A backend whose device was unplugged but which could not be deleted yet.
struct PendingBackend {
    map_slot: usize,
    backend_id: String,
}

pub struct ExtensionRegistry {
    objects: Vec<Option<LoadedObject>>,
    pending: Vec<PendingBackend>,
    loader: Arc<dyn ExtensionLoader>,
    host: Arc<dyn ExtensionHost>,
    shadow: Arc<Mutex<ShadowSlotTable>>,
    profiling_cpu: i32,
}

/// Reads a NUL terminated name from the guest. The last byte of the buffer is always treated as
/// the terminator.
fn read_name(mem: &dyn GuestMemory, gpa: u64) -> Result<String> {
    let mut buf = [0u8; NAME_LEN];
    mem.read_at(gpa, &mut buf)?;
    buf[NAME_LEN - 1] = 0;
    let name = CStr::from_bytes_until_nul(&buf).map_err(|_| Error::InvalidName)?;
    name.to_str()
        .map(str::to_owned)
        .map_err(|_| Error::InvalidName)
}

fn object_mut(objects: &mut [Option<LoadedObject>], slot: u64) -> Result<&mut LoadedObject> {
    usize::try_from(slot)
        .ok()
        .and_then(|i| objects.get_mut(i))
        .and_then(Option::as_mut)
        .ok_or(Error::InvalidObjectSlot(slot))
}

/// Copies the address space 0 slot layout into the maps an extension reads it from.
///
/// Missing maps are skipped. Nothing here fails the caller.
fn export_shadow_slots(object: &dyn ExtensionObject, shadow: &Mutex<ShadowSlotTable>) {
    let shadow = shadow.lock();
    for (name, column) in shadow.columns() {
        let Some(info) = object.find_map(name) else {
            warn!("extension has no {} map, slot layout not exported", name);
            continue;
        };
        let mapping = match MemoryMapping::from_fd_offset(&info.fd, SHADOW_MAP_BYTES, 0) {
            Ok(m) => m,
            Err(e) => {
                warn!("failed to map {}: {}", name, e);
                continue;
            }
        };
        let bytes = column.as_bytes();
        let len = bytes.len().min(SHADOW_MAP_BYTES);
        if let Err(e) = mapping.write_slice(&bytes[..len], 0) {
            warn!("failed to export {}: {}", name, e);
        }
    }
}

impl ExtensionRegistry {
    pub fn new(
        loader: Arc<dyn ExtensionLoader>,
        host: Arc<dyn ExtensionHost>,
        shadow: Arc<Mutex<ShadowSlotTable>>,
        profiling_cpu: i32,
    ) -> Self {
        ExtensionRegistry {
            objects: (0..MAX_OBJECTS).map(|_| None).collect(),
            pending: Vec::new(),
            loader,
            host,
            shadow,
            profiling_cpu,
        }
    }

    pub fn is_loaded(&self, slot: usize) -> bool {
        self.objects.get(slot).is_some_and(Option::is_some)
    }

    /// Indices of the program slots of `slot` that are in use.
    pub fn programs(&self, slot: usize) -> Vec<usize> {
        self.objects
            .get(slot)
            .and_then(Option::as_ref)
            .map(|o| {
                o.programs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| p.as_ref().map(|_| i))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Map slots held by object `slot`.
    pub fn maps(&self, slot: usize) -> Vec<usize> {
        self.objects
            .get(slot)
            .and_then(Option::as_ref)
            .map(|o| o.maps.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Backends waiting for deletion.
    pub fn pending_backends(&self) -> Vec<String> {
        self.pending.iter().map(|p| p.backend_id.clone()).collect()
    }

    /// Retries the deletion of every deferred backend, keeping those that still fail.
    pub fn release_deferred_backends(&mut self) {
        let host = &self.host;
        self.pending
            .retain(|pending| match host.release_backend(&pending.backend_id) {
                Ok(()) => {
                    debug!("released backend {}", pending.backend_id);
                    false
                }
                Err(e) => {
                    warn!("backend {} not released yet: {:#}", pending.backend_id, e);
                    true
                }
            });
    }

    /// Copies an image of `len` bytes out of guest memory, opens and loads it.
    ///
    /// `table_gpa` points at the guest physical addresses of the image pages, one u64 each.
    pub fn load(&mut self, mem: &dyn GuestMemory, table_gpa: u64, len: u64) -> Result<usize> {
        let pages = len.div_ceil(GUEST_PAGE_SIZE);
        if pages > MAX_IMAGE_PAGES {
            return Err(Error::ImageTooLarge(len));
        }
        let slot = self
            .objects
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeObjectSlot)?;

        let mut table = vec![0u64; pages as usize];
        mem.read_at(table_gpa, table.as_mut_bytes())?;
        let mut image = vec![0u8; (pages * GUEST_PAGE_SIZE) as usize];
        for (page, &gpa) in image
            .chunks_exact_mut(GUEST_PAGE_SIZE as usize)
            .zip(table.iter())
        {
            mem.read_at(gpa, page)?;
        }
        image.truncate(len as usize);

        let mut object = self.loader.open(&image).map_err(Error::Collaborator)?;
        object.load().map_err(Error::Collaborator)?;
        self.objects[slot] = Some(LoadedObject {
            object,
            programs: (0..MAX_PROGRAMS).map(|_| None).collect(),
            maps: BTreeMap::new(),
        });
        info!("loaded extension object {} ({} bytes)", slot, len);
        Ok(slot)
    }

    /// Detaches every program and removes every map of `slot`, then closes the object.
    ///
    /// Individual teardown failures are logged and do not stop the unload.
    pub fn unload(&mut self, slot: u64) -> Result<()> {
        object_mut(&mut self.objects, slot)?;
        let Some(mut loaded) = self.objects[slot as usize].take() else {
            return Err(Error::InvalidObjectSlot(slot));
        };
        for program in loaded.programs.drain(..).flatten() {
            let name = program.name.clone();
            if let Err(e) = program.detach(&mut *loaded.object) {
                warn!("failed to detach program {}: {:#}", name, e);
            }
        }
        for (map_slot, map) in std::mem::take(&mut loaded.maps) {
            if let Err(e) = self.host.unplug_shared_memory(&map.device.device_id) {
                warn!("failed to unplug {}: {:#}", map.device.device_id, e);
            }
            self.pending.push(PendingBackend {
                map_slot,
                backend_id: map.device.backend_id.clone(),
            });
        }
        info!("unloaded extension object {}", slot);
        Ok(())
    }

    /// Attaches program `name_gpa` of object `slot` to hook `major`, qualified by `minor`.
    ///
    /// Returns the program slot.
    pub fn link(
        &mut self,
        mem: &dyn GuestMemory,
        slot: u64,
        name_gpa: u64,
        major: u64,
        minor: u64,
    ) -> Result<usize> {
        let loaded = object_mut(&mut self.objects, slot)?;
        let name = read_name(mem, name_gpa)?;
        let pslot = loaded
            .programs
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeProgramSlot)?;
        let program = loaded
            .object
            .find_program(&name)
            .ok_or_else(|| Error::ProgramNotFound(name.clone()))?;
        let hook = HookMajor::n(major).ok_or(Error::InvalidMajorId(major))?;
        let object = &mut *loaded.object;

        let attachment = match hook {
            HookMajor::Xdp => {
                let ifindex = self
                    .host
                    .netdev_ifindex(minor)
                    .ok_or(Error::UnknownNetdev(minor))?;
                attach_link(object, program, AttachTarget::Xdp { ifindex })?
            }
            HookMajor::PageFault => {
                let function = match minor {
                    0 => "alloc_bypass",
                    1 => "update_mapping",
                    _ => return Err(Error::InvalidMinorId { major, minor }),
                };
                let attachment = attach_link(
                    object,
                    program,
                    AttachTarget::Kprobe {
                        function,
                        retprobe: true,
                    },
                )?;
                if minor == 0 {
                    export_shadow_slots(object, &self.shadow);
                }
                attachment
            }
            HookMajor::DirectExec => {
                if minor != 0 {
                    return Err(Error::InvalidMinorId { major, minor });
                }
                attach_link(
                    object,
                    program,
                    AttachTarget::Kprobe {
                        function: "sched_direct_exe",
                        retprobe: true,
                    },
                )?
            }
            HookMajor::TcEgress | HookMajor::TcIngress => {
                let ifindex = self
                    .host
                    .netdev_ifindex(minor)
                    .ok_or(Error::UnknownNetdev(minor))?;
                let attach_point = if hook == HookMajor::TcIngress {
                    TcAttachPoint::Ingress
                } else {
                    TcAttachPoint::Egress
                };
                let tc_hook = TcHook {
                    ifindex,
                    attach_point,
                };
                object
                    .tc_hook_create(&tc_hook)
                    .map_err(Error::Collaborator)?;
                let opts = TcOpts::filter().replacing();
                if let Err(e) = object.tc_attach(&tc_hook, program, &opts) {
                    if let Err(e) = object.tc_hook_destroy(&tc_hook) {
                        warn!("failed to destroy tc hook on {}: {:#}", ifindex, e);
                    }
                    return Err(Error::Collaborator(e));
                }
                Attachment::Tc(tc_hook)
            }
            HookMajor::Profiling => {
                let counter = self
                    .host
                    .open_cycle_counter(minor, self.profiling_cpu)
                    .map_err(Error::Collaborator)?;
                let link = object
                    .attach(
                        program,
                        AttachTarget::PerfEvent {
                            fd: counter.as_raw_fd(),
                        },
                    )
                    .map_err(Error::Collaborator)?;
                if let Err(e) = self.host.enable_counter(&counter) {
                    if let Err(e) = link.destroy() {
                        warn!("failed to destroy profiling link: {:#}", e);
                    }
                    return Err(Error::Collaborator(e));
                }
                Attachment::Link {
                    link,
                    counter: Some(counter),
                }
            }
        };

        info!(
            "linked program {} of object {} to {:?}/{} in slot {}",
            name, slot, hook, minor, pslot
        );
        loaded.programs[pslot] = Some(ProgramSlot {
            name,
            major: hook,
            minor,
            attachment,
        });
        Ok(pslot)
    }

    /// Detaches program slot `pslot` of object `slot` and frees it.
    pub fn unlink(&mut self, slot: u64, pslot: u64) -> Result<()> {
        let loaded = object_mut(&mut self.objects, slot)?;
        let entry = usize::try_from(pslot)
            .ok()
            .and_then(|i| loaded.programs.get_mut(i))
            .ok_or(Error::InvalidProgramSlot(pslot))?;
        let program = entry.take().ok_or(Error::NoProgramAttachment(pslot))?;
        debug!(
            "unlinking program {} from {:?}/{}",
            program.name, program.major, program.minor
        );
        program
            .detach(&mut *loaded.object)
            .map_err(Error::Collaborator)
    }

    /// Maps the data of map `name_gpa` of object `slot` and exposes it to the guest as a shared
    /// memory device. Returns the map slot, which also names the device.
    pub fn map(&mut self, mem: &dyn GuestMemory, slot: u64, name_gpa: u64) -> Result<usize> {
        object_mut(&mut self.objects, slot)?;
        let name = read_name(mem, name_gpa)?;
        let map_slot = self.free_map_slot().ok_or(Error::NoFreeMapSlot)?;
        let loaded = object_mut(&mut self.objects, slot)?;
        let info = loaded
            .object
            .find_map(&name)
            .ok_or_else(|| Error::MapNotFound(name.clone()))?;

        let size = info.data_size() as usize;
        let mapping = MemoryMapping::from_fd_offset(&info.fd, size, 0).map_err(Error::Mmap)?;
        let device = SharedMemoryDevice::for_map_slot(
            map_slot,
            mapping.as_ptr() as u64,
            info.data_size(),
            pagesize() as u64,
        );
        self.host
            .publish_shared_memory(&device)
            .map_err(Error::Collaborator)?;

        info!(
            "mapped {} of object {} as {} ({} bytes)",
            name, slot, device.device_id, size
        );
        loaded.maps.insert(
            map_slot,
            MapSlot {
                name,
                mapping,
                device,
            },
        );
        Ok(map_slot)
    }

    /// Unplugs the device of map slot `mslot` of object `slot` and unmaps its data. The backend
    /// is deleted once the guest has released the device.
    pub fn unmap(&mut self, slot: u64, mslot: u64) -> Result<()> {
        let loaded = object_mut(&mut self.objects, slot)?;
        let key = usize::try_from(mslot)
            .ok()
            .filter(|k| loaded.maps.contains_key(k))
            .ok_or(Error::InvalidMapSlot(mslot))?;
        if let Some(map) = loaded.maps.get(&key) {
            self.host
                .unplug_shared_memory(&map.device.device_id)
                .map_err(Error::Collaborator)?;
        }
        if let Some(map) = loaded.maps.remove(&key) {
            debug!("unmapped {} ({} bytes)", map.name, map.mapping.size());
            self.pending.push(PendingBackend {
                map_slot: key,
                backend_id: map.device.backend_id,
            });
        }
        Ok(())
    }

    /// Lowest map slot neither held by an object nor waiting for its backend to go away.
    fn free_map_slot(&self) -> Option<usize> {
        (0..MAX_MAPS).find(|&n| {
            !self.pending.iter().any(|p| p.map_slot == n)
                && !self
                    .objects
                    .iter()
                    .flatten()
                    .any(|o| o.maps.contains_key(&n))
        })
    }
}

fn attach_link(
    object: &mut dyn ExtensionObject,
    program: ProgramId,
    target: AttachTarget,
) -> Result<Attachment> {
    let link = object
        .attach(program, target)
        .map_err(Error::Collaborator)?;
    Ok(Attachment::Link {
        link,
        counter: None,
    })
}
