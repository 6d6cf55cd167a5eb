// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owned shared memory mappings.

use std::os::unix::io::AsRawFd;
use std::ptr::null_mut;

use libc::c_int;
use libc::c_void;
use vmm_sys_util::errno::Error;
use vmm_sys_util::errno::Result;

/// Memory protection of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protection {
    read: bool,
    write: bool,
}

impl Protection {
    pub fn read() -> Protection {
        Protection {
            read: true,
            write: false,
        }
    }

    pub fn read_write() -> Protection {
        Protection {
            read: true,
            write: true,
        }
    }
}

impl From<Protection> for c_int {
    fn from(p: Protection) -> Self {
        let mut value = 0;
        if p.read {
            value |= libc::PROT_READ;
        }
        if p.write {
            value |= libc::PROT_WRITE;
        }
        value
    }
}

/// A `MAP_SHARED` region that is unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is plain shared memory owned by this object; concurrent access through raw
// pointers is the responsibility of the users that hand them out.
unsafe impl Send for MemoryMapping {}
// SAFETY: see above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps `size` bytes of anonymous shared memory.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        // SAFETY: no fixed address is requested, so existing mappings are never replaced.
        unsafe { MemoryMapping::try_mmap(size, Protection::read_write().into(), None) }
    }

    /// Maps `size` bytes of `fd` starting at `offset` for reading and writing.
    pub fn from_fd_offset(fd: &dyn AsRawFd, size: usize, offset: u64) -> Result<MemoryMapping> {
        MemoryMapping::from_fd_offset_protection(fd, size, offset, Protection::read_write())
    }

    pub fn from_fd_offset_protection(
        fd: &dyn AsRawFd,
        size: usize,
        offset: u64,
        prot: Protection,
    ) -> Result<MemoryMapping> {
        // SAFETY: no fixed address is requested, so existing mappings are never replaced.
        unsafe { MemoryMapping::try_mmap(size, prot.into(), Some((fd.as_raw_fd(), offset))) }
    }

    unsafe fn try_mmap(
        size: usize,
        prot: c_int,
        fd: Option<(c_int, u64)>,
    ) -> Result<MemoryMapping> {
        if size == 0 {
            return Err(Error::new(libc::EINVAL));
        }
        let mut flags = libc::MAP_SHARED;
        if fd.is_none() {
            flags |= libc::MAP_ANONYMOUS;
        }
        let (raw_fd, offset) = fd.unwrap_or((-1, 0));
        let addr = libc::mmap(
            null_mut(),
            size,
            prot,
            flags,
            raw_fd,
            offset as libc::off_t,
        );
        if addr == libc::MAP_FAILED {
            return Err(Error::last());
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Copies `buf` into the mapping at `offset`, failing if it does not fit.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: the range was checked to lie inside the mapping and `buf` cannot overlap it
        // because `buf` is borrowed immutably while the mapping is only reachable through `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), buf.len());
        }
        Ok(())
    }

    /// Copies bytes at `offset` of the mapping into `buf`.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: the range was checked to lie inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::new(libc::EFAULT)),
        }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by `try_mmap` and is unmapped exactly once here.
        unsafe {
            libc::munmap(self.addr as *mut c_void, self.size);
        }
    }
}
