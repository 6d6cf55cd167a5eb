// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware cycle counters that profiling programs sample from.

use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;

use kvm_sys::*;
use vmm_sys_util::errno::Error;
use vmm_sys_util::errno::Result;
use vmm_sys_util::ioctl::ioctl;

/// Builds the attributes of a disabled, frequency-sampled CPU cycle counter.
pub fn cycle_counter_attr(sample_freq: u64) -> perf_event_attr {
    perf_event_attr {
        type_: PERF_TYPE_HARDWARE,
        size: PERF_ATTR_SIZE_VER8,
        config: PERF_COUNT_HW_CPU_CYCLES,
        sample_period: sample_freq,
        sample_type: PERF_SAMPLE_RAW,
        flags: PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_INHERIT
            | PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_COMM
            | PERF_ATTR_FLAG_FREQ
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | PERF_ATTR_FLAG_EXCLUDE_HOST
            | PERF_ATTR_FLAG_MMAP2,
        ..Default::default()
    }
}

/// Opens a cycle counter for every task on `cpu`. The counter starts disabled.
pub fn open_cycle_counter(sample_freq: u64, cpu: i32) -> Result<OwnedFd> {
    let attr = cycle_counter_attr(sample_freq);
    // SAFETY: attr is a valid perf_event_attr that outlives the call, and the kernel reads at
    // most `attr.size` bytes of it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const perf_event_attr,
            -1 as libc::pid_t,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(Error::last());
    }
    // SAFETY: the syscall returned a new descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) })
}

/// Starts counting on a counter opened by [`open_cycle_counter`].
pub fn enable(counter: &OwnedFd) -> Result<()> {
    // SAFETY: PERF_EVENT_IOC_ENABLE takes no argument and only affects this descriptor.
    let ret = unsafe { ioctl(counter, PERF_EVENT_IOC_ENABLE()) };
    if ret < 0 {
        return Err(Error::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_samples_guest_cycles_by_frequency() {
        let attr = cycle_counter_attr(997);
        assert_eq!(attr.size as usize, std::mem::size_of::<perf_event_attr>());
        assert_eq!(attr.sample_period, 997);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_FREQ, 0);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_DISABLED, 0);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_EXCLUDE_HOST, 0);
        assert_eq!(attr.flags & (1 << 20), 0);
    }
}
