// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Background collection of dirty rings.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::error;
use log::info;
use sync::Condvar;
use sync::Mutex;

use crate::accel::KvmAccel;
use crate::Error;
use crate::Result;

/// Per-vCPU dirty page rate limiting, driven by the migration code.
pub trait DirtyRateLimiter: Send + Sync {
    /// Whether limiting is active. While it is, only the vCPU whose ring filled is reaped and the
    /// reaper thread stays idle.
    fn in_service(&self) -> bool;

    /// Sleeps the calling vCPU as needed to hold its dirty rate.
    fn throttle(&self, vcpu_id: usize);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaperState {
    Wait,
    Reaping,
}

struct Shared {
    state: ReaperState,
    iterations: u64,
    stop: bool,
}

/// A thread that periodically reaps every dirty ring under the big lock. Stops when dropped.
pub struct DirtyRingReaper {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl DirtyRingReaper {
    pub(crate) fn start(accel: Arc<KvmAccel>, interval: Duration) -> Result<DirtyRingReaper> {
        let shared = Arc::new((
            Mutex::new(Shared {
                state: ReaperState::Wait,
                iterations: 0,
                stop: false,
            }),
            Condvar::new(),
        ));
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("kvm-reaper".to_string())
            .spawn(move || reaper_loop(accel, interval, thread_shared))
            .map_err(Error::SpawnThread)?;
        info!("dirty ring reaper started, interval {:?}", interval);
        Ok(DirtyRingReaper {
            shared,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> ReaperState {
        self.shared.0.lock().state
    }

    /// Number of completed reap passes.
    pub fn iterations(&self) -> u64 {
        self.shared.0.lock().iterations
    }
}

fn reaper_loop(accel: Arc<KvmAccel>, interval: Duration, shared: Arc<(Mutex<Shared>, Condvar)>) {
    let (lock, cvar) = &*shared;
    loop {
        {
            let mut guard = lock.lock();
            guard.state = ReaperState::Wait;
            let (guard, _) = cvar.wait_timeout_while(guard, interval, |s| !s.stop);
            if guard.stop {
                return;
            }
        }

        // Keep sleeping so the reaper does not disturb the rate limiter.
        if accel.dirty_limiter().is_some_and(|l| l.in_service()) {
            continue;
        }

        lock.lock().state = ReaperState::Reaping;
        let result = {
            let _big = accel.big_lock().lock();
            accel.slots().reap(None)
        };
        if let Err(e) = result {
            error!("dirty ring reaper: {}", e);
        }
        lock.lock().iterations += 1;
    }
}

impl Drop for DirtyRingReaper {
    fn drop(&mut self) {
        self.shared.0.lock().stop = true;
        self.shared.1.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("dirty ring reaper panicked");
            }
        }
    }
}
