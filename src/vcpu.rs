// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The vCPU run loop and its cancellation.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use libc::c_int;
use log::debug;
use log::error;
use log::warn;
use sync::Condvar;
use sync::Mutex;

use crate::accel::KvmAccel;
use crate::hypervisor::Vcpu;
use crate::hypervisor::VcpuExit;
use crate::memory::GuestMemory;
use crate::Error;
use crate::Result;

/// Why the guest asked for a VM-wide transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownCause {
    GuestShutdown,
    GuestReset,
}

/// Why the VM is being stopped by the accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    InternalError,
}

/// How a vCPU thread finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitState {
    Stop,
    Reset,
    Crash,
    GuestPanic,
}

/// Result of one `VcpuRunner::exec` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    /// Control returned to the caller so it can process events.
    Interrupted,
    /// The vCPU halted and waits for an interrupt.
    Halted,
}

/// What the architecture handler wants the loop to do after an exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    Continue,
    Interrupt,
    Halt,
}

/// Where the vCPU is in its run cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Register state changed in user space and must be pushed before the next entry.
    Dirty,
    Syncing,
    Running,
    ExitDispatch,
    Terminal,
}

/// VM-wide run state transitions requested by vCPUs.
pub trait VmRunControl: Send + Sync {
    fn request_shutdown(&self, cause: ShutdownCause);
    fn request_reset(&self, cause: ShutdownCause);
    fn report_guest_panic(&self, vcpu_id: usize);
    fn stop(&self, reason: StopReason);
    /// The transition that ends every vCPU loop, once one was requested.
    fn pending_exit(&self) -> Option<ExitState>;
}

/// A port or memory mapped I/O address space.
pub trait IoBus: Send + Sync {
    fn read(&self, addr: u64, data: &mut [u8]);
    fn write(&self, addr: u64, data: &[u8]);
}

/// Architecture specific parts of the run loop.
pub trait VcpuArch: Send {
    /// Pushes the user space register cache into the vcpu.
    fn put_registers(&mut self, _vcpu: &mut dyn Vcpu) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_run(&mut self, _vcpu: &mut dyn Vcpu) {}

    fn post_run(&mut self, _vcpu: &mut dyn Vcpu) {}

    /// Handles events delivered while the vcpu was outside the kernel. Returns true when the vcpu
    /// should halt instead of entering the guest.
    fn process_async_events(&mut self, _vcpu: &mut dyn Vcpu) -> bool {
        false
    }

    /// Handles exits the generic loop does not interpret.
    fn handle_exit(&mut self, vcpu: &mut dyn Vcpu, exit: &VcpuExit) -> anyhow::Result<ExitAction>;

    /// Whether an emulation failure stops the VM instead of just interrupting the loop.
    fn stop_on_emulation_error(&self) -> bool {
        true
    }

    fn dump_state(&self, _vcpu: &dyn Vcpu) {}
}

/// The collaborators a vCPU loop dispatches exits to.
pub struct VcpuHooks {
    pub arch: Box<dyn VcpuArch>,
    pub pio: Arc<dyn IoBus>,
    pub mmio: Arc<dyn IoBus>,
    pub control: Arc<dyn VmRunControl>,
    pub guest_memory: Arc<dyn GuestMemory>,
}

#[derive(Default)]
struct KickState {
    in_kernel: bool,
    exits: u64,
}

/// Cancels a vCPU's `KVM_RUN` from other threads.
///
/// A kick sets the exit request flag and, when a signal is configured, sends it to the vCPU
/// thread. The signal handler sets the thread's immediate exit flag so the kernel returns EINTR.
pub struct VcpuKicker {
    id: usize,
    exit_request: AtomicBool,
    signal: Option<c_int>,
    thread: Mutex<Option<libc::pthread_t>>,
    state: Mutex<KickState>,
    exited: Condvar,
}

impl VcpuKicker {
    pub fn new(id: usize, signal: Option<c_int>) -> VcpuKicker {
        VcpuKicker {
            id,
            exit_request: AtomicBool::new(false),
            signal,
            thread: Mutex::new(None),
            state: Mutex::new(KickState::default()),
            exited: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Records the calling thread as the one running the vCPU.
    pub fn bind_current_thread(&self) {
        // SAFETY: pthread_self has no preconditions.
        *self.thread.lock() = Some(unsafe { libc::pthread_self() });
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::SeqCst)
    }

    /// Asks the vCPU to leave the guest. Does not wait.
    pub fn kick(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
        let (Some(signal), Some(thread)) = (self.signal, *self.thread.lock()) else {
            return;
        };
        // SAFETY: the thread id was recorded by the vCPU thread itself, which lives as long as
        // its runner; the signal has a handler installed by `kvm::install_kick_signal_handler`.
        let ret = unsafe { libc::pthread_kill(thread, signal) };
        if ret != 0 {
            warn!("failed to signal vcpu {}: errno {}", self.id, ret);
        }
    }

    /// Kicks the vCPU and waits until it has left `KVM_RUN`, if it was inside.
    pub fn kick_sync(&self) {
        let state = self.state.lock();
        if !state.in_kernel {
            return;
        }
        let seen = state.exits;
        self.kick();
        let _state = self
            .exited
            .wait_while(state, |s| s.in_kernel && s.exits == seen);
    }

    fn enter_kernel(&self) {
        self.state.lock().in_kernel = true;
    }

    fn leave_kernel(&self) {
        let mut state = self.state.lock();
        state.in_kernel = false;
        state.exits += 1;
        self.exited.notify_all();
    }

    /// Number of returns from `KVM_RUN` so far.
    pub fn exit_count(&self) -> u64 {
        self.state.lock().exits
    }

    fn clear_exit_request(&self) {
        self.exit_request.store(false, Ordering::SeqCst);
    }
}

/// Drives one vCPU.
pub struct VcpuRunner<V: Vcpu> {
    vcpu: V,
    accel: Arc<KvmAccel>,
    kicker: Arc<VcpuKicker>,
    hooks: VcpuHooks,
    state: RunState,
    bound: bool,
}

impl<V: Vcpu> VcpuRunner<V> {
    /// Registers `vcpu` with the accelerator. `signal` is the kick signal, if any.
    pub fn new(
        vcpu: V,
        accel: Arc<KvmAccel>,
        hooks: VcpuHooks,
        signal: Option<c_int>,
    ) -> Result<VcpuRunner<V>> {
        let kicker = accel.register_vcpu(&vcpu, signal)?;
        Ok(VcpuRunner {
            vcpu,
            accel,
            kicker,
            hooks,
            state: RunState::Dirty,
            bound: false,
        })
    }

    pub fn kicker(&self) -> Arc<VcpuKicker> {
        self.kicker.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn vcpu(&self) -> &V {
        &self.vcpu
    }

    /// Marks the register cache as changed so it is pushed before the next entry.
    pub fn mark_registers_dirty(&mut self) {
        if self.state != RunState::Terminal {
            self.state = RunState::Dirty;
        }
    }

    /// Runs the guest until the VM leaves the running state.
    pub fn run(&mut self) -> ExitState {
        loop {
            if let Some(exit) = self.hooks.control.pending_exit() {
                self.state = RunState::Terminal;
                return exit;
            }
            match self.exec() {
                Ok(status) => debug!("vcpu {} returned {:?}", self.vcpu.id(), status),
                Err(e) => {
                    error!("vcpu {} stopped: {}", self.vcpu.id(), e);
                    self.state = RunState::Terminal;
                    return self.hooks.control.pending_exit().unwrap_or(ExitState::Crash);
                }
            }
        }
    }

    /// Enters the guest until an exit needs the attention of the caller.
    pub fn exec(&mut self) -> Result<ExecStatus> {
        if !self.bound {
            self.vcpu
                .bind_to_current_thread()
                .map_err(|err| Error::RunVcpu {
                    id: self.vcpu.id(),
                    err,
                })?;
            self.kicker.bind_current_thread();
            self.bound = true;
        }

        if self.hooks.arch.process_async_events(&mut self.vcpu) {
            self.kicker.clear_exit_request();
            return Ok(ExecStatus::Halted);
        }

        let status = loop {
            if self.state == RunState::Dirty {
                self.state = RunState::Syncing;
                if let Err(e) = self.hooks.arch.put_registers(&mut self.vcpu) {
                    return self.fatal(format!("failed to put registers: {:#}", e));
                }
            }

            self.hooks.arch.pre_run(&mut self.vcpu);
            if self.kicker.exit_requested() {
                // A kick that raced with the checks above; leave right after entering.
                self.vcpu.set_immediate_exit(true);
            }

            self.state = RunState::Running;
            self.kicker.enter_kernel();
            let result = self.vcpu.run();
            self.kicker.leave_kernel();
            self.hooks.arch.post_run(&mut self.vcpu);
            self.state = RunState::ExitDispatch;

            let exit = match result {
                Ok(exit) => exit,
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                    debug!("vcpu {} interrupted", self.vcpu.id());
                    self.vcpu.set_immediate_exit(false);
                    break ExecStatus::Interrupted;
                }
                Err(err) => {
                    error!("vcpu {} failed to run: {}", self.vcpu.id(), err);
                    self.hooks.arch.dump_state(&self.vcpu);
                    self.hooks.control.stop(StopReason::InternalError);
                    self.state = RunState::Terminal;
                    return Err(Error::RunVcpu {
                        id: self.vcpu.id(),
                        err,
                    });
                }
            };

            if let Some(status) = self.dispatch(exit)? {
                break status;
            }
        };

        self.kicker.clear_exit_request();
        if self.state == RunState::ExitDispatch {
            self.state = RunState::Running;
        }
        Ok(status)
    }

    // Handles one exit. `None` re-enters the guest.
    fn dispatch(&mut self, exit: VcpuExit) -> Result<Option<ExecStatus>> {
        let id = self.vcpu.id();
        match exit {
            VcpuExit::IoIn { port, size } => {
                let mut data = [0u8; 8];
                let size = size.min(data.len());
                self.hooks.pio.read(port as u64, &mut data[..size]);
                if let Err(e) = self.vcpu.set_data(&data[..size]) {
                    return self.fatal(format!("failed to complete port read: {}", e));
                }
                Ok(None)
            }
            VcpuExit::IoOut { port, size, data } => {
                self.hooks
                    .pio
                    .write(port as u64, &data[..size.min(data.len())]);
                Ok(None)
            }
            VcpuExit::MmioRead { address, size } => {
                let mut data = [0u8; 8];
                let size = size.min(data.len());
                self.hooks.mmio.read(address, &mut data[..size]);
                if let Err(e) = self.vcpu.set_data(&data[..size]) {
                    return self.fatal(format!("failed to complete mmio read: {}", e));
                }
                Ok(None)
            }
            VcpuExit::MmioWrite {
                address,
                size,
                data,
            } => {
                self.hooks
                    .mmio
                    .write(address, &data[..size.min(data.len())]);
                Ok(None)
            }
            VcpuExit::Hypercall { nr, args } => {
                let call_args = [args[0], args[1], args[2], args[3]];
                let ret = self
                    .accel
                    .hypercalls()
                    .handle(nr, call_args, &*self.hooks.guest_memory);
                if let Err(e) = self.vcpu.set_hypercall_result(ret as u64) {
                    return self.fatal(format!("failed to complete hypercall: {}", e));
                }
                Ok(None)
            }
            VcpuExit::IrqWindowOpen => Ok(Some(ExecStatus::Interrupted)),
            VcpuExit::Shutdown => {
                debug!("vcpu {} shutdown exit", id);
                self.hooks
                    .control
                    .request_shutdown(ShutdownCause::GuestShutdown);
                Ok(Some(ExecStatus::Interrupted))
            }
            VcpuExit::Unknown {
                hardware_exit_reason,
            } => self.fatal(format!(
                "unknown exit, hardware reason {:#x}",
                hardware_exit_reason
            )),
            VcpuExit::InternalError { suberror, data } => {
                error!("vcpu {} internal error, suberror {}", id, suberror);
                if self.accel.caps().internal_error_data {
                    for (i, word) in data.iter().enumerate() {
                        error!("extra data[{}]: {:#018x}", i, word);
                    }
                }
                if suberror == kvm_sys::KVM_INTERNAL_ERROR_EMULATION {
                    error!("vcpu {} emulation failure", id);
                    if !self.hooks.arch.stop_on_emulation_error() {
                        self.hooks.arch.dump_state(&self.vcpu);
                        return Ok(Some(ExecStatus::Interrupted));
                    }
                }
                self.fatal(format!("internal error, suberror {}", suberror))
            }
            VcpuExit::DirtyRingFull => {
                debug!("vcpu {} dirty ring full", id);
                let accel = self.accel.clone();
                let limiter = accel.dirty_limiter();
                let in_service = limiter.as_ref().is_some_and(|l| l.in_service());
                let reaped = {
                    let _big = accel.big_lock().lock();
                    accel.slots().reap(if in_service { Some(id) } else { None })
                };
                if let Err(e) = reaped {
                    return self.fatal(format!("failed to reap dirty rings: {}", e));
                }
                if let Some(limiter) = limiter {
                    limiter.throttle(id);
                }
                Ok(None)
            }
            VcpuExit::SystemEvent { event_type, data } => match event_type {
                kvm_sys::KVM_SYSTEM_EVENT_SHUTDOWN => {
                    self.hooks
                        .control
                        .request_shutdown(ShutdownCause::GuestShutdown);
                    Ok(Some(ExecStatus::Interrupted))
                }
                kvm_sys::KVM_SYSTEM_EVENT_RESET => {
                    self.hooks.control.request_reset(ShutdownCause::GuestReset);
                    Ok(Some(ExecStatus::Interrupted))
                }
                kvm_sys::KVM_SYSTEM_EVENT_CRASH => {
                    let accel = self.accel.clone();
                    let _big = accel.big_lock().lock();
                    self.hooks.control.report_guest_panic(id);
                    Ok(None)
                }
                _ => self.arch_exit(VcpuExit::SystemEvent { event_type, data }),
            },
            exit @ VcpuExit::Arch { .. } => self.arch_exit(exit),
        }
    }

    fn arch_exit(&mut self, exit: VcpuExit) -> Result<Option<ExecStatus>> {
        match self.hooks.arch.handle_exit(&mut self.vcpu, &exit) {
            Ok(ExitAction::Continue) => Ok(None),
            Ok(ExitAction::Interrupt) => Ok(Some(ExecStatus::Interrupted)),
            Ok(ExitAction::Halt) => Ok(Some(ExecStatus::Halted)),
            Err(e) => self.fatal(format!("unhandled exit {:?}: {:#}", exit, e)),
        }
    }

    // Stops the VM after an exit the accelerator cannot recover from.
    fn fatal<T>(&mut self, reason: String) -> Result<T> {
        let id = self.vcpu.id();
        error!("vcpu {}: {}", id, reason);
        self.hooks.arch.dump_state(&self.vcpu);
        self.hooks.control.stop(StopReason::InternalError);
        self.state = RunState::Terminal;
        Err(Error::VcpuFatalExit { id, reason })
    }
}

impl<V: Vcpu> Drop for VcpuRunner<V> {
    fn drop(&mut self) {
        if let Err(e) = self.accel.unregister_vcpu(self.vcpu.id()) {
            error!("failed to unregister vcpu {}: {}", self.vcpu.id(), e);
        }
    }
}

/// Kicks every registered vcpu out of the guest and waits for each to leave `KVM_RUN`.
pub fn kick_all_sync(kickers: &[Arc<VcpuKicker>]) {
    for kicker in kickers {
        kicker.kick_sync();
    }
}
