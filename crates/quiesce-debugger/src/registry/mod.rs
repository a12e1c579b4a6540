mod world;

use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use self::world::{PendingStop, World};
use crate::address::VirtualAddress;
use crate::breakpoint::{BreakpointManager, BreakpointType};
use crate::debug_state::{Release, StopData};
use crate::error::{Error, Result};
use crate::run_loop::RunLoop;
use crate::suspension;
use crate::thread::ThreadId;
use crate::vm::VmHandle;

/// Global execution mode of the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorldMode {
    /// Every VM is allowed to run.
    RunningAll,

    /// Every VM must stop as soon as possible.
    Stopped,
}

/// Reason of a world mode transition, kept for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Requested by the debugger.
    Debugger,

    /// A VM hit a breakpoint.
    Breakpoint,

    /// Forced while tearing down a debugging session.
    Teardown,
}

/// Event reported to the debugger once the whole world is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    /// The debugger interrupted the world.
    Interrupt,

    /// A VM hit a breakpoint.
    Breakpoint,

    /// The debuggee completed a single step.
    Step,
}

/// Stop reply, published once every VM acknowledged a world stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopReply {
    /// Sequence number of the reply, starting at 1.
    pub sequence: u64,

    /// Thread of the VM responsible for the stop.
    pub thread_id: Option<ThreadId>,

    /// What caused the stop.
    pub cause: StopCause,

    /// Location of the responsible VM, if stopped within guest code.
    pub stop_data: Option<StopData>,
}

/// Consistent copy of the world bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorldSnapshot {
    /// Current world mode.
    pub mode: WorldMode,

    /// Number of live VMs.
    pub number_of_vms: usize,

    /// Number of VMs in a stopped state.
    pub number_of_stopped_vms: usize,

    /// Number of VMs currently inside guest code.
    pub number_of_active_vms: usize,

    /// Thread of the VM designated as the debuggee.
    pub target_vm: Option<ThreadId>,

    /// Number of stop replies published so far.
    pub stop_replies: u64,

    /// Reason of the last world mode transition.
    pub last_reason: Option<StopReason>,
}

impl WorldSnapshot {
    /// Returns whether the world is in [WorldMode::Stopped].
    pub fn is_stopped(&self) -> bool {
        self.mode == WorldMode::Stopped
    }

    /// Returns whether the world is in [WorldMode::RunningAll].
    pub fn is_running(&self) -> bool {
        self.mode == WorldMode::RunningAll
    }

    /// Returns whether the world is stopped and every VM acknowledged it.
    pub fn all_stopped(&self) -> bool {
        self.is_stopped() && self.number_of_stopped_vms == self.number_of_vms
    }
}

/// Outcome of a VM acknowledging a world stop.
pub(crate) enum Acknowledgement {
    /// The world is running, the VM can carry on.
    NotRequested,

    /// The VM is stopped, and must park.
    Stopped,
}

/// Outcome of a VM reaching a breakpoint.
pub(crate) enum BreakpointHit {
    /// The breakpoint was removed in the meantime.
    Vanished,

    /// The world is already stopping, so the breakpoint is not reported.
    WorldStopping,

    /// The VM stopped the world, and must park.
    Stopped,
}

/// Registry of every live VM, and owner of the world mode.
///
/// Each VM registers itself on creation and unregisters on destruction. The
/// registry only holds weak references to VMs.
pub struct VmRegistry {
    world: Mutex<World>,

    /// Signaled on every change of the world bookkeeping.
    changed: Condvar,

    breakpoints: BreakpointManager,
}

impl VmRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World::new()),
            changed: Condvar::new(),
            breakpoints: BreakpointManager::new(),
        })
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<VmRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the breakpoint table shared by the VMs of this registry.
    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Returns a consistent copy of the world bookkeeping.
    pub fn info(&self) -> WorldSnapshot {
        self.world.lock().snapshot()
    }

    /// Returns the last published stop reply.
    pub fn last_stop_reply(&self) -> Option<StopReply> {
        self.world.lock().last_reply
    }

    /// Returns the VM owned by the given thread, if still alive.
    pub fn vm(&self, thread_id: ThreadId) -> Option<Arc<VmHandle>> {
        self.world.lock().vm(thread_id)
    }

    /// Returns the VM designated as the debuggee, if any.
    pub fn target_vm(&self) -> Option<Arc<VmHandle>> {
        let world = self.world.lock();
        world.target.and_then(|id| world.vm(id))
    }

    /// Returns whether the given thread owns a live VM.
    pub fn owns_vm(&self, thread_id: ThreadId) -> bool {
        self.vm(thread_id).is_some()
    }

    /// Visits every live VM, in registration order.
    ///
    /// VMs are visited outside of the registry lock, so the visitor may call
    /// back into the registry.
    pub fn for_each_vm(&self, mut visitor: impl FnMut(&VmHandle) -> ControlFlow<()>) {
        let vms = self.world.lock().live_vms();

        for vm in vms {
            if visitor(&vm).is_break() {
                break;
            }
        }
    }

    /// Moves the world into [WorldMode::Stopped], and asks every VM to stop.
    ///
    /// Returns whether the world was running.
    pub fn request_stop_all(self: &Arc<Self>, reason: StopReason) -> bool {
        let mut world = self.world.lock();

        if world.mode == WorldMode::Stopped {
            return false;
        }

        world.mode = WorldMode::Stopped;
        world.last_reason = Some(reason);
        world.pick_target();
        world.pending = Some(PendingStop {
            thread_id: world.target,
            cause: StopCause::Interrupt,
        });

        tracing::debug!(?reason, vms = world.vms.len(), "stopping world");

        for vm in world.live_vms() {
            suspension::deliver_stop(self, &vm);
        }

        world.try_publish();
        self.notify(&world);

        true
    }

    /// Moves the world into [WorldMode::RunningAll], releasing every VM.
    ///
    /// Every VM is released even if the world was already running. Returns
    /// whether the world was stopped.
    pub fn request_resume_all(&self, reason: StopReason) -> bool {
        let mut world = self.world.lock();

        for vm in world.live_vms() {
            vm.disarm_trap();
            vm.debug_state().release(Release::Resume);
        }

        let was_stopped = world.mode == WorldMode::Stopped;

        world.mode = WorldMode::RunningAll;
        world.num_stopped = 0;
        world.pending = None;
        world.last_reason = Some(reason);

        tracing::debug!(?reason, was_stopped, "resuming world");

        self.notify(&world);

        was_stopped
    }

    pub(crate) fn register(self: &Arc<Self>, vm: &Arc<VmHandle>) -> Result<()> {
        let thread_id = vm.thread_id();
        let mut world = self.world.lock();

        if world.vm(thread_id).is_some() {
            return Err(Error::ThreadAlreadyOwnsVm(thread_id));
        }

        world.vms.insert(thread_id, Arc::downgrade(vm));

        if world.mode == WorldMode::Stopped {
            // joins the stop without running any guest code
            vm.arm_trap();
            vm.debug_state().stop(false, None);
            world.num_stopped += 1;

            if world.target.is_none() {
                world.target = Some(thread_id);
            }
        }

        tracing::debug!(tid = %thread_id, vms = world.vms.len(), "VM registered");

        self.notify(&world);

        Ok(())
    }

    pub(crate) fn unregister(&self, vm: &VmHandle) {
        let thread_id = vm.thread_id();
        let mut world = self.world.lock();

        let owned = world
            .vms
            .get(&thread_id)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), vm));

        if !owned {
            return;
        }

        world.vms.shift_remove(&thread_id);

        if vm.debug_state().is_stopped() {
            world.num_stopped = world.num_stopped.saturating_sub(1);
        }

        if vm.is_entered() {
            world.num_active = world.num_active.saturating_sub(1);
        }

        if world.target == Some(thread_id) {
            world.target = None;

            if world.mode == WorldMode::Stopped {
                world.pick_target();
            }
        }

        tracing::debug!(tid = %thread_id, vms = world.vms.len(), "VM unregistered");

        world.try_publish();
        self.notify(&world);
    }

    pub(crate) fn notify_entered(&self, vm: &VmHandle) {
        let mut world = self.world.lock();
        vm.set_entered(true);
        world.num_active += 1;
        self.notify(&world);
    }

    pub(crate) fn notify_exited(&self, vm: &VmHandle) {
        let mut world = self.world.lock();
        vm.set_entered(false);
        world.num_active = world.num_active.saturating_sub(1);
        self.notify(&world);
    }

    /// Records the given VM as stopped, if the world is stopped.
    pub(crate) fn acknowledge_stop(
        &self,
        vm: &VmHandle,
        location: Option<VirtualAddress>,
    ) -> Acknowledgement {
        let mut world = self.world.lock();

        if world.mode != WorldMode::Stopped || !world.vms.contains_key(&vm.thread_id()) {
            return Acknowledgement::NotRequested;
        }

        let debug_state = vm.debug_state();

        if debug_state.is_stopped() {
            return Acknowledgement::Stopped;
        }

        let stepping = debug_state.is_stepping();

        let stop_data = location.map(|address| StopData {
            address,
            breakpoint_type: stepping.then(|| {
                self.breakpoints
                    .find_breakpoint(address)
                    .map_or(BreakpointType::OneTime, |bk| bk.ty)
            }),
        });

        debug_state.stop(stepping && stop_data.is_some(), stop_data);
        world.num_stopped += 1;

        tracing::trace!(
            tid = %vm.thread_id(),
            stopped = world.num_stopped,
            vms = world.vms.len(),
            "VM acknowledged stop"
        );

        world.try_publish();
        self.notify(&world);

        Acknowledgement::Stopped
    }

    /// Stops the world on behalf of a VM reaching a breakpoint.
    pub(crate) fn hit_breakpoint(
        self: &Arc<Self>,
        vm: &Arc<VmHandle>,
        addr: VirtualAddress,
    ) -> BreakpointHit {
        let thread_id = vm.thread_id();
        let mut world = self.world.lock();

        if world.mode == WorldMode::Stopped {
            return BreakpointHit::WorldStopping;
        }

        let Some(bk) = self.breakpoints.consume_breakpoint(addr) else {
            return BreakpointHit::Vanished;
        };

        world.mode = WorldMode::Stopped;
        world.last_reason = Some(StopReason::Breakpoint);
        world.target = Some(thread_id);
        world.pending = Some(PendingStop {
            thread_id: Some(thread_id),
            cause: StopCause::Breakpoint,
        });

        tracing::debug!(tid = %thread_id, %addr, ty = ?bk.ty, "breakpoint hit");

        vm.arm_trap();
        vm.debug_state().stop(
            true,
            Some(StopData {
                address: addr,
                breakpoint_type: Some(bk.ty),
            }),
        );
        world.num_stopped += 1;

        for other in world.live_vms() {
            if other.thread_id() != thread_id {
                suspension::deliver_stop(self, &other);
            }
        }

        world.try_publish();
        self.notify(&world);

        BreakpointHit::Stopped
    }

    /// Releases the debuggee for a single step.
    ///
    /// Returns the number of stop replies published before the release.
    pub(crate) fn release_for_step(&self) -> Result<u64> {
        let mut world = self.world.lock();

        if !world.all_stopped() {
            return Err(Error::WorldNotStopped);
        }

        let thread_id = world.target.ok_or(Error::NoDebuggee)?;
        let vm = world.vm(thread_id).ok_or(Error::UnknownThread(thread_id))?;

        let snapshot = vm.debug_state().snapshot();

        if snapshot.is_running() {
            return Err(Error::VmNotStopped(thread_id));
        }

        if snapshot.stop_data.is_none() {
            return Err(Error::NoGuestFrame(thread_id));
        }

        world.pending = Some(PendingStop {
            thread_id: Some(thread_id),
            cause: StopCause::Step,
        });

        vm.debug_state().release(Release::Step);
        world.num_stopped -= 1;

        self.notify(&world);

        Ok(world.replies)
    }

    pub(crate) fn switch_target(&self, thread_id: ThreadId) -> Result<()> {
        let mut world = self.world.lock();

        if world.mode != WorldMode::Stopped {
            return Err(Error::WorldNotStopped);
        }

        let vm = world.vm(thread_id).ok_or(Error::UnknownThread(thread_id))?;

        if !vm.debug_state().is_stopped() {
            return Err(Error::VmNotStopped(thread_id));
        }

        world.target = Some(thread_id);

        Ok(())
    }

    /// Forgets about the debuggee and any unpublished stop.
    pub(crate) fn reset_session(&self) {
        let mut world = self.world.lock();
        world.target = None;
        world.pending = None;
    }

    /// Blocks the calling thread until `done` holds, or until `deadline`.
    ///
    /// Returns whether `done` holds.
    pub(crate) fn wait_until(
        &self,
        deadline: Option<Instant>,
        stall_warning: Duration,
        done: impl Fn(&WorldSnapshot) -> bool,
    ) -> bool {
        let mut world = self.world.lock();
        let mut next_warning = stall_deadline(Instant::now(), stall_warning);

        loop {
            let snapshot = world.snapshot();

            if done(&snapshot) {
                return true;
            }

            let now = Instant::now();

            if deadline.is_some_and(|deadline| now >= deadline) {
                return false;
            }

            if next_warning.is_some_and(|at| now >= at) {
                warn_stall(&snapshot);
                next_warning = stall_deadline(now, stall_warning);
            }

            let wake_at = match (deadline, next_warning) {
                (Some(deadline), Some(warning)) => Some(deadline.min(warning)),
                (deadline, warning) => deadline.or(warning),
            };

            match wake_at {
                Some(wake_at) => {
                    self.changed.wait_until(&mut world, wake_at);
                }
                None => self.changed.wait(&mut world),
            }
        }
    }

    pub(crate) fn add_host_waiter(&self, run_loop: Arc<RunLoop>) {
        self.world.lock().host_waiters.push(run_loop);
    }

    pub(crate) fn remove_host_waiter(&self, run_loop: &Arc<RunLoop>) {
        let mut world = self.world.lock();

        if let Some(pos) = world
            .host_waiters
            .iter()
            .position(|waiter| Arc::ptr_eq(waiter, run_loop))
        {
            world.host_waiters.swap_remove(pos);
        }
    }

    fn notify(&self, world: &MutexGuard<'_, World>) {
        self.changed.notify_all();

        for waiter in &world.host_waiters {
            waiter.wake();
        }
    }
}

/// Returns when the next stall warning is due, if ever.
pub(crate) fn stall_deadline(now: Instant, stall_warning: Duration) -> Option<Instant> {
    now.checked_add(stall_warning)
}

pub(crate) fn warn_stall(snapshot: &WorldSnapshot) {
    tracing::warn!(
        mode = ?snapshot.mode,
        vms = snapshot.number_of_vms,
        stopped = snapshot.number_of_stopped_vms,
        active = snapshot.number_of_active_vms,
        "still waiting on VMs"
    );
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use test_log::test;

    use super::{StopReason, VmRegistry, WorldMode};
    use crate::vm::Vm;

    #[test]
    fn empty_world_stops_and_resumes() {
        let registry = VmRegistry::new();

        assert!(registry.request_stop_all(StopReason::Debugger));
        assert!(!registry.request_stop_all(StopReason::Debugger));

        let info = registry.info();
        assert_eq!(info.mode, WorldMode::Stopped);
        assert_eq!(info.number_of_vms, 0);
        assert_eq!(info.target_vm, None);
        assert_eq!(info.stop_replies, 1);

        assert!(registry.request_resume_all(StopReason::Debugger));
        assert!(!registry.request_resume_all(StopReason::Debugger));
        assert!(registry.info().is_running());
        assert_eq!(registry.info().number_of_stopped_vms, 0);
    }

    #[test]
    fn registration_follows_vm_lifetime() {
        let registry = VmRegistry::new();

        let vm = Vm::new(&registry).unwrap();
        assert_eq!(registry.info().number_of_vms, 1);
        assert!(registry.owns_vm(vm.thread_id()));

        let mut visited = Vec::new();
        registry.for_each_vm(|handle| {
            visited.push(handle.thread_id());
            ControlFlow::Continue(())
        });
        assert_eq!(visited, [vm.thread_id()]);

        let thread_id = vm.thread_id();
        drop(vm);

        assert_eq!(registry.info().number_of_vms, 0);
        assert!(!registry.owns_vm(thread_id));
    }

    #[test]
    fn vm_created_while_stopped_joins_the_stop() {
        let registry = VmRegistry::new();
        registry.request_stop_all(StopReason::Debugger);

        let vm = Vm::new(&registry).unwrap();

        let info = registry.info();
        assert_eq!(info.number_of_vms, 1);
        assert_eq!(info.number_of_stopped_vms, 1);
        assert_eq!(info.target_vm, Some(vm.thread_id()));
        assert!(vm.debug_state().is_stopped());
        assert_eq!(vm.debug_state().stop_data(), None);

        registry.request_resume_all(StopReason::Debugger);
        assert!(vm.debug_state().is_running());
        assert_eq!(registry.info().number_of_stopped_vms, 0);

        drop(vm);
        assert_eq!(registry.info().number_of_vms, 0);
    }

    #[test]
    fn stopped_vm_leaving_keeps_counters_consistent() {
        let registry = VmRegistry::new();
        registry.request_stop_all(StopReason::Debugger);

        let vm = Vm::new(&registry).unwrap();
        drop(vm);

        let info = registry.info();
        assert_eq!(info.number_of_vms, 0);
        assert_eq!(info.number_of_stopped_vms, 0);
        assert_eq!(info.target_vm, None);

        registry.request_resume_all(StopReason::Teardown);
    }

    #[test]
    fn one_vm_per_thread() {
        let registry = VmRegistry::new();

        let _vm = Vm::new(&registry).unwrap();
        assert!(Vm::new(&registry).is_err());

        // another registry is a different world
        let other = VmRegistry::new();
        assert!(Vm::new(&other).is_ok());
    }
}
