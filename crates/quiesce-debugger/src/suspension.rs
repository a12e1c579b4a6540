use std::cell::Cell;
use std::sync::{Arc, Weak};

use crate::address::VirtualAddress;
use crate::debug_state::Release;
use crate::registry::{Acknowledgement, VmRegistry};
use crate::run_loop::RunLoop;
use crate::vm::VmHandle;

thread_local! {
    /// Depth of coordinator waits on the current thread.
    static HOST_WAIT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Asks a VM to stop at its next opportunity.
///
/// Called with the registry lock held.
pub(crate) fn deliver_stop(registry: &Arc<VmRegistry>, vm: &Arc<VmHandle>) {
    vm.arm_trap();

    // a VM outside of guest code never reaches a safe point, so its thread
    // must be reached through its run loop
    if vm.may_idle_forever() || !vm.is_entered() {
        vm.run_loop()
            .dispatch(idle_stop_callback(Arc::downgrade(registry), Arc::downgrade(vm)));
    }
}

fn idle_stop_callback(
    registry: Weak<VmRegistry>,
    vm: Weak<VmHandle>,
) -> impl FnOnce() + Send + 'static {
    move || {
        let (Some(registry), Some(vm)) = (registry.upgrade(), vm.upgrade()) else {
            tracing::trace!("stale stop callback");
            return;
        };

        if in_host_wait() {
            // the coordinator cannot park itself
            registry.acknowledge_stop(&vm, None);
        } else {
            suspend(&registry, &vm, None);
        }
    }
}

/// Stops the given VM if the world is stopped, parking the calling thread
/// until the VM is released.
///
/// Returns how the VM was last released, or `None` if it never stopped.
pub(crate) fn suspend(
    registry: &VmRegistry,
    vm: &VmHandle,
    location: Option<VirtualAddress>,
) -> Option<Release> {
    let mut released = None;

    while let Acknowledgement::Stopped = registry.acknowledge_stop(vm, location) {
        let how = park(vm);
        released = Some(how);

        if how == Release::Step {
            break;
        }
    }

    released
}

/// Parks the calling thread until the given (stopped) VM is released.
pub(crate) fn park(vm: &VmHandle) -> Release {
    tracing::trace!(tid = %vm.thread_id(), "VM parked");

    let how = vm.debug_state().park();

    tracing::trace!(tid = %vm.thread_id(), ?how, "VM released");

    how
}

fn in_host_wait() -> bool {
    HOST_WAIT_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks the current thread as waiting on the world on behalf of the
/// debugger, for as long as the guard lives.
///
/// While marked, the thread's run loop is woken up on every change of the
/// world bookkeeping.
pub(crate) struct HostWait<'a> {
    registry: &'a VmRegistry,
    run_loop: Arc<RunLoop>,
}

impl<'a> HostWait<'a> {
    pub(crate) fn enter(registry: &'a VmRegistry) -> Self {
        HOST_WAIT_DEPTH.with(|depth| depth.set(depth.get() + 1));

        let run_loop = RunLoop::current();
        registry.add_host_waiter(run_loop.clone());

        Self { registry, run_loop }
    }

    pub(crate) fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }
}

impl Drop for HostWait<'_> {
    fn drop(&mut self) {
        self.registry.remove_host_waiter(&self.run_loop);
        HOST_WAIT_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{HostWait, in_host_wait};
    use crate::VmRegistry;

    #[test]
    fn host_wait_nests() {
        let registry = VmRegistry::new();
        assert!(!in_host_wait());

        let outer = HostWait::enter(&registry);
        let inner = HostWait::enter(&registry);
        assert!(in_host_wait());

        drop(inner);
        assert!(in_host_wait());

        drop(outer);
        assert!(!in_host_wait());
    }
}
