mod builder;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use self::builder::Builder;
use crate::address::{CodeInstance, FunctionSpaceIndex, VirtualAddress};
use crate::breakpoint::{Breakpoint, BreakpointManager, BreakpointType};
use crate::debug_state::DebugStateSnapshot;
use crate::error::{Error, Result};
use crate::registry::{
    StopReason, StopReply, VmRegistry, WorldSnapshot, stall_deadline, warn_stall,
};
use crate::suspension::HostWait;
use crate::thread::ThreadId;
use crate::vm::VmHandle;

/// Configuration of an [ExecutionHandler].
#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    /// Thread servicing its own run loop while waiting on the world.
    pub host_thread: ThreadId,

    /// Maximum time the host thread waits for callbacks before re-checking
    /// the world.
    pub host_poll_interval: Duration,

    /// Time without progress after which a wait logs a warning.
    pub stall_warning: Duration,
}

/// Phase of the debugging session, as driven by an [ExecutionHandler].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Every VM is allowed to run.
    RunningAll,

    /// Waiting for every VM to acknowledge a stop.
    Stopping,

    /// Every VM is stopped.
    Stopped,

    /// Waiting for the debuggee to complete a single step.
    Stepping,

    /// Releasing every VM.
    Resuming,
}

impl SessionPhase {
    fn enter(&mut self, next: Self) {
        if *self != next {
            tracing::debug!(from = ?*self, to = ?next, "session phase");
        }

        *self = next;
    }
}

/// Debugger-facing controller of the world.
///
/// Operations are serialized: at most one of them runs at any time.
pub struct ExecutionHandler {
    registry: Arc<VmRegistry>,
    config: HandlerConfig,

    /// Session lock, taken for the whole duration of an operation.
    phase: Mutex<SessionPhase>,
}

impl ExecutionHandler {
    /// Creates a handler driving the VMs of `registry`, with the calling
    /// thread as host thread.
    pub fn new(registry: Arc<VmRegistry>) -> Self {
        Self::builder(registry).build()
    }

    /// Creates a handler builder.
    pub fn builder(registry: Arc<VmRegistry>) -> Builder {
        Builder::new(registry)
    }

    /// Returns the registry driven by this handler.
    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    /// Returns the configuration of this handler.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Returns the phase of the debugging session.
    ///
    /// Blocks while another operation is in progress.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    /// Returns the breakpoint table shared by the driven VMs.
    pub fn breakpoint_manager(&self) -> &BreakpointManager {
        self.registry.breakpoints()
    }

    /// Stops the world, and waits until every VM acknowledged the stop.
    ///
    /// Does nothing more than waiting if the world is already stopped.
    #[tracing::instrument(name = "Interrupt", skip_all)]
    pub fn interrupt(&self) {
        let mut phase = self.phase.lock();

        if !self.registry.request_stop_all(StopReason::Debugger) {
            tracing::debug!("world already stopped");
        }

        phase.enter(SessionPhase::Stopping);

        // a forced resume of the registry (e.g., a teardown) also ends the wait
        self.wait_for(None, |info| !info.is_stopped() || info.all_stopped());

        let info = self.registry.info();

        phase.enter(if info.is_stopped() {
            SessionPhase::Stopped
        } else {
            SessionPhase::RunningAll
        });

        tracing::info!(
            vms = info.number_of_vms,
            active = info.number_of_active_vms,
            target = info.target_vm.map(|id| id.as_u64()),
            "world stopped"
        );
    }

    /// Resumes every VM.
    ///
    /// Does not wait for VMs to actually execute guest code again.
    #[tracing::instrument(name = "Resume", skip_all)]
    pub fn resume(&self) {
        let mut phase = self.phase.lock();
        phase.enter(SessionPhase::Resuming);

        if !self.registry.request_resume_all(StopReason::Debugger) {
            tracing::debug!("world already running");
        }

        phase.enter(SessionPhase::RunningAll);
    }

    /// Lets the debuggee execute a single opcode, and waits until it stopped
    /// again.
    ///
    /// # Errors
    ///
    /// Fails if the world is not stopped, or if the debuggee is not stopped
    /// within guest code.
    #[tracing::instrument(name = "Step", skip_all)]
    pub fn step(&self) -> Result<()> {
        let mut phase = self.phase.lock();

        let replies = self
            .registry
            .release_for_step()
            .inspect_err(|e| tracing::error!(error = %e, "cannot single-step"))?;

        phase.enter(SessionPhase::Stepping);

        self.wait_for(None, |info| !info.is_stopped() || info.stop_replies > replies);

        phase.enter(if self.registry.info().is_stopped() {
            SessionPhase::Stopped
        } else {
            SessionPhase::RunningAll
        });

        if let Some(reply) = self.registry.last_stop_reply() {
            tracing::debug!(
                seq = reply.sequence,
                addr = reply.stop_data.map(|data| tracing::field::display(data.address)),
                "stepped"
            );
        }

        Ok(())
    }

    /// Designates the VM owned by `thread_id` as the debuggee.
    ///
    /// # Errors
    ///
    /// Fails if the world is not stopped, or if the thread does not own a
    /// live and stopped VM.
    #[tracing::instrument(name = "SwitchTarget", skip(self))]
    pub fn switch_target(&self, thread_id: ThreadId) -> Result<()> {
        let _phase = self.phase.lock();

        self.registry
            .switch_target(thread_id)
            .inspect_err(|e| tracing::error!(error = %e, "cannot switch target"))
    }

    /// Places a breakpoint on the first opcode of a function.
    ///
    /// Returns the address of the breakpoint.
    ///
    /// # Errors
    ///
    /// Fails if the world is not stopped, or if the function cannot be
    /// resolved.
    #[tracing::instrument(name = "SetBreakpoint", skip(self, instance))]
    pub fn set_breakpoint_at_entry<I>(
        &self,
        instance: &I,
        function: FunctionSpaceIndex,
        ty: BreakpointType,
    ) -> Result<VirtualAddress>
    where
        I: CodeInstance + ?Sized,
    {
        let _phase = self.phase.lock();

        if !self.registry.info().is_stopped() {
            tracing::error!("cannot set breakpoint while running");
            return Err(Error::WorldNotStopped);
        }

        let addr = instance.entry_address(function).ok_or_else(|| {
            let e = Error::UnknownFunction {
                instance_id: instance.instance_id(),
                function,
            };
            tracing::error!(error = %e, "cannot set breakpoint");
            e
        })?;

        self.registry
            .breakpoints()
            .set_breakpoint(addr, Breakpoint::new(ty));

        Ok(addr)
    }

    /// Returns the VM designated as the debuggee, if still alive.
    pub fn debuggee_vm(&self) -> Option<Arc<VmHandle>> {
        self.registry.target_vm()
    }

    /// Returns the debug state of the debuggee, if any.
    pub fn debuggee_state_safe(&self) -> Option<DebugStateSnapshot> {
        self.debuggee_vm().map(|vm| vm.debug_state().snapshot())
    }

    /// Returns the number of stop replies published so far.
    pub fn reply_count(&self) -> u64 {
        self.registry.info().stop_replies
    }

    /// Returns the last published stop reply.
    pub fn last_stop_reply(&self) -> Option<StopReply> {
        self.registry.last_stop_reply()
    }

    /// Waits until more than `after` stop replies were published, returning
    /// the last one.
    ///
    /// Returns `None` on timeout.
    pub fn wait_for_stop_reply(&self, after: u64, timeout: Duration) -> Option<StopReply> {
        self.wait_for(Some(timeout), |info| info.stop_replies > after)
            .then(|| self.registry.last_stop_reply())
            .flatten()
    }

    /// Ends the debugging session, resuming the world if still stopped.
    ///
    /// Can be called any number of times.
    #[tracing::instrument(name = "Reset", skip_all)]
    pub fn reset(&self) {
        let mut phase = self.phase.lock();

        if self.registry.request_resume_all(StopReason::Teardown) {
            tracing::warn!(phase = ?*phase, "world was still stopped, resumed");
        }

        self.registry.reset_session();

        phase.enter(SessionPhase::RunningAll);
    }

    fn wait_for(&self, timeout: Option<Duration>, done: impl Fn(&WorldSnapshot) -> bool) -> bool {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let current = ThreadId::current();

        if current == self.config.host_thread || self.registry.owns_vm(current) {
            self.wait_cooperatively(deadline, done)
        } else {
            self.registry
                .wait_until(deadline, self.config.stall_warning, done)
        }
    }

    /// Waits while servicing the run loop of the calling thread, so that
    /// callbacks dispatched onto it cannot deadlock the wait.
    fn wait_cooperatively(
        &self,
        deadline: Option<Instant>,
        done: impl Fn(&WorldSnapshot) -> bool,
    ) -> bool {
        let host_wait = HostWait::enter(&self.registry);

        // the caller's own VM may be inside guest code, away from safe points
        if let Some(vm) = self.registry.vm(ThreadId::current()) {
            self.registry.acknowledge_stop(&vm, None);
        }

        let mut next_warning = stall_deadline(Instant::now(), self.config.stall_warning);

        loop {
            let info = self.registry.info();

            if done(&info) {
                return true;
            }

            let now = Instant::now();

            if deadline.is_some_and(|deadline| now >= deadline) {
                return false;
            }

            if next_warning.is_some_and(|at| now >= at) {
                warn_stall(&info);
                next_warning = stall_deadline(now, self.config.stall_warning);
            }

            let slice = deadline.map_or(self.config.host_poll_interval, |deadline| {
                self.config.host_poll_interval.min(deadline - now)
            });

            host_wait.run_loop().cycle_timeout(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::{ExecutionHandler, SessionPhase};
    use crate::{Error, FunctionSpaceIndex, ThreadId, VirtualAddress, Vm, VmRegistry};
    use crate::{BreakpointType, CodeInstance};

    struct FakeInstance;

    impl CodeInstance for FakeInstance {
        fn instance_id(&self) -> u32 {
            7
        }

        fn entry_address(&self, function: FunctionSpaceIndex) -> Option<VirtualAddress> {
            (function.0 < 2).then(|| VirtualAddress::from_parts(7, function.0 * 16))
        }
    }

    #[test]
    fn interrupt_with_no_vm() {
        let handler = ExecutionHandler::new(VmRegistry::new());

        handler.interrupt();
        assert!(handler.registry().info().all_stopped());
        assert_eq!(handler.reply_count(), 1);
        assert_eq!(handler.debuggee_vm().map(|vm| vm.thread_id()), None);

        // idempotent
        handler.interrupt();
        assert_eq!(handler.reply_count(), 1);

        handler.resume();
        handler.resume();
        assert!(handler.registry().info().is_running());
    }

    #[test]
    fn interrupt_stops_host_owned_vm() {
        let registry = VmRegistry::new();
        let vm = Vm::new(&registry).unwrap();
        let handler = ExecutionHandler::new(registry);

        handler.interrupt();

        let info = handler.registry().info();
        assert!(info.all_stopped());
        assert_eq!(info.target_vm, Some(vm.thread_id()));
        assert!(vm.debug_state().is_stopped());

        handler.resume();
        assert!(vm.debug_state().is_running());

        // the stale callback dispatched by the interrupt does nothing
        crate::RunLoop::current().service_pending();
        assert!(vm.debug_state().is_running());
        assert_eq!(handler.registry().info().number_of_stopped_vms, 0);
    }

    #[test]
    fn misuse_while_running() {
        let handler = ExecutionHandler::new(VmRegistry::new());

        assert_eq!(handler.step(), Err(Error::WorldNotStopped));
        assert_eq!(
            handler.switch_target(ThreadId::current()),
            Err(Error::WorldNotStopped)
        );
        assert_eq!(
            handler.set_breakpoint_at_entry(
                &FakeInstance,
                FunctionSpaceIndex(0),
                BreakpointType::Regular
            ),
            Err(Error::WorldNotStopped)
        );
    }

    #[test]
    fn misuse_while_stopped() {
        let registry = VmRegistry::new();
        let vm = Vm::new(&registry).unwrap();
        let handler = ExecutionHandler::new(registry);

        handler.interrupt();

        // stopped outside of guest code
        assert_eq!(handler.step(), Err(Error::NoGuestFrame(vm.thread_id())));

        let stranger = std::thread::spawn(ThreadId::current).join().unwrap();
        assert_eq!(
            handler.switch_target(stranger),
            Err(Error::UnknownThread(stranger))
        );
        assert_eq!(handler.switch_target(vm.thread_id()), Ok(()));

        assert_eq!(
            handler.set_breakpoint_at_entry(
                &FakeInstance,
                FunctionSpaceIndex(5),
                BreakpointType::Regular
            ),
            Err(Error::UnknownFunction {
                instance_id: 7,
                function: FunctionSpaceIndex(5)
            })
        );

        let addr = handler
            .set_breakpoint_at_entry(&FakeInstance, FunctionSpaceIndex(1), BreakpointType::OneTime)
            .unwrap();
        assert_eq!(addr, VirtualAddress::from_parts(7, 16));
        assert_eq!(handler.breakpoint_manager().len(), 1);

        handler.reset();
        handler.reset();
        assert!(handler.registry().info().is_running());
        assert_eq!(handler.registry().info().target_vm, None);
    }

    #[test]
    fn session_phase_follows_operations() {
        let registry = VmRegistry::new();
        let _vm = Vm::new(&registry).unwrap();
        let handler = ExecutionHandler::new(registry);
        assert_eq!(handler.phase(), SessionPhase::RunningAll);

        handler.interrupt();
        assert_eq!(handler.phase(), SessionPhase::Stopped);

        handler.resume();
        assert_eq!(handler.phase(), SessionPhase::RunningAll);

        handler.interrupt();
        handler.reset();
        assert_eq!(handler.phase(), SessionPhase::RunningAll);
    }

    #[test]
    fn unbounded_stall_warning() {
        let registry = VmRegistry::new();

        // cooperative wait
        let vm = Vm::new(&registry).unwrap();
        let handler = ExecutionHandler::builder(registry.clone())
            .with_stall_warning(Duration::MAX)
            .build();

        handler.interrupt();
        assert!(handler.registry().info().all_stopped());
        handler.resume();
        drop(vm);

        // blocking wait
        let elsewhere = std::thread::spawn(ThreadId::current).join().unwrap();
        let handler = ExecutionHandler::builder(registry)
            .with_host_thread(elsewhere)
            .with_stall_warning(Duration::MAX)
            .build();

        handler.interrupt();
        assert!(handler.registry().info().all_stopped());

        let replies = handler.reply_count();
        assert_eq!(
            handler.wait_for_stop_reply(replies, Duration::from_millis(10)),
            None
        );

        handler.resume();
        assert!(handler.registry().info().is_running());
    }

    #[test]
    fn wait_for_stop_reply_times_out() {
        let handler = ExecutionHandler::builder(VmRegistry::new())
            .with_host_poll_interval(Duration::from_millis(2))
            .build();

        assert_eq!(
            handler.wait_for_stop_reply(0, Duration::from_millis(20)),
            None
        );

        handler.interrupt();

        let reply = handler
            .wait_for_stop_reply(0, Duration::from_millis(20))
            .unwrap();
        assert_eq!(reply.sequence, 1);
        assert_eq!(reply.cause, crate::StopCause::Interrupt);
    }
}
