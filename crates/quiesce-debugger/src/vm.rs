use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::address::VirtualAddress;
use crate::debug_state::{DebugState, Release};
use crate::error::Result;
use crate::registry::{BreakpointHit, VmRegistry};
use crate::run_loop::RunLoop;
use crate::suspension;
use crate::thread::ThreadId;

/// Options of a [Vm].
#[derive(Clone, Copy, Debug, Default)]
pub struct VmOptions {
    /// Whether the owning thread may never revisit guest execution, only
    /// servicing its run loop. Stop requests are then always delivered
    /// through the run loop, even while the VM is entered.
    pub may_idle_forever: bool,
}

/// Shared view of a [Vm], usable from any thread.
pub struct VmHandle {
    /// Thread owning the VM.
    thread_id: ThreadId,

    debug_state: DebugState,

    /// Whether the VM is inside guest code.
    entered: AtomicBool,

    may_idle_forever: bool,

    /// Set when the VM must check for a stop at its next safe point.
    trap: AtomicBool,

    /// Run loop of the owning thread.
    run_loop: Arc<RunLoop>,
}

impl VmHandle {
    /// Returns the thread owning the VM.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns the debug state of the VM.
    pub fn debug_state(&self) -> &DebugState {
        &self.debug_state
    }

    /// Returns whether the VM is inside guest code.
    pub fn is_entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }

    /// Returns whether the VM may stay inside guest code without reaching
    /// safe points.
    pub fn may_idle_forever(&self) -> bool {
        self.may_idle_forever
    }

    /// Returns the run loop of the owning thread.
    pub fn run_loop(&self) -> &Arc<RunLoop> {
        &self.run_loop
    }

    pub(crate) fn set_entered(&self, entered: bool) {
        self.entered.store(entered, Ordering::Release);
    }

    pub(crate) fn is_trap_armed(&self) -> bool {
        self.trap.load(Ordering::Acquire)
    }

    pub(crate) fn arm_trap(&self) {
        self.trap.store(true, Ordering::Release);
    }

    pub(crate) fn disarm_trap(&self) {
        self.trap.store(false, Ordering::Release);
    }
}

/// Virtual machine executing guest code on the thread that created it.
///
/// The VM is registered in a [VmRegistry] for its whole lifetime. An
/// execution engine is expected to call its hooks ([Vm::enter],
/// [Vm::function_entry] and [Vm::safe_point]) so the VM can be stopped.
pub struct Vm {
    handle: Arc<VmHandle>,
    registry: Arc<VmRegistry>,

    /// Nesting depth of guest code entries.
    depth: Cell<u32>,

    /// The VM is bound to its thread.
    _not_send: PhantomData<*const ()>,
}

impl Vm {
    /// Creates a VM owned by the calling thread, and registers it.
    ///
    /// # Errors
    ///
    /// Fails if the calling thread already owns a live VM in `registry`.
    pub fn new(registry: &Arc<VmRegistry>) -> Result<Self> {
        Self::with_options(registry, VmOptions::default())
    }

    /// Creates a VM with the given options.
    ///
    /// # Errors
    ///
    /// Fails if the calling thread already owns a live VM in `registry`.
    pub fn with_options(registry: &Arc<VmRegistry>, options: VmOptions) -> Result<Self> {
        let handle = Arc::new(VmHandle {
            thread_id: ThreadId::current(),
            debug_state: DebugState::new(),
            entered: AtomicBool::new(false),
            may_idle_forever: options.may_idle_forever,
            trap: AtomicBool::new(false),
            run_loop: RunLoop::current(),
        });

        registry.register(&handle)?;

        Ok(Self {
            handle,
            registry: registry.clone(),
            depth: Cell::new(0),
            _not_send: PhantomData,
        })
    }

    /// Returns the thread owning the VM.
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread_id
    }

    /// Returns the shared view of the VM.
    pub fn handle(&self) -> &Arc<VmHandle> {
        &self.handle
    }

    /// Returns the registry of the VM.
    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    /// Returns the debug state of the VM.
    pub fn debug_state(&self) -> &DebugState {
        &self.handle.debug_state
    }

    /// Returns whether the VM is inside guest code.
    pub fn is_entered(&self) -> bool {
        self.handle.is_entered()
    }

    /// Marks the VM as executing guest code until the returned scope is
    /// dropped.
    ///
    /// Entries nest. Entering and leaving the outermost scope are stop
    /// points, where the calling thread parks if the world is stopped.
    #[must_use = "the VM leaves guest code as soon as the scope is dropped"]
    pub fn enter(&self) -> EnteredScope<'_> {
        let depth = self.depth.get();
        self.depth.set(depth + 1);

        if depth == 0 {
            self.registry.notify_entered(&self.handle);

            if self.handle.is_trap_armed() {
                suspension::suspend(&self.registry, &self.handle, None);
            }
        }

        EnteredScope { vm: self }
    }

    /// Safe point reached before executing the opcode at `addr`.
    ///
    /// Parks the calling thread if the world is stopped.
    #[inline]
    pub fn safe_point(&self, addr: VirtualAddress) {
        if self.handle.is_trap_armed() {
            suspension::suspend(&self.registry, &self.handle, Some(addr));
        }
    }

    /// Safe point reached on entry of the function whose first opcode is at
    /// `addr`, also checking for a breakpoint there.
    pub fn function_entry(&self, addr: VirtualAddress) {
        let mut resumed_from_breakpoint = false;

        loop {
            if self.handle.is_trap_armed()
                && suspension::suspend(&self.registry, &self.handle, Some(addr))
                    == Some(Release::Step)
            {
                return;
            }

            if resumed_from_breakpoint
                || self.registry.breakpoints().find_breakpoint(addr).is_none()
            {
                return;
            }

            match self.registry.hit_breakpoint(&self.handle, addr) {
                BreakpointHit::Vanished => return,
                BreakpointHit::WorldStopping => {
                    if suspension::suspend(&self.registry, &self.handle, Some(addr))
                        == Some(Release::Step)
                    {
                        return;
                    }
                }
                BreakpointHit::Stopped => {
                    resumed_from_breakpoint = true;

                    if suspension::park(&self.handle) == Release::Step {
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle);
    }
}

/// Scope during which a [Vm] executes guest code.
pub struct EnteredScope<'a> {
    vm: &'a Vm,
}

impl Drop for EnteredScope<'_> {
    fn drop(&mut self) {
        let depth = self.vm.depth.get() - 1;
        self.vm.depth.set(depth);

        if depth == 0 {
            self.vm.registry.notify_exited(&self.vm.handle);

            // a stop requested while the VM was entered was not dispatched
            // through its run loop
            if self.vm.handle.is_trap_armed() {
                suspension::suspend(&self.vm.registry, &self.vm.handle, None);
            }
        }
    }
}
