use parking_lot::{Condvar, Mutex};

use crate::address::VirtualAddress;
use crate::breakpoint::BreakpointType;

/// Execution state of a single VM, from the debugger's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// The VM is allowed to execute guest code.
    Running,

    /// The VM is stopped.
    Stopped,

    /// The VM is stopped at a breakpoint (or after a single step).
    StoppedAtBreakpoint,
}

/// Location at which a VM stopped within guest code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopData {
    /// Address of the next opcode to execute.
    pub address: VirtualAddress,

    /// Type of the breakpoint responsible for the stop, if any.
    pub breakpoint_type: Option<BreakpointType>,
}

/// Point-in-time copy of a [DebugState].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugStateSnapshot {
    /// State of the VM.
    pub state: State,

    /// Stop location, only present while stopped within guest code.
    pub stop_data: Option<StopData>,
}

impl DebugStateSnapshot {
    /// Returns whether the VM is running.
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Returns whether the VM is stopped (at a breakpoint or not).
    pub fn is_stopped(&self) -> bool {
        !self.is_running()
    }

    /// Returns whether the VM is stopped at a breakpoint.
    pub fn at_breakpoint(&self) -> bool {
        self.state == State::StoppedAtBreakpoint
    }
}

/// How a parked VM was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// The VM may run freely.
    Resume,

    /// The VM may execute a single opcode, then stop again.
    Step,
}

/// Debug state embedded in each VM.
///
/// The owning thread parks on it while stopped, the coordinator releases it.
pub struct DebugState {
    inner: Mutex<Inner>,
    released: Condvar,
}

struct Inner {
    state: State,
    stop_data: Option<StopData>,
    release: Release,

    /// Whether the VM was released to execute a single opcode.
    stepping: bool,
}

impl DebugState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Running,
                stop_data: None,
                release: Release::Resume,
                stepping: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> DebugStateSnapshot {
        let inner = self.inner.lock();

        DebugStateSnapshot {
            state: inner.state,
            stop_data: inner.stop_data,
        }
    }

    /// Returns whether the VM is running.
    pub fn is_running(&self) -> bool {
        self.inner.lock().state == State::Running
    }

    /// Returns whether the VM is stopped (at a breakpoint or not).
    pub fn is_stopped(&self) -> bool {
        !self.is_running()
    }

    /// Returns whether the VM is stopped at a breakpoint.
    pub fn at_breakpoint(&self) -> bool {
        self.inner.lock().state == State::StoppedAtBreakpoint
    }

    /// Returns the stop location, if stopped within guest code.
    pub fn stop_data(&self) -> Option<StopData> {
        self.inner.lock().stop_data
    }

    /// Moves the VM into a stopped state, ending any pending single step.
    pub(crate) fn stop(&self, at_breakpoint: bool, stop_data: Option<StopData>) {
        let mut inner = self.inner.lock();

        inner.state = if at_breakpoint {
            State::StoppedAtBreakpoint
        } else {
            State::Stopped
        };
        inner.stop_data = stop_data;
        inner.stepping = false;
    }

    /// Returns whether the VM was released for a single step and has not
    /// stopped since.
    pub(crate) fn is_stepping(&self) -> bool {
        self.inner.lock().stepping
    }

    /// Moves the VM back to running, waking up its owning thread if parked.
    ///
    /// Returns whether the VM was stopped.
    pub(crate) fn release(&self, how: Release) -> bool {
        let mut inner = self.inner.lock();

        let was_stopped = inner.state != State::Running;

        inner.state = State::Running;
        inner.stop_data = None;
        inner.release = how;
        inner.stepping = how == Release::Step;

        self.released.notify_all();

        was_stopped
    }

    /// Blocks the calling thread until the VM is released.
    pub(crate) fn park(&self) -> Release {
        let mut inner = self.inner.lock();

        while inner.state != State::Running {
            self.released.wait(&mut inner);
        }

        inner.release
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use test_log::test;

    use super::{DebugState, Release, State, StopData};
    use crate::{BreakpointType, VirtualAddress};

    #[test]
    fn stop_and_release() {
        let state = DebugState::new();
        assert!(state.is_running());
        assert_eq!(state.stop_data(), None);

        let data = StopData {
            address: VirtualAddress::from_parts(0, 4),
            breakpoint_type: Some(BreakpointType::Regular),
        };

        state.stop(true, Some(data));
        assert!(state.is_stopped());
        assert!(state.at_breakpoint());
        assert_eq!(state.snapshot().state, State::StoppedAtBreakpoint);
        assert_eq!(state.stop_data(), Some(data));

        assert!(state.release(Release::Resume));
        assert!(state.is_running());
        assert_eq!(state.stop_data(), None);
        assert!(!state.release(Release::Resume));
    }

    #[test]
    fn step_release_sets_stepping() {
        let state = DebugState::new();

        state.stop(false, None);
        assert!(!state.is_stepping());

        state.release(Release::Step);
        assert!(state.is_stepping());

        state.stop(true, None);
        assert!(!state.is_stepping());

        // a resume abandons the step
        state.stop(false, None);
        state.release(Release::Step);
        state.release(Release::Resume);
        assert!(!state.is_stepping());
    }

    #[test]
    fn park_until_released() {
        let state = Arc::new(DebugState::new());
        state.stop(false, None);

        let parked = std::thread::spawn({
            let state = state.clone();
            move || state.park()
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!parked.is_finished());

        state.release(Release::Step);
        assert_eq!(parked.join().unwrap(), Release::Step);
    }

    #[test]
    fn park_returns_immediately_when_running() {
        let state = DebugState::new();
        assert_eq!(state.park(), Release::Resume);
    }
}
