use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::address::VirtualAddress;

/// Type of a breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointType {
    /// Breakpoint persisting across stops.
    Regular,

    /// Breakpoint cleared the first time it is hit, before the stop is
    /// reported.
    OneTime,
}

/// Breakpoint placed at some code address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    /// Type of the breakpoint.
    pub ty: BreakpointType,
}

impl Breakpoint {
    /// Creates a new breakpoint of the given type.
    pub const fn new(ty: BreakpointType) -> Self {
        Self { ty }
    }

    /// Creates a new regular breakpoint.
    pub const fn regular() -> Self {
        Self::new(BreakpointType::Regular)
    }

    /// Creates a new one-time breakpoint.
    pub const fn one_time() -> Self {
        Self::new(BreakpointType::OneTime)
    }
}

/// Table of breakpoints, shared by all VMs executing the same code.
///
/// # Note
///
/// Mutations are expected to happen while the world is stopped, but the
/// table stays memory-safe if VMs read it concurrently.
#[derive(Default)]
pub struct BreakpointManager {
    /// Breakpoints placed within guest code.
    bks: RwLock<HashMap<VirtualAddress, Breakpoint>>,

    /// Number of breakpoints, readable without locking.
    len: AtomicUsize,
}

impl BreakpointManager {
    /// Creates an empty breakpoint table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a breakpoint at the given address, replacing any previous one.
    pub fn set_breakpoint(&self, addr: VirtualAddress, breakpoint: Breakpoint) {
        let mut bks = self.bks.write();
        bks.insert(addr, breakpoint);
        self.len.store(bks.len(), Ordering::Release);

        tracing::debug!(%addr, ty = ?breakpoint.ty, "breakpoint set");
    }

    /// Removes the breakpoint at the given address, returning it.
    pub fn remove_breakpoint(&self, addr: VirtualAddress) -> Option<Breakpoint> {
        let mut bks = self.bks.write();
        let removed = bks.remove(&addr);
        self.len.store(bks.len(), Ordering::Release);

        if removed.is_some() {
            tracing::debug!(%addr, "breakpoint removed");
        }

        removed
    }

    /// Returns the breakpoint at the given address, if any.
    pub fn find_breakpoint(&self, addr: VirtualAddress) -> Option<Breakpoint> {
        if self.is_empty() {
            return None;
        }

        self.bks.read().get(&addr).copied()
    }

    /// Removes every breakpoint.
    pub fn clear_all_breakpoints(&self) {
        let mut bks = self.bks.write();
        bks.clear();
        self.len.store(0, Ordering::Release);

        tracing::debug!("breakpoints cleared");
    }

    /// Returns the number of breakpoints.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns whether the table holds no breakpoint.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the breakpoint at the given address, removing it if it is a
    /// one-time breakpoint.
    pub(crate) fn consume_breakpoint(&self, addr: VirtualAddress) -> Option<Breakpoint> {
        let bk = self.find_breakpoint(addr)?;

        if bk.ty == BreakpointType::OneTime {
            self.remove_breakpoint(addr);
        }

        Some(bk)
    }
}
