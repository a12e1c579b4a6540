use std::sync::{Arc, Weak};

use indexmap::IndexMap;

use super::{StopCause, StopReason, StopReply, WorldMode, WorldSnapshot};
use crate::run_loop::RunLoop;
use crate::thread::ThreadId;
use crate::vm::VmHandle;

/// Stop report waiting for every VM to acknowledge the stop.
pub(super) struct PendingStop {
    /// Thread responsible for the stop.
    pub thread_id: Option<ThreadId>,

    pub cause: StopCause,
}

/// Global state of the world, guarded by the registry lock.
pub(super) struct World {
    /// Live VMs, in registration order.
    pub vms: IndexMap<ThreadId, Weak<VmHandle>>,

    pub mode: WorldMode,

    /// Number of VMs in a stopped state.
    pub num_stopped: usize,

    /// Number of VMs inside guest code.
    pub num_active: usize,

    /// VM designated as the debuggee.
    pub target: Option<ThreadId>,

    /// Reason of the last world mode transition.
    pub last_reason: Option<StopReason>,

    pub pending: Option<PendingStop>,

    /// Number of stop replies published so far.
    pub replies: u64,

    pub last_reply: Option<StopReply>,

    /// Run loops of host threads currently waiting on the world.
    pub host_waiters: Vec<Arc<RunLoop>>,
}

impl World {
    pub fn new() -> Self {
        Self {
            vms: IndexMap::new(),
            mode: WorldMode::RunningAll,
            num_stopped: 0,
            num_active: 0,
            target: None,
            last_reason: None,
            pending: None,
            replies: 0,
            last_reply: None,
            host_waiters: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            mode: self.mode,
            number_of_vms: self.vms.len(),
            number_of_stopped_vms: self.num_stopped,
            number_of_active_vms: self.num_active,
            target_vm: self.target,
            stop_replies: self.replies,
            last_reason: self.last_reason,
        }
    }

    pub fn vm(&self, thread_id: ThreadId) -> Option<Arc<VmHandle>> {
        self.vms.get(&thread_id).and_then(Weak::upgrade)
    }

    pub fn live_vms(&self) -> Vec<Arc<VmHandle>> {
        self.vms.values().filter_map(Weak::upgrade).collect()
    }

    pub fn all_stopped(&self) -> bool {
        self.mode == WorldMode::Stopped && self.num_stopped == self.vms.len()
    }

    /// Keeps the current target if it is still live, otherwise designates a
    /// new one, preferring VMs inside guest code.
    pub fn pick_target(&mut self) {
        if self.target.is_some_and(|id| self.vms.contains_key(&id)) {
            return;
        }

        let vms = self.live_vms();

        self.target = vms
            .iter()
            .find(|vm| vm.is_entered())
            .or_else(|| vms.first())
            .map(|vm| vm.thread_id());
    }

    /// Publishes the pending stop report, if every VM acknowledged the stop.
    pub fn try_publish(&mut self) {
        if !self.all_stopped() {
            return;
        }

        let Some(pending) = self.pending.take() else {
            return;
        };

        let thread_id = pending
            .thread_id
            .filter(|id| self.vms.contains_key(id))
            .or(self.target);

        let stop_data = thread_id
            .and_then(|id| self.vm(id))
            .and_then(|vm| vm.debug_state().stop_data());

        self.replies += 1;

        let reply = StopReply {
            sequence: self.replies,
            thread_id,
            cause: pending.cause,
            stop_data,
        };

        tracing::info!(
            seq = reply.sequence,
            tid = thread_id.map(|id| id.as_u64()),
            cause = ?reply.cause,
            addr = stop_data.map(|data| tracing::field::display(data.address)),
            "stop reply"
        );

        self.last_reply = Some(reply);
    }
}
