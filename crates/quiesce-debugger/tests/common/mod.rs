// not every test target uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use quiesce_debugger::{ExecutionHandler, StopReason, ThreadId, VmRegistry, WorldSnapshot};
use quiesce_vm::{Instance, ModuleManager, Worker, WorkerKind, workload};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Isolated world with its own registry, handler and worker threads.
pub struct Harness {
    pub handler: ExecutionHandler,
    pub instance: Arc<Instance>,
    pub workers: Vec<Worker>,
}

impl Harness {
    pub fn new() -> Self {
        let manager = ModuleManager::new();
        let module = workload::module().expect("workload module");

        Self {
            handler: ExecutionHandler::new(VmRegistry::new()),
            instance: manager.instantiate(Arc::new(module)),
            workers: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        self.handler.registry()
    }

    pub fn info(&self) -> WorldSnapshot {
        self.registry().info()
    }

    pub fn spawn(&mut self, kind: WorkerKind) -> ThreadId {
        let worker = Worker::spawn(self.registry(), self.instance.clone(), kind, TIMEOUT)
            .expect("spawn worker");
        let thread_id = worker.thread_id();

        self.workers.push(worker);

        thread_id
    }

    pub fn worker(&self, thread_id: ThreadId) -> &Worker {
        self.workers
            .iter()
            .find(|worker| worker.thread_id() == thread_id)
            .expect("unknown worker")
    }

    /// Polls the world until `cond` holds.
    pub fn wait_until(&self, what: &str, cond: impl Fn(&WorldSnapshot) -> bool) {
        wait_until(what, || cond(&self.info()));
    }

    /// Checks the world is fully stopped, with a stopped debuggee.
    pub fn assert_stopped(&self) {
        let info = self.info();

        assert!(info.is_stopped(), "{info:?}");
        assert_eq!(info.number_of_stopped_vms, info.number_of_vms, "{info:?}");
        assert!(info.number_of_active_vms <= info.number_of_vms, "{info:?}");

        if info.number_of_vms > 0 {
            let debuggee = self.handler.debuggee_vm().expect("debuggee");
            assert_eq!(Some(debuggee.thread_id()), info.target_vm);
            assert!(debuggee.debug_state().is_stopped());
        }
    }

    /// Resumes the world, joins every worker, and checks nothing is left.
    pub fn teardown(mut self) {
        // otherwise resumed VMs would stop the world again
        self.handler.breakpoint_manager().clear_all_breakpoints();
        self.registry().request_resume_all(StopReason::Teardown);

        for worker in self.workers.drain(..) {
            worker.stop().expect("stop worker");
        }

        self.wait_until("every VM gone", |info| info.number_of_vms == 0);

        self.handler.reset();

        let info = self.info();
        assert!(info.is_running());
        assert_eq!(info.number_of_stopped_vms, 0);
        assert_eq!(info.number_of_active_vms, 0);
        assert_eq!(info.target_vm, None);
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;

    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
