use std::sync::Arc;
use std::time::{Duration, Instant};

use quiesce_debugger::{ExecutionHandler, StopReason, ThreadId, VmRegistry, WorldSnapshot};
use quiesce_vm::{Instance, ModuleManager, Worker, WorkerKind, workload};

use super::ScenarioError;
use crate::config::StressConfig;

/// World set up for a single scenario.
pub(super) struct Stage<'a> {
    pub config: &'a StressConfig,
    pub handler: ExecutionHandler,
    pub instance: Arc<Instance>,
    workers: Vec<Worker>,
}

impl<'a> Stage<'a> {
    pub fn new(config: &'a StressConfig) -> Result<Self, ScenarioError> {
        let module = workload::module().map_err(quiesce_vm::Error::from)?;
        let instance = ModuleManager::new().instantiate(Arc::new(module));

        Ok(Self {
            config,
            handler: ExecutionHandler::new(VmRegistry::new()),
            instance,
            workers: Vec::new(),
        })
    }

    pub fn info(&self) -> WorldSnapshot {
        self.handler.registry().info()
    }

    pub fn spawn(&mut self, kind: WorkerKind) -> Result<ThreadId, ScenarioError> {
        let worker = Worker::spawn(
            self.handler.registry(),
            self.instance.clone(),
            kind,
            self.config.ready_timeout(),
        )?;

        let thread_id = worker.thread_id();
        self.workers.push(worker);

        Ok(thread_id)
    }

    pub fn active(&self) -> WorkerKind {
        WorkerKind::Active {
            spin: self.config.spin_count,
        }
    }

    pub fn on_demand(&self) -> WorkerKind {
        WorkerKind::OnDemand {
            spin: self.config.spin_count,
        }
    }

    pub fn runs_completed(&self, thread_id: ThreadId) -> Result<u64, ScenarioError> {
        self.workers
            .iter()
            .find(|worker| worker.thread_id() == thread_id)
            .map(Worker::runs_completed)
            .ok_or_else(|| ScenarioError::Check(format!("no worker on thread {thread_id}")))
    }

    pub fn signal_run(&self, thread_id: ThreadId) {
        if let Some(worker) = self
            .workers
            .iter()
            .find(|worker| worker.thread_id() == thread_id)
        {
            worker.signal_run();
        }
    }

    /// Interrupts the world, and checks it is fully stopped.
    pub fn interrupt(&self) -> Result<(), ScenarioError> {
        self.handler.interrupt();
        self.check_stopped()
    }

    pub fn check_stopped(&self) -> Result<(), ScenarioError> {
        let info = self.info();

        check(info.all_stopped(), || format!("world not fully stopped: {info:?}"))?;
        check(info.number_of_active_vms <= info.number_of_vms, || {
            format!("more active VMs than VMs: {info:?}")
        })?;

        if info.number_of_vms > 0 {
            let debuggee = self
                .handler
                .debuggee_vm()
                .ok_or_else(|| ScenarioError::Check(format!("no debuggee: {info:?}")))?;

            check(debuggee.debug_state().is_stopped(), || {
                format!("debuggee {} is running", debuggee.thread_id())
            })?;
        }

        Ok(())
    }

    /// Polls until `cond` holds.
    pub fn wait_for(
        &self,
        what: &'static str,
        cond: impl Fn() -> Result<bool, ScenarioError>,
    ) -> Result<(), ScenarioError> {
        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;

        while !cond()? {
            if Instant::now() >= deadline {
                return Err(ScenarioError::Timeout { what, timeout });
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }

    /// Resumes the world, joins every worker, and checks nothing is left.
    pub fn teardown(mut self) -> Result<(), ScenarioError> {
        self.handler.breakpoint_manager().clear_all_breakpoints();
        self.handler
            .registry()
            .request_resume_all(StopReason::Teardown);

        for worker in self.workers.drain(..) {
            worker.stop()?;
        }

        self.handler.reset();

        let info = self.info();
        check(info.number_of_vms == 0, || format!("VMs left behind: {info:?}"))?;
        check(info.number_of_stopped_vms == 0, || {
            format!("stopped VMs left behind: {info:?}")
        })
    }
}

/// Fails with the given message if `cond` does not hold.
pub(super) fn check(cond: bool, message: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if cond {
        Ok(())
    } else {
        Err(ScenarioError::Check(message()))
    }
}
