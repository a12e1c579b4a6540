use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel;
use quiesce_debugger::{RunLoop, ThreadId, Vm, VmOptions, VmRegistry};

use crate::error::{Error, Result};
use crate::interpreter::invoke;
use crate::manager::Instance;
use crate::workload;

/// Behavior of a [Worker].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    /// Never runs guest code, only services its run loop.
    Idle,

    /// Runs `spin(spin)` over and over, servicing its run loop in between.
    Active {
        /// Argument of `spin`.
        spin: i64,
    },

    /// Services its run loop, and runs `spin(spin)` once per
    /// [Worker::signal_run].
    OnDemand {
        /// Argument of `spin`.
        spin: i64,
    },
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Active { .. } => f.write_str("active"),
            Self::OnDemand { .. } => f.write_str("on-demand"),
        }
    }
}

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    run_requests: AtomicU64,
    runs_completed: AtomicU64,
}

/// Thread owning a VM registered in some [VmRegistry].
///
/// # Note
///
/// A worker parked in a stopped world cannot exit, so the world must be
/// resumed before calling [Worker::stop].
pub struct Worker {
    kind: WorkerKind,
    thread_id: ThreadId,
    run_loop: Arc<RunLoop>,
    shared: Arc<Shared>,
    join: Option<JoinHandle<Result<()>>>,
}

impl Worker {
    /// Spawns a worker, and waits until its VM is registered.
    pub fn spawn(
        registry: &Arc<VmRegistry>,
        instance: Arc<Instance>,
        kind: WorkerKind,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let shared = Arc::new(Shared::default());

        let join = std::thread::Builder::new()
            .name(format!("vm-{kind}"))
            .spawn({
                let registry = registry.clone();
                let shared = shared.clone();
                move || {
                    let options = VmOptions {
                        may_idle_forever: kind == WorkerKind::Idle,
                    };

                    let vm = match Vm::with_options(&registry, options) {
                        Ok(vm) => vm,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };

                    let _ = ready_tx.send(Ok((vm.thread_id(), RunLoop::current())));

                    run(&vm, &instance, kind, &shared)
                }
            })?;

        let (thread_id, run_loop) = ready_rx
            .recv_timeout(ready_timeout)
            .map_err(|_| Error::WorkerNotReady(ready_timeout))??;

        tracing::debug!(tid = %thread_id, %kind, "worker ready");

        Ok(Self {
            kind,
            thread_id,
            run_loop,
            shared,
            join: Some(join),
        })
    }

    /// Returns the behavior of this worker.
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Returns the thread owning the VM of this worker.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns the run loop of the worker thread.
    pub fn run_loop(&self) -> &Arc<RunLoop> {
        &self.run_loop
    }

    /// Asks an [WorkerKind::OnDemand] worker to run guest code once more.
    pub fn signal_run(&self) {
        self.shared.run_requests.fetch_add(1, Ordering::AcqRel);
        self.run_loop.wake();
    }

    /// Returns how many times guest code ran to completion.
    pub fn runs_completed(&self) -> u64 {
        self.shared.runs_completed.load(Ordering::Acquire)
    }

    /// Stops the worker, and waits for its thread to exit.
    ///
    /// Returns how many times guest code ran to completion.
    pub fn stop(mut self) -> Result<u64> {
        self.request_exit();

        if let Some(join) = self.join.take() {
            join.join().map_err(|_| Error::WorkerPanicked)??;
        }

        tracing::debug!(tid = %self.thread_id, kind = %self.kind, "worker stopped");

        Ok(self.runs_completed())
    }

    fn request_exit(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.run_loop.wake();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // the thread is detached if never stopped
        self.request_exit();
    }
}

fn run(vm: &Vm, instance: &Instance, kind: WorkerKind, shared: &Shared) -> Result<()> {
    let run_loop = RunLoop::current();
    let mut runs_started = 0;

    while !shared.stop.load(Ordering::Acquire) {
        match kind {
            WorkerKind::Idle => {
                run_loop.cycle();
            }
            WorkerKind::Active { spin } => {
                run_loop.service_pending();
                invoke(vm, instance, workload::SPIN, &[spin])?;
                shared.runs_completed.fetch_add(1, Ordering::AcqRel);
            }
            WorkerKind::OnDemand { spin } => {
                run_loop.cycle();

                if shared.run_requests.load(Ordering::Acquire) > runs_started {
                    runs_started += 1;
                    invoke(vm, instance, workload::SPIN, &[spin])?;
                    shared.runs_completed.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use quiesce_debugger::VmRegistry;
    use test_log::test;

    use super::{Worker, WorkerKind};
    use crate::{ModuleManager, workload};

    const READY: Duration = Duration::from_secs(10);

    #[test]
    fn on_demand_runs_when_signaled() {
        let registry = VmRegistry::new();
        let instance = ModuleManager::new().instantiate(Arc::new(workload::module().unwrap()));

        let worker =
            Worker::spawn(&registry, instance, WorkerKind::OnDemand { spin: 10 }, READY).unwrap();
        assert_eq!(registry.info().number_of_vms, 1);
        assert!(registry.owns_vm(worker.thread_id()));
        assert_eq!(worker.runs_completed(), 0);

        worker.signal_run();

        let deadline = Instant::now() + READY;
        while worker.runs_completed() == 0 {
            assert!(Instant::now() < deadline, "worker never ran");
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(worker.stop().unwrap(), 1);
        assert_eq!(registry.info().number_of_vms, 0);
    }

    #[test]
    fn idle_and_active_stop_cleanly() {
        let registry = VmRegistry::new();
        let instance = ModuleManager::new().instantiate(Arc::new(workload::module().unwrap()));

        let idle = Worker::spawn(&registry, instance.clone(), WorkerKind::Idle, READY).unwrap();
        let active =
            Worker::spawn(&registry, instance, WorkerKind::Active { spin: 100 }, READY).unwrap();
        assert_eq!(registry.info().number_of_vms, 2);

        assert_eq!(idle.stop().unwrap(), 0);
        active.stop().unwrap();
        assert_eq!(registry.info().number_of_vms, 0);
    }
}
