use quiesce_vm::WorkerKind;

use super::ScenarioError;
use super::stage::{Stage, check};

pub(super) fn enter_interrupt_resume(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    let vm = stage.spawn(stage.active())?;

    stage.wait_for("first run", || Ok(stage.runs_completed(vm)? > 0))?;

    for _ in 0..stage.config.iterations {
        stage.interrupt()?;
        stage.handler.resume();
    }

    let runs = stage.runs_completed(vm)?;
    stage.wait_for("run after resume", || Ok(stage.runs_completed(vm)? > runs))
}

pub(super) fn interrupt_enter_resume(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    let vm = stage.spawn(stage.on_demand())?;

    for round in 0..stage.config.iterations as u64 {
        stage.interrupt()?;

        let state = stage.handler.debuggee_state_safe();
        check(state.is_some_and(|state| state.stop_data.is_none()), || {
            format!("idle VM not stopped outside of guest code: {state:?}")
        })?;

        // the request is held back until resumed
        stage.signal_run(vm);
        check(stage.runs_completed(vm)? == round, || {
            "VM ran guest code while stopped".to_owned()
        })?;

        stage.handler.resume();

        stage.wait_for("run after resume", || {
            Ok(stage.runs_completed(vm)? == round + 1)
        })?;
    }

    Ok(())
}

pub(super) fn interrupt_resume_enter(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    let vm = stage.spawn(stage.on_demand())?;

    for round in 0..stage.config.iterations as u64 {
        stage.interrupt()?;
        stage.handler.resume();

        stage.signal_run(vm);
        stage.wait_for("run after resume", || {
            Ok(stage.runs_completed(vm)? == round + 1)
        })?;

        let info = stage.info();
        check(info.is_running() && info.number_of_stopped_vms == 0, || {
            format!("world not running after resume: {info:?}")
        })?;
    }

    Ok(())
}

pub(super) fn idle_loops(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    for _ in 0..stage.config.idle_vms.max(1) {
        stage.spawn(WorkerKind::Idle)?;
    }

    for _ in 0..stage.config.iterations {
        stage.interrupt()?;

        let info = stage.info();
        check(info.number_of_active_vms == 0, || {
            format!("idle VMs reported active: {info:?}")
        })?;

        stage.handler.resume();
    }

    Ok(())
}

pub(super) fn mixed_stress(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    for _ in 0..stage.config.idle_vms {
        stage.spawn(WorkerKind::Idle)?;
    }
    for _ in 0..stage.config.active_vms {
        stage.spawn(stage.active())?;
    }

    let vms = stage.config.idle_vms + stage.config.active_vms;
    let replies = stage.handler.reply_count();

    for _ in 0..stage.config.iterations {
        stage.interrupt()?;

        let info = stage.info();
        check(info.number_of_vms == vms, || {
            format!("expected {vms} VMs: {info:?}")
        })?;
        check(info.number_of_active_vms <= stage.config.active_vms, || {
            format!("idle VMs reported active: {info:?}")
        })?;

        stage.handler.resume();
    }

    let published = stage.handler.reply_count() - replies;
    check(published == stage.config.iterations as u64, || {
        format!("{published} stop replies for {} stops", stage.config.iterations)
    })
}
