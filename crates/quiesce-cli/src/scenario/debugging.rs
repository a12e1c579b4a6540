use quiesce_debugger::{BreakpointType, StopCause, StopReply, VirtualAddress};
use quiesce_vm::{WorkerKind, workload};

use super::ScenarioError;
use super::stage::{Stage, check};

pub(super) fn context_switch(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    let mut vms = Vec::new();

    for _ in 0..stage.config.idle_vms {
        vms.push(stage.spawn(WorkerKind::Idle)?);
    }
    for _ in 0..stage.config.active_vms {
        vms.push(stage.spawn(stage.active())?);
    }

    for _ in 0..stage.config.iterations {
        stage.interrupt()?;

        for &vm in &vms {
            stage.handler.switch_target(vm)?;

            let debuggee = stage.handler.debuggee_vm().map(|vm| vm.thread_id());
            check(debuggee == Some(vm), || {
                format!("debuggee is {debuggee:?} instead of {vm}")
            })?;
        }

        stage.handler.resume();
    }

    Ok(())
}

pub(super) fn breakpoint_continue(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    for _ in 0..stage.config.idle_vms {
        stage.spawn(WorkerKind::Idle)?;
    }
    for _ in 0..stage.config.active_vms.max(1) {
        stage.spawn(stage.active())?;
    }

    stage.interrupt()?;
    let entry = break_on_tick(stage)?;

    for _ in 0..stage.config.iterations {
        continue_to_breakpoint(stage, entry)?;
    }

    Ok(())
}

pub(super) fn single_step(stage: &mut Stage<'_>) -> Result<(), ScenarioError> {
    for _ in 0..stage.config.idle_vms {
        stage.spawn(WorkerKind::Idle)?;
    }
    stage.spawn(stage.active())?;

    stage.interrupt()?;
    let entry = break_on_tick(stage)?;

    for _ in 0..stage.config.iterations {
        continue_to_breakpoint(stage, entry)?;

        // step over the breakpoint, then put it back
        let bk = stage.handler.breakpoint_manager().remove_breakpoint(entry);

        let replies = stage.handler.reply_count();
        stage.handler.step()?;

        let reply = stage.handler.last_stop_reply();
        check(stage.handler.reply_count() == replies + 1, || {
            format!("no stop reply after step: {reply:?}")
        })?;

        let reply = expect_reply(reply, StopCause::Step)?;
        let stop_data = reply.stop_data.filter(|data| {
            data.address != entry && data.breakpoint_type == Some(BreakpointType::OneTime)
        });
        check(stop_data.is_some(), || {
            format!("unexpected step stop: {reply:?}")
        })?;

        let state = stage.handler.debuggee_state_safe();
        check(state.is_some_and(|state| state.at_breakpoint()), || {
            format!("debuggee not stopped after step: {state:?}")
        })?;

        if let Some(bk) = bk {
            stage.handler.breakpoint_manager().set_breakpoint(entry, bk);
        }
    }

    Ok(())
}

fn break_on_tick(stage: &Stage<'_>) -> Result<VirtualAddress, ScenarioError> {
    let entry = stage.handler.set_breakpoint_at_entry(
        stage.instance.as_ref(),
        workload::TICK,
        BreakpointType::Regular,
    )?;

    Ok(entry)
}

/// Resumes the world, and waits for the next stop at the breakpoint.
fn continue_to_breakpoint(stage: &Stage<'_>, entry: VirtualAddress) -> Result<(), ScenarioError> {
    let replies = stage.handler.reply_count();

    stage.handler.resume();

    let reply = stage
        .handler
        .wait_for_stop_reply(replies, stage.config.ready_timeout());

    let reply = match reply {
        Some(reply) => expect_reply(Some(reply), StopCause::Breakpoint)?,
        None => {
            return Err(ScenarioError::Timeout {
                what: "breakpoint hit",
                timeout: stage.config.ready_timeout(),
            });
        }
    };

    check(
        reply.stop_data.map(|data| data.address) == Some(entry),
        || format!("stopped away from breakpoint {entry}: {reply:?}"),
    )?;

    stage.check_stopped()?;

    let state = stage.handler.debuggee_state_safe();
    check(state.is_some_and(|state| state.at_breakpoint()), || {
        format!("debuggee not at breakpoint: {state:?}")
    })
}

fn expect_reply(reply: Option<StopReply>, cause: StopCause) -> Result<StopReply, ScenarioError> {
    match reply {
        Some(reply) if reply.cause == cause => Ok(reply),
        _ => Err(ScenarioError::Check(format!(
            "expected {cause:?} stop reply, got {reply:?}"
        ))),
    }
}
