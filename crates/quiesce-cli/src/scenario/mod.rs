mod debugging;
mod interleavings;
mod stage;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::StressConfig;

use self::stage::Stage;

/// Stop-the-world scenario, run against real VM threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// A VM inside guest code is interrupted, then resumed.
    EnterInterruptResume,

    /// An idle VM is interrupted, asked to run guest code, then resumed.
    InterruptEnterResume,

    /// An idle VM is interrupted and resumed, then runs guest code.
    InterruptResumeEnter,

    /// Idle VMs only, interrupted and resumed in a loop.
    IdleLoops,

    /// Idle and active VMs, interrupted and resumed in a loop.
    MixedStress,

    /// Every VM becomes the debuggee in turn.
    ContextSwitch,

    /// A breakpoint is hit over and over.
    BreakpointContinue,

    /// The debuggee steps away from a breakpoint.
    SingleStep,
}

impl Scenario {
    /// Every scenario, in running order.
    pub const ALL: [Self; 8] = [
        Self::EnterInterruptResume,
        Self::InterruptEnterResume,
        Self::InterruptResumeEnter,
        Self::IdleLoops,
        Self::MixedStress,
        Self::ContextSwitch,
        Self::BreakpointContinue,
        Self::SingleStep,
    ];

    /// Returns the name of the scenario.
    pub const fn name(self) -> &'static str {
        match self {
            Self::EnterInterruptResume => "enter-interrupt-resume",
            Self::InterruptEnterResume => "interrupt-enter-resume",
            Self::InterruptResumeEnter => "interrupt-resume-enter",
            Self::IdleLoops => "idle-loops",
            Self::MixedStress => "mixed-stress",
            Self::ContextSwitch => "context-switch",
            Self::BreakpointContinue => "breakpoint-continue",
            Self::SingleStep => "single-step",
        }
    }

    /// Runs the scenario.
    #[tracing::instrument(name = "Scenario", skip_all, fields(name = self.name()))]
    pub fn run(self, config: &StressConfig) -> Result<(), ScenarioError> {
        let mut stage = Stage::new(config)?;

        let res = match self {
            Self::EnterInterruptResume => interleavings::enter_interrupt_resume(&mut stage),
            Self::InterruptEnterResume => interleavings::interrupt_enter_resume(&mut stage),
            Self::InterruptResumeEnter => interleavings::interrupt_resume_enter(&mut stage),
            Self::IdleLoops => interleavings::idle_loops(&mut stage),
            Self::MixedStress => interleavings::mixed_stress(&mut stage),
            Self::ContextSwitch => debugging::context_switch(&mut stage),
            Self::BreakpointContinue => debugging::breakpoint_continue(&mut stage),
            Self::SingleStep => debugging::single_step(&mut stage),
        };

        // the world is torn down even after a failed check
        let teardown = stage.teardown();

        res.and(teardown)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| ScenarioError::UnknownScenario(s.to_owned()))
    }
}

/// Error of a scenario run.
#[derive(thiserror::Error, Debug)]
pub enum ScenarioError {
    /// No scenario has this name.
    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),

    /// Engine error.
    #[error(transparent)]
    Vm(#[from] quiesce_vm::Error),

    /// Debugger error.
    #[error(transparent)]
    Debugger(#[from] quiesce_debugger::Error),

    /// The world is not in the expected state.
    #[error("check failed: {0}")]
    Check(String),

    /// Some progress did not happen in time.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// Awaited progress.
        what: &'static str,

        /// Time waited.
        timeout: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::Scenario;

    #[test]
    fn names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }

        assert!("nope".parse::<Scenario>().is_err());
    }
}
