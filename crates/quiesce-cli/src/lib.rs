//! Crate implementing the CLI commands.

mod cli;
mod config;
mod scenario;
mod stress;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{ScenarioRun, StressConfig, parse_stress_config};
pub use self::scenario::{Scenario, ScenarioError};
pub use self::stress::{evaluate_list, evaluate_stress};
