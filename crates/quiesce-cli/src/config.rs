use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use miette::IntoDiagnostic;

/// Configuration of stress runs.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct StressConfig {
    /// Number of interrupt/resume cycles per scenario.
    #[knus(child, default = 1000, unwrap(argument))]
    pub iterations: usize,

    /// Number of idle VMs in the mixed scenarios.
    #[knus(child, default = 2, unwrap(argument))]
    pub idle_vms: usize,

    /// Number of active VMs in the mixed scenarios.
    #[knus(child, default = 3, unwrap(argument))]
    pub active_vms: usize,

    /// Argument of the `spin` function run by active VMs.
    #[knus(child, default = 100000, unwrap(argument))]
    pub spin_count: i64,

    /// Maximum time to wait for a VM to make progress, in milliseconds.
    #[knus(child, default = 10000, unwrap(argument))]
    pub ready_timeout_ms: u64,

    /// Scenarios to run (all of them if empty).
    #[knus(children(name = "run"))]
    pub runs: Vec<ScenarioRun>,
}

impl StressConfig {
    /// Maximum time to wait for a VM to make progress.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Scenario to run.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ScenarioRun {
    /// Name of the scenario.
    #[knus(argument)]
    pub name: String,
}

/// Parses a stress configuration, either inline or from a `.kdl` file.
pub fn parse_stress_config(config: &str) -> miette::Result<StressConfig> {
    let path = Path::new(config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", config)?
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{ScenarioRun, StressConfig, parse_stress_config};

    #[test]
    fn parse_defaults() {
        let config = knus::parse::<StressConfig>("<content>", "")
            .map_err(miette::Report::new)
            .expect("parse kdl");

        assert_eq!(
            config,
            StressConfig {
                iterations: 1000,
                idle_vms: 2,
                active_vms: 3,
                spin_count: 100000,
                ready_timeout_ms: 10000,
                runs: vec![],
            }
        );
    }

    #[test]
    fn parse_overrides_and_runs() {
        let config = knus::parse::<StressConfig>(
            "<content>",
            indoc::indoc! {r#"
                iterations 10
                idle-vms 1
                active-vms 4
                spin-count 500
                ready-timeout-ms 250
                run "idle-loops"
                run "single-step"
            "#},
        )
        .map_err(miette::Report::new)
        .expect("parse kdl");

        assert_eq!(
            config,
            StressConfig {
                iterations: 10,
                idle_vms: 1,
                active_vms: 4,
                spin_count: 500,
                ready_timeout_ms: 250,
                runs: vec![
                    ScenarioRun {
                        name: "idle-loops".to_owned()
                    },
                    ScenarioRun {
                        name: "single-step".to_owned()
                    },
                ],
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_nodes() {
        assert!(knus::parse::<StressConfig>("<content>", "verbose true").is_err());
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".kdl")
            .tempfile()
            .expect("tempfile");

        file.write_all(b"iterations 3\nrun \"context-switch\"\n")
            .expect("write config");

        let config = parse_stress_config(file.path().to_str().expect("utf-8 path"))
            .expect("parse config file");

        assert_eq!(config.iterations, 3);
        assert_eq!(
            config.runs,
            vec![ScenarioRun {
                name: "context-switch".to_owned()
            }]
        );

        // inline content is not mistaken for a path
        let config = parse_stress_config("active-vms 1").expect("parse inline");
        assert_eq!(config.active_vms, 1);
    }
}
