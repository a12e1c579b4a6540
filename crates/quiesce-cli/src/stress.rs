use std::io::Write;
use std::time::Instant;

use miette::IntoDiagnostic;

use crate::config::StressConfig;
use crate::scenario::Scenario;

/// Runs the subcommand for stressing the stop-the-world coordination.
///
/// A report line is written for every scenario. Returns whether every
/// scenario passed.
pub fn evaluate_stress(config: &StressConfig, mut output: impl Write) -> miette::Result<bool> {
    let scenarios = if config.runs.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        config
            .runs
            .iter()
            .map(|run| run.name.parse::<Scenario>())
            .collect::<Result<Vec<_>, _>>()
            .into_diagnostic()?
    };

    let total = scenarios.len();
    let mut failures = 0;

    for scenario in scenarios {
        let start = Instant::now();
        let res = scenario.run(config);
        let elapsed = start.elapsed();

        match res {
            Ok(()) => {
                tracing::info!(%scenario, ?elapsed, "scenario passed");
                writeln!(output, "PASS {scenario} ({elapsed:.2?})").into_diagnostic()?;
            }
            Err(e) => {
                tracing::error!(%scenario, error = %e, "scenario failed");
                writeln!(output, "FAIL {scenario} ({elapsed:.2?}): {e}").into_diagnostic()?;
                failures += 1;
            }
        }
    }

    writeln!(output, "{total} scenario(s) run, {failures} failed").into_diagnostic()?;

    Ok(failures == 0)
}

/// Runs the subcommand for listing the available scenarios.
pub fn evaluate_list(mut output: impl Write) -> miette::Result<()> {
    for scenario in Scenario::ALL {
        writeln!(output, "{scenario}").into_diagnostic()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{evaluate_list, evaluate_stress};
    use crate::config::parse_stress_config;

    #[test]
    fn list_every_scenario() {
        let mut output = Vec::new();
        evaluate_list(&mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.lines().count(), 8);
        assert!(output.lines().any(|line| line == "mixed-stress"));
    }

    #[test]
    fn unknown_scenario_is_rejected() {
        let config = parse_stress_config(r#"run "nope""#).unwrap();
        assert!(evaluate_stress(&config, Vec::new()).is_err());
    }

    #[test]
    fn small_stress_run() {
        let config = parse_stress_config(indoc::indoc! {r#"
            iterations 5
            spin-count 1000
            run "mixed-stress"
            run "interrupt-enter-resume"
            run "single-step"
        "#})
        .unwrap();

        let mut output = Vec::new();
        assert!(evaluate_stress(&config, &mut output).unwrap());

        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("PASS mixed-stress"));
        assert!(output.contains("PASS single-step"));
        assert!(output.ends_with("3 scenario(s) run, 0 failed\n"));
    }
}
