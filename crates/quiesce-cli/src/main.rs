#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use quiesce_cli::{CliAction, CliOpts};

use tracing_subscriber::EnvFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("QUIESCE_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let res = match cli.action {
        CliAction::Stress { config } => evaluate_stress(&config),
        CliAction::List => quiesce_cli::evaluate_list(std::io::stdout()).map(|_| true),
    };

    match res {
        Ok(true) => (),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}

fn evaluate_stress(config: &str) -> miette::Result<bool> {
    let config = quiesce_cli::parse_stress_config(config)?;

    quiesce_cli::evaluate_stress(&config, std::io::stdout())
}
