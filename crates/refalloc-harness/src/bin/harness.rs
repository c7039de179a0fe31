//! CLI entrypoint for the refalloc verification harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use refalloc_harness::scenarios::{self, SCENARIOS, Scenario};
use refalloc_harness::{LogEmitter, run_scenarios};

/// Lifecycle verification for the refalloc allocation facade.
#[derive(Debug, Parser)]
#[command(name = "refalloc-harness")]
#[command(about = "Lifecycle verification harness for refalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available scenarios.
    List,
    /// Run scenarios and report pass/fail.
    Run {
        /// Run only this scenario (default: all).
        #[arg(long)]
        scenario: Option<String>,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in SCENARIOS {
                println!("{:<22} {}", scenario.name, scenario.description);
            }
        }
        Command::Run { scenario, log } => {
            let selected: Vec<&Scenario> = match scenario {
                Some(name) => vec![scenarios::find(&name)?],
                None => SCENARIOS.iter().collect(),
            };
            let run_id = format!("run-{}", std::process::id());
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::sink(&run_id),
            };

            eprintln!("Running {} scenario(s)...", selected.len());
            let reports = run_scenarios(&selected, &mut emitter)?;

            let mut failed = 0usize;
            for report in &reports {
                match &report.error {
                    None => println!("PASS {} ({} ms)", report.name, report.duration_ms),
                    Some(error) => {
                        failed += 1;
                        println!("FAIL {}: {error}", report.name);
                    }
                }
            }
            if let Some(path) = &log {
                eprintln!("Log written to {}", path.display());
            }
            eprintln!("{} passed, {failed} failed", reports.len() - failed);
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
