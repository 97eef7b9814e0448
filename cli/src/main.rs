//! tailprobe CLI binary
//!
//! Runs the application under test once, as described by a harness
//! configuration file, and reports what happened.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tailprobe_core::config::load_config_from_toml_path;
use tailprobe_core::{CoreError, HarnessConfig, RunController, RunMode, RunReport};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "tailprobe")]
#[command(about = "Launch a terminal app under a test environment and tail its debug log")]
#[command(version)]
struct Cli {
    /// Harness configuration (TOML). The interactive refresh-debug preset is used when omitted.
    #[arg(long, env = "TAILPROBE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset; overrides the file's logLevel
    #[arg(long)]
    log_level: Option<String>,
}

fn resolve_config(path: Option<&PathBuf>) -> anyhow::Result<HarnessConfig> {
    match path {
        Some(path) => load_config_from_toml_path(path)
            .with_context(|| format!("loading harness config from {}", path.display())),
        None => Ok(HarnessConfig::refresh_debug()),
    }
}

fn print_summary(report: &RunReport) {
    match report.mode {
        RunMode::TimedSample { .. } => {
            if report.survived() {
                println!("\nApplication started successfully!");
            } else if let Some(status) = report.exited_early {
                println!("\nApplication exited before the sample ended: {}", status);
            }
        }
        RunMode::Interactive => println!("\nStopping test..."),
    }

    if let Some(status) = report.exit_status {
        println!("Target {} stopped: {}", report.pid.unwrap_or_default(), status);
    }
    if report.escalated {
        println!("Target ignored SIGTERM and was killed");
    }
    if !report.output.is_empty() {
        println!(
            "--- captured output ({} lines, {} dropped) ---",
            report.output.len(),
            report.output_dropped
        );
        for line in &report.output {
            println!("{}", line.content);
        }
    }
    for e in &report.errors {
        tracing::debug!(code = e.code(), "{}", e);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match resolve_config(cli.config.as_ref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    if let Err(e) = tailprobe_core::utils::init_tracing(level) {
        eprintln!("Error: {}", e);
        return ExitCode::from(2);
    }

    for line in &config.banner {
        println!("{}", line);
    }

    let controller = match RunController::new(config) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    match controller.run().await {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// 1 when the target could not be launched, 2 for setup failures
fn exit_code_for(e: &CoreError) -> u8 {
    match e {
        CoreError::LaunchError(_) => 1,
        _ => 2,
    }
}
