//! tendlab test runner
//!
//! Runs named testcases against the lab described by the configuration and
//! prints the invocation trace when one fails.

use std::path::PathBuf;
use std::time::Instant;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{Result, Section, SectionExt};
use eyre::WrapErr;
use tendlab_core::{Ctx, Lab, LogRecord, LogSink, Registry};
use tracing::{error, info};

mod config;
mod logging;

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "tendlab", version)]
#[command(about = "Multi-host test runner for embedded firmware labs", long_about = None)]
struct Cli {
    /// More output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Console log format
    #[arg(long, value_enum, default_value_t, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available testcases
    List,

    /// Run testcases in order, stopping at the first failure
    Run {
        /// Config file; repeat to layer files, later ones win
        #[arg(short, long = "config", value_name = "FILE")]
        config: Vec<PathBuf>,

        /// Override a config value
        #[arg(short = 'o', long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Write the execution log as JSON
        #[arg(long, value_name = "FILE")]
        log_json: Option<PathBuf>,

        /// Testcases to run
        #[arg(required = true, value_name = "TESTCASE")]
        testcases: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    let registry = Registry::with_builtins();

    match cli.command {
        Commands::List => {
            for testcase in registry.iter() {
                println!("{:<24} {}", testcase.name(), testcase.description());
            }
            Ok(())
        }
        Commands::Run {
            config,
            overrides,
            log_json,
            testcases,
        } => {
            let config = config::load(&config, &overrides)?;
            run(&registry, config, log_json, &testcases).await
        }
    }
}

async fn run(
    registry: &Registry,
    config: tendlab_core::Config,
    log_json: Option<PathBuf>,
    testcases: &[String],
) -> Result<()> {
    let sink = LogSink::new();
    let ctx = Ctx::root(sink.clone());
    let mut lab = Lab::new(config, sink.clone());

    let started = Instant::now();
    let result = registry.run(&ctx, &mut lab, testcases).await;
    let closed = lab.close().await;

    print_summary(&sink);

    if let Some(path) = &log_json {
        match sink.write_json(path) {
            Ok(()) => info!(path = %path.display(), "wrote execution log"),
            Err(e) if result.is_err() => {
                error!(path = %path.display(), error = %e, "failed to write execution log");
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to write execution log {}", path.display()));
            }
        }
    }

    match result.and(closed) {
        Ok(()) => {
            info!(elapsed = ?started.elapsed(), "success");
            Ok(())
        }
        Err(e) => {
            let trace = e.trace_report();
            Err(eyre::Report::new(e)
                .wrap_err("testcase run failed")
                .with_section(move || trace.header("Invocation trace:")))
        }
    }
}

fn print_summary(sink: &LogSink) {
    for record in sink.records() {
        if let LogRecord::TestcaseEnd {
            name,
            depth: 0,
            duration,
            status,
            ..
        } = record
        {
            println!("{name:<24} {status:?} ({duration:.3}s)");
        }
    }
}
