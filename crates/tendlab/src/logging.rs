//! Tracing setup
//!
//! Console output goes to stderr so testcase results on stdout stay clean.
//! `RUST_LOG` overrides the verbosity flags.

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Console log format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable, testcases drawn as a tree
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "tendlab=info,tendlab_core=info,tendlab_exec=warn,warn",
        1 => "tendlab=debug,tendlab_core=debug,tendlab_exec=info,warn",
        _ => "tendlab=trace,tendlab_core=trace,tendlab_exec=trace,info",
    }
}

/// Install the global subscriber
pub fn init(verbose: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose > 0)
                    .without_time()
                    .compact(),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(false),
            )
            .init(),
    }
}
