//! udock - run containers without root privileges
//!
//! ```sh
//! udock run -v /data:/data mycontainer /bin/sh
//! udock setup --execmode=F3 mycontainer
//! udock mode mycontainer
//! ```
//!
//! The exit code of the containerized command is passed through. Failures
//! of udock itself use the reserved codes of [`udock::Error::exit_code`].

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use udock::Config;
use udock::cli::{self, Cli};

// =============================================================================
// Main
// =============================================================================

fn default_filter(cli: &Cli) -> &'static str {
    if cli.debug {
        "udock=debug"
    } else if cli.quiet {
        "udock=error"
    } else {
        "udock=info"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(&cli)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match cli::dispatch(cli, config).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
