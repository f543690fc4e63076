//! # Provarc
//!
//! The command-line front end of provarc-core.
//!
//! ## Usage
//!
//! ```bash
//! # Create a store in the current directory
//! provarc init
//!
//! # Export a node with its provenance
//! provarc export -o results.tar.gz --node 3f1c...
//!
//! # Merge the archive into another store
//! provarc -D other/provarc.redb -R other/repository import -i results.tar.gz
//! ```

use clap::Parser;
use provarc::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // PROVARC_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("PROVARC_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "provarc=info,provarc_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!(kind = ?e.kind(), "Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!("provarc v{} - provenance graph archives", env!("CARGO_PKG_VERSION"));
    println!();
}
