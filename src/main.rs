//! integration-tester - test driver for Kubernetes controllers

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use integration_tester::cli::Cli;
use integration_tester::PROGNAME;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.run().await {
        Ok(code) => std::process::exit(i32::from(code)),
        Err(err) => {
            eprintln!("{PROGNAME}: {err}");
            std::process::exit(i32::from(err.exit_code()));
        }
    }
}
