//! Binary entry point.

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // .env is optional; ignore a missing file.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    graphtog::cli::run()
}
