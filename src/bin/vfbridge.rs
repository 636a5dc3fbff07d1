use anyhow::Result;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tracing::error;
use vfbridge::commands::run_cni;

fn main() -> Result<()> {
    // Set up tracing; stdout is reserved for the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // Run the CNI plugin; the error object has already been written to stdout
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
