// src/main.rs

use jobflow::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("jobflow error: {err:?}");
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` means the run ended without every job completing.
async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
