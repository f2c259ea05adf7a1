use clap::Parser;
use rfs_migration::EXIT_FAILURE;
use rfs_worker::cli::Args;
use rfs_worker::config::WorkerConfig;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool) {
    let level = if let Ok(level) = std::env::var("RFS_LOG_LEVEL") {
        level
    } else if debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    let outcome = WorkerConfig::load(args.config.as_deref()).and_then(|mut config| {
        args.apply_to(&mut config);
        let worker_id = args
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        rfs_worker::run(&config, &worker_id)
    });

    match outcome {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!(event = "worker_setup_failed", error = %format!("{err:#}"));
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}
