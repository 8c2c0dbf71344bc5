use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use disp_trainer::cli::{Cli, Commands};
use disp_trainer::{data, train};
use tracing_appender::non_blocking::WorkerGuard;

/// Console logging plus, when `log_file` is given, a plain-text file log.
fn init_logging(log_file: Option<(&Path, &str)>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let (file_layer, guard) = match log_file {
        Some((dir, name)) => {
            let file_appender = tracing_appender::rolling::never(dir, format!("{name}.log"));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer()) // Stdout
        .with(file_layer) // File
        .init();

    guard
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = match &cli.command {
        Commands::Train(args) => {
            // Reject bad configuration before creating the checkpoint directory.
            args.validate()?;
            std::fs::create_dir_all(&args.checkpoint_path).with_context(|| {
                format!("Failed to create {}", args.checkpoint_path.display())
            })?;
            let model_name = args.model_name();
            init_logging(Some((args.checkpoint_path.as_path(), model_name.as_str())))
        }
        Commands::GenLists(_) => init_logging(None),
    };

    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "🔥 CRASH detected at {}: {}", location, msg);
        eprintln!("🔥 CRASH detected at {}: {}", location, msg);
    }));

    match cli.command {
        Commands::Train(args) => {
            if let Err(e) = train::run(args) {
                tracing::error!("❌ Training failed: {:#}", e);
                return Err(e);
            }
        }
        Commands::GenLists(args) => data::generate::run(args)?,
    }

    Ok(())
}
