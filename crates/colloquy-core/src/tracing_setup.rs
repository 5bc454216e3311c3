use std::fs::OpenOptions;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Environment variable naming a file that receives DEBUG-level logs.
pub const LOG_FILE_ENV: &str = "COLLOQUY_LOG_FILE";

pub fn init_tracing() {
    let file_logging = std::env::var(LOG_FILE_ENV).ok();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    let file = file_logging.as_ref().and_then(|log_path| {
        match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", log_path, e);
                None
            }
        }
    });

    match (file, file_logging) {
        (Some(file), Some(log_path)) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(LevelFilter::DEBUG);
            // try_init: a host may already own the global subscriber
            let _ = registry.with(file_layer).try_init();
            eprintln!("File logging enabled: {}", log_path);
        }
        _ => {
            let _ = registry.try_init();
        }
    }
}
