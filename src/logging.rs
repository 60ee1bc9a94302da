//! Tracing subscriber setup for the driver process.

use std::{fs::OpenOptions, path::Path, sync::Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global subscriber: a compact stderr layer filtered by
/// `RUST_LOG` (falling back to the requested level), plus an optional
/// plain-text file layer. Re-initialization is a no-op so tests and
/// embedders can call this freely.
pub fn init_logging(verbose: bool, level: Option<&str>, log_file: Option<&Path>) {
    let fallback = if verbose {
        "debug".to_owned()
    } else {
        level.map(str::to_ascii_lowercase).unwrap_or_else(|| "info".into())
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact());

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(error) => {
                eprintln!("Failed to open log file {}: {error}", path.display());
                None
            }
        }
    });

    match file {
        Some(file) => {
            let _ = registry
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}
