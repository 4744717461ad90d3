use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "enricher.log";
const DEFAULT_DIRECTIVES: &str = "shelf_enricher=info,warn";

/// Filter from `directives` (normally `RUST_LOG`); unset or unparsable input
/// falls back to info for this crate and warn elsewhere.
pub fn build_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber: JSON lines into a daily file under `logs/`
/// plus human-readable stderr output. Stdout is left to command results.
pub fn init_logging() {
    if let Err(e) = std::fs::create_dir_all(LOG_DIR) {
        eprintln!("cannot create {}/: {}", LOG_DIR, e);
    }

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(LOG_DIR, LOG_FILE_PREFIX));

    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(build_filter(rust_log.as_deref()))
        .with(fmt::layer().json().with_writer(file_writer))
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();

    // flush worker lives for the whole process
    std::mem::forget(guard);
}
