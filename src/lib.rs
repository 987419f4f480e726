//! StrandCast: a hierarchical peer-to-peer media relay.
//!
//! This crate is library-first: `coordinator`, `subcoordinator`, `peer`,
//! `wire`, `codec`, `frame_source`, `renderer`, `error`, and `config` are all
//! public so integration tests can drive each role in-process (binding to
//! `127.0.0.1:0` and reading back the assigned port) without spawning
//! subprocesses. `src/bin/*.rs` are thin: parse CLI args, initialize
//! logging, construct the role's state, and run its loops.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame_source;
pub mod peer;
pub mod renderer;
pub mod subcoordinator;
pub mod wire;

/// Initialize the shared `tracing` subscriber: stdout, `RUST_LOG`-driven
/// (default `info`), matching the teacher's `tracing_subscriber::fmt::init`
/// convention.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Additionally layer a non-blocking rolling file writer at
/// `<output_dir>/<file_stem>.log`, for the per-peer/per-subcoordinator log
/// file named in `spec.md` §6. Returns the guard that must be held for the
/// life of the process to keep the writer flushing.
pub fn init_logging_with_file(
    output_dir: &std::path::Path,
    file_stem: &str,
) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(output_dir).ok();
    let file_appender = tracing_appender::rolling::never(output_dir, format!("{file_stem}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(non_blocking))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}
