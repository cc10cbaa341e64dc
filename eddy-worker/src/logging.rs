use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

/// Installs a stdout subscriber filtered by `RUST_LOG` (INFO by default). Returns false if
/// a global subscriber was already installed.
pub fn init_logging(name: &str) -> bool {
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_line_number(false)
        .with_file(false)
        .with_span_events(FmtSpan::NEW)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let subscriber = Registry::default().with(stdout_log);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));

    tracing::info!("logging initialized for {}", name);
    true
}
