use crate::config::LoggingSettings;
use std::env;
use std::fs;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Build the filter: RUST_LOG wins, otherwise the configured level plus our own crate at debug
pub fn build_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(&settings.level);
        if let Ok(directive) = "slv_lludp=debug".parse() {
            filter = filter.add_directive(directive);
        }
        filter
    })
}

/// Initialize logging: console output plus an optional plain-text log file.
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    let console = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(settings.with_thread_ids)
        .with_ansi(true);

    let file_layer = match &settings.log_file {
        Some(path) => {
            let log_file = fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_writer(log_file)
                    .with_target(true)
                    .with_thread_ids(settings.with_thread_ids)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false) // No ANSI codes in file
                    .boxed(),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(build_filter(settings))
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            "Logging initialized with level: {}",
            env::var("RUST_LOG").unwrap_or_else(|_| settings.level.clone())
        );
        if let Some(path) = &settings.log_file {
            tracing::info!("File logging enabled: {}", path);
        }
    }
    Ok(())
}

/// Log system information for debugging
pub fn log_system_info() {
    tracing::info!("=== System Information ===");
    tracing::info!("OS: {}", env::consts::OS);
    tracing::info!("Architecture: {}", env::consts::ARCH);
    tracing::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    tracing::info!("========================");
}
