use anyhow::{Context, Result};
use appworker_config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Filter for `config`: its level, then its extra directives
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut directives = vec![config.level.as_str().to_string()];
    directives.extend(config.directives.iter().cloned());
    let filter = directives.join(",");

    EnvFilter::try_new(&filter).with_context(|| format!("Invalid log filter '{}'", filter))
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
    };

    try_install(
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .try_init(),
    );
    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    try_install(tracing_subscriber::fmt().with_env_filter(env_filter).try_init());
    Ok(())
}

/// Initialize tracing for worker processes
///
/// Output goes to stderr so it never mixes with protocol lines on stdout.
/// Workers run with a cleared environment, so `RUST_LOG` is only a fallback.
pub fn init_worker_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    try_install(
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init(),
    );
    Ok(())
}

fn try_install<E>(result: Result<(), E>) {
    // A subscriber installed earlier wins; tests init repeatedly
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appworker_config::LogLevel;

    #[test]
    fn test_filter_includes_directives() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            directives: vec!["appworker_ipc=trace".to_string()],
            ..LoggingConfig::default()
        };
        let filter = build_filter(&config).unwrap().to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("appworker_ipc=trace"));
    }

    #[test]
    fn test_bad_directive_is_an_error() {
        let config = LoggingConfig {
            directives: vec!["appworker_ipc=loud".to_string()],
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            format: LogFormat::Json,
            ..LoggingConfig::default()
        };
        init_logging_from_config(&config).unwrap();
        init_logging_from_config(&config).unwrap();
        init_simple_tracing("debug").unwrap();
        init_worker_tracing(Some("info")).unwrap();
        assert!(init_worker_tracing(Some("appworker=notalevel")).is_err());
    }
}
