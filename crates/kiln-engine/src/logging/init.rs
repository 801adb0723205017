use std::sync::Once;

/// Filter used when neither the config nor `RUST_LOG` names one.
///
/// wgpu and its backends are chatty at info; kiln's own pool growth and queue
/// lifecycle messages are not.
pub const DEFAULT_FILTER: &str = "warn,kiln_engine=info,kiln_studio=info";

/// How the process-wide logger is set up.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `env_logger` filter, e.g. "kiln_engine=trace,wgpu=warn". Takes precedence
    /// over `RUST_LOG`.
    pub filter: Option<String>,

    /// Millisecond timestamps on every record. Per-frame traces are hard to read
    /// without them.
    pub timestamps: bool,

    pub write_style: env_logger::WriteStyle,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            timestamps: true,
            write_style: env_logger::WriteStyle::Auto,
        }
    }
}

/// Picks the filter: explicit config, then `rust_log`, then [`DEFAULT_FILTER`].
fn filter_spec(config: &LoggingConfig, rust_log: Option<String>) -> String {
    config
        .filter
        .clone()
        .or(rust_log.filter(|spec| !spec.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}

static INIT: Once = Once::new();

/// Installs the global logger. Only the first call has any effect.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let spec = filter_spec(&config, std::env::var("RUST_LOG").ok());
        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&spec);
        if config.timestamps {
            builder.format_timestamp_millis();
        } else {
            builder.format_timestamp(None);
        }
        builder.write_style(config.write_style);
        builder.init();

        log::debug!("logging initialized with '{spec}'");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins_over_environment() {
        let config = LoggingConfig {
            filter: Some("kiln_engine=trace".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(
            filter_spec(&config, Some("debug".into())),
            "kiln_engine=trace"
        );
    }

    #[test]
    fn environment_is_used_when_config_is_silent() {
        let config = LoggingConfig::default();
        assert_eq!(filter_spec(&config, Some("wgpu=info".into())), "wgpu=info");
    }

    #[test]
    fn blank_environment_falls_back_to_default() {
        let config = LoggingConfig::default();
        assert_eq!(filter_spec(&config, Some("  ".into())), DEFAULT_FILTER);
        assert_eq!(filter_spec(&config, None), DEFAULT_FILTER);
    }
}
