//! Installs the global `tracing` subscriber.

use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

/// The output format of log lines.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact, human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Reads a `LOG_FORMAT` value. Anything but `json` means [`LogFormat::Text`].
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Picks the filter directives: `RUST_LOG` wins over `LOG_LEVEL`, which defaults to `info`.
///
/// `RUST_LOG` is taken verbatim, since targets and span names are case sensitive. `LOG_LEVEL` is
/// a bare level and may be written in any case.
pub fn filter_directives(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    fn non_blank(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|value| !value.is_empty())
    }

    match (non_blank(rust_log), non_blank(log_level)) {
        (Some(directives), _) => directives.to_owned(),
        (None, Some(level)) => level.to_ascii_lowercase(),
        (None, None) => DEFAULT_LEVEL.to_owned(),
    }
}

/// Installs the subscriber configured by `RUST_LOG`, `LOG_LEVEL` and `LOG_FORMAT`.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    let directives = filter_directives(rust_log.as_deref(), log_level.as_deref());
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };

    if installed.is_err() {
        tracing::debug!("a tracing subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_wins_over_log_level() {
        assert_eq!(
            filter_directives(Some("schedule_scanner=trace"), Some("warn")),
            "schedule_scanner=trace"
        );
        assert_eq!(filter_directives(None, Some("DEBUG")), "debug");
        assert_eq!(filter_directives(Some(" "), Some("warn")), "warn");
        assert_eq!(filter_directives(None, None), "info");
    }

    #[test]
    fn rust_log_keeps_its_case() {
        assert_eq!(
            filter_directives(Some("schedule_scanner[scanRepository]=debug"), None),
            "schedule_scanner[scanRepository]=debug"
        );
        assert_eq!(filter_directives(Some("MyCrate=WARN"), Some("ERROR")), "MyCrate=WARN");
    }

    #[test]
    fn only_json_selects_json() {
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some("xml")), LogFormat::Text);
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
    }
}
