use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive that takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "PERSONA_RELAY_LOG";

pub const SERVE_FILTER: &str = "info,persona_relay=debug";
/// Quieter default for the terminal client, whose stdout is the conversation.
pub const CHAT_FILTER: &str = "warn";

/// Pick the filter: explicit override, then `RUST_LOG`, then `default_filter`.
pub fn build_filter(override_directive: Option<&str>, default_filter: &str) -> EnvFilter {
    override_directive
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Logs go to stderr; a second call is a no-op.
pub fn init_tracing(override_directive: Option<&str>, default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(override_directive, default_filter))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let filter = build_filter(Some("persona_relay=trace"), SERVE_FILTER);
        assert_eq!(filter.to_string(), "persona_relay=trace");
    }

    #[test]
    fn test_default_when_no_override() {
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(build_filter(None, CHAT_FILTER).to_string(), CHAT_FILTER);
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(None, SERVE_FILTER);
        init_tracing(None, SERVE_FILTER);
    }
}
