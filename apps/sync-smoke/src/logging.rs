//! Tracing bootstrap for the smoke binary.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,sync_smoke=debug,sync_runtime=debug,sync_core=debug";

/// Where the active filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    RustLog,
    Configured,
    Default,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `directives`; unparsable directives fall back to the
/// built-in filter.
pub fn init(directives: Option<&str>) {
    let (filter, source) = select_filter(EnvFilter::try_from_default_env().ok(), directives);
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
    tracing::debug!(?source, "log filter selected");
}

fn select_filter(
    from_env: Option<EnvFilter>,
    directives: Option<&str>,
) -> (EnvFilter, FilterSource) {
    if let Some(filter) = from_env {
        return (filter, FilterSource::RustLog);
    }
    if let Some(directives) = directives {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return (filter, FilterSource::Configured),
            Err(err) => eprintln!("Ignoring CHATSYNC_LOG='{directives}': {err}"),
        }
    }
    (EnvFilter::new(DEFAULT_DIRECTIVES), FilterSource::Default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_takes_precedence() {
        let from_env = EnvFilter::try_new("error").ok();
        let (_, source) = select_filter(from_env, Some("trace"));
        assert_eq!(source, FilterSource::RustLog);
    }

    #[test]
    fn configured_directives_apply_without_rust_log() {
        let (filter, source) = select_filter(None, Some("warn,sync_runtime=trace"));
        assert_eq!(source, FilterSource::Configured);
        assert!(filter.to_string().contains("sync_runtime=trace"));
    }

    #[test]
    fn bad_directives_fall_back_to_default() {
        let (_, source) = select_filter(None, Some("sync_core=loudly"));
        assert_eq!(source, FilterSource::Default);
        let (_, source) = select_filter(None, None);
        assert_eq!(source, FilterSource::Default);
    }
}
