//! Environment-backed configuration for `sync-smoke`.

use std::env;

use sync_core::SyncConfig;
use thiserror::Error;

const DEFAULT_CONVERSATION: &str = "smoke-room";
const DEFAULT_USER_ID: &str = "u-smoke";
const DEFAULT_DISPLAY_NAME: &str = "Smoke";
const DEFAULT_RUN_MS: u64 = 4_000;
/// Broadcast capacity is allocated up front; keep it bounded.
pub const MAX_EVENT_BUFFER: u64 = 4_096;

/// Settings for one smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    pub conversation_id: String,
    pub local_user_id: String,
    pub local_display_name: String,
    /// How long the simulated session keeps running before shutdown.
    pub run_ms: u64,
    /// Simulated server latency per request.
    pub latency_ms: u64,
    /// Send without correlation echo to exercise the heuristic match.
    pub legacy_echo: bool,
    /// Filter directives from `CHATSYNC_LOG`; `RUST_LOG` still takes precedence.
    pub log_directives: Option<String>,
    pub sync: SyncConfig,
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl SmokeConfig {
    /// Parse configuration from `CHATSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = SyncConfig::default();
        let conversation_id = optional_trimmed_env("CHATSYNC_CONVERSATION", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_owned());
        let local_user_id = optional_trimmed_env("CHATSYNC_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());
        let local_display_name = optional_trimmed_env("CHATSYNC_DISPLAY_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_owned());

        let run_ms = parse_positive_u64("CHATSYNC_RUN_MS", DEFAULT_RUN_MS, &mut lookup)?;
        let latency_ms = parse_optional_u64("CHATSYNC_LATENCY_MS", &mut lookup)?.unwrap_or(0);
        let legacy_echo = parse_optional_bool("CHATSYNC_LEGACY_ECHO", &mut lookup)?.unwrap_or(false);
        let log_directives = optional_trimmed_env("CHATSYNC_LOG", &mut lookup);

        let sync = SyncConfig {
            poll_interval_ms: parse_positive_u64(
                "CHATSYNC_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
                &mut lookup,
            )?,
            request_timeout_ms: parse_positive_u64(
                "CHATSYNC_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
                &mut lookup,
            )?,
            typing_ttl_ms: parse_positive_u64(
                "CHATSYNC_TYPING_TTL_MS",
                defaults.typing_ttl_ms,
                &mut lookup,
            )?,
            typing_throttle_ms: parse_positive_u64(
                "CHATSYNC_TYPING_THROTTLE_MS",
                defaults.typing_throttle_ms,
                &mut lookup,
            )?,
            legacy_match_window_ms: parse_positive_u64(
                "CHATSYNC_LEGACY_MATCH_WINDOW_MS",
                defaults.legacy_match_window_ms,
                &mut lookup,
            )?,
            refetch_overlap: parse_optional_u64("CHATSYNC_REFETCH_OVERLAP", &mut lookup)?
                .map_or(defaults.refetch_overlap, |value| value as usize),
            pin_refresh_rounds: parse_positive_u64(
                "CHATSYNC_PIN_REFRESH_ROUNDS",
                u64::from(defaults.pin_refresh_rounds),
                &mut lookup,
            )
            .and_then(|value| {
                u32::try_from(value).map_err(|err| ConfigError::InvalidValue {
                    key: "CHATSYNC_PIN_REFRESH_ROUNDS",
                    value: value.to_string(),
                    reason: err.to_string(),
                })
            })?,
            event_buffer: parse_bounded_u64(
                "CHATSYNC_EVENT_BUFFER",
                defaults.event_buffer as u64,
                MAX_EVENT_BUFFER,
                &mut lookup,
            )? as usize,
        };

        Ok(Self {
            conversation_id,
            local_user_id,
            local_display_name,
            run_ms,
            latency_ms,
            legacy_echo,
            log_directives,
            sync,
        })
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_positive_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match parse_optional_u64(key, lookup)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        }),
        Some(value) => Ok(value),
    }
}

fn parse_bounded_u64<F>(
    key: &'static str,
    default: u64,
    max: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_positive_u64(key, default, lookup)?;
    if value > max {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: format!("must be at most {max}"),
        });
    }
    Ok(value)
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.conversation_id, DEFAULT_CONVERSATION);
        assert_eq!(cfg.local_user_id, DEFAULT_USER_ID);
        assert_eq!(cfg.run_ms, DEFAULT_RUN_MS);
        assert_eq!(cfg.latency_ms, 0);
        assert!(!cfg.legacy_echo);
        assert_eq!(cfg.log_directives, None);
        assert_eq!(cfg.sync, SyncConfig::default());
    }

    #[test]
    fn parses_sync_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("CHATSYNC_CONVERSATION", "  room-7 "),
            ("CHATSYNC_POLL_INTERVAL_MS", "500"),
            ("CHATSYNC_TYPING_TTL_MS", "2000"),
            ("CHATSYNC_REFETCH_OVERLAP", "0"),
            ("CHATSYNC_PIN_REFRESH_ROUNDS", "3"),
            ("CHATSYNC_LEGACY_ECHO", "yes"),
            ("CHATSYNC_LATENCY_MS", "25"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.conversation_id, "room-7");
        assert_eq!(cfg.sync.poll_interval_ms, 500);
        assert_eq!(cfg.sync.typing_ttl_ms, 2_000);
        assert_eq!(cfg.sync.refetch_overlap, 0);
        assert_eq!(cfg.sync.pin_refresh_rounds, 3);
        assert!(cfg.legacy_echo);
        assert_eq!(cfg.latency_ms, 25);
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = config_from_pairs(&[("CHATSYNC_POLL_INTERVAL_MS", "soon")])
            .expect_err("non-numeric interval should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_POLL_INTERVAL_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_where_positive_is_required() {
        let err = config_from_pairs(&[("CHATSYNC_TYPING_THROTTLE_MS", "0")])
            .expect_err("zero throttle should fail");
        assert_eq!(
            err.to_string(),
            "invalid CHATSYNC_TYPING_THROTTLE_MS='0': must be at least 1"
        );
    }

    #[test]
    fn caps_event_buffer() {
        let cfg = config_from_pairs(&[("CHATSYNC_EVENT_BUFFER", "4096")]).expect("at cap");
        assert_eq!(cfg.sync.event_buffer, 4_096);

        let err = config_from_pairs(&[("CHATSYNC_EVENT_BUFFER", "18446744073709551615")])
            .expect_err("oversized buffer should fail");
        assert_eq!(
            err.to_string(),
            "invalid CHATSYNC_EVENT_BUFFER='18446744073709551615': must be at most 4096"
        );
    }

    #[test]
    fn reads_log_directives() {
        let cfg = config_from_pairs(&[("CHATSYNC_LOG", " warn,sync_runtime=trace ")])
            .expect("config should parse");
        assert_eq!(cfg.log_directives.as_deref(), Some("warn,sync_runtime=trace"));
    }

    #[test]
    fn rejects_unknown_boolean_spelling() {
        assert!(config_from_pairs(&[("CHATSYNC_LEGACY_ECHO", "maybe")]).is_err());
    }
}
