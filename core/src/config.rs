/// Configuration management
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_LIVE_URL: &str = "ws://127.0.0.1:8000/api/ws/messages";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Conversation opened at startup (CLI only)
    pub conversation_id: Option<i64>,

    /// Base URL of the REST backend
    pub api_base_url: String,

    /// URL of the live-update WebSocket
    pub live_url: String,

    /// Backend session to read through (backend picks the active one if unset)
    pub session_id: Option<i64>,

    /// Messages requested by the first, fast phase
    pub initial_page_size: usize,

    /// Messages requested by the background backfill phase
    pub backfill_page_size: usize,

    /// Minimum first-page size that suggests more history exists
    pub backfill_threshold: usize,

    /// Messages requested per scroll-to-top page
    pub older_page_size: usize,

    /// Fixed delay between a channel drop and the next connect attempt
    pub reconnect_delay: Duration,

    /// Consecutive failed reconnects before giving up (None = retry forever).
    /// `Some(0)` never reconnects: the first drop or failed connect is final.
    pub max_reconnect_attempts: Option<u32>,

    /// Interval between client keepalive pings
    pub heartbeat_interval: Duration,

    /// Per-request timeout for history fetches
    pub request_timeout: Duration,

    /// Distance from the bottom, in pane units, still considered "at the bottom"
    pub near_bottom_threshold: f64,

    /// Explicit tracing filter, overrides RUST_LOG
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversation_id: None,
            api_base_url: DEFAULT_API_URL.to_string(),
            live_url: DEFAULT_LIVE_URL.to_string(),
            session_id: None,
            initial_page_size: 15,
            backfill_page_size: 35,
            backfill_threshold: 10,
            older_page_size: 50,
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: None,
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            near_bottom_threshold: 100.0,
            log_level: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(StreamError::Config(format!(
                "Usage: {} <conversation_id> [--api-url <url>] [--ws-url <url>] [--session <id>] [--initial <n>] [--backfill <n>] [--threshold <n>] [--page <n>] [--reconnect-ms <ms>] [--max-reconnects <n>] [--timeout-ms <ms>] [--log-level <filter>]",
                args.first().map(String::as_str).unwrap_or("tgstream")
            )));
        }

        let conversation_id = args[1]
            .parse::<i64>()
            .map_err(|_| StreamError::Config("Conversation id must be an integer".to_string()))?;

        let mut config = Self {
            conversation_id: Some(conversation_id),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1).ok_or_else(|| {
                    StreamError::Config(format!("{} requires an argument", flag))
                })
            };
            match flag {
                "--api-url" => config.api_base_url = value()?.trim_end_matches('/').to_string(),
                "--ws-url" => config.live_url = value()?.clone(),
                "--session" => config.session_id = Some(parse_flag::<i64>(flag, value()?)?),
                "--initial" => config.initial_page_size = parse_flag(flag, value()?)?,
                "--backfill" => config.backfill_page_size = parse_flag(flag, value()?)?,
                "--threshold" => config.backfill_threshold = parse_flag(flag, value()?)?,
                "--page" => config.older_page_size = parse_flag(flag, value()?)?,
                "--reconnect-ms" => {
                    config.reconnect_delay = Duration::from_millis(parse_flag(flag, value()?)?)
                }
                "--max-reconnects" => {
                    config.max_reconnect_attempts = Some(parse_flag(flag, value()?)?)
                }
                "--timeout-ms" => {
                    config.request_timeout = Duration::from_millis(parse_flag(flag, value()?)?)
                }
                "--log-level" => config.log_level = Some(value()?.clone()),
                other => {
                    return Err(StreamError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TGSTREAM_API_URL") {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("TGSTREAM_WS_URL") {
            self.live_url = url;
        }
        if let Some(id) = std::env::var("TGSTREAM_SESSION_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        {
            self.session_id = Some(id);
        }
        if let Some(ms) = std::env::var("TGSTREAM_RECONNECT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.reconnect_delay = Duration::from_millis(ms);
        }
    }

    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.initial_page_size == 0 || self.backfill_page_size == 0 || self.older_page_size == 0 {
            return Err(StreamError::Config("Page sizes must be greater than zero".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.reconnect_delay.is_zero() {
            return Err(StreamError::Config(
                "Heartbeat interval and reconnect delay must be greater than zero".to_string(),
            ));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(StreamError::Config(format!(
                "API url must start with http:// or https:// (got {})",
                self.api_base_url
            )));
        }
        if !(self.live_url.starts_with("ws://") || self.live_url.starts_with("wss://")) {
            return Err(StreamError::Config(format!(
                "Live url must start with ws:// or wss:// (got {})",
                self.live_url
            )));
        }
        Ok(())
    }
}

fn parse_flag<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| StreamError::Config(format!("{} must be a valid number (got {})", flag, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_match_observed_client() {
        let config = Config::default();
        assert_eq!(config.initial_page_size, 15);
        assert_eq!(config.backfill_page_size, 35);
        assert_eq!(config.backfill_threshold, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert!(config.max_reconnect_attempts.is_none());
    }

    #[test]
    fn test_from_args_parses_flags() {
        let config = Config::from_args(&args(&[
            "tgstream",
            "-100123",
            "--api-url",
            "http://localhost:9000/",
            "--page",
            "20",
            "--max-reconnects",
            "4",
            "--reconnect-ms",
            "500",
        ]))
        .unwrap();

        assert_eq!(config.conversation_id, Some(-100123));
        assert_eq!(config.api_base_url, "http://localhost:9000");
        assert_eq!(config.older_page_size, 20);
        assert_eq!(config.max_reconnect_attempts, Some(4));
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_from_args_requires_conversation() {
        assert!(matches!(
            Config::from_args(&args(&["tgstream"])),
            Err(StreamError::Config(_))
        ));
        assert!(Config::from_args(&args(&["tgstream", "abc"])).is_err());
    }

    #[test]
    fn test_missing_flag_value_is_error() {
        let err = Config::from_args(&args(&["tgstream", "42", "--page"])).unwrap_err();
        assert!(err.to_string().contains("--page"));
    }

    #[test]
    fn test_validate_rejects_zero_page_and_bad_scheme() {
        let mut config = Config::default();
        config.older_page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.live_url = "http://127.0.0.1:8000/ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = Config::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));

        let mut config = Config::default();
        config.reconnect_delay = Duration::ZERO;
        assert!(config.validate().is_err());

        let err = Config::from_args(&args(&["tgstream", "42", "--reconnect-ms", "0"])).unwrap_err();
        assert!(err.to_string().contains("reconnect delay"));
    }
}
