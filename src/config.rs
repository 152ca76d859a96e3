#![forbid(unsafe_code)]

// Orchestrator configuration, loaded from environment variables with defaults.

use std::time::Duration;
use tracing::warn;

/// Timers, thresholds and endpoints used by the stage orchestrator.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Base URL of the REST stage API (e.g. "https://stages.example.com")
    pub api_base_url: String,
    /// Delay between the end of one stage-list fetch and the start of the next
    pub stage_refresh_delay: Duration,
    /// Delay between RTC stats pulls while stats collection is on
    pub rtc_stats_interval: Duration,
    /// Length of a PK/VS voting round in seconds
    pub vote_round_secs: i64,
    /// How long a resolved vote result stays visible before returning to idle
    pub vote_result_display: Duration,
    /// Audio RMS level (dB) at or above which a participant counts as speaking
    pub speaking_threshold_db: f32,
    /// Number of seats in an audio room
    pub audio_seat_count: usize,
    /// Local stream bitrate (bps) used when none is stored in preferences
    pub default_bitrate: u32,
    /// REST transport timeout
    pub request_timeout: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".to_string(),
            stage_refresh_delay: Duration::from_secs(10),
            rtc_stats_interval: Duration::from_secs(1),
            vote_round_secs: 30,
            vote_result_display: Duration::from_secs(5),
            speaking_threshold_db: -45.0,
            audio_seat_count: 12,
            default_bitrate: 1_500_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl StageConfig {
    /// Load from environment variables, falling back to defaults for anything
    /// unset. Values that fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("STAGE_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = parse_env::<u64>("STAGE_REFRESH_DELAY_MS") {
            config.stage_refresh_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("RTC_STATS_INTERVAL_MS") {
            config.rtc_stats_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env::<i64>("VOTE_ROUND_SECS") {
            config.vote_round_secs = secs;
        }
        if let Some(secs) = parse_env::<u64>("VOTE_RESULT_SECS") {
            config.vote_result_display = Duration::from_secs(secs);
        }
        if let Some(db) = parse_env::<f32>("SPEAKING_THRESHOLD_DB") {
            config.speaking_threshold_db = db;
        }
        if let Some(count) = parse_env::<usize>("AUDIO_SEAT_COUNT") {
            if count == 0 {
                warn!("AUDIO_SEAT_COUNT=0 would leave audio rooms without seats, using default {}", config.audio_seat_count);
            } else {
                config.audio_seat_count = count;
            }
        }
        if let Some(bitrate) = parse_env::<u32>("STAGE_BITRATE") {
            config.default_bitrate = bitrate;
        }
        if let Some(ms) = parse_env::<u64>("STAGE_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StageConfig::default();
        assert_eq!(config.vote_round_secs, 30);
        assert_eq!(config.audio_seat_count, 12);
        assert_eq!(config.stage_refresh_delay, Duration::from_secs(10));
        assert!(config.speaking_threshold_db < 0.0);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        std::env::set_var("STAGEHAND_TEST_GARBAGE", "not-a-number");
        assert_eq!(parse_env::<u64>("STAGEHAND_TEST_GARBAGE"), None);
        std::env::set_var("STAGEHAND_TEST_NUMBER", " 42 ");
        assert_eq!(parse_env::<u64>("STAGEHAND_TEST_NUMBER"), Some(42));
        assert_eq!(parse_env::<u64>("STAGEHAND_TEST_UNSET_KEY"), None);
    }
}
