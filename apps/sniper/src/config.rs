use std::time::Duration;

use crate::error::AppError;

/// Process-wide tunables, spec.md §6 "Configuration (environment)". Parsed
/// once at startup the same way the teacher collects its env vars in
/// `main()`, but centralised here so both required and optional settings
/// fail fast together.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_base_url: String,
    pub api_key: String,

    pub lead_time: Duration,
    pub scan_interval: Duration,
    pub scan_timeout: Duration,
    pub dry_run: bool,
    pub use_proxies: bool,

    pub passive_monitor_enabled: bool,
    pub passive_poll_interval: Duration,
    pub passive_blackout_minutes: i64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{name} must be a number, got {raw:?}"))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = env_or("DATABASE_URL", "sqlite:sniper.db?mode=rwc");
        let api_base_url = std::env::var("API_BASE_URL")
            .map_err(|_| AppError::Config("API_BASE_URL must be set".into()))?;
        let api_key = std::env::var("API_KEY")
            .map_err(|_| AppError::Config("API_KEY must be set".into()))?;

        let lead_time_secs: u64 = parse_env("LEAD_TIME_SECONDS", 45)?;
        let scan_interval_ms: u64 = parse_env("SCAN_INTERVAL_MS", 1000)?;
        let scan_timeout_secs: u64 = parse_env("SCAN_TIMEOUT_SECONDS", 120)?;
        let dry_run: bool = parse_env("DRY_RUN", false)?;
        let use_proxies: bool = parse_env("USE_PROXIES", false)?;

        let passive_monitor_enabled: bool = parse_env("PASSIVE_MONITOR_ENABLED", false)?;
        let passive_poll_interval_ms: u64 = parse_env("PASSIVE_POLL_INTERVAL_MS", 60_000)?;
        let passive_blackout_minutes: i64 = parse_env("PASSIVE_BLACKOUT_MINUTES", 5)?;

        Ok(Self {
            database_url,
            api_base_url,
            api_key,
            lead_time: Duration::from_secs(lead_time_secs),
            scan_interval: Duration::from_millis(scan_interval_ms),
            scan_timeout: Duration::from_secs(scan_timeout_secs),
            dry_run,
            use_proxies,
            passive_monitor_enabled,
            passive_poll_interval: Duration::from_millis(passive_poll_interval_ms),
            passive_blackout_minutes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        std::env::remove_var("SNIPER_TEST_UNSET_VALUE");
        let v: u64 = parse_env("SNIPER_TEST_UNSET_VALUE", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn parse_env_rejects_non_numeric_value() {
        std::env::set_var("SNIPER_TEST_BAD_VALUE", "not-a-number");
        let err = parse_env::<u64>("SNIPER_TEST_BAD_VALUE", 7).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        std::env::remove_var("SNIPER_TEST_BAD_VALUE");
    }
}
