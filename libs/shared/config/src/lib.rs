use std::env;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub integration_gateway_url: String,
    pub integration_gateway_token: String,
    pub provider_calendar_id: String,
    pub bind_address: String,
    pub scheduling: SchedulingPolicy,
}

/// Tunables for slot proposal, reply handling and session lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingPolicy {
    pub workday_start: NaiveTime,
    pub workday_end: NaiveTime,
    pub working_days: Vec<Weekday>,
    pub slot_duration_minutes: i64,
    pub max_candidates: usize,
    pub max_reply_attempts: u32,
    pub max_regenerations: u32,
    pub session_ttl_hours: i64,
    pub channel_window_hours: i64,
    pub capability_timeout_seconds: u64,
    pub capability_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub reaper_interval_seconds: u64,
    pub audit_retention_days: i64,
    pub default_window_start_weeks: i64,
    pub default_window_end_weeks: i64,
}

pub const MIN_CANDIDATES: usize = 2;
pub const MAX_CANDIDATES: usize = 5;

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            workday_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            workday_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            slot_duration_minutes: 30,
            max_candidates: 3,
            max_reply_attempts: 2,
            max_regenerations: 2,
            session_ttl_hours: 72,
            channel_window_hours: 24,
            capability_timeout_seconds: 15,
            capability_max_attempts: 3,
            retry_base_delay_ms: 500,
            reaper_interval_seconds: 60,
            audit_retention_days: 30,
            default_window_start_weeks: 2,
            default_window_end_weeks: 8,
        }
    }
}

impl SchedulingPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let policy = Self {
            workday_start: env_time("WORKDAY_START", defaults.workday_start),
            workday_end: env_time("WORKDAY_END", defaults.workday_end),
            working_days: env_weekdays("WORKING_DAYS", defaults.working_days.clone()),
            slot_duration_minutes: env_parse("SLOT_DURATION_MINUTES", defaults.slot_duration_minutes),
            max_candidates: env_parse("MAX_CANDIDATES", defaults.max_candidates),
            max_reply_attempts: env_parse("MAX_REPLY_ATTEMPTS", defaults.max_reply_attempts),
            max_regenerations: env_parse("MAX_REGENERATIONS", defaults.max_regenerations),
            session_ttl_hours: env_parse("SESSION_TTL_HOURS", defaults.session_ttl_hours),
            channel_window_hours: env_parse("CHANNEL_WINDOW_HOURS", defaults.channel_window_hours),
            capability_timeout_seconds: env_parse("CAPABILITY_TIMEOUT_SECONDS", defaults.capability_timeout_seconds),
            capability_max_attempts: env_parse("CAPABILITY_MAX_ATTEMPTS", defaults.capability_max_attempts),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            reaper_interval_seconds: env_parse("REAPER_INTERVAL_SECONDS", defaults.reaper_interval_seconds),
            audit_retention_days: env_parse("AUDIT_RETENTION_DAYS", defaults.audit_retention_days),
            default_window_start_weeks: env_parse("DEFAULT_WINDOW_START_WEEKS", defaults.default_window_start_weeks),
            default_window_end_weeks: env_parse("DEFAULT_WINDOW_END_WEEKS", defaults.default_window_end_weeks),
        };

        policy.validated()
    }

    /// Clamp values into their supported ranges, falling back to defaults
    /// for combinations that cannot work.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        if !(MIN_CANDIDATES..=MAX_CANDIDATES).contains(&self.max_candidates) {
            warn!(
                "MAX_CANDIDATES={} outside {}..={}, clamping",
                self.max_candidates, MIN_CANDIDATES, MAX_CANDIDATES
            );
            self.max_candidates = self.max_candidates.clamp(MIN_CANDIDATES, MAX_CANDIDATES);
        }

        if self.workday_start >= self.workday_end {
            warn!("Workday start must be before workday end, using defaults");
            self.workday_start = defaults.workday_start;
            self.workday_end = defaults.workday_end;
        }

        if self.working_days.is_empty() {
            warn!("WORKING_DAYS is empty, using Monday to Friday");
            self.working_days = defaults.working_days.clone();
        }

        if self.slot_duration_minutes <= 0 {
            warn!("SLOT_DURATION_MINUTES must be positive, using default");
            self.slot_duration_minutes = defaults.slot_duration_minutes;
        }

        if self.max_reply_attempts == 0 {
            self.max_reply_attempts = 1;
        }

        if self.capability_max_attempts == 0 {
            self.capability_max_attempts = 1;
        }

        if self.default_window_start_weeks < 0
            || self.default_window_start_weeks >= self.default_window_end_weeks
        {
            warn!("Default scheduling window is invalid, using defaults");
            self.default_window_start_weeks = defaults.default_window_start_weeks;
            self.default_window_end_weeks = defaults.default_window_end_weeks;
        }

        self
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            redis_url: env::var("REDIS_URL").ok(),
            redis_key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_default(),
            integration_gateway_url: env::var("INTEGRATION_GATEWAY_URL")
                .unwrap_or_else(|_| {
                    warn!("INTEGRATION_GATEWAY_URL not set, using empty value");
                    String::new()
                }),
            integration_gateway_token: env::var("INTEGRATION_GATEWAY_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("INTEGRATION_GATEWAY_TOKEN not set, using empty value");
                    String::new()
                }),
            provider_calendar_id: env::var("PROVIDER_CALENDAR_ID")
                .unwrap_or_else(|_| {
                    warn!("PROVIDER_CALENDAR_ID not set, using default");
                    "primary".to_string()
                }),
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            scheduling: SchedulingPolicy::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        self.redis_url.is_some() && self.is_gateway_configured()
    }

    pub fn is_gateway_configured(&self) -> bool {
        !self.integration_gateway_url.is_empty() && !self.integration_gateway_token.is_empty()
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_time(name: &str, default: NaiveTime) -> NaiveTime {
    match env::var(name) {
        Ok(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").unwrap_or_else(|_| {
            warn!("{} must be HH:MM, got '{}', using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_weekdays(name: &str, default: Vec<Weekday>) -> Vec<Weekday> {
    match env::var(name) {
        Ok(raw) => {
            let parsed: Result<Vec<Weekday>, _> = raw
                .split(',')
                .map(str::trim)
                .filter(|day| !day.is_empty())
                .map(Weekday::from_str)
                .collect();

            parsed.unwrap_or_else(|_| {
                warn!("{} has an invalid weekday list '{}', using default", name, raw);
                default
            })
        }
        Err(_) => default,
    }
}
