//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;

/// Server tuning loaded from environment variables. Every knob has a
/// default; the env only overrides.
#[derive(Clone, Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Accumulated decline penalties at which queueing is refused
    pub penalty_limit: u32,
    /// Lead time added to a match's ready time to form the confirm deadline
    pub confirm_lead_secs: f64,

    /// Delay between capture start and finalization
    pub base_capture_delay_secs: f64,

    /// Cooperative gauge tick interval
    pub gauge_tick_secs: f64,
    /// Kill-value sum to gauge-delta scale
    pub gauge_scale: f64,
    /// Constant subtracted from the gauge on any tick where an enemy died
    pub gauge_kill_decay: i64,
    /// Per-tick fractional decay of each enemy's kill value
    pub gauge_enemy_decay_rate: f64,
    /// Gauge level flagged as "dark" in broadcasts
    pub gauge_dark_threshold: i64,
    /// Gauge trigger values (fired once per crossing direction)
    pub gauge_trigger_values: Vec<i64>,

    /// Recruitment window length for the cooperative lottery
    pub recruit_window_secs: f64,
    /// Players drawn per recruitment window
    pub recruit_party_size: usize,
    /// Delay between lottery acceptance and round start
    pub ub_ready_secs: f64,
    /// Per-match cap on cooperative reward currency
    pub ub_reward_cap: i64,
    /// Zone definition the cooperative round runs in
    pub ultimate_zone_def_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            penalty_limit: 3,
            confirm_lead_secs: 30.0,
            base_capture_delay_secs: 5.0,
            gauge_tick_secs: 5.0,
            gauge_scale: 0.01,
            gauge_kill_decay: 50,
            gauge_enemy_decay_rate: 0.05,
            gauge_dark_threshold: 800_000,
            gauge_trigger_values: vec![500_000],
            recruit_window_secs: 40.0,
            recruit_party_size: 5,
            ub_ready_secs: 20.0,
            ub_reward_cap: 10_000,
            ultimate_zone_def_id: 20,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            penalty_limit: parse_var("PENALTY_LIMIT", defaults.penalty_limit)?,
            confirm_lead_secs: parse_var("CONFIRM_LEAD_SECS", defaults.confirm_lead_secs)?,
            base_capture_delay_secs: parse_var(
                "BASE_CAPTURE_DELAY_SECS",
                defaults.base_capture_delay_secs,
            )?,
            gauge_tick_secs: parse_var("GAUGE_TICK_SECS", defaults.gauge_tick_secs)?,
            gauge_scale: parse_var("GAUGE_SCALE", defaults.gauge_scale)?,
            gauge_kill_decay: parse_var("GAUGE_KILL_DECAY", defaults.gauge_kill_decay)?,
            gauge_enemy_decay_rate: parse_var(
                "GAUGE_ENEMY_DECAY_RATE",
                defaults.gauge_enemy_decay_rate,
            )?,
            gauge_dark_threshold: parse_var(
                "GAUGE_DARK_THRESHOLD",
                defaults.gauge_dark_threshold,
            )?,
            gauge_trigger_values: parse_list("GAUGE_TRIGGER_VALUES", defaults.gauge_trigger_values)?,
            recruit_window_secs: parse_var("RECRUIT_WINDOW_SECS", defaults.recruit_window_secs)?,
            recruit_party_size: parse_var("RECRUIT_PARTY_SIZE", defaults.recruit_party_size)?,
            ub_ready_secs: parse_var("UB_READY_SECS", defaults.ub_ready_secs)?,
            ub_reward_cap: parse_var("UB_REWARD_CAP", defaults.ub_reward_cap)?,
            ultimate_zone_def_id: parse_var(
                "ULTIMATE_ZONE_DEF_ID",
                defaults.ultimate_zone_def_id,
            )?,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

fn parse_list(key: &'static str, default: Vec<i64>) -> Result<Vec<i64>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|part| part.trim().parse().map_err(|_| ConfigError::Invalid(key)))
            .collect(),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
