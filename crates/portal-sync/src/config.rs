use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::commands::{DEFAULT_COMMAND_ACK_TIMEOUT, DEFAULT_MAX_PENDING_COMMANDS};
use crate::envelope::OperatorIdentity;
use crate::reconciler::ReconcilerConfig;
use crate::simulation::SimulationConfig;

pub const DEFAULT_CONTROL_URL: &str = "ws://localhost:3001/portal-control";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 15;

#[derive(Clone, Debug)]
pub struct Config {
    pub control_url: String,
    pub simulate_only: bool,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
    pub health_interval: Duration,
    /// Live commands not acknowledged within this window are applied locally.
    pub command_ack_timeout: Duration,
    pub max_pending_commands: usize,
    pub reconciler: ReconcilerConfig,
    pub simulation: SimulationConfig,
    pub operator: OperatorIdentity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_url: DEFAULT_CONTROL_URL.to_string(),
            simulate_only: false,
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            health_interval: Duration::from_secs(30),
            command_ack_timeout: DEFAULT_COMMAND_ACK_TIMEOUT,
            max_pending_commands: DEFAULT_MAX_PENDING_COMMANDS,
            reconciler: ReconcilerConfig::default(),
            simulation: SimulationConfig::default(),
            operator: default_operator(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORTAL_CONTROL_URL: {0}")]
    InvalidControlUrl(String),
    #[error("invalid boolean setting: {0}")]
    InvalidBool(String),
    #[error("invalid numeric setting: {0}")]
    InvalidNumber(String),
    #[error("invalid PORTAL_CONTROL_SIM_BUSINESS_HOURS: {0}")]
    InvalidBusinessHours(String),
    #[error("invalid PORTAL_CONTROL_SIM_ACTIVITY_PROBABILITY: {0}")]
    InvalidProbability(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let control_url = lookup("PORTAL_CONTROL_URL").unwrap_or(defaults.control_url);
        if !(control_url.starts_with("ws://") || control_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidControlUrl(control_url));
        }
        let simulate_only = parse_bool_lookup(&lookup, "PORTAL_CONTROL_SIMULATE", false)?;
        let connect_timeout = Duration::from_millis(parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_CONNECT_TIMEOUT_MS",
            10_000,
            100,
            300_000,
        )?);
        let max_reconnect_attempts = parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_MAX_RECONNECT_ATTEMPTS",
            u64::from(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            0,
            1_000,
        )? as u32;
        let backoff = BackoffPolicy::new(
            parse_u64_lookup(&lookup, "PORTAL_CONTROL_BACKOFF_BASE_MS", 1_000, 1, 600_000)?,
            parse_f64_lookup(&lookup, "PORTAL_CONTROL_BACKOFF_FACTOR", 1.5, 1.0, 10.0)?,
            parse_u64_lookup(&lookup, "PORTAL_CONTROL_BACKOFF_MAX_MS", 30_000, 1, 3_600_000)?,
        );
        let health_interval = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_HEALTH_INTERVAL_SECONDS",
            30,
            1,
            3_600,
        )?);
        let command_ack_timeout = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_COMMAND_ACK_TIMEOUT_SECONDS",
            defaults.command_ack_timeout.as_secs(),
            1,
            3_600,
        )?);
        let max_pending_commands = parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_MAX_PENDING_COMMANDS",
            defaults.max_pending_commands as u64,
            1,
            10_000,
        )? as usize;

        let reconciler = ReconcilerConfig {
            large_transaction_threshold: parse_u64_lookup(
                &lookup,
                "PORTAL_CONTROL_LARGE_TRANSACTION_THRESHOLD",
                defaults.reconciler.large_transaction_threshold,
                0,
                u64::MAX,
            )?,
            idle_after: Duration::from_secs(parse_u64_lookup(
                &lookup,
                "PORTAL_CONTROL_IDLE_AFTER_SECONDS",
                defaults.reconciler.idle_after.as_secs(),
                1,
                86_400,
            )?),
        };

        let mut simulation = defaults.simulation;
        simulation.activity_interval = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_SIM_ACTIVITY_INTERVAL_SECONDS",
            simulation.activity_interval.as_secs(),
            1,
            3_600,
        )?);
        simulation.metrics_interval = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "PORTAL_CONTROL_SIM_METRICS_INTERVAL_SECONDS",
            simulation.metrics_interval.as_secs(),
            1,
            3_600,
        )?);
        if let Some(raw) = lookup("PORTAL_CONTROL_SIM_ACTIVITY_PROBABILITY") {
            let probability = raw
                .parse::<f64>()
                .map_err(|error| ConfigError::InvalidProbability(format!("{raw}: {error}")))?;
            if !(0.0..=1.0).contains(&probability) {
                return Err(ConfigError::InvalidProbability(format!(
                    "{raw}: must be within 0..=1"
                )));
            }
            simulation.activity_probability = probability;
        }
        if let Some(raw) = lookup("PORTAL_CONTROL_SIM_BUSINESS_HOURS") {
            let (start, end) = parse_business_hours(&raw)?;
            simulation.business_hours_start = start;
            simulation.business_hours_end = end;
        }
        simulation.utc_offset_hours = parse_i64_lookup(
            &lookup,
            "PORTAL_CONTROL_SIM_UTC_OFFSET_HOURS",
            i64::from(simulation.utc_offset_hours),
            -12,
            14,
        )? as i32;

        let operator = OperatorIdentity {
            id: lookup("PORTAL_CONTROL_OPERATOR_ID").unwrap_or(defaults.operator.id),
            name: lookup("PORTAL_CONTROL_OPERATOR_NAME").unwrap_or(defaults.operator.name),
            role: lookup("PORTAL_CONTROL_OPERATOR_ROLE").unwrap_or(defaults.operator.role),
            permissions: lookup("PORTAL_CONTROL_OPERATOR_PERMISSIONS").map_or(
                defaults.operator.permissions,
                |raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                        .collect()
                },
            ),
        };

        Ok(Self {
            control_url,
            simulate_only,
            connect_timeout,
            max_reconnect_attempts,
            backoff,
            health_interval,
            command_ack_timeout,
            max_pending_commands,
            reconciler,
            simulation,
            operator,
        })
    }
}

fn default_operator() -> OperatorIdentity {
    OperatorIdentity {
        id: "portal-console".to_string(),
        name: "Portal Console".to_string(),
        role: "manager".to_string(),
        permissions: vec!["portal.view".to_string(), "portal.control".to_string()],
    }
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(|value| value.clamp(min, max))
            .map_err(|error| ConfigError::InvalidNumber(format!("{key}: {error}"))),
        None => Ok(default),
    }
}

fn parse_i64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<i64>()
            .map(|value| value.clamp(min, max))
            .map_err(|error| ConfigError::InvalidNumber(format!("{key}: {error}"))),
        None => Ok(default),
    }
}

fn parse_f64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|error| ConfigError::InvalidNumber(format!("{key}: {error}")))
            .and_then(|value| {
                if value.is_finite() {
                    Ok(value.clamp(min, max))
                } else {
                    Err(ConfigError::InvalidNumber(format!("{key}: not finite")))
                }
            }),
        None => Ok(default),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidBool(format!("{key}: {other}"))),
    }
}

fn parse_business_hours(raw: &str) -> Result<(u32, u32), ConfigError> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| ConfigError::InvalidBusinessHours(format!("{raw}: expected start-end")))?;
    let parse_hour = |value: &str| {
        value
            .trim()
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidBusinessHours(format!("{raw}: {error}")))
    };
    let (start, end) = (parse_hour(start)?, parse_hour(end)?);
    if start >= end || end > 24 {
        return Err(ConfigError::InvalidBusinessHours(format!(
            "{raw}: start must be before end and end at most 24"
        )));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Config, ConfigError, DEFAULT_CONTROL_URL};

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values = values.iter().copied().collect::<HashMap<_, _>>();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_from(&[]).expect("defaults parse");
        assert_eq!(config.control_url, DEFAULT_CONTROL_URL);
        assert!(!config.simulate_only);
        assert_eq!(config.max_reconnect_attempts, 15);
        assert_eq!(config.backoff.base_delay_ms, 1_000);
        assert_eq!(config.backoff.growth_factor, 1.5);
        assert_eq!(config.backoff.max_delay_ms, 30_000);
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.command_ack_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_commands, 256);
        assert_eq!(config.reconciler.large_transaction_threshold, 100_000);
        assert_eq!(config.reconciler.idle_after, Duration::from_secs(300));
        assert_eq!(config.simulation.activity_interval, Duration::from_secs(30));
        assert_eq!(config.simulation.metrics_interval, Duration::from_secs(10));
        assert_eq!(config.simulation.activity_probability, 0.3);
        assert_eq!(config.operator.permissions.len(), 2);
    }

    #[test]
    fn parser_applies_env_overrides() {
        let config = config_from(&[
            ("PORTAL_CONTROL_URL", "wss://control.example.com/ws"),
            ("PORTAL_CONTROL_SIMULATE", "yes"),
            ("PORTAL_CONTROL_MAX_RECONNECT_ATTEMPTS", "4"),
            ("PORTAL_CONTROL_BACKOFF_BASE_MS", "250"),
            ("PORTAL_CONTROL_BACKOFF_FACTOR", "2"),
            ("PORTAL_CONTROL_BACKOFF_MAX_MS", "4000"),
            ("PORTAL_CONTROL_LARGE_TRANSACTION_THRESHOLD", "50000"),
            ("PORTAL_CONTROL_COMMAND_ACK_TIMEOUT_SECONDS", "5"),
            ("PORTAL_CONTROL_MAX_PENDING_COMMANDS", "0"),
            ("PORTAL_CONTROL_SIM_ACTIVITY_PROBABILITY", "0.75"),
            ("PORTAL_CONTROL_SIM_BUSINESS_HOURS", "7-22"),
            ("PORTAL_CONTROL_SIM_UTC_OFFSET_HOURS", "-5"),
            ("PORTAL_CONTROL_OPERATOR_ID", "mgr-2"),
            ("PORTAL_CONTROL_OPERATOR_PERMISSIONS", "portal.view, ,portal.control,portal.admin"),
        ])
        .expect("overrides parse");
        assert_eq!(config.control_url, "wss://control.example.com/ws");
        assert!(config.simulate_only);
        assert_eq!(config.max_reconnect_attempts, 4);
        assert_eq!(config.backoff.compute_delay_ms(0), 250);
        assert_eq!(config.backoff.compute_delay_ms(3), 2_000);
        assert_eq!(config.backoff.compute_delay_ms(5), 4_000);
        assert_eq!(config.reconciler.large_transaction_threshold, 50_000);
        assert_eq!(config.command_ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_pending_commands, 1);
        assert_eq!(config.simulation.activity_probability, 0.75);
        assert_eq!(config.simulation.business_hours_start, 7);
        assert_eq!(config.simulation.business_hours_end, 22);
        assert_eq!(config.simulation.utc_offset_hours, -5);
        assert_eq!(config.operator.id, "mgr-2");
        assert_eq!(
            config.operator.permissions,
            vec!["portal.view", "portal.control", "portal.admin"]
        );
    }

    #[test]
    fn parser_rejects_invalid_env_values() {
        let error = config_from(&[("PORTAL_CONTROL_URL", "http://localhost:3001")])
            .expect_err("http url should fail");
        assert!(matches!(error, ConfigError::InvalidControlUrl(_)));

        let error = config_from(&[("PORTAL_CONTROL_SIMULATE", "maybe")])
            .expect_err("bad bool should fail");
        match error {
            ConfigError::InvalidBool(message) => {
                assert!(message.contains("PORTAL_CONTROL_SIMULATE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let error = config_from(&[("PORTAL_CONTROL_BACKOFF_BASE_MS", "soon")])
            .expect_err("bad number should fail");
        match error {
            ConfigError::InvalidNumber(message) => {
                assert!(message.contains("PORTAL_CONTROL_BACKOFF_BASE_MS"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let error = config_from(&[("PORTAL_CONTROL_SIM_BUSINESS_HOURS", "20-8")])
            .expect_err("inverted hours should fail");
        assert!(matches!(error, ConfigError::InvalidBusinessHours(_)));

        let error = config_from(&[("PORTAL_CONTROL_SIM_ACTIVITY_PROBABILITY", "1.5")])
            .expect_err("probability above one should fail");
        assert!(matches!(error, ConfigError::InvalidProbability(_)));
    }
}
