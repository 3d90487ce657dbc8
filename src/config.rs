use crate::quality::{BandwidthFloor, QualityThresholds, Threshold};
use crate::reconnect::ReconnectionConfig;
use crate::session::{BandwidthStrategy, SessionConfig};
use crate::subscription::SimulcastConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
/// Engine configuration. Hosts either construct it programmatically via
/// [`EngineConfig::new`] or load overrides from the environment with
/// [`from_env`].
pub struct EngineConfig {
    /// Shared secret used to verify capability tokens.
    pub token_secret: String,
    /// Logging level (e.g. "info", "debug").
    pub rust_log: String,
    /// Cap applied when a room's own cap is 0. 0 means unlimited.
    pub max_participants_per_room: usize,
    /// Default empty-room reaper timeout. Zero disables reaping.
    pub empty_room_timeout: Duration,
    /// Whether a token join against a missing room creates it.
    pub auto_create_rooms: bool,
    /// Whether new participants are subscribed to existing tracks.
    pub auto_subscribe: bool,
    pub reconnection: ReconnectionConfig,
    pub session: SessionConfig,
    pub simulcast: SimulcastConfig,
    pub quality_thresholds: QualityThresholds,
    /// Samples retained per participant.
    pub quality_history_limit: usize,
}

impl EngineConfig {
    /// Defaults for everything except the token secret, which has no
    /// sensible default.
    pub fn new(token_secret: impl Into<String>) -> Self {
        EngineConfig {
            token_secret: token_secret.into(),
            rust_log: "info".to_string(),
            max_participants_per_room: 0,
            empty_room_timeout: Duration::from_secs(300),
            auto_create_rooms: true,
            auto_subscribe: true,
            reconnection: ReconnectionConfig::default(),
            session: SessionConfig::default(),
            simulcast: SimulcastConfig::default(),
            quality_thresholds: QualityThresholds::default(),
            quality_history_limit: 30,
        }
    }
}

#[derive(Debug)]
/// Errors that can occur during configuration loading.
pub enum ConfigError {
    /// A required environment variable is missing.
    MissingVariable(String),
    /// A variable exists but could not be parsed.
    InvalidValue(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "{} is required", var),
            ConfigError::InvalidValue(var, reason) => {
                write!(f, "{} is invalid: {}", var, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_var(
        key,
        default.as_millis() as u64,
    )?))
}

/// Validates environment variables and returns the engine configuration.
/// `TOKEN_SECRET` is required; everything else has a default.
pub fn from_env() -> Result<EngineConfig, ConfigError> {
    let token_secret = env::var("TOKEN_SECRET")
        .map_err(|_| ConfigError::MissingVariable("TOKEN_SECRET".to_string()))?;

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        eprintln!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let defaults = EngineConfig::new(String::new());

    let reconnection = ReconnectionConfig {
        max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", defaults.reconnection.max_attempts)?,
        initial_delay: parse_millis(
            "RECONNECT_INITIAL_DELAY_MS",
            defaults.reconnection.initial_delay,
        )?,
        max_delay: parse_millis("RECONNECT_MAX_DELAY_MS", defaults.reconnection.max_delay)?,
        backoff_multiplier: parse_var(
            "RECONNECT_BACKOFF_MULTIPLIER",
            defaults.reconnection.backoff_multiplier,
        )?,
        total_timeout: parse_millis(
            "RECONNECT_TOTAL_TIMEOUT_MS",
            defaults.reconnection.total_timeout,
        )?,
    };

    let strategy = match env::var("SESSION_BANDWIDTH_STRATEGY") {
        Err(_) => defaults.session.strategy,
        Ok(raw) => match raw.as_str() {
            "equal" => BandwidthStrategy::Equal,
            "proportional" => BandwidthStrategy::Proportional,
            "priority" => BandwidthStrategy::Priority,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SESSION_BANDWIDTH_STRATEGY".to_string(),
                    format!("unknown strategy '{}'", other),
                ))
            }
        },
    };
    let session = SessionConfig {
        max_rooms_per_user: parse_var(
            "SESSION_MAX_ROOMS_PER_USER",
            defaults.session.max_rooms_per_user,
        )?,
        max_tracks_per_user: parse_var(
            "SESSION_MAX_TRACKS_PER_USER",
            defaults.session.max_tracks_per_user,
        )?,
        max_bandwidth_per_user: parse_var(
            "SESSION_MAX_BANDWIDTH_BPS",
            defaults.session.max_bandwidth_per_user,
        )?,
        session_timeout: parse_millis("SESSION_TIMEOUT_MS", defaults.session.session_timeout)?,
        strategy,
    };

    let simulcast = match env::var("SIMULCAST_LAYERS") {
        Err(_) => defaults.simulcast,
        Ok(raw) => {
            let layers = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::InvalidValue("SIMULCAST_LAYERS".to_string(), e.to_string())
            })?;
            SimulcastConfig::new(layers)
        }
    };

    let quality_thresholds = QualityThresholds {
        packet_loss: Threshold {
            warning: parse_var(
                "QUALITY_PACKET_LOSS_WARNING",
                defaults.quality_thresholds.packet_loss.warning,
            )?,
            critical: parse_var(
                "QUALITY_PACKET_LOSS_CRITICAL",
                defaults.quality_thresholds.packet_loss.critical,
            )?,
        },
        rtt: Threshold {
            warning: parse_var("QUALITY_RTT_WARNING", defaults.quality_thresholds.rtt.warning)?,
            critical: parse_var(
                "QUALITY_RTT_CRITICAL",
                defaults.quality_thresholds.rtt.critical,
            )?,
        },
        jitter: Threshold {
            warning: parse_var(
                "QUALITY_JITTER_WARNING",
                defaults.quality_thresholds.jitter.warning,
            )?,
            critical: parse_var(
                "QUALITY_JITTER_CRITICAL",
                defaults.quality_thresholds.jitter.critical,
            )?,
        },
        min_bandwidth: BandwidthFloor {
            warning: parse_var(
                "QUALITY_MIN_BANDWIDTH_WARNING",
                defaults.quality_thresholds.min_bandwidth.warning,
            )?,
            critical: parse_var(
                "QUALITY_MIN_BANDWIDTH_CRITICAL",
                defaults.quality_thresholds.min_bandwidth.critical,
            )?,
        },
    };

    Ok(EngineConfig {
        token_secret,
        rust_log,
        max_participants_per_room: parse_var(
            "MAX_PARTICIPANTS_PER_ROOM",
            defaults.max_participants_per_room,
        )?,
        empty_room_timeout: parse_millis("EMPTY_ROOM_TIMEOUT_MS", defaults.empty_room_timeout)?,
        auto_create_rooms: parse_var("AUTO_CREATE_ROOMS", defaults.auto_create_rooms)?,
        auto_subscribe: parse_var("AUTO_SUBSCRIBE", defaults.auto_subscribe)?,
        reconnection,
        session,
        simulcast,
        quality_thresholds,
        quality_history_limit: parse_var("QUALITY_HISTORY_LIMIT", defaults.quality_history_limit)?,
    })
}
