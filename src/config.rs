//! Configuration types.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which recommendation strategy the advisor prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvisorStrategy {
    /// Top-ranked candidate, no external calls.
    #[default]
    Algorithmic,
    /// External model call with algorithmic fallback.
    Generative,
}

impl FromStr for AdvisorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "algorithmic" => Ok(Self::Algorithmic),
            "generative" | "llm" => Ok(Self::Generative),
            other => Err(format!("unknown advisor strategy: {other}")),
        }
    }
}

/// Recommendation advisor configuration.
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub strategy: AdvisorStrategy,
    /// Upper bound on a single generative call.
    pub timeout: Duration,
    /// How many similar past tasks to pull into the prompt.
    pub history_top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            strategy: AdvisorStrategy::Algorithmic,
            timeout: Duration::from_secs(30),
            history_top_k: 5,
            temperature: 0.2,
            max_tokens: 512,
        }
    }
}

/// Supervisor sweep configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// In-progress tasks due within this window are reassignment candidates.
    pub at_risk_horizon: chrono::Duration,
    /// A task reassigned more recently than this is left alone.
    pub reassign_cooldown: chrono::Duration,
    /// In-progress tasks this far past their due date are failed.
    pub overdue_grace: chrono::Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            at_risk_horizon: chrono::Duration::days(2),
            reassign_cooldown: chrono::Duration::hours(24),
            overdue_grace: chrono::Duration::hours(72),
        }
    }
}

/// Top-level allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub supervisor: SupervisorConfig,
    pub advisor: AdvisorConfig,
    pub db_path: PathBuf,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            advisor: AdvisorConfig::default(),
            db_path: PathBuf::from("./data/allocator.db"),
        }
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Upper bound for the hour-based windows, ten years. Keeps `now ± window`
/// well inside the representable date range.
const MAX_WINDOW_HOURS: i64 = 24 * 365 * 10;

fn positive_hours(key: &str, default: chrono::Duration) -> Result<chrono::Duration, ConfigError> {
    let hours: i64 = env_or(key, default.num_hours())?;
    if !(0..=MAX_WINDOW_HOURS).contains(&hours) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be between 0 and {MAX_WINDOW_HOURS}, got {hours}"),
        });
    }
    chrono::Duration::try_hours(hours).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{hours} hours is out of range"),
    })
}

impl AllocatorConfig {
    /// Load from `ALLOCATOR_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let interval_secs: u64 = env_or(
            "ALLOCATOR_SWEEP_INTERVAL_SECS",
            defaults.supervisor.interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ALLOCATOR_SWEEP_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let supervisor = SupervisorConfig {
            interval: Duration::from_secs(interval_secs),
            at_risk_horizon: positive_hours(
                "ALLOCATOR_AT_RISK_HOURS",
                defaults.supervisor.at_risk_horizon,
            )?,
            reassign_cooldown: positive_hours(
                "ALLOCATOR_REASSIGN_COOLDOWN_HOURS",
                defaults.supervisor.reassign_cooldown,
            )?,
            overdue_grace: positive_hours(
                "ALLOCATOR_OVERDUE_GRACE_HOURS",
                defaults.supervisor.overdue_grace,
            )?,
        };

        let strategy = match std::env::var("ALLOCATOR_ADVISOR") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "ALLOCATOR_ADVISOR".to_string(),
                message,
            })?,
            Err(_) => defaults.advisor.strategy,
        };

        let advisor = AdvisorConfig {
            strategy,
            timeout: Duration::from_secs(env_or(
                "ALLOCATOR_ADVISOR_TIMEOUT_SECS",
                defaults.advisor.timeout.as_secs(),
            )?),
            history_top_k: env_or("ALLOCATOR_HISTORY_TOP_K", defaults.advisor.history_top_k)?,
            temperature: env_or("ALLOCATOR_ADVISOR_TEMPERATURE", defaults.advisor.temperature)?,
            max_tokens: env_or("ALLOCATOR_ADVISOR_MAX_TOKENS", defaults.advisor.max_tokens)?,
        };

        let db_path = std::env::var("ALLOCATOR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        Ok(Self {
            supervisor,
            advisor,
            db_path,
        })
    }
}
