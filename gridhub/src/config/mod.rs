//! Hub configuration loading and validation.
//!
//! All tunables of the orchestration core in one value, passed explicitly
//! through constructors — no ambient globals. The expected YAML structure is:
//!
//! ```yaml
//! active_queue_size: 10
//! max_stale: 20
//! stale_penalty_mult: 10.0
//! in_progress_boost: 1.2
//! heartbeat_timeout_secs: 60
//! health_check_interval_secs: 30
//! orchestration_interval_secs: 5
//! validation_threshold: 0.5
//! trust_inc: 0.5
//! trust_dec: 0.5
//! trust_min: 1.0
//! trust_max: 10.0
//! trust_initial: 5.0
//! mechanism: custom        # or: fifo
//! preemption_band: 1.3
//! ```
//!
//! Every key is optional; absent keys fall back to the defaults above.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

// ── Mechanism ─────────────────────────────────────────────────────────────────

/// Process-wide scheduling mechanism selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Resource/trust-aware priority scheduling with preemption.
    #[default]
    Custom,
    /// Strict oldest-first admission; candidates ordered by heartbeat age.
    Fifo,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Custom => "custom",
            Mechanism::Fifo => "fifo",
        }
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

/// Tunable parameters of the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cap on tasks in `{in_queue, in_progress}`.
    pub active_queue_size: usize,

    /// Staleness cap: at it, `in_queue` tasks fail; failed tasks at it are
    /// garbage-collected.
    pub max_stale: u32,

    /// Priority penalty per stale increment.
    pub stale_penalty_mult: f64,

    /// Priority multiplier for in-progress tasks.
    pub in_progress_boost: f64,

    /// Silence threshold before an active node is demoted to inactive.
    ///
    /// The upstream deployment notes disagree on this value (1, 2 and 5
    /// minutes appear in different places); 60 s is the deliberate default
    /// and the knob is here precisely so operators can widen it.
    pub heartbeat_timeout_secs: u64,

    /// Liveness scan period.
    pub health_check_interval_secs: u64,

    /// Orchestration tick period.
    pub orchestration_interval_secs: u64,

    /// Minimum weighted-vote fraction required to accept a winning result.
    pub validation_threshold: f64,

    /// Trust reward for nodes that voted with the winner.
    pub trust_inc: f64,

    /// Trust penalty for nodes that voted against the winner.
    pub trust_dec: f64,

    /// Lower trust clamp.
    pub trust_min: f64,

    /// Upper trust clamp.
    pub trust_max: f64,

    /// Trust assigned at registration, clamped into `[trust_min, trust_max]`.
    pub trust_initial: f64,

    /// Scheduling mechanism: `custom` or `fifo`.
    pub mechanism: Mechanism,

    /// Hysteresis factor of the preemptive reorder: a backlog task must beat
    /// the weakest queued task by this multiple before a swap happens.
    /// Damps swap oscillation; `1.0` recovers band-free preemption.
    pub preemption_band: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_queue_size: 10,
            max_stale: 20,
            stale_penalty_mult: 10.0,
            in_progress_boost: 1.2,
            heartbeat_timeout_secs: 60,
            health_check_interval_secs: 30,
            orchestration_interval_secs: 5,
            validation_threshold: 0.5,
            trust_inc: 0.5,
            trust_dec: 0.5,
            trust_min: 1.0,
            trust_max: 10.0,
            trust_initial: 5.0,
            mechanism: Mechanism::Custom,
            preemption_band: 1.3,
        }
    }
}

impl Config {
    /// Parse a YAML configuration file, falling back to defaults for absent
    /// keys, then validate.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, the YAML is
    /// structurally invalid, or validation rejects the values.
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading hub configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration: {}", path.display()))?;

        info!(
            active_queue_size = config.active_queue_size,
            mechanism = config.mechanism.as_str(),
            heartbeat_timeout_secs = config.heartbeat_timeout_secs,
            "Hub configuration loaded"
        );
        Ok(config)
    }

    /// Reject configurations the core cannot operate under.
    ///
    /// An invalid configuration is fatal: the host must not start ticking
    /// with it.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.active_queue_size == 0 {
            return Err(ConfigError::EmptyActiveQueue);
        }
        if !(self.trust_min < self.trust_max) {
            return Err(ConfigError::TrustRangeInverted {
                min: self.trust_min,
                max: self.trust_max,
            });
        }
        if !(0.0..=1.0).contains(&self.validation_threshold) {
            return Err(ConfigError::ThresholdOutOfRange {
                value: self.validation_threshold,
            });
        }
        if self.trust_inc < 0.0 || self.trust_dec < 0.0 {
            return Err(ConfigError::NegativeTrustStep {
                inc: self.trust_inc,
                dec: self.trust_dec,
            });
        }
        if self.preemption_band <= 0.0 {
            return Err(ConfigError::NonPositiveBand {
                value: self.preemption_band,
            });
        }
        if self.health_check_interval_secs == 0 || self.orchestration_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Registration trust, clamped into the configured range.
    pub fn initial_trust(&self) -> f64 {
        self.trust_initial.clamp(self.trust_min, self.trust_max)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn orchestration_interval(&self) -> Duration {
        Duration::from_secs(self.orchestration_interval_secs)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Validation failures for a loaded [`Config`]. All fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("active_queue_size must be at least 1")]
    EmptyActiveQueue,

    #[error("trust_min ({min}) must be strictly below trust_max ({max})")]
    TrustRangeInverted { min: f64, max: f64 },

    #[error("validation_threshold must be within [0, 1], got {value}")]
    ThresholdOutOfRange { value: f64 },

    #[error("trust steps must be non-negative (inc {inc}, dec {dec})")]
    NegativeTrustStep { inc: f64, dec: f64 },

    #[error("preemption_band must be positive, got {value}")]
    NonPositiveBand { value: f64 },

    #[error("tick intervals must be non-zero")]
    ZeroInterval,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
