//! Configuration types
//!
//! Every query and mutation is driven by an explicit configuration struct
//! rather than library-wide defaults. [`SyncConfig`] bundles the defaults a
//! `SyncContext` hands to each entry point; it can be built in code, parsed
//! from TOML, or read from `RIPPLE_*` environment variables.

use crate::{ConfigError, SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound accepted for any retry count.
pub const MAX_RETRIES: u32 = 10;

// ============================================================================
// BACKOFF
// ============================================================================

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_millis")]
        delay: Duration,
    },
    /// `min(base * 2^attempt, cap)`.
    Exponential {
        #[serde(rename = "base_ms", with = "duration_millis")]
        base: Duration,
        #[serde(rename = "cap_ms", with = "duration_millis")]
        cap: Duration,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential { base, cap }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Delay to wait before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, cap } => {
                let multiplier = 2u32.saturating_pow(attempt);
                base.saturating_mul(multiplier).min(*cap)
            }
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry policy for remote calls. Only transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    /// Query default: 3 retries, exponential from 1s capped at 30s.
    pub fn queries() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::exponential(Duration::from_millis(1000), Duration::from_millis(30_000)),
        }
    }

    /// Mutation default: 1 retry after 1s.
    pub fn mutations() -> Self {
        Self {
            retries: 1,
            backoff: Backoff::fixed(Duration::from_millis(1000)),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Backoff::None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a failed attempt number `attempt` (0-indexed) may be retried.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.retries
    }

    fn validate(&self, field: &str) -> SyncResult<()> {
        if self.retries > MAX_RETRIES {
            return Err(invalid(
                format!("{}.retries", field),
                self.retries.to_string(),
                format!("retries must be at most {}", MAX_RETRIES),
            ));
        }

        if let Backoff::Exponential { base, cap } = self.backoff {
            if base.is_zero() {
                return Err(invalid(
                    format!("{}.backoff.base_ms", field),
                    format!("{:?}", base),
                    "exponential base must be positive".to_string(),
                ));
            }
            if cap < base {
                return Err(invalid(
                    format!("{}.backoff.cap_ms", field),
                    format!("{:?}", cap),
                    "cap must not be smaller than base".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::queries()
    }
}

// ============================================================================
// QUERY / MUTATION / SAGA
// ============================================================================

/// Per-query options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// How long a fetched value stays fresh. Zero means stale immediately.
    #[serde(rename = "stale_after_ms", with = "duration_millis")]
    pub stale_after: Duration,
    /// How long an unobserved record is retained before eviction.
    #[serde(rename = "gc_after_ms", with = "duration_millis")]
    pub gc_after: Duration,
    pub retry: RetryConfig,
    /// Disabled queries never fetch; they only report cached data.
    pub enabled: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::ZERO,
            gc_after: Duration::from_millis(300_000),
            retry: RetryConfig::queries(),
            enabled: true,
        }
    }
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application preset: fresh for 5 minutes, retained for 10.
    pub fn long_lived() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            gc_after: Duration::from_secs(10 * 60),
            ..Self::default()
        }
    }

    pub fn with_stale_after(mut self, duration: Duration) -> Self {
        self.stale_after = duration;
        self
    }

    pub fn with_gc_after(mut self, duration: Duration) -> Self {
        self.gc_after = duration;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.retry.validate("query.retry")
    }
}

/// Mutation pipeline options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationConfig {
    pub retry: RetryConfig,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::mutations(),
        }
    }
}

impl MutationConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.retry.validate("mutation.retry")
    }
}

/// Saga coordinator options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Delete uploaded assets when a later step (or a sibling upload) fails.
    /// When false, uploaded assets are left in object storage.
    pub cleanup_orphaned_assets: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            cleanup_orphaned_assets: true,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Defaults for every entry point of a synchronization context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub query: QueryConfig,
    pub mutation: MutationConfig,
    pub saga: SagaConfig,
}

impl SyncConfig {
    /// Validate the configuration.
    ///
    /// Validates:
    /// - retry counts are at most [`MAX_RETRIES`]
    /// - exponential backoff has a positive base and `cap >= base`
    pub fn validate(&self) -> SyncResult<()> {
        self.query.validate()?;
        self.mutation.validate()?;
        Ok(())
    }

    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(source: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| {
            SyncError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `RIPPLE_STALE_AFTER_MS`: Query freshness window (default: 0)
    /// - `RIPPLE_GC_AFTER_MS`: Retention of unobserved records (default: 300000)
    /// - `RIPPLE_QUERY_RETRIES`: Query retries (default: 3)
    /// - `RIPPLE_BACKOFF_BASE_MS`: Exponential backoff base (default: 1000)
    /// - `RIPPLE_BACKOFF_CAP_MS`: Exponential backoff cap (default: 30000)
    /// - `RIPPLE_MUTATION_RETRIES`: Mutation retries (default: 1)
    /// - `RIPPLE_SAGA_CLEANUP_ASSETS`: "true" or "false" (default: true)
    pub fn from_env() -> SyncResult<Self> {
        let defaults = Self::default();
        let (default_base, default_cap) = match defaults.query.retry.backoff {
            Backoff::Exponential { base, cap } => (base, cap),
            _ => (Duration::from_millis(1000), Duration::from_millis(30_000)),
        };

        let config = Self {
            query: QueryConfig {
                stale_after: env_millis("RIPPLE_STALE_AFTER_MS")
                    .unwrap_or(defaults.query.stale_after),
                gc_after: env_millis("RIPPLE_GC_AFTER_MS").unwrap_or(defaults.query.gc_after),
                retry: RetryConfig {
                    retries: env_parse("RIPPLE_QUERY_RETRIES")
                        .unwrap_or(defaults.query.retry.retries),
                    backoff: Backoff::exponential(
                        env_millis("RIPPLE_BACKOFF_BASE_MS").unwrap_or(default_base),
                        env_millis("RIPPLE_BACKOFF_CAP_MS").unwrap_or(default_cap),
                    ),
                },
                enabled: true,
            },
            mutation: MutationConfig {
                retry: defaults
                    .mutation
                    .retry
                    .with_retries(env_parse("RIPPLE_MUTATION_RETRIES").unwrap_or(
                        defaults.mutation.retry.retries,
                    )),
            },
            saga: SagaConfig {
                cleanup_orphaned_assets: std::env::var("RIPPLE_SAGA_CLEANUP_ASSETS")
                    .map(|s| s.to_lowercase() != "false")
                    .unwrap_or(defaults.saga.cleanup_orphaned_assets),
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn invalid(field: String, value: String, reason: String) -> SyncError {
    SyncError::Config(ConfigError::InvalidValue {
        field,
        value,
        reason,
    })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// =============================================================================
// TESTS
// =============================================================================
