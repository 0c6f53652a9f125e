//! Engine configuration.
//!
//! [`EngineConfig`] is handed to [`JobEngine::new`](crate::JobEngine::new) and
//! supplies the defaults every chunk step falls back to when its builder does
//! not override them.

use crate::error::ConfigError;
use crate::policy::{RetryPolicy, SkipPolicy};
use std::str::FromStr;

/// Chunk settings used by steps that do not override them.
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub chunk_size: usize,
    /// Maximum number of chunk commits running at once.
    pub concurrency_limit: usize,
    pub skip_policy: SkipPolicy,
    pub retry_policy: RetryPolicy,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            concurrency_limit: 10,
            skip_policy: SkipPolicy::FailFast,
            retry_policy: RetryPolicy::none(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub step_defaults: StepDefaults,
    /// Whether jobs that do not say otherwise may re-run a completed instance.
    pub restart_completed_by_default: bool,
}

impl EngineConfig {
    /// Defaults overlaid with `IRONBATCH_*` environment variables.
    ///
    /// Recognized: `IRONBATCH_CHUNK_SIZE`, `IRONBATCH_CONCURRENCY`,
    /// `IRONBATCH_RETRY_LIMIT`, `IRONBATCH_SKIP_LIMIT`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to something unparsable or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let defaults = &mut config.step_defaults;

        if let Some(v) = parse_var::<usize>(&lookup, "IRONBATCH_CHUNK_SIZE")? {
            defaults.chunk_size = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "IRONBATCH_CONCURRENCY")? {
            defaults.concurrency_limit = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "IRONBATCH_RETRY_LIMIT")? {
            defaults.retry_policy = RetryPolicy::attempts(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "IRONBATCH_SKIP_LIMIT")? {
            defaults.skip_policy = SkipPolicy::skip_limit(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Rejects a zero chunk size or concurrency limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sizes(
            self.step_defaults.chunk_size,
            self.step_defaults.concurrency_limit,
        )
    }
}

pub(crate) fn validate_sizes(chunk_size: usize, concurrency_limit: usize) -> Result<(), ConfigError> {
    if chunk_size == 0 {
        return Err(ConfigError::ZeroChunkSize);
    }
    if concurrency_limit == 0 {
        return Err(ConfigError::ZeroConcurrency);
    }
    Ok(())
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        })
}
