//! Client configuration.
//!
//! Every setting has a default. [`ClientConfig::from_env`] overrides them
//! from `NOSTR_CLIENT_*` environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::manager::StreamConfig;
use crate::negentropy::NegentropySyncConfig;
use crate::outbox::OutboxConfig;
use crate::pool::PoolConfig;
use crate::preloader::PreloaderConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("invalid {key}: {value} is outside {min}..={max}")]
    OutOfRange {
        key: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Settings for every client component.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub stream: StreamConfig,
    pub preloader: PreloaderConfig,
    pub outbox: OutboxConfig,
    pub negentropy: NegentropySyncConfig,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lookup = &lookup;

        let mut pool = defaults.pool;
        pool.relay_config.max_connect_failures = parse_u32(
            lookup,
            "NOSTR_CLIENT_MAX_CONNECT_FAILURES",
            pool.relay_config.max_connect_failures,
            1,
            u32::MAX,
        )?;
        pool.relay_config.keep_log =
            parse_bool(lookup, "NOSTR_CLIENT_KEEP_RELAY_LOG", pool.relay_config.keep_log)?;
        pool.max_queued_requests = parse_usize(
            lookup,
            "NOSTR_CLIENT_MAX_QUEUED_REQUESTS",
            pool.max_queued_requests,
            0,
        )?;
        pool.stale_connecting_after = parse_millis(
            lookup,
            "NOSTR_CLIENT_STALE_CONNECTING_MS",
            pool.stale_connecting_after,
        )?;
        pool.sweep_interval =
            parse_interval(lookup, "NOSTR_CLIENT_SWEEP_INTERVAL_MS", pool.sweep_interval)?;
        pool.eose_timeout =
            parse_millis(lookup, "NOSTR_CLIENT_EOSE_TIMEOUT_MS", pool.eose_timeout)?;
        pool.ephemeral_connect_wait = parse_millis(
            lookup,
            "NOSTR_CLIENT_EPHEMERAL_CONNECT_WAIT_MS",
            pool.ephemeral_connect_wait,
        )?;

        let mut stream = defaults.stream;
        stream.since_margin =
            parse_secs(lookup, "NOSTR_CLIENT_SINCE_MARGIN_SECS", stream.since_margin)?;
        stream.local_retry_delay = parse_millis(
            lookup,
            "NOSTR_CLIENT_LOCAL_RETRY_DELAY_MS",
            stream.local_retry_delay,
        )?;
        stream.network_retry_delay = parse_millis(
            lookup,
            "NOSTR_CLIENT_NETWORK_RETRY_DELAY_MS",
            stream.network_retry_delay,
        )?;

        let mut preloader = defaults.preloader;
        preloader.batch_size_threshold = parse_usize(
            lookup,
            "NOSTR_CLIENT_PRELOAD_BATCH_THRESHOLD",
            preloader.batch_size_threshold,
            1,
        )?;
        preloader.flush_interval = parse_interval(
            lookup,
            "NOSTR_CLIENT_PRELOAD_FLUSH_INTERVAL_MS",
            preloader.flush_interval,
        )?;
        preloader.max_queue_items = parse_usize(
            lookup,
            "NOSTR_CLIENT_PRELOAD_MAX_QUEUE_ITEMS",
            preloader.max_queue_items,
            1,
        )?;

        let mut outbox = defaults.outbox;
        outbox.ttl = parse_secs(lookup, "NOSTR_CLIENT_OUTBOX_TTL_SECS", outbox.ttl)?;
        outbox.max_results_to_inspect = parse_usize(
            lookup,
            "NOSTR_CLIENT_OUTBOX_MAX_RESULTS",
            outbox.max_results_to_inspect,
            1,
        )?;

        let mut negentropy = defaults.negentropy;
        negentropy.round_timeout = parse_millis(
            lookup,
            "NOSTR_CLIENT_NEGENTROPY_ROUND_TIMEOUT_MS",
            negentropy.round_timeout,
        )?;
        negentropy.fetch_batch_size = parse_usize(
            lookup,
            "NOSTR_CLIENT_NEGENTROPY_FETCH_BATCH",
            negentropy.fetch_batch_size,
            1,
        )?;
        negentropy.unsupported_ttl = parse_secs(
            lookup,
            "NOSTR_CLIENT_NEGENTROPY_UNSUPPORTED_TTL_SECS",
            negentropy.unsupported_ttl,
        )?;
        negentropy.negentropy.frame_size_limit = parse_usize(
            lookup,
            "NOSTR_CLIENT_NEGENTROPY_FRAME_SIZE_LIMIT",
            negentropy.negentropy.frame_size_limit,
            0,
        )?;

        Ok(Self {
            pool,
            stream,
            preloader,
            outbox,
            negentropy,
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parser(raw.trim()),
        _ => Ok(default),
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let value = raw.parse::<u64>().map_err(|error| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::OutOfRange {
                key: key.to_string(),
                value,
                min,
                max,
            })
        }
    })
}

fn parse_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    let value = parse_u64(lookup, key, default.into(), min.into(), max.into())?;
    // The range check above keeps the value within u32.
    Ok(u32::try_from(value).unwrap_or(max))
}

fn parse_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize, ConfigError> {
    let to_u64 = |value: usize| u64::try_from(value).unwrap_or(u64::MAX);
    let max = usize::MAX;
    let value = parse_u64(lookup, key, to_u64(default), to_u64(min), to_u64(max))?;
    Ok(usize::try_from(value).unwrap_or(max))
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_u64(lookup, key, default, 0, u64::MAX).map(Duration::from_millis)
}

/// Like [`parse_millis`], but at least one millisecond.
fn parse_interval(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_u64(lookup, key, default, 1, u64::MAX).map(Duration::from_millis)
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_u64(lookup, key, default.as_secs(), 0, u64::MAX).map(Duration::from_secs)
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("expected a boolean, got {other}"),
            }),
        }
    })
}
