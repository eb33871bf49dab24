//! Property-driven configuration for segment generators.
//!
//! A generator is configured from a flat, string-keyed [`Properties`] bag, the
//! way a sharding rule hands options to a pluggable key generator.
//! [`SegmentConfig::from_properties`] validates the whole bag up front so a
//! bad configuration is rejected before any store is contacted.
//!
//! | property                    | default        | constraint           |
//! |-----------------------------|----------------|----------------------|
//! | `key.name`                  | required       | non-empty, no `/`    |
//! | `segment.step`              | `10000`        | `0 < step < u64::MAX`|
//! | `id.initial.value`          | `1`            | `< u64::MAX`         |
//! | `server.list`               | required       | comma separated      |
//! | `store.type`                | `zookeeper`    |                      |
//! | `store.namespace`           | `leaf_segment` | non-empty            |
//! | `lock.retry.spin`           | `64`           |                      |
//! | `lock.retry.initial.micros` | `50`           |                      |
//! | `lock.retry.max.micros`     | `10000`        | `>= initial`         |
//! | `lock.timeout.millis`       | unbounded      |                      |
//! | `handoff.timeout.millis`    | unbounded      |                      |

use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use std::collections::BTreeMap;

use crate::LockRetry;

pub const KEY_NAME: &str = "key.name";
pub const SEGMENT_STEP: &str = "segment.step";
pub const INITIAL_VALUE: &str = "id.initial.value";
pub const SERVER_LIST: &str = "server.list";
pub const STORE_TYPE: &str = "store.type";
pub const STORE_NAMESPACE: &str = "store.namespace";
pub const LOCK_RETRY_SPIN: &str = "lock.retry.spin";
pub const LOCK_RETRY_INITIAL_MICROS: &str = "lock.retry.initial.micros";
pub const LOCK_RETRY_MAX_MICROS: &str = "lock.retry.max.micros";
pub const LOCK_TIMEOUT_MILLIS: &str = "lock.timeout.millis";
pub const HANDOFF_TIMEOUT_MILLIS: &str = "handoff.timeout.millis";

pub const DEFAULT_STEP: u64 = 10_000;
pub const DEFAULT_INITIAL_VALUE: u64 = 1;
pub const DEFAULT_STORE_TYPE: &str = "zookeeper";
pub const DEFAULT_NAMESPACE: &str = "leaf_segment";

const KEY_SEPARATOR: char = '/';

/// Configuration problems detected before a generator is built.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("`{0}` is required")]
    MissingProperty(&'static str),

    #[error("key name `{0}` must not contain '/'")]
    InvalidKeyName(String),

    #[error("`{property}` is not a valid number: `{value}`")]
    InvalidNumber {
        property: &'static str,
        value: String,
    },

    #[error("`segment.step` must satisfy 0 < step < {max}, got {0}", max = u64::MAX)]
    StepOutOfRange(u64),

    #[error("`id.initial.value` must be below {max}, got {0}", max = u64::MAX)]
    InitialValueOutOfRange(u64),

    #[error("`server.list` must name at least one server")]
    EmptyServerList,

    #[error("`store.namespace` must not be empty")]
    EmptyNamespace,

    #[error("lock retry backoff {initial:?} exceeds its cap {max:?}")]
    InvalidBackoff { initial: Duration, max: Duration },
}

/// Flat string-keyed options, e.g. loaded from a rule definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Properties::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> Option<String> {
        self.0.insert(key.into(), value.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // Blank values read as unset.
    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    fn number<T: FromStr>(&self, property: &'static str) -> Result<Option<T>, ConfigError> {
        self.value(property)
            .map(|raw| {
                raw.parse().map_err(|_| ConfigError::InvalidNumber {
                    property,
                    value: raw.to_owned(),
                })
            })
            .transpose()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Properties {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.0
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

/// A validated logical key: one independent ID sequence.
///
/// Rendered as `/<name>` when addressing the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    path: String,
}

impl LogicalKey {
    /// # Errors
    ///
    /// Rejects empty names and names containing `/`.
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::MissingProperty(KEY_NAME));
        }
        if name.contains(KEY_SEPARATOR) {
            return Err(ConfigError::InvalidKeyName(name.to_owned()));
        }
        Ok(Self {
            path: format!("{KEY_SEPARATOR}{name}"),
        })
    }

    /// The configured name, without the leading separator.
    pub fn name(&self) -> &str {
        &self.path[1..]
    }

    /// The store path, `/<name>`.
    pub fn as_str(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Connection parameters handed to a [`StoreFactory`](crate::StoreFactory).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_type: String,
    pub servers: Vec<String>,
    pub namespace: String,
}

/// Everything a segment generator needs, validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentConfig {
    pub key: LogicalKey,
    pub step: u64,
    pub initial_value: u64,
    pub store: StoreConfig,
    pub lock_retry: LockRetry,
    pub handoff_timeout: Option<Duration>,
}

impl SegmentConfig {
    /// Resolves and validates a configuration from `properties`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found, checking the key name, step,
    /// initial value, server list and then the tuning knobs.
    pub fn from_properties(properties: &Properties) -> Result<Self, ConfigError> {
        let name = properties
            .value(KEY_NAME)
            .ok_or(ConfigError::MissingProperty(KEY_NAME))?;
        let key = LogicalKey::new(name)?;

        let step = properties.number(SEGMENT_STEP)?.unwrap_or(DEFAULT_STEP);
        if step == 0 || step == u64::MAX {
            return Err(ConfigError::StepOutOfRange(step));
        }

        let initial_value = properties
            .number(INITIAL_VALUE)?
            .unwrap_or(DEFAULT_INITIAL_VALUE);
        if initial_value == u64::MAX {
            return Err(ConfigError::InitialValueOutOfRange(initial_value));
        }

        let servers: Vec<String> = properties
            .value(SERVER_LIST)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::EmptyServerList);
        }

        let namespace = match properties.get(STORE_NAMESPACE) {
            None => DEFAULT_NAMESPACE.to_owned(),
            Some(ns) if ns.trim().is_empty() => return Err(ConfigError::EmptyNamespace),
            Some(ns) => ns.trim().to_owned(),
        };

        let store = StoreConfig {
            store_type: properties
                .value(STORE_TYPE)
                .unwrap_or(DEFAULT_STORE_TYPE)
                .to_owned(),
            servers,
            namespace,
        };

        let defaults = LockRetry::default();
        let lock_retry = LockRetry {
            spin_limit: properties
                .number(LOCK_RETRY_SPIN)?
                .unwrap_or(defaults.spin_limit),
            initial_backoff: properties
                .number(LOCK_RETRY_INITIAL_MICROS)?
                .map_or(defaults.initial_backoff, Duration::from_micros),
            max_backoff: properties
                .number(LOCK_RETRY_MAX_MICROS)?
                .map_or(defaults.max_backoff, Duration::from_micros),
            timeout: properties
                .number(LOCK_TIMEOUT_MILLIS)?
                .map(Duration::from_millis),
        };
        if lock_retry.initial_backoff > lock_retry.max_backoff {
            return Err(ConfigError::InvalidBackoff {
                initial: lock_retry.initial_backoff,
                max: lock_retry.max_backoff,
            });
        }

        Ok(Self {
            key,
            step,
            initial_value,
            store,
            lock_retry,
            handoff_timeout: properties
                .number(HANDOFF_TIMEOUT_MILLIS)?
                .map(Duration::from_millis),
        })
    }
}

impl TryFrom<&Properties> for SegmentConfig {
    type Error = ConfigError;

    fn try_from(properties: &Properties) -> Result<Self, Self::Error> {
        Self::from_properties(properties)
    }
}
