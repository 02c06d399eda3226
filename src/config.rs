//! Guard configuration. Every flag is independent and defaults to off, so a
//! default guard only keeps the books (running total, registry) and checks
//! nothing.

use std::{env, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix of every environment variable read by [`GuardConfig::from_env()`].
pub const ENV_PREFIX: &str = "OFFHEAP_GUARD_";

/// Which registry implementation backs the guard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryStrategy {
    /// Range-aware when access checking is on, exact otherwise.
    #[default]
    Auto,
    Exact,
    Range,
}

impl RegistryStrategy {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Exact => "exact",
            Self::Range => "range",
        }
    }
}

impl FromStr for RegistryStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "exact" => Ok(Self::Exact),
            "range" => Ok(Self::Range),
            _ => Err(ConfigError::UnknownStrategy(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Freeing or reallocating an untracked address is an error instead of a
    /// warning plus passthrough.
    pub safe_memory_management: bool,
    /// Every absolute access is checked against the registry.
    pub safe_memory_access: bool,
    /// Accesses and frees are arbitrated by the access lock. Only takes
    /// effect together with `safe_memory_access`.
    pub concurrent_access_check: bool,
    /// Route registry traffic of thread-local threads to private registries.
    pub thread_local_memory_usage: bool,
    /// Record the allocation path of every block.
    pub allocation_path_monitoring: bool,
    pub registry: RegistryStrategy,
}

impl GuardConfig {
    /// Read the configuration from `OFFHEAP_GUARD_*` environment variables.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Like [`GuardConfig::from_env()`], but `lookup` is given the variable
    /// name without the prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| -> Result<bool, ConfigError> {
            match lookup(name) {
                None => Ok(false),
                Some(value) => parse_flag(name, &value),
            }
        };
        Ok(Self {
            safe_memory_management: flag("SAFE_MEMORY_MANAGEMENT")?,
            safe_memory_access: flag("SAFE_MEMORY_ACCESS")?,
            concurrent_access_check: flag("CONCURRENT_ACCESS_CHECK")?,
            thread_local_memory_usage: flag("THREAD_LOCAL_MEMORY_USAGE")?,
            allocation_path_monitoring: flag("ALLOCATION_PATH_MONITORING")?,
            registry: match lookup("REGISTRY") {
                None => RegistryStrategy::Auto,
                Some(name) => name.parse()?,
            },
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Is the access lock actually in use?
    pub fn arbitrates_access(&self) -> bool {
        self.safe_memory_access && self.concurrent_access_check
    }

    /// The registry strategy with `Auto` resolved.
    pub fn resolved_registry(&self) -> RegistryStrategy {
        match self.registry {
            RegistryStrategy::Auto if self.safe_memory_access => RegistryStrategy::Range,
            RegistryStrategy::Auto => RegistryStrategy::Exact,
            explicit => explicit,
        }
    }

    /// Check that the flags and strategy can be wired together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry == RegistryStrategy::Exact && self.safe_memory_access {
            return Err(ConfigError::IncompatibleStrategy {
                strategy: self.registry.name(),
                reason: "safe memory access (interior addresses must resolve to their block)",
            });
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: format!("{ENV_PREFIX}{name}"),
            value: value.to_owned(),
        }),
    }
}
