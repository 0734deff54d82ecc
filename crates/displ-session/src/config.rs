use std::time::Duration;

use displ_buffers::CookiePolicy;
use displ_input::{OverflowPolicy, PumpConfig, DEFAULT_QUEUE_DEPTH};
use thiserror::Error;

/// `drop` or `block`.
pub const RING_FULL_ENV: &str = "DISPL_BE_RING_FULL";
/// How long a blocked input event waits for the guest, in milliseconds.
pub const RING_FULL_TIMEOUT_MS_ENV: &str = "DISPL_BE_RING_FULL_TIMEOUT_MS";
pub const INPUT_QUEUE_DEPTH_ENV: &str = "DISPL_BE_INPUT_QUEUE_DEPTH";
/// `replace` or `reject`.
pub const COOKIE_POLICY_ENV: &str = "DISPL_BE_COOKIE_POLICY";
pub const ZERO_COPY_ENV: &str = "DISPL_BE_ZERO_COPY";
pub const MAP_CPU_ENV: &str = "DISPL_BE_MAP_CPU";

const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?} (expected {expected})")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Backend policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    /// What the input pump does when the guest's ring is full.
    pub ring_full: OverflowPolicy,
    /// Depth of the queue between input callbacks and the ring worker.
    pub input_queue_depth: usize,
    /// What happens when a display buffer is created under a live cookie.
    pub cookie_policy: CookiePolicy,
    /// Import display buffers into the GPU when a zero-copy device pair is available.
    pub zero_copy: bool,
    /// CPU-map zero-copy buffers even if the display sink does not require it.
    pub map_cpu: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ring_full: OverflowPolicy::Drop,
            input_queue_depth: DEFAULT_QUEUE_DEPTH,
            cookie_policy: CookiePolicy::Replace,
            zero_copy: true,
            map_cpu: false,
        }
    }
}

impl BackendConfig {
    /// Read `DISPL_BE_*` variables from the process environment, with defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`BackendConfig::from_env`] with variables taken from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        let timeout = match get(RING_FULL_TIMEOUT_MS_ENV) {
            Some(raw) => Duration::from_millis(parse_number(RING_FULL_TIMEOUT_MS_ENV, &raw)?),
            None => DEFAULT_BLOCK_TIMEOUT,
        };
        if let Some(raw) = get(RING_FULL_ENV) {
            config.ring_full = match raw.to_ascii_lowercase().as_str() {
                "drop" => OverflowPolicy::Drop,
                "block" => OverflowPolicy::Block { timeout },
                _ => return Err(invalid(RING_FULL_ENV, raw, "drop or block")),
            };
        }

        if let Some(raw) = get(INPUT_QUEUE_DEPTH_ENV) {
            let depth = parse_number(INPUT_QUEUE_DEPTH_ENV, &raw)?;
            config.input_queue_depth = usize::try_from(depth)
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| invalid(INPUT_QUEUE_DEPTH_ENV, raw, "a positive integer"))?;
        }

        if let Some(raw) = get(COOKIE_POLICY_ENV) {
            config.cookie_policy = match raw.to_ascii_lowercase().as_str() {
                "replace" => CookiePolicy::Replace,
                "reject" => CookiePolicy::Reject,
                _ => return Err(invalid(COOKIE_POLICY_ENV, raw, "replace or reject")),
            };
        }

        if let Some(raw) = get(ZERO_COPY_ENV) {
            config.zero_copy = parse_bool(ZERO_COPY_ENV, &raw)?;
        }
        if let Some(raw) = get(MAP_CPU_ENV) {
            config.map_cpu = parse_bool(MAP_CPU_ENV, &raw)?;
        }
        Ok(config)
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            overflow: self.ring_full,
            queue_depth: self.input_queue_depth,
        }
    }
}

fn invalid(var: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        expected,
    }
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(var, raw.to_owned(), "an unsigned integer"))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    let v = raw.to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw.to_owned(), "a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<BackendConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackendConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from_pairs(&[]).unwrap(), BackendConfig::default());
        assert_eq!(from_pairs(&[(RING_FULL_ENV, "  ")]).unwrap(), BackendConfig::default());
    }

    #[test]
    fn block_policy_with_timeout() {
        let config = from_pairs(&[(RING_FULL_ENV, "Block"), (RING_FULL_TIMEOUT_MS_ENV, "250")]).unwrap();
        assert_eq!(
            config.ring_full,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(250)
            }
        );
        assert_eq!(config.pump_config().overflow, config.ring_full);

        let config = from_pairs(&[(RING_FULL_ENV, "block")]).unwrap();
        assert_eq!(
            config.ring_full,
            OverflowPolicy::Block {
                timeout: DEFAULT_BLOCK_TIMEOUT
            }
        );
    }

    #[test]
    fn every_knob() {
        let config = from_pairs(&[
            (INPUT_QUEUE_DEPTH_ENV, "8"),
            (COOKIE_POLICY_ENV, "reject"),
            (ZERO_COPY_ENV, "off"),
            (MAP_CPU_ENV, "1"),
        ])
        .unwrap();
        assert_eq!(config.input_queue_depth, 8);
        assert_eq!(config.cookie_policy, CookiePolicy::Reject);
        assert!(!config.zero_copy);
        assert!(config.map_cpu);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        assert_eq!(
            from_pairs(&[(RING_FULL_ENV, "wait")]),
            Err(ConfigError::Invalid {
                var: RING_FULL_ENV,
                value: "wait".into(),
                expected: "drop or block",
            })
        );
        assert!(from_pairs(&[(INPUT_QUEUE_DEPTH_ENV, "0")]).is_err());
        assert!(from_pairs(&[(INPUT_QUEUE_DEPTH_ENV, "-3")]).is_err());
        assert!(from_pairs(&[(ZERO_COPY_ENV, "maybe")]).is_err());
        assert!(from_pairs(&[(COOKIE_POLICY_ENV, "keep")]).is_err());
    }
}
