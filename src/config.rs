use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};

pub const VALIDATOR_TIMEOUT_ENV: &str = "SCHEMA_VALIDATOR_TIMEOUT_MS";
pub const PRIMARY_KEY_PREFIX_ENV: &str = "SCHEMA_PRIMARY_KEY_PREFIX";

const DEFAULT_VALIDATOR_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PRIMARY_KEY_PREFIX: &str = "pk_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Upper bound on one structural validator round-trip.
    #[serde(rename = "validatorTimeoutMs", with = "millis")]
    pub validator_timeout: Duration,
    /// Name prefix of primary-key constraints created by the cascade.
    pub primary_key_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validator_timeout: Duration::from_millis(DEFAULT_VALIDATOR_TIMEOUT_MS),
            primary_key_prefix: DEFAULT_PRIMARY_KEY_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the known keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(VALIDATOR_TIMEOUT_ENV) {
            let millis = raw.trim().parse::<u64>().map_err(|err| {
                LibError::invalid_with_code(
                    "invalid_config",
                    "Validator timeout must be a whole number of milliseconds",
                    anyhow!("{}={:?}: {}", VALIDATOR_TIMEOUT_ENV, raw, err),
                )
            })?;
            if millis == 0 {
                return Err(LibError::invalid_with_code(
                    "invalid_config",
                    "Validator timeout must be positive",
                    anyhow!("{}=0", VALIDATOR_TIMEOUT_ENV),
                ));
            }
            config.validator_timeout = Duration::from_millis(millis);
        }

        if let Some(prefix) = lookup(PRIMARY_KEY_PREFIX_ENV) {
            config.primary_key_prefix = prefix;
        }

        Ok(config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
