//! Environment configuration.
//!
//! `EngineConfig::from_env()` loads `.env` (if present) and reads every
//! setting with a default. A chain with no RPC URL runs against the in-memory
//! simulated chain ("mock mode").

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

use crate::amm::{FeeRate, DEFAULT_FEE_BPS};
use crate::bridge::CoordinatorConfig;
use crate::chain::abi;
use crate::chain::polygon::PolygonConfig;
use crate::chain::solana::{Pubkey, SolanaConfig};
use crate::chain::ConfirmationPolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} is required when {because}")]
    Missing { key: &'static str, because: &'static str },

    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Live endpoint for the EVM chain
#[derive(Debug, Clone)]
pub struct PolygonSettings {
    pub rpc_url: String,
    pub contracts: PolygonConfig,
}

/// Live endpoint for the account-model chain
#[derive(Debug, Clone)]
pub struct SolanaSettings {
    pub rpc_url: String,
    pub programs: SolanaConfig,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log_level: Level,
    pub listen_addr: SocketAddr,
    /// `None` runs the simulated chain
    pub polygon: Option<PolygonSettings>,
    pub solana: Option<SolanaSettings>,
    pub fee: FeeRate,
    pub confirmation: ConfirmationPolicy,
    pub retry: RetryPolicy,
    pub attestation_max_attempts: u32,
    pub guardian_api_url: Option<String>,
    pub guardian_set_index: u32,
    pub guardian_addresses: Vec<[u8; 20]>,
    pub oracle_api_url: Option<String>,
    pub journal_path: PathBuf,
    pub scheduler_interval: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let fee_bps: u32 = env.parse("FEE_BPS", DEFAULT_FEE_BPS)?;
        let fee = FeeRate::from_bps(fee_bps).map_err(|e| ConfigError::Invalid {
            key: "FEE_BPS",
            value: fee_bps.to_string(),
            reason: e.to_string(),
        })?;

        let retry = RetryPolicy::new(
            env.parse("RETRY_MAX_ATTEMPTS", 5)?,
            Duration::from_millis(env.parse("RETRY_INITIAL_DELAY_MS", 500)?),
            Duration::from_millis(env.parse("RETRY_MAX_DELAY_MS", 30_000)?),
        )
        .with_jitter(Duration::from_millis(env.parse("RETRY_JITTER_MS", 250)?));

        let guardian_api_url = env.get("GUARDIAN_API_URL");
        let guardian_addresses = match env.get("GUARDIAN_ADDRESSES") {
            Some(list) => parse_guardians(&list)?,
            None => Vec::new(),
        };
        if guardian_api_url.is_some() && guardian_addresses.is_empty() {
            return Err(ConfigError::Missing {
                key: "GUARDIAN_ADDRESSES",
                because: "GUARDIAN_API_URL is set",
            });
        }

        Ok(Self {
            log_level: env.parse("LOG_LEVEL", Level::INFO)?,
            listen_addr: env.parse("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 1234)))?,
            polygon: polygon_settings(&env)?,
            solana: solana_settings(&env)?,
            fee,
            confirmation: ConfirmationPolicy::new(
                Duration::from_secs(env.parse("CONFIRMATION_TIMEOUT_SECS", 90)?),
                Duration::from_millis(env.parse("CONFIRMATION_POLL_MS", 2_000)?),
            ),
            retry,
            attestation_max_attempts: env.parse("ATTESTATION_MAX_ATTEMPTS", 60)?,
            guardian_api_url,
            guardian_set_index: env.parse("GUARDIAN_SET_INDEX", 0)?,
            guardian_addresses,
            oracle_api_url: env.get("ORACLE_API_URL"),
            journal_path: env.get("JOURNAL_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data/bridge-journal")),
            scheduler_interval: Duration::from_secs(env.parse("SCHEDULER_INTERVAL_SECS", 60)?),
        })
    }

    /// Both chains simulated
    pub fn is_mock_mode(&self) -> bool {
        self.polygon.is_none() && self.solana.is_none()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();
        CoordinatorConfig {
            attestation_retry: RetryPolicy {
                max_attempts: self.attestation_max_attempts.max(1),
                ..defaults.attestation_retry
            },
            step_retry: self.retry.clone(),
            ..defaults
        }
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn require(&self, key: &'static str, because: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing { key, because })
    }
}

fn polygon_settings(env: &Env<'_>) -> Result<Option<PolygonSettings>, ConfigError> {
    let Some(rpc_url) = env.get("POLYGON_RPC_URL") else {
        return Ok(None);
    };
    const BECAUSE: &str = "POLYGON_RPC_URL is set";
    let evm_address = |key: &'static str| -> Result<String, ConfigError> {
        let value = env.require(key, BECAUSE)?;
        match abi::parse_address(&value) {
            Some(address) => Ok(abi::format_address(&address)),
            None => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a 20-byte 0x address".into(),
            }),
        }
    };
    Ok(Some(PolygonSettings {
        rpc_url,
        contracts: PolygonConfig {
            chain_id: env.parse("POLYGON_CHAIN_ID", 137)?,
            market_contract: evm_address("POLYGON_MARKET_CONTRACT")?,
            usdc: evm_address("POLYGON_USDC")?,
            bridge_contract: evm_address("POLYGON_BRIDGE_CONTRACT")?,
        },
    }))
}

fn solana_settings(env: &Env<'_>) -> Result<Option<SolanaSettings>, ConfigError> {
    let Some(rpc_url) = env.get("SOLANA_RPC_URL") else {
        return Ok(None);
    };
    const BECAUSE: &str = "SOLANA_RPC_URL is set";
    let key_of = |key: &'static str| -> Result<Pubkey, ConfigError> {
        let value = env.require(key, BECAUSE)?;
        value.parse().map_err(|e: crate::error::ValidationError| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        })
    };
    Ok(Some(SolanaSettings {
        rpc_url,
        programs: SolanaConfig {
            market_program: key_of("SOLANA_MARKET_PROGRAM")?,
            bridge_program: key_of("SOLANA_BRIDGE_PROGRAM")?,
            usdc_mint: key_of("SOLANA_USDC_MINT")?,
        },
    }))
}

fn parse_guardians(list: &str) -> Result<Vec<[u8; 20]>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            abi::parse_address(s).ok_or_else(|| ConfigError::Invalid {
                key: "GUARDIAN_ADDRESSES",
                value: s.to_string(),
                reason: "expected 20-byte 0x addresses, comma separated".into(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_are_mock_mode() {
        let config = config(&[]).unwrap();
        assert!(config.is_mock_mode());
        assert_eq!(config.fee.bps(), 200);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.listen_addr.port(), 1234);
        assert_eq!(config.confirmation.timeout, Duration::from_secs(90));
        assert_eq!(config.coordinator_config().attestation_retry.max_attempts, 60);
    }

    #[test]
    fn test_live_polygon_requires_contracts() {
        let err = config(&[("POLYGON_RPC_URL", "https://polygon-rpc.com")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "POLYGON_MARKET_CONTRACT",
                because: "POLYGON_RPC_URL is set"
            }
        );

        let config = config(&[
            ("POLYGON_RPC_URL", "https://polygon-rpc.com"),
            ("POLYGON_MARKET_CONTRACT", "0x00000000000000000000000000000000000000AA"),
            ("POLYGON_USDC", "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359"),
            ("POLYGON_BRIDGE_CONTRACT", "0x00000000000000000000000000000000000000bb"),
        ])
        .unwrap();
        let polygon = config.polygon.unwrap();
        assert_eq!(polygon.contracts.chain_id, 137);
        assert_eq!(polygon.contracts.market_contract, "0x00000000000000000000000000000000000000aa");
        assert!(config.solana.is_none());
    }

    #[test]
    fn test_invalid_values_are_reported() {
        assert!(matches!(
            config(&[("FEE_BPS", "20000")]).unwrap_err(),
            ConfigError::Invalid { key: "FEE_BPS", .. }
        ));
        assert!(matches!(
            config(&[("LOG_LEVEL", "chatty")]).unwrap_err(),
            ConfigError::Invalid { key: "LOG_LEVEL", .. }
        ));
        assert!(matches!(
            config(&[("GUARDIAN_API_URL", "https://api.wormholescan.io")]).unwrap_err(),
            ConfigError::Missing { key: "GUARDIAN_ADDRESSES", .. }
        ));
    }
}
