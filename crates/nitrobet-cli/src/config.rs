//! TOML configuration for the `nitrobet` binary.
//!
//! ```toml
//! [client]
//! clearnode_url = "ws://127.0.0.1:8100"
//! asset = "usdc"
//!
//! [wallet]
//! address = "0x1111111111111111111111111111111111111111"
//! secret = "dev-wallet"
//! dealer_secret = "dev-dealer"
//! ```
//!
//! Missing tables and fields fall back to their defaults.

use nitrobet_core::{Address, ClientConfig, ConfigError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub client: ClientConfig,
    pub wallet: WalletConfig,
}

/// Keys for the local development signers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub address: Address,
    pub secret: String,
    /// Secret used to countersign app-session closes as the dealer.
    pub dealer_secret: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            address: "0x1111111111111111111111111111111111111111"
                .parse()
                .unwrap_or_else(|_| Address::zero()),
            secret: "nitrobet-dev-wallet".to_string(),
            dealer_secret: "nitrobet-dev-dealer".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

impl CliConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigFileError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigFileError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply command-line overrides, then validate.
    pub fn finish(mut self, clearnode_url: Option<String>) -> Result<Self, ConfigFileError> {
        if let Some(url) = clearnode_url {
            self.client.clearnode_url = url;
        }
        self.client.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = CliConfig::parse(
            r#"
            [client]
            clearnode_url = "ws://127.0.0.1:8100"
            channel_update_timeout_ms = 5000

            [wallet]
            secret = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.clearnode_url, "ws://127.0.0.1:8100");
        assert_eq!(config.client.channel_update_timeout_ms, 5000);
        assert_eq!(config.client.quorum, 2);
        assert_eq!(config.wallet.secret, "abc");
        assert_eq!(config.wallet.dealer_secret, "nitrobet-dev-dealer");
    }

    #[test]
    fn override_wins_and_validation_runs() {
        let config = CliConfig::default()
            .finish(Some("ws://localhost:9000".into()))
            .unwrap();
        assert_eq!(config.client.clearnode_url, "ws://localhost:9000");

        let mut short = CliConfig::default();
        short.client.challenge_secs = 60;
        assert!(matches!(short.finish(None), Err(ConfigFileError::Invalid(_))));
    }

    #[test]
    fn bad_address_is_a_parse_error() {
        let err = CliConfig::parse("[wallet]\naddress = \"0x12\"\n").unwrap_err();
        assert!(err.to_string().contains("wallet") || err.to_string().contains("address"));
    }
}
