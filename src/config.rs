use anyhow::{Context, Result};
use nostr_core::nostr_sdk::{Keys, SecretKey};
use nostr_core::{CoreConfig, Filter, RelayUrl};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Account whose private events get decrypted views
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
    /// Subscriptions registered before replay starts
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RetentionConfig {
    /// Hex pubkeys whose own events and notifications survive trimming
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdentityConfig {
    /// JSON file with an `nsec` field
    pub nsec_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    pub group: String,
    pub key: String,
    pub relays: Vec<String>,
    pub filter: Filter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    pub fn validate(&self) -> Result<()> {
        self.core
            .validate()
            .with_context(|| "Invalid [core] section")?;

        for account in &self.retention.accounts {
            if account.len() != 64 || !account.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("Retention account must be a 64-char hex pubkey: {}", account);
            }
        }

        for query in &self.queries {
            if query.relays.is_empty() {
                anyhow::bail!("Query {}/{} has no relays", query.group, query.key);
            }
            for relay in &query.relays {
                if RelayUrl::parse(relay).is_none() {
                    anyhow::bail!("Query {}/{} has an invalid relay: {}", query.group, query.key, relay);
                }
            }
            query
                .filter
                .validate()
                .with_context(|| format!("Query {}/{} has an invalid filter", query.group, query.key))?;
        }

        Ok(())
    }

    pub fn expand_paths(&mut self) {
        if let Some(identity) = &mut self.identity {
            identity.nsec_file = shellexpand::tilde(&identity.nsec_file).to_string();
        }
    }

    /// Human-readable report for `check-config`.
    pub fn describe(&self) -> Result<Vec<String>> {
        let mut lines = vec!["Configuration is valid".to_string()];
        if let Some(keys) = self.load_keys()? {
            lines.push(format!("Identity loaded: {}", keys.public_key()));
        }
        lines.push(format!("  {} retained accounts", self.retention.accounts.len()));
        for query in &self.queries {
            lines.push(format!(
                "  query {}/{} on {} relays: {}",
                query.group,
                query.key,
                query.relays.len(),
                query.filter.as_json()
            ));
        }
        Ok(lines)
    }

    pub fn load_keys(&self) -> Result<Option<Keys>> {
        let Some(identity) = &self.identity else {
            return Ok(None);
        };
        let content = fs::read_to_string(&identity.nsec_file)
            .with_context(|| format!("Failed to read identity file: {}", identity.nsec_file))?;

        let json: Value = serde_json::from_str(&content)
            .with_context(|| "Failed to parse identity JSON")?;

        let nsec = json
            .get("nsec")
            .and_then(|v| v.as_str())
            .with_context(|| "Identity file must contain 'nsec' field")?;

        let secret_key =
            SecretKey::parse(nsec).map_err(|e| anyhow::anyhow!("Failed to parse nsec: {}", e))?;
        Ok(Some(Keys::new(secret_key)))
    }
}
