use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use nudge_core::validate::is_snowflake;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared config handle. Readers call `.load()` for a lock-free snapshot.
pub(crate) type SharedConfig = Arc<ArcSwap<Config>>;

/// Wrap a `Config` in an `ArcSwap` for lock-free sharing.
pub(crate) fn shared_config(config: Config) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub(crate) struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ticks: TickConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Default console log filter; RUST_LOG overrides.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Public base URL of this gateway. When set, outbound reminders
    /// carry signed acknowledge/decline links pointing here.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_data_dir() -> String {
    "./state".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DiscordConfig {
    /// Name of the env var holding the bot token. Secrets never live in
    /// the config file itself.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Application id, included in delivery metadata.
    #[serde(default)]
    pub application_id: Option<String>,
    /// Interaction-signature public key (hex). Verification happens in
    /// the fronting proxy; carried here so ops configure one place.
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_token_env() -> String {
    "NUDGE_DISCORD_TOKEN".to_owned()
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            application_id: None,
            public_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AuthConfig {
    /// Actor ids permitted to create/modify reminders.
    #[serde(default)]
    pub admins: Vec<String>,
    /// Name of the env var holding the ack-link signing secret.
    #[serde(default = "default_ack_secret_env")]
    pub ack_secret_env: String,
}

fn default_ack_secret_env() -> String {
    "NUDGE_ACK_SECRET".to_owned()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            ack_secret_env: default_ack_secret_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TickConfig {
    #[serde(default = "default_due_interval")]
    pub due_interval_secs: u64,
    #[serde(default = "default_escalation_interval")]
    pub escalation_interval_secs: u64,
}

fn default_due_interval() -> u64 {
    60
}

fn default_escalation_interval() -> u64 {
    120
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            due_interval_secs: default_due_interval(),
            escalation_interval_secs: default_escalation_interval(),
        }
    }
}

impl Config {
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        explicit.map_or_else(|| PathBuf::from("./nudge.toml"), PathBuf::from)
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the bot token from the configured env var.
    pub(crate) fn discord_token(&self) -> Result<String> {
        std::env::var(&self.discord.token_env)
            .with_context(|| format!("env var {} is not set", self.discord.token_env))
    }

    /// Resolve the ack-link signing secret from the configured env var.
    pub(crate) fn ack_secret(&self) -> Result<Vec<u8>> {
        let raw = std::env::var(&self.auth.ack_secret_env)
            .with_context(|| format!("env var {} is not set", self.auth.ack_secret_env))?;
        Ok(raw.into_bytes())
    }

    pub(crate) fn is_admin(&self, actor: &str) -> bool {
        self.auth.admins.iter().any(|id| id == actor)
    }

    /// Static validation problems, for `nudge check`.
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.gateway.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!(
                "gateway.bind_addr '{}' is not a socket address",
                self.gateway.bind_addr
            ));
        }
        if self.ticks.due_interval_secs == 0 {
            problems.push("ticks.due_interval_secs must be > 0".to_owned());
        }
        if self.ticks.escalation_interval_secs == 0 {
            problems.push("ticks.escalation_interval_secs must be > 0".to_owned());
        }
        if self.auth.admins.is_empty() {
            problems.push("auth.admins is empty: nobody can manage reminders".to_owned());
        }
        for admin in &self.auth.admins {
            if !is_snowflake(admin) {
                problems.push(format!("auth.admins entry '{admin}' is not a user id"));
            }
        }
        if let Some(key) = &self.discord.public_key
            && hex::decode(key).is_err()
        {
            problems.push("discord.public_key is not valid hex".to_owned());
        }
        problems
    }
}
