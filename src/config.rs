use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KaonasiConfig {
    pub telegram: TelegramConfig,
    pub remote: RemoteConfig,
    pub storage: StorageConfig,
    pub routing: RoutingConfig,
    pub dispatch: DispatchConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    pub poll_timeout_secs: u64,
    /// Bot @handle used for mention detection. Taken from `getMe` when unset.
    pub handle: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            poll_timeout_secs: 30,
            handle: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub generate_path: Option<String>,
    pub relevance_path: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            generate_path: None,
            relevance_path: None,
            timeout_secs: 15,
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

impl RemoteConfig {
    /// The remote model is used only when both credentials and endpoint exist.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.base_url.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("./data/kaonasi.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub main_threshold: f64,
    pub secondary_threshold: f64,
    pub max_secondary: usize,
    pub secondary_delay_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            main_threshold: 0.6,
            secondary_threshold: 0.4,
            max_secondary: 2,
            secondary_delay_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Persona that answers @mentions.
    pub default_persona: String,
    pub pending_ttl_secs: u64,
    pub pending_capacity: usize,
    pub history_window: usize,
    /// Keywords requested from the remote model when `/add` omits them.
    pub keyword_count: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_persona: "Kaonasi".into(),
            pending_ttl_secs: 120,
            pending_capacity: 1024,
            history_window: 50,
            keyword_count: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: String,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` header value.
    pub secret_token: Option<String>,
    /// Public URL to register with `setWebhook` on startup.
    pub public_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 7300,
            bind: "127.0.0.1".into(),
            secret_token: None,
            public_url: None,
        }
    }
}

impl GatewayConfig {
    pub fn is_loopback(&self) -> bool {
        matches!(self.bind.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `KAONASI_CONFIG` env var
/// 2. `~/.kaonasi/config.toml`
/// 3. Zero-config defaults (no file needed)
pub fn load() -> anyhow::Result<KaonasiConfig> {
    let path = config_path();

    let mut config = if path.exists() {
        let config = load_from_path(&path)?;
        info!("loaded config from {}", path.display());
        config
    } else {
        info!("no config file found, using zero-config defaults");
        KaonasiConfig::default()
    };

    apply_env(&mut config, |key| std::env::var(key).ok());
    if config.remote.api_key.is_none() {
        config.remote.api_key = crate::secrets::load_api_key();
    }
    validate(&config)?;
    Ok(config)
}

/// Parse a config file without env overrides or validation.
pub fn load_from_path(path: &Path) -> anyhow::Result<KaonasiConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    toml::from_str(&content).map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("KAONASI_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".kaonasi").join("config.toml")
}

/// Fill unset values from environment variables. Values present in the file
/// win, except `SQLITE_FILE` and `DEFAULT_PERSONA` which override.
pub fn apply_env(config: &mut KaonasiConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if config.telegram.token.is_none() {
        config.telegram.token = non_empty("TELEGRAM_BOT_TOKEN");
    }
    if config.remote.api_key.is_none() {
        config.remote.api_key = non_empty("DEEPSEEK_API_KEY");
    }
    if config.remote.base_url.is_none() {
        config.remote.base_url = non_empty("DEEPSEEK_BASE_URL");
    }
    if config.remote.generate_path.is_none() {
        config.remote.generate_path = non_empty("DEEPSEEK_GENERATE_PATH");
    }
    if config.remote.relevance_path.is_none() {
        config.remote.relevance_path = non_empty("DEEPSEEK_RELEVANCE_PATH");
    }
    if config.gateway.secret_token.is_none() {
        config.gateway.secret_token = non_empty("KAONASI_WEBHOOK_SECRET");
    }
    if let Some(path) = non_empty("SQLITE_FILE") {
        config.storage.path = PathBuf::from(path);
    }
    if let Some(name) = non_empty("DEFAULT_PERSONA") {
        config.dispatch.default_persona = name;
    }
}

/// Validate the config and return clear error messages.
pub fn validate(config: &KaonasiConfig) -> anyhow::Result<()> {
    let routing = &config.routing;
    for (name, value) in [
        ("routing.main_threshold", routing.main_threshold),
        ("routing.secondary_threshold", routing.secondary_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{name} must be within [0, 1], got {value}");
        }
    }
    if routing.secondary_threshold > routing.main_threshold {
        anyhow::bail!(
            "routing.secondary_threshold ({}) must not exceed routing.main_threshold ({})",
            routing.secondary_threshold,
            routing.main_threshold
        );
    }

    if let Some(base_url) = config.remote.base_url.as_deref() {
        url::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("invalid remote.base_url '{base_url}': {e}"))?;
    }

    if config.dispatch.pending_capacity == 0 {
        anyhow::bail!("dispatch.pending_capacity must be > 0");
    }
    if config.dispatch.history_window == 0 {
        anyhow::bail!("dispatch.history_window must be > 0");
    }
    if config.dispatch.default_persona.trim().is_empty() {
        anyhow::bail!("dispatch.default_persona must not be empty");
    }

    if !config.gateway.is_loopback() && config.gateway.secret_token.is_none() {
        anyhow::bail!(
            "gateway.secret_token is required when binding to non-loopback address '{}'",
            config.gateway.bind
        );
    }

    Ok(())
}
