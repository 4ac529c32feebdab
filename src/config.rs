use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

pub const ENV_BACKEND_URL: &str = "BACKOFFICE_BACKEND_URL";
pub const ENV_ANON_KEY: &str = "BACKOFFICE_ANON_KEY";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "BACKOFFICE_TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "BACKOFFICE_TELEGRAM_CHAT_ID";
pub const ENV_ALERT_SOUND: &str = "BACKOFFICE_ALERT_SOUND";
pub const ENV_TABLES: &str = "BACKOFFICE_TABLES";

/// Tables the admin panel works with.
pub const DEFAULT_TABLES: &[&str] = &[
    "products",
    "orders",
    "order_items",
    "customers",
    "employees",
    "transactions",
    "categories",
    "banners",
    "settings",
    "contact_messages",
    "reviews",
    "user_profiles",
];

#[derive(Clone, Debug, PartialEq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: Url,
}

impl TelegramConfig {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self> {
        Ok(Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            api_base: Url::parse("https://api.telegram.org/")?,
        })
    }

    pub fn send_message_url(&self) -> Result<Url> {
        Ok(self
            .api_base
            .join(&format!("./bot{}/sendMessage", self.bot_token))?)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub backend_url: Url,
    pub anon_key: String,
    pub telegram: Option<TelegramConfig>,
    pub alert_sound: PathBuf,
    pub tables: Vec<String>,
    /// Delay before each reconnect attempt; the last entry repeats.
    pub reconnect_backoff: Vec<Duration>,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn new(backend_url: &str, anon_key: &str) -> Result<Self> {
        let mut backend_url =
            Url::parse(backend_url).with_context(|| format!("Invalid backend URL '{}'", backend_url))?;
        if !backend_url.path().ends_with('/') {
            let path = format!("{}/", backend_url.path());
            backend_url.set_path(&path);
        }
        Ok(Self {
            backend_url,
            anon_key: anon_key.to_string(),
            telegram: None,
            alert_sound: PathBuf::from("notification.mp3"),
            tables: DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
            reconnect_backoff: [1, 2, 5, 10].into_iter().map(Duration::from_secs).collect(),
            heartbeat_interval: Duration::from_secs(30),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from whatever `lookup` returns for the `BACKOFFICE_*`
    /// keys. Blank values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend_url = get(ENV_BACKEND_URL).with_context(|| format!("{} is not set", ENV_BACKEND_URL))?;
        let anon_key = get(ENV_ANON_KEY).with_context(|| format!("{} is not set", ENV_ANON_KEY))?;
        let mut config = Self::new(&backend_url, &anon_key)?;

        match (get(ENV_TELEGRAM_BOT_TOKEN), get(ENV_TELEGRAM_CHAT_ID)) {
            (Some(token), Some(chat_id)) => config.telegram = Some(TelegramConfig::new(&token, &chat_id)?),
            _ => log::warn!("Telegram credentials not configured, outbound messages disabled"),
        }
        if let Some(sound) = get(ENV_ALERT_SOUND) {
            config.alert_sound = PathBuf::from(sound);
        }
        if let Some(tables) = get(ENV_TABLES) {
            config.tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    /// Websocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.backend_url.join("realtime/v1/websocket")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => anyhow::bail!("Unsupported backend scheme '{}'", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Failed to switch scheme to {}", scheme))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn rest_url(&self, table: &str) -> Result<Url> {
        Ok(self.backend_url.join(&format!("rest/v1/{}", table))?)
    }

    pub fn storage_upload_url(&self, bucket: &str, path: &str) -> Result<Url> {
        Ok(self
            .backend_url
            .join(&format!("storage/v1/object/{}/{}", bucket, path))?)
    }

    pub fn storage_public_url(&self, bucket: &str, path: &str) -> Result<Url> {
        Ok(self
            .backend_url
            .join(&format!("storage/v1/object/public/{}/{}", bucket, path))?)
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        self.reconnect_backoff
            .get(attempt)
            .or(self.reconnect_backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }
}
