use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

use handsign_engine::EngineConfig;

/// Secrets that ship in sample files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "",
    "changeme",
    "change-me",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub telegram_api: String,
    pub db_path: PathBuf,
    pub photo_dir: PathBuf,
    pub addr: SocketAddr,
    pub jwt_secret: String,
    /// Telegram ids promoted to admin at startup.
    pub admin_ids: Vec<i64>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let bot_token = get("HANDSIGN_BOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .context("HANDSIGN_BOT_TOKEN must be set")?;

        let jwt_secret = get("HANDSIGN_JWT_SECRET").context("HANDSIGN_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("HANDSIGN_JWT_SECRET is a placeholder value, set a real secret");
        }

        let host = var("HANDSIGN_HOST", "0.0.0.0");
        let port: u16 = var("HANDSIGN_PORT", "3000")
            .parse()
            .context("HANDSIGN_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("HANDSIGN_HOST must be an IP address")?;

        let admin_ids = match get("HANDSIGN_ADMIN_IDS") {
            Some(raw) => parse_ids(&raw)?,
            None => Vec::new(),
        };

        let mut engine = EngineConfig {
            shop_url: get("HANDSIGN_SHOP_URL").filter(|u| !u.trim().is_empty()),
            ..Default::default()
        };
        if let Some(limit) = get("HANDSIGN_COMMAND_LIMIT") {
            engine.command_limit = limit
                .parse()
                .context("HANDSIGN_COMMAND_LIMIT must be a number")?;
        }
        if let Some(limit) = get("HANDSIGN_PHOTO_LIMIT") {
            engine.photo_limit = limit.parse().context("HANDSIGN_PHOTO_LIMIT must be a number")?;
        }

        Ok(Self {
            bot_token,
            telegram_api: var("HANDSIGN_TELEGRAM_API", "https://api.telegram.org"),
            db_path: PathBuf::from(var("HANDSIGN_DB_PATH", "handsign.db")),
            photo_dir: PathBuf::from(var("HANDSIGN_PHOTO_DIR", "./photos")),
            addr,
            jwt_secret,
            admin_ids,
            engine,
        })
    }
}

fn parse_ids(raw: &str) -> anyhow::Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("invalid id {:?} in HANDSIGN_ADMIN_IDS", s))
        })
        .collect()
}
