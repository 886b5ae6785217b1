use std::{env, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::oracle::RetryPolicy;

const DEFAULT_DB_NAME: &str = "docdot.db";
const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_ORACLE_URL: &str = "https://api.deepseek.com/chat/completions";
pub const DEFAULT_ORACLE_MODEL: &str = "deepseek-chat";
const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_ORACLE_MAX_ATTEMPTS: u32 = 1;

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl OracleConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: DEFAULT_ORACLE_URL.to_string(),
            model: DEFAULT_ORACLE_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_ORACLE_TIMEOUT_SECS),
            max_attempts: DEFAULT_ORACLE_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub oracle: OracleConfig,
    pub export_dir: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self {
            db_path: get_db_path(),
            addr: try_load("DOCDOT_ADDR", SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))),
            oracle: OracleConfig {
                api_key: optional("DEEPSEEK_API_KEY"),
                url: try_load("DOCDOT_ORACLE_URL", DEFAULT_ORACLE_URL.to_string()),
                model: try_load("DOCDOT_ORACLE_MODEL", DEFAULT_ORACLE_MODEL.to_string()),
                timeout: Duration::from_secs(try_load(
                    "DOCDOT_ORACLE_TIMEOUT_SECS",
                    DEFAULT_ORACLE_TIMEOUT_SECS,
                )),
                max_attempts: try_load("DOCDOT_ORACLE_MAX_ATTEMPTS", DEFAULT_ORACLE_MAX_ATTEMPTS),
            },
            export_dir: get_export_dir(),
        }
    }

    pub fn with_db_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.db_path = path;
        }
        self
    }
}

fn optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => {
            warn!("{key} not set, text oracle calls will report unavailable");
            None
        }
    }
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let raw = match env::var(key) {
        Ok(raw) => raw,
        Err(_) => {
            info!("{key} not set, using default: {default}");
            return default;
        }
    };

    raw.parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value '{raw}': {e}, using default: {default}");
        default
    })
}

pub fn get_db_path() -> PathBuf {
    if let Ok(path) = env::var("DOCDOT_DB") {
        return PathBuf::from(path);
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docdot");

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

pub fn get_export_dir() -> PathBuf {
    if let Ok(path) = env::var("DOCDOT_EXPORT_DIR") {
        return PathBuf::from(path);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docdot")
        .join("exports")
}
