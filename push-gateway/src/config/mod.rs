use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub redis: RedisConfig,
    pub automation: AutomationConfig,
    pub apns: Option<ApnsConfig>,
    pub gcm: Option<GcmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub address: String,
    pub port: u16,
    /// Base path the control API is mounted under.
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Redelivery and feedback automation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Enable the periodic redelivery loop.
    pub auto_redeliver: bool,
    /// Delivery attempts after which a message is retired permanently.
    pub redeliver_attempts: u32,
    /// Drop devices reported unsubscribed instead of marking them dead.
    pub auto_deregister: bool,
    /// Seconds between redelivery passes.
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApnsMode {
    Sandbox,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsConfig {
    /// PKCS#12 bundle holding the push certificate and key.
    pub p12_path: String,
    pub p12_password: String,
    pub mode: ApnsMode,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcmConfig {
    pub project_id: String,
    pub api_key: String,
    pub pool_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let apns = match std::env::var("APNS_P12_PATH") {
            Ok(p12_path) => {
                let mode = match std::env::var("APNS_MODE")
                    .unwrap_or_else(|_| "sandbox".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "sandbox" => ApnsMode::Sandbox,
                    "production" => ApnsMode::Production,
                    other => {
                        return Err(
                            format!("APNS_MODE must be 'sandbox' or 'production', got '{other}'")
                                .into(),
                        )
                    }
                };
                Some(ApnsConfig {
                    p12_path,
                    p12_password: std::env::var("APNS_P12_PASSWORD").unwrap_or_default(),
                    mode,
                    pool_size: std::env::var("APNS_POOL_SIZE")
                        .unwrap_or_else(|_| "1".to_string())
                        .parse()?,
                })
            }
            Err(_) => None,
        };

        let gcm_project = std::env::var("GCM_PROJECT_ID").ok();
        let gcm_key = std::env::var("GCM_API_KEY").ok();
        let gcm = match (gcm_project, gcm_key) {
            (Some(project_id), Some(api_key)) => Some(GcmConfig {
                project_id,
                api_key,
                pool_size: std::env::var("GCM_POOL_SIZE")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
            }),
            (None, None) => None,
            _ => {
                return Err(
                    "both GCM_PROJECT_ID and GCM_API_KEY must be set in order to use GCM".into(),
                )
            }
        };

        Ok(Config {
            api: ApiConfig {
                address: std::env::var("API_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("API_PORT")
                    .unwrap_or_else(|_| "7446".to_string())
                    .parse()?,
                base: std::env::var("API_BASE").unwrap_or_else(|_| "/api".to_string()),
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            automation: AutomationConfig {
                auto_redeliver: std::env::var("AUTO_REDELIVER")
                    .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                    .unwrap_or(true),
                redeliver_attempts: std::env::var("REDELIVER_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                auto_deregister: std::env::var("AUTO_DEREGISTER")
                    .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                    .unwrap_or(true),
                retry_interval_secs: std::env::var("RETRY_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
            },
            apns,
            gcm,
        })
    }
}
