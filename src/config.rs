use crate::error::{Error, Result};
use crate::providers::ProviderConfig;
use dotenvy::dotenv;
use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: Option<String>,
    pub webhook_secret: String,
    pub notification_webhook_url: Option<String>,
    pub notification_subscribers: HashSet<String>,
    pub callback_rps: u32,
    pub admin_rps: u32,
    pub stale_attempt_hours: i64,
    pub proctoring: ProctoringSettings,
}

/// Read-only platform settings consumed by the lifecycle engine.
#[derive(Debug, Clone)]
pub struct ProctoringSettings {
    pub site_name: String,
    pub platform_name: String,
    pub status_email_from_address: String,
    pub contact_email: Option<String>,
    pub allow_review_updates: bool,
    pub require_failure_second_reviews: bool,
    pub default_review_policy: String,
    pub default_provider: String,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for ProctoringSettings {
    fn default() -> Self {
        Self {
            site_name: "localhost".to_string(),
            platform_name: "Proctoring".to_string(),
            status_email_from_address: "no-reply@localhost".to_string(),
            contact_email: None,
            allow_review_updates: true,
            require_failure_second_reviews: true,
            default_review_policy: "Closed Book".to_string(),
            default_provider: "null".to_string(),
            providers: HashMap::from([("null".to_string(), ProviderConfig::null())]),
        }
    }
}

impl ProctoringSettings {
    /// Looks up `param` in the provider's settings block, falling back to the
    /// platform-wide default for the well-known keys.
    pub fn provider_param(&self, provider_name: &str, param: &str) -> Option<serde_json::Value> {
        let block = self
            .providers
            .get(provider_name)
            .and_then(|p| p.settings.get(param))
            .cloned();
        if block.is_some() {
            return block;
        }
        match param {
            "SITE_NAME" => Some(self.site_name.clone().into()),
            "PLATFORM_NAME" => Some(self.platform_name.clone().into()),
            "STATUS_EMAIL_FROM_ADDRESS" => Some(self.status_email_from_address.clone().into()),
            "CONTACT_EMAIL" => self.contact_email.clone().map(Into::into),
            "ALLOW_REVIEW_UPDATES" => Some(self.allow_review_updates.into()),
            _ => None,
        }
    }

    pub fn allow_review_updates_for(&self, provider_name: &str) -> bool {
        self.provider_param(provider_name, "ALLOW_REVIEW_UPDATES")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.allow_review_updates)
    }
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let providers = match env::var("PROCTORING_BACKEND_PROVIDERS") {
            Ok(raw) => serde_json::from_str::<HashMap<String, ProviderConfig>>(&raw).map_err(|e| {
                Error::Config(format!("Invalid PROCTORING_BACKEND_PROVIDERS: {}", e))
            })?,
            Err(_) => ProctoringSettings::default().providers,
        };
        let default_provider = get_env_or("PROCTORING_DEFAULT_PROVIDER", "null");
        if !providers.contains_key(&default_provider) {
            return Err(Error::Config(format!(
                "Default provider '{}' is not configured in PROCTORING_BACKEND_PROVIDERS",
                default_provider
            )));
        }

        let proctoring = ProctoringSettings {
            site_name: get_env_or("SITE_NAME", "localhost"),
            platform_name: get_env_or("PLATFORM_NAME", "Proctoring"),
            status_email_from_address: get_env_or("STATUS_EMAIL_FROM_ADDRESS", "no-reply@localhost"),
            contact_email: env::var("CONTACT_EMAIL").ok(),
            allow_review_updates: get_env_parse_or("ALLOW_REVIEW_UPDATES", true)?,
            require_failure_second_reviews: get_env_parse_or("REQUIRE_FAILURE_SECOND_REVIEWS", true)?,
            default_review_policy: get_env_or("DEFAULT_REVIEW_POLICY", "Closed Book"),
            default_provider,
            providers,
        };

        let notification_subscribers = get_env_or("NOTIFICATION_SUBSCRIBERS", "WEB_ASSISTANT")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: env::var("DATABASE_URL").ok(),
            webhook_secret: get_env("WEBHOOK_SECRET")?,
            notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL").ok(),
            notification_subscribers,
            callback_rps: get_env_parse("CALLBACK_RPS")?,
            admin_rps: get_env_parse("ADMIN_RPS")?,
            stale_attempt_hours: get_env_parse_or("STALE_ATTEMPT_HOURS", 12)?,
            proctoring,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_env_parse<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(name)?;
    raw.parse()
        .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e)))
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(_) => get_env_parse(name),
        Err(_) => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
