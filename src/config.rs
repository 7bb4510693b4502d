use std::{net::SocketAddr, path::PathBuf};

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct PrometheusConfig {
    /// The URL of the Prometheus push gateway.
    pub url: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum MetricConfig {
    PrometheusPush(PrometheusConfig),
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding uploaded objects, served under `/storage`.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/storage"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ModerationConfig {
    /// Number of distinct flags that moves a comment into the `flagged` queue.
    pub flag_threshold: i64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self { flag_threshold: 3 }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EmbeddingsConfig {
    pub api_key: String,
    #[serde(default = "default_embeddings_url")]
    pub base_url: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    #[serde(default = "default_email_url")]
    pub base_url: String,
    pub from: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub listen_address: Option<SocketAddr>,
    /// Public host name of the site, e.g. `aikya.example`.
    pub host_name: String,
    /// SQLite connection string.
    pub db: String,
    #[serde(default)]
    pub test: bool,
    /// Accounts created with one of these emails are granted admin.
    #[serde(default)]
    pub admin_emails: Vec<String>,
    /// Shared secret for the scheduled job endpoints. Jobs are disabled without it.
    pub cron_secret: Option<String>,
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    pub embeddings: Option<EmbeddingsConfig>,
    pub email: Option<EmailConfig>,
    pub metrics: Option<MetricConfig>,
}

impl AppConfig {
    /// Base URL of the public site, without a trailing slash.
    pub fn site_url(&self) -> String {
        if self.test {
            format!("http://{}", self.host_name)
        } else {
            format!("https://{}", self.host_name)
        }
    }
}

fn default_embeddings_url() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_owned()
}

const fn default_batch_size() -> i64 {
    50
}

fn default_email_url() -> String {
    "https://api.resend.com".to_owned()
}

const fn default_session_ttl_days() -> i64 {
    30
}
