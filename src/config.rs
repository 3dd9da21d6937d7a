//! TOML configuration.
//!
//! A single file configures the primary database, the HTTP server, the
//! search backend, the job queue, outbound mail, the translator client and
//! logging. Secrets may come from the environment instead of the file:
//! `MICROBLOG_SECRET_KEY` overrides `[app].secret_key` and
//! `MS_TRANSLATOR_KEY` fills in `[translator].key` when it is absent.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub app: AppConfig,
    #[serde(default)]
    pub search: SearchConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub translator: TranslatorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_posts_per_page")]
    pub posts_per_page: i64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: i64,
    #[serde(default = "default_reset_token_ttl")]
    pub reset_token_ttl_secs: i64,
}

fn default_posts_per_page() -> i64 {
    25
}
fn default_session_ttl() -> i64 {
    7 * 24 * 3600
}
fn default_reset_token_ttl() -> i64 {
    600
}

/// Which full-text search service mirrors indexable entities.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    Disabled,
    Memory,
    Sqlite,
    Elasticsearch,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_backend")]
    pub backend: SearchBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: SearchBackend::Disabled,
            path: None,
            url: None,
            timeout_secs: 10,
        }
    }
}

fn default_search_backend() -> SearchBackend {
    SearchBackend::Disabled
}
fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub path: PathBuf,
    /// How long finished jobs stay visible before `purge-jobs` evicts them.
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: i64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_result_ttl() -> i64 {
    500
}
fn default_poll_interval() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailTransportKind {
    Log,
    Outbox,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_mail_transport")]
    pub transport: MailTransportKind,
    #[serde(default)]
    pub outbox_dir: Option<PathBuf>,
    #[serde(default = "default_sender")]
    pub sender: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: MailTransportKind::Log,
            outbox_dir: None,
            sender: default_sender(),
        }
    }
}

fn default_mail_transport() -> MailTransportKind {
    MailTransportKind::Log
}
fn default_sender() -> String {
    "no-reply@microblog.local".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslatorConfig {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_translator_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            key: None,
            region: default_region(),
            endpoint: default_translator_endpoint(),
            timeout_secs: 10,
        }
    }
}

fn default_region() -> String {
    "westeurope".to_string()
}
fn default_translator_endpoint() -> String {
    "https://api.cognitive.microsofttranslator.com".to_string()
}

impl TranslatorConfig {
    pub fn is_configured(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("MICROBLOG_SECRET_KEY") {
        if !key.is_empty() {
            config.app.secret_key = key;
        }
    }
    if !config.translator.is_configured() {
        if let Ok(key) = std::env::var("MS_TRANSLATOR_KEY") {
            config.translator.key = Some(key);
        }
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.app.secret_key.trim().is_empty() {
        anyhow::bail!("app.secret_key must be set (or MICROBLOG_SECRET_KEY)");
    }

    if config.app.posts_per_page < 1 {
        anyhow::bail!("app.posts_per_page must be >= 1");
    }

    if config.app.session_ttl_secs < 1 || config.app.reset_token_ttl_secs < 1 {
        anyhow::bail!("app token lifetimes must be >= 1 second");
    }

    match config.search.backend {
        SearchBackend::Sqlite if config.search.path.is_none() => {
            anyhow::bail!("search.path is required when backend is 'sqlite'")
        }
        SearchBackend::Elasticsearch if config.search.url.is_none() => {
            anyhow::bail!("search.url is required when backend is 'elasticsearch'")
        }
        _ => {}
    }

    if config.mail.transport == MailTransportKind::Outbox && config.mail.outbox_dir.is_none() {
        anyhow::bail!("mail.outbox_dir is required when transport is 'outbox'");
    }

    if config.queue.result_ttl_secs < 0 {
        anyhow::bail!("queue.result_ttl_secs must be >= 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Config {
        let content = format!(
            r#"
[db]
path = "/tmp/mb.sqlite"

[server]
bind = "127.0.0.1:5000"

[app]
secret_key = "s3cret"

[queue]
path = "/tmp/mb-queue.sqlite"
{}
"#,
            extra
        );
        toml::from_str(&content).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse("");
        assert_eq!(cfg.app.posts_per_page, 25);
        assert_eq!(cfg.app.reset_token_ttl_secs, 600);
        assert_eq!(cfg.search.backend, SearchBackend::Disabled);
        assert_eq!(cfg.mail.transport, MailTransportKind::Log);
        assert_eq!(cfg.queue.result_ttl_secs, 500);
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.translator.is_configured());
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn sqlite_backend_requires_path() {
        let cfg = parse("[search]\nbackend = \"sqlite\"\n");
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("search.path"), "{}", err);
    }

    #[test]
    fn elasticsearch_backend_requires_url() {
        let cfg = parse("[search]\nbackend = \"elasticsearch\"\n");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn outbox_transport_requires_dir() {
        let cfg = parse("[mail]\ntransport = \"outbox\"\n");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_empty_secret() {
        let mut cfg = parse("");
        cfg.app.secret_key = "  ".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_page_size() {
        let mut cfg = parse("");
        cfg.app.posts_per_page = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_backend_fails_to_parse() {
        let content = r#"
[db]
path = "x"
[server]
bind = "x"
[app]
secret_key = "k"
[queue]
path = "q"
[search]
backend = "solr"
"#;
        assert!(toml::from_str::<Config>(content).is_err());
    }
}
