//! Outbound email.
//!
//! The application builds [`Email`] values and hands them to a [`Mailer`],
//! which delivers through the configured [`MailTransport`]. `log` only
//! records the email; `outbox` writes each one as a JSON file, which is what
//! tests and local development inspect.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{MailConfig, MailTransportKind};
use crate::models::{now_millis, User};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub text_body: String,
    pub html_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &Email) -> Result<()>;
}

/// Logs each email at `info` and discards it.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, email: &Email) -> Result<()> {
        tracing::info!(
            subject = %email.subject,
            recipients = ?email.recipients,
            attachments = email.attachments.len(),
            "email sent (log transport)"
        );
        Ok(())
    }
}

/// Writes one `<millis>-<uuid>.json` file per email.
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl MailTransport for OutboxTransport {
    async fn deliver(&self, email: &Email) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create outbox: {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("{}-{}.json", now_millis(), uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(email)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write email: {}", path.display()))?;
        tracing::debug!(path = %path.display(), subject = %email.subject, "email written to outbox");
        Ok(())
    }
}

#[derive(Clone)]
pub struct Mailer {
    transport: Arc<dyn MailTransport>,
    sender: String,
}

impl Mailer {
    pub fn new(transport: Arc<dyn MailTransport>, sender: impl Into<String>) -> Self {
        Self {
            transport,
            sender: sender.into(),
        }
    }

    pub fn from_config(config: &MailConfig) -> Result<Self> {
        let transport: Arc<dyn MailTransport> = match config.transport {
            MailTransportKind::Log => Arc::new(LogTransport),
            MailTransportKind::Outbox => {
                let dir = config
                    .outbox_dir
                    .clone()
                    .context("mail.outbox_dir is required for the outbox transport")?;
                Arc::new(OutboxTransport::new(dir))
            }
        };
        Ok(Self::new(transport, config.sender.clone()))
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Deliver and wait for the result.
    pub async fn send(&self, email: &Email) -> Result<()> {
        self.transport.deliver(email).await
    }

    /// Deliver on a detached task. Failures are logged, never returned.
    pub fn send_detached(&self, email: Email) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.deliver(&email).await {
                tracing::error!(subject = %email.subject, error = ?e, "email delivery failed");
            }
        });
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn reset_password_email(sender: &str, user: &User, token: &str) -> Email {
    let name = escape_html(&user.username);
    Email {
        subject: "[Microblog] Reset Your Password".to_string(),
        sender: sender.to_string(),
        recipients: vec![user.email.clone()],
        text_body: format!(
            "Dear {},\n\nTo reset your password, submit a new password to:\n\n\
             POST /auth/reset_password/{}\n\n\
             If you have not requested a password reset simply ignore this message.\n\n\
             Sincerely,\n\nThe Microblog Team\n",
            user.username, token
        ),
        html_body: format!(
            "<p>Dear {},</p>\
             <p>To reset your password, submit a new password to:</p>\
             <p><code>POST /auth/reset_password/{}</code></p>\
             <p>If you have not requested a password reset simply ignore this message.</p>\
             <p>Sincerely,</p><p>The Microblog Team</p>",
            name, token
        ),
        attachments: Vec::new(),
    }
}

pub fn export_posts_email(sender: &str, user: &User, posts_json: String) -> Email {
    let name = escape_html(&user.username);
    Email {
        subject: "[Microblog] Your blog posts".to_string(),
        sender: sender.to_string(),
        recipients: vec![user.email.clone()],
        text_body: format!(
            "Dear {},\n\nPlease find attached the archive of your posts that you requested.\n\n\
             Sincerely,\n\nThe Microblog Team\n",
            user.username
        ),
        html_body: format!(
            "<p>Dear {},</p>\
             <p>Please find attached the archive of your posts that you requested.</p>\
             <p>Sincerely,</p><p>The Microblog Team</p>",
            name
        ),
        attachments: vec![Attachment {
            filename: "posts.json".to_string(),
            content_type: "application/json".to_string(),
            data: posts_json,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user() -> User {
        User {
            id: 1,
            username: "<susan>".into(),
            email: "susan@example.com".into(),
            password_hash: String::new(),
            about_me: None,
            last_seen: None,
            last_message_read_time: None,
        }
    }

    #[test]
    fn reset_email_carries_token_and_escapes_html() {
        let email = reset_password_email("noreply@x", &user(), "tok123");
        assert_eq!(email.recipients, vec!["susan@example.com"]);
        assert!(email.text_body.contains("tok123"));
        assert!(email.html_body.contains("&lt;susan&gt;"));
        assert!(email.attachments.is_empty());
    }

    #[test]
    fn export_email_attaches_posts_json() {
        let email = export_posts_email("noreply@x", &user(), "{}".into());
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "posts.json");
        assert_eq!(email.attachments[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn outbox_writes_one_file_per_email() {
        let tmp = TempDir::new().unwrap();
        let outbox = tmp.path().join("outbox");
        let mailer = Mailer::new(Arc::new(OutboxTransport::new(outbox.clone())), "noreply@x");

        let email = reset_password_email(mailer.sender(), &user(), "t");
        mailer.send(&email).await.unwrap();
        mailer.send(&email).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(&outbox).unwrap().collect();
        assert_eq!(files.len(), 2);
        let path = files[0].as_ref().unwrap().path();
        let stored: Email = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(stored, email);
    }

    #[test]
    fn outbox_config_requires_dir() {
        let cfg = MailConfig {
            transport: MailTransportKind::Outbox,
            ..MailConfig::default()
        };
        assert!(Mailer::from_config(&cfg).is_err());
        assert!(Mailer::from_config(&MailConfig::default()).is_ok());
    }
}
