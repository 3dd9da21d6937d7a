//! Microsoft Translator client.
//!
//! Failures never surface as errors: a missing key or a failed call yields a
//! human-readable sentinel string in place of the translation.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::TranslatorConfig;

pub const NOT_CONFIGURED: &str = "Error: translation service is not configured.";
pub const FAILED: &str = "Error: the translation service failed.";

#[derive(Deserialize)]
struct TranslationResult {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
    text: String,
}

pub struct Translator {
    config: TranslatorConfig,
    client: reqwest::Client,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub async fn translate(&self, text: &str, source_language: &str, dest_language: &str) -> String {
        let Some(key) = self.config.key.as_deref().filter(|_| self.config.is_configured()) else {
            return NOT_CONFIGURED.to_string();
        };

        let url = format!("{}/translate", self.config.endpoint.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .query(&[
                ("api-version", "3.0"),
                ("from", source_language),
                ("to", dest_language),
            ])
            .header("Ocp-Apim-Subscription-Key", key)
            .header("Ocp-Apim-Subscription-Region", &self.config.region)
            .json(&json!([{ "Text": text }]))
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "translation request rejected");
                return FAILED.to_string();
            }
            Err(e) => {
                tracing::warn!(error = %e, "translation request failed");
                return FAILED.to_string();
            }
        };

        match resp.json::<Vec<TranslationResult>>().await {
            Ok(results) => results
                .into_iter()
                .next()
                .and_then(|r| r.translations.into_iter().next())
                .map(|t| t.text)
                .unwrap_or_else(|| FAILED.to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "malformed translation response");
                FAILED.to_string()
            }
        }
    }
}
