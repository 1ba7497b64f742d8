//! Telegram Bot API transport (`sendMessage`, HTML parse mode).

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Notifier;
use crate::types::RegimeError;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramNotifier {
    http: Client,
    token: Secret<String>,
    chat_id: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self, RegimeError> {
        Self::with_api_base(token, chat_id, API_BASE)
    }

    /// Point at a different Bot API host (tests, self-hosted API servers).
    pub fn with_api_base(token: String, chat_id: String, api_base: &str) -> Result<Self, RegimeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .map_err(|e| Self::error(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            token: Secret::new(token),
            chat_id,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn error(message: impl Into<String>) -> RegimeError {
        RegimeError::Notifier {
            notifier: "telegram".into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, message: &str) -> Result<(), RegimeError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token.expose_secret());
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        // Errors are stripped of the URL so the token never reaches the log
        let resp = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::error(e.without_url().to_string()))?;

        let status = resp.status();
        let body: SendMessageResponse = resp
            .json()
            .await
            .map_err(|e| Self::error(format!("HTTP {status}: {}", e.without_url())))?;

        if !body.ok {
            return Err(Self::error(format!(
                "HTTP {status}: {}",
                body.description.unwrap_or_else(|| "no description".into())
            )));
        }

        debug!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}
