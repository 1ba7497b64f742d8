//! Notification transports.
//!
//! Messages are pre-formatted HTML strings. Delivery is best-effort: the
//! caller logs a failed send and carries on.

pub mod telegram;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{AlertsConfig, AppConfig};
use crate::types::RegimeError;

pub use telegram::TelegramNotifier;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    async fn send(&self, message: &str) -> Result<(), RegimeError>;
}

/// Writes messages to the log. Used when no transport is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &str) -> Result<(), RegimeError> {
        info!(message, "Notification");
        Ok(())
    }
}

/// Build the configured transport, falling back to the log when the
/// Telegram secrets are not configured or not set.
pub fn from_config(alerts: &AlertsConfig) -> Box<dyn Notifier> {
    let (Some(token_env), Some(chat_env)) = (
        alerts.telegram_bot_token_env.as_deref(),
        alerts.telegram_chat_id_env.as_deref(),
    ) else {
        return Box::new(LogNotifier);
    };

    match (AppConfig::resolve_env(token_env), AppConfig::resolve_env(chat_env)) {
        (Ok(token), Ok(chat_id)) => match TelegramNotifier::new(token, chat_id) {
            Ok(telegram) => Box::new(telegram),
            Err(e) => {
                warn!(error = %e, "Telegram client unavailable, notifications go to the log");
                Box::new(LogNotifier)
            }
        },
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Telegram not configured, notifications go to the log");
            Box::new(LogNotifier)
        }
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
