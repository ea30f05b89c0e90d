//! Notification channels: Telegram and a log-only fallback.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::info;

use crate::common::config::NotifyCfg;
use crate::common::error::{PersonaError, Result};

const SERVICE: &str = "notification channel";

/// Fire-and-forget text message sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str) -> Result<()>;
}

/// Writes messages to the log only.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) -> Result<()> {
        info!(channel = "log", text, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

/// Telegram bot `sendMessage` with Markdown formatting.
pub struct TelegramNotifier {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub const API_BASE: &'static str = "https://api.telegram.org";

    pub fn new(api_base: &str, token: &str, chat_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PersonaError::external(SERVICE, err))?;
        Ok(Self {
            client,
            url: format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/')),
            chat_id: chat_id.into(),
        })
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, text: &str) -> Result<()> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "Markdown",
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|err| PersonaError::external(SERVICE, err.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            // The URL carries the bot token; report the status only.
            return Err(PersonaError::external(SERVICE, format!("telegram returned {status}")));
        }
        info!(channel = "telegram", "notification sent");
        Ok(())
    }
}

/// Telegram when both token and chat id are configured, otherwise the log.
pub fn from_cfg(cfg: &NotifyCfg) -> Result<Box<dyn Notifier>> {
    match (&cfg.bot_token, &cfg.chat_id) {
        (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => Ok(Box::new(
            TelegramNotifier::new(
                TelegramNotifier::API_BASE,
                token,
                chat.clone(),
                Duration::from_secs(cfg.timeout_secs),
            )?,
        )),
        _ => Ok(Box::new(LogNotifier)),
    }
}
