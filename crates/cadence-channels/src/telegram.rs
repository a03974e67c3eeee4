//! Telegram channel — sends via the Bot API `sendMessage` call.
//! The recipient address is used as the chat id when it looks like
//! one; otherwise the configured fallback chat receives the message.

use async_trait::async_trait;

use cadence_core::config::TelegramChannelConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DeliveryChannel;
use cadence_core::types::Recipient;

pub struct TelegramChannel {
    config: TelegramChannelConfig,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramChannelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn chat_id<'a>(&'a self, recipient: &'a Recipient) -> &'a str {
        let addr = recipient.address.as_str();
        let numeric = addr.strip_prefix('-').unwrap_or(addr);
        if !numeric.is_empty() && numeric.chars().all(|c| c.is_ascii_digit()) {
            addr
        } else {
            &self.config.chat_id
        }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(&self, recipient: &Recipient, text: &str) -> Result<()> {
        let chat_id = self.chat_id(recipient);
        if chat_id.is_empty() {
            return Err(CadenceError::Channel(
                "No Telegram chat id for recipient and no fallback configured".into(),
            ));
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.config.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": escape_markdown(text),
                "parse_mode": "Markdown"
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CadenceError::Channel(format!("Telegram send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Telegram delivery to chat {chat_id}");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CadenceError::Channel(format!("Telegram API error {status}: {body}")))
        }
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(fallback: &str) -> TelegramChannel {
        TelegramChannel::new(TelegramChannelConfig {
            bot_token: "token".into(),
            chat_id: fallback.into(),
            enabled: true,
        })
    }

    fn recipient(address: &str) -> Recipient {
        Recipient {
            id: "r1".into(),
            address: address.into(),
            timezone: None,
            language: None,
        }
    }

    #[test]
    fn numeric_address_is_chat_id() {
        let ch = channel("999");
        assert_eq!(ch.chat_id(&recipient("-10012345")), "-10012345");
        assert_eq!(ch.chat_id(&recipient("12345")), "12345");
    }

    #[test]
    fn non_numeric_address_uses_fallback() {
        let ch = channel("999");
        assert_eq!(ch.chat_id(&recipient("+1555123")), "999");
    }

    #[test]
    fn markdown_is_escaped() {
        assert_eq!(escape_markdown("a_b*c"), "a\\_b\\*c");
    }
}
