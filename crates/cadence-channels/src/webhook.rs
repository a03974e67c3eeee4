//! Generic HTTP webhook channel — POSTs the message as JSON to a
//! configured endpoint (an SMS gateway bridge, typically).

use async_trait::async_trait;

use cadence_core::config::WebhookChannelConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DeliveryChannel;
use cadence_core::types::Recipient;

pub struct WebhookChannel {
    config: WebhookChannelConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookChannelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn send(&self, recipient: &Recipient, text: &str) -> Result<()> {
        let mut req = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({
                "to": recipient.address,
                "text": text,
            }))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CadenceError::Channel(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook delivery to {} accepted", recipient.address);
            Ok(())
        } else {
            let status = resp.status();
            Err(CadenceError::Channel(format!("Webhook error {status}")))
        }
    }
}
