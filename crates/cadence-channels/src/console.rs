//! Console channel — logs the message instead of sending it.
//! Backs the `test`/`callback_test` delivery methods and local dev.

use async_trait::async_trait;

use cadence_core::error::Result;
use cadence_core::traits::DeliveryChannel;
use cadence_core::types::Recipient;

#[derive(Default)]
pub struct ConsoleChannel;

impl ConsoleChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    async fn send(&self, recipient: &Recipient, text: &str) -> Result<()> {
        tracing::info!("📨 [console → {}] {}", recipient.address, text);
        Ok(())
    }
}
