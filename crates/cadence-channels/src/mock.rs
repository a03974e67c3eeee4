//! Recording channel for tests: captures every send, optionally
//! failing them all to exercise the retry path.

use async_trait::async_trait;
use tokio::sync::Mutex;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DeliveryChannel;
use cadence_core::types::Recipient;

pub struct MockChannel {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl MockChannel {
    /// A channel that accepts everything.
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A channel that rejects everything.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Everything sent so far, as (address, text) pairs.
    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for MockChannel {
    async fn send(&self, recipient: &Recipient, text: &str) -> Result<()> {
        if self.fail {
            return Err(CadenceError::Channel("mock channel set to fail".into()));
        }
        self.sent
            .lock()
            .await
            .push((recipient.address.clone(), text.to_string()));
        Ok(())
    }
}
