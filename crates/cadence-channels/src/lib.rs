//! Delivery channel implementations for Cadence.
//!
//! Each channel implements `cadence_core::DeliveryChannel`: deliver a
//! rendered message to a resolved recipient, report success/failure.
//! The engine treats a failed send as "not delivered" and retries the
//! same schedule slot on the next scan tick.

pub mod console;
pub mod mock;
pub mod telegram;
pub mod webhook;

pub use console::ConsoleChannel;
pub use mock::MockChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;
