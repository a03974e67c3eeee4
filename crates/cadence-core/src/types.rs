//! Recipient and delivery types shared across crates.

use serde::{Deserialize, Serialize};

/// Who receives the messages of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    /// The user who owns the tracked entity.
    EntityOwner,
    /// The tracked entity's own contact details.
    EntityItself,
}

/// How messages are delivered.
///
/// The `Callback` variants expect an inbound acknowledgement after
/// each send and drive the timeout/retry sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Sms,
    Email,
    Test,
    Callback,
    CallbackTest,
}

impl DeliveryMethod {
    /// Whether this method expects an inbound acknowledgement.
    pub fn expects_callback(&self) -> bool {
        matches!(self, DeliveryMethod::Callback | DeliveryMethod::CallbackTest)
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMethod::Sms => write!(f, "sms"),
            DeliveryMethod::Email => write!(f, "email"),
            DeliveryMethod::Test => write!(f, "test"),
            DeliveryMethod::Callback => write!(f, "callback"),
            DeliveryMethod::CallbackTest => write!(f, "callback_test"),
        }
    }
}

/// A resolved message recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable id of the contact (user id or entity id).
    pub id: String,
    /// Delivery address: phone number, email, chat id — channel-dependent.
    pub address: String,
    /// IANA timezone name, if known.
    pub timezone: Option<String>,
    /// Preferred language code, if known.
    pub language: Option<String>,
}
