//! Collaborator traits — the seams between the engine and the host
//! application. The engine never touches an entity store, a message
//! transport, or a timezone directory directly; it goes through these.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Recipient, RecipientKind};

/// A tracked, mutable entity (e.g. a case record).
///
/// Schedules react to mutations of these: trigger properties are read
/// through `property`, message templates render against `properties`.
pub trait Entity: Send + Sync {
    fn id(&self) -> &str;
    fn entity_type(&self) -> &str;
    fn is_closed(&self) -> bool;
    /// Owner user id, if the entity has one.
    fn owner_id(&self) -> Option<&str>;
    /// A single named property, absent if unset.
    fn property(&self, name: &str) -> Option<String>;
    /// Snapshot of all properties, for template rendering.
    fn properties(&self) -> HashMap<String, String>;
}

/// Source of open entities for a scope, used when a definition is
/// saved and every entity in scope must be re-evaluated.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn open_entities(&self, scope: &str) -> Result<Vec<Arc<dyn Entity>>>;
}

/// Resolves the message recipient for an entity.
///
/// Failure is recoverable per entity: the caller logs and skips.
pub trait RecipientResolver: Send + Sync {
    fn resolve(&self, entity: &dyn Entity, kind: RecipientKind) -> Result<Recipient>;
}

/// Outbound message transport.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Deliver `text` to `recipient`. An `Err` means not delivered;
    /// the engine leaves the schedule slot in place and retries on
    /// the next scan tick.
    async fn send(&self, recipient: &Recipient, text: &str) -> Result<()>;
}

/// Detects inbound acknowledgements for callback-style deliveries.
#[async_trait]
pub trait CallbackDetector: Send + Sync {
    /// Whether an inbound message from `recipient` arrived at or
    /// after `since` (`None` means any inbound message counts).
    async fn inbound_ack_exists(&self, recipient: &Recipient, since: Option<DateTime<Utc>>) -> bool;
}

/// Detector for deployments without an inbound channel: nothing is
/// ever acknowledged, so callback events always run their retries.
pub struct NullCallbackDetector;

#[async_trait]
impl CallbackDetector for NullCallbackDetector {
    async fn inbound_ack_exists(&self, _recipient: &Recipient, _since: Option<DateTime<Utc>>) -> bool {
        false
    }
}

/// Sink for audit events the engine emits but does not interpret.
pub trait AuditSink: Send + Sync {
    /// A callback-expecting event exhausted its retries without an
    /// acknowledgement.
    fn missed_callback(&self, scope: &str, recipient: &Recipient, when: DateTime<Utc>);
}

/// No-op audit sink for hosts that do not track missed callbacks.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn missed_callback(&self, scope: &str, recipient: &Recipient, when: DateTime<Utc>) {
        tracing::debug!(
            "Missed callback in {} for {} at {} (no audit sink configured)",
            scope,
            recipient.id,
            when
        );
    }
}
