//! # Cadence Core
//!
//! Shared foundation for the Cadence notification engine: the error
//! type, TOML configuration, recipient/delivery types, and the traits
//! implemented by external collaborators (entity store, recipient
//! resolver, delivery channel, callback detector, audit sink).
//!
//! The engine itself lives in `cadence-engine`; channel adapters in
//! `cadence-channels`.

pub mod config;
pub mod entity;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CadenceConfig;
pub use entity::{MemoryEntityRepository, StaticEntity, StaticRecipientResolver};
pub use error::{CadenceError, Result};
pub use traits::{
    AuditSink, CallbackDetector, DeliveryChannel, Entity, EntityRepository, NullAuditSink,
    NullCallbackDetector, RecipientResolver,
};
pub use types::{DeliveryMethod, Recipient, RecipientKind};
