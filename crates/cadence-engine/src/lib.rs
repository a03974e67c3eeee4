//! # Cadence Engine
//!
//! The recurrence/state-machine core: schedule definitions spawn one
//! schedule instance per tracked entity, a periodic scan fires due
//! instances, and catch-up advances stale instances to the first
//! future fire time without replaying missed sends.
//!
//! ## Architecture
//! ```text
//! LifecycleController
//!   ├── entity_changed: trigger evaluation → spawn / retire / re-activate
//!   ├── definition_saved: re-evaluate every open entity in scope
//!   └── scan (periodic tick)
//!         └── per due instance, under a per-key lock:
//!               fire → catch_up → persist
//!
//! ReminderDefinition (the rule)
//!   ├── spawn:       build instance, compute first fire time
//!   ├── advance_one: sole mutator of cycle position
//!   ├── catch_up:    callback retries + skip-missed-events loop
//!   └── fire:        ack detection / exhaustion audit / render + send
//! ```

pub mod clock;
pub mod controller;
pub mod model;
pub mod persistence;
pub mod schedule;
pub mod store;
pub mod template;
pub mod trigger;

pub use controller::{run_scan_loop, LifecycleController};
pub use model::{
    CallbackState, CallbackTracker, EventCycle, EventInterpretation, ReminderDefinition,
    ReminderEvent, ReminderInstance, REPEAT_INDEFINITELY,
};
pub use persistence::{InstanceRepository, MemoryInstanceStore, SqliteInstanceStore};
pub use schedule::FireContext;
pub use store::DefinitionStore;
