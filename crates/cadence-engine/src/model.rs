//! Data model: event cycles, schedule definitions, and the per-entity
//! schedule instance the engine advances through time.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::types::{DeliveryMethod, RecipientKind};

/// Sentinel for `ReminderDefinition::max_iterations`: repeat forever.
pub const REPEAT_INDEFINITELY: i64 = -1;

/// How the day/time offsets of a cycle's events are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventInterpretation {
    /// Each event's day/time offset is relative to the previous fire;
    /// `cycle_length_days` is the gap between the last event and the
    /// start of a new iteration.
    Offset,
    /// Each event's day offset counts from a fixed per-iteration
    /// epoch (the instance's local start date) and `fire_time` is a
    /// wall-clock time of day; `cycle_length_days` is the total length
    /// of one iteration.
    Schedule,
}

/// One timed message within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderEvent {
    /// Day offset; meaning depends on the interpretation.
    pub day_num: i64,
    /// Time of day (Schedule) or hour/minute/second offset (Offset).
    pub fire_time: NaiveTime,
    /// Message templates by language code.
    pub message: HashMap<String, String>,
    /// Callback retry timeouts in minutes. Non-empty only for events
    /// that expect an inbound acknowledgement.
    #[serde(default)]
    pub callback_timeouts: Vec<i64>,
}

/// The ordered sequence of events repeated each iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCycle {
    pub events: Vec<ReminderEvent>,
    pub interpretation: EventInterpretation,
    pub cycle_length_days: i64,
}

impl EventCycle {
    /// Well-formedness check used before a definition is accepted.
    pub fn validate(&self) -> Result<(), String> {
        if self.events.is_empty() {
            return Err("event cycle has no events".into());
        }
        if let Some(ev) = self.events.iter().find(|e| e.day_num < 0) {
            return Err(format!("negative day offset {}", ev.day_num));
        }
        if self.cycle_length_days < 0 {
            return Err(format!("negative cycle length {}", self.cycle_length_days));
        }
        if self.interpretation == EventInterpretation::Schedule && self.cycle_length_days < 1 {
            return Err("fixed-schedule cycles need cycle_length_days >= 1".into());
        }
        Ok(())
    }
}

/// The authored rule: start/end triggers, the event cycle, repeat
/// budget, and recipient selection. Definitions are edited by an
/// external authoring process; the engine only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderDefinition {
    /// Opaque id; minted by the definition store when blank.
    #[serde(default)]
    pub id: String,
    /// Owning scope; only entities of this scope are considered.
    pub scope: String,
    /// Only entities of this type are checked for triggers.
    pub entity_type: String,
    #[serde(default)]
    pub nickname: String,
    /// Fallback language when no template exists for the recipient's.
    pub default_lang: String,
    pub method: DeliveryMethod,
    pub recipient: RecipientKind,
    /// Entity property whose value starts the schedule when reached.
    pub start_property: String,
    /// Days between the start condition and day 0 of the cycle.
    #[serde(default)]
    pub start_offset_days: i64,
    /// Entity property whose value, once reached, stops the schedule.
    pub until_property: String,
    /// Max full passes through the cycle; `REPEAT_INDEFINITELY` for
    /// unbounded.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i64,
    pub cycle: EventCycle,
}

fn default_max_iterations() -> i64 {
    REPEAT_INDEFINITELY
}

/// Retry/acknowledgement state for the instance's current event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTracker {
    /// Number of timeout-driven resends so far for this event.
    pub try_count: usize,
    /// True once the expected inbound acknowledgement was seen.
    pub acked: bool,
}

/// Derived callback lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    AwaitingAck,
    Exhausted,
    Acked,
}

impl CallbackTracker {
    /// State given the current event's timeout count.
    pub fn state(&self, timeout_count: usize) -> CallbackState {
        if self.acked {
            CallbackState::Acked
        } else if self.try_count >= timeout_count {
            CallbackState::Exhausted
        } else {
            CallbackState::AwaitingAck
        }
    }
}

/// Live state of one (definition, entity) pairing.
///
/// Mutated only by `spawn`/`advance_one`/`catch_up`/`fire` on the
/// owning definition and by the lifecycle controller. Deactivation
/// keeps the record; retirement is terminal and keeps it too, for
/// audit — a re-qualified entity gets a fresh instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderInstance {
    pub definition_id: String,
    pub entity_id: String,
    pub scope: String,
    pub active: bool,
    #[serde(default)]
    pub retired: bool,
    /// Recipient-local date establishing the fixed-schedule epoch.
    /// Ignored under `EventInterpretation::Offset`.
    pub start_anchor: NaiveDate,
    /// Recipient timezone snapshot, resolved once at spawn.
    pub timezone: Option<String>,
    /// Current pass through the cycle, starting at 1.
    pub iteration: u32,
    /// Index into the cycle's events.
    pub event_index: usize,
    /// UTC moment of the next scheduled delivery.
    pub next_fire: DateTime<Utc>,
    /// UTC moment of the last delivery attempt.
    pub last_fired: Option<DateTime<Utc>>,
    pub callback: CallbackTracker,
    /// Resolved start-trigger value at spawn; a different resolved
    /// value on a later entity change forces a respawn.
    pub start_condition_at: DateTime<Utc>,
}

impl ReminderInstance {
    /// Lock/storage key: unique per (definition, entity).
    pub fn key(&self) -> String {
        format!("{}:{}", self.definition_id, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(day: i64) -> ReminderEvent {
        ReminderEvent {
            day_num: day,
            fire_time: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            message: HashMap::new(),
            callback_timeouts: Vec::new(),
        }
    }

    #[test]
    fn empty_cycle_rejected() {
        let cycle = EventCycle {
            events: vec![],
            interpretation: EventInterpretation::Offset,
            cycle_length_days: 0,
        };
        assert!(cycle.validate().is_err());
    }

    #[test]
    fn fixed_schedule_needs_length() {
        let cycle = EventCycle {
            events: vec![event(0)],
            interpretation: EventInterpretation::Schedule,
            cycle_length_days: 0,
        };
        assert!(cycle.validate().is_err());
    }

    #[test]
    fn valid_cycle_accepted() {
        let cycle = EventCycle {
            events: vec![event(1), event(4)],
            interpretation: EventInterpretation::Schedule,
            cycle_length_days: 7,
        };
        assert!(cycle.validate().is_ok());
    }

    #[test]
    fn callback_states() {
        let mut cb = CallbackTracker::default();
        assert_eq!(cb.state(2), CallbackState::AwaitingAck);
        cb.try_count = 2;
        assert_eq!(cb.state(2), CallbackState::Exhausted);
        cb.acked = true;
        assert_eq!(cb.state(2), CallbackState::Acked);
        // No timeouts configured means nothing to await
        assert_eq!(CallbackTracker::default().state(0), CallbackState::Exhausted);
    }
}
