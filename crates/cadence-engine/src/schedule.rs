//! Schedule definition operations: spawning instances, stepping the
//! cycle position, catching a stale instance up to the first future
//! fire time, and firing the current event.
//!
//! Catch-up exists so that a schedule deactivated or unserved for a
//! while skips the sends it missed instead of emitting one message
//! per tick until it is caught up. Each loop step either strictly
//! advances `next_fire` or deactivates the instance; a step guard
//! protects against malformed definitions (zero-length cycles).

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{AuditSink, CallbackDetector, DeliveryChannel, Entity, RecipientResolver};

use crate::clock;
use crate::model::{
    CallbackState, CallbackTracker, EventInterpretation, ReminderDefinition, ReminderEvent,
    ReminderInstance, REPEAT_INDEFINITELY,
};
use crate::template;

/// Collaborators `fire` needs, bundled to keep the signature sane.
pub struct FireContext<'a> {
    pub resolver: &'a dyn RecipientResolver,
    pub channel: &'a dyn DeliveryChannel,
    pub detector: &'a dyn CallbackDetector,
    pub audit: &'a dyn AuditSink,
}

/// `fire_time` as an offset from the previous fire (Offset mode).
fn time_as_offset(t: NaiveTime) -> Duration {
    Duration::seconds(t.num_seconds_from_midnight() as i64)
}

impl ReminderDefinition {
    /// The instance's current event, clamping the index back to 0
    /// (with a warning) if an edit shrank the cycle underneath it.
    fn current_event<'e>(&'e self, instance: &mut ReminderInstance) -> &'e ReminderEvent {
        if instance.event_index >= self.cycle.events.len() {
            tracing::warn!(
                "Instance {} event index {} beyond cycle of {}, clamping to 0",
                instance.key(),
                instance.event_index,
                self.cycle.events.len()
            );
            instance.event_index = 0;
        }
        &self.cycle.events[instance.event_index]
    }

    /// Build a new instance for `entity`, anchored at `anchor` (the
    /// moment the start condition was reached).
    ///
    /// The recipient and its timezone are resolved exactly once here;
    /// the timezone snapshot rides on the instance for all later
    /// fixed-schedule arithmetic. Resolution failure is a recoverable
    /// per-entity error: the caller logs and skips, no instance is
    /// created.
    pub fn spawn(
        &self,
        entity: &dyn Entity,
        resolver: &dyn RecipientResolver,
        anchor: DateTime<Utc>,
    ) -> Result<ReminderInstance> {
        let first = self
            .cycle
            .events
            .first()
            .ok_or_else(|| CadenceError::Spawn(format!("definition {} has an empty cycle", self.id)))?;
        let recipient = resolver.resolve(entity, self.recipient)?;
        let local_anchor = clock::utc_to_local(recipient.timezone.as_deref(), anchor);

        let mut instance = ReminderInstance {
            definition_id: self.id.clone(),
            entity_id: entity.id().to_string(),
            scope: self.scope.clone(),
            active: true,
            retired: false,
            start_anchor: local_anchor.date(),
            timezone: recipient.timezone.clone(),
            iteration: 1,
            event_index: 0,
            next_fire: anchor,
            last_fired: None,
            callback: CallbackTracker::default(),
            start_condition_at: anchor,
        };

        let day_offset = self.start_offset_days + first.day_num;
        instance.next_fire = match self.cycle.interpretation {
            EventInterpretation::Offset => {
                anchor + Duration::days(day_offset) + time_as_offset(first.fire_time)
            }
            EventInterpretation::Schedule => {
                let local = instance.start_anchor.and_time(first.fire_time) + Duration::days(day_offset);
                clock::local_to_utc(instance.timezone.as_deref(), local)
            }
        };
        Ok(instance)
    }

    /// Move the instance one step through the cycle. The sole mutator
    /// of cycle position: resets the callback tracker, wraps the event
    /// index, bumps the iteration, and deactivates once a finite
    /// iteration budget is exhausted. Never touches `next_fire` —
    /// callers recompute it, which lets the callback-retry path reuse
    /// timing logic without re-deriving position.
    pub fn advance_one(&self, instance: &mut ReminderInstance) {
        instance.event_index += 1;
        instance.callback = CallbackTracker::default();
        if instance.event_index >= self.cycle.events.len() {
            instance.event_index = 0;
            instance.iteration += 1;
            if self.max_iterations != REPEAT_INDEFINITELY
                && i64::from(instance.iteration) > self.max_iterations
            {
                instance.active = false;
            }
        }
    }

    /// Advance `instance` until `next_fire > now` or it deactivates.
    ///
    /// Callback-expecting events schedule their next retry instead of
    /// the next event until the tracker is acked or exhausted. Offset
    /// cycles chain each fire off the previous one (the mode's whole
    /// point is "N after the last delivery"); fixed schedules
    /// recompute absolutely from the start anchor so repeated
    /// catch-up passes cannot accumulate drift.
    pub fn catch_up(&self, instance: &mut ReminderInstance, now: DateTime<Utc>, step_guard: u64) {
        if self.cycle.events.is_empty() {
            tracing::warn!("Definition {} has an empty cycle, deactivating {}", self.id, instance.key());
            instance.active = false;
            return;
        }
        let mut steps: u64 = 0;
        while instance.active && now >= instance.next_fire {
            steps += 1;
            if steps > step_guard {
                tracing::error!(
                    "Catch-up for {} exceeded {} steps (malformed definition {}?), deactivating",
                    instance.key(),
                    step_guard,
                    self.id
                );
                instance.active = false;
                return;
            }

            let event = self.current_event(instance);
            if self.method.expects_callback()
                && !event.callback_timeouts.is_empty()
                && instance.callback.state(event.callback_timeouts.len()) == CallbackState::AwaitingAck
            {
                // Schedule the next retry, not the next event
                let minutes = event.callback_timeouts[instance.callback.try_count];
                instance.next_fire = instance.next_fire + Duration::minutes(minutes);
                instance.callback.try_count += 1;
                continue;
            }

            self.advance_one(instance);
            if !instance.active {
                return;
            }
            let event = &self.cycle.events[instance.event_index];
            match self.cycle.interpretation {
                EventInterpretation::Offset => {
                    let mut day_offset = event.day_num;
                    if instance.event_index == 0 {
                        // Cycle wrapped: add the inter-iteration gap
                        day_offset += self.cycle.cycle_length_days;
                    }
                    instance.next_fire = instance.next_fire
                        + Duration::days(day_offset)
                        + time_as_offset(event.fire_time);
                }
                EventInterpretation::Schedule => {
                    let day_offset = self.start_offset_days
                        + self.cycle.cycle_length_days * (i64::from(instance.iteration) - 1)
                        + event.day_num;
                    let local =
                        instance.start_anchor.and_time(event.fire_time) + Duration::days(day_offset);
                    instance.next_fire = clock::local_to_utc(instance.timezone.as_deref(), local);
                }
            }
        }
    }

    /// Fire the instance's current event. Returns whether the event
    /// counts as delivered; `false` leaves `next_fire` in place so the
    /// next scan tick retries the same slot.
    pub async fn fire(
        &self,
        instance: &mut ReminderInstance,
        entity: &dyn Entity,
        ctx: &FireContext<'_>,
        now: DateTime<Utc>,
    ) -> bool {
        let recipient = match ctx.resolver.resolve(entity, self.recipient) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Cannot resolve recipient for {}: {e}", instance.key());
                return false;
            }
        };

        let event = self.current_event(instance);
        if self.method.expects_callback() && !event.callback_timeouts.is_empty() {
            if ctx.detector.inbound_ack_exists(&recipient, instance.last_fired).await {
                // Acknowledged: stop resending, let catch-up advance
                instance.callback.acked = true;
                return true;
            }
            if instance.callback.try_count == event.callback_timeouts.len() {
                // Out of retries: audit the miss and move on
                tracing::info!("Missed expected callback for {} after {} tries", instance.key(), instance.callback.try_count);
                ctx.audit.missed_callback(&self.scope, &recipient, now);
                return true;
            }
        }

        instance.last_fired = Some(now);
        let lang = recipient.language.as_deref().unwrap_or(&self.default_lang);
        let Some(body) = event.message.get(lang).or_else(|| event.message.get(&self.default_lang))
        else {
            tracing::warn!(
                "No template for language '{lang}' or default '{}' on definition {}, skipping event",
                self.default_lang,
                self.id
            );
            return true;
        };
        let text = template::render(body, &entity.properties(), now);

        match ctx.channel.send(&recipient, &text).await {
            Ok(()) => {
                tracing::debug!("Delivered to {} for {}", recipient.address, instance.key());
                true
            }
            Err(e) => {
                tracing::warn!("Delivery to {} failed for {}: {e}", recipient.address, instance.key());
                false
            }
        }
    }
}

/// Reject definitions whose cycle the engine could not safely run.
pub fn validate_definition(definition: &ReminderDefinition) -> Result<()> {
    definition
        .cycle
        .validate()
        .map_err(|e| CadenceError::Config(format!("definition '{}': {e}", definition.nickname)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use cadence_core::entity::{StaticEntity, StaticRecipientResolver};
    use cadence_core::types::{DeliveryMethod, RecipientKind};
    use chrono::{NaiveDate, TimeZone};

    use crate::model::EventCycle;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn message() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("en".to_string(), "Form not yet completed.".to_string());
        m
    }

    fn event(day: i64, fire: NaiveTime, timeouts: &[i64]) -> ReminderEvent {
        ReminderEvent {
            day_num: day,
            fire_time: fire,
            message: message(),
            callback_timeouts: timeouts.to_vec(),
        }
    }

    fn definition(interpretation: EventInterpretation, events: Vec<ReminderEvent>, cycle_length_days: i64) -> ReminderDefinition {
        ReminderDefinition {
            id: "def-1".into(),
            scope: "clinic".into(),
            entity_type: "patient".into(),
            nickname: "followup".into(),
            default_lang: "en".into(),
            method: DeliveryMethod::Sms,
            recipient: RecipientKind::EntityItself,
            start_property: "form1_completed".into(),
            start_offset_days: 1,
            until_property: "form2_completed".into(),
            max_iterations: REPEAT_INDEFINITELY,
            cycle: EventCycle { events, interpretation, cycle_length_days },
        }
    }

    fn entity() -> StaticEntity {
        StaticEntity::new("case-1", "patient").with_property("contact_phone", "+15551234")
    }

    fn spawn_at(def: &ReminderDefinition, anchor: DateTime<Utc>) -> ReminderInstance {
        let resolver = StaticRecipientResolver::new();
        def.spawn(&entity(), &resolver, anchor).unwrap()
    }

    #[test]
    fn offset_spawn_hourly_scenario() {
        // start_offset 1 day, single event at +01:00:00, start reached
        // 2024-01-01T09:46Z: first fire lands 2024-01-02T10:46Z.
        let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
        let instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
        assert_eq!(instance.next_fire, utc(2024, 1, 2, 10, 46));
        assert_eq!(instance.iteration, 1);
        assert_eq!(instance.event_index, 0);
        assert!(instance.active);
    }

    #[test]
    fn offset_catch_up_chains_hourly() {
        let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
        // Three fires have passed; each chains +1h off the previous
        def.catch_up(&mut instance, utc(2024, 1, 2, 12, 50), 100_000);
        assert_eq!(instance.next_fire, utc(2024, 1, 2, 13, 46));
        assert!(instance.active);
    }

    #[test]
    fn fixed_schedule_weekly_scenario() {
        // Days 2 and 5 of a weekly cycle at 11:00, for 4 weeks, day 1
        // being one day after the start. Start reached Sunday
        // 2024-01-07: fires land Tuesdays and Fridays.
        let def = ReminderDefinition {
            max_iterations: 4,
            ..definition(
                EventInterpretation::Schedule,
                vec![event(1, time(11, 0), &[]), event(4, time(11, 0), &[])],
                7,
            )
        };
        let mut instance = spawn_at(&def, utc(2024, 1, 7, 9, 0));
        assert_eq!(instance.start_anchor, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap());
        assert_eq!(instance.next_fire, utc(2024, 1, 9, 11, 0)); // Tuesday

        let mut fires = vec![instance.next_fire];
        while instance.active {
            let now = instance.next_fire;
            def.catch_up(&mut instance, now, 100_000);
            if instance.active {
                fires.push(instance.next_fire);
            }
        }
        assert_eq!(fires.len(), 8);
        for fire in &fires {
            use chrono::Datelike;
            let weekday = fire.weekday();
            assert!(
                weekday == chrono::Weekday::Tue || weekday == chrono::Weekday::Fri,
                "unexpected weekday {weekday} for {fire}"
            );
            assert_eq!(fire.time(), time(11, 0));
        }
        assert_eq!(fires[7], utc(2024, 2, 2, 11, 0)); // Friday of week 4
        assert!(!instance.active);
    }

    #[test]
    fn fixed_schedule_catch_up_is_drift_free() {
        let def = definition(
            EventInterpretation::Schedule,
            vec![event(1, time(11, 0), &[]), event(4, time(11, 0), &[])],
            7,
        );
        let start = utc(2024, 1, 7, 9, 0);
        let target = start + Duration::days(40);

        let mut one_pass = spawn_at(&def, start);
        def.catch_up(&mut one_pass, target, 100_000);

        let mut incremental = spawn_at(&def, start);
        let mut now = start;
        while now < target {
            now = (now + Duration::days(5)).min(target);
            def.catch_up(&mut incremental, now, 100_000);
        }

        assert_eq!(one_pass.next_fire, incremental.next_fire);
        assert_eq!(one_pass.iteration, incremental.iteration);
        assert_eq!(one_pass.event_index, incremental.event_index);
    }

    #[test]
    fn catch_up_terminates_far_in_the_future() {
        let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
        def.catch_up(&mut instance, utc(2024, 3, 1, 0, 0), 100_000);
        assert!(instance.next_fire > utc(2024, 3, 1, 0, 0));
        assert!(instance.active);
    }

    #[test]
    fn step_guard_deactivates_zero_length_cycle() {
        // day 0, zero time offset, zero cycle length: next_fire never moves
        let def = definition(EventInterpretation::Offset, vec![event(0, time(0, 0), &[])], 0);
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 0, 0));
        instance.next_fire = utc(2024, 1, 1, 0, 0);
        def.catch_up(&mut instance, utc(2024, 1, 2, 0, 0), 50);
        assert!(!instance.active);
    }

    #[test]
    fn iteration_budget_deactivates_on_third_iteration() {
        let def = ReminderDefinition {
            max_iterations: 2,
            ..definition(
                EventInterpretation::Offset,
                vec![event(1, time(8, 0), &[]), event(1, time(8, 0), &[]), event(1, time(8, 0), &[])],
                2,
            )
        };
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 0, 0));
        for step in 0..6 {
            def.advance_one(&mut instance);
            if step < 5 {
                assert!(instance.active, "deactivated too early at step {step}");
            }
        }
        // Sixth advance wraps into iteration 3, past the budget of 2
        assert!(!instance.active);
        assert_eq!(instance.iteration, 3);
    }

    #[test]
    fn callback_retries_shift_next_fire_then_advance() {
        let def = ReminderDefinition {
            method: DeliveryMethod::Callback,
            ..definition(EventInterpretation::Offset, vec![event(1, time(1, 0), &[10, 30])], 0)
        };
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 0, 0));
        let first = instance.next_fire;

        // Retry 1: +10 minutes
        def.catch_up(&mut instance, first, 100_000);
        assert_eq!(instance.next_fire, first + Duration::minutes(10));
        assert_eq!(instance.callback.try_count, 1);
        assert_eq!(instance.event_index, 0);

        // Retry 2: +30 minutes
        let now = instance.next_fire;
        def.catch_up(&mut instance, now, 100_000);
        assert_eq!(instance.next_fire, first + Duration::minutes(40));
        assert_eq!(instance.callback.try_count, 2);
        assert_eq!(instance.event_index, 0);

        // Exhausted: now advances to the next iteration's event
        let now = instance.next_fire;
        def.catch_up(&mut instance, now, 100_000);
        assert_eq!(instance.event_index, 0);
        assert_eq!(instance.iteration, 2);
        assert_eq!(instance.callback.try_count, 0);
        assert!(instance.next_fire > first + Duration::minutes(40));
    }

    #[test]
    fn acked_callback_advances_without_retries() {
        let def = ReminderDefinition {
            method: DeliveryMethod::Callback,
            ..definition(EventInterpretation::Offset, vec![event(1, time(1, 0), &[10, 30])], 0)
        };
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 0, 0));
        let first = instance.next_fire;
        instance.callback.acked = true;

        def.catch_up(&mut instance, first, 100_000);
        // No retry scheduling: straight to the next event
        assert_eq!(instance.iteration, 2);
        assert_eq!(instance.callback.try_count, 0);
        assert!(!instance.callback.acked);
    }

    #[test]
    fn shrunk_cycle_clamps_event_index() {
        let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
        let mut instance = spawn_at(&def, utc(2024, 1, 1, 0, 0));
        instance.event_index = 5; // definition edit shrank the cycle
        let now = instance.next_fire;
        def.catch_up(&mut instance, now, 100_000);
        assert!(instance.event_index < def.cycle.events.len());
        assert!(instance.active);
    }

    mod fire {
        use super::*;
        use async_trait::async_trait;
        use cadence_channels::mock::MockChannel;
        use cadence_core::traits::{AuditSink, CallbackDetector, NullCallbackDetector};
        use cadence_core::types::Recipient;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct AlwaysAcked;

        #[async_trait]
        impl CallbackDetector for AlwaysAcked {
            async fn inbound_ack_exists(&self, _recipient: &Recipient, _since: Option<DateTime<Utc>>) -> bool {
                true
            }
        }

        #[derive(Default)]
        struct CountingAudit {
            misses: AtomicUsize,
        }

        impl AuditSink for CountingAudit {
            fn missed_callback(&self, _scope: &str, _recipient: &Recipient, _when: DateTime<Utc>) {
                self.misses.fetch_add(1, Ordering::SeqCst);
            }
        }

        #[tokio::test]
        async fn renders_and_sends() {
            let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
            let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
            let resolver = StaticRecipientResolver::new();
            let channel = MockChannel::new();
            let audit = CountingAudit::default();
            let ctx = FireContext {
                resolver: &resolver,
                channel: &channel,
                detector: &NullCallbackDetector,
                audit: &audit,
            };
            let now = utc(2024, 1, 2, 10, 46);
            assert!(def.fire(&mut instance, &entity(), &ctx, now).await);
            assert_eq!(instance.last_fired, Some(now));
            let sent = channel.sent().await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, "Form not yet completed.");
        }

        #[tokio::test]
        async fn failed_delivery_reports_not_delivered() {
            let def = definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[])], 0);
            let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
            let scheduled = instance.next_fire;
            let resolver = StaticRecipientResolver::new();
            let channel = MockChannel::failing();
            let audit = CountingAudit::default();
            let ctx = FireContext {
                resolver: &resolver,
                channel: &channel,
                detector: &NullCallbackDetector,
                audit: &audit,
            };
            assert!(!def.fire(&mut instance, &entity(), &ctx, scheduled).await);
            // The slot stays put for the next tick
            assert_eq!(instance.next_fire, scheduled);
        }

        #[tokio::test]
        async fn inbound_ack_suppresses_send() {
            let def = ReminderDefinition {
                method: DeliveryMethod::Callback,
                ..definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[10, 30])], 0)
            };
            let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
            instance.last_fired = Some(utc(2024, 1, 2, 10, 46));
            let resolver = StaticRecipientResolver::new();
            let channel = MockChannel::new();
            let audit = CountingAudit::default();
            let ctx = FireContext {
                resolver: &resolver,
                channel: &channel,
                detector: &AlwaysAcked,
                audit: &audit,
            };
            assert!(def.fire(&mut instance, &entity(), &ctx, utc(2024, 1, 2, 10, 56)).await);
            assert!(instance.callback.acked);
            assert!(channel.sent().await.is_empty());
        }

        #[tokio::test]
        async fn exhausted_callback_audits_without_send() {
            let def = ReminderDefinition {
                method: DeliveryMethod::Callback,
                ..definition(EventInterpretation::Offset, vec![event(0, time(1, 0), &[10, 30])], 0)
            };
            let mut instance = spawn_at(&def, utc(2024, 1, 1, 9, 46));
            instance.callback.try_count = 2;
            instance.last_fired = Some(utc(2024, 1, 2, 10, 46));
            let resolver = StaticRecipientResolver::new();
            let channel = MockChannel::new();
            let audit = CountingAudit::default();
            let ctx = FireContext {
                resolver: &resolver,
                channel: &channel,
                detector: &NullCallbackDetector,
                audit: &audit,
            };
            assert!(def.fire(&mut instance, &entity(), &ctx, utc(2024, 1, 2, 11, 26)).await);
            assert_eq!(audit.misses.load(Ordering::SeqCst), 1);
            assert!(channel.sent().await.is_empty());
        }
    }
}
