//! Lifecycle orchestration: reacts to entity mutations (spawn, retire,
//! re-activate), re-syncs on definition saves, and runs the periodic
//! scan that fires due instances through a bounded worker pool.
//!
//! All per-instance work — the fire→catch_up→persist sequence and the
//! spawn/retire path — is serialized through a per-key async mutex so
//! an entity-change event can never race a concurrent scan of the
//! same instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};

use cadence_core::config::EngineConfig;
use cadence_core::error::Result;
use cadence_core::traits::{
    AuditSink, CallbackDetector, DeliveryChannel, Entity, EntityRepository, RecipientResolver,
};
use cadence_core::types::{DeliveryMethod, RecipientKind};

use crate::model::{ReminderDefinition, ReminderInstance, REPEAT_INDEFINITELY};
use crate::persistence::InstanceRepository;
use crate::schedule::FireContext;
use crate::trigger::{self, StartValue};

/// Orchestrates definitions, instances, and collaborators.
pub struct LifecycleController {
    definitions: RwLock<HashMap<String, Arc<ReminderDefinition>>>,
    instances: Arc<dyn InstanceRepository>,
    entities: Arc<dyn EntityRepository>,
    resolver: Arc<dyn RecipientResolver>,
    detector: Arc<dyn CallbackDetector>,
    audit: Arc<dyn AuditSink>,
    channels: HashMap<DeliveryMethod, Arc<dyn DeliveryChannel>>,
    /// One guard per (definition, entity) key.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_concurrent: usize,
    catchup_step_guard: u64,
}

impl LifecycleController {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        entities: Arc<dyn EntityRepository>,
        resolver: Arc<dyn RecipientResolver>,
        detector: Arc<dyn CallbackDetector>,
        audit: Arc<dyn AuditSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances,
            entities,
            resolver,
            detector,
            audit,
            channels: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
            max_concurrent: config.max_concurrent.max(1),
            catchup_step_guard: config.catchup_step_guard,
        }
    }

    /// Route a delivery method through `channel`.
    pub fn register_channel(&mut self, method: DeliveryMethod, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(method, channel);
    }

    pub async fn definition_count(&self) -> usize {
        self.definitions.read().await.len()
    }

    /// A definition was created or edited: remember it, then
    /// re-evaluate every open entity in its scope against it. The
    /// sweep keeps instances in sync even when individual mutation
    /// events were missed while the definition was being edited.
    pub async fn definition_saved(&self, definition: ReminderDefinition, now: DateTime<Utc>) {
        let definition = Arc::new(definition);
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        tracing::info!("📋 Definition saved: '{}' ({})", definition.nickname, definition.id);

        match self.entities.open_entities(&definition.scope).await {
            Ok(open) => {
                for entity in open {
                    if let Err(e) = self.evaluate(&definition, entity.as_ref(), now).await {
                        tracing::warn!(
                            "Re-sync of {} against '{}' failed: {e}",
                            entity.id(),
                            definition.nickname
                        );
                    }
                }
            }
            Err(e) => tracing::warn!("Cannot list open entities for {}: {e}", definition.scope),
        }
    }

    /// An entity was mutated: run the spawn/retire/re-activate state
    /// machine for every definition that could apply to it.
    pub async fn entity_changed(&self, entity: &dyn Entity, now: DateTime<Utc>) {
        let definitions: Vec<Arc<ReminderDefinition>> =
            self.definitions.read().await.values().cloned().collect();
        for definition in definitions {
            if let Err(e) = self.evaluate(&definition, entity, now).await {
                tracing::warn!(
                    "Entity change for {} against '{}' failed: {e}",
                    entity.id(),
                    definition.nickname
                );
            }
        }
    }

    /// Spawn/retire/re-activate state machine for one (definition,
    /// entity) pair, serialized under the instance key lock.
    async fn evaluate(
        &self,
        definition: &ReminderDefinition,
        entity: &dyn Entity,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lock = self.key_lock(&format!("{}:{}", definition.id, entity.id())).await;
        let _guard = lock.lock().await;

        let existing = self.instances.get(&definition.id, entity.id()).await?;

        if self.disqualified(definition, entity) {
            if let Some(mut instance) = existing {
                self.instances.retire(&mut instance).await?;
            }
            return Ok(());
        }

        // A retired record never comes back; a fresh instance replaces it
        let mut instance = existing.filter(|i| !i.retired);

        let raw_start = entity.property(&definition.start_property);
        let start_value = raw_start.as_deref().and_then(trigger::parse_start);

        // A changed start condition invalidates the computed schedule
        // outright; retire and let the block below respawn.
        if let Some(current) = instance.take() {
            let keep = match (&start_value, raw_start.as_deref()) {
                (Some(value), _) => current.start_condition_at == condition_moment(value),
                (None, Some(raw)) => trigger::is_ok_sentinel(raw),
                (None, None) => false,
            };
            if keep {
                instance = Some(current);
            } else {
                let mut current = current;
                self.instances.retire(&mut current).await?;
            }
        }

        let instance = match instance {
            None => match self.try_spawn(definition, entity, &start_value, now) {
                Some(spawned) => spawned,
                None => return Ok(()),
            },
            Some(mut current) => {
                let within_budget = definition.max_iterations == REPEAT_INDEFINITELY
                    || i64::from(current.iteration) <= definition.max_iterations;
                let active = within_budget
                    && !trigger::condition_reached(entity, &definition.until_property, now);
                if active && !current.active {
                    // Re-activation starts sending from right now
                    // instead of replaying what was missed
                    current.next_fire = now;
                }
                current.active = active;
                current
            }
        };

        self.instances.save(&instance).await
    }

    /// Whether `entity` can hold an instance of `definition` at all.
    fn disqualified(&self, definition: &ReminderDefinition, entity: &dyn Entity) -> bool {
        entity.is_closed()
            || entity.entity_type() != definition.entity_type
            || (definition.recipient == RecipientKind::EntityOwner
                && self.resolver.resolve(entity, RecipientKind::EntityOwner).is_err())
    }

    /// Spawn when the start condition is reached. Date/datetime-valued
    /// start properties anchor the schedule at that moment directly;
    /// other values spawn at `now` once the sentinel check passes.
    fn try_spawn(
        &self,
        definition: &ReminderDefinition,
        entity: &dyn Entity,
        start_value: &Option<StartValue>,
        now: DateTime<Utc>,
    ) -> Option<ReminderInstance> {
        let (anchor, condition_at) = match start_value {
            Some(StartValue::Timestamp(ts)) => (*ts, *ts),
            Some(StartValue::Date(date)) => {
                // Bare date: anchor at that date with the current time
                // of day; midnight is what change detection compares
                let anchor = Utc.from_utc_datetime(&date.and_time(now.time()));
                (anchor, condition_moment(&StartValue::Date(*date)))
            }
            None => {
                if !trigger::condition_reached(entity, &definition.start_property, now) {
                    return None;
                }
                (now, now)
            }
        };

        match definition.spawn(entity, self.resolver.as_ref(), anchor) {
            Ok(mut instance) => {
                instance.start_condition_at = condition_at;
                tracing::info!(
                    "🌱 Spawned instance {} (first fire {})",
                    instance.key(),
                    instance.next_fire
                );
                Some(instance)
            }
            Err(e) => {
                tracing::warn!(
                    "Entity {} matches '{}' but spawn failed: {e}",
                    entity.id(),
                    definition.nickname
                );
                None
            }
        }
    }

    /// Periodic scan: fire every due instance, catch it up past `now`,
    /// persist. Due instances are processed oldest-first through a
    /// bounded pool; a failed delivery leaves the instance untouched
    /// for the next tick.
    pub async fn scan(&self, now: DateTime<Utc>) -> usize {
        let due = match self.instances.due_before(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!("Scan aborted, cannot list due instances: {e}");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }
        tracing::debug!("🔔 Scan: {} due instance(s)", due.len());

        let fired = AtomicUsize::new(0);
        futures::stream::iter(due)
            .for_each_concurrent(self.max_concurrent, |instance| {
                let fired = &fired;
                async move {
                    match self.process_due(instance, now).await {
                        Ok(true) => {
                            fired.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!("Due instance processing failed: {e}"),
                    }
                }
            })
            .await;
        fired.load(Ordering::Relaxed)
    }

    /// fire → catch_up → persist for one due instance, under its key
    /// lock. Returns whether the fire counted as delivered.
    async fn process_due(&self, stale: ReminderInstance, now: DateTime<Utc>) -> Result<bool> {
        let Some(definition) = self.definitions.read().await.get(&stale.definition_id).cloned()
        else {
            tracing::warn!(
                "Instance {} references unknown definition, retiring",
                stale.key()
            );
            let mut stale = stale;
            self.instances.retire(&mut stale).await?;
            return Ok(false);
        };

        let lock = self.key_lock(&stale.key()).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent entity change may have
        // retired or rescheduled this instance since the due query.
        let Some(mut instance) = self
            .instances
            .get(&stale.definition_id, &stale.entity_id)
            .await?
            .filter(|i| i.active && !i.retired && i.next_fire <= now)
        else {
            return Ok(false);
        };

        let Some(entity) = self.find_entity(&definition.scope, &instance.entity_id).await else {
            tracing::warn!(
                "Entity {} for instance {} is gone, retiring",
                instance.entity_id,
                instance.key()
            );
            self.instances.retire(&mut instance).await?;
            return Ok(false);
        };

        let Some(channel) = self.channels.get(&definition.method) else {
            tracing::warn!(
                "No channel registered for method '{}', instance {} left for next tick",
                definition.method,
                instance.key()
            );
            return Ok(false);
        };

        let ctx = FireContext {
            resolver: self.resolver.as_ref(),
            channel: channel.as_ref(),
            detector: self.detector.as_ref(),
            audit: self.audit.as_ref(),
        };
        let delivered = definition.fire(&mut instance, entity.as_ref(), &ctx, now).await;
        if delivered {
            definition.catch_up(&mut instance, now, self.catchup_step_guard);
            self.instances.save(&instance).await?;
        }
        // Not delivered: same next_fire, retried on the next scan tick
        Ok(delivered)
    }

    async fn find_entity(&self, scope: &str, entity_id: &str) -> Option<Arc<dyn Entity>> {
        match self.entities.open_entities(scope).await {
            Ok(open) => open.into_iter().find(|e| e.id() == entity_id),
            Err(e) => {
                tracing::warn!("Entity lookup in {scope} failed: {e}");
                None
            }
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Guards held only by the map belong to instances nobody is
        // touching; drop them so retired keys do not pile up.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The moment a [`StartValue`] contributes to change detection:
/// datetimes compare as-is, bare dates as midnight.
fn condition_moment(value: &StartValue) -> DateTime<Utc> {
    match value {
        StartValue::Timestamp(ts) => *ts,
        StartValue::Date(date) => Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default()),
    }
}

/// Run the scan loop forever on a tokio interval.
pub async fn run_scan_loop(controller: Arc<LifecycleController>, tick_secs: u64) {
    tracing::info!("⏰ Scan loop started (tick every {tick_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
    loop {
        interval.tick().await;
        let fired = controller.scan(Utc::now()).await;
        if fired > 0 {
            tracing::info!("📣 Scan tick delivered {fired} message(s)");
        }
    }
}
