//! Instance persistence: the repository seam plus the SQLite-backed
//! store used by the daemon and an in-memory store for tests and
//! embedders. Survives restarts; the scan loop resumes from
//! `next_fire` exactly where it left off.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;

use cadence_core::error::{CadenceError, Result};

use crate::model::{CallbackTracker, ReminderInstance};

/// Storage seam for schedule instances.
///
/// `retire` is idempotent: retiring an already-retired instance is a
/// no-op. Retired records are kept for audit and never returned by
/// `due_before`.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get(&self, definition_id: &str, entity_id: &str) -> Result<Option<ReminderInstance>>;
    async fn save(&self, instance: &ReminderInstance) -> Result<()>;
    async fn retire(&self, instance: &mut ReminderInstance) -> Result<()>;
    /// Active, non-retired instances with `next_fire <= cutoff`,
    /// ordered by `next_fire` ascending for scan fairness.
    async fn due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReminderInstance>>;
}

// ─── SQLite ───────────────────────────────────────────────

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed instance store.
pub struct SqliteInstanceStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteInstanceStore {
    /// Open or create the instance database.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| CadenceError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: std::sync::Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory SQLite database; test fixture.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| CadenceError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: std::sync::Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock_conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS reminder_instances (
                definition_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                active INTEGER NOT NULL,
                retired INTEGER NOT NULL DEFAULT 0,
                start_anchor TEXT NOT NULL,          -- recipient-local date
                timezone TEXT,
                iteration INTEGER NOT NULL,
                event_index INTEGER NOT NULL,
                next_fire TEXT NOT NULL,             -- RFC 3339 UTC
                last_fired TEXT,
                callback TEXT NOT NULL,              -- JSON tracker state
                start_condition_at TEXT NOT NULL,
                PRIMARY KEY (definition_id, entity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_due
                ON reminder_instances(next_fire) WHERE active = 1 AND retired = 0;
         ",
            )
            .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        // Poisoning only happens if a holder panicked; propagate the data anyway
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReminderInstance> {
        let start_anchor: String = row.get("start_anchor")?;
        let next_fire: String = row.get("next_fire")?;
        let last_fired: Option<String> = row.get("last_fired")?;
        let callback: String = row.get("callback")?;
        let start_condition_at: String = row.get("start_condition_at")?;
        Ok(ReminderInstance {
            definition_id: row.get("definition_id")?,
            entity_id: row.get("entity_id")?,
            scope: row.get("scope")?,
            active: row.get::<_, i64>("active")? != 0,
            retired: row.get::<_, i64>("retired")? != 0,
            start_anchor: NaiveDate::parse_from_str(&start_anchor, DATE_FORMAT)
                .unwrap_or_default(),
            timezone: row.get("timezone")?,
            iteration: row.get::<_, i64>("iteration")? as u32,
            event_index: row.get::<_, i64>("event_index")? as usize,
            next_fire: parse_utc(&next_fire).unwrap_or_default(),
            last_fired: last_fired.as_deref().and_then(parse_utc),
            callback: serde_json::from_str::<CallbackTracker>(&callback).unwrap_or_default(),
            start_condition_at: parse_utc(&start_condition_at).unwrap_or_default(),
        })
    }
}

fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl InstanceRepository for SqliteInstanceStore {
    async fn get(&self, definition_id: &str, entity_id: &str) -> Result<Option<ReminderInstance>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM reminder_instances WHERE definition_id = ?1 AND entity_id = ?2",
            )
            .map_err(|e| CadenceError::Store(format!("Prepare: {e}")))?;
        let mut rows = stmt
            .query_map(params![definition_id, entity_id], Self::row_to_instance)
            .map_err(|e| CadenceError::Store(format!("Query: {e}")))?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| CadenceError::Store(format!("Row: {e}")))?)),
            None => Ok(None),
        }
    }

    async fn save(&self, instance: &ReminderInstance) -> Result<()> {
        let callback = serde_json::to_string(&instance.callback)
            .map_err(|e| CadenceError::Store(format!("Serialize callback: {e}")))?;
        self.lock_conn()
            .execute(
                "INSERT OR REPLACE INTO reminder_instances
                 (definition_id, entity_id, scope, active, retired, start_anchor, timezone,
                  iteration, event_index, next_fire, last_fired, callback, start_condition_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    instance.definition_id,
                    instance.entity_id,
                    instance.scope,
                    instance.active as i64,
                    instance.retired as i64,
                    instance.start_anchor.format(DATE_FORMAT).to_string(),
                    instance.timezone,
                    instance.iteration as i64,
                    instance.event_index as i64,
                    instance.next_fire.to_rfc3339(),
                    instance.last_fired.map(|ts| ts.to_rfc3339()),
                    callback,
                    instance.start_condition_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Save: {e}")))?;
        Ok(())
    }

    async fn retire(&self, instance: &mut ReminderInstance) -> Result<()> {
        if instance.retired {
            return Ok(());
        }
        instance.retired = true;
        instance.active = false;
        tracing::info!("🗂️ Retiring instance {}", instance.key());
        self.save(instance).await
    }

    async fn due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReminderInstance>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM reminder_instances
                 WHERE active = 1 AND retired = 0 AND next_fire <= ?1
                 ORDER BY next_fire ASC",
            )
            .map_err(|e| CadenceError::Store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], Self::row_to_instance)
            .map_err(|e| CadenceError::Store(format!("Query: {e}")))?;
        let mut due = Vec::new();
        for row in rows {
            due.push(row.map_err(|e| CadenceError::Store(format!("Row: {e}")))?);
        }
        Ok(due)
    }
}

// ─── In-memory ────────────────────────────────────────────

/// HashMap-backed instance store.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: tokio::sync::Mutex<HashMap<(String, String), ReminderInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored instances, retired included; test inspection.
    pub async fn all(&self) -> Vec<ReminderInstance> {
        self.instances.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceStore {
    async fn get(&self, definition_id: &str, entity_id: &str) -> Result<Option<ReminderInstance>> {
        Ok(self
            .instances
            .lock()
            .await
            .get(&(definition_id.to_string(), entity_id.to_string()))
            .cloned())
    }

    async fn save(&self, instance: &ReminderInstance) -> Result<()> {
        self.instances.lock().await.insert(
            (instance.definition_id.clone(), instance.entity_id.clone()),
            instance.clone(),
        );
        Ok(())
    }

    async fn retire(&self, instance: &mut ReminderInstance) -> Result<()> {
        if instance.retired {
            return Ok(());
        }
        instance.retired = true;
        instance.active = false;
        tracing::info!("🗂️ Retiring instance {}", instance.key());
        self.save(instance).await
    }

    async fn due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReminderInstance>> {
        let mut due: Vec<ReminderInstance> = self
            .instances
            .lock()
            .await
            .values()
            .filter(|i| i.active && !i.retired && i.next_fire <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|i| i.next_fire);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instance(definition_id: &str, entity_id: &str, next_fire: DateTime<Utc>) -> ReminderInstance {
        ReminderInstance {
            definition_id: definition_id.into(),
            entity_id: entity_id.into(),
            scope: "clinic".into(),
            active: true,
            retired: false,
            start_anchor: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            timezone: Some("America/New_York".into()),
            iteration: 1,
            event_index: 0,
            next_fire,
            last_fired: None,
            callback: CallbackTracker { try_count: 1, acked: false },
            start_condition_at: Utc.with_ymd_and_hms(2024, 1, 7, 9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        let original = instance("d1", "e1", Utc.with_ymd_and_hms(2024, 1, 9, 11, 0, 0).unwrap());
        store.save(&original).await.unwrap();

        let loaded = store.get("d1", "e1").await.unwrap().unwrap();
        assert_eq!(loaded.scope, "clinic");
        assert_eq!(loaded.start_anchor, original.start_anchor);
        assert_eq!(loaded.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(loaded.next_fire, original.next_fire);
        assert_eq!(loaded.callback, original.callback);
        assert_eq!(loaded.start_condition_at, original.start_condition_at);
    }

    #[tokio::test]
    async fn sqlite_due_before_filters_and_orders() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 9, h, 0, 0).unwrap();
        store.save(&instance("d1", "late", t(12))).await.unwrap();
        store.save(&instance("d1", "early", t(8))).await.unwrap();
        let mut inactive = instance("d1", "off", t(7));
        inactive.active = false;
        store.save(&inactive).await.unwrap();
        let mut gone = instance("d1", "gone", t(6));
        store.retire(&mut gone).await.unwrap();

        let due = store.due_before(t(13)).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|i| i.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        // Retired record is kept, just never scanned
        assert!(store.get("d1", "gone").await.unwrap().unwrap().retired);
    }

    #[tokio::test]
    async fn retire_is_idempotent() {
        let store = MemoryInstanceStore::new();
        let mut inst = instance("d1", "e1", Utc::now());
        store.save(&inst).await.unwrap();
        store.retire(&mut inst).await.unwrap();
        store.retire(&mut inst).await.unwrap();
        assert!(inst.retired);
        assert_eq!(store.all().await.len(), 1);
    }
}
