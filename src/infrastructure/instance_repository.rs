use crate::domain::models::{InstanceStatus, TargetInstance};
use crate::infrastructure::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(TargetInstance),
    Existing(TargetInstance),
}

#[async_trait]
pub trait TargetInstanceRepository: Send + Sync {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TargetInstance>, EngineError>;
    async fn list_for_target(
        &self,
        user_id: &str,
        target_id: &str,
    ) -> Result<Vec<TargetInstance>, EngineError>;
    async fn find_by_id(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<Option<TargetInstance>, EngineError>;
    // Keyed idempotent upsert: concurrent creators converge on the stored
    // record instead of producing duplicates.
    async fn create_if_absent(
        &self,
        instance: &TargetInstance,
    ) -> Result<CreateOutcome, EngineError>;
    async fn mark_expired(&self, user_id: &str, instance_id: &str) -> Result<bool, EngineError>;
    async fn mark_completed(
        &self,
        user_id: &str,
        instance_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;
}

const INSTANCE_COLUMNS: &str =
    "id, user_id, target_id, window_key, window_start, window_end, status, created_at, completed_at";

type InstanceRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
);

#[derive(Debug, Clone)]
pub struct SqliteTargetInstanceRepository {
    db_path: PathBuf,
}

impl SqliteTargetInstanceRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        Connection::open(&self.db_path).map_err(EngineError::from)
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode_row(row: InstanceRow) -> Result<TargetInstance, EngineError> {
    let (id, user_id, target_id, window_key, window_start, window_end, status, created_at, completed_at) =
        row;
    Ok(TargetInstance {
        window_start: parse_stored_datetime(&window_start, "window_start")?,
        window_end: parse_stored_datetime(&window_end, "window_end")?,
        status: InstanceStatus::parse(&status).map_err(|error| {
            EngineError::InvalidInput(format!("invalid target_instances.status: {error}"))
        })?,
        created_at: parse_stored_datetime(&created_at, "created_at")?,
        completed_at: completed_at
            .map(|value| parse_stored_datetime(&value, "completed_at"))
            .transpose()?,
        id,
        user_id,
        target_id,
        window_key,
    })
}

fn parse_stored_datetime(value: &str, column: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            EngineError::InvalidInput(format!(
                "invalid target_instances.{column} '{value}': {error}"
            ))
        })
}

#[async_trait]
impl TargetInstanceRepository for SqliteTargetInstanceRepository {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TargetInstance>, EngineError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM target_instances
             WHERE user_id = ?1
             ORDER BY window_start, id"
        ))?;
        let rows = statement
            .query_map(params![user_id], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn list_for_target(
        &self,
        user_id: &str,
        target_id: &str,
    ) -> Result<Vec<TargetInstance>, EngineError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM target_instances
             WHERE user_id = ?1 AND target_id = ?2
             ORDER BY window_start, id"
        ))?;
        let rows = statement
            .query_map(params![user_id, target_id], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn find_by_id(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<Option<TargetInstance>, EngineError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM target_instances
                     WHERE user_id = ?1 AND id = ?2"
                ),
                params![user_id, instance_id],
                read_row,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    async fn create_if_absent(
        &self,
        instance: &TargetInstance,
    ) -> Result<CreateOutcome, EngineError> {
        instance.validate().map_err(EngineError::InvalidInput)?;

        let connection = self.connect()?;
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO target_instances
             (id, user_id, target_id, window_key, window_start, window_end, status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                instance.id,
                instance.user_id,
                instance.target_id,
                instance.window_key,
                instance.window_start.to_rfc3339(),
                instance.window_end.to_rfc3339(),
                instance.status.as_str(),
                instance.created_at.to_rfc3339(),
                instance.completed_at.map(|value| value.to_rfc3339()),
            ],
        )?;

        // Read back through the window identity so both conflict targets
        // (primary key and the per-window unique index) converge here.
        let row = connection
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM target_instances
                     WHERE user_id = ?1 AND target_id = ?2 AND window_key = ?3"
                ),
                params![instance.user_id, instance.target_id, instance.window_key],
                read_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Err(EngineError::StoreUnavailable(format!(
                "instance {} missing after upsert",
                instance.id
            )));
        };

        let stored = decode_row(row)?;
        if inserted > 0 {
            Ok(CreateOutcome::Created(stored))
        } else {
            Ok(CreateOutcome::Existing(stored))
        }
    }

    async fn mark_expired(&self, user_id: &str, instance_id: &str) -> Result<bool, EngineError> {
        let connection = self.connect()?;
        let updated = connection.execute(
            "UPDATE target_instances SET status = 'expired'
             WHERE user_id = ?1 AND id = ?2 AND status = 'active'",
            params![user_id, instance_id],
        )?;
        Ok(updated > 0)
    }

    async fn mark_completed(
        &self,
        user_id: &str,
        instance_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let connection = self.connect()?;
        let updated = connection.execute(
            "UPDATE target_instances SET status = 'completed', completed_at = ?3
             WHERE user_id = ?1 AND id = ?2 AND status = 'active'",
            params![user_id, instance_id, completed_at.to_rfc3339()],
        )?;
        Ok(updated > 0)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTargetInstanceRepository {
    instances: Mutex<HashMap<String, TargetInstance>>,
}

impl InMemoryTargetInstanceRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TargetInstance>>, EngineError>
    {
        self.instances.lock().map_err(|error| {
            EngineError::StoreUnavailable(format!("instance store lock poisoned: {error}"))
        })
    }
}

#[async_trait]
impl TargetInstanceRepository for InMemoryTargetInstanceRepository {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TargetInstance>, EngineError> {
        let instances = self.lock()?;
        let mut matching = instances
            .values()
            .filter(|instance| instance.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|left, right| {
            (left.window_start, &left.id).cmp(&(right.window_start, &right.id))
        });
        Ok(matching)
    }

    async fn list_for_target(
        &self,
        user_id: &str,
        target_id: &str,
    ) -> Result<Vec<TargetInstance>, EngineError> {
        let all = self.list_for_user(user_id).await?;
        Ok(all
            .into_iter()
            .filter(|instance| instance.target_id == target_id)
            .collect())
    }

    async fn find_by_id(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<Option<TargetInstance>, EngineError> {
        let instances = self.lock()?;
        Ok(instances
            .get(instance_id)
            .filter(|instance| instance.user_id == user_id)
            .cloned())
    }

    async fn create_if_absent(
        &self,
        instance: &TargetInstance,
    ) -> Result<CreateOutcome, EngineError> {
        instance.validate().map_err(EngineError::InvalidInput)?;

        let mut instances = self.lock()?;
        let existing = instances.values().find(|candidate| {
            candidate.user_id == instance.user_id
                && candidate.target_id == instance.target_id
                && candidate.window_key == instance.window_key
        });
        if let Some(existing) = existing {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(CreateOutcome::Created(instance.clone()))
    }

    async fn mark_expired(&self, user_id: &str, instance_id: &str) -> Result<bool, EngineError> {
        let mut instances = self.lock()?;
        let Some(stored) = instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if stored.user_id != user_id || stored.status != InstanceStatus::Active {
            return Ok(false);
        }
        stored.status = InstanceStatus::Expired;
        Ok(true)
    }

    async fn mark_completed(
        &self,
        user_id: &str,
        instance_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut instances = self.lock()?;
        let Some(stored) = instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if stored.user_id != user_id || stored.status != InstanceStatus::Active {
            return Ok(false);
        }
        stored.status = InstanceStatus::Completed;
        stored.completed_at = Some(completed_at);
        Ok(true)
    }
}
