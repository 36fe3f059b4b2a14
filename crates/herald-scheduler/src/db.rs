use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_channels::{InAppNotification, NotificationStore, TransportError};
use herald_core::{ContentTemplate, Delivery, DeliveryStatus, Schedule};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::{error, info};

use crate::{
    cron::calculate_next_run,
    error::{Result, SchedulerError},
    store::{DeliveryRepository, NextRun, ScheduleRepository, TemplateRepository},
};

/// Initialise the herald schema in `conn`.
///
/// Idempotent. Timestamps are RFC 3339 UTC strings with millisecond
/// precision so that lexical order equals chronological order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS templates (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            content_type    TEXT    NOT NULL,
            subject         TEXT    NOT NULL,
            body_html       TEXT    NOT NULL,
            body_text       TEXT    NOT NULL,
            default_config  TEXT,               -- JSON TemplateConfig or NULL
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            template_id     TEXT    NOT NULL,
            cron_expression TEXT    NOT NULL,
            timezone        TEXT    NOT NULL DEFAULT 'UTC',
            recipients      TEXT    NOT NULL,   -- JSON array
            channels        TEXT    NOT NULL,   -- JSON array of channel names
            channel_configs TEXT    NOT NULL,   -- JSON object keyed by channel
            config          TEXT,               -- JSON TemplateConfig or NULL
            enabled         INTEGER NOT NULL DEFAULT 1,
            last_run_at     TEXT,
            next_run_at     TEXT,
            last_run_status TEXT,
            run_count       INTEGER NOT NULL DEFAULT 0,
            success_count   INTEGER NOT NULL DEFAULT 0,
            failure_count   INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at);

        CREATE TABLE IF NOT EXISTS deliveries (
            id                   TEXT    NOT NULL PRIMARY KEY,
            schedule_id          TEXT    NOT NULL,
            template_id          TEXT    NOT NULL,
            channel              TEXT    NOT NULL,
            status               TEXT    NOT NULL,
            recipients_total     INTEGER NOT NULL DEFAULT 0,
            recipients_delivered INTEGER NOT NULL DEFAULT 0,
            recipients_failed    INTEGER NOT NULL DEFAULT 0,
            rendered_subject     TEXT,
            started_at           TEXT    NOT NULL,
            completed_at         TEXT,
            duration_ms          INTEGER,
            error_message        TEXT,
            triggered_by         TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_deliveries_schedule ON deliveries (schedule_id, started_at);

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT    NOT NULL PRIMARY KEY,
            user_id     TEXT    NOT NULL,
            delivery_id TEXT    NOT NULL,
            title       TEXT    NOT NULL,
            body        TEXT    NOT NULL,
            read        INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications (user_id, created_at);
        ",
    )?;
    Ok(())
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed<T: std::str::FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

const SCHEDULE_COLUMNS: &str = "id, name, template_id, cron_expression, timezone, recipients,
     channels, channel_configs, config, enabled, last_run_at, next_run_at, last_run_status,
     run_count, success_count, failure_count, created_at, updated_at";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        template_id: row.get(2)?,
        cron_expression: row.get(3)?,
        timezone: row.get(4)?,
        recipients: json_col(5, &row.get::<_, String>(5)?)?,
        channels: json_col(6, &row.get::<_, String>(6)?)?,
        channel_configs: json_col(7, &row.get::<_, String>(7)?)?,
        config: row
            .get::<_, Option<String>>(8)?
            .map(|raw| json_col(8, &raw))
            .transpose()?,
        enabled: row.get(9)?,
        last_run_at: opt_ts(row, 10)?,
        next_run_at: opt_ts(row, 11)?,
        last_run_status: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parsed(12, &raw))
            .transpose()?,
        run_count: row.get(13)?,
        success_count: row.get(14)?,
        failure_count: row.get(15)?,
        created_at: parse_ts(16, &row.get::<_, String>(16)?)?,
        updated_at: parse_ts(17, &row.get::<_, String>(17)?)?,
    })
}

const DELIVERY_COLUMNS: &str = "id, schedule_id, template_id, channel, status, recipients_total,
     recipients_delivered, recipients_failed, rendered_subject, started_at, completed_at,
     duration_ms, error_message, triggered_by";

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        template_id: row.get(2)?,
        channel: row.get(3)?,
        status: parsed(4, &row.get::<_, String>(4)?)?,
        recipients_total: row.get(5)?,
        recipients_delivered: row.get(6)?,
        recipients_failed: row.get(7)?,
        rendered_subject: row.get(8)?,
        started_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        completed_at: opt_ts(row, 10)?,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|ms| ms.max(0) as u64),
        error_message: row.get(12)?,
        triggered_by: parsed(13, &row.get::<_, String>(13)?)?,
    })
}

/// SQLite-backed repository for schedules, templates, delivery records and
/// in-app notifications.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    // --- administration ------------------------------------------------------

    /// Insert a template, replacing any existing one with the same id.
    pub fn add_template(&self, template: &ContentTemplate) -> Result<()> {
        let default_config = template
            .default_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO templates
             (id, name, content_type, subject, body_html, body_text, default_config, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                template.id,
                template.name,
                template.content_type,
                template.subject,
                template.body_html,
                template.body_text,
                default_config,
                ts(Utc::now()),
            ],
        )?;
        info!(template_id = %template.id, name = %template.name, "template stored");
        Ok(())
    }

    /// Insert a schedule after validating its cron expression and zone.
    ///
    /// When `next_run_at` is unset on an enabled schedule it is computed from
    /// now. Returns the schedule as stored.
    pub fn add_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let now = Utc::now();
        let mut stored = schedule.clone();
        let first_run = calculate_next_run(&stored.cron_expression, now, &stored.timezone)?;
        if stored.enabled && stored.next_run_at.is_none() {
            stored.next_run_at = Some(first_run);
        }
        if stored.channels.is_empty() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "schedule {} has no channels",
                stored.id
            )));
        }

        let recipients = serde_json::to_string(&stored.recipients)?;
        let channels = serde_json::to_string(&stored.channels)?;
        let channel_configs = serde_json::to_string(&stored.channel_configs)?;
        let config = stored.config.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules
             (id, name, template_id, cron_expression, timezone, recipients, channels,
              channel_configs, config, enabled, last_run_at, next_run_at, last_run_status,
              run_count, success_count, failure_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                stored.id,
                stored.name,
                stored.template_id,
                stored.cron_expression,
                stored.timezone,
                recipients,
                channels,
                channel_configs,
                config,
                stored.enabled,
                stored.last_run_at.map(ts),
                stored.next_run_at.map(ts),
                stored.last_run_status.map(|s| s.to_string()),
                stored.run_count,
                stored.success_count,
                stored.failure_count,
                ts(stored.created_at),
                ts(stored.updated_at),
            ],
        )?;
        info!(schedule_id = %stored.id, name = %stored.name, next_run_at = ?stored.next_run_at, "schedule added");
        Ok(stored)
    }

    pub fn remove_schedule(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found("schedule", id));
        }
        info!(schedule_id = %id, "schedule removed");
        Ok(())
    }

    /// All schedules ordered by creation time.
    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at, id"
        ))?;
        let schedules = stmt
            .query_map([], schedule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    /// Most recent delivery records first, optionally for one schedule.
    pub fn list_deliveries(&self, schedule_id: Option<&str>, limit: usize) -> Result<Vec<Delivery>> {
        let conn = self.conn.lock().unwrap();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deliveries = match schedule_id {
            Some(id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE schedule_id = ?1 ORDER BY started_at DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![id, limit], delivery_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries ORDER BY started_at DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map([limit], delivery_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(deliveries)
    }

    pub fn list_notifications(&self, user_id: &str) -> Result<Vec<InAppNotification>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, delivery_id, title, body, read, created_at
             FROM notifications WHERE user_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok(InAppNotification {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    delivery_id: row.get(2)?,
                    title: row.get(3)?,
                    body: row.get(4)?,
                    read: row.get(5)?,
                    created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- sync internals shared by the repository traits -----------------------

    fn due_schedules_sync(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at"
        ))?;
        // A corrupt row must not block every other schedule.
        let due = stmt
            .query_map([ts(now)], schedule_from_row)?
            .filter_map(|r| match r {
                Ok(s) => Some(s),
                Err(e) => {
                    error!(error = %e, "skipping unreadable schedule row");
                    None
                }
            })
            .collect();
        Ok(due)
    }

    fn get_schedule_sync(&self, id: &str) -> Result<Schedule> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
            [id],
            schedule_from_row,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("schedule", id))
    }

    fn update_run_status_sync(
        &self,
        id: &str,
        status: DeliveryStatus,
        ran_at: DateTime<Utc>,
        next_run: NextRun,
    ) -> Result<()> {
        let succeeded = matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Partial);
        let failed = status == DeliveryStatus::Failed;
        let conn = self.conn.lock().unwrap();
        let n = match next_run {
            NextRun::Keep => conn.execute(
                "UPDATE schedules SET last_run_status = ?2, last_run_at = ?3,
                   run_count = run_count + 1,
                   success_count = success_count + ?4,
                   failure_count = failure_count + ?5,
                   updated_at = ?3
                 WHERE id = ?1",
                params![id, status.to_string(), ts(ran_at), succeeded as i64, failed as i64],
            )?,
            NextRun::Set(_) | NextRun::Clear => {
                let next = match next_run {
                    NextRun::Set(at) => Some(ts(at)),
                    _ => None,
                };
                conn.execute(
                    "UPDATE schedules SET last_run_status = ?2, last_run_at = ?3,
                       run_count = run_count + 1,
                       success_count = success_count + ?4,
                       failure_count = failure_count + ?5,
                       next_run_at = ?6,
                       updated_at = ?3
                     WHERE id = ?1",
                    params![
                        id,
                        status.to_string(),
                        ts(ran_at),
                        succeeded as i64,
                        failed as i64,
                        next
                    ],
                )?
            }
        };
        if n == 0 {
            return Err(SchedulerError::not_found("schedule", id));
        }
        Ok(())
    }

    fn get_template_sync(&self, id: &str) -> Result<ContentTemplate> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, content_type, subject, body_html, body_text, default_config
             FROM templates WHERE id = ?1",
            [id],
            |row| {
                Ok(ContentTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content_type: row.get(2)?,
                    subject: row.get(3)?,
                    body_html: row.get(4)?,
                    body_text: row.get(5)?,
                    default_config: row
                        .get::<_, Option<String>>(6)?
                        .map(|raw| json_col(6, &raw))
                        .transpose()?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("template", id))
    }

    fn write_delivery(&self, delivery: &Delivery, insert: bool) -> Result<()> {
        let sql = if insert {
            "INSERT INTO deliveries
             (id, schedule_id, template_id, channel, status, recipients_total,
              recipients_delivered, recipients_failed, rendered_subject, started_at,
              completed_at, duration_ms, error_message, triggered_by)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
        } else {
            "UPDATE deliveries SET schedule_id = ?2, template_id = ?3, channel = ?4, status = ?5,
               recipients_total = ?6, recipients_delivered = ?7, recipients_failed = ?8,
               rendered_subject = ?9, started_at = ?10, completed_at = ?11, duration_ms = ?12,
               error_message = ?13, triggered_by = ?14
             WHERE id = ?1"
        };
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            sql,
            params![
                delivery.id,
                delivery.schedule_id,
                delivery.template_id,
                delivery.channel,
                delivery.status.to_string(),
                delivery.recipients_total,
                delivery.recipients_delivered,
                delivery.recipients_failed,
                delivery.rendered_subject,
                ts(delivery.started_at),
                delivery.completed_at.map(ts),
                delivery.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
                delivery.error_message,
                delivery.triggered_by.to_string(),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found("delivery", &delivery.id));
        }
        Ok(())
    }

    fn get_delivery_sync(&self, id: &str) -> Result<Delivery> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"),
            [id],
            delivery_from_row,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("delivery", id))
    }

    fn insert_notification(&self, n: &InAppNotification) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications (id, user_id, delivery_id, title, body, read, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![n.id, n.user_id, n.delivery_id, n.title, n.body, n.read, ts(n.created_at)],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleRepository for SqliteStore {
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        self.due_schedules_sync(now)
    }

    async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        self.get_schedule_sync(id)
    }

    async fn update_run_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        ran_at: DateTime<Utc>,
        next_run: NextRun,
    ) -> Result<()> {
        self.update_run_status_sync(id, status, ran_at, next_run)
    }
}

#[async_trait]
impl TemplateRepository for SqliteStore {
    async fn get_template(&self, id: &str) -> Result<ContentTemplate> {
        self.get_template_sync(id)
    }
}

#[async_trait]
impl DeliveryRepository for SqliteStore {
    async fn create_delivery(&self, delivery: &Delivery) -> Result<()> {
        self.write_delivery(delivery, true)
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<()> {
        self.write_delivery(delivery, false)
    }

    async fn get_delivery(&self, id: &str) -> Result<Delivery> {
        self.get_delivery_sync(id)
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn create_notification(&self, notification: &InAppNotification) -> std::result::Result<(), TransportError> {
        self.insert_notification(notification)
            .map_err(|e| TransportError::new(e.to_string()))
    }
}
