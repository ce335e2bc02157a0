//! SQLite storage layer for Vigil.
//!
//! All timestamps are stored as Unix milliseconds. Enumerated attributes are
//! stored as their text names.
//!
//! The one-active-alert-per-(channel, rule) invariant is enforced by a partial
//! unique index on `alerts`, so a racing second insert fails instead of
//! producing a duplicate. Acknowledgement is a conditional update that only
//! succeeds while `acknowledged_by` is still empty.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    Alert, AlertType, Channel, Contact, Id, Monitor, NewChannel, NewContact, NewMonitor,
    NewReading, NewRule, Preference, Reading, Rule, RuleState, SensorType,
};
use crate::rules::Condition;

/// Maximum pooled connections for file-backed databases.
const MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::invalid_value("timestamp", ms))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn monitor_from_row(row: &SqliteRow) -> Result<Monitor> {
    Ok(Monitor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        last_update: opt_from_millis(row.try_get("last_update")?)?,
    })
}

fn sensor_type_from_row(row: &SqliteRow) -> Result<SensorType> {
    Ok(SensorType {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        system: row.try_get::<String, _>("system")?.parse()?,
        metric_unit: row.try_get("metric_unit")?,
        imperial_unit: row.try_get("imperial_unit")?,
        to_imperial: row.try_get::<String, _>("to_imperial")?.parse()?,
        to_metric: row.try_get::<String, _>("to_metric")?.parse()?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    Ok(Channel {
        id: row.try_get("id")?,
        monitor_id: row.try_get("monitor_id")?,
        channel_num: row.try_get("channel_num")?,
        sensor_type_id: row.try_get("sensor_type_id")?,
        name: row.try_get("name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        calibration_offset: row.try_get("calibration_offset")?,
        last_reading_id: row.try_get("last_reading_id")?,
        last_alert_id: row.try_get("last_alert_id")?,
    })
}

fn reading_from_row(row: &SqliteRow) -> Result<Reading> {
    Ok(Reading {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        monitor_time: from_millis(row.try_get("monitor_time")?)?,
        transaction_time: from_millis(row.try_get("transaction_time")?)?,
        raw_value: row.try_get("raw_value")?,
        offset: row.try_get("offset_value")?,
        value: row.try_get("value")?,
        is_valid: row.try_get("is_valid")?,
    })
}

fn contact_from_row(row: &SqliteRow) -> Result<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        sms_number: row.try_get("sms_number")?,
        sms_gateway: row.try_get("sms_gateway")?,
        is_active: row.try_get("is_active")?,
        preference: Preference {
            contact_method: row.try_get::<String, _>("contact_method")?.parse()?,
            measurement_system: row.try_get::<String, _>("measurement_system")?.parse()?,
        },
    })
}

fn rule_from_row(row: &SqliteRow, contacts: Vec<Id>) -> Result<Rule> {
    let condition = Condition::from_parts(
        row.try_get::<String, _>("selector")?.parse()?,
        row.try_get("lower_threshold")?,
        row.try_get("upper_threshold")?,
    )?;

    Ok(Rule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        condition,
        action: row.try_get::<String, _>("action")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        paused_until: opt_from_millis(row.try_get("paused_until")?)?,
        contacts,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<Alert> {
    let token: String = row.try_get("token")?;
    Ok(Alert {
        id: row.try_get("id")?,
        alert_type: row.try_get::<String, _>("alert_type")?.parse()?,
        monitor_id: row.try_get("monitor_id")?,
        channel_id: row.try_get("channel_id")?,
        reading_id: row.try_get("reading_id")?,
        rule_id: row.try_get("rule_id")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        active: row.try_get("active")?,
        resolved_at: opt_from_millis(row.try_get("resolved_at")?)?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        acknowledged_at: opt_from_millis(row.try_get("acknowledged_at")?)?,
        token: Uuid::parse_str(&token).map_err(|_| Error::invalid_value("alert token", token))?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:vigil.db?mode=rwc" or "sqlite::memory:")
    ///
    /// In-memory databases are private to a single connection, so the pool is
    /// limited to one long-lived connection in that case.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { MAX_CONNECTIONS })
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS monitors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                last_update INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sensor_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                system TEXT NOT NULL,
                metric_unit TEXT NOT NULL,
                imperial_unit TEXT NOT NULL,
                to_imperial TEXT NOT NULL,
                to_metric TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL REFERENCES monitors(id),
                channel_num INTEGER NOT NULL,
                sensor_type_id INTEGER NOT NULL REFERENCES sensor_types(id),
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                calibration_offset REAL NOT NULL DEFAULT 0.0,
                last_reading_id INTEGER,
                last_alert_id INTEGER,
                UNIQUE (monitor_id, channel_num)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL REFERENCES channels(id),
                monitor_time INTEGER NOT NULL,
                transaction_time INTEGER NOT NULL,
                raw_value REAL NOT NULL,
                offset_value REAL NOT NULL,
                value REAL NOT NULL,
                is_valid INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_readings_channel_valid
            ON readings(channel_id, is_valid, id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_readings_channel_time
            ON readings(channel_id, monitor_time)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                full_name TEXT NOT NULL,
                email TEXT NOT NULL,
                sms_number TEXT,
                sms_gateway TEXT,
                is_active INTEGER NOT NULL,
                contact_method TEXT NOT NULL,
                measurement_system TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                selector TEXT NOT NULL,
                lower_threshold REAL,
                upper_threshold REAL,
                action TEXT NOT NULL,
                state TEXT NOT NULL,
                paused_until INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rule_channels (
                rule_id INTEGER NOT NULL REFERENCES rules(id),
                channel_id INTEGER NOT NULL REFERENCES channels(id),
                PRIMARY KEY (rule_id, channel_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rule_contacts (
                rule_id INTEGER NOT NULL REFERENCES rules(id),
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                position INTEGER NOT NULL,
                PRIMARY KEY (rule_id, contact_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_type TEXT NOT NULL,
                monitor_id INTEGER NOT NULL REFERENCES monitors(id),
                channel_id INTEGER REFERENCES channels(id),
                reading_id INTEGER,
                rule_id INTEGER,
                created_at INTEGER NOT NULL,
                active INTEGER NOT NULL,
                resolved_at INTEGER,
                acknowledged_by INTEGER REFERENCES contacts(id),
                acknowledged_at INTEGER,
                token TEXT NOT NULL UNIQUE
            )
            "#,
            // At most one active channel alert per (channel, rule)
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_one_active
            ON alerts(channel_id, rule_id)
            WHERE active = 1 AND alert_type = 'channel'
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    pub async fn create_monitor(&self, monitor: &NewMonitor) -> Result<Monitor> {
        let id = sqlx::query(
            r#"
            INSERT INTO monitors (name, location, status)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&monitor.name)
        .bind(&monitor.location)
        .bind(monitor.status.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_monitor(id).await
    }

    pub async fn get_monitor(&self, id: Id) -> Result<Monitor> {
        let row = sqlx::query("SELECT * FROM monitors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("monitor", id))?;

        monitor_from_row(&row)
    }

    pub async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let rows = sqlx::query("SELECT * FROM monitors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(monitor_from_row).collect()
    }

    /// Record that a monitor delivered data at `now`.
    pub async fn touch_monitor(&self, id: Id, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE monitors SET last_update = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensor types and channels
    // ------------------------------------------------------------------

    pub async fn create_sensor_type(&self, sensor_type: &SensorType) -> Result<SensorType> {
        let id = sqlx::query(
            r#"
            INSERT INTO sensor_types (name, system, metric_unit, imperial_unit, to_imperial, to_metric)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sensor_type.name)
        .bind(sensor_type.system.as_str())
        .bind(&sensor_type.metric_unit)
        .bind(&sensor_type.imperial_unit)
        .bind(sensor_type.to_imperial.as_str())
        .bind(sensor_type.to_metric.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_sensor_type(id).await
    }

    pub async fn get_sensor_type(&self, id: Id) -> Result<SensorType> {
        let row = sqlx::query("SELECT * FROM sensor_types WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("sensor type", id))?;

        sensor_type_from_row(&row)
    }

    pub async fn create_channel(&self, channel: &NewChannel) -> Result<Channel> {
        // Surface missing parents as not-found rather than constraint failures.
        self.get_monitor(channel.monitor_id).await?;
        self.get_sensor_type(channel.sensor_type_id).await?;

        let id = sqlx::query(
            r#"
            INSERT INTO channels (monitor_id, channel_num, sensor_type_id, name, status, calibration_offset)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel.monitor_id)
        .bind(channel.channel_num)
        .bind(channel.sensor_type_id)
        .bind(&channel.name)
        .bind(channel.status.as_str())
        .bind(channel.calibration_offset)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_channel(id).await
    }

    pub async fn get_channel(&self, id: Id) -> Result<Channel> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("channel", id))?;

        channel_from_row(&row)
    }

    /// List channels, optionally restricted to one monitor.
    pub async fn list_channels(&self, monitor_id: Option<Id>) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM channels
            WHERE ?1 IS NULL OR monitor_id = ?1
            ORDER BY monitor_id, channel_num
            "#,
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(channel_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------

    /// Store a reading. The row is committed before this returns.
    pub async fn insert_reading(&self, reading: &NewReading) -> Result<Reading> {
        let id = sqlx::query(
            r#"
            INSERT INTO readings (channel_id, monitor_time, transaction_time, raw_value, offset_value, value, is_valid)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.channel_id)
        .bind(to_millis(reading.monitor_time))
        .bind(to_millis(reading.transaction_time))
        .bind(reading.raw_value)
        .bind(reading.offset)
        .bind(reading.value)
        .bind(reading.is_valid)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Reading {
            id,
            channel_id: reading.channel_id,
            monitor_time: reading.monitor_time,
            transaction_time: reading.transaction_time,
            raw_value: reading.raw_value,
            offset: reading.offset,
            value: reading.value,
            is_valid: reading.is_valid,
        })
    }

    pub async fn get_reading(&self, id: Id) -> Result<Reading> {
        let row = sqlx::query("SELECT * FROM readings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("reading", id))?;

        reading_from_row(&row)
    }

    /// The most recently stored valid reading for a channel, read from the
    /// readings table rather than the cached channel pointer.
    pub async fn last_valid_reading(&self, channel_id: Id) -> Result<Option<Reading>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM readings
            WHERE channel_id = ? AND is_valid = 1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(reading_from_row).transpose()
    }

    /// Point `channel.last_reading_id` at `reading_id` unless a newer reading
    /// is already cached.
    pub async fn update_last_reading(&self, channel_id: Id, reading_id: Id) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE channels
            SET last_reading_id = ?1
            WHERE id = ?2 AND (last_reading_id IS NULL OR last_reading_id < ?1)
            "#,
        )
        .bind(reading_id)
        .bind(channel_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Readings for a channel ordered by device time.
    ///
    /// # Arguments
    ///
    /// * `channel_id` - The channel to query
    /// * `from` / `until` - Optional inclusive bounds on device time
    /// * `include_invalid` - Whether spike-rejected readings are returned
    pub async fn readings_for_channel(
        &self,
        channel_id: Id,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        include_invalid: bool,
    ) -> Result<Vec<Reading>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM readings
            WHERE channel_id = ?1
              AND (?2 IS NULL OR monitor_time >= ?2)
              AND (?3 IS NULL OR monitor_time <= ?3)
              AND (?4 = 1 OR is_valid = 1)
            ORDER BY monitor_time, id
            "#,
        )
        .bind(channel_id)
        .bind(from.map(to_millis))
        .bind(until.map(to_millis))
        .bind(include_invalid)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(reading_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    pub async fn create_contact(&self, contact: &NewContact) -> Result<Contact> {
        let id = sqlx::query(
            r#"
            INSERT INTO contacts (full_name, email, sms_number, sms_gateway, is_active, contact_method, measurement_system)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&contact.full_name)
        .bind(&contact.email)
        .bind(&contact.sms_number)
        .bind(&contact.sms_gateway)
        .bind(contact.is_active)
        .bind(contact.preference.contact_method.as_str())
        .bind(contact.preference.measurement_system.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_contact(id).await
    }

    pub async fn get_contact(&self, id: Id) -> Result<Contact> {
        let row = sqlx::query("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("contact", id))?;

        contact_from_row(&row)
    }

    /// Contacts attached to a rule, in notification order.
    pub async fn contacts_for_rule(&self, rule_id: Id) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM contacts c
            JOIN rule_contacts rc ON rc.contact_id = c.id
            WHERE rc.rule_id = ?
            ORDER BY rc.position
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(contact_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// Validate and store a rule with its channels and ordered contacts.
    ///
    /// Malformed threshold configurations are rejected with
    /// [`Error::InvalidRule`] before anything is written.
    pub async fn create_rule(&self, rule: &NewRule) -> Result<Rule> {
        let condition =
            Condition::from_parts(rule.selector, rule.lower_threshold, rule.upper_threshold)?;

        for channel_id in &rule.channels {
            self.get_channel(*channel_id).await?;
        }
        for contact_id in &rule.contacts {
            self.get_contact(*contact_id).await?;
        }

        let mut tx = self.pool.begin().await?;

        let rule_id = sqlx::query(
            r#"
            INSERT INTO rules (name, selector, lower_threshold, upper_threshold, action, state)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.name)
        .bind(condition.selector().as_str())
        .bind(condition.lower())
        .bind(condition.upper())
        .bind(rule.action.as_str())
        .bind(rule.state.as_str())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for channel_id in &rule.channels {
            sqlx::query("INSERT OR IGNORE INTO rule_channels (rule_id, channel_id) VALUES (?, ?)")
                .bind(rule_id)
                .bind(channel_id)
                .execute(&mut *tx)
                .await?;
        }

        for (position, contact_id) in rule.contacts.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO rule_contacts (rule_id, contact_id, position) VALUES (?, ?, ?)",
            )
            .bind(rule_id)
            .bind(contact_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_rule(rule_id).await
    }

    async fn rule_contact_ids(&self, rule_id: Id) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            "SELECT contact_id FROM rule_contacts WHERE rule_id = ? ORDER BY position",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let ids = rows
            .iter()
            .map(|r| r.try_get("contact_id"))
            .collect::<sqlx::Result<Vec<Id>>>()?;
        Ok(ids)
    }

    pub async fn get_rule(&self, id: Id) -> Result<Rule> {
        let row = sqlx::query("SELECT * FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("rule", id))?;

        let contacts = self.rule_contact_ids(id).await?;
        rule_from_row(&row, contacts)
    }

    /// All rules attached to a channel, in rule id order.
    pub async fn rules_for_channel(&self, channel_id: Id) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT r.* FROM rules r
            JOIN rule_channels rc ON rc.rule_id = r.id
            WHERE rc.channel_id = ?
            ORDER BY r.id
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            let contacts = self.rule_contact_ids(row.try_get("id")?).await?;
            rules.push(rule_from_row(row, contacts)?);
        }
        Ok(rules)
    }

    /// Change a rule's state. `paused_until` is only kept for paused rules.
    pub async fn set_rule_state(
        &self,
        id: Id,
        state: RuleState,
        paused_until: Option<DateTime<Utc>>,
    ) -> Result<Rule> {
        let paused_until = match state {
            RuleState::Paused => paused_until.map(to_millis),
            _ => None,
        };

        let updated = sqlx::query("UPDATE rules SET state = ?, paused_until = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(paused_until)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("rule", id));
        }
        self.get_rule(id).await
    }

    /// Reactivate paused rules whose pause has expired. Returns their ids.
    pub async fn resume_due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            r#"
            UPDATE rules
            SET state = 'active', paused_until = NULL
            WHERE state = 'paused' AND paused_until IS NOT NULL AND paused_until <= ?
            RETURNING id
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        let ids = rows
            .iter()
            .map(|r| r.try_get("id"))
            .collect::<sqlx::Result<Vec<Id>>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Open a channel alert and point `channel.last_alert_id` at it.
    ///
    /// Both writes happen in one transaction. Returns `None` if an active
    /// alert for the same (channel, rule) already exists.
    pub async fn open_channel_alert(
        &self,
        channel: &Channel,
        rule_id: Id,
        reading_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let token = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO alerts (alert_type, monitor_id, channel_id, reading_id, rule_id, created_at, active, token)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(AlertType::Channel.as_str())
        .bind(channel.monitor_id)
        .bind(channel.id)
        .bind(reading_id)
        .bind(rule_id)
        .bind(to_millis(now))
        .bind(token.to_string())
        .execute(&mut *tx)
        .await;

        let alert_id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query("UPDATE channels SET last_alert_id = ? WHERE id = ?")
            .bind(alert_id)
            .bind(channel.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.get_alert(alert_id).await.map(Some)
    }

    pub async fn get_alert(&self, id: Id) -> Result<Alert> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("alert", id))?;

        alert_from_row(&row)
    }

    pub async fn get_alert_by_token(&self, token: Uuid) -> Result<Alert> {
        let row = sqlx::query("SELECT * FROM alerts WHERE token = ?")
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("alert", token))?;

        alert_from_row(&row)
    }

    /// Active channel alerts for a (channel, rule) pair, oldest first.
    pub async fn active_alerts_for(&self, channel_id: Id, rule_id: Id) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE channel_id = ? AND rule_id = ? AND active = 1 AND alert_type = 'channel'
            ORDER BY id
            "#,
        )
        .bind(channel_id)
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    /// All active alerts, newest first.
    pub async fn list_active_alerts(&self) -> Result<Vec<Alert>> {
        let rows = sqlx::query("SELECT * FROM alerts WHERE active = 1 ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    /// Mark an active alert resolved. Returns false if it was not active.
    pub async fn resolve_alert(&self, id: Id, now: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE alerts SET active = 0, resolved_at = ? WHERE id = ? AND active = 1",
        )
        .bind(to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// Record an acknowledgement if none exists yet.
    ///
    /// Returns true only for the call that performed the write; concurrent or
    /// repeated calls see false.
    pub async fn acknowledge_alert(
        &self,
        token: Uuid,
        contact_id: Id,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE alerts
            SET acknowledged_by = ?, acknowledged_at = ?
            WHERE token = ? AND acknowledged_by IS NULL
            "#,
        )
        .bind(contact_id)
        .bind(to_millis(now))
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }
}

#[cfg(test)]
impl Storage {
    /// Insert a second active alert for (channel, rule), bypassing the
    /// uniqueness index the way legacy data might.
    pub(crate) async fn insert_duplicate_active_alert(
        &self,
        channel: &Channel,
        rule_id: Id,
        reading_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        sqlx::query("DROP INDEX IF EXISTS idx_alerts_one_active")
            .execute(&self.pool)
            .await?;
        let alert_id = sqlx::query(
            r#"
            INSERT INTO alerts (alert_type, monitor_id, channel_id, reading_id, rule_id, created_at, active, token)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(AlertType::Channel.as_str())
        .bind(channel.monitor_id)
        .bind(channel.id)
        .bind(reading_id)
        .bind(rule_id)
        .bind(to_millis(now))
        .bind(Uuid::new_v4().to_string())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_alert(alert_id).await
    }
}
