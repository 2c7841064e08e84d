//! SQLite persistence for employees, templates, punches and calibration.
//!
//! Every multi-row write runs in an IMMEDIATE transaction so concurrent
//! writers (capture worker, sync worker, admin) serialize on the database
//! write lock instead of failing half-way. Template payloads are stored with
//! a SHA-256 digest; a payload that no longer matches its digest is never
//! handed to the matcher.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::quality::ProbeTemplate;
use crate::{
    open_db_connection, validate_employee_code, CalibrationRoi, Employee, EnrolledEmployee,
    FingerprintTemplate, Punch, PunchDirection, PunchType, SyncStatus,
};

const EMPLOYEE_COLUMNS: &str =
    "id, employee_code, name, active, last_punch_direction, last_punch_time, created_at";

const PUNCH_SELECT: &str = r#"
    SELECT p.id, p.punch_uid, p.employee_id, e.employee_code, p.device_id,
           p.timestamp_utc, p.timestamp_local, p.punch_type, p.match_score,
           p.sync_status, p.sync_attempts, p.last_sync_attempt_time,
           p.last_sync_error, p.needs_attention
    FROM punches p
    JOIN employees e ON e.id = p.employee_id
"#;

pub struct Store {
    conn: Connection,
}

/// Employee listing row for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct EmployeeSummary {
    #[serde(flatten)]
    pub employee: Employee,
    pub template_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub pending: u64,
    pub failed: u64,
    pub needs_attention: u64,
    pub synced: u64,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS employees (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              employee_code TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              active INTEGER NOT NULL DEFAULT 1,
              last_punch_direction TEXT NOT NULL DEFAULT 'NONE',
              last_punch_time TEXT,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fingerprint_templates (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              employee_id INTEGER NOT NULL REFERENCES employees(id),
              capture_index INTEGER NOT NULL,
              payload BLOB NOT NULL,
              payload_sha256 BLOB NOT NULL,
              quality_score INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              UNIQUE (employee_id, capture_index)
            );

            CREATE TABLE IF NOT EXISTS punches (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              punch_uid TEXT NOT NULL UNIQUE,
              employee_id INTEGER NOT NULL REFERENCES employees(id),
              device_id TEXT NOT NULL,
              timestamp_utc TEXT NOT NULL,
              timestamp_local TEXT NOT NULL,
              punch_type TEXT NOT NULL,
              match_score INTEGER NOT NULL,
              sync_status TEXT NOT NULL DEFAULT 'PENDING',
              sync_attempts INTEGER NOT NULL DEFAULT 0,
              last_sync_attempt_time TEXT,
              last_sync_error TEXT,
              needs_attention INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS calibration (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              x INTEGER NOT NULL,
              y INTEGER NOT NULL,
              width INTEGER NOT NULL,
              height INTEGER NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_punches_sync ON punches(sync_status, needs_attention, id);
            CREATE INDEX IF NOT EXISTS idx_punches_employee ON punches(employee_id, id);
            CREATE INDEX IF NOT EXISTS idx_templates_employee ON fingerprint_templates(employee_id);
            "#,
        )?;
        Ok(())
    }

    // ---- Employees ----

    pub fn create_employee(&mut self, code: &str, name: &str, now: DateTime<Utc>) -> Result<Employee> {
        validate_employee_code(code)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("employee name must not be empty"));
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_employee_by_code(&tx, code)?.is_some() {
            return Err(anyhow!("employee code {} already exists", code));
        }
        tx.execute(
            "INSERT INTO employees (employee_code, name, active, last_punch_direction, created_at)
             VALUES (?1, ?2, 1, 'NONE', ?3)",
            params![code, name, ts(&now)],
        )?;
        let id = tx.last_insert_rowid();
        let employee = load_employee(&tx, id)?
            .ok_or_else(|| anyhow!("employee {} vanished after insert", id))?;
        tx.commit()?;
        log::info!("employee created: {}", code);
        Ok(employee)
    }

    pub fn employee(&self, id: i64) -> Result<Option<Employee>> {
        load_employee(&self.conn, id)
    }

    pub fn employee_by_code(&self, code: &str) -> Result<Option<Employee>> {
        load_employee_by_code(&self.conn, code)
    }

    pub fn list_employees(&self) -> Result<Vec<EmployeeSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {}, (SELECT COUNT(*) FROM fingerprint_templates t WHERE t.employee_id = employees.id)
             FROM employees ORDER BY employee_code",
            EMPLOYEE_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((read_employee_row(row)?, row.get::<_, i64>(7)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (raw, count) = row?;
            out.push(EmployeeSummary {
                employee: raw.into_employee()?,
                template_count: count as u32,
            });
        }
        Ok(out)
    }

    /// Employees are never deleted; deactivation removes them from matching.
    pub fn deactivate_employee(&mut self, code: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE employees SET active = 0 WHERE employee_code = ?1 AND active = 1",
            params![code],
        )?;
        if changed > 0 {
            log::info!("employee deactivated: {}", code);
        }
        Ok(changed > 0)
    }

    // ---- Templates ----

    pub fn templates_for(&self, employee_id: i64) -> Result<Vec<FingerprintTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, employee_id, payload, payload_sha256, quality_score, capture_index
             FROM fingerprint_templates WHERE employee_id = ?1 ORDER BY capture_index",
        )?;
        let rows = stmt.query_map(params![employee_id], read_template_row)?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(template) = row?.verified() {
                out.push(template);
            }
        }
        Ok(out)
    }

    /// Swap an employee's template set in one transaction: all prior templates
    /// are deleted and the new set inserted, or nothing changes.
    pub fn replace_templates(
        &mut self,
        employee_id: i64,
        templates: &[ProbeTemplate],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if templates.is_empty() {
            return Err(anyhow!("refusing to store an empty template set"));
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_employee(&tx, employee_id)?.is_none() {
            return Err(anyhow!("employee {} not found", employee_id));
        }
        let removed = write_templates(&tx, employee_id, templates, &now)?;
        tx.commit()?;
        log::info!(
            "templates stored for employee {}: {} new, {} replaced",
            employee_id,
            templates.len(),
            removed
        );
        Ok(())
    }

    /// First enrollment: the employee and its templates land together or not at all.
    pub fn create_employee_with_templates(
        &mut self,
        code: &str,
        name: &str,
        templates: &[ProbeTemplate],
        now: DateTime<Utc>,
    ) -> Result<Employee> {
        validate_employee_code(code)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("employee name must not be empty"));
        }
        if templates.is_empty() {
            return Err(anyhow!("refusing to store an empty template set"));
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_employee_by_code(&tx, code)?.is_some() {
            return Err(anyhow!("employee code {} already exists", code));
        }
        tx.execute(
            "INSERT INTO employees (employee_code, name, active, last_punch_direction, created_at)
             VALUES (?1, ?2, 1, 'NONE', ?3)",
            params![code, name, ts(&now)],
        )?;
        let id = tx.last_insert_rowid();
        write_templates(&tx, id, templates, &now)?;
        let employee = load_employee(&tx, id)?
            .ok_or_else(|| anyhow!("employee {} vanished after insert", id))?;
        tx.commit()?;
        log::info!("employee enrolled: {} ({} templates)", code, templates.len());
        Ok(employee)
    }

    /// Active employees holding exactly `required` intact templates.
    pub fn enrolled_gallery(&self, required: u32) -> Result<Vec<EnrolledEmployee>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.employee_code, e.name,
                    t.id, t.employee_id, t.payload, t.payload_sha256, t.quality_score, t.capture_index
             FROM employees e
             JOIN fingerprint_templates t ON t.employee_id = e.id
             WHERE e.active = 1
             ORDER BY e.id, t.capture_index",
        )?;
        let mut rows = stmt.query([])?;
        let mut gallery: Vec<EnrolledEmployee> = Vec::new();
        while let Some(row) = rows.next()? {
            let employee_id: i64 = row.get(0)?;
            let template = TemplateRow {
                id: row.get(3)?,
                employee_id: row.get(4)?,
                payload: row.get(5)?,
                digest: row.get(6)?,
                quality_score: row.get(7)?,
                capture_index: row.get(8)?,
            };
            if gallery.last().map(|e| e.employee_id) != Some(employee_id) {
                gallery.push(EnrolledEmployee {
                    employee_id,
                    employee_code: row.get(1)?,
                    name: row.get(2)?,
                    templates: Vec::new(),
                });
            }
            if let (Some(current), Some(template)) = (gallery.last_mut(), template.verified()) {
                current.templates.push(template);
            }
        }
        gallery.retain(|e| e.templates.len() == required as usize);
        Ok(gallery)
    }

    // ---- Punches ----

    /// Open the transaction a punch decision runs in.
    pub fn begin_punch(&mut self) -> Result<PunchTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(PunchTx { tx })
    }

    pub fn punch(&self, id: i64) -> Result<Option<Punch>> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE p.id = ?1", PUNCH_SELECT),
                params![id],
                read_punch_row,
            )
            .optional()?;
        raw.map(PunchRow::into_punch).transpose()
    }

    /// Most recent punches first, optionally for one employee.
    pub fn recent_punches(&self, employee_code: Option<&str>, limit: usize) -> Result<Vec<Punch>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE (?1 IS NULL OR e.employee_code = ?1) ORDER BY p.id DESC LIMIT ?2",
            PUNCH_SELECT
        ))?;
        let rows = stmt
            .query_map(params![employee_code, limit as i64], read_punch_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PunchRow::into_punch).collect()
    }

    /// Oldest PENDING/FAILED punches not withheld for operator attention.
    pub fn pending_punches(&self, limit: usize) -> Result<Vec<Punch>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE p.sync_status IN ('PENDING', 'FAILED') AND p.needs_attention = 0
             ORDER BY p.id ASC LIMIT ?1",
            PUNCH_SELECT
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], read_punch_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PunchRow::into_punch).collect()
    }

    pub fn mark_synced(&mut self, ids: &[i64], at: DateTime<Utc>) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = ts(&at);
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE punches
                 SET sync_status = 'SYNCED', last_sync_attempt_time = ?2, last_sync_error = NULL
                 WHERE id = ?1 AND needs_attention = 0",
                params![id, at],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Record a failed submission. A permanent failure withholds the punches
    /// from automatic retry until an operator requeues them.
    pub fn mark_failed(
        &mut self,
        ids: &[i64],
        at: DateTime<Utc>,
        error: &str,
        permanent: bool,
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = ts(&at);
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE punches
                 SET sync_status = 'FAILED',
                     sync_attempts = sync_attempts + 1,
                     last_sync_attempt_time = ?2,
                     last_sync_error = ?3,
                     needs_attention = ?4
                 WHERE id = ?1 AND sync_status != 'SYNCED'",
                params![id, at, error, permanent as i64],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Return withheld punches to the queue. An empty `ids` requeues all of them.
    pub fn requeue(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            let changed = self.conn.execute(
                "UPDATE punches SET needs_attention = 0, sync_status = 'PENDING'
                 WHERE needs_attention = 1",
                [],
            )?;
            return Ok(changed);
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE punches SET needs_attention = 0, sync_status = 'PENDING'
                 WHERE id = ?1 AND needs_attention = 1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Delete SYNCED punches older than `before`. Each employee's latest punch
    /// is kept so its recorded direction stays backed by a row.
    pub fn purge_synced(&mut self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM punches
             WHERE sync_status = 'SYNCED'
               AND timestamp_utc < ?1
               AND id NOT IN (SELECT MAX(id) FROM punches GROUP BY employee_id)",
            params![ts(&before)],
        )?;
        if removed > 0 {
            log::info!("purged {} synced punches", removed);
        }
        Ok(removed)
    }

    pub fn sync_counts(&self) -> Result<SyncCounts> {
        let (pending, failed, attention, synced): (i64, i64, i64, i64) = self.conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN sync_status = 'PENDING' AND needs_attention = 0 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN sync_status = 'FAILED' AND needs_attention = 0 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(needs_attention), 0),
               COALESCE(SUM(CASE WHEN sync_status = 'SYNCED' THEN 1 ELSE 0 END), 0)
             FROM punches",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(SyncCounts {
            pending: pending as u64,
            failed: failed as u64,
            needs_attention: attention as u64,
            synced: synced as u64,
        })
    }

    pub fn last_sync_error(&self) -> Result<Option<String>> {
        let error = self
            .conn
            .query_row(
                "SELECT last_sync_error FROM punches
                 WHERE last_sync_error IS NOT NULL AND sync_status != 'SYNCED'
                 ORDER BY last_sync_attempt_time DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(error)
    }

    // ---- Calibration ----

    pub fn calibration(&self) -> Result<Option<CalibrationRoi>> {
        let row: Option<(i64, i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT x, y, width, height FROM calibration WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(x, y, w, h)| {
            CalibrationRoi::new(
                u32_column(x, "calibration.x")?,
                u32_column(y, "calibration.y")?,
                u32_column(w, "calibration.width")?,
                u32_column(h, "calibration.height")?,
            )
        })
        .transpose()
    }

    pub fn set_calibration(&mut self, roi: &CalibrationRoi, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO calibration (id, x, y, width, height, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               x = excluded.x, y = excluded.y, width = excluded.width,
               height = excluded.height, updated_at = excluded.updated_at",
            params![roi.x, roi.y, roi.width, roi.height, ts(&now)],
        )?;
        Ok(())
    }
}

/// The write transaction a punch decision runs in. Dropping it without
/// calling `record` rolls back.
pub struct PunchTx<'a> {
    tx: Transaction<'a>,
}

impl PunchTx<'_> {
    /// Employee state as seen inside the transaction.
    pub fn employee(&self, id: i64) -> Result<Option<Employee>> {
        load_employee(&self.tx, id)
    }

    /// Insert the punch, move the employee's state to match it, and commit.
    pub fn record(self, punch: &Punch) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO punches
               (punch_uid, employee_id, device_id, timestamp_utc, timestamp_local,
                punch_type, match_score, sync_status, sync_attempts, needs_attention)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', 0, 0)",
            params![
                punch.punch_uid,
                punch.employee_id,
                punch.device_id,
                ts(&punch.timestamp_utc),
                punch.timestamp_local.to_rfc3339_opts(SecondsFormat::Micros, false),
                punch.punch_type.as_str(),
                punch.match_score,
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        let updated = self.tx.execute(
            "UPDATE employees SET last_punch_direction = ?2, last_punch_time = ?3 WHERE id = ?1",
            params![
                punch.employee_id,
                PunchDirection::from(punch.punch_type).as_str(),
                ts(&punch.timestamp_utc)
            ],
        )?;
        if updated != 1 {
            return Err(anyhow!("employee {} not found", punch.employee_id));
        }
        self.tx.commit()?;
        Ok(id)
    }
}

// ---- Row mapping ----

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_utc(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("corrupt {}: {}", column, e))
}

fn parse_local(value: &str, column: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).map_err(|e| anyhow!("corrupt {}: {}", column, e))
}

fn u32_column(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("corrupt {}: {} out of range", column, value))
}

struct EmployeeRow {
    id: i64,
    employee_code: String,
    name: String,
    active: bool,
    direction: String,
    last_punch_time: Option<String>,
    created_at: String,
}

impl EmployeeRow {
    fn into_employee(self) -> Result<Employee> {
        Ok(Employee {
            id: self.id,
            employee_code: self.employee_code,
            name: self.name,
            active: self.active,
            last_punch_direction: PunchDirection::parse(&self.direction)?,
            last_punch_time: self
                .last_punch_time
                .as_deref()
                .map(|t| parse_utc(t, "employees.last_punch_time"))
                .transpose()?,
            created_at: parse_utc(&self.created_at, "employees.created_at")?,
        })
    }
}

fn read_employee_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmployeeRow> {
    Ok(EmployeeRow {
        id: row.get(0)?,
        employee_code: row.get(1)?,
        name: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        direction: row.get(4)?,
        last_punch_time: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Replace an employee's template set inside the caller's transaction.
/// Returns how many templates were removed.
fn write_templates(
    tx: &Transaction<'_>,
    employee_id: i64,
    templates: &[ProbeTemplate],
    now: &DateTime<Utc>,
) -> Result<usize> {
    let removed = tx.execute(
        "DELETE FROM fingerprint_templates WHERE employee_id = ?1",
        params![employee_id],
    )?;
    let created_at = ts(now);
    for (index, template) in templates.iter().enumerate() {
        let digest = Sha256::digest(&template.payload);
        tx.execute(
            "INSERT INTO fingerprint_templates
               (employee_id, capture_index, payload, payload_sha256, quality_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                employee_id,
                index as i64,
                template.payload,
                digest.as_slice(),
                template.quality_score,
                created_at
            ],
        )?;
    }
    Ok(removed)
}

fn load_employee(conn: &Connection, id: i64) -> Result<Option<Employee>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM employees WHERE id = ?1", EMPLOYEE_COLUMNS),
            params![id],
            read_employee_row,
        )
        .optional()?;
    raw.map(EmployeeRow::into_employee).transpose()
}

fn load_employee_by_code(conn: &Connection, code: &str) -> Result<Option<Employee>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM employees WHERE employee_code = ?1",
                EMPLOYEE_COLUMNS
            ),
            params![code],
            read_employee_row,
        )
        .optional()?;
    raw.map(EmployeeRow::into_employee).transpose()
}

struct TemplateRow {
    id: i64,
    employee_id: i64,
    payload: Vec<u8>,
    digest: Vec<u8>,
    quality_score: i32,
    capture_index: i64,
}

impl TemplateRow {
    /// The template, if its payload still matches the stored digest.
    fn verified(self) -> Option<FingerprintTemplate> {
        if Sha256::digest(&self.payload).as_slice() != self.digest.as_slice() {
            log::warn!(
                "template {} of employee {} failed integrity check; ignored",
                self.id,
                self.employee_id
            );
            return None;
        }
        Some(FingerprintTemplate {
            id: self.id,
            employee_id: self.employee_id,
            payload: self.payload,
            quality_score: self.quality_score,
            capture_index: self.capture_index as u32,
        })
    }
}

fn read_template_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemplateRow> {
    Ok(TemplateRow {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        payload: row.get(2)?,
        digest: row.get(3)?,
        quality_score: row.get(4)?,
        capture_index: row.get(5)?,
    })
}

struct PunchRow {
    id: i64,
    punch_uid: String,
    employee_id: i64,
    employee_code: String,
    device_id: String,
    timestamp_utc: String,
    timestamp_local: String,
    punch_type: String,
    match_score: i32,
    sync_status: String,
    sync_attempts: i64,
    last_sync_attempt_time: Option<String>,
    last_sync_error: Option<String>,
    needs_attention: bool,
}

impl PunchRow {
    fn into_punch(self) -> Result<Punch> {
        Ok(Punch {
            id: self.id,
            punch_uid: self.punch_uid,
            employee_id: self.employee_id,
            employee_code: self.employee_code,
            device_id: self.device_id,
            timestamp_utc: parse_utc(&self.timestamp_utc, "punches.timestamp_utc")?,
            timestamp_local: parse_local(&self.timestamp_local, "punches.timestamp_local")?,
            punch_type: PunchType::parse(&self.punch_type)?,
            match_score: self.match_score,
            sync_status: SyncStatus::parse(&self.sync_status)?,
            sync_attempts: self.sync_attempts.max(0) as u32,
            last_sync_attempt_time: self
                .last_sync_attempt_time
                .as_deref()
                .map(|t| parse_utc(t, "punches.last_sync_attempt_time"))
                .transpose()?,
            last_sync_error: self.last_sync_error,
            needs_attention: self.needs_attention,
        })
    }
}

fn read_punch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PunchRow> {
    Ok(PunchRow {
        id: row.get(0)?,
        punch_uid: row.get(1)?,
        employee_id: row.get(2)?,
        employee_code: row.get(3)?,
        device_id: row.get(4)?,
        timestamp_utc: row.get(5)?,
        timestamp_local: row.get(6)?,
        punch_type: row.get(7)?,
        match_score: row.get(8)?,
        sync_status: row.get(9)?,
        sync_attempts: row.get(10)?,
        last_sync_attempt_time: row.get(11)?,
        last_sync_error: row.get(12)?,
        needs_attention: row.get::<_, i64>(13)? != 0,
    })
}
