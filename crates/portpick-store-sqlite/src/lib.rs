use std::fmt::Display;
use std::fs;
use std::path::Path;

use portpick_core::{
    normalize_note, BatchId, LedgerError, PortRecord, PortStore, RecordId, MAX_PORT, MIN_PORT,
};
use rusqlite::{params, Connection, DatabaseName, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS used_ports (
  id TEXT PRIMARY KEY,
  port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  batch_id TEXT NOT NULL,
  used_at TEXT NOT NULL,
  note TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_used_ports_port ON used_ports(port);
CREATE INDEX IF NOT EXISTS idx_used_ports_batch_id ON used_ports(batch_id);
CREATE INDEX IF NOT EXISTS idx_used_ports_used_at ON used_ports(used_at);
";

const SELECT_RECORD_COLUMNS: &str = "SELECT id, port, batch_id, used_at, note FROM used_ports";

/// SQLite-backed exclusion store.
///
/// Acquire with [`SqliteStore::open`], then [`SqliteStore::init`] before any
/// record operation. Dropping the handle closes the connection.
pub struct SqliteStore {
    conn: Connection,
    initialized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the database cannot be
    /// opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).with_storage_context(|| {
            format!("failed to open sqlite database at {}", path.display())
        })?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .storage_context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, initialized: false })
    }

    /// Establish the schema. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when migrations fail.
    pub fn init(&mut self) -> Result<(), LedgerError> {
        self.migrate()?;
        self.initialized = true;
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Report current and target schema versions plus pending migrations. Read-only.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping fails or the database was
    /// written by a newer schema.
    pub fn migrate(&mut self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .storage_context("failed to apply schema_migrations table")?;

        let (version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(LedgerError::StorageUnavailable(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        if version == 0 {
            self.apply_migration_1()?;
        } else if inferred_from_legacy {
            // Table predates migration tracking; adopt it as v1.
            record_schema_version(&self.conn, 1)?;
            tracing::info!("adopted untracked used_ports table as schema v1");
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<(), LedgerError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage_context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).storage_context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().storage_context("failed to commit migration v1")?;
        tracing::info!("applied schema migration v1");
        Ok(())
    }

    /// Look up one record by id.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the store is not ready or
    /// the row cannot be decoded.
    pub fn find_record(&self, id: &RecordId) -> Result<Option<PortRecord>, LedgerError> {
        self.ensure_ready()?;
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD_COLUMNS} WHERE id = ?1"))
            .storage_context("failed to prepare record lookup")?;
        let mut rows =
            stmt.query(params![id.as_str()]).storage_context("failed to look up port record")?;
        let record = match rows.next().storage_context("failed to read port record row")? {
            Some(row) => Some(decode_row(row)?),
            None => None,
        };
        Ok(record)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), LedgerError> {
        self.ensure_ready()?;
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_storage_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None).with_storage_context(|| {
            format!("failed to create sqlite backup at {}", out_file.display())
        })
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), LedgerError> {
        if !in_file.exists() {
            return Err(LedgerError::StorageUnavailable(format!(
                "backup file does not exist: {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_storage_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.init()?;
        tracing::info!(path = %in_file.display(), "restored database from backup");
        Ok(())
    }

    /// Run `PRAGMA quick_check` and report schema status without migrating.
    ///
    /// # Errors
    /// Returns an error when any health query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, LedgerError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .storage_context("failed to run PRAGMA quick_check")?;

        let record_count = if table_exists(&self.conn, "used_ports")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM used_ports", [], |row| row.get::<_, i64>(0))
                .storage_context("failed to count port records")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count: usize::try_from(record_count).unwrap_or_default(),
            schema_status: self.schema_status()?,
        })
    }

    fn ensure_ready(&self) -> Result<(), LedgerError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LedgerError::StorageUnavailable(
                "store is not initialized; call init() first".to_string(),
            ))
        }
    }
}

impl PortStore for SqliteStore {
    fn commit(&mut self, record: &PortRecord) -> Result<(), LedgerError> {
        self.ensure_ready()?;
        record.validate()?;

        // IMMEDIATE takes the write lock up front so the insert and the conflict
        // lookup below observe the same state.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage_context("failed to start commit transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO used_ports(id, port, batch_id, used_at, note)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING",
                params![
                    record.id.as_str(),
                    i64::from(record.port),
                    record.batch_id.as_str(),
                    rfc3339(record.used_at)?,
                    normalize_note(record.note.clone()),
                ],
            )
            .storage_context("failed to insert port record")?;

        if inserted == 0 {
            let port_taken = port_exists(&tx, record.port)?;
            drop(tx);
            if port_taken {
                tracing::warn!(port = record.port, id = %record.id, "rejected duplicate port");
                return Err(LedgerError::DuplicatePort(record.port));
            }
            tracing::warn!(id = %record.id, "rejected duplicate record id");
            return Err(LedgerError::DuplicateId(record.id.clone()));
        }

        tx.commit().storage_context("failed to commit port record")?;
        tracing::debug!(port = record.port, id = %record.id, batch_id = %record.batch_id, "committed port");
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<PortRecord>, LedgerError> {
        self.ensure_ready()?;
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD_COLUMNS} ORDER BY used_at ASC, port ASC"))
            .storage_context("failed to prepare record listing")?;
        let mut rows = stmt.query([]).storage_context("failed to list port records")?;
        let mut records = Vec::new();

        while let Some(row) = rows.next().storage_context("failed to read port record row")? {
            records.push(decode_row(row)?);
        }

        Ok(records)
    }

    fn release(&mut self, id: &RecordId) -> Result<(), LedgerError> {
        self.ensure_ready()?;
        let removed = self
            .conn
            .execute("DELETE FROM used_ports WHERE id = ?1", params![id.as_str()])
            .storage_context("failed to delete port record")?;
        if removed == 0 {
            return Err(LedgerError::NotFound(id.clone()));
        }
        tracing::info!(id = %id, "released port record");
        Ok(())
    }

    fn clear_all(&mut self) -> Result<usize, LedgerError> {
        self.ensure_ready()?;
        let removed = self
            .conn
            .execute("DELETE FROM used_ports", [])
            .storage_context("failed to clear port records")?;
        tracing::info!(removed, "cleared all port records");
        Ok(removed)
    }

    fn is_used(&self, port: u16) -> Result<bool, LedgerError> {
        self.ensure_ready()?;
        port_exists(&self.conn, port)
    }

    fn update_note(&mut self, id: &RecordId, note: Option<&str>) -> Result<(), LedgerError> {
        self.ensure_ready()?;
        let updated = self
            .conn
            .execute(
                "UPDATE used_ports SET note = ?2 WHERE id = ?1",
                params![id.as_str(), normalize_note(note.map(str::to_string))],
            )
            .storage_context("failed to update port note")?;
        if updated == 0 {
            return Err(LedgerError::NotFound(id.clone()));
        }
        Ok(())
    }
}

trait StorageContext<T> {
    fn storage_context(self, context: &str) -> Result<T, LedgerError>;

    fn with_storage_context<F>(self, context: F) -> Result<T, LedgerError>
    where
        F: FnOnce() -> String;
}

impl<T, E: Display> StorageContext<T> for Result<T, E> {
    fn storage_context(self, context: &str) -> Result<T, LedgerError> {
        self.map_err(|err| LedgerError::StorageUnavailable(format!("{context}: {err}")))
    }

    fn with_storage_context<F>(self, context: F) -> Result<T, LedgerError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| LedgerError::StorageUnavailable(format!("{}: {err}", context())))
    }
}

fn decode_row(row: &Row<'_>) -> Result<PortRecord, LedgerError> {
    let id: String = row.get(0).storage_context("failed to read id column")?;
    let port: i64 = row.get(1).storage_context("failed to read port column")?;
    let batch_id: String = row.get(2).storage_context("failed to read batch_id column")?;
    let used_at: String = row.get(3).storage_context("failed to read used_at column")?;
    let note: Option<String> = row.get(4).storage_context("failed to read note column")?;

    let port = u16::try_from(port).ok().filter(|port| *port >= MIN_PORT).ok_or_else(|| {
        LedgerError::StorageUnavailable(format!(
            "stored port {port} outside [{MIN_PORT}, {MAX_PORT}] for record {id}"
        ))
    })?;

    Ok(PortRecord {
        id: RecordId::parse(&id).storage_context("corrupt id column")?,
        port,
        batch_id: BatchId::parse(&batch_id)
            .with_storage_context(|| format!("corrupt batch_id column for record {id}"))?,
        used_at: parse_rfc3339(&used_at)?,
        note,
    })
}

fn port_exists(conn: &Connection, port: u16) -> Result<bool, LedgerError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM used_ports WHERE port = ?1)",
            params![i64::from(port)],
            |row| row.get::<_, i64>(0),
        )
        .storage_context("failed to look up port")?;
    Ok(exists == 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, LedgerError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_storage_context(|| format!("failed to check table existence for {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64, LedgerError> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .storage_context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool), LedgerError> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "used_ports")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), LedgerError> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_storage_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .storage_context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_storage_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
