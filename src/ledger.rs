//! Durable shipment ledger backed by SQLite.
//!
//! The ledger is the only record of what has already been notified, so every
//! write is committed with `synchronous=FULL` on a WAL journal before the call
//! returns.

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use tracing::{debug, info, warn};

use crate::models::{CourierKind, Shipment};

/// Errors raised by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row for waybill {waybill}: {reason}")]
    CorruptRow { waybill: String, reason: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// What `upsert` did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The shipment was delivered and is tracked again from scratch.
    Reactivated,
    RecipientUpdated,
}

/// Columns added after the first schema version, with their definitions.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("last_fingerprint", "TEXT"),
    ("delivered", "INTEGER NOT NULL DEFAULT 0"),
    ("recipient", "TEXT NOT NULL DEFAULT ''"),
    ("updated_at", "TEXT"),
];

pub struct ShipmentLedger {
    pool: SqlitePool,
}

impl ShipmentLedger {
    /// Opens (creating if needed) the ledger at `database_path` and migrates its schema.
    pub async fn open(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Brings any older store up to the current schema in one transaction.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS shipments (
                waybill TEXT PRIMARY KEY,
                courier TEXT NOT NULL
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info('shipments')")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        let mut added = Vec::new();
        for (column, definition) in ADDITIVE_COLUMNS {
            if existing.iter().any(|name| name == column) {
                continue;
            }
            sqlx::query(&format!("ALTER TABLE shipments ADD COLUMN {column} {definition}"))
                .execute(&mut *tx)
                .await?;
            added.push(*column);
        }

        let carried = carry_legacy_columns(&mut *tx, &existing).await?;
        tx.commit().await?;

        if !added.is_empty() || !carried.is_empty() {
            info!(columns = ?added, carried = ?carried, "ledger schema migrated");
        }

        Ok(())
    }

    /// Inserts a new shipment, or reactivates / re-addresses an existing one.
    ///
    /// Runs in a single transaction so concurrent readers never observe a
    /// half-reactivated row.
    pub async fn upsert(
        &self,
        waybill: &str,
        courier: CourierKind,
        recipient: &str,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT delivered FROM shipments WHERE waybill = ?")
            .bind(waybill)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match current {
            None => {
                sqlx::query(
                    r"
                    INSERT INTO shipments (waybill, courier, last_fingerprint, delivered, recipient, updated_at)
                    VALUES (?, ?, NULL, 0, ?, ?)
                    ",
                )
                .bind(waybill)
                .bind(courier.as_str())
                .bind(recipient)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(row) if row.get::<bool, _>("delivered") => {
                sqlx::query(
                    r"
                    UPDATE shipments
                    SET courier = ?, last_fingerprint = NULL, delivered = 0, recipient = ?, updated_at = ?
                    WHERE waybill = ?
                    ",
                )
                .bind(courier.as_str())
                .bind(recipient)
                .bind(&now)
                .bind(waybill)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Reactivated
            }
            Some(_) => {
                sqlx::query("UPDATE shipments SET recipient = ?, updated_at = ? WHERE waybill = ?")
                    .bind(recipient)
                    .bind(&now)
                    .bind(waybill)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::RecipientUpdated
            }
        };

        tx.commit().await?;
        debug!(waybill, courier = %courier, ?outcome, "ledger upsert");
        Ok(outcome)
    }

    /// All shipments still being polled, oldest write first.
    pub async fn list_active(&self) -> Result<Vec<Shipment>> {
        let rows = sqlx::query(
            r"
            SELECT waybill, courier, last_fingerprint, delivered, recipient, updated_at
            FROM shipments
            WHERE delivered = 0
            ORDER BY updated_at ASC, waybill ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(shipment_from_row).collect()
    }

    /// Looks up a single shipment.
    pub async fn get(&self, waybill: &str) -> Result<Option<Shipment>> {
        let row = sqlx::query(
            r"
            SELECT waybill, courier, last_fingerprint, delivered, recipient, updated_at
            FROM shipments
            WHERE waybill = ?
            ",
        )
        .bind(waybill)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(shipment_from_row).transpose()
    }

    /// Stores the newly observed fingerprint and delivered flag.
    ///
    /// Returns `false` (and logs) when the waybill is unknown.
    pub async fn record_transition(
        &self,
        waybill: &str,
        fingerprint: &str,
        delivered: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE shipments
            SET last_fingerprint = ?, delivered = ?, updated_at = ?
            WHERE waybill = ?
            ",
        )
        .bind(fingerprint)
        .bind(delivered)
        .bind(Utc::now().to_rfc3339())
        .bind(waybill)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(waybill, "transition for unknown waybill ignored");
            return Ok(false);
        }

        Ok(true)
    }

    /// Closes the underlying pool; later operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Legacy column, its replacement, and the merge written into the replacement.
const LEGACY_CARRIES: &[(&str, &str, &str)] = &[
    ("last_event_hash", "last_fingerprint", "COALESCE(last_fingerprint, last_event_hash)"),
    ("is_delivered", "delivered", "CASE WHEN is_delivered THEN 1 ELSE delivered END"),
    ("last_updated", "updated_at", "COALESCE(updated_at, last_updated)"),
];

/// Merges values still held under legacy column names into their
/// replacements, then renames the legacy column so it is carried only once.
///
/// Presence of the legacy name is the only signal used, so a store whose
/// earlier migration stopped after adding the new columns is still carried.
async fn carry_legacy_columns(
    conn: &mut SqliteConnection,
    existing: &[String],
) -> Result<Vec<&'static str>> {
    let mut carried = Vec::new();

    for (legacy, target, merge) in LEGACY_CARRIES {
        if !existing.iter().any(|c| c == legacy) {
            continue;
        }
        sqlx::query(&format!("UPDATE shipments SET {target} = {merge}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("ALTER TABLE shipments RENAME COLUMN {legacy} TO legacy_{legacy}"))
            .execute(&mut *conn)
            .await?;
        carried.push(*legacy);
    }

    Ok(carried)
}

fn shipment_from_row(row: &SqliteRow) -> Result<Shipment> {
    let waybill: String = row.get("waybill");

    let courier_raw: String = row.get("courier");
    let courier = courier_raw
        .parse::<CourierKind>()
        .map_err(|e| LedgerError::CorruptRow {
            waybill: waybill.clone(),
            reason: e.to_string(),
        })?;

    let updated_at = row
        .get::<Option<String>, _>("updated_at")
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_default();

    Ok(Shipment {
        courier,
        last_fingerprint: row.get("last_fingerprint"),
        delivered: row.get("delivered"),
        recipient: row.get("recipient"),
        updated_at,
        waybill,
    })
}

/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` format used by older stores.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAYBILL: &str = "12345678901";

    #[tokio::test]
    async fn upsert_inserts_active_shipment() {
        let ledger = ShipmentLedger::in_memory().await.unwrap();

        let outcome = ledger
            .upsert(WAYBILL, CourierKind::Bluedart, "owner@example.com")
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let active = ledger.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].waybill, WAYBILL);
        assert_eq!(active[0].courier, CourierKind::Bluedart);
        assert_eq!(active[0].last_fingerprint, None);
        assert!(!active[0].delivered);
        assert_eq!(active[0].recipient, "owner@example.com");
    }

    #[tokio::test]
    async fn upsert_on_active_only_updates_recipient() {
        let ledger = ShipmentLedger::in_memory().await.unwrap();
        ledger.upsert(WAYBILL, CourierKind::Bluedart, "a@example.com").await.unwrap();
        ledger.record_transition(WAYBILL, "abc", false).await.unwrap();

        let outcome = ledger
            .upsert(WAYBILL, CourierKind::Bluedart, "b@example.com")
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::RecipientUpdated);

        let shipment = ledger.get(WAYBILL).await.unwrap().unwrap();
        assert_eq!(shipment.recipient, "b@example.com");
        assert_eq!(shipment.last_fingerprint.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn upsert_reactivates_delivered_shipment() {
        let ledger = ShipmentLedger::in_memory().await.unwrap();
        ledger.upsert(WAYBILL, CourierKind::Bluedart, "a@example.com").await.unwrap();
        ledger.record_transition(WAYBILL, "final", true).await.unwrap();
        assert!(ledger.list_active().await.unwrap().is_empty());

        let outcome = ledger
            .upsert(WAYBILL, CourierKind::Bluedart, "b@example.com")
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Reactivated);

        let shipment = ledger.get(WAYBILL).await.unwrap().unwrap();
        assert!(!shipment.delivered);
        assert_eq!(shipment.last_fingerprint, None);
        assert_eq!(shipment.recipient, "b@example.com");
        assert_eq!(ledger.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_transition_on_unknown_waybill_is_noop() {
        let ledger = ShipmentLedger::in_memory().await.unwrap();
        let applied = ledger.record_transition("99999999999", "abc", false).await.unwrap();
        assert!(!applied);
        assert!(ledger.get("99999999999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivered_rows_are_kept_but_not_listed() {
        let ledger = ShipmentLedger::in_memory().await.unwrap();
        ledger.upsert(WAYBILL, CourierKind::Bluedart, "a@example.com").await.unwrap();
        ledger.upsert("1234567890123", CourierKind::Delhivery, "a@example.com").await.unwrap();
        ledger.record_transition(WAYBILL, "done", true).await.unwrap();

        let active = ledger.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].waybill, "1234567890123");

        let delivered = ledger.get(WAYBILL).await.unwrap().unwrap();
        assert!(delivered.delivered);
        assert_eq!(delivered.last_fingerprint.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn legacy_store_is_migrated_without_data_loss() {
        let path = std::env::temp_dir().join(format!(
            "waybill-ledger-legacy-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();

        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::query(
                r"
                CREATE TABLE shipments (
                    waybill TEXT PRIMARY KEY,
                    courier TEXT,
                    last_event_hash TEXT,
                    is_delivered INTEGER NOT NULL DEFAULT 0,
                    last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
                ",
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO shipments (waybill, courier, last_event_hash, is_delivered, last_updated) VALUES (?, 'BLUEDART', 'oldhash', 0, '2024-05-01 10:00:00')",
            )
            .bind(WAYBILL)
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let ledger = ShipmentLedger::open(&path_str).await.unwrap();
        let shipment = ledger.get(WAYBILL).await.unwrap().unwrap();
        assert_eq!(shipment.last_fingerprint.as_deref(), Some("oldhash"));
        assert!(!shipment.delivered);
        assert_eq!(shipment.recipient, "");
        assert_eq!(shipment.updated_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        ledger.close().await;

        // Reopening a migrated store is a no-op.
        let reopened = ShipmentLedger::open(&path_str).await.unwrap();
        assert_eq!(reopened.list_active().await.unwrap().len(), 1);
        reopened.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }

    #[tokio::test]
    async fn half_migrated_legacy_store_is_still_carried() {
        let path = std::env::temp_dir().join(format!(
            "waybill-ledger-partial-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();

        // Legacy store where a previous migration added one column and stopped.
        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            for statement in [
                "CREATE TABLE shipments (waybill TEXT PRIMARY KEY, courier TEXT, last_event_hash TEXT, is_delivered INTEGER NOT NULL DEFAULT 0, last_updated TIMESTAMP)",
                "INSERT INTO shipments (waybill, courier, last_event_hash, is_delivered, last_updated) VALUES ('12345678901', 'BLUEDART', 'oldhash', 1, '2024-05-01 10:00:00')",
                "ALTER TABLE shipments ADD COLUMN last_fingerprint TEXT",
            ] {
                sqlx::query(statement).execute(&pool).await.unwrap();
            }
            pool.close().await;
        }

        let ledger = ShipmentLedger::open(&path_str).await.unwrap();
        let shipment = ledger.get(WAYBILL).await.unwrap().unwrap();
        assert_eq!(shipment.last_fingerprint.as_deref(), Some("oldhash"));
        assert!(shipment.delivered);
        assert!(ledger.list_active().await.unwrap().is_empty());

        // A reactivation after migration must not be undone by the next open.
        ledger.upsert(WAYBILL, CourierKind::Bluedart, "a@example.com").await.unwrap();
        ledger.close().await;

        let reopened = ShipmentLedger::open(&path_str).await.unwrap();
        let shipment = reopened.get(WAYBILL).await.unwrap().unwrap();
        assert_eq!(shipment.last_fingerprint, None);
        assert!(!shipment.delivered);
        reopened.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let path = std::env::temp_dir().join(format!(
            "waybill-ledger-durable-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();

        let ledger = ShipmentLedger::open(&path_str).await.unwrap();
        ledger.upsert(WAYBILL, CourierKind::Bluedart, "a@example.com").await.unwrap();
        ledger.record_transition(WAYBILL, "fp", false).await.unwrap();
        ledger.close().await;

        let reopened = ShipmentLedger::open(&path_str).await.unwrap();
        let shipment = reopened.get(WAYBILL).await.unwrap().unwrap();
        assert_eq!(shipment.last_fingerprint.as_deref(), Some("fp"));
        reopened.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }
}
