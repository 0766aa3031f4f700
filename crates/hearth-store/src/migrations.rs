use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use rusqlite::TransactionBehavior;
use tracing::info;

use crate::database::Database;

/// A single identified, idempotent schema change.
pub struct ChangeSet {
    pub id: &'static str,
    pub sql: &'static str,
}

/// The released migration log. Append-only: change-sets are never reordered
/// or edited once released; additions go at the end.
pub const CHANGE_SETS: &[ChangeSet] = &[
    ChangeSet {
        id: "001_create_devices",
        sql: r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    brand TEXT NOT NULL,
    location TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#,
    },
    ChangeSet {
        id: "002_create_device_events",
        sql: r#"
CREATE TABLE IF NOT EXISTS device_events (
    device_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (device_id, sequence)
);
"#,
    },
    ChangeSet {
        id: "003_index_events_occurred_at",
        sql: "CREATE INDEX IF NOT EXISTS idx_device_events_occurred ON device_events(device_id, occurred_at);",
    },
];

/// A schema change-set failed. Fatal: the process must not serve traffic
/// against a store it could not fully migrate.
#[derive(Debug, thiserror::Error)]
#[error("migration {change_set_id} failed: {cause}")]
pub struct MigrationError {
    pub change_set_id: String,
    pub cause: String,
}

impl MigrationError {
    fn new(change_set_id: &str, cause: impl std::fmt::Display) -> Self {
        Self {
            change_set_id: change_set_id.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Apply the released change-set log to the database. Returns the number of
/// change-sets applied. Re-running against a fully migrated store is a
/// no-op and returns 0.
pub fn apply_migrations(db: &Database) -> Result<usize, MigrationError> {
    apply_change_sets(db, CHANGE_SETS)
}

/// Apply an ordered change-set sequence, skipping those already recorded.
///
/// Each change-set runs inside one immediate transaction together with its
/// `schema_migrations` record, so a crash mid-run leaves a cleanly applied
/// prefix and the immediate lock keeps concurrent migrator processes out.
pub fn apply_change_sets(db: &Database, change_sets: &[ChangeSet]) -> Result<usize, MigrationError> {
    db.with_conn_mut(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .map_err(|e| MigrationError::new("schema_migrations", e))?;

        let applied: HashSet<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM schema_migrations")
                .map_err(|e| MigrationError::new("schema_migrations", e))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| MigrationError::new("schema_migrations", e))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| MigrationError::new("schema_migrations", e))?
        };

        let mut count = 0;
        for change_set in change_sets {
            if applied.contains(change_set.id) {
                continue;
            }

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| MigrationError::new(change_set.id, e))?;
            tx.execute_batch(change_set.sql)
                .map_err(|e| MigrationError::new(change_set.id, e))?;
            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                rusqlite::params![
                    change_set.id,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
                ],
            )
            .map_err(|e| MigrationError::new(change_set.id, e))?;
            tx.commit().map_err(|e| MigrationError::new(change_set.id, e))?;

            info!(change_set = change_set.id, "applied schema change-set");
            count += 1;
        }

        Ok(count)
    })
}

/// Applied change-set records, in application order.
pub fn applied_migrations(db: &Database) -> Result<Vec<(String, String)>, crate::StoreError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, applied_at FROM schema_migrations ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn table_exists(db: &Database, name: &str) -> bool {
        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)?;
            Ok::<_, StoreError>(count == 1)
        })
        .unwrap()
    }

    #[test]
    fn applies_all_change_sets() {
        let db = Database::in_memory().unwrap();
        let applied = apply_migrations(&db).unwrap();
        assert_eq!(applied, CHANGE_SETS.len());
        assert!(table_exists(&db, "devices"));
        assert!(table_exists(&db, "device_events"));
        assert!(table_exists(&db, "schema_migrations"));
    }

    #[test]
    fn rerun_is_noop_with_identical_records() {
        let db = Database::in_memory().unwrap();
        apply_migrations(&db).unwrap();
        let first = applied_migrations(&db).unwrap();

        let applied_again = apply_migrations(&db).unwrap();
        assert_eq!(applied_again, 0);

        let second = applied_migrations(&db).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn records_kept_in_release_order() {
        let db = Database::in_memory().unwrap();
        apply_migrations(&db).unwrap();
        let ids: Vec<String> = applied_migrations(&db)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let expected: Vec<String> = CHANGE_SETS.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn skips_change_sets_already_recorded() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE schema_migrations (id TEXT PRIMARY KEY, applied_at TEXT NOT NULL);",
            )
            .map_err(StoreError::from)?;
            conn.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                rusqlite::params!["001_create_devices", "2026-01-01T00:00:00Z"],
            )
            .map_err(StoreError::from)?;
            Ok::<_, StoreError>(())
        })
        .unwrap();

        let applied = apply_migrations(&db).unwrap();
        assert_eq!(applied, CHANGE_SETS.len() - 1);
        // The migrator trusts the record and did not re-run 001
        assert!(!table_exists(&db, "devices"));
        assert!(table_exists(&db, "device_events"));
    }

    #[test]
    fn failing_change_set_reports_id_and_keeps_prefix() {
        let db = Database::in_memory().unwrap();
        let sets = [
            ChangeSet {
                id: "100_good",
                sql: "CREATE TABLE good (id TEXT PRIMARY KEY);",
            },
            ChangeSet {
                id: "101_bad",
                sql: "CREATE SYNTAX ERROR;",
            },
            ChangeSet {
                id: "102_never_reached",
                sql: "CREATE TABLE unreached (id TEXT PRIMARY KEY);",
            },
        ];

        let err = apply_change_sets(&db, &sets).unwrap_err();
        assert_eq!(err.change_set_id, "101_bad");

        // Prefix applied and recorded; failed change-set left no record
        assert!(table_exists(&db, "good"));
        assert!(!table_exists(&db, "unreached"));
        let ids: Vec<String> = applied_migrations(&db)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["100_good".to_string()]);
    }

    #[test]
    fn resumes_after_partial_run() {
        let db = Database::in_memory().unwrap();
        let first = [ChangeSet {
            id: CHANGE_SETS[0].id,
            sql: CHANGE_SETS[0].sql,
        }];
        apply_change_sets(&db, &first).unwrap();

        // A later run with the full log applies only the remainder
        let applied = apply_migrations(&db).unwrap();
        assert_eq!(applied, CHANGE_SETS.len() - 1);
        assert!(table_exists(&db, "device_events"));
    }
}
