use std::path::Path;

use rusqlite::Connection;

use super::QueueError;

/// Open a SQLite connection at `path`, tuning journal mode for the given
/// resource tier and running any pending migrations.
///
/// `normal`/`full` tiers get WAL for concurrent reader access from the
/// control API; `lite` tier keeps DELETE mode since WAL's extra fsync
/// pressure isn't worth it on the smallest boxes this agent targets.
pub fn open_database(path: &Path, wal: bool) -> Result<Connection, QueueError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn, wal)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory_database() -> Result<Connection, QueueError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn, false)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection, wal: bool) -> Result<(), QueueError> {
    let journal_mode = if wal { "WAL" } else { "DELETE" };
    conn.execute_batch(&format!(
        "PRAGMA journal_mode={journal_mode};
         PRAGMA foreign_keys=ON;
         PRAGMA synchronous=NORMAL;"
    ))?;
    Ok(())
}

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_initial.sql")),
        (
            2,
            include_str!("../../resources/migrations/002_external_user_mappings.sql"),
        ),
        (3, include_str!("../../resources/migrations/003_parking.sql")),
        (
            4,
            include_str!("../../resources/migrations/004_device_config.sql"),
        ),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!(version, "running queue database migration");
            conn.execute_batch(sql)
                .map_err(|e| QueueError::MigrationFailed {
                    version,
                    reason: e.to_string(),
                })?;
        }
    }

    Ok(())
}

fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

pub fn count_tables(conn: &Connection) -> Result<i64, QueueError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_initializes_all_tables() {
        let conn = open_memory_database().unwrap();
        let count = count_tables(&conn).unwrap();
        assert_eq!(count, 5, "expected 5 tables, got {count}");
    }

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 4);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        assert!(run_migrations(&conn).is_ok());
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = open_memory_database().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn opens_from_disk_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let conn1 = open_database(&path, false).unwrap();
        assert_eq!(count_tables(&conn1).unwrap(), 5);
        drop(conn1);

        let conn2 = open_database(&path, false).unwrap();
        assert_eq!(count_tables(&conn2).unwrap(), 5);
    }
}
