//! Database migrations

use rusqlite::Connection;
use tracing::info;

use crate::error::DatabaseError;

type Result<T> = std::result::Result<T, DatabaseError>;

/// Current schema version
const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations
pub fn run_all(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(DatabaseError::Migration(format!(
            "database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version < SCHEMA_VERSION {
        info!("running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("applying migration v1: settings tables");

    conn.execute_batch(r#"
        -- Single-row camera connection settings (id is always 1)
        CREATE TABLE IF NOT EXISTS camera_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            source_kind TEXT NOT NULL,
            camera_index INTEGER,
            url TEXT,
            username TEXT,
            password TEXT,
            mirror INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Single-row recording settings (id is always 1)
        CREATE TABLE IF NOT EXISTS recording_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            destination TEXT NOT NULL,
            segment_duration_secs INTEGER NOT NULL DEFAULT 3600,
            retention_enabled INTEGER NOT NULL DEFAULT 0,
            retention_age_days INTEGER NOT NULL DEFAULT 7,
            enable_record INTEGER NOT NULL DEFAULT 0,
            fps INTEGER NOT NULL DEFAULT 20,
            fourcc TEXT NOT NULL DEFAULT 'XVID',
            filename_pattern TEXT NOT NULL DEFAULT '%d.%m.%Y_%H.%M.%S',
            container TEXT NOT NULL DEFAULT 'avi',
            updated_at TEXT DEFAULT (datetime('now'))
        );
    "#)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OpenFlags;

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(run_all(&conn), Err(DatabaseError::Migration(_))));
    }

    #[test]
    fn test_sqlite_failure_surfaces_as_sqlite_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE placeholder (x INTEGER);")
            .unwrap();

        let read_only = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
        assert!(matches!(run_all(&read_only), Err(DatabaseError::Sqlite(_))));
    }
}
