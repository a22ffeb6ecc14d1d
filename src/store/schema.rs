//! Issuance table schema and migrations
//!
//! Version 1 is the layout of the first deployments: a `Users` table with no
//! uniqueness on `UserId` and no timestamp. Version 2 adds the unique index
//! that the conditional insert relies on, plus `IssuedAt`.

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

const USERS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Users (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    UserId INTEGER NOT NULL,
    UniqueKey TEXT NOT NULL,
    IssuedAt INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_user_id ON Users(UserId);
";

/// Create or upgrade the schema. Running it again on an up-to-date database
/// changes nothing.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let tx = conn.unchecked_transaction()?;

    let current_version = get_schema_version(&tx)?;

    if current_version == 0 && !users_table_exists(&tx)? {
        info!("Creating issuance schema v{}", SCHEMA_VERSION);
        tx.execute_batch(USERS_SCHEMA)
            .map_err(|e| StoreError::unavailable(format!("Failed to create Users table: {}", e)))?;
        set_schema_version(&tx, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        // A Users table without a version row was written by a v1 deployment
        let from = current_version.max(1);
        info!("Migrating issuance schema from v{} to v{}", from, SCHEMA_VERSION);
        migrate_schema(&tx, from)?;
    } else {
        info!("Issuance schema is up to date (v{})", current_version);
    }

    tx.commit()?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::unavailable(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn users_table_exists(conn: &Connection) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'Users')",
        [],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name?.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 2 {
        let duplicate: Option<i64> = conn
            .query_row(
                "SELECT UserId FROM Users GROUP BY UserId HAVING COUNT(*) > 1 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(user_id) = duplicate {
            warn!(user_id, "Legacy Users table holds more than one key for a user");
            return Err(StoreError::unavailable(format!(
                "cannot add unique index: user {} has more than one issued key",
                user_id
            )));
        }

        if !has_column(conn, "Users", "IssuedAt")? {
            conn.execute("ALTER TABLE Users ADD COLUMN IssuedAt INTEGER", [])?;
        }
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_user_id ON Users(UserId)",
            [],
        )?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS Users (
            Id INTEGER PRIMARY KEY,
            UserId INTEGER NOT NULL,
            UniqueKey TEXT NOT NULL
        )";

    #[test]
    fn test_fresh_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(has_column(&conn, "Users", "IssuedAt").unwrap());
    }

    #[test]
    fn test_legacy_table_is_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO Users (UserId, UniqueKey) VALUES (5, 'legacy-key')",
            [],
        )
        .unwrap();

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(has_column(&conn, "Users", "IssuedAt").unwrap());

        let key: String = conn
            .query_row("SELECT UniqueKey FROM Users WHERE UserId = 5", [], |r| r.get(0))
            .unwrap();
        assert_eq!(key, "legacy-key");

        let dup = conn.execute(
            "INSERT INTO Users (UserId, UniqueKey) VALUES (5, 'second')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_legacy_duplicates_block_migration() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_SCHEMA).unwrap();
        conn.execute_batch(
            "INSERT INTO Users (UserId, UniqueKey) VALUES (8, 'a');
             INSERT INTO Users (UserId, UniqueKey) VALUES (8, 'b');",
        )
        .unwrap();

        let err = init_schema(&conn).unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
        assert!(err.to_string().contains("user 8"));
    }
}
