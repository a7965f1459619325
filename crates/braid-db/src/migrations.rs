//! Embedded SQL migration runner.
//!
//! Migrations are SQL files compiled into the binary. Each runs once, inside
//! its own transaction together with the row recording it in
//! `_braid_migrations`.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Schema history, oldest first. Append only.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_events",
        sql: include_str!("migrations/000_events.sql"),
    },
    Migration {
        name: "001_rooms",
        sql: include_str!("migrations/001_rooms.sql"),
    },
    Migration {
        name: "002_room_state",
        sql: include_str!("migrations/002_room_state.sql"),
    },
    Migration {
        name: "003_room_head",
        sql: include_str!("migrations/003_room_head.sql"),
    },
    Migration {
        name: "004_room_joined",
        sql: include_str!("migrations/004_room_joined.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A statement within a migration failed; nothing from it was kept.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The tracking table could not be created or read.
    #[error("failed to read migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every migration not yet recorded and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` on the first migration that fails; earlier ones
/// in the same call stay applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _braid_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(MigrationError::StateQuery)?;

    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let mut applied = 0;

    for migration in migrations {
        if done.contains(migration.name) {
            tracing::debug!(migration = migration.name, "migration already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");
        apply_one(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
        applied += 1;
    }

    Ok(applied)
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _braid_migrations")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn apply_one(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _braid_migrations (name) VALUES (?1)",
        [migration.name],
    )?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        for table in [
            "events",
            "rooms",
            "room_state",
            "room_state_space",
            "room_head",
            "room_joined",
        ] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn second_run_is_a_no_op() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("first run should succeed");
        assert_eq!(run_migrations(&conn).expect("second run should succeed"), 0);
    }

    #[test]
    fn failed_migration_leaves_no_schema_behind() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let broken = [Migration {
            name: "900_broken",
            sql: "CREATE TABLE half_done (id INTEGER); INSERT INTO missing VALUES (1);",
        }];

        let err = apply(&conn, &broken).expect_err("broken migration should fail");
        assert!(matches!(err, MigrationError::ExecutionFailed { ref name, .. } if name == "900_broken"));
        assert!(!table_exists(&conn, "half_done"));

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM _braid_migrations", [], |row| row.get(0))
            .expect("should count migrations");
        assert_eq!(recorded, 0);
    }
}
