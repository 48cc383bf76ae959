//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch with a version number. Applied
//! versions are recorded in `_migrations`, so opening an existing database
//! only runs what is new.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end; never edit an applied one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "lesson memory",
        sql: r#"
            CREATE TABLE lessons (
                id            TEXT PRIMARY KEY,
                text          TEXT NOT NULL,
                embedding     BLOB NOT NULL,
                task_type     TEXT NOT NULL,
                criteria_hash TEXT NOT NULL,
                topic         TEXT NOT NULL DEFAULT '',
                score         REAL NOT NULL DEFAULT 0.0,
                iteration     INTEGER NOT NULL DEFAULT 0,
                utility_score REAL NOT NULL DEFAULT 1.0,
                consolidated  BOOLEAN NOT NULL DEFAULT 0,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );
            CREATE INDEX idx_lessons_scope ON lessons(task_type, criteria_hash);
        "#,
    },
    Migration {
        version: 2,
        description: "refinement run checkpoints",
        sql: r#"
            CREATE TABLE checkpoints (
                run_id     TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                phase      TEXT NOT NULL,
                next_phase TEXT,
                paused     BOOLEAN NOT NULL DEFAULT 0,
                state      TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, seq)
            );
            CREATE INDEX idx_checkpoints_created ON checkpoints(created_at);
        "#,
    },
];

/// Apply all pending migrations.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    // Only `&Connection` is available here, so the transaction is manual.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail(format!("SQL execution failed: {e}")))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail(format!("failed to record migration: {e}")))
        });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| fail(format!("failed to commit: {e}")))?;
            Ok(())
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
