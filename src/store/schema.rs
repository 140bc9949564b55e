// SQLite schema and migrations

use rusqlite::types::Type;
use rusqlite::{params, Connection, Result};

pub const SCHEMA_VERSION: i32 = 2;

/// One migration step, applied in its own transaction.
type Migration = fn(&Connection) -> Result<()>;

const MIGRATIONS: [(i32, Migration); 2] = [(1, migrate_to_v1), (2, migrate_to_v2)];

pub fn init(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let version = schema_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "Database schema version {} is newer than application version {}",
            version, SCHEMA_VERSION
        )));
    }

    for (target, migrate) in MIGRATIONS {
        if version >= target {
            continue;
        }
        // A step and its version bump land together or not at all.
        let tx = conn.unchecked_transaction()?;
        migrate(&tx)?;
        tx.execute(
            "UPDATE schema_metadata SET value = ?1 WHERE key = 'version'",
            params![target.to_string()],
        )?;
        tx.commit()?;
        tracing::info!(version = target, "Applied schema migration");
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    let version: Result<String> = conn.query_row(
        "SELECT value FROM schema_metadata WHERE key = 'version'",
        [],
        |row| row.get(0),
    );
    match version {
        Ok(v) => match v.trim().parse::<i32>() {
            Ok(n) if n >= 0 => Ok(n),
            Ok(n) => Err(rusqlite::Error::InvalidParameterName(format!(
                "Corrupt schema version {n}"
            ))),
            Err(e) => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                Type::Text,
                Box::new(e),
            )),
        },
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            conn.execute(
                "INSERT INTO schema_metadata (key, value) VALUES ('version', '0')",
                [],
            )?;
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

fn migrate_to_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS research_tasks (
            id TEXT PRIMARY KEY,
            task TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            user_id TEXT,
            job_id TEXT,
            from_cache INTEGER NOT NULL DEFAULT 0,
            progress_role TEXT,
            progress_turn INTEGER,
            progress_max INTEGER
        );

        CREATE TABLE IF NOT EXISTS agent_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            agent TEXT NOT NULL,
            content TEXT NOT NULL,
            "order" INTEGER NOT NULL,
            token_count INTEGER,
            tool_calls TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (task_id, "order"),
            FOREIGN KEY (task_id) REFERENCES research_tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS task_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL UNIQUE,
            duration REAL NOT NULL,
            total_messages INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0.0,
            model TEXT NOT NULL,
            by_role TEXT,
            FOREIGN KEY (task_id) REFERENCES research_tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_status_created ON research_tasks(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_user_created ON research_tasks(user_id, created_at);
        "#,
    )
}

fn migrate_to_v2(conn: &Connection) -> Result<()> {
    // Backing table for the persistent result cache.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn.execute(
            "UPDATE schema_metadata SET value = '99' WHERE key = 'version'",
            [],
        )
        .unwrap();
        assert!(init(&conn).is_err());
    }

    #[test]
    fn test_corrupt_version_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        for bad in ["two", "", "-1"] {
            conn.execute(
                "UPDATE schema_metadata SET value = ?1 WHERE key = 'version'",
                params![bad],
            )
            .unwrap();
            assert!(init(&conn).is_err(), "version {bad:?} accepted");
        }
    }

    #[test]
    fn test_failed_step_rolls_back_with_its_version() {
        let conn = Connection::open_in_memory().unwrap();
        // Takes the name of an index the first step creates last.
        conn.execute("CREATE TABLE idx_user_created (x INTEGER)", [])
            .unwrap();
        assert!(init(&conn).is_err());

        assert_eq!(schema_version(&conn).unwrap(), 0);
        let tasks_table: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'research_tasks'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tasks_table, 0);

        conn.execute("DROP TABLE idx_user_created", []).unwrap();
        init(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_each_step_records_its_version() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        // Back to v1: only the cache table is missing.
        conn.execute_batch(
            "DROP TABLE cache_entries;
             UPDATE schema_metadata SET value = '1' WHERE key = 'version';",
        )
        .unwrap();
        init(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
        conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get::<_, i64>(0))
            .unwrap();
    }
}
