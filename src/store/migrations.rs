//! Schema migrations. Versions are recorded in `_migrations`; only versions
//! above the highest recorded one are applied, in order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "onboarding_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS forms (
                id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                doc TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS onboarding_progress (
                uid TEXT NOT NULL,
                form_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'in_progress',
                completed_at TEXT,
                persona_snapshot TEXT,
                profile_snapshot TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (uid, form_id)
            );

            CREATE TABLE IF NOT EXISTS onboarding_steps (
                uid TEXT NOT NULL,
                form_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                answers TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                PRIMARY KEY (uid, form_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS configs (
                key TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "chat_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                participant_keys TEXT NOT NULL,
                participants TEXT NOT NULL,
                persona_snapshot TEXT,
                profile_snapshot TEXT,
                is_pinned_for TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_kind ON chats(kind);
            CREATE INDEX IF NOT EXISTS idx_chats_last_message ON chats(last_message_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent',
                created_at INTEGER NOT NULL,
                idempotency_key TEXT,
                UNIQUE (chat_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_created ON messages(chat_id, created_at);
        "#,
    },
];

fn migration_err(context: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version. Already applied versions are
/// skipped, so this is safe to call on every startup.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(migration_err("create _migrations"))?;

    let applied = applied_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    let mut latest = applied;
    for migration in pending {
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!("V{} {} failed: {e}", migration.version, migration.name))
        })?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(migration_err("record migration"))?;
        latest = migration.version;
    }

    tracing::debug!(from = applied, to = latest, "Schema up to date");
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(migration_err("read schema version"))?;
    let Some(row) = rows.next().await.map_err(migration_err("read schema version"))? else {
        return Ok(0);
    };
    row.get::<i64>(0).map_err(migration_err("parse schema version"))
}
