//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Schemaless documents (user
//! documents, snapshots, configs, form definitions) live in JSON text
//! columns; sessions and messages are relational rows.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chat::model::{
    Appended, Message, MessageStatus, NewMessage, Role, Session, SessionKind,
};
use crate::document::deep_merge;
use crate::error::DatabaseError;
use crate::forms::FormDefinition;
use crate::onboarding::state::{OnboardingProgress, OnboardingStatus, StepRecord};
use crate::persona::PersonaSnapshot;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes read-modify-write updates of JSON documents.
    doc_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            doc_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed width, so text order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json_text<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json_text<T: serde::de::DeserializeOwned>(
    text: &str,
    what: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(text).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn query_err(op: &str) -> impl FnOnce(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const SESSION_COLUMNS: &str = "id, kind, participant_keys, participants, persona_snapshot, profile_snapshot, is_pinned_for, created_at, last_message_at";

/// Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));

    let id: String = row.get(0).map_err(parse)?;
    let kind_str: String = row.get(1).map_err(parse)?;
    let keys_str: String = row.get(2).map_err(parse)?;
    let participants_str: String = row.get(3).map_err(parse)?;
    let persona_str: Option<String> = row.get::<String>(4).ok();
    let profile_str: Option<String> = row.get::<String>(5).ok();
    let pinned_str: String = row.get::<String>(6).unwrap_or_else(|_| "{}".to_string());
    let created_str: String = row.get(7).map_err(parse)?;
    let last_str: String = row.get(8).map_err(parse)?;

    let kind = SessionKind::parse(&kind_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown session kind {kind_str:?}"))
    })?;

    Ok(Session {
        id,
        kind,
        participant_keys: from_json_text(&keys_str, "participant_keys")?,
        participants: from_json_text(&participants_str, "participants")?,
        persona_snapshot: persona_str
            .map(|s| from_json_text::<PersonaSnapshot>(&s, "persona_snapshot"))
            .transpose()?,
        profile_snapshot: profile_str
            .map(|s| from_json_text::<Value>(&s, "profile_snapshot"))
            .transpose()?,
        created_at: parse_datetime(&created_str),
        last_message_at: parse_datetime(&last_str),
        is_pinned_for: from_json_text(&pinned_str, "is_pinned_for")?,
    })
}

const MESSAGE_COLUMNS: &str = "id, chat_id, role, sender_id, text, status, created_at";

/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("message row parse: {e}"));

    let role_str: String = row.get(2).map_err(parse)?;
    let status_str: String = row.get(5).map_err(parse)?;

    Ok(Message {
        id: row.get(0).map_err(parse)?,
        chat_id: row.get(1).map_err(parse)?,
        role: Role::parse(&role_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown role {role_str:?}")))?,
        sender_id: row.get(3).map_err(parse)?,
        text: row.get(4).map_err(parse)?,
        status: MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Sent),
        created_at: micros_to_datetime(row.get(6).map_err(parse)?),
    })
}

impl LibSqlBackend {
    async fn query_one_message(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(query_err(op))?;
        match rows.next().await.map_err(query_err(op))? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Forms ───────────────────────────────────────────────────────

    async fn upsert_form(
        &self,
        form_id: &str,
        form: &FormDefinition,
    ) -> Result<(), DatabaseError> {
        let definition = to_json_text(form)?;
        self.conn()
            .execute(
                "INSERT INTO forms (id, definition, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET definition = excluded.definition, updated_at = excluded.updated_at",
                params![form_id, definition, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(query_err("upsert_form"))?;
        debug!(form_id, steps = form.steps.len(), "Form stored");
        Ok(())
    }

    async fn get_form(&self, form_id: &str) -> Result<Option<FormDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT definition FROM forms WHERE id = ?1", params![form_id])
            .await
            .map_err(query_err("get_form"))?;

        match rows.next().await.map_err(query_err("get_form"))? {
            Some(row) => {
                let text: String = row.get(0).map_err(query_err("get_form row parse"))?;
                Ok(Some(from_json_text(&text, "form definition")?))
            }
            None => Ok(None),
        }
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn get_user_doc(&self, uid: &str) -> Result<Option<Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT doc FROM users WHERE uid = ?1", params![uid])
            .await
            .map_err(query_err("get_user_doc"))?;

        match rows.next().await.map_err(query_err("get_user_doc"))? {
            Some(row) => {
                let text: String = row.get(0).map_err(query_err("get_user_doc row parse"))?;
                Ok(Some(from_json_text(&text, "user doc")?))
            }
            None => Ok(None),
        }
    }

    async fn merge_user_doc(&self, uid: &str, patch: &Value) -> Result<Value, DatabaseError> {
        let _guard = self.doc_lock.lock().await;

        let mut doc = self
            .get_user_doc(uid)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        deep_merge(&mut doc, patch);

        self.conn()
            .execute(
                "INSERT INTO users (uid, doc, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uid) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
                params![uid, to_json_text(&doc)?, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(query_err("merge_user_doc"))?;
        Ok(doc)
    }

    // ── Onboarding ──────────────────────────────────────────────────

    async fn save_onboarding_step(
        &self,
        uid: &str,
        form_id: &str,
        step_id: &str,
        answers: &Value,
        saved_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let ts = fmt_ts(&saved_at);

        conn.execute(
            "INSERT INTO onboarding_progress (uid, form_id, status, updated_at) VALUES (?1, ?2, 'in_progress', ?3)
             ON CONFLICT(uid, form_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![uid, form_id, ts.clone()],
        )
        .await
        .map_err(query_err("save_onboarding_step progress"))?;

        conn.execute(
            "INSERT INTO onboarding_steps (uid, form_id, step_id, answers, saved_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uid, form_id, step_id) DO UPDATE SET answers = excluded.answers, saved_at = excluded.saved_at",
            params![uid, form_id, step_id, to_json_text(answers)?, ts],
        )
        .await
        .map_err(query_err("save_onboarding_step answers"))?;

        Ok(())
    }

    async fn complete_onboarding(
        &self,
        uid: &str,
        form_id: &str,
        persona_snapshot: &Value,
        profile_snapshot: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO onboarding_progress (uid, form_id, status, completed_at, persona_snapshot, profile_snapshot, updated_at)
                 VALUES (?1, ?2, 'completed', ?3, ?4, ?5, ?3)
                 ON CONFLICT(uid, form_id) DO UPDATE SET
                    status = 'completed',
                    completed_at = COALESCE(onboarding_progress.completed_at, excluded.completed_at),
                    persona_snapshot = excluded.persona_snapshot,
                    profile_snapshot = excluded.profile_snapshot,
                    updated_at = excluded.updated_at",
                params![
                    uid,
                    form_id,
                    fmt_ts(&at),
                    to_json_text(persona_snapshot)?,
                    to_json_text(profile_snapshot)?
                ],
            )
            .await
            .map_err(query_err("complete_onboarding"))?;
        Ok(())
    }

    async fn get_onboarding_progress(
        &self,
        uid: &str,
        form_id: &str,
    ) -> Result<Option<OnboardingProgress>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT status, completed_at, persona_snapshot, profile_snapshot, updated_at
                 FROM onboarding_progress WHERE uid = ?1 AND form_id = ?2",
                params![uid, form_id],
            )
            .await
            .map_err(query_err("get_onboarding_progress"))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(query_err("get_onboarding_progress"))?
        else {
            return Ok(None);
        };

        let status_str: String = row
            .get(0)
            .map_err(query_err("get_onboarding_progress row parse"))?;
        let completed_at = row.get::<String>(1).ok().map(|s| parse_datetime(&s));
        let persona_snapshot = row
            .get::<String>(2)
            .ok()
            .map(|s| from_json_text::<Value>(&s, "persona_snapshot"))
            .transpose()?;
        let profile_snapshot = row
            .get::<String>(3)
            .ok()
            .map(|s| from_json_text::<Value>(&s, "profile_snapshot"))
            .transpose()?;
        let updated_str: String = row
            .get(4)
            .map_err(query_err("get_onboarding_progress row parse"))?;

        let mut steps = BTreeMap::new();
        let mut step_rows = conn
            .query(
                "SELECT step_id, answers, saved_at FROM onboarding_steps WHERE uid = ?1 AND form_id = ?2",
                params![uid, form_id],
            )
            .await
            .map_err(query_err("get_onboarding_progress steps"))?;
        while let Some(row) = step_rows
            .next()
            .await
            .map_err(query_err("get_onboarding_progress steps"))?
        {
            let step_id: String = row.get(0).map_err(query_err("step row parse"))?;
            let answers: String = row.get(1).map_err(query_err("step row parse"))?;
            let saved_at: String = row.get(2).map_err(query_err("step row parse"))?;
            steps.insert(
                step_id,
                StepRecord {
                    answers: from_json_text(&answers, "step answers")?,
                    saved_at: parse_datetime(&saved_at),
                },
            );
        }

        Ok(Some(OnboardingProgress {
            form_id: form_id.to_string(),
            status: OnboardingStatus::parse(&status_str).unwrap_or(OnboardingStatus::InProgress),
            steps,
            completed_at,
            persona_snapshot,
            profile_snapshot,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    // ── Configs ─────────────────────────────────────────────────────

    async fn get_config(&self, key: &str) -> Result<Option<Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT doc FROM configs WHERE key = ?1", params![key])
            .await
            .map_err(query_err("get_config"))?;

        match rows.next().await.map_err(query_err("get_config"))? {
            Some(row) => {
                let text: String = row.get(0).map_err(query_err("get_config row parse"))?;
                Ok(Some(from_json_text(&text, "config")?))
            }
            None => Ok(None),
        }
    }

    async fn put_config(&self, key: &str, doc: &Value) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO configs (key, doc, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
                params![key, to_json_text(doc)?, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(query_err("put_config"))?;
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session_if_absent(&self, session: &Session) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO chats ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    session.id.clone(),
                    session.kind.as_str(),
                    to_json_text(&session.participant_keys)?,
                    to_json_text(&session.participants)?,
                    opt_text_owned(
                        session
                            .persona_snapshot
                            .as_ref()
                            .map(to_json_text)
                            .transpose()?
                    ),
                    opt_text_owned(
                        session
                            .profile_snapshot
                            .as_ref()
                            .map(to_json_text)
                            .transpose()?
                    ),
                    to_json_text(&session.is_pinned_for)?,
                    fmt_ts(&session.created_at),
                    fmt_ts(&session.last_message_at)
                ],
            )
            .await
            .map_err(query_err("insert_session_if_absent"))?;

        debug!(chat_id = %session.id, kind = session.kind.as_str(), inserted = inserted > 0, "Session insert");
        Ok(inserted > 0)
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM chats WHERE id = ?1"),
                params![chat_id],
            )
            .await
            .map_err(query_err("get_session"))?;

        match rows.next().await.map_err(query_err("get_session"))? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions_for(
        &self,
        participant_key: &str,
        kind: Option<SessionKind>,
        limit: usize,
    ) -> Result<Vec<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM chats
                     WHERE EXISTS (SELECT 1 FROM json_each(chats.participant_keys) WHERE json_each.value = ?1)
                       AND (?2 IS NULL OR kind = ?2)
                     ORDER BY last_message_at DESC
                     LIMIT ?3"
                ),
                params![
                    participant_key,
                    opt_text_owned(kind.map(|k| k.as_str().to_string())),
                    limit as i64
                ],
            )
            .await
            .map_err(query_err("list_sessions_for"))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_sessions_for"))? {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    async fn sync_session(
        &self,
        chat_id: &str,
        persona_snapshot: Option<&PersonaSnapshot>,
        profile_snapshot: Option<&Value>,
        pin_uid: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.doc_lock.lock().await;

        let session = self
            .get_session(chat_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "chat".to_string(),
                id: chat_id.to_string(),
            })?;
        let mut pinned = session.is_pinned_for;
        pinned.insert(pin_uid.to_string(), true);

        self.conn()
            .execute(
                "UPDATE chats SET persona_snapshot = ?2, profile_snapshot = ?3, is_pinned_for = ?4,
                    last_message_at = MAX(last_message_at, ?5)
                 WHERE id = ?1",
                params![
                    chat_id,
                    opt_text_owned(persona_snapshot.map(to_json_text).transpose()?),
                    opt_text_owned(profile_snapshot.map(to_json_text).transpose()?),
                    to_json_text(&pinned)?,
                    fmt_ts(&at)
                ],
            )
            .await
            .map_err(query_err("sync_session"))?;
        Ok(())
    }

    async fn pin_session(&self, chat_id: &str, uid: &str) -> Result<(), DatabaseError> {
        let _guard = self.doc_lock.lock().await;

        let Some(session) = self.get_session(chat_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "chat".to_string(),
                id: chat_id.to_string(),
            });
        };
        if session.is_pinned_for(uid) {
            return Ok(());
        }
        let mut pinned = session.is_pinned_for;
        pinned.insert(uid.to_string(), true);

        self.conn()
            .execute(
                "UPDATE chats SET is_pinned_for = ?2 WHERE id = ?1",
                params![chat_id, to_json_text(&pinned)?],
            )
            .await
            .map_err(query_err("pin_session"))?;
        Ok(())
    }

    async fn touch_session(&self, chat_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE chats SET last_message_at = ?2 WHERE id = ?1 AND last_message_at < ?2",
                params![chat_id, fmt_ts(&at)],
            )
            .await
            .map_err(query_err("touch_session"))?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(
        &self,
        chat_id: &str,
        message: &NewMessage,
    ) -> Result<Appended, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_micros();

        // One statement, so the timestamp read and the insert cannot interleave
        // with another append on the same connection.
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages (id, chat_id, role, sender_id, text, status, created_at, idempotency_key)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, MAX(?7, COALESCE(MAX(created_at) + 1, 0)), ?8
                 FROM messages WHERE chat_id = ?2",
                params![
                    id.clone(),
                    chat_id,
                    message.role.as_str(),
                    message.sender_id.clone(),
                    message.text.clone(),
                    message.status.as_str(),
                    now,
                    opt_text_owned(message.idempotency_key.clone())
                ],
            )
            .await
            .map_err(query_err("append_message"))?;

        if inserted == 0 {
            if let Some(key) = &message.idempotency_key {
                if let Some(existing) = self.find_message_by_key(chat_id, key).await? {
                    debug!(chat_id, key = %key, "Duplicate message suppressed");
                    return Ok(Appended {
                        message: existing,
                        created: false,
                    });
                }
            }
            return Err(DatabaseError::Constraint(format!(
                "message {id} was not inserted into chat {chat_id}"
            )));
        }

        let stored = self
            .get_message(chat_id, &id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".to_string(),
                id: id.clone(),
            })?;
        debug!(chat_id, message_id = %id, role = message.role.as_str(), "Message appended");
        Ok(Appended {
            message: stored,
            created: true,
        })
    }

    async fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        self.query_one_message(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 AND id = ?2"),
            params![chat_id, message_id],
        )
        .await
    }

    async fn find_message_by_key(
        &self,
        chat_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        self.query_one_message(
            "find_message_by_key",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 AND idempotency_key = ?2"
            ),
            params![chat_id, idempotency_key],
        )
        .await
    }

    async fn recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let up_to = up_to.map(|t| t.timestamp_micros()).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT {MESSAGE_COLUMNS} FROM messages
                        WHERE chat_id = ?1 AND created_at <= ?2
                        ORDER BY created_at DESC
                        LIMIT ?3
                     ) ORDER BY created_at ASC"
                ),
                params![chat_id, up_to, limit as i64],
            )
            .await
            .map_err(query_err("recent_messages"))?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("recent_messages"))? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn count_messages(&self, chat_id: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
                params![chat_id],
            )
            .await
            .map_err(query_err("count_messages"))?;

        match rows.next().await.map_err(query_err("count_messages"))? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err("count_messages row parse"))?;
                Ok(count as usize)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chat::model::{WELCOME_MESSAGE, reply_key, user_key};
    use crate::persona::{Persona, StrictSource};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn form() -> FormDefinition {
        serde_json::from_value(json!({
            "version": 1,
            "title": "Onboarding",
            "steps": [
                {"id": "intro", "type": "intro"},
                {"id": "finish", "type": "finish"}
            ]
        }))
        .unwrap()
    }

    // ── Form tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn form_upsert_replaces_definition() {
        let db = test_db().await;
        assert!(db.get_form("f1").await.unwrap().is_none());

        db.upsert_form("f1", &form()).await.unwrap();
        let mut updated = form();
        updated.version = 2;
        updated.steps.truncate(1);
        db.upsert_form("f1", &updated).await.unwrap();

        let fetched = db.get_form("f1").await.unwrap().unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.steps.len(), 1);
    }

    // ── User document tests ─────────────────────────────────────────

    #[tokio::test]
    async fn user_doc_merges_deeply() {
        let db = test_db().await;
        assert!(db.get_user_doc("u1").await.unwrap().is_none());

        db.merge_user_doc("u1", &json!({"profile": {"age_bracket": "18-24"}}))
            .await
            .unwrap();
        let merged = db
            .merge_user_doc("u1", &json!({"profile": {"city": "Taipei"}, "system": {"pinnedAIChatId": "c1"}}))
            .await
            .unwrap();

        assert_eq!(
            merged,
            json!({
                "profile": {"age_bracket": "18-24", "city": "Taipei"},
                "system": {"pinnedAIChatId": "c1"}
            })
        );
        assert_eq!(db.get_user_doc("u1").await.unwrap().unwrap(), merged);
    }

    // ── Onboarding tests ────────────────────────────────────────────

    #[tokio::test]
    async fn step_resubmission_overwrites_only_that_step() {
        let db = test_db().await;
        let t = Utc::now();
        db.save_onboarding_step("u1", "f1", "a", &json!({"a": 1}), t).await.unwrap();
        db.save_onboarding_step("u1", "f1", "b", &json!({"b": 1}), t).await.unwrap();
        db.save_onboarding_step("u1", "f1", "a", &json!({"a": 2}), t).await.unwrap();

        let progress = db.get_onboarding_progress("u1", "f1").await.unwrap().unwrap();
        assert_eq!(progress.status, OnboardingStatus::InProgress);
        assert_eq!(progress.steps["a"].answers, json!({"a": 2}));
        assert_eq!(progress.steps["b"].answers, json!({"b": 1}));
        assert!(db.get_onboarding_progress("u1", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_is_sticky_and_keeps_first_time() {
        let db = test_db().await;
        let first = Utc::now();
        db.complete_onboarding("u1", "f1", &json!({"mbti": "ENFP"}), &json!({}), first)
            .await
            .unwrap();
        let later = first + chrono::Duration::seconds(30);
        db.complete_onboarding("u1", "f1", &json!({"mbti": "INTJ"}), &json!({"x": 1}), later)
            .await
            .unwrap();
        db.save_onboarding_step("u1", "f1", "a", &json!({}), later).await.unwrap();

        let progress = db.get_onboarding_progress("u1", "f1").await.unwrap().unwrap();
        assert!(progress.is_completed());
        assert_eq!(progress.completed_at.unwrap().timestamp_micros(), first.timestamp_micros());
        assert_eq!(progress.persona_snapshot, Some(json!({"mbti": "INTJ"})));
        assert_eq!(progress.profile_snapshot, Some(json!({"x": 1})));
    }

    // ── Config tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn config_roundtrip() {
        let db = test_db().await;
        assert!(db.get_config("llm").await.unwrap().is_none());
        db.put_config("llm", &json!({"strictPrompt": "rules", "version": 4}))
            .await
            .unwrap();
        assert_eq!(db.get_config("llm").await.unwrap().unwrap()["version"], 4);
    }

    // ── Session tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn session_insert_is_conditional() {
        let db = test_db().await;
        let snap = PersonaSnapshot::capture(&Persona::new("ENFP", "cats"), StrictSource::Global { version: 1 });
        let session = Session::user_ai("u1", Some(snap.clone()), Some(json!({"a": 1})), Utc::now());

        assert!(db.insert_session_if_absent(&session).await.unwrap());
        assert!(!db.insert_session_if_absent(&session).await.unwrap());

        let fetched = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.kind, SessionKind::UserAi);
        assert_eq!(fetched.persona_snapshot, Some(snap));
        assert!(fetched.is_pinned_for("u1"));
    }

    #[tokio::test]
    async fn sessions_are_found_by_participant_key() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_session_if_absent(&Session::user_ai("u1", None, None, now)).await.unwrap();
        db.insert_session_if_absent(&Session::user_user("u1", "u2", now)).await.unwrap();
        db.insert_session_if_absent(&Session::user_ai("u2", None, None, now)).await.unwrap();

        let all = db.list_sessions_for(&user_key("u1"), None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let ai = db
            .list_sessions_for(&user_key("u1"), Some(SessionKind::UserAi), 1)
            .await
            .unwrap();
        assert_eq!(ai.len(), 1);
        assert_eq!(ai[0].id, Session::user_ai_id("u1"));

        assert!(db.list_sessions_for("user:u", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_refreshes_snapshots_and_pins() {
        let db = test_db().await;
        let created = Utc::now();
        let session = Session::user_user("u1", "u2", created);
        db.insert_session_if_absent(&session).await.unwrap();

        let later = created + chrono::Duration::seconds(5);
        db.sync_session(&session.id, None, Some(&json!({"city": "Tainan"})), "u2", later)
            .await
            .unwrap();
        db.pin_session(&session.id, "u1").await.unwrap();

        let fetched = db.get_session(&session.id).await.unwrap().unwrap();
        assert!(fetched.is_pinned_for("u1"));
        assert!(fetched.is_pinned_for("u2"));
        assert_eq!(fetched.profile_snapshot, Some(json!({"city": "Tainan"})));
        assert_eq!(fetched.last_message_at.timestamp_micros(), later.timestamp_micros());

        assert!(matches!(
            db.pin_session("missing", "u1").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let db = test_db().await;
        let created = Utc::now();
        let session = Session::user_ai("u1", None, None, created);
        db.insert_session_if_absent(&session).await.unwrap();

        db.touch_session(&session.id, created - chrono::Duration::seconds(10))
            .await
            .unwrap();
        let fetched = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_message_at.timestamp_micros(), created.timestamp_micros());
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn appended_messages_have_strictly_increasing_timestamps() {
        let db = test_db().await;
        let mut last = None;
        for i in 0..25 {
            let appended = db
                .append_message("c1", &NewMessage::user("u1", format!("m{i}")))
                .await
                .unwrap();
            assert!(appended.created);
            if let Some(prev) = last {
                assert!(appended.message.created_at > prev);
            }
            last = Some(appended.message.created_at);
        }
        assert_eq!(db.count_messages("c1").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn idempotency_key_suppresses_duplicates() {
        let db = test_db().await;
        let first = db.append_message("c1", &NewMessage::welcome()).await.unwrap();
        let second = db.append_message("c1", &NewMessage::welcome()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(second.message.text, WELCOME_MESSAGE);
        assert_eq!(db.count_messages("c1").await.unwrap(), 1);

        let reply = NewMessage::assistant("hey", MessageStatus::Sent).with_idempotency_key(reply_key("m1"));
        db.append_message("c1", &reply).await.unwrap();
        let found = db.find_message_by_key("c1", &reply_key("m1")).await.unwrap().unwrap();
        assert_eq!(found.text, "hey");
        assert!(db.find_message_by_key("c2", &reply_key("m1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_messages_are_bounded_and_ascending() {
        let db = test_db().await;
        let mut ids = Vec::new();
        for i in 0..30 {
            let m = db
                .append_message("c1", &NewMessage::user("u1", format!("m{i}")))
                .await
                .unwrap();
            ids.push(m.message);
        }

        let recent = db.recent_messages("c1", 20, None).await.unwrap();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.first().unwrap().text, "m10");
        assert_eq!(recent.last().unwrap().text, "m29");

        let bounded = db
            .recent_messages("c1", 5, Some(ids[9].created_at))
            .await
            .unwrap();
        let texts: Vec<&str> = bounded.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m5", "m6", "m7", "m8", "m9"]);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lumi.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.merge_user_doc("u1", &json!({"persona": {"mbti": "ENFP"}})).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let doc = db.get_user_doc("u1").await.unwrap().unwrap();
        assert_eq!(doc["persona"]["mbti"], "ENFP");
    }
}
