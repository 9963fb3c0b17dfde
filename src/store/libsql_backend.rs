//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC with microseconds, so string order in SQL matches
//! chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::intake::model::{
    Client, IntakeRecord, Link, LinkStatus, Message, MessageRole, Session, SessionStatus,
};
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
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
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

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
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

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a write error, classifying constraint violations separately.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") || msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn read_error(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const LINK_COLUMNS: &str = "id, client_id, token, status, created_at, expires_at";

/// Column order matches LINK_COLUMNS.
fn row_to_link(row: &libsql::Row) -> Result<Link, DatabaseError> {
    let id: String = row.get(0).map_err(read_error("link.id"))?;
    let status: String = row.get(3).map_err(read_error("link.status"))?;
    let created: String = row.get(4).map_err(read_error("link.created_at"))?;
    let expires: Option<String> = row.get(5).ok();

    Ok(Link {
        id: parse_uuid(&id)?,
        client_id: row.get(1).map_err(read_error("link.client_id"))?,
        token: row.get(2).map_err(read_error("link.token"))?,
        status: status
            .parse::<LinkStatus>()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created),
        expires_at: parse_optional_datetime(&expires),
    })
}

const SESSION_COLUMNS: &str = "id, client_id, status, created_at, finalized_at, final_report";

/// Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let id: String = row.get(0).map_err(read_error("session.id"))?;
    let status: String = row.get(2).map_err(read_error("session.status"))?;
    let created: String = row.get(3).map_err(read_error("session.created_at"))?;
    let finalized: Option<String> = row.get(4).ok();

    Ok(Session {
        id: parse_uuid(&id)?,
        client_id: row.get(1).map_err(read_error("session.client_id"))?,
        status: status
            .parse::<SessionStatus>()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created),
        finalized_at: parse_optional_datetime(&finalized),
        final_report: row.get(5).ok(),
    })
}

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at";

/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = row.get(0).map_err(read_error("message.id"))?;
    let session_id: String = row.get(1).map_err(read_error("message.session_id"))?;
    let role: String = row.get(2).map_err(read_error("message.role"))?;
    let created: String = row.get(4).map_err(read_error("message.created_at"))?;

    Ok(Message {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        role: role
            .parse::<MessageRole>()
            .map_err(DatabaseError::Serialization)?,
        content: row.get(3).map_err(read_error("message.content"))?,
        created_at: parse_datetime(&created),
    })
}

const INTAKE_RECORD_COLUMNS: &str = "id, client_id, problem, current_sns, target, \
     product_summary, strengths_usp, brand_story, submitted_at";

/// Column order matches INTAKE_RECORD_COLUMNS.
fn row_to_intake_record(row: &libsql::Row) -> Result<IntakeRecord, DatabaseError> {
    let submitted: String = row.get(8).map_err(read_error("intake_record.submitted_at"))?;
    Ok(IntakeRecord {
        id: row.get(0).map_err(read_error("intake_record.id"))?,
        client_id: row.get(1).map_err(read_error("intake_record.client_id"))?,
        problem: row.get(2).ok(),
        current_sns: row.get(3).ok(),
        target: row.get(4).ok(),
        product_summary: row.get(5).ok(),
        strengths_usp: row.get(6).ok(),
        brand_story: row.get(7).ok(),
        submitted_at: parse_datetime(&submitted),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Clients ─────────────────────────────────────────────────────

    async fn get_client(&self, id: &str) -> Result<Option<Client>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, industry FROM clients WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(read_error("get_client"))?;

        match rows.next().await.map_err(read_error("get_client"))? {
            Some(row) => Ok(Some(Client {
                id: row.get(0).map_err(read_error("client.id"))?,
                name: row.get(1).map_err(read_error("client.name"))?,
                industry: row.get::<String>(2).unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    async fn upsert_client(&self, client: &Client) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO clients (id, name, industry) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET name = ?2, industry = ?3",
                params![client.id.as_str(), client.name.as_str(), client.industry.as_str()],
            )
            .await
            .map_err(|e| write_error("upsert_client", e))?;
        Ok(())
    }

    async fn get_latest_intake_record(
        &self,
        client_id: &str,
    ) -> Result<Option<IntakeRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {INTAKE_RECORD_COLUMNS} FROM intake_records
             WHERE client_id = ?1 ORDER BY submitted_at DESC, rowid DESC LIMIT 1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![client_id])
            .await
            .map_err(read_error("get_latest_intake_record"))?;

        match rows
            .next()
            .await
            .map_err(read_error("get_latest_intake_record"))?
        {
            Some(row) => Ok(Some(row_to_intake_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_intake_record(&self, record: &IntakeRecord) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO intake_records ({INTAKE_RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    record.id.as_str(),
                    record.client_id.as_str(),
                    opt_text(record.problem.as_deref()),
                    opt_text(record.current_sns.as_deref()),
                    opt_text(record.target.as_deref()),
                    opt_text(record.product_summary.as_deref()),
                    opt_text(record.strengths_usp.as_deref()),
                    opt_text(record.brand_story.as_deref()),
                    fmt_datetime(&record.submitted_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_intake_record", e))?;
        Ok(())
    }

    // ── Links ───────────────────────────────────────────────────────

    async fn insert_link(&self, link: &Link) -> Result<(), DatabaseError> {
        let sql =
            format!("INSERT INTO intake_links ({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)");
        let expires = link.expires_at.as_ref().map(fmt_datetime);
        self.conn()
            .execute(
                &sql,
                params![
                    link.id.to_string(),
                    link.client_id.as_str(),
                    link.token.as_str(),
                    link.status.as_str(),
                    fmt_datetime(&link.created_at),
                    opt_text(expires.as_deref()),
                ],
            )
            .await
            .map_err(|e| write_error("insert_link", e))?;
        debug!(link_id = %link.id, client_id = %link.client_id, "Link inserted");
        Ok(())
    }

    async fn get_link_by_token(&self, token: &str) -> Result<Option<Link>, DatabaseError> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM intake_links WHERE token = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![token])
            .await
            .map_err(read_error("get_link_by_token"))?;

        match rows.next().await.map_err(read_error("get_link_by_token"))? {
            Some(row) => Ok(Some(row_to_link(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_active_link_for_client(
        &self,
        client_id: &str,
    ) -> Result<Option<Link>, DatabaseError> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM intake_links
             WHERE client_id = ?1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![client_id])
            .await
            .map_err(read_error("get_active_link_for_client"))?;

        match rows
            .next()
            .await
            .map_err(read_error("get_active_link_for_client"))?
        {
            Some(row) => Ok(Some(row_to_link(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_link_used(&self, token: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE intake_links SET status = ?2 WHERE token = ?1 AND status = 'active'",
                params![token, LinkStatus::Used.as_str()],
            )
            .await
            .map_err(|e| write_error("mark_link_used", e))?;
        Ok(count > 0)
    }

    async fn mark_link_expired(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE intake_links SET status = ?2 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), LinkStatus::Expired.as_str()],
            )
            .await
            .map_err(|e| write_error("mark_link_expired", e))?;
        Ok(count > 0)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO intake_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        );
        let finalized = session.finalized_at.as_ref().map(fmt_datetime);
        self.conn()
            .execute(
                &sql,
                params![
                    session.id.to_string(),
                    session.client_id.as_str(),
                    session.status.as_str(),
                    fmt_datetime(&session.created_at),
                    opt_text(finalized.as_deref()),
                    opt_text(session.final_report.as_deref()),
                ],
            )
            .await
            .map_err(|e| write_error("insert_session", e))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM intake_sessions WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(read_error("get_session"))?;

        match rows.next().await.map_err(read_error("get_session"))? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn finalize_session(
        &self,
        id: Uuid,
        final_report: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE intake_sessions
                 SET status = 'finalized', finalized_at = ?2, final_report = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), fmt_datetime(&finalized_at), final_report],
            )
            .await
            .map_err(|e| write_error("finalize_session", e))?;
        Ok(count > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let sql =
            format!("INSERT INTO intake_messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)");
        self.conn()
            .execute(
                &sql,
                params![
                    message.id.to_string(),
                    message.session_id.to_string(),
                    message.role.as_str(),
                    message.content.as_str(),
                    fmt_datetime(&message.created_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_message", e))?;
        Ok(())
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM intake_messages
             WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![session_id.to_string()])
            .await
            .map_err(read_error("list_messages"))?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_error("list_messages"))? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }
}
