//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every mutating method is one SQL statement, so each write is atomic on its
//! own. Methods that perform a guarded transition (`mark_link_used`,
//! `finalize_session`, ...) report whether a row actually changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::intake::model::{Client, IntakeRecord, Link, Message, Session};

/// Backend-agnostic database trait covering intake links, sessions, and
/// messages, plus read access to the CRUD layer's client data.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Clients (CRUD layer) ────────────────────────────────────────

    /// Look up a client by ID.
    async fn get_client(&self, id: &str) -> Result<Option<Client>, DatabaseError>;

    /// Insert or replace a client record.
    async fn upsert_client(&self, client: &Client) -> Result<(), DatabaseError>;

    /// Most recently submitted intake record for a client.
    async fn get_latest_intake_record(
        &self,
        client_id: &str,
    ) -> Result<Option<IntakeRecord>, DatabaseError>;

    /// Insert an intake record.
    async fn insert_intake_record(&self, record: &IntakeRecord) -> Result<(), DatabaseError>;

    // ── Links ───────────────────────────────────────────────────────

    /// Insert a new link. Fails with `Constraint` if the token is taken or
    /// the client already has an active link.
    async fn insert_link(&self, link: &Link) -> Result<(), DatabaseError>;

    /// Look up a link by its token, in any status.
    async fn get_link_by_token(&self, token: &str) -> Result<Option<Link>, DatabaseError>;

    /// The client's active link, if any.
    async fn get_active_link_for_client(
        &self,
        client_id: &str,
    ) -> Result<Option<Link>, DatabaseError>;

    /// `active → used`. Returns false if the link was not active.
    async fn mark_link_used(&self, token: &str) -> Result<bool, DatabaseError>;

    /// `active → expired`. Returns false if the link was not active.
    async fn mark_link_expired(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert a new session.
    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError>;

    /// Get a session by ID.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    /// `active → finalized`, recording the report and timestamp.
    /// Returns false if the session was not active.
    async fn finalize_session(
        &self,
        id: Uuid,
        final_report: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message.
    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// All messages of a session, oldest first.
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, DatabaseError>;
}
