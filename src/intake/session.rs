//! Session state machine: drives one interview from link to final report.
//!
//! ```text
//!   link (active) ──start──▶ session (active) ──keyword turn──▶ finalized
//!                                 │  ▲
//!                                 └──┘ post_message
//! ```
//!
//! Link consumption runs under the link registry's write lock. Each turn of
//! a session runs under that session's own lock, so replies are appended in
//! the order of the user messages that triggered them and finalization fires
//! at most once. A session's lock entry lives only while some turn holds or
//! awaits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::dispatch::FinalizationDispatcher;
use super::links::{LinkRegistry, redact_token};
use super::messages::MessageStore;
use super::model::{Client, Link, Message, MessageRole, Session, SessionStatus};
use super::prompts::{FALLBACK_OPENING, FALLBACK_REPLY, OPENING_INSTRUCTION};
use crate::error::IntakeError;
use crate::llm::{ChatMessage, GenerationAdapter};
use crate::store::Database;

/// A freshly opened session and its first assistant turn.
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub session: Session,
    pub client: Option<Client>,
    pub first_message: String,
}

/// Result of one conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub assistant_message: String,
    /// True when this turn finalized the session.
    pub done: bool,
}

/// Orchestrates links, sessions, messages, generation, and dispatch.
pub struct IntakeOrchestrator {
    db: Arc<dyn Database>,
    links: LinkRegistry,
    messages: MessageStore,
    generation: GenerationAdapter,
    dispatcher: Arc<FinalizationDispatcher>,
    completion_keyword: String,
    session_locks: SessionLocks,
}

type SessionLocks = StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// A claim on one session's turn lock.
///
/// Dropping the last claim removes the session's entry from the map, so
/// posts to unknown or finalized sessions leave nothing behind.
struct SessionLockLease<'a> {
    locks: &'a SessionLocks,
    session_id: Uuid,
    lock: Arc<Mutex<()>>,
}

impl SessionLockLease<'_> {
    fn acquire(locks: &SessionLocks, session_id: Uuid) -> SessionLockLease<'_> {
        let mut map = locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = Arc::clone(map.entry(session_id).or_default());
        SessionLockLease {
            locks,
            session_id,
            lock,
        }
    }

    async fn turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }
}

impl Drop for SessionLockLease<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here: nobody else holds or awaits it.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.session_id);
        }
    }
}

impl IntakeOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        generation: GenerationAdapter,
        dispatcher: Arc<FinalizationDispatcher>,
        completion_keyword: &str,
        link_ttl: Option<TimeDelta>,
    ) -> Self {
        Self {
            links: LinkRegistry::new(Arc::clone(&db), link_ttl),
            messages: MessageStore::new(Arc::clone(&db)),
            db,
            generation,
            dispatcher,
            completion_keyword: completion_keyword.trim().to_string(),
            session_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    /// Issue (or return the existing) link for a client.
    pub async fn issue_link(
        &self,
        client_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Link, IntakeError> {
        self.links.issue(client_id, expires_at).await
    }

    /// Start a session from an unscoped token.
    pub async fn start_from_token(&self, token: &str) -> Result<StartedSession, IntakeError> {
        let session = self.consume_link(token, None).await?;
        self.open(session).await
    }

    /// Start a session from a token that must belong to `client_id`.
    pub async fn start_from_client_token(
        &self,
        client_id: &str,
        token: &str,
    ) -> Result<StartedSession, IntakeError> {
        let session = self.consume_link(token, Some(client_id)).await?;
        self.open(session).await
    }

    /// Start a session from a link obtained through [`LinkRegistry::resolve`].
    ///
    /// The link's state is re-checked under the write lock, so a link that was
    /// consumed in the meantime fails with `LinkNotFound`.
    pub async fn start(&self, link: &Link) -> Result<StartedSession, IntakeError> {
        let session = self.consume_link(&link.token, Some(&link.client_id)).await?;
        self.open(session).await
    }

    /// Resolve → create session → mark used, as one serialized step.
    async fn consume_link(
        &self,
        token: &str,
        expected_client: Option<&str>,
    ) -> Result<Session, IntakeError> {
        let _guard = self.links.write_guard().await;

        let link = self.links.resolve(token).await?;
        if let Some(expected) = expected_client {
            if link.client_id != expected {
                info!(
                    token = %redact_token(token),
                    link_client_id = %link.client_id,
                    url_client_id = %expected,
                    "Token client mismatch"
                );
                return Err(IntakeError::LinkNotFound);
            }
        }

        let session = Session::new(&link.client_id);
        self.db.insert_session(&session).await?;
        self.links.mark_used(&link.token).await?;

        info!(
            session_id = %session.id,
            client_id = %session.client_id,
            link_id = %link.id,
            "Session created"
        );
        Ok(session)
    }

    /// Seed the opening assistant turn. Never fails on generation.
    async fn open(&self, session: Session) -> Result<StartedSession, IntakeError> {
        let generation = self
            .generation
            .complete(&[ChatMessage::user(OPENING_INSTRUCTION)])
            .await;
        if generation.is_unavailable() {
            info!(session_id = %session.id, "Opening generation unavailable; using fallback");
        }
        let first_message = generation.or_fallback(FALLBACK_OPENING);

        self.messages
            .append(session.id, MessageRole::Assistant, &first_message)
            .await?;
        let client = self.db.get_client(&session.client_id).await?;

        Ok(StartedSession {
            session,
            client,
            first_message,
        })
    }

    /// Post a user message and produce the assistant's reply.
    ///
    /// Fails with `SessionNotFound` for unknown or finalized sessions, without
    /// appending anything. A user message equal to the completion keyword
    /// (after trimming) finalizes the session with the reply as its report.
    pub async fn post_message(
        &self,
        session_id: Uuid,
        content: &str,
    ) -> Result<TurnReply, IntakeError> {
        let lease = SessionLockLease::acquire(&self.session_locks, session_id);
        let _turn = lease.turn().await;

        let session = match self.db.get_session(session_id).await? {
            Some(s) if s.status.is_terminal() => {
                debug!(session_id = %session_id, "Message posted to finalized session");
                return Err(IntakeError::SessionNotFound);
            }
            Some(s) => s,
            None => return Err(IntakeError::SessionNotFound),
        };

        self.messages
            .append(session_id, MessageRole::User, content)
            .await?;

        let history: Vec<ChatMessage> = self
            .messages
            .history(session_id)
            .await?
            .iter()
            .map(Message::to_chat)
            .collect();

        let generation = self.generation.complete(&history).await;
        if generation.is_unavailable() {
            info!(session_id = %session_id, "Reply generation unavailable; using fallback");
        }
        let reply = generation.or_fallback(FALLBACK_REPLY);

        self.messages
            .append(session_id, MessageRole::Assistant, &reply)
            .await?;

        let done = self.is_completion(content);
        if done {
            self.finalize(session, &reply).await?;
        }

        Ok(TurnReply {
            assistant_message: reply,
            done,
        })
    }

    fn is_completion(&self, content: &str) -> bool {
        content.trim() == self.completion_keyword
    }

    /// `active → finalized` and fire the dispatcher. Caller holds the
    /// session's turn lock.
    async fn finalize(
        &self,
        mut session: Session,
        final_report: &str,
    ) -> Result<(), IntakeError> {
        let finalized_at = Utc::now();
        if !self
            .db
            .finalize_session(session.id, final_report, finalized_at)
            .await?
        {
            debug!(session_id = %session.id, "Session already finalized");
            return Ok(());
        }

        session.status = SessionStatus::Finalized;
        session.finalized_at = Some(finalized_at);
        session.final_report = Some(final_report.to_string());
        info!(session_id = %session.id, client_id = %session.client_id, "Session finalized");

        self.dispatcher.spawn(Arc::clone(&self.db), session);
        Ok(())
    }

    #[cfg(test)]
    fn tracked_session_locks(&self) -> usize {
        self.session_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Read-only view of a session.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session, IntakeError> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or(IntakeError::SessionNotFound)
    }

    /// Ordered conversation of an existing session.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<Message>, IntakeError> {
        self.get_session(session_id).await?;
        Ok(self.messages.history(session_id).await?)
    }
}
