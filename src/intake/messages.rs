//! Message store: append-only, session-scoped conversation log.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{Message, MessageRole};
use crate::error::DatabaseError;
use crate::store::Database;

/// Wall clock that never returns the same instant twice.
///
/// Each reading is at least 1µs after the previous one, matching the
/// microsecond precision timestamps are stored with.
#[derive(Debug, Default)]
struct MonotonicClock {
    last_micros: Mutex<i64>,
}

impl MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last_micros.lock().unwrap_or_else(|e| e.into_inner());
        let wall = Utc::now();
        let micros = wall.timestamp_micros().max(*last + 1);
        *last = micros;
        DateTime::from_timestamp_micros(micros).unwrap_or(wall)
    }
}

/// Ordered log of conversation turns.
pub struct MessageStore {
    db: Arc<dyn Database>,
    clock: MonotonicClock,
}

impl MessageStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            clock: MonotonicClock::default(),
        }
    }

    /// Persist a new message and return the stored record.
    pub async fn append(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, DatabaseError> {
        let message = Message {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.to_string(),
            created_at: self.clock.now(),
        };
        self.db.insert_message(&message).await?;
        tracing::debug!(
            session_id = %session_id,
            role = role.as_str(),
            len = content.len(),
            "Message appended"
        );
        Ok(message)
    }

    /// All messages of the session, oldest first. Empty if none.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        self.db.list_messages(session_id).await
    }
}
