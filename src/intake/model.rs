//! Intake data model: links, sessions, messages, and the client records
//! read from the surrounding CRUD layer.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::ChatMessage;

/// Lifecycle of an access link.
///
/// `Active → Used` on session start. `Active → Expired` only when issuance
/// finds the client's active link past its `expires_at` and retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Used,
    Expired,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for LinkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "used" => Ok(Self::Used),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown link status: {other}")),
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-time token gating entry into an interview for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: Uuid,
    pub client_id: String,
    /// Opaque, high-entropy, unique.
    pub token: String,
    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Link {
    pub fn new(client_id: &str, token: String, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            token,
            status: LinkStatus::Active,
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Whether `expires_at` lies strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }

    /// Whether this link can still start a session at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LinkStatus::Active && !self.is_expired_at(now)
    }
}

/// Session lifecycle. `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Finalized,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalized => "finalized",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "finalized" => Ok(Self::Finalized),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One guided interview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub client_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set exactly once, at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
}

impl Session {
    pub fn new(client_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            finalized_at: None,
            final_report: None,
        }
    }
}

/// Speaker of a stored conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// One turn of a session's conversation. Never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn to_chat(&self) -> ChatMessage {
        match self.role {
            MessageRole::User => ChatMessage::user(&self.content),
            MessageRole::Assistant => ChatMessage::assistant(&self.content),
        }
    }
}

/// Client record owned by the CRUD layer; only the fields the intake flow reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub industry: String,
}

/// Structured intake answers submitted for a client, owned by the CRUD layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub current_sns: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub product_summary: Option<String>,
    #[serde(default)]
    pub strengths_usp: Option<String>,
    #[serde(default)]
    pub brand_story: Option<String>,
    pub submitted_at: DateTime<Utc>,
}
