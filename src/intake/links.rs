//! Link registry: issues and validates one-time access tokens.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::model::Link;
use crate::error::IntakeError;
use crate::store::Database;

/// Token length in characters. 62^32 ≈ 2^190.
pub const TOKEN_LEN: usize = 32;

/// Generate an opaque token from the OS CSPRNG.
pub fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Short prefix of a token, safe for logs.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}…")
}

/// Issues, resolves, and consumes access links.
///
/// All link writes go through one async lock. Callers that must resolve and
/// consume atomically (session start) hold [`LinkRegistry::write_guard`]
/// across both steps.
pub struct LinkRegistry {
    db: Arc<dyn Database>,
    default_ttl: Option<TimeDelta>,
    write_lock: Mutex<()>,
}

impl LinkRegistry {
    pub fn new(db: Arc<dyn Database>, default_ttl: Option<TimeDelta>) -> Self {
        Self {
            db,
            default_ttl,
            write_lock: Mutex::new(()),
        }
    }

    /// Acquire the link write lock.
    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Return the client's active link, or issue a new one.
    ///
    /// An active link whose `expires_at` has passed is retired as `expired`
    /// first. `expires_at` falls back to the configured TTL.
    pub async fn issue(
        &self,
        client_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Link, IntakeError> {
        let _guard = self.write_guard().await;
        let now = Utc::now();

        if let Some(existing) = self.db.get_active_link_for_client(client_id).await? {
            if !existing.is_expired_at(now) {
                debug!(client_id, link_id = %existing.id, "Returning existing active link");
                return Ok(existing);
            }
            self.db.mark_link_expired(existing.id).await?;
            info!(client_id, link_id = %existing.id, "Retired lapsed link");
        }

        let expires_at = expires_at.or_else(|| self.default_ttl.map(|ttl| now + ttl));
        let link = Link::new(client_id, generate_token(), expires_at);
        self.db.insert_link(&link).await?;

        info!(
            client_id,
            link_id = %link.id,
            token = %redact_token(&link.token),
            "Issued intake link"
        );
        Ok(link)
    }

    /// Look up a link that can still start a session.
    ///
    /// Unknown, used, and expired tokens all fail with `LinkNotFound`.
    /// Read-only.
    pub async fn resolve(&self, token: &str) -> Result<Link, IntakeError> {
        let Some(link) = self.db.get_link_by_token(token).await? else {
            info!(token = %redact_token(token), "Token not found");
            return Err(IntakeError::LinkNotFound);
        };

        if !link.is_usable_at(Utc::now()) {
            info!(
                token = %redact_token(token),
                link_id = %link.id,
                status = %link.status,
                expires_at = ?link.expires_at,
                "Token not usable"
            );
            return Err(IntakeError::LinkNotFound);
        }

        Ok(link)
    }

    /// `active → used`. A no-op on a link that is no longer active.
    pub async fn mark_used(&self, token: &str) -> Result<(), IntakeError> {
        if !self.db.mark_link_used(token).await? {
            debug!(token = %redact_token(token), "Link already consumed");
        }
        Ok(())
    }
}
