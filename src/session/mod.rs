//! Session persistence
//!
//! One record per conversation: the message log plus the single pending
//! action slot. `append_turn` is the only write and lands a whole exchange
//! (user and assistant message sharing one turn id) together with the next
//! pending action in one atomic step, so a session can never hold half a
//! turn.

use crate::error::Result;
use crate::models::{PendingAction, Session, TurnMessage, TurnRole};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresSessionStore;

/// Seam for conversation state persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session. Unknown ids and ids owned by a different user both
    /// come back as a well-formed empty session; absence is not an error.
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Session>;

    /// Append one exchange and replace the stored pending action, as one
    /// atomic write. `pending: None` explicitly clears the slot.
    async fn append_turn(
        &self,
        session_id: &str,
        user_id: &str,
        turn_id: Uuid,
        user_text: &str,
        assistant_text: &str,
        pending: Option<PendingAction>,
    ) -> Result<()>;
}

//
// ================= In-Memory Implementation =================
//

/// In-memory session store for development and tests.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(stored) if stored.user_id == user_id => Ok(stored.clone()),
            Some(_) => {
                warn!(session_id, "Session belongs to another user, treating as absent");
                Ok(Session::empty(session_id, user_id))
            }
            None => Ok(Session::empty(session_id, user_id)),
        }
    }

    async fn append_turn(
        &self,
        session_id: &str,
        user_id: &str,
        turn_id: Uuid,
        user_text: &str,
        assistant_text: &str,
        pending: Option<PendingAction>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::empty(session_id, user_id));

        if session.user_id != user_id {
            warn!(session_id, "Session owner changed, resetting history");
            *session = Session::empty(session_id, user_id);
        }

        session.messages.push(TurnMessage {
            turn_id,
            role: TurnRole::User,
            content: user_text.to_string(),
        });
        session.messages.push(TurnMessage {
            turn_id,
            role: TurnRole::Assistant,
            content: assistant_text.to_string(),
        });
        session.pending_action = pending;
        session.last_updated = Some(Utc::now());
        Ok(())
    }
}
