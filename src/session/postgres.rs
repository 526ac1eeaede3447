//! Postgres-backed session store
//!
//! Sessions live in two tables: a `sessions` row per conversation holding
//! the owner and the pending action as JSONB, and an append-only
//! `session_messages` log ordered by a sequence column. `append_turn` runs
//! in a transaction and takes a row lock on the session, which serializes
//! concurrent appends to the same conversation at the database too.

use crate::error::{OrchestratorError, Result};
use crate::models::{PendingAction, Session, TurnMessage, TurnRole};
use crate::session::SessionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        SCHEMA_READY
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sessions (
                        session_id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        pending_action JSONB,
                        last_updated TIMESTAMPTZ NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::SessionStore(format!("Failed to create sessions table: {}", e))
                })?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS session_messages (
                        seq BIGSERIAL PRIMARY KEY,
                        session_id TEXT NOT NULL,
                        turn_id UUID NOT NULL,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::SessionStore(format!(
                        "Failed to create session_messages table: {}",
                        e
                    ))
                })?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_session_messages_session \
                     ON session_messages (session_id, seq)",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::SessionStore(format!("Failed to create index: {}", e))
                })?;

                info!("Session schema ready");
                Ok::<(), OrchestratorError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Session> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT user_id, pending_action, last_updated FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestratorError::SessionStore(format!("Session read failed: {}", e)))?;

        let Some(row) = row else {
            return Ok(Session::empty(session_id, user_id));
        };

        let owner: String = row.get("user_id");
        if owner != user_id {
            warn!(session_id, "Session belongs to another user, treating as absent");
            return Ok(Session::empty(session_id, user_id));
        }

        let pending_action = match row.get::<Option<serde_json::Value>, _>("pending_action") {
            Some(value) => match serde_json::from_value::<PendingAction>(value) {
                Ok(pending) => Some(pending),
                Err(error) => {
                    warn!(session_id, %error, "Dropping unreadable pending action");
                    None
                }
            },
            None => None,
        };
        let last_updated: DateTime<Utc> = row.get("last_updated");

        let message_rows = sqlx::query(
            "SELECT turn_id, role, content FROM session_messages \
             WHERE session_id = $1 ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::SessionStore(format!("Message read failed: {}", e)))?;

        let messages = message_rows
            .iter()
            .map(|row| TurnMessage {
                turn_id: row.get("turn_id"),
                role: role_from_db(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
            })
            .collect();

        Ok(Session {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            messages,
            pending_action,
            last_updated: Some(last_updated),
        })
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
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::SessionStore(format!("Failed to open transaction: {}", e))
        })?;

        let now = Utc::now();

        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, pending_action, last_updated) \
             VALUES ($1, $2, NULL, $3) ON CONFLICT (session_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::SessionStore(format!("Session upsert failed: {}", e)))?;

        // Row lock serializes concurrent appends on the same session.
        let owner: String =
            sqlx::query_scalar("SELECT user_id FROM sessions WHERE session_id = $1 FOR UPDATE")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    OrchestratorError::SessionStore(format!("Session lock failed: {}", e))
                })?;

        if owner != user_id {
            warn!(session_id, "Session owner changed, resetting history");
            sqlx::query("DELETE FROM session_messages WHERE session_id = $1")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    OrchestratorError::SessionStore(format!("History reset failed: {}", e))
                })?;
        }

        let pending_value = pending.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            "UPDATE sessions SET user_id = $2, pending_action = $3, last_updated = $4 \
             WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(pending_value)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::SessionStore(format!("Session update failed: {}", e)))?;

        sqlx::query(
            "INSERT INTO session_messages (session_id, turn_id, role, content) \
             VALUES ($1, $2, 'user', $3), ($1, $2, 'assistant', $4)",
        )
        .bind(session_id)
        .bind(turn_id)
        .bind(user_text)
        .bind(assistant_text)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::SessionStore(format!("Message insert failed: {}", e)))?;

        tx.commit().await.map_err(|e| {
            OrchestratorError::SessionStore(format!("Failed to commit turn: {}", e))
        })?;

        Ok(())
    }
}

fn role_from_db(role: &str) -> TurnRole {
    match role {
        "assistant" => TurnRole::Assistant,
        _ => TurnRole::User,
    }
}
