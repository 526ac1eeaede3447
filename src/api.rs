//! REST API server for the voice banking orchestrator
//!
//! Exposes the dialogue loop via HTTP endpoints
//! Integrates with the voice frontend

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::accounts::{
    populate_demo_data, AccountStore, DEMO_CURRENT_ACCOUNT, DEMO_SAVINGS_ACCOUNT,
};
use crate::config::OrchestratorConfig;
use crate::models::TurnRequest;
use crate::orchestrator::{DialogueOrchestrator, APOLOGY_TEXT};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ConverseRequest {
    pub session_id: String,
    pub user_id: Option<String>,
    pub utterance: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PopulateRequest {
    pub username: Option<String>,
    #[serde(default = "default_transaction_count")]
    pub num_transactions: usize,
}

fn default_transaction_count() -> usize {
    10
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<DialogueOrchestrator>,
    pub accounts: Arc<dyn AccountStore>,
    pub config: OrchestratorConfig,
}

/// =============================
/// Helpers
/// =============================

/// Demo identity for the populate endpoint. A provided username maps to a
/// deterministic local user id, anything else falls back to the configured
/// deployment identity.
fn demo_user_id(username: Option<&str>, fallback: &str) -> String {
    match username {
        Some(name) if !name.trim().is_empty() => {
            format!("local_user_{}", name.trim().to_lowercase().replace(' ', "_"))
        }
        _ => fallback.to_string(),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Converse Endpoint
/// =============================

async fn converse(
    State(state): State<ApiState>,
    Json(req): Json<ConverseRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let request = TurnRequest {
        session_id: req.session_id,
        user_id: req.user_id.unwrap_or_else(|| state.config.user_id.clone()),
        utterance: req.utterance,
        language: req.language,
    };
    info!("Received converse request for session {}", request.session_id);

    match state.orchestrator.handle_turn(&request).await {
        Ok(reply) => (StatusCode::OK, Json(ApiResponse::success(reply))),
        Err(turn_error) => {
            // Infrastructure detail stays in the logs; the caller hears a
            // generic apology.
            error!(
                "Turn failed for session {}: {}",
                request.session_id, turn_error
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(APOLOGY_TEXT.to_string())),
            )
        }
    }
}

/// =============================
/// Demo Data Endpoint
/// =============================

async fn populate(
    State(state): State<ApiState>,
    Json(req): Json<PopulateRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = demo_user_id(req.username.as_deref(), &state.config.user_id);
    info!("Populating demo data for {}", user_id);

    match populate_demo_data(
        state.accounts.as_ref(),
        &user_id,
        &state.config.currency,
        req.num_transactions,
    )
    .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "user_id": user_id,
                "savings_account": DEMO_SAVINGS_ACCOUNT,
                "current_account": DEMO_CURRENT_ACCOUNT,
                "transactions_seeded": req.num_transactions,
            }))),
        ),
        Err(seed_error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!(
                "Demo data population failed: {}",
                seed_error
            ))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/converse", post(converse))
        .route("/api/admin/populate", post(populate))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
