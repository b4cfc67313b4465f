//! HTTP front end: `POST /chat` and `GET /health`

use axum::{Json, Router, extract::State, http::StatusCode, routing::get, routing::post};
use clubsdr_agent::{TurnRequest, TurnService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Inbound chat message; `whatsapp_id` is accepted as the conversation key
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default, alias = "whatsapp_id")]
    pub conversation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub name: Option<String>,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(service: Arc<TurnService>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .with_state(service)
}

/// Serve until Ctrl-C
pub async fn serve(bind: &str, service: Arc<TurnService>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "Listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn chat(
    State(service): State<Arc<TurnService>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conversation_id = request.conversation_id.clone();
    match service
        .submit_turn(TurnRequest::new(request.conversation_id, request.message))
        .await
    {
        Ok(reply) => Ok(Json(ChatResponse {
            response: reply.reply,
            name: reply.name,
            plan: reply.plan,
        })),
        Err(e) => {
            tracing::error!(conversation_id, "Turn failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}
