use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;
use uuid::Uuid;

use parley_types::api::{
    Claims, ConversationSummary, CreateConversationRequest, CreateConversationResponse,
    MessageHistoryResponse, SendMessageRequest,
};
use parley_types::models::MessageContent;

use crate::AppState;
use crate::error::ApiError;

/// 201 when the pair had no conversation yet, 200 when it already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation, created) = state
        .chat
        .create_or_get_conversation(claims.sub, req.other_user_id)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(CreateConversationResponse {
            conversation_id: conversation.id,
            created,
        }),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    Ok(Json(state.chat.list_conversations(claims.sub).await?))
}

/// Persists, then fans out to the room. A client that sees the live event
/// can always find the message in history.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = MessageContent {
        text: req.text,
        image: req.image,
    };
    let message = state
        .chat
        .send_message(conversation_id, claims.sub, content, req.client_id)
        .await?;

    let conversation = state
        .chat
        .authorize_participant(conversation_id, claims.sub)
        .await?;
    state
        .gateway
        .dispatcher
        .announce_message(&conversation, &message)
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Reading history marks the counterpart's messages as seen and tells the
/// room about it.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessageHistoryResponse>, ApiError> {
    let history = state.chat.list_messages(conversation_id, claims.sub).await?;

    if history.newly_seen > 0 {
        debug!(
            "{} read {} message(s) in {}",
            claims.sub, history.newly_seen, conversation_id
        );
        state
            .gateway
            .dispatcher
            .announce_read(conversation_id, claims.sub, history.read_at)
            .await;
    }

    Ok(Json(MessageHistoryResponse {
        messages: history.messages,
        counterpart: history.counterpart,
    }))
}
