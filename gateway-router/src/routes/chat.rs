use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{Duration, Utc};
use common::storage::types::{
    chat_message::{ChatMessage, MessageRole},
    chat_session::ChatSession,
    user::User,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::{error::GatewayError, state::GatewayState};

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Resolve or create the session, persist the user turn.
async fn persist_user_turn(
    state: &GatewayState,
    user: &User,
    body: &ChatMessageBody,
) -> Result<String, GatewayError> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(GatewayError::ValidationError(
            "Message must not be empty".to_string(),
        ));
    }

    let session_id = match &body.session_id {
        Some(session_id) => {
            ChatSession::get_owned(session_id, &user.id, &state.db).await?;
            ChatSession::touch(session_id, &state.db).await?;
            session_id.clone()
        }
        None => {
            let session = ChatSession::new(user.id.clone(), message);
            let session_id = session.id.clone();
            state
                .db
                .store_item(session)
                .await
                .map_err(common::error::AppError::Database)?;
            session_id
        }
    };

    let turn = ChatMessage::new(
        session_id.clone(),
        user.id.clone(),
        MessageRole::User,
        message.to_string(),
    );
    state
        .db
        .store_item(turn)
        .await
        .map_err(common::error::AppError::Database)?;

    Ok(session_id)
}

/// Accept a chat turn; the assistant reply arrives via polling or the
/// streaming endpoint.
pub async fn post_message(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Json(body): Json<ChatMessageBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let session_id = persist_user_turn(&state, &user, &body).await?;

    state
        .worker
        .dispatch_chat(&user.id, &session_id, body.message.trim())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "session_id": session_id })),
    ))
}

/// Proxy the worker's SSE stream back to the client unchanged.
pub async fn stream_message(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Json(body): Json<ChatMessageBody>,
) -> Result<Response, GatewayError> {
    let session_id = persist_user_turn(&state, &user, &body).await?;

    let upstream = state
        .worker
        .stream_chat(&user.id, &session_id, body.message.trim())
        .await?;

    let stream = upstream
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|err| GatewayError::InternalError(err.to_string()))?;

    Ok(response)
}

/// Sessions grouped by recency: today, the previous seven days, earlier.
pub async fn list_sessions(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse, GatewayError> {
    let sessions = ChatSession::list_for_user(&user.id, &state.db).await?;

    let now = Utc::now();
    let today_start = now.date_naive().and_hms_opt(0, 0, 0).map_or(now, |dt| {
        chrono::DateTime::from_naive_utc_and_offset(dt, Utc)
    });
    let week_start = today_start - Duration::days(7);

    let mut today = Vec::new();
    let mut last_7_days = Vec::new();
    let mut earlier = Vec::new();

    for session in &sessions {
        let entry = json!({
            "session_id": session.id,
            "title": session.title,
            "updated_at": session.updated_at,
        });
        if session.updated_at >= today_start {
            today.push(entry);
        } else if session.updated_at >= week_start {
            last_7_days.push(entry);
        } else {
            earlier.push(entry);
        }
    }

    Ok(Json(json!({
        "today": today,
        "last_7_days": last_7_days,
        "earlier": earlier,
    })))
}

pub async fn session_messages(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let (_session, messages) =
        ChatSession::get_complete_session(&session_id, &user.id, &state.db).await?;

    let body: Vec<_> = messages
        .iter()
        .map(|message| {
            json!({
                "message_id": message.id,
                "role": match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                "content": message.content,
                "created_at": message.created_at,
            })
        })
        .collect();

    Ok(Json(body))
}

pub async fn delete_session(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    ChatSession::delete_with_messages(&session_id, &user.id, &state.db).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn delete_message(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(message_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    ChatMessage::delete_owned(&message_id, &user.id, &state.db).await?;
    Ok(Json(json!({ "success": true })))
}
