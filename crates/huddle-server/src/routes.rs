use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, error};
use uuid::Uuid;

use huddle_db::Database;
use huddle_gateway::Dispatcher;
use huddle_types::api::{MessageWindow, SendMessageRequest, UpsertProfileRequest};
use huddle_types::models::{Message, MessageRecord};

/// Largest window a single history request may ask for.
const MAX_WINDOW: u32 = 200;

pub struct AppStateInner {
    pub db: Database,
    pub dispatcher: Dispatcher,
}

pub type AppState = Arc<AppStateInner>;

/// Run blocking DB work off the async runtime.
async fn blocking<F, T>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> Result<T, StatusCode> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
}

fn internal(e: anyhow::Error) -> StatusCode {
    error!("storage error: {:#}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

// -- Messages --

pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(window): Query<MessageWindow>,
) -> Result<impl IntoResponse, StatusCode> {
    if window.to < window.from || window.to - window.from >= MAX_WINDOW {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.clone();
    let messages = blocking(move || {
        db.db
            .get_messages(&room_id, window.from, window.to)
            .map_err(internal)?
            .into_iter()
            .map(|row| row.into_message().map_err(internal))
            .collect::<Result<Vec<Message>, StatusCode>>()
    })
    .await?;

    Ok(Json(messages))
}

/// Persist a client-built message and announce it on the room's change-feed.
/// A repeated id is rejected with 409 and not announced again.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let record = MessageRecord {
        id: req.id,
        room_id,
        sender_id: req.sender_id,
        content: content.to_string(),
        created_at: req.created_at,
    };

    let db = state.clone();
    let row = record.clone();
    let inserted = blocking(move || db.db.insert_message(&row).map_err(internal)).await?;
    if !inserted {
        debug!(message_id = %record.id, "duplicate message id rejected");
        return Err(StatusCode::CONFLICT);
    }

    state.dispatcher.publish_insert(record.clone());
    Ok((StatusCode::CREATED, Json(record)))
}

// -- Profiles --

pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.clone();
    let row = blocking(move || db.db.get_profile(&user_id).map_err(internal)).await?;
    let author = row
        .ok_or(StatusCode::NOT_FOUND)?
        .into_author()
        .map_err(internal)?;
    Ok(Json(author))
}

pub async fn upsert_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpsertProfileRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.clone();
    let author = blocking(move || {
        db.db
            .upsert_profile(&user_id, &display_name, req.avatar_ref.as_deref())
            .map_err(internal)?;
        db.db
            .get_profile(&user_id)
            .map_err(internal)?
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
            .into_author()
            .map_err(internal)
    })
    .await?;

    Ok(Json(author))
}
