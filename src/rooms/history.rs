use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState, Oracles,
    auth::CurrentUser,
    config::Config,
    store::{Message, MessageId, PageRequest, with_deadline},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryQuery {
    room_id: Option<String>,
    before: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryResponse {
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_before: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    server_time: OffsetDateTime,
}

fn non_empty(x: &Option<String>) -> Option<&str> {
    x.as_deref().map(str::trim).filter(|x| !x.is_empty())
}

/// Newest-first page of a room's history, older than `before` when given.
#[debug_handler(state = AppState)]
pub(crate) async fn list_messages(
    CurrentUser(user_id): CurrentUser,
    State(oracles): State<Oracles>,
    State(config): State<Arc<Config>>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryResponse>> {
    let Some(room_id) = non_empty(&query.room_id) else {
        return Err(AppError::BadRequest("roomId is required".to_owned()));
    };
    let store_timeout = config.connection.store_timeout;

    if !with_deadline(store_timeout, oracles.members.is_member(room_id, &user_id)).await? {
        return Err(AppError::Forbidden);
    }

    let before = match non_empty(&query.before) {
        Some(x) => Some(
            Uuid::parse_str(x).map_err(|_| AppError::BadRequest("invalid cursor".to_owned()))?,
        ),
        None => None,
    };
    let request = PageRequest {
        before,
        limit: config.history.parse(query.limit.as_deref()),
    };

    let page = with_deadline(store_timeout, oracles.messages.list_latest(room_id, request)).await?;

    Ok(Json(HistoryResponse {
        next_before: page.next_cursor,
        messages: page.items,
        server_time: OffsetDateTime::now_utc(),
    }))
}
