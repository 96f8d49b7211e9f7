use std::sync::Arc;

use axum::{Json, debug_handler, extract::State, http::StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    AppError, AppResult, AppState,
    auth::CurrentUser,
    config::Config,
    store::{Room, SqliteStore, with_deadline},
};

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JoinRoomRequest {
    #[serde(default)]
    room_id: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    CurrentUser(user_id): CurrentUser,
    State(db): State<SqliteStore>,
    State(config): State<Arc<Config>>,

    Json(NewRoomRequest { name }): Json<NewRoomRequest>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let room =
        with_deadline(config.connection.store_timeout, db.create_room(&name, &user_id)).await?;
    tracing::info!(room = room.id, user_id, "room created");

    Ok((StatusCode::CREATED, Json(room)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_rooms(
    CurrentUser(user_id): CurrentUser,
    State(db): State<SqliteStore>,
    State(config): State<Arc<Config>>,
) -> AppResult<Json<Value>> {
    let rooms = with_deadline(config.connection.store_timeout, db.rooms_for_user(&user_id)).await?;
    Ok(Json(json!({ "rooms": rooms })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn join_room(
    CurrentUser(user_id): CurrentUser,
    State(db): State<SqliteStore>,
    State(config): State<Arc<Config>>,

    Json(JoinRoomRequest { room_id }): Json<JoinRoomRequest>,
) -> AppResult<Json<Value>> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(AppError::BadRequest("roomId required".to_owned()));
    }

    with_deadline(config.connection.store_timeout, db.add_member(room_id, &user_id)).await?;
    tracing::debug!(room = room_id, user_id, "member added");

    Ok(Json(json!({ "status": "ok" })))
}
