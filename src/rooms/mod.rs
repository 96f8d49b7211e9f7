mod connection;
mod history;
mod msg;
mod new;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub use connection::{Services, serve};
pub use msg::ChatError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(new::list_rooms).post(new::new_room))
        .route("/room/join", post(new::join_room))
        .route("/messages", get(history::list_messages))
        .route("/ws", get(ws::room_ws))
}
