use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::StreamExt;

use crate::{AppState, Oracles, auth::CurrentUser, config::Config, hub::HubHandle};

use super::connection::{self, Services};

/// Upgrades an authenticated request to a room socket. Requests without a
/// valid session are refused with 401 before the upgrade.
#[debug_handler(state = AppState)]
pub async fn room_ws(
    CurrentUser(user_id): CurrentUser,
    State(hub): State<HubHandle>,
    State(oracles): State<Oracles>,
    State(config): State<Arc<Config>>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let limits = config.connection;
    let services = Services {
        hub,
        oracles,
        limits,
    };

    ws.max_message_size(limits.max_frame_bytes)
        .max_frame_size(limits.max_frame_bytes)
        .on_failed_upgrade(|e| tracing::debug!("websocket upgrade failed: {e}"))
        .on_upgrade(async move |stream| {
            let (sender, receiver) = stream.split();
            connection::serve(services, user_id, receiver, sender).await;
        })
}
