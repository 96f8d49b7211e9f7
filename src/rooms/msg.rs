use thiserror::Error;

use crate::{
    hub::HubError,
    protocol::{ClientEnvelope, ServerEnvelope},
    store::{StoreError, with_deadline},
};

use super::connection::{Connection, Services};

/// Why a client command was refused. Reported to that client only; the
/// Display text is the `error` field of the envelope.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("room required")]
    RoomRequired,
    #[error("join a room first")]
    NoRoom,
    #[error("forbidden")]
    Forbidden,
    #[error("could not save message")]
    SaveFailed(#[source] StoreError),
    #[error("unavailable")]
    Unavailable(#[source] StoreError),
    #[error("unavailable")]
    Hub(#[from] HubError),
}

struct SendMessage {
    room: Option<String>,
    text: String,
    client_message_id: Option<String>,
}

/// Decodes and handles one text frame. Undecodable frames are dropped.
pub(crate) async fn dispatch(conn: &mut Connection, services: &Services, frame: &str) {
    let envelope = match serde_json::from_str::<ClientEnvelope>(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::trace!(conn = %conn.id, "dropping malformed frame: {e}");
            return;
        }
    };

    let result = match envelope {
        ClientEnvelope::Join { room } => join(conn, services, &room).await,
        ClientEnvelope::Message {
            room,
            text,
            client_message_id,
        } => {
            send_msg(
                conn,
                services,
                SendMessage {
                    room,
                    text,
                    client_message_id,
                },
            )
            .await
        }
    };

    if let Err(e) = result {
        tracing::debug!(conn = %conn.id, user_id = conn.user_id, "command refused: {e:?}");
        conn.send_private(&services.hub, ServerEnvelope::error(&e));
    }
}

async fn authorize(conn: &Connection, services: &Services, room: &str) -> Result<(), ChatError> {
    let is_member = with_deadline(
        services.limits.store_timeout,
        services.oracles.members.is_member(room, &conn.user_id),
    )
    .await
    .map_err(ChatError::Unavailable)?;

    if !is_member {
        return Err(ChatError::Forbidden);
    }
    Ok(())
}

async fn join(conn: &mut Connection, services: &Services, room: &str) -> Result<(), ChatError> {
    let room = room.trim();
    if room.is_empty() {
        return Err(ChatError::RoomRequired);
    }

    authorize(conn, services, room).await?;

    services.hub.join(conn.id, room.to_owned()).await?;
    conn.room = Some(room.to_owned());

    Ok(())
}

/// Persists a message, then broadcasts the stored copy to its room.
async fn send_msg(
    conn: &Connection,
    services: &Services,
    SendMessage {
        room,
        text,
        client_message_id,
    }: SendMessage,
) -> Result<(), ChatError> {
    let room = match room.as_deref().map(str::trim).filter(|x| !x.is_empty()) {
        Some(room) => room.to_owned(),
        None => conn.room.clone().ok_or(ChatError::NoRoom)?,
    };

    // membership can change after join, so every message is checked
    authorize(conn, services, &room).await?;

    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    let message = with_deadline(
        services.limits.store_timeout,
        services.oracles.messages.insert(&room, &conn.user_id, text),
    )
    .await
    .map_err(ChatError::SaveFailed)?;

    tracing::debug!(conn = %conn.id, room, message_id = %message.id, "message saved");

    services
        .hub
        .broadcast(room, ServerEnvelope::message(&message))
        .await?;

    if let Some(client_message_id) = client_message_id.filter(|x| !x.is_empty()) {
        conn.send_private(&services.hub, ServerEnvelope::ack(client_message_id, &message));
    }

    Ok(())
}
