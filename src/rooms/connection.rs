//! One actor per socket: a reader that turns frames into hub/store calls and
//! a writer that drains the connection's mailbox and keeps the socket alive.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use axum::{body::Bytes, extract::ws::Message};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::{
    Oracles,
    config::ConnectionLimits,
    hub::{ConnId, DeliveryError, HubHandle, Inbox, Outbox, mailbox},
    protocol::ServerEnvelope,
    store::{RoomId, UserId},
};

use super::msg;

/// Everything a connection needs besides its socket.
#[derive(Clone)]
pub struct Services {
    pub hub: HubHandle,
    pub oracles: Oracles,
    pub limits: ConnectionLimits,
}

pub(crate) struct Connection {
    pub(crate) id: ConnId,
    pub(crate) user_id: UserId,
    /// Mirror of the hub's subscription; only this connection's reader writes it.
    pub(crate) room: Option<RoomId>,
    outbox: Outbox,
}

impl Connection {
    /// Queues an envelope for this connection alone, bypassing the hub.
    ///
    /// A full mailbox gets the same treatment as in a room broadcast: the
    /// connection is evicted and its reader stops taking commands.
    pub(crate) fn send_private(&self, hub: &HubHandle, envelope: ServerEnvelope) {
        match self.outbox.try_deliver(Arc::new(envelope)) {
            Ok(()) => {}
            Err(DeliveryError::Full) => {
                tracing::warn!(
                    conn = %self.id,
                    user_id = self.user_id,
                    "evicting connection: mailbox full"
                );
                self.outbox.close();
                hub.unregister(self.id);
            }
            Err(DeliveryError::Closed) => {
                tracing::debug!(conn = %self.id, "dropping private envelope: mailbox closed");
            }
        }
    }

    /// Set once the hub or this connection has given up on the mailbox.
    pub(crate) fn is_evicted(&self) -> bool {
        self.outbox.is_closed()
    }
}

/// Runs a connection until either half of the socket gives up.
///
/// Registers with the hub, spawns the writer, reads on the current task and
/// then unregisters. Returns only after both loops have exited.
pub async fn serve<R, W, E>(services: Services, user_id: UserId, stream: R, mut sink: W)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display,
{
    let limits = services.limits;
    let (outbox, inbox) = mailbox(limits.mailbox_capacity);
    let mut conn = Connection {
        id: ConnId::new(),
        user_id,
        room: None,
        outbox,
    };

    if let Err(e) = services
        .hub
        .register(conn.id, conn.user_id.clone(), conn.outbox.clone())
        .await
    {
        tracing::warn!(conn = %conn.id, "could not register connection: {e}");
        let _ = timeout(limits.write_timeout, sink.send(Message::Close(None))).await;
        return;
    }
    tracing::info!(conn = %conn.id, user_id = conn.user_id, "connected");

    let closing = CancellationToken::new();
    let writer = tokio::spawn(write_loop(conn.id, sink, inbox, limits, closing.clone()));

    let read = AssertUnwindSafe(read_loop(stream, &mut conn, &services, &closing))
        .catch_unwind()
        .await;
    if read.is_err() {
        tracing::error!(conn = %conn.id, "reader panicked");
    }

    services.hub.unregister(conn.id);
    conn.outbox.close();

    if let Err(e) = writer.await {
        tracing::error!(conn = %conn.id, "writer task failed: {e}");
    }

    tracing::info!(conn = %conn.id, user_id = conn.user_id, "disconnected");
}

async fn read_loop<R, E>(
    mut stream: R,
    conn: &mut Connection,
    services: &Services,
    closing: &CancellationToken,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let limits = services.limits;
    let mut deadline = Instant::now() + limits.read_timeout;

    loop {
        let next = tokio::select! {
            () = closing.cancelled() => {
                tracing::debug!(conn = %conn.id, "writer stopped; ending reader");
                break;
            }
            next = timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                tracing::info!(
                    conn = %conn.id,
                    "client silent for over {:?}; disconnecting",
                    limits.read_timeout
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(conn = %conn.id, "read failed: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        deadline = Instant::now() + limits.read_timeout;

        match frame {
            Message::Text(text) => {
                if text.len() > limits.max_frame_bytes {
                    tracing::warn!(conn = %conn.id, len = text.len(), "oversized frame");
                    break;
                }
                msg::dispatch(conn, services, text.as_str()).await;
            }
            Message::Binary(bytes) => {
                if bytes.len() > limits.max_frame_bytes {
                    tracing::warn!(conn = %conn.id, len = bytes.len(), "oversized frame");
                    break;
                }
                match std::str::from_utf8(&bytes) {
                    Ok(text) => msg::dispatch(conn, services, text).await,
                    Err(e) => tracing::trace!(conn = %conn.id, "dropping binary frame: {e}"),
                }
            }
            // pongs only refresh the deadline; pings are answered by the transport
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(reason) => {
                tracing::debug!(conn = %conn.id, ?reason, "client closed");
                break;
            }
        }

        if conn.is_evicted() {
            tracing::debug!(conn = %conn.id, "mailbox closed; ending reader");
            break;
        }
    }
}

async fn write_loop<W>(
    conn: ConnId,
    mut sink: W,
    mut inbox: Inbox,
    limits: ConnectionLimits,
    closing: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping = interval_at(Instant::now() + limits.ping_interval, limits.ping_interval);

    loop {
        let frame = tokio::select! {
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else {
                    let _ = timeout(limits.write_timeout, sink.send(Message::Close(None))).await;
                    break;
                };
                match serde_json::to_string(envelope.as_ref()) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!(%conn, "failed to encode envelope: {e}");
                        continue;
                    }
                }
            }
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(limits.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(%conn, "write failed: {e}");
                break;
            }
            Err(_) => {
                tracing::debug!(%conn, "write timed out after {:?}", limits.write_timeout);
                break;
            }
        }
    }

    closing.cancel();
}
