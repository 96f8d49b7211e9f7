//! Live connection registry and room fan-out.
//!
//! [`Hub`] owns every registration and is the only code that enumerates
//! live connections. It runs as a single task driven by a command queue, so
//! register, unregister, join and broadcast never race on the underlying
//! map. Broadcasts to a room reach its subscribers in the order they were
//! issued.
//!
//! Delivery never blocks the hub: a connection whose mailbox is full is
//! treated as unresponsive and evicted on the spot.

mod mailbox;

use std::{collections::BTreeMap, fmt, sync::Arc};

use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    protocol::ServerEnvelope,
    store::{RoomId, UserId},
};

pub use mailbox::{DeliveryError, Envelope, Inbox, Outbox, mailbox};

/// Identity of one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub is not running")]
    Stopped,
    #[error("connection is not registered")]
    NotRegistered,
}

/// A command processed by the [`Hub`] task.
#[derive(Debug, AsRefStr)]
enum Command {
    /// Adds a connection with no room subscription.
    Register {
        conn: ConnId,
        user_id: UserId,
        outbox: Outbox,
        res_tx: oneshot::Sender<()>,
    },

    /// Removes a connection and closes its mailbox. Unknown ids are ignored.
    Unregister { conn: ConnId },

    /// Replaces a connection's room subscription.
    Join {
        conn: ConnId,
        room: RoomId,
        res_tx: oneshot::Sender<Result<(), HubError>>,
    },

    /// Delivers an envelope to every connection subscribed to `room`.
    Broadcast {
        room: RoomId,
        envelope: Envelope,
        res_tx: oneshot::Sender<usize>,
    },

    /// Counts the connections subscribed to `room`.
    Occupancy {
        room: RoomId,
        res_tx: oneshot::Sender<usize>,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// What the hub knows about a connection: who it is, where it listens and
/// how to reach it. The socket itself stays with the connection.
#[derive(Debug)]
struct Registration {
    user_id: UserId,
    room: Option<RoomId>,
    outbox: Outbox,
}

/// The coordination task. Create with [`Hub::new`] and spawn [`Hub::run`].
#[derive(Debug)]
pub struct Hub {
    connections: BTreeMap<ConnId, Registration>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = HubHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                connections: BTreeMap::new(),
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Spawns a hub on the current runtime and returns its handle.
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    fn register(&mut self, conn: ConnId, user_id: UserId, outbox: Outbox) {
        tracing::debug!(%conn, user_id, "register");
        self.connections.insert(
            conn,
            Registration {
                user_id,
                room: None,
                outbox,
            },
        );
        tracing::debug!("live connections: {}", self.connections.len());
    }

    fn unregister(&mut self, conn: ConnId) {
        if let Some(registration) = self.connections.remove(&conn) {
            registration.outbox.close();
            tracing::debug!(
                %conn,
                user_id = registration.user_id,
                "unregister; live connections: {}",
                self.connections.len()
            );
        }
    }

    fn join(&mut self, conn: ConnId, room: RoomId) -> Result<(), HubError> {
        let registration = self
            .connections
            .get_mut(&conn)
            .ok_or(HubError::NotRegistered)?;
        tracing::debug!(%conn, user_id = registration.user_id, room, "join");
        registration.room = Some(room);
        Ok(())
    }

    fn broadcast(&mut self, room: &str, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut evicted = vec![];

        for (conn, registration) in &self.connections {
            if registration.room.as_deref() != Some(room) {
                continue;
            }
            match registration.outbox.try_deliver(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        %conn,
                        user_id = registration.user_id,
                        room,
                        "evicting connection: {e}"
                    );
                    evicted.push(*conn);
                }
            }
        }

        for conn in evicted {
            self.unregister(conn);
        }

        tracing::trace!(room, delivered, "broadcast");
        delivered
    }

    fn occupancy(&self, room: &str) -> usize {
        self.connections
            .values()
            .filter(|x| x.room.as_deref() == Some(room))
            .count()
    }

    fn process_command(&mut self, cmd: Command) {
        tracing::trace!("process_command: cmd={cmd}");

        match cmd {
            Command::Register {
                conn,
                user_id,
                outbox,
                res_tx,
            } => {
                self.register(conn, user_id, outbox);
                let _ = res_tx.send(());
            }
            Command::Unregister { conn } => self.unregister(conn),
            Command::Join { conn, room, res_tx } => {
                let _ = res_tx.send(self.join(conn, room));
            }
            Command::Broadcast {
                room,
                envelope,
                res_tx,
            } => {
                let _ = res_tx.send(self.broadcast(&room, &envelope));
            }
            Command::Occupancy { room, res_tx } => {
                let _ = res_tx.send(self.occupancy(&room));
            }
        }
    }

    /// Processes commands until cancelled or every handle is dropped, then
    /// closes all remaining mailboxes.
    pub async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                () = self.token.cancelled() => {
                    tracing::debug!("Hub was cancelled");
                    break;
                }
                cmd = self.cmd_rx.recv() => cmd,
            };
            let Some(cmd) = cmd else {
                break;
            };
            self.process_command(cmd);
        }

        for registration in self.connections.values() {
            registration.outbox.close();
        }
        self.connections.clear();
        self.token.cancel();

        tracing::debug!("Stopped Hub");
    }
}

/// Cloneable command sender for the [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl HubHandle {
    fn send(&self, cmd: Command) -> Result<(), HubError> {
        if self.token.is_cancelled() {
            return Err(HubError::Stopped);
        }
        self.cmd_tx.send(cmd).map_err(|_| HubError::Stopped)
    }

    /// Registers a connection; it is live once this returns.
    pub async fn register(
        &self,
        conn: ConnId,
        user_id: UserId,
        outbox: Outbox,
    ) -> Result<(), HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Register {
            conn,
            user_id,
            outbox,
            res_tx,
        })?;
        res_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Removes a connection and closes its mailbox. Idempotent.
    pub fn unregister(&self, conn: ConnId) {
        if self.send(Command::Unregister { conn }).is_err() {
            tracing::trace!(%conn, "unregister after hub stopped");
        }
    }

    /// Subscribes a connection to `room`; the change is in effect once this returns.
    pub async fn join(&self, conn: ConnId, room: RoomId) -> Result<(), HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Join { conn, room, res_tx })?;
        res_rx.await.map_err(|_| HubError::Stopped)?
    }

    /// Fans `envelope` out to the room and returns how many mailboxes took it.
    pub async fn broadcast(
        &self,
        room: RoomId,
        envelope: ServerEnvelope,
    ) -> Result<usize, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Broadcast {
            room,
            envelope: Arc::new(envelope),
            res_tx,
        })?;
        res_rx.await.map_err(|_| HubError::Stopped)
    }

    pub async fn occupancy(&self, room: RoomId) -> Result<usize, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Occupancy { room, res_tx })?;
        res_rx.await.map_err(|_| HubError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.cmd_tx.is_closed()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn text(envelope: &Envelope) -> String {
        match envelope.as_ref() {
            ServerEnvelope::Error { error } => error.clone(),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    async fn connect(
        hub: &HubHandle,
        user: &str,
        room: Option<&str>,
        capacity: usize,
    ) -> (ConnId, Inbox) {
        let (outbox, inbox) = mailbox(capacity);
        let conn = ConnId::new();
        hub.register(conn, user.to_owned(), outbox).await.unwrap();
        if let Some(room) = room {
            hub.join(conn, room.to_owned()).await.unwrap();
        }
        (conn, inbox)
    }

    #[test_log::test(tokio::test)]
    async fn broadcast_reaches_only_the_room_in_issue_order() {
        let hub = Hub::spawn();
        let (_, mut a) = connect(&hub, "a", Some("r1"), 8).await;
        let (_, mut b) = connect(&hub, "b", Some("r1"), 8).await;
        let (_, mut c) = connect(&hub, "c", Some("r2"), 8).await;
        let (_, mut idle) = connect(&hub, "d", None, 8).await;

        for x in ["b1", "b2", "b3"] {
            assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error(x)).await, Ok(2));
        }
        assert_eq!(hub.broadcast("r2".to_owned(), ServerEnvelope::error("other")).await, Ok(1));

        for inbox in [&mut a, &mut b] {
            for expected in ["b1", "b2", "b3"] {
                assert_eq!(text(&inbox.recv().await.unwrap()), expected);
            }
        }
        assert_eq!(text(&c.recv().await.unwrap()), "other");

        hub.shutdown();
        assert_eq!(idle.recv().await, None);
    }

    #[test_log::test(tokio::test)]
    async fn join_moves_a_connection_between_rooms() {
        let hub = Hub::spawn();
        let (conn, mut inbox) = connect(&hub, "a", Some("r1"), 8).await;
        assert_eq!(hub.occupancy("r1".to_owned()).await, Ok(1));

        hub.join(conn, "r2".to_owned()).await.unwrap();
        assert_eq!(hub.occupancy("r1".to_owned()).await, Ok(0));
        assert_eq!(hub.occupancy("r2".to_owned()).await, Ok(1));

        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("old")).await, Ok(0));
        assert_eq!(hub.broadcast("r2".to_owned(), ServerEnvelope::error("new")).await, Ok(1));
        assert_eq!(text(&inbox.recv().await.unwrap()), "new");
    }

    #[test_log::test(tokio::test)]
    async fn join_requires_registration() {
        let hub = Hub::spawn();
        assert_eq!(
            hub.join(ConnId::new(), "r1".to_owned()).await,
            Err(HubError::NotRegistered)
        );
    }

    #[test_log::test(tokio::test)]
    async fn full_mailbox_is_evicted_without_stalling_others() {
        let hub = Hub::spawn();
        let (_, mut slow) = connect(&hub, "slow", Some("r1"), 1).await;
        let (_, mut fast) = connect(&hub, "fast", Some("r1"), 8).await;

        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("one")).await, Ok(2));
        // slow never drained, so this one overflows it
        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("two")).await, Ok(1));
        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("three")).await, Ok(1));
        assert_eq!(hub.occupancy("r1".to_owned()).await, Ok(1));

        assert_eq!(text(&slow.recv().await.unwrap()), "one");
        assert_eq!(slow.recv().await, None);

        for expected in ["one", "two", "three"] {
            assert_eq!(text(&fast.recv().await.unwrap()), expected);
        }
    }

    #[test_log::test(tokio::test)]
    async fn unregister_is_idempotent() {
        let hub = Hub::spawn();
        let (conn, mut inbox) = connect(&hub, "a", Some("r1"), 8).await;

        hub.unregister(conn);
        hub.unregister(conn);
        hub.unregister(ConnId::new());

        assert_eq!(inbox.recv().await, None);
        assert_eq!(hub.occupancy("r1".to_owned()).await, Ok(0));
        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("x")).await, Ok(0));
    }

    #[test_log::test(tokio::test)]
    async fn dropped_receivers_are_pruned_on_broadcast() {
        let hub = Hub::spawn();
        let (_, inbox) = connect(&hub, "gone", Some("r1"), 8).await;
        drop(inbox);

        assert_eq!(hub.broadcast("r1".to_owned(), ServerEnvelope::error("x")).await, Ok(0));
        assert_eq!(hub.occupancy("r1".to_owned()).await, Ok(0));
    }

    #[test_log::test(tokio::test)]
    async fn stopped_hub_rejects_commands() {
        let hub = Hub::spawn();
        let (_, mut inbox) = connect(&hub, "a", Some("r1"), 8).await;
        assert!(hub.is_running());

        hub.shutdown();
        assert!(!hub.is_running());
        assert_eq!(inbox.recv().await, None);

        let (outbox, _inbox) = mailbox(1);
        assert_eq!(
            hub.register(ConnId::new(), "b".to_owned(), outbox).await,
            Err(HubError::Stopped)
        );
        assert_eq!(
            hub.broadcast("r1".to_owned(), ServerEnvelope::error("x")).await,
            Err(HubError::Stopped)
        );
        hub.unregister(ConnId::new());
    }
}
