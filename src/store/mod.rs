//! Durable room state: messages, membership, rooms and sessions.
//!
//! The connection layer only sees the [`MessageStore`] and [`Membership`]
//! capabilities; [`SqliteStore`] is the production implementation of both.

mod paging;
mod sqlite;

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub use paging::{HistoryLimits, Page, PageRequest};
pub use sqlite::SqliteStore;

pub type RoomId = String;
pub type UserId = String;
pub type MessageId = Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// A persisted room message.
///
/// Within a room, `(created_at, id)` is a total order; history is read
/// newest-first along it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message, assigning its id and creation time.
    ///
    /// The body is trimmed; an empty body is a [`StoreError::Validation`].
    async fn insert(&self, room: &str, sender: &str, body: &str) -> Result<Message, StoreError>;

    /// Newest-first page of a room's messages, strictly older than the
    /// cursor when one is given.
    async fn list_latest(
        &self,
        room: &str,
        request: PageRequest,
    ) -> Result<Page<Message>, StoreError>;
}

#[async_trait]
pub trait Membership: Send + Sync {
    async fn is_member(&self, room: &str, user: &str) -> Result<bool, StoreError>;
}

/// Bounds a dependency call so a stalled store cannot wedge its caller.
pub async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

pub(crate) fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

pub(crate) fn from_micros(micros: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn micros_round_trip_truncates_nanos() {
        let at = datetime!(2024-05-01 12:30:45.123456789 UTC);
        let back = from_micros(to_micros(at)).unwrap();
        assert_eq!(back, datetime!(2024-05-01 12:30:45.123456 UTC));
    }

    #[test_log::test(tokio::test)]
    async fn with_deadline_reports_timeout() {
        let limit = Duration::from_millis(20);
        let result: Result<(), _> = with_deadline(limit, std::future::pending()).await;
        assert!(matches!(result, Err(StoreError::Timeout(d)) if d == limit));
    }

    #[test]
    fn message_serializes_camel_case_rfc3339() {
        let message = Message {
            id: Uuid::nil(),
            room_id: "r1".to_owned(),
            sender_id: "u1".to_owned(),
            sender_name: None,
            body: "hi".to_owned(),
            created_at: datetime!(2024-01-02 03:04:05 UTC),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "00000000-0000-0000-0000-000000000000",
                "roomId": "r1",
                "senderId": "u1",
                "body": "hi",
                "createdAt": "2024-01-02T03:04:05Z",
            })
        );
    }
}
