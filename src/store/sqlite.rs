use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{AuthError, Authenticator},
    res::SCHEMA,
};

use super::{
    Membership, Message, MessageStore, Page, PageRequest, Room, StoreError, UserId, from_micros,
    to_micros,
};

type MessageRow = (String, String, String, String, i64, Option<String>);

type RoomRow = (
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
);

/// SQLite-backed messages, rooms, membership and session lookup.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let db_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;
        Ok(Self::new(db_pool))
    }

    /// A private in-memory database; a single pooled connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(db_pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.db_pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub async fn save_user(&self, user_id: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id,name) VALUES (?,?)
            ON CONFLICT (id) DO UPDATE SET name=excluded.name",
        )
            .bind(user_id)
            .bind(name)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    pub async fn save_session(
        &self,
        token: &str,
        user_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if token.is_empty() || user_id.is_empty() {
            return Err(StoreError::Validation("token and user id required"));
        }

        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64;
        sqlx::query(
            "INSERT INTO sessions (token,user_id,expires_at) VALUES (?,?,?)
            ON CONFLICT (token) DO UPDATE
            SET user_id=excluded.user_id, expires_at=excluded.expires_at",
        )
            .bind(token)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE token=?")
            .bind(token)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// Creates a room and makes its creator the first member.
    pub async fn create_room(&self, name: &str, created_by: &str) -> Result<Room, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("name required"));
        }

        let id = Uuid::now_v7().to_string();
        let created_at = OffsetDateTime::now_utc();
        let micros = to_micros(created_at);

        let mut tx = self.db_pool.begin().await?;
        let inserted =
            sqlx::query("INSERT INTO rooms (id,name,created_by,created_at) VALUES (?,?,?,?)")
            .bind(&id)
            .bind(name)
            .bind(created_by)
            .bind(micros)
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::Conflict("room name already exists"));
            }
            Err(e) => return Err(e.into()),
        }
        sqlx::query("INSERT OR IGNORE INTO room_members (room_id,user_id) VALUES (?,?)")
            .bind(&id)
            .bind(created_by)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Room {
            id,
            name: name.to_owned(),
            created_by: created_by.to_owned(),
            created_at: from_micros(micros)?,
            last_message: None,
        })
    }

    pub async fn add_member(&self, room: &str, user: &str) -> Result<(), StoreError> {
        if sqlx::query("SELECT 1 FROM rooms WHERE id=?")
            .bind(room)
            .fetch_optional(&self.db_pool)
            .await?
            .is_none()
        {
            return Err(StoreError::NotFound("room not found"));
        }

        sqlx::query("INSERT OR IGNORE INTO room_members (room_id,user_id) VALUES (?,?)")
            .bind(room)
            .bind(user)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// Rooms the user belongs to, most recently active first.
    pub async fn rooms_for_user(&self, user: &str) -> Result<Vec<Room>, StoreError> {
        let rows: Vec<RoomRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.name, r.created_by, r.created_at,
                lm.id, lm.sender_id, lm.body, lm.created_at, u.name
            FROM rooms r
            JOIN room_members rm ON rm.room_id = r.id
            LEFT JOIN messages lm ON lm.id = (
                SELECT id FROM messages
                WHERE room_id = r.id
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            )
            LEFT JOIN users u ON u.id = lm.sender_id
            WHERE rm.user_id = ?
            ORDER BY COALESCE(lm.created_at, r.created_at) DESC, r.id DESC
            "#,
        )
        .bind(user)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let (
                    id,
                    name,
                    created_by,
                    created_at,
                    last_id,
                    sender_id,
                    body,
                    sent_at,
                    sender_name,
                ) = row;
                let last_message = match (last_id, sender_id, body, sent_at) {
                    (Some(last_id), Some(sender_id), Some(body), Some(sent_at)) => Some(Message {
                        id: parse_id(&last_id)?,
                        room_id: id.clone(),
                        sender_id,
                        sender_name,
                        body,
                        created_at: from_micros(sent_at)?,
                    }),
                    _ => None,
                };
                Ok(Room {
                    id,
                    name,
                    created_by,
                    created_at: from_micros(created_at)?,
                    last_message,
                })
            })
            .collect()
    }

    async fn insert_at(
        &self,
        room: &str,
        sender: &str,
        body: &str,
        created_at: OffsetDateTime,
    ) -> Result<Message, StoreError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(StoreError::Validation("body required"));
        }

        let id = Uuid::now_v7();
        let micros = to_micros(created_at);
        sqlx::query(
            "INSERT INTO messages (id,room_id,sender_id,body,created_at) VALUES (?,?,?,?,?)",
        )
            .bind(id.to_string())
            .bind(room)
            .bind(sender)
            .bind(body)
            .bind(micros)
            .execute(&self.db_pool)
            .await?;

        Ok(Message {
            id,
            room_id: room.to_owned(),
            sender_id: sender.to_owned(),
            sender_name: None,
            body: body.to_owned(),
            created_at: from_micros(micros)?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, room: &str, sender: &str, body: &str) -> Result<Message, StoreError> {
        self.insert_at(room, sender, body, OffsetDateTime::now_utc()).await
    }

    async fn list_latest(
        &self,
        room: &str,
        request: PageRequest,
    ) -> Result<Page<Message>, StoreError> {
        let limit = i64::from(request.limit.max(1));

        let rows: Vec<MessageRow> = match request.before {
            None => {
                sqlx::query_as(
                    r#"
                    SELECT m.id, m.room_id, m.sender_id, m.body, m.created_at, u.name
                    FROM messages m
                    LEFT JOIN users u ON u.id = m.sender_id
                    WHERE m.room_id = ?1
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT ?2
                    "#,
                )
                .bind(room)
                .bind(limit)
                .fetch_all(&self.db_pool)
                .await?
            }
            // resolve the cursor to its (created_at, id) key and read strictly older rows
            Some(before) => {
                sqlx::query_as(
                    r#"
                    WITH cursor AS (
                        SELECT created_at, id
                        FROM messages
                        WHERE id = ?2 AND room_id = ?1
                    )
                    SELECT m.id, m.room_id, m.sender_id, m.body, m.created_at, u.name
                    FROM messages m
                    JOIN cursor c
                    LEFT JOIN users u ON u.id = m.sender_id
                    WHERE m.room_id = ?1
                        AND (
                            m.created_at < c.created_at
                            OR (m.created_at = c.created_at AND m.id < c.id)
                        )
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT ?3
                    "#,
                )
                .bind(room)
                .bind(before.to_string())
                .bind(limit)
                .fetch_all(&self.db_pool)
                .await?
            }
        };

        let items = rows
            .into_iter()
            .map(|(id, room_id, sender_id, body, created_at, sender_name)| {
                Ok(Message {
                    id: parse_id(&id)?,
                    room_id,
                    sender_id,
                    sender_name,
                    body,
                    created_at: from_micros(created_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Page::new(items))
    }
}

#[async_trait]
impl Membership for SqliteStore {
    async fn is_member(&self, room: &str, user: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id=? AND user_id=?)",
        )
        .bind(room)
        .bind(user)
        .fetch_one(&self.db_pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Authenticator for SqliteStore {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthorized);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let user: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE token=? AND expires_at>?")
                .bind(token)
                .bind(now)
                .fetch_optional(&self.db_pool)
                .await
                .map_err(StoreError::from)?;

        match user {
            Some((user_id,)) if !user_id.is_empty() => Ok(user_id),
            _ => Err(AuthError::Unauthorized),
        }
    }
}

fn parse_id(id: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(id).map_err(|e| StoreError::Corrupt(format!("message id {id}: {e}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use super::*;

    async fn store_with_room() -> (SqliteStore, String) {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_user("alice", "Alice").await.unwrap();
        store.save_user("bob", "Bob").await.unwrap();
        let room = store.create_room("general", "alice").await.unwrap();
        (store, room.id)
    }

    fn ids(page: &Page<Message>) -> Vec<Uuid> {
        page.items.iter().map(|x| x.id).collect()
    }

    #[test_log::test(tokio::test)]
    async fn insert_trims_and_rejects_empty_bodies() {
        let (store, room) = store_with_room().await;

        let message = store.insert(&room, "alice", "  hello \n").await.unwrap();
        assert_eq!(message.body, "hello");
        assert_eq!(message.room_id, room);

        let err = store.insert(&room, "alice", "   ").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation("body required")));
    }

    #[test_log::test(tokio::test)]
    async fn latest_is_newest_first_with_sender_names() {
        let (store, room) = store_with_room().await;
        let first = store.insert(&room, "alice", "one").await.unwrap();
        let second = store.insert(&room, "bob", "two").await.unwrap();

        let page = store.list_latest(&room, PageRequest::latest(10)).await.unwrap();
        assert_eq!(ids(&page), vec![second.id, first.id]);
        assert_eq!(page.items[0].sender_name.as_deref(), Some("Bob"));
        assert_eq!(page.next_cursor, Some(first.id));
    }

    #[test_log::test(tokio::test)]
    async fn identical_timestamps_are_ordered_by_id() {
        let (store, room) = store_with_room().await;
        let at = datetime!(2024-03-01 10:00:00 UTC);

        let mut inserted = vec![];
        for body in ["a", "b", "c", "d", "e"] {
            inserted.push(store.insert_at(&room, "alice", body, at).await.unwrap().id);
        }
        let newest_first: Vec<_> = inserted.iter().rev().copied().collect();

        let first = store.list_latest(&room, PageRequest::latest(2)).await.unwrap();
        assert_eq!(ids(&first), newest_first[..2].to_vec());

        let second = store
            .list_latest(&room, PageRequest::before(first.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(ids(&second), newest_first[2..4].to_vec());

        let third = store
            .list_latest(&room, PageRequest::before(second.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(ids(&third), newest_first[4..].to_vec());

        let done = store
            .list_latest(&room, PageRequest::before(third.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        assert!(done.is_empty());
        assert_eq!(done.next_cursor, None);
    }

    #[test_log::test(tokio::test)]
    async fn older_timestamp_sorts_before_newer_id() {
        let (store, room) = store_with_room().await;
        let newer = store
            .insert_at(&room, "alice", "newer", datetime!(2024-03-01 10:00:01 UTC))
            .await
            .unwrap();
        // inserted later, so its v7 id is larger, but its timestamp is older
        let older = store
            .insert_at(&room, "alice", "older", datetime!(2024-03-01 10:00:00 UTC))
            .await
            .unwrap();

        let page = store.list_latest(&room, PageRequest::latest(10)).await.unwrap();
        assert_eq!(ids(&page), vec![newer.id, older.id]);
    }

    #[test_log::test(tokio::test)]
    async fn cursor_from_another_room_yields_empty_page() {
        let (store, room) = store_with_room().await;
        let other = store.create_room("random", "alice").await.unwrap();
        store.insert(&room, "alice", "here").await.unwrap();
        let elsewhere = store.insert(&other.id, "alice", "there").await.unwrap();

        let page = store
            .list_latest(&room, PageRequest::before(elsewhere.id, 10))
            .await
            .unwrap();
        assert!(page.is_empty());

        let unknown = store
            .list_latest(&room, PageRequest::before(Uuid::now_v7(), 10))
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn membership_follows_room_members() {
        let (store, room) = store_with_room().await;
        assert!(store.is_member(&room, "alice").await.unwrap());
        assert!(!store.is_member(&room, "bob").await.unwrap());

        store.add_member(&room, "bob").await.unwrap();
        store.add_member(&room, "bob").await.unwrap();
        assert!(store.is_member(&room, "bob").await.unwrap());

        let err = store.add_member("nope", "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_room_names_conflict() {
        let (store, _) = store_with_room().await;
        let err = store.create_room(" general ", "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store.create_room("  ", "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test_log::test(tokio::test)]
    async fn rooms_are_listed_by_recent_activity() {
        let (store, general) = store_with_room().await;
        let quiet = store.create_room("quiet", "alice").await.unwrap();
        store.create_room("not-mine", "bob").await.unwrap();

        // quiet was created after general, so it leads until general gets a message
        let rooms = store.rooms_for_user("alice").await.unwrap();
        let names: Vec<_> = rooms.iter().map(|x| x.name.as_str()).collect();
        assert_eq!(names, vec!["quiet", "general"]);

        let sent = store.insert(&general, "alice", "wake up").await.unwrap();
        let rooms = store.rooms_for_user("alice").await.unwrap();
        assert_eq!(rooms[0].id, general);
        let last = rooms[0].last_message.as_ref().unwrap();
        assert_eq!(last.id, sent.id);
        assert_eq!(last.sender_name.as_deref(), Some("Alice"));
        assert_eq!(rooms[1].id, quiet.id);
        assert_eq!(rooms[1].last_message, None);
    }

    #[test_log::test(tokio::test)]
    async fn sessions_resolve_until_expired_or_deleted() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_session("tok", "alice", Duration::from_secs(60)).await.unwrap();
        store.save_session("old", "bob", Duration::ZERO).await.unwrap();

        assert_eq!(store.authenticate("tok").await.unwrap(), "alice");
        assert!(matches!(store.authenticate("old").await, Err(AuthError::Unauthorized)));
        assert!(matches!(store.authenticate("").await, Err(AuthError::Unauthorized)));

        store.delete_session("tok").await.unwrap();
        assert!(matches!(store.authenticate("tok").await, Err(AuthError::Unauthorized)));
    }
}
