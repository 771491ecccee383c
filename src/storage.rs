//! Embedded store backend using SQLite.
//!
//! Implements the [`SignalStore`] and [`ChatStore`] contracts on a local
//! database and emits the same push events a remote backend would deliver,
//! which makes it the backend used by tests and offline embedding.

use crate::error::{Error, Result};
use crate::models::*;
use crate::store::{ChatStore, SignalStore, StoreEvent};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            events,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                avatar_url TEXT,
                trust_score REAL
            );

            CREATE TABLE IF NOT EXISTS call_signals (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                signal_data TEXT NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT,
                avatar_url TEXT,
                description TEXT,
                direct_key TEXT UNIQUE,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                is_muted INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_read_at INTEGER,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT,
                metadata TEXT NOT NULL,
                read_by TEXT NOT NULL,
                reactions TEXT NOT NULL,
                reply_to_id TEXT,
                is_edited INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                is_forwarded INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                edited_at INTEGER,
                deleted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_signals_receiver ON call_signals(receiver_id);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);
            "#,
        )?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine; events are fire-and-forget push.
        let _ = self.events.send(event);
    }

    fn user_exists(conn: &Connection, user_id: &str) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT user_id FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn require_user(conn: &Connection, user_id: &str) -> Result<()> {
        if Self::user_exists(conn, user_id)? {
            Ok(())
        } else {
            Err(Error::UserNotFound(user_id.to_string()))
        }
    }

    // ========================================================================
    // Row mapping
    // ========================================================================

    fn load_signal(conn: &Connection, id: &str) -> Result<CallSignal> {
        let raw = conn
            .query_row(
                r#"SELECT id, conversation_id, caller_id, receiver_id, call_type, status,
                          signal_data, started_at, ended_at, created_at
                   FROM call_signals WHERE id = ?1"#,
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::SignalNotFound(id.to_string()))?;

        let (id, conversation_id, caller_id, receiver_id, call_type, status, signal_data, started_at, ended_at, created_at) =
            raw;
        Ok(CallSignal {
            id,
            conversation_id,
            caller_id,
            receiver_id,
            call_type: CallType::parse(&call_type)
                .ok_or_else(|| Error::Store(format!("unknown call type: {call_type}")))?,
            status: CallStatus::parse(&status)
                .ok_or_else(|| Error::Store(format!("unknown call status: {status}")))?,
            signal_data: serde_json::from_str(&signal_data)?,
            started_at,
            ended_at,
            created_at,
        })
    }

    fn message_from_raw(raw: RawMessage) -> Result<Message> {
        let (
            id,
            conversation_id,
            sender_id,
            kind,
            content,
            metadata,
            read_by,
            reactions,
            reply_to_id,
            is_edited,
            is_deleted,
            is_pinned,
            is_forwarded,
            created_at,
            edited_at,
            deleted_at,
        ) = raw;
        Ok(Message {
            id,
            conversation_id,
            sender_id,
            kind: MessageKind::parse(&kind)
                .ok_or_else(|| Error::Store(format!("unknown message kind: {kind}")))?,
            content,
            metadata: serde_json::from_str(&metadata)?,
            read_by: serde_json::from_str(&read_by)?,
            reactions: serde_json::from_str(&reactions)?,
            reply_to_id,
            is_edited: is_edited != 0,
            is_deleted: is_deleted != 0,
            is_pinned: is_pinned != 0,
            is_forwarded: is_forwarded != 0,
            created_at,
            edited_at,
            deleted_at,
            sender: None,
        })
    }

    fn load_message(conn: &Connection, id: &str) -> Result<Message> {
        let raw = conn
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
                params![id],
                message_row,
            )
            .optional()?
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
        Self::message_from_raw(raw)
    }

    fn save_message_mutation(conn: &Connection, msg: &Message) -> Result<()> {
        conn.execute(
            r#"UPDATE messages SET content = ?2, read_by = ?3, reactions = ?4, is_edited = ?5,
                      is_deleted = ?6, is_pinned = ?7, edited_at = ?8, deleted_at = ?9
               WHERE id = ?1"#,
            params![
                msg.id,
                msg.content,
                serde_json::to_string(&msg.read_by)?,
                serde_json::to_string(&msg.reactions)?,
                msg.is_edited as i32,
                msg.is_deleted as i32,
                msg.is_pinned as i32,
                msg.edited_at,
                msg.deleted_at,
            ],
        )?;
        Ok(())
    }

    fn load_conversation(conn: &Connection, id: &str, viewer: &str) -> Result<Conversation> {
        let raw = conn
            .query_row(
                "SELECT id, kind, name, avatar_url, description, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))?;
        let (id, kind, name, avatar_url, description, updated_at) = raw;

        let mut stmt = conn.prepare(
            "SELECT user_id, role, is_pinned, is_muted, unread_count, last_read_at FROM participants WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;
        let mut participants = Vec::new();
        for row in rows {
            let (user_id, role, is_pinned, is_muted, unread_count, last_read_at) = row?;
            participants.push(Participant {
                user_id,
                role: ParticipantRole::parse(&role)
                    .ok_or_else(|| Error::Store(format!("unknown role: {role}")))?,
                is_pinned: is_pinned != 0,
                is_muted: is_muted != 0,
                unread_count: unread_count as i32,
                last_read_at,
            });
        }

        let last_raw = conn
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"),
                params![id],
                message_row,
            )
            .optional()?;
        let last_message = match last_raw {
            Some(raw) => Some(Self::message_from_raw(raw)?),
            None => None,
        };

        let unread_count = participants
            .iter()
            .find(|p| p.user_id == viewer)
            .map(|p| p.unread_count)
            .unwrap_or(0);

        Ok(Conversation {
            id,
            kind: ConversationKind::parse(&kind)
                .ok_or_else(|| Error::Store(format!("unknown conversation kind: {kind}")))?,
            name,
            avatar_url,
            description,
            updated_at,
            last_message,
            participants,
            unread_count,
        })
    }
}

type RawMessage = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

const MESSAGE_COLUMNS: &str = r#"SELECT id, conversation_id, sender_id, kind, content, metadata,
       read_by, reactions, reply_to_id, is_edited, is_deleted, is_pinned, is_forwarded,
       created_at, edited_at, deleted_at
FROM messages"#;

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
    ))
}

fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

// ============================================================================
// SignalStore
// ============================================================================

#[async_trait]
impl SignalStore for SqliteStore {
    async fn insert_signal(&self, signal: CallSignal) -> Result<()> {
        if signal.caller_id == signal.receiver_id {
            return Err(Error::InvalidParticipants);
        }
        {
            let conn = self.conn.lock();
            Self::require_user(&conn, &signal.caller_id)?;
            Self::require_user(&conn, &signal.receiver_id)?;
            conn.execute(
                r#"INSERT INTO call_signals
                   (id, conversation_id, caller_id, receiver_id, call_type, status, signal_data,
                    started_at, ended_at, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                params![
                    signal.id,
                    signal.conversation_id,
                    signal.caller_id,
                    signal.receiver_id,
                    signal.call_type.as_str(),
                    signal.status.as_str(),
                    serde_json::to_string(&signal.signal_data)?,
                    signal.started_at,
                    signal.ended_at,
                    signal.created_at,
                ],
            )?;
        }
        self.emit(StoreEvent::SignalInserted(signal));
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<CallSignal> {
        let conn = self.conn.lock();
        Self::load_signal(&conn, id)
    }

    async fn update_signal_data(&self, id: &str, data: SignalData) -> Result<()> {
        let updated = {
            let conn = self.conn.lock();
            let current = Self::load_signal(&conn, id)?;
            if current.status.is_terminal() {
                return Err(Error::SignalTerminal(id.to_string()));
            }
            // Writers re-read before writing, but two sides can still race
            // between read and write; merging keeps both contributions.
            let merged = SignalData::merge(current.signal_data.clone(), data);
            conn.execute(
                "UPDATE call_signals SET signal_data = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(&merged)?],
            )?;
            CallSignal {
                signal_data: merged,
                ..current
            }
        };
        self.emit(StoreEvent::SignalUpdated(updated));
        Ok(())
    }

    async fn update_signal_status(
        &self,
        id: &str,
        status: CallStatus,
        started_at: Option<i64>,
        ended_at: Option<i64>,
    ) -> Result<CallSignal> {
        let updated = {
            let conn = self.conn.lock();
            let current = Self::load_signal(&conn, id)?;
            if current.status.is_terminal() {
                return Err(Error::SignalTerminal(id.to_string()));
            }
            conn.execute(
                r#"UPDATE call_signals
                   SET status = ?2,
                       started_at = COALESCE(started_at, ?3),
                       ended_at = COALESCE(ended_at, ?4)
                   WHERE id = ?1"#,
                params![id, status.as_str(), started_at, ended_at],
            )?;
            Self::load_signal(&conn, id)?
        };
        self.emit(StoreEvent::SignalUpdated(updated.clone()));
        Ok(updated)
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<StoreEvent> {
        self.subscribe()
    }
}

// ============================================================================
// ChatStore
// ============================================================================

#[async_trait]
impl ChatStore for SqliteStore {
    async fn upsert_user(&self, profile: UserProfile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO users (user_id, display_name, avatar_url, trust_score)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![profile.user_id, profile.display_name, profile.avatar_url, profile.trust_score],
        )?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<UserProfile> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, display_name, avatar_url, trust_score FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_url: row.get(2)?,
                    trust_score: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT c.id FROM conversations c
               JOIN participants p ON p.conversation_id = c.id
               WHERE p.user_id = ?1
               ORDER BY p.is_pinned DESC, c.updated_at DESC"#,
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            conversations.push(Self::load_conversation(&conn, &id, user_id)?);
        }
        Ok(conversations)
    }

    async fn get_or_create_direct(&self, user_id: &str, other_user_id: &str) -> Result<String> {
        if user_id == other_user_id {
            return Err(Error::InvalidParticipants);
        }
        let (id, created) = {
            let mut conn = self.conn.lock();
            Self::require_user(&conn, user_id)?;
            Self::require_user(&conn, other_user_id)?;

            let key = direct_key(user_id, other_user_id);
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    tx.commit()?;
                    (id, false)
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    let now = Utc::now().timestamp_millis();
                    tx.execute(
                        "INSERT INTO conversations (id, kind, direct_key, updated_at) VALUES (?1, 'direct', ?2, ?3)",
                        params![id, key, now],
                    )?;
                    for user in [user_id, other_user_id] {
                        tx.execute(
                            "INSERT INTO participants (conversation_id, user_id, role) VALUES (?1, ?2, 'member')",
                            params![id, user],
                        )?;
                    }
                    tx.commit()?;
                    (id, true)
                }
            }
        };
        if created {
            self.emit(StoreEvent::ParticipantChanged {
                conversation_id: id.clone(),
            });
        }
        Ok(id)
    }

    async fn create_group(&self, creator_id: &str, name: &str, member_ids: &[String]) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut conn = self.conn.lock();
            Self::require_user(&conn, creator_id)?;
            for member in member_ids {
                Self::require_user(&conn, member)?;
            }
            let now = Utc::now().timestamp_millis();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, kind, name, updated_at) VALUES (?1, 'group', ?2, ?3)",
                params![id, name, now],
            )?;
            tx.execute(
                "INSERT INTO participants (conversation_id, user_id, role) VALUES (?1, ?2, 'owner')",
                params![id, creator_id],
            )?;
            for member in member_ids {
                if member == creator_id {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO participants (conversation_id, user_id, role) VALUES (?1, ?2, 'member')",
                    params![id, member],
                )?;
            }
            tx.commit()?;
        }
        self.emit(StoreEvent::ParticipantChanged {
            conversation_id: id.clone(),
        });
        Ok(id)
    }

    async fn set_pinned(&self, conversation_id: &str, user_id: &str, pinned: bool) -> Result<()> {
        {
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE participants SET is_pinned = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id, pinned as i32],
            )?;
            if changed == 0 {
                return Err(Error::ConversationNotFound(conversation_id.to_string()));
            }
        }
        self.emit(StoreEvent::ParticipantChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    async fn set_muted(&self, conversation_id: &str, user_id: &str, muted: bool) -> Result<()> {
        {
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE participants SET is_muted = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id, muted as i32],
            )?;
            if changed == 0 {
                return Err(Error::ConversationNotFound(conversation_id.to_string()));
            }
        }
        self.emit(StoreEvent::ParticipantChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    async fn insert_message(&self, draft: Message) -> Result<Message> {
        let stored = {
            let conn = self.conn.lock();
            let is_participant: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                    params![draft.conversation_id, draft.sender_id],
                    |row| row.get(0),
                )
                .optional()?;
            if is_participant.is_none() {
                return Err(Error::Forbidden(format!(
                    "{} is not a participant of {}",
                    draft.sender_id, draft.conversation_id
                )));
            }

            let mut stored = draft;
            stored.id = uuid::Uuid::new_v4().to_string();
            stored.created_at = Utc::now().timestamp_millis();
            stored.read_by.insert(stored.sender_id.clone());

            conn.execute(
                r#"INSERT INTO messages
                   (id, conversation_id, sender_id, kind, content, metadata, read_by, reactions,
                    reply_to_id, is_edited, is_deleted, is_pinned, is_forwarded, created_at,
                    edited_at, deleted_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
                params![
                    stored.id,
                    stored.conversation_id,
                    stored.sender_id,
                    stored.kind.as_str(),
                    stored.content,
                    serde_json::to_string(&stored.metadata)?,
                    serde_json::to_string(&stored.read_by)?,
                    serde_json::to_string(&stored.reactions)?,
                    stored.reply_to_id,
                    stored.is_edited as i32,
                    stored.is_deleted as i32,
                    stored.is_pinned as i32,
                    stored.is_forwarded as i32,
                    stored.created_at,
                    stored.edited_at,
                    stored.deleted_at,
                ],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![stored.conversation_id, stored.created_at],
            )?;
            conn.execute(
                "UPDATE participants SET unread_count = unread_count + 1 WHERE conversation_id = ?1 AND user_id != ?2",
                params![stored.conversation_id, stored.sender_id],
            )?;
            stored
        };
        self.emit(StoreEvent::MessageInserted(stored.clone()));
        Ok(stored)
    }

    async fn fetch_messages(&self, conversation_id: &str, limit: i64, offset: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_COLUMNS} WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let raws: Vec<RawMessage> = stmt
            .query_map(params![conversation_id, limit, offset], message_row)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(Self::message_from_raw).collect()
    }

    async fn edit_message(&self, actor_id: &str, message_id: &str, content: &str) -> Result<Message> {
        let updated = {
            let conn = self.conn.lock();
            let mut msg = Self::load_message(&conn, message_id)?;
            if msg.sender_id != actor_id {
                return Err(Error::Forbidden("only the sender may edit a message".to_string()));
            }
            if msg.is_deleted {
                return Err(Error::Forbidden("cannot edit a deleted message".to_string()));
            }
            msg.content = Some(content.to_string());
            msg.is_edited = true;
            msg.edited_at = Some(Utc::now().timestamp_millis());
            Self::save_message_mutation(&conn, &msg)?;
            msg
        };
        self.emit(StoreEvent::MessageUpdated(updated.clone()));
        Ok(updated)
    }

    async fn delete_message(&self, actor_id: &str, message_id: &str) -> Result<Message> {
        let updated = {
            let conn = self.conn.lock();
            let mut msg = Self::load_message(&conn, message_id)?;
            if msg.sender_id != actor_id {
                return Err(Error::Forbidden("only the sender may delete a message".to_string()));
            }
            msg.tombstone(Utc::now().timestamp_millis());
            Self::save_message_mutation(&conn, &msg)?;
            msg
        };
        self.emit(StoreEvent::MessageUpdated(updated.clone()));
        Ok(updated)
    }

    async fn toggle_reaction(&self, actor_id: &str, message_id: &str, emoji: &str) -> Result<Message> {
        let updated = {
            let conn = self.conn.lock();
            let mut msg = Self::load_message(&conn, message_id)?;
            msg.toggle_reaction(emoji, actor_id);
            Self::save_message_mutation(&conn, &msg)?;
            msg
        };
        self.emit(StoreEvent::MessageUpdated(updated.clone()));
        Ok(updated)
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE participants SET unread_count = 0, last_read_at = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id, Utc::now().timestamp_millis()],
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, read_by FROM messages WHERE conversation_id = ?1 AND sender_id != ?2",
            )?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![conversation_id, user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            for (id, read_by) in rows {
                let mut readers: std::collections::BTreeSet<String> = serde_json::from_str(&read_by)?;
                if readers.insert(user_id.to_string()) {
                    conn.execute(
                        "UPDATE messages SET read_by = ?2 WHERE id = ?1",
                        params![id, serde_json::to_string(&readers)?],
                    )?;
                }
            }
        }
        self.emit(StoreEvent::ParticipantChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    fn subscribe_chat(&self) -> broadcast::Receiver<StoreEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            store
                .upsert_user(UserProfile {
                    user_id: id.to_string(),
                    display_name: Some(name.to_string()),
                    avatar_url: None,
                    trust_score: Some(1.0),
                })
                .await
                .unwrap();
        }
        store
    }

    fn ringing_signal(id: &str) -> CallSignal {
        CallSignal {
            id: id.to_string(),
            conversation_id: "conv".to_string(),
            caller_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            call_type: CallType::Video,
            status: CallStatus::Ringing,
            signal_data: SignalData::default(),
            started_at: None,
            ended_at: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn direct_conversation_is_idempotent() {
        let store = seeded_store().await;
        let first = store.get_or_create_direct("alice", "bob").await.unwrap();
        let swapped = store.get_or_create_direct("bob", "alice").await.unwrap();
        let again = store.get_or_create_direct("alice", "bob").await.unwrap();
        assert_eq!(first, swapped);
        assert_eq!(first, again);
        assert_eq!(store.list_conversations("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn direct_conversation_rejects_self() {
        let store = seeded_store().await;
        assert!(matches!(
            store.get_or_create_direct("alice", "alice").await,
            Err(Error::InvalidParticipants)
        ));
    }

    #[tokio::test]
    async fn signal_participants_are_validated() {
        let store = seeded_store().await;
        let mut signal = ringing_signal("s1");
        signal.receiver_id = "alice".to_string();
        assert!(matches!(
            store.insert_signal(signal).await,
            Err(Error::InvalidParticipants)
        ));

        let mut signal = ringing_signal("s2");
        signal.receiver_id = "nobody".to_string();
        assert!(matches!(
            store.insert_signal(signal).await,
            Err(Error::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn signal_status_is_monotonic() {
        let store = seeded_store().await;
        store.insert_signal(ringing_signal("s1")).await.unwrap();

        let ended = store
            .update_signal_status("s1", CallStatus::Ended, None, Some(100))
            .await
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.ended_at, Some(100));

        assert!(matches!(
            store.update_signal_status("s1", CallStatus::Accepted, Some(1), None).await,
            Err(Error::SignalTerminal(_))
        ));
        assert!(matches!(
            store.update_signal_data("s1", SignalData::default()).await,
            Err(Error::SignalTerminal(_))
        ));
    }

    #[tokio::test]
    async fn started_at_is_set_once() {
        let store = seeded_store().await;
        store.insert_signal(ringing_signal("s1")).await.unwrap();

        let accepted = store
            .update_signal_status("s1", CallStatus::Accepted, Some(10), None)
            .await
            .unwrap();
        assert_eq!(accepted.started_at, Some(10));

        let ended = store
            .update_signal_status("s1", CallStatus::Ended, Some(99), Some(20))
            .await
            .unwrap();
        assert_eq!(ended.started_at, Some(10));
        assert_eq!(ended.ended_at, Some(20));
    }

    #[tokio::test]
    async fn only_the_sender_may_edit_or_delete() {
        let store = seeded_store().await;
        let conv = store.get_or_create_direct("alice", "bob").await.unwrap();
        let msg = store
            .insert_message(Message::outgoing(&conv, "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None))
            .await
            .unwrap();

        assert!(matches!(
            store.edit_message("bob", &msg.id, "hacked").await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            store.delete_message("bob", &msg.id).await,
            Err(Error::Forbidden(_))
        ));

        let edited = store.edit_message("alice", &msg.id, "hello").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content.as_deref(), Some("hello"));

        let deleted = store.delete_message("alice", &msg.id).await.unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.content, None);
    }

    #[tokio::test]
    async fn unread_counts_and_mark_read() {
        let store = seeded_store().await;
        let conv = store.get_or_create_direct("alice", "bob").await.unwrap();
        store
            .insert_message(Message::outgoing(&conv, "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None))
            .await
            .unwrap();

        let bobs = store.list_conversations("bob").await.unwrap();
        assert_eq!(bobs[0].unread_count, 1);
        let alices = store.list_conversations("alice").await.unwrap();
        assert_eq!(alices[0].unread_count, 0);

        store.mark_read(&conv, "bob").await.unwrap();
        let bobs = store.list_conversations("bob").await.unwrap();
        assert_eq!(bobs[0].unread_count, 0);
        let last = bobs[0].last_message.as_ref().unwrap();
        assert!(last.read_by.contains("bob"));
        assert!(last.read_by.contains("alice"));
    }

    #[tokio::test]
    async fn pinned_conversations_sort_first() {
        let store = seeded_store().await;
        let with_bob = store.get_or_create_direct("alice", "bob").await.unwrap();
        let with_carol = store.get_or_create_direct("alice", "carol").await.unwrap();

        // carol's conversation is fresher...
        store
            .insert_message(Message::outgoing(&with_carol, "carol", MessageKind::Text, Some("hey".into()), serde_json::Value::Null, None))
            .await
            .unwrap();
        // ...but bob's is pinned
        store.set_pinned(&with_bob, "alice", true).await.unwrap();

        let list = store.list_conversations("alice").await.unwrap();
        assert_eq!(list[0].id, with_bob);
        assert_eq!(list[1].id, with_carol);
    }

    #[tokio::test]
    async fn mute_state_persists_per_participant() {
        let store = seeded_store().await;
        let conv = store.get_or_create_direct("alice", "bob").await.unwrap();
        store.set_muted(&conv, "alice", true).await.unwrap();

        let list = store.list_conversations("alice").await.unwrap();
        assert!(list[0].participant("alice").unwrap().is_muted);
        assert!(!list[0].participant("bob").unwrap().is_muted);
    }

    #[tokio::test]
    async fn reaction_toggling_cleans_up_empty_sets() {
        let store = seeded_store().await;
        let conv = store.get_or_create_direct("alice", "bob").await.unwrap();
        let msg = store
            .insert_message(Message::outgoing(&conv, "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None))
            .await
            .unwrap();

        let with = store.toggle_reaction("bob", &msg.id, "👍").await.unwrap();
        assert_eq!(with.reactions.get("👍").map(|s| s.len()), Some(1));
        let without = store.toggle_reaction("bob", &msg.id, "👍").await.unwrap();
        assert!(without.reactions.is_empty());
    }

    #[tokio::test]
    async fn mutations_emit_push_events() {
        let store = seeded_store().await;
        let conv = store.get_or_create_direct("alice", "bob").await.unwrap();
        let mut events = store.subscribe();

        store
            .insert_message(Message::outgoing(&conv, "alice", MessageKind::Text, Some("hi".into()), serde_json::Value::Null, None))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no push event")
            .unwrap();
        match event {
            StoreEvent::MessageInserted(msg) => assert_eq!(msg.conversation_id, conv),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
