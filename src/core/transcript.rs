//! Conversation transcripts. The agent loop only reads the last few turns;
//! callers persist the user turn and the final answer.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::llm::{ChatMessage, Role};

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::Assistant => ChatMessage::assistant(self.content.clone()),
            Role::System => ChatMessage::system(self.content.clone()),
            // Stored tool output has no call id to pair with; replay it as context.
            Role::Tool => ChatMessage::system(format!("[tool result] {}", self.content)),
            Role::User => ChatMessage::user(self.content.clone()),
        }
    }
}

pub fn history_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns.iter().map(Turn::to_message).collect()
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// The last `limit` turns of a conversation, oldest first.
    async fn recent_turns(&self, user_id: &str, conversation_id: &str, limit: usize) -> Result<Vec<Turn>>;

    async fn append_turn(&self, user_id: &str, conversation_id: &str, role: Role, content: &str) -> Result<()>;
}

fn parse_role(raw: &str) -> Result<Role> {
    match raw {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        "tool" => Ok(Role::Tool),
        other => Err(anyhow!("unknown transcript role '{}'", other)),
    }
}

pub struct SqliteTranscript {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTranscript {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_turns_conversation
                ON conversation_turns(user_id, conversation_id, id)",
            [],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscript {
    async fn recent_turns(&self, user_id: &str, conversation_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT role, content, created_at FROM conversation_turns \
             WHERE user_id = ?1 AND conversation_id = ?2 ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user_id, conversation_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, content, created_at) = row?;
            turns.push(Turn {
                role: parse_role(&role)?,
                content,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        turns.reverse();
        Ok(turns)
    }

    async fn append_turn(&self, user_id: &str, conversation_id: &str, role: Role, content: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO conversation_turns (user_id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, conversation_id, role.as_str(), content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteTranscript {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let store = SqliteTranscript::new(db);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn returns_last_turns_oldest_first() {
        let store = store().await;
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append_turn("alice", "c1", role, &format!("turn {}", i)).await.unwrap();
        }

        let turns = store.recent_turns("alice", "c1", 3).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn conversations_and_users_are_separate() {
        let store = store().await;
        store.append_turn("alice", "c1", Role::User, "a").await.unwrap();
        store.append_turn("alice", "c2", Role::User, "b").await.unwrap();
        store.append_turn("bob", "c1", Role::User, "c").await.unwrap();

        let turns = store.recent_turns("alice", "c1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "a");
    }

    #[test]
    fn turns_become_chat_messages() {
        let turns = vec![
            Turn { role: Role::User, content: "q".into(), created_at: Utc::now() },
            Turn { role: Role::Assistant, content: "a".into(), created_at: Utc::now() },
        ];
        let messages = history_messages(&turns);
        assert_eq!(messages[0], ChatMessage::user("q"));
        assert_eq!(messages[1], ChatMessage::assistant("a"));
    }
}
