#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::stored_object;

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Separator,
}

stored_object!(Message, "message", {
    conversation_id: String,
    role: MessageRole,
    #[serde(default = "default_message_type")]
    message_type: MessageType,
    content: String,
    topic_id: Option<String>,
    embedding: Option<Vec<f32>>
});

fn default_message_type() -> MessageType {
    MessageType::Text
}

impl Message {
    pub fn new(
        conversation_id: String,
        role: MessageRole,
        content: String,
        topic_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            conversation_id,
            role,
            message_type: MessageType::Text,
            content,
            topic_id,
            embedding: None,
        }
    }

    pub fn separator(conversation_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            conversation_id,
            role: MessageRole::System,
            message_type: MessageType::Separator,
            content: String::new(),
            topic_id: None,
            embedding: None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

pub fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .filter(|m| m.message_type == MessageType::Text)
        .map(|msg| format!("{msg}"))
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::SurrealDbClient;

    #[tokio::test]
    async fn test_message_creation() {
        let conversation_id = "test_conversation";
        let content = "This is a test message";
        let role = MessageRole::User;

        let message = Message::new(conversation_id.to_string(), role, content.to_string(), None);

        assert_eq!(message.conversation_id, conversation_id);
        assert_eq!(message.content, content);
        assert_eq!(message.role, role);
        assert_eq!(message.message_type, MessageType::Text);
        assert!(!message.id.is_empty());
    }

    #[tokio::test]
    async fn test_message_persistence() {
        let namespace = "test_ns";
        let database = &uuid::Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let conversation_id = "test_conversation";
        let message = Message::new(
            conversation_id.to_string(),
            MessageRole::User,
            "Hello world".to_string(),
            None,
        );
        let message_id = message.id.clone();

        db.store_item(message.clone())
            .await
            .expect("Failed to store message");

        let retrieved: Option<Message> = db
            .get_item(&message_id)
            .await
            .expect("Failed to retrieve message");

        assert_eq!(retrieved, Some(message));
    }

    #[tokio::test]
    async fn test_format_history_skips_separators() {
        let messages = vec![
            Message::new("c".into(), MessageRole::User, "Hello".into(), None),
            Message::separator("c".into()),
            Message::new("c".into(), MessageRole::Assistant, "Hi there!".into(), None),
        ];

        let formatted = format_history(&messages);
        assert_eq!(formatted, "user: Hello\nassistant: Hi there!");
    }
}
