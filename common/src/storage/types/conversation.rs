use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::message::Message;

stored_object!(Conversation, "conversation", {
    title: String,
    topic_id: Option<String>
});

impl Conversation {
    pub fn new(title: String, topic_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title,
            topic_id,
        }
    }

    pub async fn get_complete_conversation(
        conversation_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(Self, Vec<Message>), AppError> {
        let conversation: Conversation = db
            .get_item(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Conversation not found".to_string()))?;

        let messages: Vec<Message> = db
            .client
            .query("SELECT * FROM type::table($table_name) WHERE conversation_id = $conversation_id ORDER BY created_at")
            .bind(("table_name", Message::table_name()))
            .bind(("conversation_id", conversation_id.to_string()))
            .await?
            .take(0)?;

        Ok((conversation, messages))
    }

    pub async fn patch_title(
        id: &str,
        new_title: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let conversation: Option<Conversation> = db.get_item(id).await?;
        conversation.ok_or_else(|| AppError::NotFound("Conversation not found".to_string()))?;

        let _updated: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/title", new_title.to_string()))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::Datetime::from(Utc::now()),
            ))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::types::message::MessageRole;

    use super::*;

    #[tokio::test]
    async fn test_create_conversation() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let title = "Test Conversation";
        let conversation = Conversation::new(title.to_string(), None);

        assert_eq!(conversation.title, title);
        assert!(!conversation.id.is_empty());

        let result = db.store_item(conversation.clone()).await;
        assert!(result.is_ok());

        let retrieved: Option<Conversation> = db
            .get_item(&conversation.id)
            .await
            .expect("Failed to retrieve conversation");
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().title, title);
    }

    #[tokio::test]
    async fn test_get_complete_conversation_not_found() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let result = Conversation::get_complete_conversation("nonexistent_id", &db).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_patch_title_success() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let conversation = Conversation::new("Original Title".to_string(), None);
        let conversation_id = conversation.id.clone();
        db.store_item(conversation)
            .await
            .expect("Failed to store conversation");

        Conversation::patch_title(&conversation_id, "Updated Title", &db)
            .await
            .expect("patch title");

        let updated = db
            .get_item::<Conversation>(&conversation_id)
            .await
            .expect("Failed to get conversation")
            .expect("Conversation missing");
        assert_eq!(updated.title, "Updated Title");
    }

    #[tokio::test]
    async fn test_get_complete_conversation_with_messages() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let conversation = Conversation::new("Conversation".to_string(), None);
        let conversation_id = conversation.id.clone();
        db.store_item(conversation)
            .await
            .expect("Failed to store conversation");

        let message1 = Message::new(
            conversation_id.clone(),
            MessageRole::User,
            "Hello, AI!".to_string(),
            None,
        );
        let message2 = Message::new(
            conversation_id.clone(),
            MessageRole::Assistant,
            "Hello, human!".to_string(),
            None,
        );
        db.store_item(message1)
            .await
            .expect("Failed to store message1");
        db.store_item(message2)
            .await
            .expect("Failed to store message2");

        let (retrieved_conversation, messages) =
            Conversation::get_complete_conversation(&conversation_id, &db)
                .await
                .expect("Failed to retrieve complete conversation");

        assert_eq!(retrieved_conversation.id, conversation_id);
        assert_eq!(messages.len(), 2);
    }
}
