use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

stored_object!(ChatMessage, "chat_message", {
    session_id: String,
    user_id: String,
    role: MessageRole,
    content: String
});

impl ChatMessage {
    pub fn new(session_id: String, user_id: String, role: MessageRole, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            session_id,
            user_id,
            role,
            content,
        }
    }

    /// Messages of one session in chronological order.
    pub async fn list_for_session(
        session_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let messages: Vec<ChatMessage> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE session_id = $session_id
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("session_id", session_id.to_owned()))
            .await?
            .take(0)?;

        Ok(messages)
    }

    pub async fn delete_owned(
        message_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let message: ChatMessage = db
            .get_item(message_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Message not found".to_string()))?;

        if message.user_id != user_id {
            return Err(AppError::Auth(
                "You don't have access to this message".to_string(),
            ));
        }

        let _deleted: Option<ChatMessage> = db.delete_item(message_id).await?;
        Ok(())
    }
}

/// Render a message history block for prompt interpolation.
pub fn format_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
            };
            format!("{speaker}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(3).await.expect("initialize schema");
        db
    }

    #[tokio::test]
    async fn test_list_is_chronological() {
        let db = test_db().await;

        let mut first = ChatMessage::new(
            "s1".to_string(),
            "u1".to_string(),
            MessageRole::User,
            "first".to_string(),
        );
        let mut second = ChatMessage::new(
            "s1".to_string(),
            "u1".to_string(),
            MessageRole::Assistant,
            "second".to_string(),
        );
        second.created_at = first.created_at + chrono::Duration::seconds(2);
        first.updated_at = first.created_at;
        second.updated_at = second.created_at;

        db.store_item(second.clone()).await.expect("store second");
        db.store_item(first.clone()).await.expect("store first");

        let listed = ChatMessage::list_for_session("s1", &db)
            .await
            .expect("list messages");
        let contents: Vec<_> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_delete_owned_checks_user() {
        let db = test_db().await;

        let message = ChatMessage::new(
            "s1".to_string(),
            "u1".to_string(),
            MessageRole::User,
            "mine".to_string(),
        );
        let message_id = message.id.clone();
        db.store_item(message).await.expect("store message");

        let denied = ChatMessage::delete_owned(&message_id, "u2", &db).await;
        assert!(matches!(denied, Err(AppError::Auth(_))));

        ChatMessage::delete_owned(&message_id, "u1", &db)
            .await
            .expect("owner delete");
        let gone: Option<ChatMessage> = db.get_item(&message_id).await.expect("fetch");
        assert!(gone.is_none());
    }

    #[test]
    fn test_format_history() {
        let messages = vec![
            ChatMessage::new(
                "s".into(),
                "u".into(),
                MessageRole::User,
                "question".into(),
            ),
            ChatMessage::new(
                "s".into(),
                "u".into(),
                MessageRole::Assistant,
                "answer".into(),
            ),
        ];

        assert_eq!(format_history(&messages), "User: question\nAssistant: answer");
    }
}
