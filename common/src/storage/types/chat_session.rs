use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::chat_message::ChatMessage;

stored_object!(ChatSession, "chat_session", {
    user_id: String,
    title: String
});

/// Length at which a first message is cut to form the session title.
const TITLE_LIMIT: usize = 50;

impl ChatSession {
    pub fn new(user_id: String, first_message: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            title: first_message.chars().take(TITLE_LIMIT).collect(),
        }
    }

    pub async fn get_owned(
        session_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let session: ChatSession = db
            .get_item(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

        if session.user_id != user_id {
            return Err(AppError::Auth(
                "You don't have access to this session".to_string(),
            ));
        }

        Ok(session)
    }

    /// Sessions for a user, most recently touched first.
    pub async fn list_for_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let sessions: Vec<ChatSession> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id
                 ORDER BY updated_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(sessions)
    }

    /// Bump `updated_at` so the session sorts to the top of the listing.
    pub async fn touch(session_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _session: Option<Self> = db
            .update((Self::table_name(), session_id))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    /// Remove a session together with its messages.
    pub async fn delete_with_messages(
        session_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        // Ownership check before any destructive statement
        Self::get_owned(session_id, user_id, db).await?;

        db.client
            .query(
                "BEGIN TRANSACTION;
                 DELETE chat_message WHERE session_id = $session_id;
                 DELETE type::thing('chat_session', $session_id);
                 COMMIT TRANSACTION;",
            )
            .bind(("session_id", session_id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn get_complete_session(
        session_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(Self, Vec<ChatMessage>), AppError> {
        let session = Self::get_owned(session_id, user_id, db).await?;
        let messages = ChatMessage::list_for_session(session_id, db).await?;
        Ok((session, messages))
    }
}
