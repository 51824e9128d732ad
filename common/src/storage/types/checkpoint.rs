use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Checkpoint, "checkpoint", {
    thread_id: String,
    user_id: String,
    payload: serde_json::Value
});

impl Checkpoint {
    /// Thread identity for checkpointed conversation state.
    pub fn thread_id(user_id: &str, session_id: &str) -> String {
        format!("{user_id}:{session_id}")
    }

    /// Write the full record for a thread, last writer wins.
    pub async fn upsert_for_thread(
        thread_id: &str,
        user_id: &str,
        payload: serde_json::Value,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPSERT type::thing('checkpoint', $thread_id) SET
                thread_id = $thread_id,
                user_id = $user_id,
                payload = $payload,
                created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                updated_at = time::now()",
        )
        .bind(("thread_id", thread_id.to_owned()))
        .bind(("user_id", user_id.to_owned()))
        .bind(("payload", payload))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn get_for_thread(
        thread_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let checkpoint: Option<Checkpoint> = db.get_item(thread_id).await?;
        Ok(checkpoint)
    }

    pub async fn delete_for_thread(thread_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _deleted: Option<Checkpoint> = db.delete_item(thread_id).await?;
        Ok(())
    }
}
