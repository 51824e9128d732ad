use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Longest error string persisted on a document row.
const ERROR_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Active,
    Error,
    Deleted,
}

stored_object!(Document, "document", {
    user_id: String,
    original_filename: String,
    storage_path: String,
    file_size: u64,
    file_type: String,
    page_count: Option<u32>,
    chunk_count: u32,
    status: DocumentStatus,
    error_message: Option<String>,
    sha256: Option<String>,
    vector_collection: String
});

/// Strip NUL bytes and cap the length so a diagnostic never poisons the row.
pub fn bounded_error_message(message: &str) -> String {
    let cleaned: String = message.chars().filter(|c| *c != '\0').collect();
    cleaned.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

impl Document {
    pub fn new(
        user_id: String,
        original_filename: String,
        storage_path: String,
        file_size: u64,
        file_type: String,
    ) -> Self {
        let now = Utc::now();
        let vector_collection = format!("user_{user_id}");
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            original_filename,
            storage_path,
            file_size,
            file_type,
            page_count: None,
            chunk_count: 0,
            status: DocumentStatus::Processing,
            error_message: None,
            sha256: None,
            vector_collection,
        }
    }

    /// Fetch a document, enforcing ownership.
    pub async fn get_owned(
        doc_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let document: Document = db
            .get_item(doc_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Document not found".to_string()))?;

        if document.user_id != user_id {
            return Err(AppError::Auth(
                "You don't have access to this document".to_string(),
            ));
        }

        Ok(document)
    }

    /// All non-deleted documents for a user, newest first.
    pub async fn list_for_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let documents: Vec<Document> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id AND status != 'deleted'
                 ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(documents)
    }

    pub async fn mark_active(
        doc_id: &str,
        chunk_count: u32,
        page_count: Option<u32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let mut update = db
            .update((Self::table_name(), doc_id))
            .patch(PatchOp::replace("/status", DocumentStatus::Active))
            .patch(PatchOp::replace("/chunk_count", chunk_count))
            .patch(PatchOp::replace("/error_message", None::<String>))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ));
        if page_count.is_some() {
            update = update.patch(PatchOp::replace("/page_count", page_count));
        }
        let _doc: Option<Self> = update.await?;
        Ok(())
    }

    pub async fn mark_error(
        doc_id: &str,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), doc_id))
            .patch(PatchOp::replace("/status", DocumentStatus::Error))
            .patch(PatchOp::replace(
                "/error_message",
                Some(bounded_error_message(message)),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    /// Soft delete; the row survives for audit, vectors and blobs are
    /// removed separately.
    pub async fn mark_deleted(doc_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), doc_id))
            .patch(PatchOp::replace("/status", DocumentStatus::Deleted))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn set_sha256(
        doc_id: &str,
        digest: String,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), doc_id))
            .patch(PatchOp::replace("/sha256", Some(digest)))
            .await?;
        Ok(())
    }

    /// Hard row delete, reserved for upload rollback.
    pub async fn hard_delete(doc_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _doc: Option<Self> = db.delete_item(doc_id).await?;
        Ok(())
    }
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

    fn sample_document(user_id: &str) -> Document {
        Document::new(
            user_id.to_string(),
            "report.pdf".to_string(),
            format!("user_{user_id}/123_report.pdf"),
            1024,
            "pdf".to_string(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_processing_to_active() {
        let db = test_db().await;
        let document = sample_document("u1");
        let doc_id = document.id.clone();

        assert_eq!(document.status, DocumentStatus::Processing);
        db.store_item(document).await.expect("store document");

        Document::mark_active(&doc_id, 42, Some(2), &db)
            .await
            .expect("mark active");

        let stored = Document::get_owned(&doc_id, "u1", &db)
            .await
            .expect("fetch document");
        assert_eq!(stored.status, DocumentStatus::Active);
        assert_eq!(stored.chunk_count, 42);
        assert_eq!(stored.page_count, Some(2));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_mark_error_bounds_message() {
        let db = test_db().await;
        let document = sample_document("u1");
        let doc_id = document.id.clone();
        db.store_item(document).await.expect("store document");

        let noisy = format!("parse_failed: {}\0\0", "x".repeat(2_000));
        Document::mark_error(&doc_id, &noisy, &db)
            .await
            .expect("mark error");

        let stored = Document::get_owned(&doc_id, "u1", &db)
            .await
            .expect("fetch document");
        assert_eq!(stored.status, DocumentStatus::Error);
        let message = stored.error_message.expect("error message set");
        assert!(message.len() <= 500);
        assert!(!message.contains('\0'));
        assert!(message.starts_with("parse_failed"));
    }

    #[tokio::test]
    async fn test_listing_excludes_deleted_and_other_users() {
        let db = test_db().await;

        let mine = sample_document("u1");
        let mine_id = mine.id.clone();
        let deleted = sample_document("u1");
        let deleted_id = deleted.id.clone();
        let other = sample_document("u2");

        db.store_item(mine).await.expect("store mine");
        db.store_item(deleted).await.expect("store deleted");
        db.store_item(other).await.expect("store other");

        Document::mark_deleted(&deleted_id, &db)
            .await
            .expect("soft delete");

        let listed = Document::list_for_user("u1", &db).await.expect("list");
        let ids: Vec<_> = listed.iter().map(|d| d.id.as_str()).collect();
        assert!(ids.contains(&mine_id.as_str()));
        assert!(!ids.contains(&deleted_id.as_str()));
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let db = test_db().await;
        let document = sample_document("u1");
        let doc_id = document.id.clone();
        db.store_item(document).await.expect("store document");

        let result = Document::get_owned(&doc_id, "intruder", &db).await;
        assert!(matches!(result, Err(AppError::Auth(_))));

        let missing = Document::get_owned("nonexistent", "u1", &db).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_bounded_error_message() {
        assert_eq!(bounded_error_message("ok"), "ok");
        assert_eq!(bounded_error_message("a\0b"), "ab");
        assert_eq!(bounded_error_message(&"y".repeat(600)).len(), 500);
    }
}
