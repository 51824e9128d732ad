use std::collections::HashMap;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Metadata carried by a parent block into the LLM context header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParentMetadata {
    pub source: String,
    pub title: Option<String>,
}

stored_object!(ParentBlock, "parent_block", {
    doc_id: String,
    user_id: String,
    content: String,
    metadata: ParentMetadata
});

const REPLACE_FOR_DOCUMENT: &str = r"
    BEGIN TRANSACTION;
    DELETE parent_block WHERE user_id = $user_id AND doc_id = $doc_id;

    FOR $block IN $blocks {
        CREATE type::thing('parent_block', $block.id) CONTENT $block;
    };

    COMMIT TRANSACTION;
";

impl ParentBlock {
    pub fn new(
        parent_id: String,
        doc_id: String,
        user_id: String,
        content: String,
        metadata: ParentMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: parent_id,
            created_at: now,
            updated_at: now,
            doc_id,
            user_id,
            content,
            metadata,
        }
    }

    /// Rewrite the parent map for one document: delete all prior rows for
    /// `(user_id, doc_id)` then insert the new set, in a single transaction
    /// so readers never observe a partial map.
    pub async fn replace_for_document(
        user_id: &str,
        doc_id: &str,
        blocks: Vec<ParentBlock>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let response = db
            .client
            .query(REPLACE_FOR_DOCUMENT)
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .bind(("blocks", blocks))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Fetch blocks by id for a user, preserving the requested order.
    pub async fn get_by_ids(
        user_id: &str,
        parent_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<surrealdb::sql::Thing> = parent_ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE id IN $things AND user_id = $user_id")
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .bind(("user_id", user_id.to_owned()))
            .await?;

        let blocks: Vec<ParentBlock> = response.take(0)?;

        let mut by_id: HashMap<String, ParentBlock> = blocks
            .into_iter()
            .map(|block| (block.id.clone(), block))
            .collect();

        let mut ordered = Vec::with_capacity(parent_ids.len());
        for id in parent_ids {
            if let Some(block) = by_id.remove(id) {
                ordered.push(block);
            }
        }

        Ok(ordered)
    }

    pub async fn delete_for_document(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE parent_block WHERE user_id = $user_id AND doc_id = $doc_id")
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn count_for_document(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM parent_block
                 WHERE user_id = $user_id AND doc_id = $doc_id
                 GROUP ALL",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?;

        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count))
    }
}
