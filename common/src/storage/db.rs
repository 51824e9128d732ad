use crate::error::AppError;

use super::types::StoredObject;
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define tables and indexes. `embedding_dimension` must match the
    /// configured embedding provider or HNSW lookups return nothing.
    pub async fn ensure_initialized(&self, embedding_dimension: usize) -> Result<(), AppError> {
        self.setup_auth().await?;
        self.build_indexes(embedding_dimension).await?;
        Ok(())
    }

    pub async fn setup_auth(&self) -> Result<(), Error> {
        self.client
            .query(
                "DEFINE TABLE IF NOT EXISTS user SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS unique_username ON TABLE user FIELDS username UNIQUE;",
            )
            .await?
            .check()?;
        Ok(())
    }

    pub async fn build_indexes(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_chunk_embedding ON child_chunk FIELDS embedding HNSW DIMENSION {embedding_dimension}"
            ))
            .await?
            .check()?;

        // BM25 side of hybrid retrieval; ascii analyzer keeps the index
        // usable when the snowball filter is not compiled in.
        let fts_sql = r#"
            DEFINE ANALYZER IF NOT EXISTS chunk_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii, snowball(english);
            DEFINE INDEX IF NOT EXISTS idx_chunk_content_fts ON TABLE child_chunk FIELDS content SEARCH ANALYZER chunk_fts_analyzer BM25;
        "#;
        if self.client.query(fts_sql).await.is_err() {
            self.client
                .query(
                    r#"
                    DEFINE ANALYZER OVERWRITE chunk_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii;
                    DEFINE INDEX IF NOT EXISTS idx_chunk_content_fts ON TABLE child_chunk FIELDS content SEARCH ANALYZER chunk_fts_analyzer BM25;
                    "#,
                )
                .await?
                .check()?;
        }

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_doc ON child_chunk FIELDS doc_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_user ON child_chunk FIELDS user_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_parent_doc ON parent_block FIELDS doc_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_user ON document FIELDS user_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_message_session ON chat_message FIELDS session_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_session_user ON chat_session FIELDS user_id")
            .await?;

        Ok(())
    }

    pub async fn rebuild_indexes(&self) -> Result<(), Error> {
        self.client
            .query("REBUILD INDEX IF EXISTS idx_chunk_content_fts ON child_chunk")
            .await?;
        self.client
            .query("REBUILD INDEX IF EXISTS idx_chunk_embedding ON child_chunk")
            .await?;
        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table, requires the struct to implement StoredObject
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
