use common::storage::db::SurrealDbClient;

use crate::{
    utils::{extraction::ExtractedText, splitter::{ChildSplit, ParentSplit}},
    ProcessRequest,
};

use super::{config::IngestionConfig, services::PipelineServices};

/// Mutable scratch space threaded through the stage functions.
pub struct PipelineContext<'a> {
    pub db: &'a SurrealDbClient,
    pub services: &'a dyn PipelineServices,
    pub config: &'a IngestionConfig,
    pub request: &'a ProcessRequest,

    pub extracted: Option<ExtractedText>,
    pub cleaned: Option<String>,
    pub parents: Vec<ParentSplit>,
    pub children: Vec<ChildSplit>,
    pub upserted_chunks: u32,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        db: &'a SurrealDbClient,
        services: &'a dyn PipelineServices,
        config: &'a IngestionConfig,
        request: &'a ProcessRequest,
    ) -> Self {
        Self {
            db,
            services,
            config,
            request,
            extracted: None,
            cleaned: None,
            parents: Vec::new(),
            children: Vec::new(),
            upserted_chunks: 0,
        }
    }

    pub fn page_count(&self) -> Option<u32> {
        self.extracted.as_ref().and_then(|e| e.page_count)
    }
}
