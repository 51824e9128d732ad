//! Gateway-side client for the internal worker API.

use async_trait::async_trait;
use common::error::AppError;
use ingestion_pipeline::ProcessRequest;
use serde_json::json;
use std::time::Duration;

/// Calls the gateway makes against the worker. A trait so route tests can
/// run without a live worker process.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Fire a background ingestion job.
    async fn dispatch_process(&self, request: &ProcessRequest) -> Result<(), AppError>;

    /// Fire a background chat turn (answer arrives via polling).
    async fn dispatch_chat(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<(), AppError>;

    /// Remove a document's vectors and parent map.
    async fn delete_vectors(&self, user_id: &str, doc_id: &str) -> Result<(), AppError>;

    /// Open the worker's SSE stream for a chat turn.
    async fn stream_chat(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<reqwest::Response, AppError>;
}

pub struct HttpWorkerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkerClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn dispatch_process(&self, request: &ProcessRequest) -> Result<(), AppError> {
        self.client
            .post(self.url(&format!("/api/documents/{}/process", request.doc_id)))
            .json(request)
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Reqwest)?;
        Ok(())
    }

    async fn dispatch_chat(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<(), AppError> {
        self.client
            .post(self.url("/api/chat/message"))
            .json(&json!({
                "user_id": user_id,
                "session_id": session_id,
                "message": message,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Reqwest)?;
        Ok(())
    }

    async fn delete_vectors(&self, user_id: &str, doc_id: &str) -> Result<(), AppError> {
        self.client
            .delete(self.url(&format!(
                "/api/documents/{doc_id}/delete-vectors?user_id={user_id}"
            )))
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Reqwest)?;
        Ok(())
    }

    async fn stream_chat(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .post(self.url("/api/chat/stream"))
            .json(&json!({
                "user_id": user_id,
                "session_id": session_id,
                "message": message,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Reqwest)?;
        Ok(response)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records dispatches instead of making HTTP calls.
    #[derive(Default)]
    pub struct RecordingWorkerClient {
        pub process_jobs: Mutex<Vec<ProcessRequest>>,
        pub chat_jobs: Mutex<Vec<(String, String, String)>>,
        pub vector_deletes: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl WorkerClient for RecordingWorkerClient {
        async fn dispatch_process(&self, request: &ProcessRequest) -> Result<(), AppError> {
            self.process_jobs
                .lock()
                .expect("process jobs lock")
                .push(request.clone());
            Ok(())
        }

        async fn dispatch_chat(
            &self,
            user_id: &str,
            session_id: &str,
            message: &str,
        ) -> Result<(), AppError> {
            self.chat_jobs.lock().expect("chat jobs lock").push((
                user_id.to_string(),
                session_id.to_string(),
                message.to_string(),
            ));
            Ok(())
        }

        async fn delete_vectors(&self, user_id: &str, doc_id: &str) -> Result<(), AppError> {
            self.vector_deletes
                .lock()
                .expect("vector deletes lock")
                .push((user_id.to_string(), doc_id.to_string()));
            Ok(())
        }

        async fn stream_chat(
            &self,
            _user_id: &str,
            _session_id: &str,
            _message: &str,
        ) -> Result<reqwest::Response, AppError> {
            Err(AppError::InternalError(
                "streaming is not available in the recording client".into(),
            ))
        }
    }
}
