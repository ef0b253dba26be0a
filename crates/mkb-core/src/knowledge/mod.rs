//! Managed knowledge-base service: per-tenant document collections,
//! retrieval, and document bookkeeping.

pub mod prompt;
pub mod viking;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ServiceError};
use crate::llm::ChatMessage;

/// Project that tenant collections live in.
pub const DEFAULT_PROJECT: &str = "default";

/// Name of the collection holding `tenant_id`'s documents.
pub fn collection_name(tenant_id: &str) -> String {
    format!("kb_{tenant_id}")
}

/// A provisioned collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub project: String,
    pub resource_id: String,
}

/// Retrieval query against one collection.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub collection: String,
    pub project: String,
    pub resource_id: Option<String>,
    pub query: String,
    /// Prior conversation turns, forwarded for query understanding.
    pub messages: Vec<ChatMessage>,
    pub limit: u32,
    pub dense_weight: f32,
    /// Candidates considered before the final cut.
    pub retrieve_count: u32,
}

impl SearchRequest {
    pub const DEFAULT_LIMIT: u32 = 5;
    pub const DEFAULT_DENSE_WEIGHT: f32 = 0.5;
    pub const DEFAULT_RETRIEVE_COUNT: u32 = 25;

    pub fn new(collection: &Collection, query: impl Into<String>) -> Self {
        Self {
            collection: collection.name.clone(),
            project: collection.project.clone(),
            resource_id: Some(collection.resource_id.clone()),
            query: query.into(),
            messages: Vec::new(),
            limit: Self::DEFAULT_LIMIT,
            dense_weight: Self::DEFAULT_DENSE_WEIGHT,
            retrieve_count: Self::DEFAULT_RETRIEVE_COUNT,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// One retrieved chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHit {
    pub content: String,
    /// Set when the chunk comes from a FAQ document.
    pub original_question: Option<String>,
    pub chunk_title: String,
    pub doc_name: String,
    pub doc_title: String,
    /// Link to the first image attached to the chunk, if any.
    pub image_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
}

/// Key/value metadata attached to an indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaField {
    pub field_name: String,
    pub field_type: String,
    pub field_value: serde_json::Value,
}

impl MetaField {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field_name: name.into(),
            field_type: "string".to_string(),
            field_value: serde_json::Value::String(value.into()),
        }
    }
}

/// A document to index, fetched by the service from `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub resource_id: String,
    pub doc_id: String,
    pub doc_name: String,
    pub doc_type: String,
    pub url: String,
    pub meta: Vec<MetaField>,
}

/// A document as listed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub doc_name: String,
    pub process_status: i64,
}

/// Processing state of one indexed document, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub doc_id: String,
    pub doc_name: String,
    pub process_status: i64,
    pub status_text: &'static str,
    pub is_completed: bool,
}

impl From<DocumentRecord> for DocumentStatus {
    fn from(record: DocumentRecord) -> Self {
        Self {
            status_text: status_text(record.process_status),
            is_completed: record.process_status == 0,
            doc_id: record.doc_id,
            doc_name: record.doc_name,
            process_status: record.process_status,
        }
    }
}

/// Human-readable label for a document processing status code.
pub fn status_text(code: i64) -> &'static str {
    match code {
        0 => "completed",
        1 => "failed",
        2 | 3 => "queued",
        5 => "deleting",
        6 => "processing",
        _ => "unknown",
    }
}

/// Operations on the managed knowledge-base service.
///
/// Implementations turn a non-zero application code from the service into
/// [`ClientError::Application`], so callers only ever see `Ok` for calls
/// the service accepted.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Look up a collection. `Ok(None)` means it is not provisioned.
    async fn find_collection(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<Collection>, ClientError>;

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
        project: &str,
    ) -> Result<Collection, ClientError>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError>;

    async fn add_document(&self, document: &NewDocument) -> Result<(), ClientError>;

    async fn delete_document(&self, resource_id: &str, doc_id: &str) -> Result<(), ClientError>;

    async fn list_documents(
        &self,
        resource_id: &str,
        limit: u32,
    ) -> Result<Vec<DocumentRecord>, ClientError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn KnowledgeBase) {}
};

/// Message returned when a tenant has no knowledge base yet.
pub const NOT_PROVISIONED: &str = "Knowledge base not found. Please upload some files first.";

/// Resolve `tenant_id`'s collection, failing with `NotFound` when it has
/// not been provisioned.
pub async fn require_collection(
    kb: &dyn KnowledgeBase,
    tenant_id: &str,
    project: &str,
) -> Result<Collection, ServiceError> {
    let name = collection_name(tenant_id);
    tracing::debug!(collection = %name, project, "checking knowledge base");
    kb.find_collection(&name, project)
        .await
        .map_err(|e| ServiceError::upstream("failed to check knowledge base", e))?
        .ok_or_else(|| ServiceError::not_found(NOT_PROVISIONED))
}
