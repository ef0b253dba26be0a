//! Tenant file management: uploads go to object storage and are then
//! indexed by the tenant's knowledge base.
//!
//! Object storage is authoritative. Knowledge-base bookkeeping that fails
//! after a successful storage operation is reported, not rolled back.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ServiceError, require};
use crate::knowledge::{
    self, Collection, DocumentStatus, KnowledgeBase, MetaField, NewDocument, collection_name,
};
use crate::storage::{ObjectStore, object_key, tenant_prefix};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 << 20;

const COLLECTION_DESCRIPTION: &str = "Knowledge base for user documents";
const STATUS_PAGE_SIZE: u32 = 100;
const INDUSTRY: &str = "enterprise services";

/// Document type the knowledge base should parse `file_name` as.
pub fn doc_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if ext == "xlsx" && file_name.to_ascii_lowercase().contains("faq") {
        return "faq.xlsx";
    }

    match ext.as_str() {
        "txt" => "txt",
        "doc" => "doc",
        "docx" => "docx",
        "pdf" => "pdf",
        "md" | "markdown" => "markdown",
        "pptx" => "pptx",
        "xlsx" => "xlsx",
        "csv" => "csv",
        "jsonl" => "jsonl",
        _ => "txt",
    }
}

/// Knowledge-base document ID for `file_name`: only ASCII letters, digits,
/// `_` and `-` survive.
pub fn doc_id_for(file_name: &str) -> String {
    file_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Last path component of a client-supplied file name.
fn base_name(file_name: &str) -> Result<&str, ServiceError> {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ServiceError::validation("Filename is required"));
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub url: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
    pub url: String,
    pub user_id: String,
}

/// What happened to the knowledge-base copy of a deleted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbCleanup {
    Removed,
    /// The tenant has no knowledge base, so there was nothing to remove.
    NotProvisioned,
    LookupFailed(String),
    DeleteFailed(String),
}

/// Result of deleting a file. The stored object is always gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub key: String,
    pub doc_id: String,
    pub kb: KbCleanup,
}

impl DeleteOutcome {
    pub fn message(&self) -> &'static str {
        match self.kb {
            KbCleanup::Removed => "File deleted successfully from both TOS and knowledge base",
            KbCleanup::NotProvisioned => {
                "File deleted successfully from TOS (knowledge base not found)"
            }
            KbCleanup::LookupFailed(_) => {
                "File deleted successfully from TOS, but failed to check knowledge base"
            }
            KbCleanup::DeleteFailed(_) => {
                "File deleted successfully from TOS, but failed to delete from knowledge base"
            }
        }
    }

    /// Whether the knowledge-base side was fully cleaned up (or had
    /// nothing to clean).
    pub fn is_complete(&self) -> bool {
        matches!(self.kb, KbCleanup::Removed | KbCleanup::NotProvisioned)
    }
}

pub struct FileService {
    store: Arc<dyn ObjectStore>,
    kb: Arc<dyn KnowledgeBase>,
    project: String,
    max_upload_bytes: u64,
}

impl FileService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        kb: Arc<dyn KnowledgeBase>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            store,
            kb,
            project: project.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Store one file for `tenant_id` and register it with the tenant's
    /// knowledge base, creating the knowledge base on first upload.
    pub async fn upload_file(
        &self,
        tenant_id: &str,
        file_name: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadedFile, ServiceError> {
        require(tenant_id, "tenant_id")?;
        let name = base_name(file_name)?;
        if body.len() as u64 > self.max_upload_bytes {
            return Err(ServiceError::validation(format!(
                "File {name} is too large. Max size is {} bytes",
                self.max_upload_bytes
            )));
        }

        let key = object_key(tenant_id, name);
        info!(tenant_id, key = %key, bytes = body.len(), "uploading file");
        self.store
            .put(&key, body, content_type)
            .await
            .map_err(|e| ServiceError::upstream("failed to upload file", e))?;
        let url = self
            .store
            .presigned_get_url(&key)
            .map_err(|e| ServiceError::upstream("failed to sign file URL", e))?;

        let collection = self.ensure_collection(tenant_id).await?;
        let document = NewDocument {
            resource_id: collection.resource_id,
            doc_id: doc_id_for(name),
            doc_name: name.to_string(),
            doc_type: doc_type_for(name).to_string(),
            url: url.clone(),
            meta: vec![
                MetaField::string("industry", INDUSTRY),
                MetaField::string("user_id", tenant_id),
            ],
        };
        self.kb
            .add_document(&document)
            .await
            .map_err(|e| ServiceError::upstream("failed to add document to knowledge base", e))?;
        info!(tenant_id, doc_id = %document.doc_id, doc_type = %document.doc_type, "document submitted");

        Ok(UploadedFile {
            name: name.to_string(),
            url,
            user_id: tenant_id.to_string(),
        })
    }

    async fn ensure_collection(&self, tenant_id: &str) -> Result<Collection, ServiceError> {
        let name = collection_name(tenant_id);
        let existing = self
            .kb
            .find_collection(&name, &self.project)
            .await
            .map_err(|e| ServiceError::upstream("failed to check knowledge base", e))?;
        if let Some(collection) = existing {
            return Ok(collection);
        }

        info!(collection = %name, "creating knowledge base");
        self.kb
            .create_collection(&name, COLLECTION_DESCRIPTION, &self.project)
            .await
            .map_err(|e| ServiceError::upstream("failed to create knowledge base", e))
    }

    /// Everything `tenant_id` has uploaded, each with a fresh download URL.
    pub async fn list_files(&self, tenant_id: &str) -> Result<Vec<FileEntry>, ServiceError> {
        require(tenant_id, "tenant_id")?;
        let objects = self
            .store
            .list(&tenant_prefix(tenant_id))
            .await
            .map_err(|e| ServiceError::upstream("failed to list files", e))?;

        objects
            .into_iter()
            .map(|object| {
                let url = self
                    .store
                    .presigned_get_url(&object.key)
                    .map_err(|e| ServiceError::upstream("failed to sign file URL", e))?;
                Ok(FileEntry {
                    name: object.name,
                    key: object.key,
                    size: object.size,
                    last_modified: object.last_modified,
                    url,
                    user_id: tenant_id.to_string(),
                })
            })
            .collect()
    }

    /// A pre-signed URL for one of `tenant_id`'s files.
    pub async fn download_url(
        &self,
        tenant_id: &str,
        file_name: &str,
    ) -> Result<String, ServiceError> {
        require(tenant_id, "tenant_id")?;
        let key = object_key(tenant_id, base_name(file_name)?);
        let exists = self
            .store
            .exists(&key)
            .await
            .map_err(|e| ServiceError::upstream("failed to look up file", e))?;
        if !exists {
            return Err(ServiceError::not_found("File not found"));
        }
        self.store
            .presigned_get_url(&key)
            .map_err(|e| ServiceError::upstream("failed to sign file URL", e))
    }

    /// Delete a file from storage, then remove its knowledge-base document
    /// on a best-effort basis.
    pub async fn delete_file(
        &self,
        tenant_id: &str,
        file_name: &str,
    ) -> Result<DeleteOutcome, ServiceError> {
        let started = Instant::now();
        require(tenant_id, "tenant_id")?;
        let name = base_name(file_name)?;
        let key = object_key(tenant_id, name);

        self.store
            .delete(&key)
            .await
            .map_err(|e| ServiceError::upstream("failed to delete file", e))?;
        info!(tenant_id, key = %key, "file deleted from storage");

        let doc_id = doc_id_for(name);
        let kb = match self
            .kb
            .find_collection(&collection_name(tenant_id), &self.project)
            .await
        {
            Err(e) => {
                warn!(tenant_id, error = %e, "failed to check knowledge base");
                KbCleanup::LookupFailed(e.to_string())
            }
            Ok(None) => KbCleanup::NotProvisioned,
            Ok(Some(collection)) => {
                match self
                    .kb
                    .delete_document(&collection.resource_id, &doc_id)
                    .await
                {
                    Ok(()) => KbCleanup::Removed,
                    Err(e) => {
                        warn!(tenant_id, doc_id = %doc_id, error = %e, "failed to delete document");
                        KbCleanup::DeleteFailed(e.to_string())
                    }
                }
            }
        };

        let outcome = DeleteOutcome { key, doc_id, kb };
        info!(
            tenant_id,
            complete = outcome.is_complete(),
            duration = ?started.elapsed(),
            "delete request completed"
        );
        Ok(outcome)
    }

    /// Processing status of the tenant's knowledge-base documents.
    pub async fn document_status(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<DocumentStatus>, ServiceError> {
        require(tenant_id, "tenant_id")?;
        let collection =
            knowledge::require_collection(self.kb.as_ref(), tenant_id, &self.project).await?;
        let records = self
            .kb
            .list_documents(&collection.resource_id, STATUS_PAGE_SIZE)
            .await
            .map_err(|e| ServiceError::upstream("failed to get document status", e))?;
        Ok(records.into_iter().map(DocumentStatus::from).collect())
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("project", &self.project)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}
