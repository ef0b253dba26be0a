//! HTTP client for the managed knowledge-base OpenAPI.
//!
//! Every call is a signed JSON `POST` whose response is wrapped in a
//! `{code, message, data}` envelope. The same endpoint family also hosts the
//! chat-completion model, so this client implements both [`KnowledgeBase`]
//! and [`ChatModel`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    Collection, DocumentRecord, KnowledgeBase, NewDocument, SearchHit, SearchRequest,
    SearchResponse,
};
use crate::error::ClientError;
use crate::llm::{ChatMessage, ChatModel, ChunkStream, Completion, StreamChunk, TokenUsage};
use crate::signing::{Credentials, SignableRequest, Signer, SigningScheme};

const SEARCH_PATH: &str = "/api/knowledge/collection/search_knowledge";
const CHAT_PATH: &str = "/api/knowledge/chat/completions";
const CREATE_COLLECTION_PATH: &str = "/api/knowledge/collection/create";
const COLLECTION_INFO_PATH: &str = "/api/knowledge/collection/info";
const DOC_ADD_PATH: &str = "/api/knowledge/doc/add";
const DOC_DELETE_PATH: &str = "/api/knowledge/doc/delete";
const DOC_LIST_PATH: &str = "/api/knowledge/doc/list";

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);
const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Collection format version used for new tenant collections.
const COLLECTION_VERSION: u32 = 2;

/// Connection and model settings for [`VikingClient`].
#[derive(Debug, Clone)]
pub struct VikingConfig {
    /// Base URL, e.g. `https://api-knowledgebase.mlp.cn-beijing.volces.com`.
    pub endpoint: String,
    pub credentials: Credentials,
    pub region: String,
    pub service: String,
    pub model: String,
    pub model_version: String,
    /// Only needed when `model` names a private endpoint.
    pub model_api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl VikingConfig {
    pub const DEFAULT_ENDPOINT: &str = "https://api-knowledgebase.mlp.cn-beijing.volces.com";
    pub const DEFAULT_REGION: &str = "cn-north-1";
    pub const DEFAULT_SERVICE: &str = "air";
    pub const DEFAULT_MODEL: &str = "Doubao-1-5-pro-32k";
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Defaults for everything except the credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            credentials,
            region: Self::DEFAULT_REGION.to_string(),
            service: Self::DEFAULT_SERVICE.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            model_version: String::new(),
            model_api_key: None,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            temperature: Self::DEFAULT_TEMPERATURE,
        }
    }
}

pub struct VikingClient {
    http: Client,
    signer: Signer,
    base_url: String,
    host: String,
    config: VikingConfig,
}

impl VikingClient {
    pub fn new(config: VikingConfig) -> Result<Self, ClientError> {
        let url = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ClientError::Config(format!(
                    "endpoint has no host: {}",
                    config.endpoint
                )));
            }
        };
        let base_url = config.endpoint.trim_end_matches('/').to_string();
        let signer = Signer::new(
            config.credentials.clone(),
            config.region.clone(),
            config.service.clone(),
            SigningScheme::OPENAPI,
        );
        let http = Client::builder().build()?;

        Ok(Self {
            http,
            signer,
            base_url,
            host,
            config,
        })
    }

    fn signed_post(&self, path: &str, body: Vec<u8>, timeout: Duration) -> reqwest::RequestBuilder {
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let signed = self.signer.sign(
            &SignableRequest {
                method: "POST",
                host: &self.host,
                path,
                query: &[],
                headers: &headers,
                body: &body,
            },
            Utc::now(),
        );

        let mut req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .timeout(timeout)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");
        for (name, value) in signed {
            req = req.header(name, value);
        }
        req.body(body)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Envelope<T>, ClientError> {
        debug!(path, "knowledge base request");
        let bytes = serde_json::to_vec(body).map_err(|e| ClientError::Decode(e.to_string()))?;
        let response = self.signed_post(path, bytes, timeout).send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(ClientError::Status {
                status: status.as_u16(),
                body: text,
            }),
            Err(e) => Err(ClientError::Decode(format!("{path}: {e}"))),
        }
    }

    fn chat_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "model_version": self.config.model_version,
            "api_key": self.config.model_api_key.clone().unwrap_or_default(),
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": stream,
            "return_token_usage": true,
        })
    }
}

/// Request body for a retrieval call.
fn search_body(request: &SearchRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "name": request.collection,
        "project": request.project,
        "query": request.query,
        "limit": request.limit,
        "dense_weight": request.dense_weight,
        "pre_processing": {
            "need_instruction": true,
            "rewrite": false,
            "messages": request.messages,
            "return_token_usage": true,
        },
        "post_processing": {
            "rerank_switch": false,
            "retrieve_count": request.retrieve_count,
            "get_attachment_link": true,
            "chunk_group": true,
            "chunk_diffusion_count": 0,
        },
    });
    if let Some(resource_id) = &request.resource_id {
        body["resource_id"] = serde_json::json!(resource_id);
    }
    body
}

fn document_body(document: &NewDocument) -> serde_json::Value {
    serde_json::json!({
        "resource_id": document.resource_id,
        "add_type": "url",
        "doc_id": document.doc_id,
        "doc_name": document.doc_name,
        "doc_type": document.doc_type,
        "url": document.url,
        "meta": document.meta,
    })
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn is_ok(&self) -> bool {
        self.code == 0
    }

    fn into_data(self) -> Result<T, ClientError> {
        if self.code != 0 {
            return Err(ClientError::Application {
                code: self.code,
                message: self.message,
            });
        }
        self.data
            .ok_or_else(|| ClientError::Decode("response has no data".to_string()))
    }

    fn check(self) -> Result<(), ClientError> {
        if self.code != 0 {
            return Err(ClientError::Application {
                code: self.code,
                message: self.message,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CollectionData {
    resource_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    project: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    result_list: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    content: String,
    #[serde(default)]
    original_question: String,
    #[serde(default)]
    chunk_title: String,
    #[serde(default)]
    doc_info: DocInfo,
    #[serde(default)]
    chunk_attachment: Vec<ChunkAttachment>,
}

#[derive(Debug, Default, Deserialize)]
struct DocInfo {
    #[serde(default)]
    doc_name: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChunkAttachment {
    #[serde(default)]
    link: String,
}

impl From<SearchItem> for SearchHit {
    fn from(item: SearchItem) -> Self {
        let image_link = item
            .chunk_attachment
            .into_iter()
            .next()
            .map(|a| a.link)
            .filter(|l| !l.is_empty());
        Self {
            content: item.content,
            original_question: Some(item.original_question).filter(|q| !q.is_empty()),
            chunk_title: item.chunk_title,
            doc_name: item.doc_info.doc_name,
            doc_title: item.doc_info.title,
            image_link,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChatData {
    #[serde(default)]
    generated_answer: String,
    #[serde(default)]
    usage: String,
    #[serde(default)]
    reasoning_content: String,
    #[serde(default)]
    end: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DocListData {
    #[serde(default)]
    doc_list: Vec<DocItem>,
}

#[derive(Debug, Deserialize)]
struct DocItem {
    doc_id: String,
    #[serde(default)]
    doc_name: String,
    #[serde(default)]
    status: DocProcessing,
}

#[derive(Debug, Default, Deserialize)]
struct DocProcessing {
    #[serde(default)]
    process_status: i64,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Splits a byte stream of `data:` frames into decoded chunks.
///
/// Frames are separated by blank lines (`\r\n\r\n` on the wire); each
/// payload sits on a single `data:` line. Bytes are buffered until a full
/// line arrives so multi-byte characters are never split.
#[derive(Debug, Default)]
struct FrameDecoder {
    buffer: Vec<u8>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl FrameDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamChunk>, ClientError> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut out)?;
        }
        Ok(out)
    }

    /// Flush any trailing partial line and emit the terminal chunk.
    fn finish(&mut self) -> Result<Vec<StreamChunk>, ClientError> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest, &mut out)?;
        if !self.finished {
            self.finished = true;
            out.push(StreamChunk::Done { usage: self.usage });
        }
        Ok(out)
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<StreamChunk>) -> Result<(), ClientError> {
        if self.finished {
            return Ok(());
        }
        let line = String::from_utf8_lossy(line);
        let Some(payload) = line.trim().strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(());
        }

        let envelope: Envelope<ChatData> =
            serde_json::from_str(payload).map_err(|e| ClientError::Decode(e.to_string()))?;
        let data = envelope.into_data()?;

        if !data.generated_answer.is_empty() {
            out.push(StreamChunk::Text(data.generated_answer));
        }
        if let Some(usage) = TokenUsage::parse(&data.usage) {
            self.usage = Some(usage);
        }
        if data.end {
            self.finished = true;
            out.push(StreamChunk::Done { usage: self.usage });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

#[async_trait]
impl KnowledgeBase for VikingClient {
    async fn find_collection(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<Collection>, ClientError> {
        let body = serde_json::json!({ "name": name, "project": project });
        let envelope: Envelope<CollectionData> =
            self.call(COLLECTION_INFO_PATH, &body, ADMIN_TIMEOUT).await?;
        if !envelope.is_ok() {
            debug!(name, code = envelope.code, "collection not provisioned");
            return Ok(None);
        }
        let data = envelope.into_data()?;
        Ok(Some(Collection {
            name: name.to_string(),
            project: project.to_string(),
            resource_id: data.resource_id,
        }))
    }

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
        project: &str,
    ) -> Result<Collection, ClientError> {
        let body = serde_json::json!({
            "name": name,
            "description": description,
            "version": COLLECTION_VERSION,
            "project": project,
        });
        let data: CollectionData = self
            .call(CREATE_COLLECTION_PATH, &body, ADMIN_TIMEOUT)
            .await?
            .into_data()?;
        Ok(Collection {
            name: if data.name.is_empty() {
                name.to_string()
            } else {
                data.name
            },
            project: if data.project.is_empty() {
                project.to_string()
            } else {
                data.project
            },
            resource_id: data.resource_id,
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError> {
        let envelope: Envelope<SearchData> = self
            .call(SEARCH_PATH, &search_body(request), SEARCH_TIMEOUT)
            .await?;
        // A successful search over an empty collection may omit `data`.
        envelope.check_then_default().map(|data| SearchResponse {
            hits: data.result_list.into_iter().map(SearchHit::from).collect(),
        })
    }

    async fn add_document(&self, document: &NewDocument) -> Result<(), ClientError> {
        self.call::<serde_json::Value>(DOC_ADD_PATH, &document_body(document), ADMIN_TIMEOUT)
            .await?
            .check()
    }

    async fn delete_document(&self, resource_id: &str, doc_id: &str) -> Result<(), ClientError> {
        let body = serde_json::json!({ "resource_id": resource_id, "doc_id": doc_id });
        self.call::<serde_json::Value>(DOC_DELETE_PATH, &body, ADMIN_TIMEOUT)
            .await?
            .check()
    }

    async fn list_documents(
        &self,
        resource_id: &str,
        limit: u32,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        let body = serde_json::json!({ "resource_id": resource_id, "limit": limit });
        let envelope: Envelope<DocListData> =
            self.call(DOC_LIST_PATH, &body, ADMIN_TIMEOUT).await?;
        let data = envelope.check_then_default()?;
        Ok(data
            .doc_list
            .into_iter()
            .map(|d| DocumentRecord {
                doc_id: d.doc_id,
                doc_name: d.doc_name,
                process_status: d.status.process_status,
            })
            .collect())
    }
}

impl<T: Default> Envelope<T> {
    fn check_then_default(self) -> Result<T, ClientError> {
        if self.code != 0 {
            return Err(ClientError::Application {
                code: self.code,
                message: self.message,
            });
        }
        Ok(self.data.unwrap_or_default())
    }
}

#[async_trait]
impl ChatModel for VikingClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, ClientError> {
        let data: ChatData = self
            .call(CHAT_PATH, &self.chat_body(messages, false), CHAT_TIMEOUT)
            .await?
            .into_data()?;
        Ok(Completion {
            text: data.generated_answer,
            usage: TokenUsage::parse(&data.usage),
            reasoning: Some(data.reasoning_content).filter(|r| !r.is_empty()),
        })
    }

    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ClientError> {
        let bytes = serde_json::to_vec(&self.chat_body(messages, true))
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let response = self
            .signed_post(CHAT_PATH, bytes, CHAT_TIMEOUT)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = FrameDecoder::default();
            while let Some(chunk) = body.next().await {
                let decoded = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => Err(ClientError::from(e)),
                };
                match decoded {
                    Ok(items) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            match decoder.finish() {
                Ok(items) => {
                    for item in items {
                        yield Ok(item);
                    }
                }
                Err(e) => yield Err(e),
            }
        };
        Ok(Box::pin(stream))
    }
}
