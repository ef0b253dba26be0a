//! In-memory fakes for the gateway's external collaborators.
//!
//! Each fake is configured with builder methods before being wrapped in an
//! `Arc`, and records what it was asked to do so tests can assert on it.
//! Failures are switched on per operation and surface as
//! [`ClientError::Application`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use mkb_core::agent::{Agent, AgentFactory, AgentMessage};
use mkb_core::error::ClientError;
use mkb_core::knowledge::{
    Collection, DEFAULT_PROJECT, DocumentRecord, KnowledgeBase, NewDocument, SearchHit,
    SearchRequest, SearchResponse, collection_name,
};
use mkb_core::llm::{ChatMessage, ChatModel, ChunkStream, Completion, StreamChunk, TokenUsage};
use mkb_core::storage::{ObjectStore, StoredObject};

fn injected(what: &str) -> ClientError {
    ClientError::Application {
        code: 1_000_001,
        message: format!("injected {what} failure"),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("fake state mutex poisoned")
}

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KbState {
    collections: HashMap<(String, String), Collection>,
    hits: Vec<SearchHit>,
    documents: Vec<DocumentRecord>,
    fail_lookup: bool,
    fail_create: bool,
    fail_search: bool,
    fail_add: bool,
    fail_delete: bool,
    searches: Vec<SearchRequest>,
    created: Vec<String>,
    added: Vec<NewDocument>,
    deleted: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeKnowledgeBase {
    state: Mutex<KbState>,
}

impl FakeKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision `kb_<tenant_id>` in the default project. Its resource ID
    /// is `res-<tenant_id>`.
    pub fn with_tenant(self, tenant_id: &str) -> Self {
        {
            let mut state = lock(&self.state);
            let name = collection_name(tenant_id);
            state.collections.insert(
                (name.clone(), DEFAULT_PROJECT.to_string()),
                Collection {
                    name,
                    project: DEFAULT_PROJECT.to_string(),
                    resource_id: format!("res-{tenant_id}"),
                },
            );
        }
        self
    }

    /// Hits returned by every search.
    pub fn with_hits(self, hits: Vec<SearchHit>) -> Self {
        lock(&self.state).hits = hits;
        self
    }

    /// Records returned by `list_documents`.
    pub fn with_documents(self, documents: Vec<DocumentRecord>) -> Self {
        lock(&self.state).documents = documents;
        self
    }

    pub fn failing_lookup(self) -> Self {
        lock(&self.state).fail_lookup = true;
        self
    }

    pub fn failing_create(self) -> Self {
        lock(&self.state).fail_create = true;
        self
    }

    pub fn failing_search(self) -> Self {
        lock(&self.state).fail_search = true;
        self
    }

    pub fn failing_add(self) -> Self {
        lock(&self.state).fail_add = true;
        self
    }

    pub fn failing_delete(self) -> Self {
        lock(&self.state).fail_delete = true;
        self
    }

    pub fn is_provisioned(&self, tenant_id: &str) -> bool {
        lock(&self.state)
            .collections
            .contains_key(&(collection_name(tenant_id), DEFAULT_PROJECT.to_string()))
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        lock(&self.state).searches.clone()
    }

    /// Names of collections created through `create_collection`.
    pub fn created_collections(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn added_documents(&self) -> Vec<NewDocument> {
        lock(&self.state).added.clone()
    }

    /// `(resource_id, doc_id)` pairs passed to `delete_document`.
    pub fn deleted_documents(&self) -> Vec<(String, String)> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl KnowledgeBase for FakeKnowledgeBase {
    async fn find_collection(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<Collection>, ClientError> {
        let state = lock(&self.state);
        if state.fail_lookup {
            return Err(injected("lookup"));
        }
        Ok(state
            .collections
            .get(&(name.to_string(), project.to_string()))
            .cloned())
    }

    async fn create_collection(
        &self,
        name: &str,
        _description: &str,
        project: &str,
    ) -> Result<Collection, ClientError> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(injected("create"));
        }
        let collection = Collection {
            name: name.to_string(),
            project: project.to_string(),
            resource_id: format!("res-{name}"),
        };
        state
            .collections
            .insert((name.to_string(), project.to_string()), collection.clone());
        state.created.push(name.to_string());
        Ok(collection)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError> {
        let mut state = lock(&self.state);
        state.searches.push(request.clone());
        if state.fail_search {
            return Err(injected("search"));
        }
        Ok(SearchResponse {
            hits: state.hits.clone(),
        })
    }

    async fn add_document(&self, document: &NewDocument) -> Result<(), ClientError> {
        let mut state = lock(&self.state);
        if state.fail_add {
            return Err(injected("add document"));
        }
        state.added.push(document.clone());
        Ok(())
    }

    async fn delete_document(&self, resource_id: &str, doc_id: &str) -> Result<(), ClientError> {
        let mut state = lock(&self.state);
        if state.fail_delete {
            return Err(injected("delete document"));
        }
        state
            .deleted
            .push((resource_id.to_string(), doc_id.to_string()));
        Ok(())
    }

    async fn list_documents(
        &self,
        _resource_id: &str,
        limit: u32,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        let state = lock(&self.state);
        Ok(state
            .documents
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Chat model
// ---------------------------------------------------------------------------

struct ChatState {
    answer: String,
    usage: Option<TokenUsage>,
    chunks: Vec<String>,
    fail_complete: bool,
    fail_stream_start: bool,
    fail_stream_after: Option<usize>,
    requests: Vec<Vec<ChatMessage>>,
}

pub struct FakeChatModel {
    model: String,
    state: Mutex<ChatState>,
}

impl FakeChatModel {
    /// A text model that answers `answer` to every request.
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            model: "fake-model".to_string(),
            state: Mutex::new(ChatState {
                answer: answer.into(),
                usage: None,
                chunks: Vec::new(),
                fail_complete: false,
                fail_stream_start: false,
                fail_stream_after: None,
                requests: Vec::new(),
            }),
        }
    }

    /// Names containing `vision` make callers attach images.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_usage(self, usage: TokenUsage) -> Self {
        lock(&self.state).usage = Some(usage);
        self
    }

    /// Text chunks emitted by `complete_stream`, before the `Done` item.
    pub fn with_chunks(self, chunks: &[&str]) -> Self {
        lock(&self.state).chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn failing(self) -> Self {
        let mut state = lock(&self.state);
        state.fail_complete = true;
        state.fail_stream_start = true;
        drop(state);
        self
    }

    /// Emit `n` chunks, then an error instead of the rest.
    pub fn failing_stream_after(self, n: usize) -> Self {
        lock(&self.state).fail_stream_after = Some(n);
        self
    }

    /// Message lists received, in call order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.state).requests.clone()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, ClientError> {
        let mut state = lock(&self.state);
        state.requests.push(messages.to_vec());
        if state.fail_complete {
            return Err(injected("completion"));
        }
        Ok(Completion {
            text: state.answer.clone(),
            usage: state.usage,
            reasoning: None,
        })
    }

    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ClientError> {
        let mut state = lock(&self.state);
        state.requests.push(messages.to_vec());
        if state.fail_stream_start {
            return Err(injected("stream"));
        }

        let mut items: Vec<Result<StreamChunk, ClientError>> = Vec::new();
        for (i, chunk) in state.chunks.iter().enumerate() {
            if state.fail_stream_after == Some(i) {
                items.push(Err(injected("stream")));
                return Ok(Box::pin(futures::stream::iter(items)));
            }
            items.push(Ok(StreamChunk::Text(chunk.clone())));
        }
        if state.fail_stream_after.is_some_and(|n| n >= state.chunks.len()) {
            items.push(Err(injected("stream")));
        } else {
            items.push(Ok(StreamChunk::Done { usage: state.usage }));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AgentState {
    replies: VecDeque<Result<String, String>>,
    fail_init: bool,
    created: usize,
    prompts: Vec<String>,
    tools: Vec<String>,
}

/// Hands out agents that answer from a shared script.
///
/// Scripted replies are consumed in order across all agents; once the
/// script is empty every agent answers `"done"`.
#[derive(Default)]
pub struct FakeAgentFactory {
    state: Arc<Mutex<AgentState>>,
}

impl FakeAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        lock(&self.state).replies.push_back(Ok(content.into()));
        self
    }

    pub fn reply_error(self, message: impl Into<String>) -> Self {
        lock(&self.state).replies.push_back(Err(message.into()));
        self
    }

    pub fn failing_init(self) -> Self {
        lock(&self.state).fail_init = true;
        self
    }

    pub fn with_tools(self, summaries: &[&str]) -> Self {
        lock(&self.state).tools = summaries.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Number of agents created so far.
    pub fn created(&self) -> usize {
        lock(&self.state).created
    }

    /// Every prompt the agents received, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }
}

struct FakeAgent {
    state: Arc<Mutex<AgentState>>,
}

#[async_trait]
impl Agent for FakeAgent {
    async fn generate(&self, messages: &[AgentMessage]) -> Result<AgentMessage, ClientError> {
        let mut state = lock(&self.state);
        state
            .prompts
            .extend(messages.iter().map(|m| m.content.clone()));
        match state.replies.pop_front() {
            Some(Ok(content)) => Ok(AgentMessage::assistant(content)),
            Some(Err(message)) => Err(ClientError::Agent(message)),
            None => Ok(AgentMessage::assistant("done")),
        }
    }
}

#[async_trait]
impl AgentFactory for FakeAgentFactory {
    async fn create(&self) -> Result<Box<dyn Agent>, ClientError> {
        let mut state = lock(&self.state);
        if state.fail_init {
            return Err(ClientError::Config("injected agent init failure".to_string()));
        }
        state.created += 1;
        Ok(Box::new(FakeAgent {
            state: Arc::clone(&self.state),
        }))
    }

    fn tool_summaries(&self) -> Vec<String> {
        lock(&self.state).tools.clone()
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, (Vec<u8>, String)>,
    fail_put: bool,
    fail_delete: bool,
    fail_list: bool,
}

#[derive(Default)]
pub struct FakeObjectStore {
    state: Mutex<StoreState>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, key: &str, body: &[u8]) -> Self {
        lock(&self.state).objects.insert(
            key.to_string(),
            (body.to_vec(), "application/octet-stream".to_string()),
        );
        self
    }

    pub fn failing_put(self) -> Self {
        lock(&self.state).fail_put = true;
        self
    }

    pub fn failing_delete(self) -> Self {
        lock(&self.state).fail_delete = true;
        self
    }

    pub fn failing_list(self) -> Self {
        lock(&self.state).fail_list = true;
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.state).objects.contains_key(key)
    }

    /// Body and content type of a stored object.
    pub fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        lock(&self.state).objects.get(key).cloned()
    }

    /// URL the fake hands out for `key`.
    pub fn url_for(key: &str) -> String {
        format!("https://store.test/{key}?signature=fake")
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ClientError> {
        let mut state = lock(&self.state);
        if state.fail_put {
            return Err(injected("put"));
        }
        state
            .objects
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    fn presigned_get_url(&self, key: &str) -> Result<String, ClientError> {
        Ok(Self::url_for(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ClientError> {
        let state = lock(&self.state);
        if state.fail_list {
            return Err(injected("list"));
        }
        let mut objects: Vec<StoredObject> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (body, _))| StoredObject::new(key.as_str(), body.len() as u64, None))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        Ok(lock(&self.state).objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), ClientError> {
        let mut state = lock(&self.state);
        if state.fail_delete {
            return Err(injected("delete"));
        }
        state.objects.remove(key);
        Ok(())
    }
}
