//! Backend contract
//!
//! The repository talks to the document database only through these traits.
//! A [`DocumentBackend`] hands out sessions; everything else happens on a
//! [`BackendSession`], which the caller must [`close`](BackendSession::close).
//!
//! Documents cross this boundary as tree document text (see [`crate::tree`]).

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;
use crate::patch::PatchOp;
use crate::query::{ElementPath, QueryNode, SortDirective};

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Procedure returning the lock of a record.
pub const PROC_LOCK_GET: &str = "lock-get";
/// Procedure atomically setting a lock unless one is held.
pub const PROC_LOCK_SET: &str = "lock-set";
/// Procedure atomically removing a lock, checking the owner if given.
pub const PROC_LOCK_REMOVE: &str = "lock-remove";

/// Procedure parameter naming the record.
pub const PARAM_ID: &str = "id";
/// Procedure parameter naming the lock owner.
pub const PARAM_OWNER: &str = "owner";
/// Procedure parameter carrying the lock creation time.
pub const PARAM_CREATED: &str = "created";

/// How many matches a search should count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountMode {
    #[default]
    None,
    Exact,
    /// Count at most `n + 1` matches, enough to tell "more than n"
    UpTo(u64),
}

/// One search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: QueryNode,
    /// Native rendering of `query`
    pub text: String,
    pub order: Vec<SortDirective>,
    /// Elements to extract; `None` returns whole documents
    pub fields: Option<Vec<ElementPath>>,
    pub start: usize,
    pub page_length: Option<usize>,
    pub count: CountMode,
}

impl SearchRequest {
    pub fn new(query: QueryNode) -> Self {
        let text = query.to_string();
        Self {
            query,
            text,
            order: Vec::new(),
            fields: None,
            start: 0,
            page_length: None,
            count: CountMode::None,
        }
    }

    pub fn with_order(mut self, order: Vec<SortDirective>) -> Self {
        self.order = order;
        self
    }

    pub fn with_fields(mut self, fields: Vec<ElementPath>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_page(mut self, start: usize, page_length: Option<usize>) -> Self {
        self.start = start;
        self.page_length = page_length;
        self
    }

    pub fn with_count(mut self, count: CountMode) -> Self {
        self.count = count;
        self
    }
}

/// One matching document.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document: String,
    /// Fulltext relevance, 0 when the query has no word predicate
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Set when the request asked for a count
    pub total: Option<u64>,
}

/// Factory of backend sessions.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn open_session(&self) -> BackendResult<Box<dyn BackendSession>>;
}

/// A session on the document database.
#[async_trait]
pub trait BackendSession: Send {
    /// Run a query and return one page of results.
    async fn search(&mut self, request: &SearchRequest) -> BackendResult<SearchPage>;

    /// Run a query and stream every matching document without buffering the
    /// whole result. Paging fields of the request are ignored.
    async fn stream(
        &mut self,
        request: SearchRequest,
    ) -> BackendResult<BoxStream<'static, BackendResult<String>>>;

    /// Invoke a named server-side procedure; returns its document, if any.
    async fn invoke(
        &mut self,
        procedure: &str,
        params: &[(&str, &str)],
    ) -> BackendResult<Option<String>>;

    /// Insert documents by id. Fails with a duplicate error if any id exists.
    async fn insert(&mut self, documents: &[(String, String)]) -> BackendResult<()>;

    /// Delete documents by id. Unknown ids are ignored.
    async fn delete(&mut self, ids: &[String]) -> BackendResult<()>;

    /// Apply a patch to one document atomically.
    async fn patch(&mut self, id: &str, ops: &[PatchOp]) -> BackendResult<()>;

    /// Release the session. Idempotent.
    async fn close(&mut self) -> BackendResult<()>;
}
