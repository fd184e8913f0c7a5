//! Tree-document repository
//!
//! `TreeRepository` is the adapter the document layer talks to. It owns the
//! session lifecycle, compiles queries, builds patches and is the single
//! place where backend failures are translated into [`StoreError`].
//!
//! ## Operations
//!
//! - records: `create_state(s)`, `read_state`, `read_partial_state`,
//!   `read_states`, `update_state`, `delete_states`
//! - lookups: `query_key_value(_ids/_presence)`, `read_child_state`,
//!   `has_child`
//! - queries: `query_and_fetch`, `find_all`
//! - cursors: `scroll`, `scroll_next`, `close_scroll`
//! - locks: `get_lock`, `set_lock`, `remove_lock`
//! - GC: `mark_referenced_blobs`

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::backend::*;
use crate::blobs;
use crate::config::{RepositoryConfig, DEFAULT_SCROLL_KEEP_ALIVE_SECS};
use crate::error::StoreError;
use crate::expr::{Expression, OrderByClause, SelectClause};
use crate::http::HttpBackend;
use crate::lock::{Lock, LockReply};
use crate::patch::build_patch;
use crate::query::{
    CompiledQuery, CompilerConfig, ElementPath, PathResolver, Projection, QueryCompiler,
    QueryNode, Rematch, WildcardRematch,
};
use crate::schema::TypeCatalog;
use crate::scroll::{Cursor, ScrollRegistry, ScrollResult};
use crate::session::{translate, SessionGuard};
use crate::state::{State, StateDiff, Value, KEY_ID, KEY_NAME, KEY_PARENT_ID};
use crate::tree;
use crate::Result;

/// Total size reported with a [`PartialList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalSize {
    Exact(u64),
    /// The request did not ask for a count
    NotCounted,
    /// More matches than the requested count limit
    Truncated,
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialList {
    pub items: Vec<State>,
    pub total: TotalSize,
}

/// A query issued through [`TreeRepository::query_and_fetch`].
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub filter: Expression,
    pub select: SelectClause,
    pub order_by: OrderByClause,
    pub limit: Option<usize>,
    pub offset: usize,
    pub count: CountMode,
    /// Restrict results to records readable by one of these principals
    pub principals: Option<Vec<String>>,
}

impl QueryRequest {
    pub fn new(filter: Expression) -> Self {
        Self {
            filter,
            select: SelectClause::new(),
            order_by: OrderByClause::new(),
            limit: None,
            offset: 0,
            count: CountMode::None,
            principals: None,
        }
    }

    pub fn with_select(mut self, select: SelectClause) -> Self {
        self.select = select;
        self
    }

    pub fn with_order_by(mut self, order_by: OrderByClause) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_count(mut self, count: CountMode) -> Self {
        self.count = count;
        self
    }

    pub fn with_principals<I, S>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principals = Some(principals.into_iter().map(Into::into).collect());
        self
    }
}

/// Lazily read records of [`TreeRepository::find_all`].
///
/// The session closes when the stream is drained, on [`close`](Self::close),
/// or when the stream is dropped.
pub struct StateStream {
    guard: Option<SessionGuard>,
    documents: BoxStream<'static, BackendResult<String>>,
}

impl StateStream {
    /// Next record; `None` once drained.
    pub async fn next(&mut self) -> Option<Result<State>> {
        self.guard.as_ref()?;
        match self.documents.next().await {
            Some(Ok(document)) => Some(tree::deserialize(&document)),
            Some(Err(e)) => {
                let err = translate(e, None);
                if let Err(close_err) = self.release().await {
                    warn!(error = %close_err, "closing failed stream");
                }
                Some(Err(err))
            }
            None => match self.release().await {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
        }
    }

    /// Release the session before the stream is drained.
    pub async fn close(mut self) -> Result<()> {
        self.release().await
    }

    async fn release(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(mut guard) => guard.close().await,
            None => Ok(()),
        }
    }
}

/// Equality on a top-level field, built directly as a native node.
fn key_value(catalog: &TypeCatalog, key: &str, value: &Value) -> Result<QueryNode> {
    let text = value.to_wire_text().ok_or_else(|| {
        StoreError::parse(format!("cannot look up by non-scalar value {value:?}"))
    })?;
    let path = ElementPath::field(key);
    Ok(match value {
        // stored only when true
        Value::Boolean(false) if catalog.is_true_or_absent(key) => QueryNode::exists(path).negate(),
        _ => QueryNode::value(path, text),
    })
}

fn excluding(ids: &[String]) -> Option<QueryNode> {
    if ids.is_empty() {
        return None;
    }
    Some(QueryNode::values(ElementPath::field(KEY_ID), ids.iter().cloned()).negate())
}

/// Id a refused batch insert refers to: the one the backend names, or the
/// only record of the batch.
fn offending_id<'d>(documents: &'d [(String, String)], message: &str) -> Option<&'d str> {
    let ids = || documents.iter().map(|(id, _)| id.as_str());
    ids()
        .find(|id| *id == message)
        .or_else(|| match documents {
            [(id, _)] => Some(id.as_str()),
            _ => None,
        })
        .or_else(|| ids().find(|id| message.contains(id)))
}

/// Value of a projected reference (`a/b`, `list/0/c`) in a record.
fn value_at(state: &State, name: &str) -> Value {
    let segments: Vec<&str> = name.split('/').collect();
    walk_state(state, &segments)
}

fn walk_state(state: &State, segments: &[&str]) -> Value {
    match segments.split_first() {
        None => Value::State(state.clone()),
        Some((key, rest)) => state
            .get(key)
            .map(|v| walk_value(v, rest))
            .unwrap_or(Value::Null),
    }
}

fn walk_value(value: &Value, segments: &[&str]) -> Value {
    let Some((segment, rest)) = segments.split_first() else {
        return value.clone();
    };
    let index = segment.parse::<usize>().ok();
    match value {
        Value::State(state) => walk_state(state, segments),
        Value::Array(items) => index
            .and_then(|i| items.get(i))
            .map(|v| walk_value(v, rest))
            .unwrap_or(Value::Null),
        Value::List(states) => index
            .and_then(|i| states.get(i))
            .map(|s| walk_state(s, rest))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Repository adapter over a [`DocumentBackend`].
pub struct TreeRepository {
    backend: Arc<dyn DocumentBackend>,
    catalog: Arc<TypeCatalog>,
    compiler: CompilerConfig,
    rematch: Arc<dyn Rematch>,
    path_resolver: Option<Arc<dyn PathResolver>>,
    scrolls: ScrollRegistry,
    scroll_keep_alive: Duration,
}

impl TreeRepository {
    pub fn new(backend: Arc<dyn DocumentBackend>, catalog: TypeCatalog) -> Self {
        let catalog = Arc::new(catalog);
        Self {
            backend,
            rematch: Arc::new(WildcardRematch::new(catalog.clone())),
            catalog,
            compiler: CompilerConfig::new(),
            path_resolver: None,
            scrolls: ScrollRegistry::default(),
            scroll_keep_alive: Duration::from_secs(DEFAULT_SCROLL_KEEP_ALIVE_SECS),
        }
    }

    /// Repository over the HTTP backend described by `config`.
    pub fn connect(config: &RepositoryConfig, catalog: TypeCatalog) -> Result<Self> {
        let backend = HttpBackend::new(config).map_err(|e| StoreError::Connection(e.message))?;
        info!(endpoint = %config.endpoint, "tree repository configured");
        Ok(Self::new(Arc::new(backend), catalog)
            .with_compiler_config(config.compiler_config())
            .with_scroll_keep_alive(config.scroll_keep_alive()))
    }

    pub fn with_compiler_config(mut self, config: CompilerConfig) -> Self {
        self.compiler = config;
        self
    }

    pub fn with_rematch(mut self, rematch: Arc<dyn Rematch>) -> Self {
        self.rematch = rematch;
        self
    }

    pub fn with_path_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.path_resolver = Some(resolver);
        self
    }

    pub fn with_scroll_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.scroll_keep_alive = keep_alive;
        self
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Compile a filter, projection and ordering without running it.
    pub fn compile(
        &self,
        filter: &Expression,
        select: &SelectClause,
        order_by: &OrderByClause,
        principals: Option<&[String]>,
    ) -> Result<CompiledQuery> {
        let mut compiler = QueryCompiler::new(&self.catalog, &self.compiler);
        if let Some(resolver) = self.path_resolver.as_deref() {
            compiler = compiler.with_path_resolver(resolver);
        }
        if let Some(principals) = principals {
            compiler = compiler.with_principals(principals);
        }
        compiler.compile(filter, select, order_by)
    }

    fn compile_filter(&self, filter: &Expression) -> Result<QueryNode> {
        let mut compiler = QueryCompiler::new(&self.catalog, &self.compiler);
        if let Some(resolver) = self.path_resolver.as_deref() {
            compiler = compiler.with_path_resolver(resolver);
        }
        compiler.compile_filter(filter)
    }

    async fn session(&self) -> Result<SessionGuard> {
        SessionGuard::open(self.backend.as_ref()).await
    }

    /// Run one search in its own session.
    async fn search(&self, request: SearchRequest) -> Result<SearchPage> {
        debug!(query = %request.text, "search");
        let mut guard = self.session().await?;
        let result = match guard.session() {
            Ok(session) => session
                .search(&request)
                .await
                .map_err(|e| translate(e, None)),
            Err(e) => Err(e),
        };
        guard.finish(result).await
    }

    async fn search_states(&self, request: SearchRequest) -> Result<Vec<State>> {
        self.search(request)
            .await?
            .hits
            .iter()
            .map(|hit| tree::deserialize(&hit.document))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    #[instrument(skip(self, state), fields(id = state.id().unwrap_or_default()))]
    pub async fn create_state(&self, state: &State) -> Result<()> {
        self.create_states(std::slice::from_ref(state)).await
    }

    #[instrument(skip(self, states), fields(count = states.len()))]
    pub async fn create_states(&self, states: &[State]) -> Result<()> {
        let documents = states
            .iter()
            .map(|state| {
                let id = state
                    .id()
                    .ok_or_else(|| StoreError::InvalidState(format!("record without {KEY_ID}")))?;
                Ok((id.to_string(), tree::serialize(state)))
            })
            .collect::<Result<Vec<_>>>()?;
        if documents.is_empty() {
            return Ok(());
        }
        let mut guard = self.session().await?;
        let result = match guard.session() {
            // a refused insert names the offending id
            Ok(session) => session.insert(&documents).await.map_err(|e| {
                let id = offending_id(&documents, &e.message).map(str::to_string);
                translate(e, id.as_deref())
            }),
            Err(e) => Err(e),
        };
        guard.finish(result).await
    }

    #[instrument(skip(self))]
    pub async fn read_state(&self, id: &str) -> Result<Option<State>> {
        let request = SearchRequest::new(QueryNode::value(ElementPath::field(KEY_ID), id))
            .with_page(0, Some(1));
        Ok(self.search_states(request).await?.into_iter().next())
    }

    /// Read only `keys` of a record; absent keys are absent from the result.
    #[instrument(skip(self))]
    pub async fn read_partial_state(&self, id: &str, keys: &[&str]) -> Result<Option<State>> {
        let fields = keys.iter().map(|k| ElementPath::field(k)).collect();
        let request = SearchRequest::new(QueryNode::value(ElementPath::field(KEY_ID), id))
            .with_fields(fields)
            .with_page(0, Some(1));
        Ok(self.search_states(request).await?.into_iter().next())
    }

    /// Read several records, in the order of `ids`; unknown ids are skipped.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn read_states(&self, ids: &[String]) -> Result<Vec<State>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = SearchRequest::new(QueryNode::values(
            ElementPath::field(KEY_ID),
            ids.iter().cloned(),
        ));
        let mut states = self.search_states(request).await?;
        let position = |s: &State| {
            s.id()
                .and_then(|id| ids.iter().position(|i| i == id))
                .unwrap_or(usize::MAX)
        };
        states.sort_by_key(position);
        Ok(states)
    }

    #[instrument(skip(self, diff))]
    pub async fn update_state(&self, id: &str, diff: &StateDiff) -> Result<()> {
        let ops = build_patch(diff, &self.catalog)?;
        if ops.is_empty() {
            return Ok(());
        }
        debug!(ops = ops.len(), "patching record");
        let mut guard = self.session().await?;
        let result = match guard.session() {
            Ok(session) => session
                .patch(id, &ops)
                .await
                .map_err(|e| translate(e, Some(id))),
            Err(e) => Err(e),
        };
        guard.finish(result).await
    }

    /// Delete records; unknown ids are ignored.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn delete_states(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.session().await?;
        let result = match guard.session() {
            Ok(session) => session.delete(ids).await.map_err(|e| translate(e, None)),
            Err(e) => Err(e),
        };
        guard.finish(result).await
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Records whose `key` equals `value`.
    #[instrument(skip(self, value))]
    pub async fn query_key_value(&self, key: &str, value: &Value) -> Result<Vec<State>> {
        let query = key_value(&self.catalog, key, value)?;
        self.search_states(SearchRequest::new(query)).await
    }

    /// Ids of the records whose `key` equals `value`.
    #[instrument(skip(self, value))]
    pub async fn query_key_value_ids(&self, key: &str, value: &Value) -> Result<Vec<String>> {
        let query = key_value(&self.catalog, key, value)?;
        let request = SearchRequest::new(query).with_fields(vec![ElementPath::field(KEY_ID)]);
        Ok(self
            .search_states(request)
            .await?
            .iter()
            .filter_map(|s| s.id().map(str::to_string))
            .collect())
    }

    /// Whether a record other than `ignored` has `key` equal to `value`.
    #[instrument(skip(self, value, ignored))]
    pub async fn query_key_value_presence(
        &self,
        key: &str,
        value: &Value,
        ignored: &[String],
    ) -> Result<bool> {
        let mut nodes = vec![key_value(&self.catalog, key, value)?];
        nodes.extend(excluding(ignored));
        let query = QueryNode::and(nodes);
        let request = SearchRequest::new(query)
            .with_fields(vec![ElementPath::field(KEY_ID)])
            .with_page(0, Some(1));
        Ok(!self.search(request).await?.hits.is_empty())
    }

    fn child_query(parent_id: &str, name: &str, ignored: &[String]) -> QueryNode {
        let mut nodes = vec![
            QueryNode::value(ElementPath::field(KEY_PARENT_ID), parent_id),
            QueryNode::value(ElementPath::field(KEY_NAME), name),
        ];
        nodes.extend(excluding(ignored));
        QueryNode::and(nodes)
    }

    /// The child of `parent_id` named `name`, skipping `ignored` ids.
    #[instrument(skip(self, ignored))]
    pub async fn read_child_state(
        &self,
        parent_id: &str,
        name: &str,
        ignored: &[String],
    ) -> Result<Option<State>> {
        let query = Self::child_query(parent_id, name, ignored);
        let request = SearchRequest::new(query).with_page(0, Some(1));
        Ok(self.search_states(request).await?.into_iter().next())
    }

    #[instrument(skip(self, ignored))]
    pub async fn has_child(&self, parent_id: &str, name: &str, ignored: &[String]) -> Result<bool> {
        let query = Self::child_query(parent_id, name, ignored);
        let request = SearchRequest::new(query)
            .with_fields(vec![ElementPath::field(KEY_ID)])
            .with_page(0, Some(1));
        Ok(!self.search(request).await?.hits.is_empty())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Run a query and return one page of rows.
    #[instrument(skip(self, request), fields(limit = ?request.limit, offset = request.offset))]
    pub async fn query_and_fetch(&self, request: &QueryRequest) -> Result<PartialList> {
        let compiled = self.compile(
            &request.filter,
            &request.select,
            &request.order_by,
            request.principals.as_deref(),
        )?;
        let query = SearchRequest::new(compiled.query.clone()).with_order(compiled.order_by.clone());

        let (items, total) = match &compiled.projection {
            Projection::Manual { fields } => {
                // rows are per binding: fetch every record and page the rows
                let page = self.search(query).await?;
                let mut rows = Vec::new();
                for hit in &page.hits {
                    let record = match tree::deserialize(&hit.document) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(error = %e, "skipping unreadable record");
                            continue;
                        }
                    };
                    match self.rematch.rematch(&record, &compiled.filter, fields) {
                        Ok(found) => rows.extend(found),
                        Err(e) => warn!(id = record.id(), error = %e, "skipping record"),
                    }
                }
                let total = rows.len() as u64;
                let items = rows
                    .into_iter()
                    .skip(request.offset)
                    .take(request.limit.unwrap_or(usize::MAX))
                    .collect();
                let total = match request.count {
                    CountMode::None => None,
                    CountMode::Exact => Some(total),
                    CountMode::UpTo(n) => Some(total.min(n.saturating_add(1))),
                };
                (items, total)
            }
            projection => {
                let mut search = query
                    .with_page(request.offset, request.limit)
                    .with_count(request.count);
                if let Projection::Fields(fields) = projection {
                    let paths = fields.iter().filter_map(|f| f.path.clone()).collect();
                    search = search.with_fields(paths);
                }
                let page = self.search(search).await?;
                let mut items = Vec::with_capacity(page.hits.len());
                for hit in &page.hits {
                    let record = tree::deserialize(&hit.document)?;
                    items.push(match projection {
                        Projection::Fields(fields) => fields
                            .iter()
                            .map(|f| match f.path {
                                None => (f.name.clone(), Value::Double(hit.score)),
                                Some(_) => (f.name.clone(), value_at(&record, &f.name)),
                            })
                            .collect(),
                        _ => record,
                    });
                }
                (items, page.total)
            }
        };

        let total = match (request.count, total) {
            (CountMode::None, _) | (_, None) => TotalSize::NotCounted,
            (CountMode::UpTo(n), Some(t)) if t > n => TotalSize::Truncated,
            (_, Some(t)) => TotalSize::Exact(t),
        };
        Ok(PartialList { items, total })
    }

    /// Stream every record matching `filter` without buffering them.
    #[instrument(skip(self, filter))]
    pub async fn find_all(&self, filter: &Expression) -> Result<StateStream> {
        let query = self.compile_filter(filter)?;
        self.stream(SearchRequest::new(query)).await
    }

    async fn stream(&self, request: SearchRequest) -> Result<StateStream> {
        let mut guard = self.session().await?;
        let documents = match guard.session() {
            Ok(session) => session.stream(request).await.map_err(|e| translate(e, None)),
            Err(e) => Err(e),
        };
        match documents {
            Ok(documents) => Ok(StateStream {
                guard: Some(guard),
                documents,
            }),
            Err(e) => guard.finish(Err(e)).await,
        }
    }

    // -----------------------------------------------------------------------
    // Scroll
    // -----------------------------------------------------------------------

    /// Open a cursor over the ids matching `filter` and return its first batch.
    #[instrument(skip(self, filter))]
    pub async fn scroll(
        &self,
        filter: &Expression,
        batch_size: usize,
        keep_alive: Option<Duration>,
    ) -> Result<ScrollResult> {
        self.scrolls.reclaim().await;
        let query = self.compile_filter(filter)?;
        let request = SearchRequest::new(query).with_fields(vec![ElementPath::field(KEY_ID)]);
        let mut guard = self.session().await?;
        let documents = match guard.session() {
            Ok(session) => session.stream(request).await.map_err(|e| translate(e, None)),
            Err(e) => Err(e),
        };
        let documents = match documents {
            Ok(documents) => documents,
            Err(e) => return guard.finish(Err(e)).await,
        };
        let cursor = Cursor::new(
            guard,
            documents,
            batch_size,
            keep_alive.unwrap_or(self.scroll_keep_alive),
        );
        let scroll_id = self.scrolls.register(cursor);
        debug!(%scroll_id, "opened scroll");
        self.scroll_next(&scroll_id).await
    }

    /// Next batch of a cursor. The empty batch closes the cursor.
    #[instrument(skip(self))]
    pub async fn scroll_next(&self, scroll_id: &str) -> Result<ScrollResult> {
        self.scrolls.reclaim().await;
        let mut cursor = self.scrolls.check_out(scroll_id)?;
        match cursor.next_batch().await {
            Ok(ids) if ids.is_empty() => {
                debug!(%scroll_id, "scroll exhausted");
                cursor.close().await?;
                Ok(ScrollResult {
                    scroll_id: scroll_id.to_string(),
                    ids,
                })
            }
            Ok(ids) => {
                self.scrolls.put_back(scroll_id.to_string(), cursor);
                Ok(ScrollResult {
                    scroll_id: scroll_id.to_string(),
                    ids,
                })
            }
            Err(e) => {
                if let Err(close_err) = cursor.close().await {
                    warn!(%scroll_id, error = %close_err, "closing failed scroll");
                }
                Err(e)
            }
        }
    }

    /// Release a cursor early. Returns whether it was still open.
    #[instrument(skip(self))]
    pub async fn close_scroll(&self, scroll_id: &str) -> Result<bool> {
        match self.scrolls.check_out(scroll_id) {
            Ok(cursor) => {
                cursor.close().await?;
                Ok(true)
            }
            Err(StoreError::ScrollNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cursors currently open.
    pub fn active_scrolls(&self) -> usize {
        self.scrolls.len()
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    async fn lock_procedure(
        &self,
        procedure: &str,
        id: &str,
        params: &[(&str, &str)],
    ) -> Result<LockReply> {
        let mut all = vec![(PARAM_ID, id)];
        all.extend_from_slice(params);
        let mut guard = self.session().await?;
        let result = match guard.session() {
            Ok(session) => session
                .invoke(procedure, &all)
                .await
                .map_err(|e| translate(e, Some(id))),
            Err(e) => Err(e),
        };
        let document = guard.finish(result).await?;
        LockReply::parse(document.as_deref())
    }

    /// Current lock of a record. Fails with not-found for unknown records.
    #[instrument(skip(self))]
    pub async fn get_lock(&self, id: &str) -> Result<Option<Lock>> {
        Ok(self.lock_procedure(PROC_LOCK_GET, id, &[]).await?.lock)
    }

    /// Lock a record. Returns `None` when acquired, or the lock already held.
    #[instrument(skip(self, lock), fields(owner = %lock.owner))]
    pub async fn set_lock(&self, id: &str, lock: &Lock) -> Result<Option<Lock>> {
        let created = lock.created_text();
        let reply = self
            .lock_procedure(
                PROC_LOCK_SET,
                id,
                &[(PARAM_OWNER, lock.owner.as_str()), (PARAM_CREATED, created.as_str())],
            )
            .await?;
        Ok(if reply.failed { reply.lock } else { None })
    }

    /// Unlock a record, checking the owner when given. Returns the removed
    /// lock; a different owner fails with a lock mismatch.
    #[instrument(skip(self))]
    pub async fn remove_lock(&self, id: &str, owner: Option<&str>) -> Result<Option<Lock>> {
        let params: Vec<(&str, &str)> = owner.map(|o| (PARAM_OWNER, o)).into_iter().collect();
        let reply = self.lock_procedure(PROC_LOCK_REMOVE, id, &params).await?;
        if reply.failed {
            return Err(StoreError::LockMismatch {
                id: id.to_string(),
                owner: reply.lock.map(|l| l.owner).unwrap_or_default(),
            });
        }
        Ok(reply.lock)
    }

    // -----------------------------------------------------------------------
    // Blob GC
    // -----------------------------------------------------------------------

    /// Call `mark` for every blob key referenced by a record; returns how
    /// many references were marked.
    #[instrument(skip(self, mark))]
    pub async fn mark_referenced_blobs<F>(&self, mut mark: F) -> Result<u64>
    where
        F: FnMut(&str) + Send,
    {
        let fields = blobs::blob_fields(&self.catalog);
        if fields.is_empty() {
            return Ok(0);
        }
        let request = SearchRequest::new(QueryNode::or(
            fields
                .iter()
                .map(|f| QueryNode::exists(ElementPath::field(f)))
                .collect(),
        ));
        let mut stream = self.stream(request).await?;
        let mut marked = 0u64;
        while let Some(record) = stream.next().await {
            let record = match record {
                Ok(record) => record,
                Err(e @ StoreError::Deserialization(_)) => {
                    warn!(error = %e, "skipping unreadable record");
                    continue;
                }
                Err(e) => {
                    stream.close().await?;
                    return Err(e);
                }
            };
            for key in blobs::referenced_blob_keys(&record, &self.catalog) {
                mark(&key);
                marked += 1;
            }
        }
        info!(marked, "marked referenced blobs");
        Ok(marked)
    }
}
