//! In-memory document backend
//!
//! `MemoryBackend` satisfies the [`DocumentBackend`] contract without a
//! server: it evaluates compiled query trees over stored elements, applies
//! patches atomically per document and implements the lock procedures.
//! Tests and embedders use it; it also counts open sessions so leaks show up.

mod matcher;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::trace;

use crate::backend::*;
use crate::codec::{self, WireType, ARRAY_ITEM, TYPE_ATTR};
use crate::error::BackendError;
use crate::lock::FAILED_ATTR;
use crate::patch::PatchOp;
use crate::query::{ElementPath, SortDirective, Step};
use crate::state::{Delta, KEY_LOCK_CREATED, KEY_LOCK_OWNER};
use crate::tree::{Element, ROOT};

use matcher::{compare_typed, select, sort_key, Matcher};

/// Documents per page when streaming.
pub const DEFAULT_STREAM_PAGE_SIZE: usize = 50;

#[derive(Debug, Default)]
struct Inner {
    documents: Mutex<BTreeMap<String, Element>>,
    open_sessions: AtomicUsize,
    searches: AtomicUsize,
}

/// In-memory backend; clones share the same documents.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
    stream_page_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            stream_page_size: DEFAULT_STREAM_PAGE_SIZE,
        }
    }

    /// Streams fetch this many documents per page (at least one).
    pub fn with_stream_page_size(mut self, size: usize) -> Self {
        self.stream_page_size = size.max(1);
        self
    }

    /// Searches evaluated so far, one per streamed page.
    pub fn searches(&self) -> usize {
        self.inner.searches.load(AtomicOrdering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(AtomicOrdering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.documents().len()
    }

    /// Stored document text, as the server would return it.
    pub fn raw_document(&self, id: &str) -> Option<String> {
        self.documents().get(id).map(Element::to_xml)
    }

    fn documents(&self) -> MutexGuard<'_, BTreeMap<String, Element>> {
        self.inner
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn open_session(&self) -> BackendResult<Box<dyn BackendSession>> {
        self.inner.open_sessions.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemorySession {
            backend: self.clone(),
            closed: false,
        }))
    }
}

/// Session on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemorySession {
    backend: MemoryBackend,
    closed: bool,
}

impl MemorySession {
    fn check_open(&self) -> BackendResult<()> {
        if self.closed {
            Err(BackendError::other("session is closed"))
        } else {
            Ok(())
        }
    }

    /// Matching documents in result order, with their relevance.
    fn run(&self, request: &SearchRequest) -> Vec<(Element, f64)> {
        self.backend.run(request)
    }
}

impl MemoryBackend {
    fn run(&self, request: &SearchRequest) -> Vec<(Element, f64)> {
        self.inner.searches.fetch_add(1, AtomicOrdering::SeqCst);
        let documents = self.documents();
        let mut hits: Vec<(Element, f64)> = documents
            .values()
            .filter_map(|doc| {
                let mut m = Matcher::new();
                m.matches(doc, &request.query).then(|| (doc.clone(), m.score))
            })
            .collect();
        drop(documents);
        if !request.order.is_empty() {
            hits.sort_by(|a, b| compare_hits(&request.order, a, b));
        }
        hits
    }
}

fn compare_hits(order: &[SortDirective], a: &(Element, f64), b: &(Element, f64)) -> Ordering {
    for directive in order {
        let ord = match directive {
            SortDirective::Relevance => b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal),
            SortDirective::Index {
                path,
                wire_type,
                descending,
                ..
            } => {
                let ord = match (sort_key(&a.0, path), sort_key(&b.0, path)) {
                    (Some(x), Some(y)) => compare_typed(*wire_type, x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Copy of `doc` holding only the elements at `fields`.
fn project(doc: &Element, fields: &[ElementPath]) -> Element {
    let mut out = Element::new(doc.name.clone());
    for path in fields {
        let Some((parent, Step::Element(_))) = path.split_last() else {
            continue;
        };
        for found in select(doc, path) {
            if let Ok(target) = ensure(&mut out, &parent) {
                if !target.children.iter().any(|c| c.name == found.name) {
                    target.children.push(found.clone());
                }
            }
        }
    }
    out
}

fn respond(search: &SearchRequest, hits: Vec<(Element, f64)>) -> SearchPage {
    let total = match search.count {
        CountMode::None => None,
        CountMode::Exact => Some(hits.len() as u64),
        CountMode::UpTo(n) => Some((hits.len() as u64).min(n.saturating_add(1))),
    };
    let end = search
        .page_length
        .map(|len| search.start.saturating_add(len))
        .unwrap_or(usize::MAX);
    let hits = hits
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i >= search.start && *i < end)
        .map(|(_, (doc, score))| SearchHit {
            document: match &search.fields {
                Some(fields) => project(&doc, fields).to_xml(),
                None => doc.to_xml(),
            },
            score,
        })
        .collect();
    SearchPage { hits, total }
}

// ---------------------------------------------------------------------------
// Patch application
// ---------------------------------------------------------------------------

fn nth_item(el: &mut Element, n: usize) -> Option<&mut Element> {
    el.children.iter_mut().filter(|c| c.is_array_item()).nth(n)
}

/// Element at `path`, creating missing named elements on the way.
fn ensure<'e>(root: &'e mut Element, path: &ElementPath) -> BackendResult<&'e mut Element> {
    let mut current = root;
    for step in path.steps() {
        current = match step {
            Step::Element(name) => {
                let pos = match current.children.iter().position(|c| &c.name == name) {
                    Some(pos) => pos,
                    None => {
                        current.children.push(Element::new(name.clone()));
                        current.children.len() - 1
                    }
                };
                &mut current.children[pos]
            }
            Step::Item(Some(n)) => nth_item(current, *n)
                .ok_or_else(|| BackendError::conflict(format!("no item {} at {path}", n + 1)))?,
            Step::Item(None) => {
                return Err(BackendError::other(format!("ambiguous patch path {path}")))
            }
        };
    }
    Ok(current)
}

/// Existing element at `path`.
fn locate<'e>(root: &'e mut Element, path: &ElementPath) -> Option<&'e mut Element> {
    let mut current = root;
    for step in path.steps() {
        current = match step {
            Step::Element(name) => current.child_mut(name)?,
            Step::Item(Some(n)) => nth_item(current, *n)?,
            Step::Item(None) => return None,
        };
    }
    Some(current)
}

fn delete(root: &mut Element, path: &ElementPath) {
    let Some((parent, Step::Element(name))) = path.split_last() else {
        return;
    };
    let name = name.clone();
    if let Some(target) = locate(root, &parent) {
        target.children.retain(|c| c.name != name);
        let now_empty = target.children.is_empty() && target.type_attr().is_none();
        if now_empty && !parent.is_empty() && !target.is_array_item() {
            // an empty nested state is stored as absence
            delete(root, &parent);
        }
    }
}

fn add_delta(el: &mut Element, delta: Delta) -> BackendResult<()> {
    let current = match el.type_attr() {
        None if el.is_leaf() && el.text.is_empty() => None,
        Some(t) => match WireType::from_name(t) {
            Some(w) if w.is_numeric() => Some(
                w.parse(&el.text)
                    .map_err(|e| BackendError::other(format!("cannot increment {}: {e}", el.name)))?,
            ),
            _ => {
                return Err(BackendError::other(format!(
                    "cannot increment {} of type {t}",
                    el.name
                )))
            }
        },
        None => return Err(BackendError::other(format!("cannot increment {}", el.name))),
    };
    let next = match (current.and_then(|v| v.to_wire_text()), delta) {
        (None, d) => d.to_value(),
        (Some(text), Delta::Long(l)) if el.type_attr() == Some("long") => {
            let base: i64 = text.parse().unwrap_or_default();
            base.saturating_add(l).into()
        }
        (Some(text), d) => {
            let base: f64 = text.parse().unwrap_or_default();
            let add = match d {
                Delta::Long(l) => l as f64,
                Delta::Double(x) => x,
            };
            (base + add).into()
        }
    };
    el.set_attr(TYPE_ATTR, WireType::classify(&next).name());
    el.text = next.to_wire_text().unwrap_or_default();
    Ok(())
}

fn apply(doc: &mut Element, op: &PatchOp) -> BackendResult<()> {
    match op {
        PatchOp::Upsert { parent, fragment } => {
            let target = ensure(doc, parent)?;
            match target.children.iter_mut().find(|c| c.name == fragment.name) {
                Some(existing) => *existing = fragment.clone(),
                None => target.children.push(fragment.clone()),
            }
        }
        PatchOp::Delete { path } => delete(doc, path),
        PatchOp::ReplaceItem {
            list,
            position,
            fragment,
        } => {
            let item = locate(doc, list)
                .and_then(|l| nth_item(l, position.saturating_sub(1)))
                .ok_or_else(|| BackendError::conflict(format!("no item {position} in {list}")))?;
            *item = fragment.clone();
        }
        PatchOp::DeleteItem { list, position } => {
            let target = locate(doc, list)
                .ok_or_else(|| BackendError::conflict(format!("no list at {list}")))?;
            let index = target
                .children
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_array_item())
                .nth(position.saturating_sub(1))
                .map(|(i, _)| i)
                .ok_or_else(|| BackendError::conflict(format!("no item {position} in {list}")))?;
            target.children.remove(index);
        }
        PatchOp::InsertLast { list, fragment } => {
            let target = ensure(doc, list)?;
            target.attributes.remove(TYPE_ATTR);
            target.text.clear();
            let mut item = fragment.clone();
            item.name = ARRAY_ITEM.to_string();
            target.children.push(item);
        }
        PatchOp::ApplyDelta { path, delta } => add_delta(ensure(doc, path)?, *delta)?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lock procedures
// ---------------------------------------------------------------------------

fn param<'p>(params: &[(&str, &'p str)], name: &str) -> Option<&'p str> {
    params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

fn lock_document(doc: &Element) -> Element {
    let mut out = Element::new(ROOT);
    for key in [KEY_LOCK_OWNER, KEY_LOCK_CREATED] {
        if let Some(el) = doc.child(&codec::serialize_key(key)) {
            out.children.push(el.clone());
        }
    }
    out
}

fn lock_owner(doc: &Element) -> Option<&str> {
    doc.child(&codec::serialize_key(KEY_LOCK_OWNER))
        .map(|el| el.text.as_str())
}

fn refused(mut lock: Element) -> Element {
    lock.set_attr(FAILED_ATTR, "true");
    lock
}

impl MemorySession {
    fn procedure(&self, name: &str, params: &[(&str, &str)]) -> BackendResult<Option<String>> {
        let id = param(params, PARAM_ID)
            .ok_or_else(|| BackendError::other(format!("{name}: missing {PARAM_ID}")))?;
        let mut documents = self.backend.documents();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| BackendError::not_found(id.to_string()))?;
        let owner_key = codec::serialize_key(KEY_LOCK_OWNER);
        let created_key = codec::serialize_key(KEY_LOCK_CREATED);

        let response = match name {
            PROC_LOCK_GET => lock_document(doc),
            PROC_LOCK_SET => {
                if lock_owner(doc).is_some() {
                    refused(lock_document(doc))
                } else {
                    let owner = param(params, PARAM_OWNER).unwrap_or_default();
                    let created = param(params, PARAM_CREATED).unwrap_or_default();
                    doc.children
                        .push(Element::leaf(owner_key, WireType::String.name(), owner));
                    doc.children
                        .push(Element::leaf(created_key, WireType::Calendar.name(), created));
                    Element::new(ROOT)
                }
            }
            PROC_LOCK_REMOVE => {
                let current = lock_document(doc);
                let expected = param(params, PARAM_OWNER).filter(|o| !o.is_empty());
                let mismatch = matches!(
                    (lock_owner(doc), expected),
                    (Some(held), Some(wanted)) if held != wanted
                );
                if mismatch {
                    refused(current)
                } else {
                    doc.children
                        .retain(|c| c.name != owner_key && c.name != created_key);
                    current
                }
            }
            other => return Err(BackendError::not_found(format!("procedure {other}"))),
        };
        trace!(procedure = name, id, "invoked procedure");
        Ok(Some(response.to_xml()))
    }
}

#[async_trait]
impl BackendSession for MemorySession {
    async fn search(&mut self, request: &SearchRequest) -> BackendResult<SearchPage> {
        self.check_open()?;
        let hits = self.run(request);
        Ok(respond(request, hits))
    }

    async fn stream(
        &mut self,
        request: SearchRequest,
    ) -> BackendResult<BoxStream<'static, BackendResult<String>>> {
        self.check_open()?;
        let backend = self.backend.clone();
        let page_size = backend.stream_page_size;
        // (next start, exhausted)
        let pages = stream::try_unfold((0usize, false), move |(start, done)| {
            let backend = backend.clone();
            let mut page_request = request.clone();
            async move {
                if done {
                    return Ok(None);
                }
                page_request.start = start;
                page_request.page_length = Some(page_size);
                page_request.count = CountMode::None;
                let page = respond(&page_request, backend.run(&page_request));
                let fetched = page.hits.len();
                trace!(start, fetched, "streamed page");
                let documents: Vec<BackendResult<String>> =
                    page.hits.into_iter().map(|hit| Ok(hit.document)).collect();
                Ok::<_, BackendError>(Some((
                    stream::iter(documents),
                    (start + fetched, fetched < page_size),
                )))
            }
        });
        Ok(pages.try_flatten().boxed())
    }

    async fn invoke(
        &mut self,
        procedure: &str,
        params: &[(&str, &str)],
    ) -> BackendResult<Option<String>> {
        self.check_open()?;
        self.procedure(procedure, params)
    }

    async fn insert(&mut self, documents: &[(String, String)]) -> BackendResult<()> {
        self.check_open()?;
        let parsed = documents
            .iter()
            .map(|(id, xml)| {
                Element::parse(xml)
                    .map(|el| (id.clone(), el))
                    .map_err(BackendError::other)
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let mut stored = self.backend.documents();
        if let Some((id, _)) = parsed.iter().find(|(id, _)| stored.contains_key(id)) {
            return Err(BackendError::duplicate(id.clone()));
        }
        for (id, el) in parsed {
            stored.insert(id, el);
        }
        Ok(())
    }

    async fn delete(&mut self, ids: &[String]) -> BackendResult<()> {
        self.check_open()?;
        let mut stored = self.backend.documents();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn patch(&mut self, id: &str, ops: &[PatchOp]) -> BackendResult<()> {
        self.check_open()?;
        let mut stored = self.backend.documents();
        let current = stored
            .get(id)
            .ok_or_else(|| BackendError::not_found(id.to_string()))?;
        let mut updated = current.clone();
        for op in ops {
            apply(&mut updated, op)?;
        }
        stored.insert(id.to_string(), updated);
        Ok(())
    }

    async fn close(&mut self) -> BackendResult<()> {
        if !self.closed {
            self.closed = true;
            self.backend
                .inner
                .open_sessions
                .fetch_sub(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryNode;
    use crate::state::{State, Value, KEY_ID};
    use crate::tree;

    async fn seeded() -> (MemoryBackend, Box<dyn BackendSession>) {
        let backend = MemoryBackend::new();
        let mut session = backend.open_session().await.unwrap();
        let docs: Vec<(String, String)> = (1..=3)
            .map(|i| {
                let state = State::new()
                    .with(KEY_ID, format!("doc{i}"))
                    .with("size", i as i64)
                    .with("tags", Value::Array(vec!["a".into()]));
                (format!("doc{i}"), tree::serialize(&state))
            })
            .collect();
        session.insert(&docs).await.unwrap();
        (backend, session)
    }

    #[tokio::test]
    async fn test_search_pages_and_counts() {
        let (_backend, mut session) = seeded().await;
        let request = SearchRequest::new(QueryNode::all())
            .with_order(vec![SortDirective::Index {
                field: "size".into(),
                path: ElementPath::field("size"),
                wire_type: WireType::Long,
                descending: true,
            }])
            .with_page(1, Some(1))
            .with_count(CountMode::UpTo(1));
        let page = session.search(&request).await.unwrap();
        assert_eq!(page.total, Some(2));
        assert_eq!(page.hits.len(), 1);
        assert!(page.hits[0].document.contains("doc2"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let (_backend, mut session) = seeded().await;
        let err = session
            .insert(&[("doc1".into(), "<document/>".into())])
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::BackendErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn test_patch_is_atomic() {
        let (backend, mut session) = seeded().await;
        let before = backend.raw_document("doc1");
        let ops = vec![
            PatchOp::Delete {
                path: ElementPath::field("size"),
            },
            PatchOp::DeleteItem {
                list: ElementPath::field("tags"),
                position: 5,
            },
        ];
        let err = session.patch("doc1", &ops).await.unwrap_err();
        assert_eq!(err.kind, crate::error::BackendErrorKind::Conflict);
        assert_eq!(backend.raw_document("doc1"), before);
    }

    #[tokio::test]
    async fn test_sessions_are_counted() {
        let (backend, mut session) = seeded().await;
        assert_eq!(backend.open_sessions(), 1);
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(backend.open_sessions(), 0);
    }

    #[test]
    fn test_delta_on_missing_and_existing() {
        let mut doc = tree::state_to_element(ROOT, &State::new().with("n", 2i64));
        apply(
            &mut doc,
            &PatchOp::ApplyDelta {
                path: ElementPath::field("n"),
                delta: Delta::Long(3),
            },
        )
        .unwrap();
        apply(
            &mut doc,
            &PatchOp::ApplyDelta {
                path: ElementPath::field("m"),
                delta: Delta::Double(0.5),
            },
        )
        .unwrap();
        let state = tree::element_to_state(&doc).unwrap();
        assert_eq!(state.get("n"), Some(&Value::Long(5)));
        assert_eq!(state.get("m"), Some(&Value::Double(0.5)));
    }
}
