//! HTTP/JSON backend
//!
//! Talks to a document server exposing session endpoints:
//!
//! - `POST   /sessions`                      open, returns `{"session": id}`
//! - `POST   /sessions/{sid}/search`         one page of results
//! - `POST   /sessions/{sid}/invoke`         named procedure
//! - `POST   /sessions/{sid}/documents`      insert
//! - `POST   /sessions/{sid}/delete`         delete by id
//! - `POST   /sessions/{sid}/documents/{id}/patch`
//! - `DELETE /sessions/{sid}`                close
//!
//! Failures come back as `{"kind": "...", "message": "..."}` with a non-2xx
//! status.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::backend::*;
use crate::config::RepositoryConfig;
use crate::error::{BackendError, BackendErrorKind};
use crate::patch::{PatchOp, WireDelta};
use crate::query::SortDirective;

/// Backend speaking the JSON session protocol.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base: String,
    username: String,
    password: String,
    page_size: usize,
}

impl HttpBackend {
    pub fn new(config: &RepositoryConfig) -> std::result::Result<Self, BackendError> {
        config.validate().map_err(BackendError::other)?;
        let client = Client::builder()
            .user_agent(concat!("treedoc-store/", env!("CARGO_PKG_VERSION")))
            .https_only(config.tls)
            .build()?;
        info!(endpoint = %config.endpoint, "configured HTTP document backend");
        Ok(Self {
            client,
            base: config.endpoint.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            page_size: config.page_size.max(1),
        })
    }
}

#[derive(Deserialize)]
struct OpenResponse {
    session: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    kind: String,
    message: String,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireSort {
    Relevance,
    Index {
        field: String,
        path: String,
        #[serde(rename = "type")]
        wire_type: &'static str,
        descending: bool,
    },
}

#[derive(Serialize)]
#[serde(tag = "mode", content = "limit", rename_all = "snake_case")]
enum WireCount {
    None,
    Exact,
    UpTo(u64),
}

#[derive(Serialize)]
struct WireSearch<'a> {
    query: &'a str,
    order: Vec<WireSort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<String>>,
    start: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_length: Option<usize>,
    count: WireCount,
}

#[derive(Deserialize)]
struct WireHit {
    document: String,
    #[serde(default)]
    score: f64,
}

#[derive(Deserialize)]
struct WirePage {
    hits: Vec<WireHit>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Serialize)]
struct WireInvoke<'a> {
    procedure: &'a str,
    params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    document: Option<String>,
}

#[derive(Serialize)]
struct WireDocument<'a> {
    id: &'a str,
    document: &'a str,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WirePatchOp {
    Upsert { parent: String, fragment: String },
    Delete { path: String },
    ReplaceItem { list: String, position: usize, fragment: String },
    DeleteItem { list: String, position: usize },
    InsertLast { list: String, fragment: String },
    ApplyDelta { path: String, delta: WireDelta },
}

impl From<&PatchOp> for WirePatchOp {
    fn from(op: &PatchOp) -> Self {
        match op {
            PatchOp::Upsert { parent, fragment } => WirePatchOp::Upsert {
                parent: parent.to_string(),
                fragment: fragment.to_xml(),
            },
            PatchOp::Delete { path } => WirePatchOp::Delete {
                path: path.to_string(),
            },
            PatchOp::ReplaceItem {
                list,
                position,
                fragment,
            } => WirePatchOp::ReplaceItem {
                list: list.to_string(),
                position: *position,
                fragment: fragment.to_xml(),
            },
            PatchOp::DeleteItem { list, position } => WirePatchOp::DeleteItem {
                list: list.to_string(),
                position: *position,
            },
            PatchOp::InsertLast { list, fragment } => WirePatchOp::InsertLast {
                list: list.to_string(),
                fragment: fragment.to_xml(),
            },
            PatchOp::ApplyDelta { path, delta } => WirePatchOp::ApplyDelta {
                path: path.to_string(),
                delta: (*delta).into(),
            },
        }
    }
}

fn wire_search(request: &SearchRequest) -> WireSearch<'_> {
    WireSearch {
        query: &request.text,
        order: request
            .order
            .iter()
            .map(|directive| match directive {
                SortDirective::Relevance => WireSort::Relevance,
                SortDirective::Index {
                    field,
                    path,
                    wire_type,
                    descending,
                } => WireSort::Index {
                    field: field.clone(),
                    path: path.to_string(),
                    wire_type: wire_type.name(),
                    descending: *descending,
                },
            })
            .collect(),
        fields: request
            .fields
            .as_ref()
            .map(|fields| fields.iter().map(ToString::to_string).collect()),
        start: request.start,
        page_length: request.page_length,
        count: match request.count {
            CountMode::None => WireCount::None,
            CountMode::Exact => WireCount::Exact,
            CountMode::UpTo(n) => WireCount::UpTo(n),
        },
    }
}

fn status_kind(status: StatusCode, kind: Option<&str>) -> BackendErrorKind {
    match kind {
        Some("not_found") => return BackendErrorKind::NotFound,
        Some("duplicate") => return BackendErrorKind::Duplicate,
        Some("conflict") => return BackendErrorKind::Conflict,
        Some("unavailable") => return BackendErrorKind::Unavailable,
        _ => {}
    }
    match status {
        StatusCode::NOT_FOUND => BackendErrorKind::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => BackendErrorKind::Conflict,
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Unavailable,
        _ => BackendErrorKind::Other,
    }
}

/// Send a request and decode the JSON body, mapping error envelopes.
async fn send<T: DeserializeOwned>(request: RequestBuilder) -> BackendResult<T> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let error = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => BackendError::new(
            status_kind(status, Some(&envelope.kind)),
            envelope.message,
        ),
        Err(_) => BackendError::new(status_kind(status, None), format!("{status}: {body}")),
    };
    Err(error)
}

async fn send_empty(request: RequestBuilder) -> BackendResult<()> {
    send::<serde_json::Value>(request).await.map(|_| ())
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    #[instrument(skip(self), fields(endpoint = %self.base))]
    async fn open_session(&self) -> BackendResult<Box<dyn BackendSession>> {
        let opened: OpenResponse = send(
            self.client
                .post(format!("{}/sessions", self.base))
                .basic_auth(&self.username, Some(&self.password)),
        )
        .await?;
        debug!(session = %opened.session, "opened session");
        Ok(Box::new(HttpSession {
            backend: self.clone(),
            session: opened.session,
            closed: false,
        }))
    }
}

/// Session on an [`HttpBackend`].
pub struct HttpSession {
    backend: HttpBackend,
    session: String,
    closed: bool,
}

impl HttpSession {
    fn url(&self, tail: &str) -> String {
        format!("{}/sessions/{}{}", self.backend.base, self.session, tail)
    }

    fn post(&self, tail: &str) -> RequestBuilder {
        self.backend
            .client
            .post(self.url(tail))
            .basic_auth(&self.backend.username, Some(&self.backend.password))
    }
}

async fn search_page(
    client: &Client,
    url: &str,
    auth: (&str, &str),
    body: &WireSearch<'_>,
) -> BackendResult<SearchPage> {
    let page: WirePage = send(
        client
            .post(url)
            .basic_auth(auth.0, Some(auth.1))
            .json(body),
    )
    .await?;
    Ok(SearchPage {
        hits: page
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                document: hit.document,
                score: hit.score,
            })
            .collect(),
        total: page.total,
    })
}

#[async_trait]
impl BackendSession for HttpSession {
    async fn search(&mut self, request: &SearchRequest) -> BackendResult<SearchPage> {
        debug!(query = %request.text, start = request.start, "search");
        search_page(
            &self.backend.client,
            &self.url("/search"),
            (&self.backend.username, &self.backend.password),
            &wire_search(request),
        )
        .await
    }

    async fn stream(
        &mut self,
        request: SearchRequest,
    ) -> BackendResult<BoxStream<'static, BackendResult<String>>> {
        let backend = self.backend.clone();
        let url = self.url("/search");
        let page_size = backend.page_size;
        // (next start, exhausted)
        let pages = stream::try_unfold((0usize, false), move |(start, done)| {
            let backend = backend.clone();
            let url = url.clone();
            let mut page_request = request.clone();
            async move {
                if done {
                    return Ok(None);
                }
                page_request.start = start;
                page_request.page_length = Some(page_size);
                page_request.count = CountMode::None;
                let page = search_page(
                    &backend.client,
                    &url,
                    (&backend.username, &backend.password),
                    &wire_search(&page_request),
                )
                .await?;
                let fetched = page.hits.len();
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
        let body = WireInvoke {
            procedure,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        };
        let response: InvokeResponse = send(self.post("/invoke").json(&body)).await?;
        Ok(response.document)
    }

    async fn insert(&mut self, documents: &[(String, String)]) -> BackendResult<()> {
        let body: Vec<WireDocument<'_>> = documents
            .iter()
            .map(|(id, document)| WireDocument { id, document })
            .collect();
        send_empty(self.post("/documents").json(&body)).await
    }

    async fn delete(&mut self, ids: &[String]) -> BackendResult<()> {
        send_empty(self.post("/delete").json(&serde_json::json!({ "ids": ids }))).await
    }

    async fn patch(&mut self, id: &str, ops: &[PatchOp]) -> BackendResult<()> {
        let body: Vec<WirePatchOp> = ops.iter().map(WirePatchOp::from).collect();
        let tail = format!("/documents/{id}/patch");
        send_empty(self.post(&tail).json(&body)).await
    }

    async fn close(&mut self) -> BackendResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        send_empty(
            self.backend
                .client
                .delete(self.url(""))
                .basic_auth(&self.backend.username, Some(&self.backend.password)),
        )
        .await
    }
}
