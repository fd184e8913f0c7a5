//! treedoc-store: Tree-Document Repository Adapter
//!
//! This crate stores hierarchical records ("states") in a tree-document
//! database. It translates typed records to and from tree documents, compiles
//! the repository's expression language into native queries, turns state
//! diffs into partial-update patches and manages the backend sessions,
//! cursors and locks around them.
//!
//! ## Layers
//!
//! - `tree` / `codec`: typed tree codec and key escaping
//! - `query`: expression compiler, wildcard correlation, projections
//! - `patch`: state diff to patch operations
//! - `backend`: the session contract, with `http` and in-memory `fakes`
//! - `repository`: [`TreeRepository`], the adapter callers use
//!
//! ## Key Components
//!
//! - `TreeRepository`: record CRUD, queries, scrolls, locks, blob marking
//! - `QueryCompiler`: expression trees to [`query::QueryNode`]
//! - `MemoryBackend`: server-less backend for tests and embedding

pub mod backend;
pub mod blobs;
pub mod codec;
pub mod config;
mod error;
pub mod expr;
pub mod fakes;
pub mod fulltext;
pub mod http;
pub mod lock;
pub mod patch;
pub mod query;
pub mod repository;
pub mod schema;
pub mod scroll;
mod session;
pub mod state;
pub mod tree;

pub use backend::{
    BackendResult, BackendSession, CountMode, DocumentBackend, SearchHit, SearchPage,
    SearchRequest,
};
pub use codec::WireType;
pub use config::RepositoryConfig;
pub use error::{BackendError, BackendErrorKind, ErrorKind, StoreError};
pub use expr::{Expression, Literal, Operator, OrderByClause, SelectClause};
pub use fakes::MemoryBackend;
pub use http::HttpBackend;
pub use lock::Lock;
pub use patch::{build_patch, PatchOp};
pub use query::{CompiledQuery, CompilerConfig, PathResolver, QueryCompiler, TrashMode};
pub use repository::{PartialList, QueryRequest, StateStream, TotalSize, TreeRepository};
pub use schema::{DocumentType, Facet, FieldType, TypeCatalog};
pub use scroll::ScrollResult;
pub use state::{Delta, DiffValue, ListDiff, ListEntry, State, StateDiff, Value};

/// Result type for treedoc-store operations
pub type Result<T> = std::result::Result<T, StoreError>;
