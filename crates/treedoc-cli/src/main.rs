//! treedoc - operator CLI for tree-document repositories
//!
//! Connects with the `TREEDOC_*` environment (see `RepositoryConfig::from_env`)
//! and prints results as JSON on stdout.
//!
//! ## Commands
//!
//! - `get`: Read a record, or some of its fields
//! - `query`: Run a filter with projection, ordering and paging
//! - `delete`: Delete records by id
//! - `lock` / `unlock`: Manage record locks
//! - `scroll`: Stream every matching id in batches
//! - `blobs`: List the blob keys still referenced by records

mod catalog;
mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};

use treedoc_store::{
    CountMode, Expression, Literal, Lock, Operator, OrderByClause, QueryRequest,
    RepositoryConfig, SelectClause, TotalSize, TreeRepository,
};

#[derive(Parser)]
#[command(name = "treedoc")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tree-document repository CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Field type catalog (JSON); only system fields are known without it
    #[arg(long, global = true, env = "TREEDOC_CATALOG")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a record
    Get {
        /// Record id
        id: String,

        /// Only read these fields
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Query records
    Query {
        #[command(flatten)]
        filter: FilterArgs,

        /// Projected field (repeatable); whole records when omitted
        #[arg(short, long)]
        select: Vec<String>,

        /// Sort key, `field` or `field:desc` (repeatable)
        #[arg(short, long)]
        order: Vec<String>,

        /// Maximum number of rows
        #[arg(short, long)]
        limit: Option<usize>,

        /// Rows to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Count matches exactly
        #[arg(long, conflicts_with = "count_up_to")]
        count: bool,

        /// Count matches up to this limit
        #[arg(long)]
        count_up_to: Option<u64>,
    },

    /// Delete records
    Delete {
        /// Record ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Lock a record
    Lock {
        /// Record id
        id: String,

        /// Lock owner
        #[arg(short, long)]
        owner: String,
    },

    /// Unlock a record
    Unlock {
        /// Record id
        id: String,

        /// Only unlock if held by this owner
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Stream the ids of every matching record
    Scroll {
        #[command(flatten)]
        filter: FilterArgs,

        /// Ids per batch
        #[arg(short, long, default_value = "100")]
        batch: usize,

        /// Seconds a cursor may stay idle
        #[arg(long, default_value = "60")]
        keep_alive: u64,
    },

    /// List blob keys referenced by records
    Blobs,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Filter expression tree as JSON
    #[arg(long, conflicts_with = "conditions")]
    filter: Option<String>,

    /// Equality condition `field=value` (repeatable, and-ed)
    #[arg(short = 'w', long = "where")]
    conditions: Vec<String>,
}

impl FilterArgs {
    fn expression(&self) -> Result<Expression> {
        if let Some(json) = &self.filter {
            return serde_json::from_str(json).context("Invalid filter expression");
        }
        let conditions = self
            .conditions
            .iter()
            .map(|c| parse_condition(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Expression::and(conditions))
    }
}

/// `field=value`, typing the value as boolean, integer, double or string.
fn parse_condition(condition: &str) -> Result<Expression> {
    let (field, value) = condition
        .split_once('=')
        .ok_or_else(|| anyhow!("condition {condition} is not field=value"))?;
    let literal = if let Ok(b) = value.parse::<bool>() {
        Literal::Boolean(b)
    } else if let Ok(i) = value.parse::<i64>() {
        Literal::Integer(i)
    } else if let Ok(d) = value.parse::<f64>() {
        Literal::Double(d)
    } else {
        Literal::string(value)
    };
    Ok(Expression::compare(field.trim(), Operator::Eq, literal))
}

/// `field`, `field:asc` or `field:desc`.
fn parse_order(keys: &[String]) -> OrderByClause {
    keys.iter()
        .fold(OrderByClause::new(), |clause, key| match key.rsplit_once(':') {
            Some((field, "desc")) => clause.desc(field),
            Some((field, "asc")) => clause.asc(field),
            _ => clause.asc(key),
        })
}

fn print(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    let config = RepositoryConfig::from_env().map_err(|e| anyhow!(e))?;
    let catalog = catalog::load_catalog(cli.catalog.as_deref())?;
    let repo = TreeRepository::connect(&config, catalog)
        .context("Failed to configure treedoc repository")?;

    match cli.command {
        Commands::Get { id, keys } => cmd_get(&repo, &id, &keys).await,
        Commands::Query {
            filter,
            select,
            order,
            limit,
            offset,
            count,
            count_up_to,
        } => {
            let count = match (count, count_up_to) {
                (_, Some(n)) => CountMode::UpTo(n),
                (true, None) => CountMode::Exact,
                (false, None) => CountMode::None,
            };
            let select = select
                .iter()
                .fold(SelectClause::new(), |clause, f| clause.field(f));
            let mut request = QueryRequest::new(filter.expression()?)
                .with_select(select)
                .with_order_by(parse_order(&order))
                .with_offset(offset)
                .with_count(count);
            if let Some(limit) = limit {
                request = request.with_limit(limit);
            }
            cmd_query(&repo, &request).await
        }
        Commands::Delete { ids } => cmd_delete(&repo, &ids).await,
        Commands::Lock { id, owner } => cmd_lock(&repo, &id, &owner).await,
        Commands::Unlock { id, owner } => cmd_unlock(&repo, &id, owner.as_deref()).await,
        Commands::Scroll {
            filter,
            batch,
            keep_alive,
        } => cmd_scroll(&repo, &filter.expression()?, batch, keep_alive).await,
        Commands::Blobs => cmd_blobs(&repo).await,
    }
}

async fn cmd_get(repo: &TreeRepository, id: &str, keys: &[String]) -> Result<()> {
    let state = if keys.is_empty() {
        repo.read_state(id).await?
    } else {
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        repo.read_partial_state(id, &keys).await?
    };
    match state {
        Some(state) => print(&state.to_json()),
        None => bail!("Record not found: {id}"),
    }
}

async fn cmd_query(repo: &TreeRepository, request: &QueryRequest) -> Result<()> {
    let result = repo.query_and_fetch(request).await?;
    let total = match result.total {
        TotalSize::Exact(n) => json!(n),
        TotalSize::NotCounted => json!(null),
        TotalSize::Truncated => json!("truncated"),
    };
    let rows: Vec<_> = result.items.iter().map(|s| s.to_json()).collect();
    print(&json!({ "total": total, "rows": rows }))
}

async fn cmd_delete(repo: &TreeRepository, ids: &[String]) -> Result<()> {
    repo.delete_states(ids).await?;
    info!(count = ids.len(), "deleted");
    Ok(())
}

async fn cmd_lock(repo: &TreeRepository, id: &str, owner: &str) -> Result<()> {
    let lock = Lock::new(owner, Utc::now());
    match repo.set_lock(id, &lock).await? {
        None => print(&json!({ "locked": true, "lock": lock })),
        Some(existing) => print(&json!({ "locked": false, "lock": existing })),
    }
}

async fn cmd_unlock(repo: &TreeRepository, id: &str, owner: Option<&str>) -> Result<()> {
    let removed = repo.remove_lock(id, owner).await?;
    print(&json!({ "removed": removed }))
}

async fn cmd_scroll(
    repo: &TreeRepository,
    filter: &Expression,
    batch: usize,
    keep_alive: u64,
) -> Result<()> {
    let mut result = repo
        .scroll(filter, batch, Some(Duration::from_secs(keep_alive)))
        .await?;
    let mut total = 0usize;
    while result.has_results() {
        for id in &result.ids {
            println!("{id}");
        }
        total += result.ids.len();
        result = repo.scroll_next(&result.scroll_id).await?;
    }
    info!(total, "scroll complete");
    Ok(())
}

async fn cmd_blobs(repo: &TreeRepository) -> Result<()> {
    let mut keys = std::collections::BTreeSet::new();
    let marked = repo
        .mark_referenced_blobs(|key| {
            keys.insert(key.to_string());
        })
        .await?;
    for key in &keys {
        println!("{key}");
    }
    info!(references = marked, distinct = keys.len(), "blob scan complete");
    Ok(())
}
