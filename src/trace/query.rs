use std::{fmt, sync::Arc};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::{
    fabric::{FabricError, pubsub::PubChannel},
    storage_error::StorageError,
    trace::store::{ScanItem, Store},
};

/*──────────────────────── errors ─────────*/

#[derive(Debug, Clone)]
pub enum QueryError {
    MaxConcurrency,
    DuplicateId(String),
    BadQuery(String),
    Storage(StorageError),
    /// Results could not be published.
    Publish(FabricError),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::MaxConcurrency => write!(f, "max number of concurrent queries reached"),
            QueryError::DuplicateId(id) => write!(f, "query {id} already running"),
            QueryError::BadQuery(e) => write!(f, "bad query: {e}"),
            QueryError::Storage(e) => write!(f, "storage: {e}"),
            QueryError::Publish(e) => write!(f, "publish: {e}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<StorageError> for QueryError {
    fn from(e: StorageError) -> Self {
        QueryError::Storage(e)
    }
}

impl From<FabricError> for QueryError {
    fn from(e: FabricError) -> Self {
        QueryError::Publish(e)
    }
}

/*──────────────────────── filter ─────────*/

struct Term {
    negate: bool,
    re: Regex,
}

/// Conjunction of (possibly negated) terms over the serialised record.
pub struct QueryFilter {
    terms: Vec<Term>,
}

fn build(pattern: &str) -> Result<Regex, QueryError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| QueryError::BadQuery(e.to_string()))
}

impl QueryFilter {
    /// Whitespace separated terms. `-term` negates; `field:value` matches
    /// the value of `"field"`; anything else is free text.
    pub fn parse(query: &str) -> Result<Self, QueryError> {
        let mut terms = Vec::new();
        for raw in query.split_whitespace() {
            let (negate, term) = match raw.strip_prefix('-') {
                Some(t) => (true, t),
                None => (false, raw),
            };
            if term.is_empty() {
                continue;
            }
            let pattern = match term.split_once(':') {
                Some((field, value)) if !field.is_empty() && !value.is_empty() => format!(
                    r#""{}"\s*:\s*"?[^",}}]*{}"#,
                    regex::escape(field),
                    regex::escape(value)
                ),
                _ => regex::escape(term),
            };
            terms.push(Term {
                negate,
                re: build(&pattern)?,
            });
        }
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, log: &str) -> bool {
        self.terms.iter().all(|t| t.re.is_match(log) != t.negate)
    }
}

/*──────────────────────── query ─────────*/

#[derive(Clone, Debug, Deserialize)]
pub struct QueryParams {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default = "newest")]
    pub timestamp: u64,
    #[serde(default = "newest")]
    pub counter: u64,
    #[serde(default = "default_num_lines")]
    pub num_lines: usize,
}

fn newest() -> u64 {
    u64::MAX
}

fn default_num_lines() -> usize {
    100
}

/// Store holder for the query `id`. Kept apart from the writer's holder.
pub fn holder(id: &str) -> String {
    format!("query:{id}")
}

/// One backward search, streaming results to its own topic.
pub struct Query {
    params: QueryParams,
    filter: QueryFilter,
    store: Arc<Store>,
    out: Arc<PubChannel>,
}

impl Query {
    pub fn new(params: QueryParams, store: Arc<Store>, out: Arc<PubChannel>) -> Result<Self, QueryError> {
        let filter = QueryFilter::parse(&params.query)?;
        Ok(Self {
            params,
            filter,
            store,
            out,
        })
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    /// Publishes `log` and `progress` messages, then `eoq`. Returns the
    /// number of matching records sent.
    #[instrument(skip_all, fields(id = %self.params.id))]
    pub async fn run(self) -> Result<usize, QueryError> {
        let id = self.params.id.clone();
        let result = self.scan().await;
        let eoq = match &result {
            Ok(n) => json!({"id": id, "num_lines": n}),
            Err(e) => {
                warn!(error = %e, "trace: query failed");
                json!({"id": id, "error": e.to_string()})
            }
        };
        self.out.publish("eoq", eoq).await?;
        result
    }

    async fn scan(&self) -> Result<usize, QueryError> {
        let mut sent = 0usize;
        if self.params.num_lines == 0 {
            return Ok(0);
        }
        let batch = self.store.config().read_batch.max(1);
        let mut scan = self
            .store
            .iterate_backwards(&holder(&self.params.id), self.params.timestamp, self.params.counter)?;
        let mut read = 0usize;

        while let Some(item) = scan.next().await {
            match item? {
                ScanItem::Progress { timestamp } => {
                    self.out
                        .publish("progress", json!({"id": self.params.id, "timestamp": timestamp}))
                        .await?;
                }
                ScanItem::Record(r) => {
                    read += 1;
                    if read % batch == 0 {
                        tokio::task::yield_now().await;
                    }
                    if !self.filter.matches(&r.log) {
                        continue;
                    }
                    let log = serde_json::from_str::<Value>(&r.log)
                        .unwrap_or_else(|_| Value::String(r.log.clone()));
                    self.out
                        .publish(
                            "log",
                            json!({
                                "id": self.params.id,
                                "timestamp": r.timestamp,
                                "counter": r.counter,
                                "log": log,
                            }),
                        )
                        .await?;
                    sent += 1;
                    if sent >= self.params.num_lines {
                        break;
                    }
                }
            }
        }
        debug!(sent, read, "trace: query done");
        Ok(sent)
    }
}
