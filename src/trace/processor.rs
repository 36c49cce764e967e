use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    fabric::{Fabric, FabricError, dispatch::MethodHandler},
    trace::{
        query::{Query, QueryError, QueryParams, holder},
        store::Store,
    },
};

/// RPC address of the trace query service.
pub const TRACED_ADDRESS: &str = "mbus:traced";

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub max_concurrency: usize,
    /// Results of query `<id>` go to topic `<prefix><id>`.
    pub result_topic_prefix: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            result_topic_prefix: "mm-traced-q.".to_string(),
        }
    }
}

/// Runs trace queries as tasks, at most `max_concurrency` at a time.
pub struct QueryProcessor {
    fabric: Arc<Fabric>,
    store: Arc<Store>,
    cfg: QueryConfig,
    queries: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl QueryProcessor {
    pub fn new(fabric: Arc<Fabric>, store: Arc<Store>, cfg: QueryConfig) -> Arc<Self> {
        Arc::new(Self {
            fabric,
            store,
            cfg,
            queries: Mutex::new(HashMap::new()),
        })
    }

    /// Serve `query` and `kill_query` at [`TRACED_ADDRESS`].
    pub async fn register(self: &Arc<Self>) -> Result<(), FabricError> {
        let handler = Arc::new(ProcessorHandler {
            processor: Arc::downgrade(self),
        });
        self.fabric
            .request_rpc_server_channel(TRACED_ADDRESS, handler, &["query", "kill_query"], "", None)
            .await
    }

    pub fn result_topic(&self, id: &str) -> String {
        format!("{}{}", self.cfg.result_topic_prefix, id)
    }

    /// Start a query; results stream on [`Self::result_topic`].
    pub fn query(self: &Arc<Self>, params: QueryParams) -> Result<(), QueryError> {
        let mut queries = self.queries.lock().unwrap_or_else(|p| p.into_inner());
        if queries.contains_key(&params.id) {
            return Err(QueryError::DuplicateId(params.id));
        }
        if queries.len() >= self.cfg.max_concurrency {
            return Err(QueryError::MaxConcurrency);
        }

        let id = params.id.clone();
        let out = self.fabric.request_pub_channel(&self.result_topic(&id));
        let query = Query::new(params, self.store.clone(), out)?;
        info!(%id, "trace: query started");

        // The task deregisters itself under the same lock, so the insert
        // below always happens first.
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let id = query.id().to_string();
            if let Err(e) = query.run().await {
                warn!(%id, error = %e, "trace: query ended with error");
            }
            this.store.release_all(&holder(&id));
            this.release_topic(&id).await;
            this.queries
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
        });
        queries.insert(id, handle);
        Ok(())
    }

    /// Abort a running query and drop every table reference it holds.
    /// Returns false if no such query is running.
    pub async fn kill_query(&self, id: &str) -> bool {
        let handle = self
            .queries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        // Wait until the task's leases are dropped.
        let _ = handle.await;
        self.store.release_all(&holder(id));
        self.release_topic(id).await;
        debug!(%id, "trace: query killed");
        true
    }

    async fn release_topic(&self, id: &str) {
        if let Err(e) = self.fabric.release_pub_channel(&self.result_topic(id)).await {
            warn!(%id, error = %e, "trace: result topic not released");
        }
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[derive(Deserialize)]
struct KillParams {
    uuid: String,
}

struct ProcessorHandler {
    processor: Weak<QueryProcessor>,
}

#[async_trait]
impl MethodHandler for ProcessorHandler {
    fn methods(&self) -> &'static [&'static str] {
        &["query", "kill_query"]
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let processor = self
            .processor
            .upgrade()
            .ok_or_else(|| "query processor stopped".to_string())?;
        match method {
            "query" => {
                let params: QueryParams =
                    serde_json::from_value(params).map_err(|e| e.to_string())?;
                processor.query(params).map_err(|e| e.to_string())?;
                Ok(json!("OK"))
            }
            "kill_query" => {
                let KillParams { uuid } =
                    serde_json::from_value(params).map_err(|e| e.to_string())?;
                if processor.kill_query(&uuid).await {
                    Ok(json!("OK"))
                } else {
                    Err(format!("unknown query {uuid}"))
                }
            }
            other => Err(format!("unknown method {other}")),
        }
    }
}
