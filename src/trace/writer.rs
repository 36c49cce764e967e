use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    fabric::{Fabric, FabricError, dispatch::MethodHandler},
    trace::store::Store,
};

/// Topic nodes publish their trace records on.
pub const LOG_TOPIC: &str = "mbus:log";

/// Persists `log {timestamp, log}` messages into the store.
pub struct LogWriter {
    store: Arc<Store>,
}

impl LogWriter {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub async fn subscribe(self: &Arc<Self>, fabric: &Fabric, topic: &str) -> Result<(), FabricError> {
        fabric
            .request_sub_channel(topic, self.clone(), &["log"], "traced-writer")
            .await
    }

    async fn write(&self, params: Value) -> Result<u64, String> {
        let timestamp = params
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| "log: missing timestamp".to_string())?;
        let log = match params.get("log") {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => return Err("log: missing log".to_string()),
        };
        self.store.write(timestamp, &log).await.map_err(|e| {
            warn!(timestamp, error = %e, "trace: write failed");
            e.to_string()
        })
    }
}

#[async_trait]
impl MethodHandler for LogWriter {
    fn methods(&self) -> &'static [&'static str] {
        &["log"]
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        match method {
            "log" => self.write(params).await.map(|counter| json!(counter)),
            other => Err(format!("unknown method {other}")),
        }
    }
}
