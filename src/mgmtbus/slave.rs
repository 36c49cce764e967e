use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    fabric::{Fabric, FabricError, dispatch::MethodHandler},
    mgmtbus::{FANOUT_COMMANDS, MGMTBUS_TOPIC, METHOD_PREFIX, ManagedNode, slave_address},
};

/// Dispatch table in front of one node.
struct SlaveHandler {
    node: Arc<dyn ManagedNode>,
}

fn to_value<T: serde::Serialize>(v: T) -> Result<Value, String> {
    serde_json::to_value(v).map_err(|e| e.to_string())
}

#[async_trait]
impl MethodHandler for SlaveHandler {
    fn methods(&self) -> &'static [&'static str] {
        &[
            "mgmtbus_state_info",
            "mgmtbus_initialize",
            "mgmtbus_rebuild",
            "mgmtbus_reset",
            "mgmtbus_status",
            "mgmtbus_checkpoint",
            "mgmtbus_hup",
        ]
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        match method {
            "mgmtbus_state_info" => to_value(self.node.state_info().await?),
            "mgmtbus_status" => to_value(self.node.status().await?),
            "mgmtbus_initialize" => self.node.initialize().await.map(|_| json!("OK")),
            "mgmtbus_rebuild" => self.node.rebuild().await.map(|_| json!("OK")),
            "mgmtbus_reset" => self.node.reset().await.map(|_| json!("OK")),
            "mgmtbus_hup" => self.node.hup().await.map(|_| json!("OK")),
            "mgmtbus_checkpoint" => {
                let value = params
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "checkpoint: missing value".to_string())?;
                self.node
                    .checkpoint(value.to_string())
                    .await
                    .map(|_| json!("OK"))
            }
            other => Err(format!("unknown method {other}")),
        }
    }
}

/// Registers graph nodes on the management bus.
pub struct SlaveHub {
    fabric: Arc<Fabric>,
    topic: String,
}

impl SlaveHub {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self::with_topic(fabric, MGMTBUS_TOPIC)
    }

    pub fn with_topic(fabric: Arc<Fabric>, topic: &str) -> Self {
        Self {
            fabric,
            topic: topic.to_string(),
        }
    }

    /// Expose `node` at `mbus:slave:<node_name>`, reachable through the bus
    /// fanout for graph commands and directly for `hup`.
    pub async fn register(
        &self,
        node_name: &str,
        node: Arc<dyn ManagedNode>,
    ) -> Result<(), FabricError> {
        let address = slave_address(node_name);
        let mut allowed: Vec<&str> = FANOUT_COMMANDS.to_vec();
        allowed.push("hup");
        self.fabric
            .request_rpc_server_channel(
                &address,
                Arc::new(SlaveHandler { node }),
                &allowed,
                METHOD_PREFIX,
                Some(&self.topic),
            )
            .await?;
        debug!(%address, topic = %self.topic, "mgmtbus: slave registered");
        info!(node = %node_name, "mgmtbus: node joined bus");
        Ok(())
    }
}
