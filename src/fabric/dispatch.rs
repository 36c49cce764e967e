use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::fabric::FabricError;

/// A component reachable over the fabric.
///
/// `methods` lists every entry point the component implements, fully named
/// (prefix included). Channels only route to the subset they were registered
/// with.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    fn methods(&self) -> &'static [&'static str];
    async fn call(&self, method: &str, params: Value) -> Result<Value, String>;
}

/// Allow-list bound to a handler, validated at registration.
#[derive(Clone)]
pub struct Dispatch {
    handler: Arc<dyn MethodHandler>,
    prefix: String,
    allowed: BTreeSet<String>,
}

impl Dispatch {
    /// Fails with `UnknownMethod` if an allowed method has no handler entry.
    pub fn new(
        handler: Arc<dyn MethodHandler>,
        allowed: &[&str],
        prefix: &str,
    ) -> Result<Self, FabricError> {
        let entries = handler.methods();
        for m in allowed {
            let full = format!("{prefix}{m}");
            if !entries.contains(&full.as_str()) {
                return Err(FabricError::UnknownMethod(full));
            }
        }
        Ok(Self {
            handler,
            prefix: prefix.to_string(),
            allowed: allowed.iter().map(|m| m.to_string()).collect(),
        })
    }

    pub fn is_allowed(&self, method: &str) -> bool {
        self.allowed.contains(method)
    }

    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, FabricError> {
        if !self.is_allowed(method) {
            warn!(%method, "dispatch: method not allowed");
            return Err(FabricError::MethodNotAllowed(method.to_string()));
        }
        let full = format!("{}{}", self.prefix, method);
        self.handler
            .call(&full, params)
            .await
            .map_err(FabricError::Remote)
    }
}
