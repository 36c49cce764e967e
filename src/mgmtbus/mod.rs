//! Management bus: the master drives every graph node through lifecycle
//! commands over fanout RPC, nodes answer through their slave channel.

pub mod master;
pub mod metrics;
pub mod slave;

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fabric::FabricError;

/// Fanout topic every slave joins.
pub const MGMTBUS_TOPIC: &str = "mbus:bus";
/// Direct address of the master's own RPC endpoint.
pub const MASTER_ADDRESS: &str = "mbus:master";
/// Handler-entry prefix for slave commands.
pub const METHOD_PREFIX: &str = "mgmtbus_";

/// Prefix of every slave's RPC address.
pub const SLAVE_PREFIX: &str = "mbus:slave:";

pub fn slave_address(node: &str) -> String {
    format!("{SLAVE_PREFIX}{node}")
}

/// Commands routed to the whole graph.
pub const FANOUT_COMMANDS: &[&str] = &[
    "state_info",
    "initialize",
    "rebuild",
    "reset",
    "status",
    "checkpoint",
];

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    #[default]
    Ready,
    Connected,
    Rebuilding,
    Reset,
    Init,
    Started,
    Checkpoint,
    Idle,
    Stopped,
}

/// What a node reports in answer to `state_info` and `status`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeStateInfo {
    pub checkpoint: Option<String>,
    pub is_source: bool,
    pub state: NodeState,
    pub length: u64,
    pub statistics: BTreeMap<String, i64>,
    pub inputs: Vec<String>,
}

/// The node side of the protocol. Command semantics live in the node.
#[async_trait]
pub trait ManagedNode: Send + Sync + 'static {
    async fn state_info(&self) -> Result<NodeStateInfo, String>;
    async fn initialize(&self) -> Result<(), String>;
    async fn rebuild(&self) -> Result<(), String>;
    async fn reset(&self) -> Result<(), String>;
    async fn status(&self) -> Result<NodeStateInfo, String>;
    async fn checkpoint(&self, value: String) -> Result<(), String>;
    async fn hup(&self) -> Result<(), String>;
}

/*──────────────────────── errors ─────────*/

#[derive(Debug, Clone, PartialEq)]
pub enum MgmtbusError {
    Fabric(FabricError),
    /// `state_info` answers carried this many errors.
    NodesReportedErrors(usize),
    Decode(String),
}

impl fmt::Display for MgmtbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MgmtbusError::Fabric(e) => write!(f, "fabric: {e}"),
            MgmtbusError::NodesReportedErrors(n) => write!(f, "{n} nodes reported errors"),
            MgmtbusError::Decode(e) => write!(f, "decode: {e}"),
        }
    }
}

impl std::error::Error for MgmtbusError {}

impl From<FabricError> for MgmtbusError {
    fn from(e: FabricError) -> Self {
        MgmtbusError::Fabric(e)
    }
}

pub(crate) fn decode_answers(
    answers: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, NodeStateInfo>, MgmtbusError> {
    answers
        .into_iter()
        .map(|(source, v)| {
            let node = source
                .strip_prefix(SLAVE_PREFIX)
                .unwrap_or(&source)
                .to_string();
            serde_json::from_value(v)
                .map(|info| (node, info))
                .map_err(|e| MgmtbusError::Decode(format!("{source}: {e}")))
        })
        .collect()
}
