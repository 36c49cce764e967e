use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::MineMeldConfig,
    fabric::{
        Fabric, FabricError,
        dispatch::MethodHandler,
        rpc::{FanoutClient, FanoutResult},
    },
    mgmtbus::{
        MASTER_ADDRESS, MGMTBUS_TOPIC, MgmtbusError, NodeState, NodeStateInfo, decode_answers,
        metrics::{MetricsCollector, aggregate_metrics},
        slave_address,
    },
    planner::{self, Action, Plan},
};

/*──────────────────────── config ───────────────────────*/

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub topic: String,
    pub status_interval: Duration,
    pub state_info_timeout: Duration,
    pub checkpoint_timeout: Duration,
    pub checkpoint_poll_timeout: Duration,
    pub status_timeout: Duration,
    /// Wait between `state_info` polls while nodes are not all started.
    pub retry_interval: Duration,
    pub checkpoint_max_tries: usize,
    pub checkpoint_backoff: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            topic: MGMTBUS_TOPIC.to_string(),
            status_interval: Duration::from_secs(60),
            state_info_timeout: Duration::from_secs(30),
            checkpoint_timeout: Duration::from_secs(60),
            checkpoint_poll_timeout: Duration::from_secs(60),
            status_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(60),
            checkpoint_max_tries: 12,
            checkpoint_backoff: Duration::from_secs(5),
        }
    }
}

/// Command `init_graph` broadcast to the whole graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Initialize,
    Rebuild,
    Reset,
}

impl InitOutcome {
    pub fn command(self) -> &'static str {
        match self {
            InitOutcome::Initialize => "initialize",
            InitOutcome::Rebuild => "rebuild",
            InitOutcome::Reset => "reset",
        }
    }
}

type GraphStatus = Arc<Mutex<BTreeMap<String, NodeStateInfo>>>;

/*──────────────────────── status endpoint ───────────────────────*/

struct StatusEndpoint {
    graph_status: GraphStatus,
}

#[async_trait]
impl MethodHandler for StatusEndpoint {
    fn methods(&self) -> &'static [&'static str] {
        &["status"]
    }

    async fn call(&self, method: &str, _params: Value) -> Result<Value, String> {
        match method {
            "status" => {
                let status = self
                    .graph_status
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                serde_json::to_value(status).map_err(|e| e.to_string())
            }
            other => Err(format!("unknown method {other}")),
        }
    }
}

/*──────────────────────── Master ───────────────────────*/

pub struct Master {
    fabric: Arc<Fabric>,
    client: Arc<FanoutClient>,
    config: MineMeldConfig,
    cfg: MasterConfig,
    collector: Arc<dyn MetricsCollector>,
    clock: Arc<dyn Clock>,
    graph_status: GraphStatus,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    /// Registers the bus fanout client and the `mbus:master` endpoint; call
    /// before `Fabric::start`.
    pub async fn new(
        fabric: Arc<Fabric>,
        config: MineMeldConfig,
        cfg: MasterConfig,
        collector: Arc<dyn MetricsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, FabricError> {
        let client = fabric.request_rpc_fanout_client_channel(&cfg.topic).await?;
        let graph_status: GraphStatus = Arc::new(Mutex::new(BTreeMap::new()));
        fabric
            .request_rpc_server_channel(
                MASTER_ADDRESS,
                Arc::new(StatusEndpoint {
                    graph_status: graph_status.clone(),
                }),
                &["status"],
                "",
                None,
            )
            .await?;
        Ok(Arc::new(Self {
            fabric,
            client,
            config,
            cfg,
            collector,
            clock,
            graph_status,
            status_task: Mutex::new(None),
        }))
    }

    fn num_nodes(&self) -> usize {
        self.config.nodes.len()
    }

    async fn broadcast(&self, command: &str) -> Result<(), MgmtbusError> {
        info!(%command, nodes = self.num_nodes(), "mgmtbus: broadcasting command");
        self.client
            .send_rpc(command, json!({}), self.num_nodes(), true)
            .await?;
        Ok(())
    }

    async fn fanout(&self, method: &str, params: Value, timeout: Duration) -> Result<FanoutResult, FabricError> {
        self.client
            .send_rpc(method, params, self.num_nodes(), false)
            .await?
            .wait(Some(timeout))
            .await
    }

    /// `state_info` from every node; any node error fails the query.
    async fn query_state_info(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, NodeStateInfo>, MgmtbusError> {
        let res = self.fanout("state_info", json!({}), timeout).await?;
        if res.errors > 0 {
            return Err(MgmtbusError::NodesReportedErrors(res.errors));
        }
        decode_answers(res.answers)
    }

    /*──────── startup ────────*/

    /// Decide and broadcast how the whole graph restarts.
    #[instrument(skip_all)]
    pub async fn init_graph(&self) -> Result<InitOutcome, MgmtbusError> {
        if self.config.newconfig {
            info!("mgmtbus: new config, rebuilding graph");
            self.broadcast("rebuild").await?;
            return Ok(InitOutcome::Rebuild);
        }

        let states = match self.query_state_info(self.cfg.state_info_timeout).await {
            Ok(s) => s,
            Err(MgmtbusError::Fabric(FabricError::Timeout)) => {
                error!("mgmtbus: timeout in state_info, resetting graph");
                self.broadcast("reset").await?;
                return Ok(InitOutcome::Reset);
            }
            Err(e) => {
                error!(error = %e, "mgmtbus: errors reported from nodes in init_graph");
                return Err(e);
            }
        };

        let mut checkpoints: Vec<Option<&str>> =
            states.values().map(|s| s.checkpoint.as_deref()).collect();
        checkpoints.sort();
        checkpoints.dedup();
        let outcome = if checkpoints.len() == 1 && checkpoints[0].is_some() {
            InitOutcome::Initialize
        } else {
            let mut sources: Vec<Option<&str>> = states
                .values()
                .filter(|s| s.is_source)
                .map(|s| s.checkpoint.as_deref())
                .collect();
            sources.sort();
            sources.dedup();
            if sources.len() == 1 && sources[0].is_some() {
                InitOutcome::Rebuild
            } else {
                InitOutcome::Reset
            }
        };
        info!(?outcome, "mgmtbus: graph init decided");
        self.broadcast(outcome.command()).await?;
        Ok(outcome)
    }

    /// Like `init_graph`, but every subgraph gets its own plan, sent to each
    /// node's direct address.
    #[instrument(skip_all)]
    pub async fn init_graph_planned(&self) -> Result<Plan, MgmtbusError> {
        let all = |action: Action| -> Plan {
            self.config
                .nodes
                .keys()
                .map(|n| (n.clone(), action))
                .collect()
        };

        if self.config.newconfig {
            info!("mgmtbus: new config, rebuilding graph");
            self.broadcast("rebuild").await?;
            return Ok(all(Action::Rebuild));
        }

        let states = match self.query_state_info(self.cfg.state_info_timeout).await {
            Ok(s) => s,
            Err(MgmtbusError::Fabric(FabricError::Timeout)) => {
                error!("mgmtbus: timeout in state_info, resetting graph");
                self.broadcast("reset").await?;
                return Ok(all(Action::Reset));
            }
            Err(e) => {
                error!(error = %e, "mgmtbus: errors reported from nodes in init_graph");
                return Err(e);
            }
        };

        let plan = planner::plan(&self.config, &states);
        for (node, action) in &plan {
            debug!(%node, ?action, "mgmtbus: sending planned action");
            self.fabric
                .send_rpc(&slave_address(node), action.command(), json!({}), false, None)
                .await?;
        }
        Ok(plan)
    }

    /*──────── checkpoint ────────*/

    /// Best effort: returns whether every node reported the new checkpoint
    /// within `checkpoint_max_tries` polls.
    #[instrument(skip_all, fields(max_tries = self.cfg.checkpoint_max_tries))]
    pub async fn checkpoint_graph(&self) -> bool {
        info!("mgmtbus: waiting for graph to start before checkpoint");
        loop {
            match self.query_state_info(self.cfg.state_info_timeout).await {
                Ok(states)
                    if states.len() >= self.num_nodes()
                        && states.values().all(|s| s.state == NodeState::Started) =>
                {
                    break;
                }
                Ok(_) => info!("mgmtbus: not all nodes started yet"),
                Err(e) => warn!(error = %e, "mgmtbus: state_info failed while waiting for start"),
            }
            tokio::time::sleep(self.cfg.retry_interval).await;
        }

        let value = Uuid::new_v4().to_string();
        info!(checkpoint = %value, "mgmtbus: sending checkpoint");
        match self
            .fanout(
                "checkpoint",
                json!({ "value": value }),
                self.cfg.checkpoint_timeout,
            )
            .await
        {
            Ok(res) if res.errors > 0 => {
                warn!(errors = res.errors, "mgmtbus: errors reported in checkpoint");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mgmtbus: checkpoint failed");
                return false;
            }
        }

        for attempt in 0..self.cfg.checkpoint_max_tries {
            match self
                .query_state_info(self.cfg.checkpoint_poll_timeout)
                .await
            {
                Ok(states)
                    if states.len() >= self.num_nodes()
                        && states
                            .values()
                            .all(|s| s.checkpoint.as_deref() == Some(value.as_str())) =>
                {
                    info!(checkpoint = %value, attempt, "mgmtbus: graph checkpointed");
                    return true;
                }
                Ok(_) => debug!(attempt, "mgmtbus: checkpoint not yet converged"),
                Err(e) => warn!(attempt, error = %e, "mgmtbus: state_info failed during checkpoint"),
            }
            tokio::time::sleep(self.cfg.checkpoint_backoff).await;
        }
        error!(checkpoint = %value, "mgmtbus: graph failed to checkpoint");
        false
    }

    /*──────── status ────────*/

    /// One status round: collect, store, emit metrics.
    pub async fn poll_status_once(&self) -> Result<BTreeMap<String, NodeStateInfo>, MgmtbusError> {
        let res = self
            .fanout("status", json!({}), self.cfg.status_timeout)
            .await?;
        if res.errors > 0 {
            warn!(errors = res.errors, "mgmtbus: errors reported in status");
        }
        let status = decode_answers(res.answers)?;

        {
            let mut g = self.graph_status.lock().unwrap_or_else(|p| p.into_inner());
            g.extend(status.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.collector
            .put_values(aggregate_metrics(&self.config, &status, self.clock.now()));
        Ok(status)
    }

    pub fn start_status_monitor(self: &Arc<Self>) {
        let this = self.clone();
        let h = tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.cfg.status_interval).await;
                if let Err(e) = this.poll_status_once().await {
                    warn!(error = %e, "mgmtbus: status poll failed");
                }
            }
        });
        if let Some(old) = self
            .status_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(h)
        {
            old.abort();
        }
    }

    pub fn stop_status_monitor(&self) {
        if let Some(h) = self
            .status_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            h.abort();
        }
    }

    /// Last collected status per node.
    pub fn graph_status(&self) -> BTreeMap<String, NodeStateInfo> {
        self.graph_status
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Ask one node to reload; fire and forget.
    pub async fn hup_node(&self, node: &str) -> Result<(), MgmtbusError> {
        self.fabric
            .send_rpc(&slave_address(node), "hup", json!({}), false, None)
            .await?;
        Ok(())
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.stop_status_monitor();
    }
}
