use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    clock::MockClock,
    config::MineMeldConfig,
    fabric::{Fabric, FabricConfig, transports::inmem::InMemHub},
    mgmtbus::{
        MASTER_ADDRESS, ManagedNode, MgmtbusError, NodeState, NodeStateInfo,
        master::{InitOutcome, Master, MasterConfig},
        metrics::MemoryCollector,
        slave::SlaveHub,
    },
    planner::Action,
    tests::{init_tracing, wait_until},
};

struct TestNode {
    info: Mutex<NodeStateInfo>,
    commands: Mutex<Vec<String>>,
    broken: bool,
    ignores_checkpoint: bool,
}

impl TestNode {
    fn new(checkpoint: Option<&str>, is_source: bool) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(NodeStateInfo {
                checkpoint: checkpoint.map(str::to_string),
                is_source,
                state: NodeState::Started,
                length: 10,
                statistics: BTreeMap::from([("added".to_string(), 4)]),
                inputs: Vec::new(),
            }),
            commands: Mutex::new(Vec::new()),
            broken: false,
            ignores_checkpoint: false,
        })
    }

    fn ignoring_checkpoints() -> Arc<Self> {
        Arc::new(Self {
            ignores_checkpoint: true,
            ..Arc::into_inner(Self::new(None, false)).unwrap()
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(NodeStateInfo::default()),
            commands: Mutex::new(Vec::new()),
            broken: true,
            ignores_checkpoint: false,
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn checkpoint(&self) -> Option<String> {
        self.info.lock().unwrap().checkpoint.clone()
    }

    fn record(&self, command: &str) -> Result<(), String> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

#[async_trait]
impl ManagedNode for TestNode {
    async fn state_info(&self) -> Result<NodeStateInfo, String> {
        if self.broken {
            return Err("state unavailable".into());
        }
        Ok(self.info.lock().unwrap().clone())
    }

    async fn initialize(&self) -> Result<(), String> {
        self.record("initialize")
    }

    async fn rebuild(&self) -> Result<(), String> {
        self.record("rebuild")
    }

    async fn reset(&self) -> Result<(), String> {
        self.record("reset")
    }

    async fn status(&self) -> Result<NodeStateInfo, String> {
        Ok(self.info.lock().unwrap().clone())
    }

    async fn checkpoint(&self, value: String) -> Result<(), String> {
        if !self.ignores_checkpoint {
            self.info.lock().unwrap().checkpoint = Some(value);
        }
        self.record("checkpoint")
    }

    async fn hup(&self) -> Result<(), String> {
        self.record("hup")
    }
}

/// a (miner) -> b (processor) -> c (output)
fn chain_config(newconfig: bool) -> MineMeldConfig {
    let mut cfg = MineMeldConfig::from_json(
        r#"{
            "nodes": {
                "a": {"inputs": [], "class": "Miner"},
                "b": {"inputs": ["a"], "class": "Aggregator"},
                "c": {"inputs": ["b"], "output": false, "class": "Output"}
            }
        }"#,
    )
    .unwrap();
    cfg.newconfig = newconfig;
    cfg
}

fn fast() -> MasterConfig {
    MasterConfig {
        status_interval: Duration::from_secs(1),
        state_info_timeout: Duration::from_secs(1),
        checkpoint_timeout: Duration::from_secs(1),
        checkpoint_poll_timeout: Duration::from_secs(1),
        status_timeout: Duration::from_secs(1),
        retry_interval: Duration::from_millis(100),
        checkpoint_max_tries: 3,
        checkpoint_backoff: Duration::from_millis(100),
        ..MasterConfig::default()
    }
}

struct Bus {
    master: Arc<Master>,
    master_fabric: Arc<Fabric>,
    collector: Arc<MemoryCollector>,
    clock: Arc<MockClock>,
    _slaves: Arc<Fabric>,
}

async fn bus(config: MineMeldConfig, nodes: &[(&str, Arc<TestNode>)]) -> Bus {
    init_tracing();
    let hub = InMemHub::new();
    let slaves = Fabric::new(hub.clone(), hub.clone(), FabricConfig::default());
    let hub_slaves = SlaveHub::new(slaves.clone());
    for (name, node) in nodes {
        hub_slaves.register(name, node.clone()).await.unwrap();
    }
    slaves.start().await.unwrap();

    let master_fabric = Fabric::new(hub.clone(), hub.clone(), FabricConfig::default());
    let collector = MemoryCollector::new();
    let clock = Arc::new(MockClock::new(1_000));
    let master = Master::new(
        master_fabric.clone(),
        config,
        fast(),
        collector.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    master_fabric.start().await.unwrap();
    Bus {
        master,
        master_fabric,
        collector,
        clock,
        _slaves: slaves,
    }
}

async fn all_received(nodes: &[&Arc<TestNode>], command: &str) {
    wait_until(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.commands().iter().any(|c| c == command))
    })
    .await;
}

#[tokio::test]
async fn new_config_rebuilds_without_asking() {
    let (a, b, c) = (TestNode::broken(), TestNode::broken(), TestNode::broken());
    let bus = bus(chain_config(true), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert_eq!(bus.master.init_graph().await.unwrap(), InitOutcome::Rebuild);
    all_received(&[&a, &b, &c], "rebuild").await;
}

#[tokio::test]
async fn shared_checkpoint_initializes() {
    let (a, b, c) = (
        TestNode::new(Some("ck1"), true),
        TestNode::new(Some("ck1"), false),
        TestNode::new(Some("ck1"), false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert_eq!(bus.master.init_graph().await.unwrap(), InitOutcome::Initialize);
    all_received(&[&a, &b, &c], "initialize").await;
}

#[tokio::test]
async fn source_checkpoint_rebuilds() {
    let (a, b, c) = (
        TestNode::new(Some("ck1"), true),
        TestNode::new(Some("ck0"), false),
        TestNode::new(None, false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert_eq!(bus.master.init_graph().await.unwrap(), InitOutcome::Rebuild);
    all_received(&[&a, &b, &c], "rebuild").await;
}

#[tokio::test]
async fn no_usable_checkpoint_resets() {
    let (a, b, c) = (
        TestNode::new(None, true),
        TestNode::new(Some("ck1"), false),
        TestNode::new(Some("ck1"), false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert_eq!(bus.master.init_graph().await.unwrap(), InitOutcome::Reset);
    all_received(&[&a, &b, &c], "reset").await;
}

#[tokio::test(start_paused = true)]
async fn silent_node_times_out_into_reset() {
    let (a, b) = (TestNode::new(Some("ck1"), true), TestNode::new(Some("ck1"), false));
    // c never joins the bus
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone())]).await;

    assert_eq!(bus.master.init_graph().await.unwrap(), InitOutcome::Reset);
    all_received(&[&a, &b], "reset").await;
}

#[tokio::test]
async fn node_errors_are_fatal_for_init() {
    let (a, b, c) = (
        TestNode::new(Some("ck1"), true),
        TestNode::broken(),
        TestNode::new(Some("ck1"), false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert_eq!(
        bus.master.init_graph().await.unwrap_err(),
        MgmtbusError::NodesReportedErrors(1)
    );
    assert!(a.commands().is_empty());
}

#[tokio::test]
async fn planned_init_sends_each_node_its_action() {
    let (a, b, c) = (
        TestNode::new(Some("ck1"), true),
        TestNode::new(Some("ck1"), false),
        TestNode::new(Some("ck1"), false),
    );
    let mut config = chain_config(false);
    config.compute_changes(Some(&chain_config(false)));
    let bus = bus(config, &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    let plan = bus.master.init_graph_planned().await.unwrap();
    assert_eq!(plan.len(), 3);
    assert!(plan.values().all(|a| *a == Action::Initialize));
    all_received(&[&a, &b, &c], "initialize").await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_converges_on_one_token() {
    let (a, b, c) = (
        TestNode::new(None, true),
        TestNode::new(None, false),
        TestNode::new(None, false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    assert!(bus.master.checkpoint_graph().await);
    let token = a.checkpoint().unwrap();
    assert_eq!(b.checkpoint().as_deref(), Some(token.as_str()));
    assert_eq!(c.checkpoint().as_deref(), Some(token.as_str()));
    assert!(uuid::Uuid::parse_str(&token).is_ok());
}

#[tokio::test(start_paused = true)]
async fn checkpoint_gives_up_after_configured_tries() {
    let (a, b, c) = (
        TestNode::new(None, true),
        TestNode::ignoring_checkpoints(),
        TestNode::new(None, false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    let started = tokio::time::Instant::now();
    assert!(!bus.master.checkpoint_graph().await);
    assert!(b.commands().iter().any(|c| c == "checkpoint"));
    assert_eq!(b.checkpoint(), None);
    // Three polls, each followed by the backoff.
    assert!(started.elapsed() >= fast().checkpoint_backoff * 3);
    assert!(a.checkpoint().is_some());
}

#[tokio::test(start_paused = true)]
async fn status_monitor_stores_status_and_emits_metrics() {
    let (a, b, c) = (
        TestNode::new(None, true),
        TestNode::new(None, false),
        TestNode::new(None, false),
    );
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]).await;

    bus.master.start_status_monitor();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let master = bus.master.clone();
    wait_until(Duration::from_secs(5), || master.graph_status().len() == 3).await;
    bus.master.stop_status_monitor();

    assert_eq!(bus.collector.value_of("minemeld.a.added"), Some(4));
    assert_eq!(bus.collector.value_of("minemeld.b.length"), Some(10));
    assert!(bus.collector.samples().iter().all(|s| s.timestamp == 1_000));

    bus.clock.advance(500);
    bus.master.poll_status_once().await.unwrap();
    assert!(bus.collector.samples().iter().any(|s| s.timestamp == 1_500));

    let status: Value = bus
        .master_fabric
        .send_rpc(MASTER_ADDRESS, "status", json!({}), true, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status["c"]["state"], "STARTED");
}

#[tokio::test]
async fn hup_goes_to_one_node() {
    let (a, b) = (TestNode::new(None, true), TestNode::new(None, false));
    let bus = bus(chain_config(false), &[("a", a.clone()), ("b", b.clone())]).await;

    bus.master.hup_node("b").await.unwrap();
    all_received(&[&b], "hup").await;
    assert!(a.commands().is_empty());
}
