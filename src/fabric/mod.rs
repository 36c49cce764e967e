pub mod dispatch;
pub mod envelope;
pub mod pubsub;
pub mod rpc;
pub mod transports;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::uuid_bytes::UuidBytes;
use dispatch::{Dispatch, MethodHandler};
use envelope::RpcRequest;
use pubsub::{PubChannel, PubSubConfig, SubChannel};
use rpc::{FanoutClient, PendingMap, RpcConfig, RpcServer};
use transports::{LogTransport, MessageTransport, TransportError};

/*──────────────────────── errors ─────────*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    Transport(TransportError),
    Timeout,
    Encode(String),
    Decode(String),
    /// Remote handler returned an error.
    Remote(String),
    MethodNotAllowed(String),
    /// An allowed method has no handler entry.
    UnknownMethod(String),
    AlreadyRegistered(String),
    /// Fabric not started, or stopped while waiting.
    Stopped,
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FabricError::*;
        match self {
            Transport(e) => write!(f, "transport: {e}"),
            Timeout => write!(f, "timeout"),
            Encode(e) => write!(f, "encode: {e}"),
            Decode(e) => write!(f, "decode: {e}"),
            Remote(e) => write!(f, "remote error: {e}"),
            MethodNotAllowed(m) => write!(f, "method not allowed: {m}"),
            UnknownMethod(m) => write!(f, "no handler entry for method: {m}"),
            AlreadyRegistered(n) => write!(f, "channel already registered: {n}"),
            Stopped => write!(f, "fabric stopped"),
        }
    }
}

impl std::error::Error for FabricError {}

impl From<TransportError> for FabricError {
    fn from(e: TransportError) -> Self {
        FabricError::Transport(e)
    }
}

/*──────────────────────── config ───────────────────────*/

#[derive(Clone, Debug, Default)]
pub struct FabricConfig {
    pub pubsub: PubSubConfig,
    pub rpc: RpcConfig,
}

pub type FailureListener = Arc<dyn Fn() + Send + Sync>;

/*──────────────────────── Fabric ───────────────────────*/

/// Per-process coordinator owning every channel registry.
///
/// Channels requested before `start()` are activated by it; channels requested
/// afterwards are activated immediately.
pub struct Fabric {
    id: String,
    messages: Arc<dyn MessageTransport>,
    log: Arc<dyn LogTransport>,
    cfg: FabricConfig,
    started: AtomicBool,
    next_id: AtomicU64,

    pub_channels: Mutex<HashMap<String, Arc<PubChannel>>>,
    sub_names: Mutex<HashSet<(String, String)>>,
    rpc_names: Mutex<HashSet<String>>,
    fanout_clients: Mutex<HashMap<String, Arc<FanoutClient>>>,

    // registered but not yet activated
    deferred_subs: Mutex<Vec<SubChannel>>,
    deferred_servers: Mutex<Vec<RpcServer>>,

    pending: PendingMap,
    failure_listeners: Arc<Mutex<Vec<FailureListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Fabric {
    pub fn new(
        messages: Arc<dyn MessageTransport>,
        log: Arc<dyn LogTransport>,
        cfg: FabricConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: UuidBytes::new().to_string(),
            messages,
            log,
            cfg,
            started: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pub_channels: Mutex::new(HashMap::new()),
            sub_names: Mutex::new(HashSet::new()),
            rpc_names: Mutex::new(HashSet::new()),
            fanout_clients: Mutex::new(HashMap::new()),
            deferred_subs: Mutex::new(Vec::new()),
            deferred_servers: Mutex::new(Vec::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            failure_listeners: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn reply_address(&self) -> String {
        format!("{}:rpc-reply", self.id)
    }

    fn track(&self, h: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(h);
    }

    /*──────── channel requests ────────*/

    /// Publisher for `topic`. Repeated requests share one sequence counter.
    pub fn request_pub_channel(&self, topic: &str) -> Arc<PubChannel> {
        self.pub_channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(PubChannel::new(
                    topic,
                    self.log.clone(),
                    self.cfg.pubsub.clone(),
                ))
            })
            .clone()
    }

    /// Forget the publisher for `topic` and, once its subscribers have caught
    /// up (or `drain_timeout` passed), the topic's log.
    pub async fn release_pub_channel(&self, topic: &str) -> Result<(), FabricError> {
        let removed = self
            .pub_channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(topic);
        if let Some(ch) = removed {
            if !ch.drain().await? {
                warn!(%topic, "fabric: releasing pub channel with unread entries");
            }
            self.log.drop_topic(topic).await?;
            debug!(%topic, "fabric: pub channel released");
        }
        Ok(())
    }

    pub fn pub_channel_count(&self) -> usize {
        self.pub_channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub async fn request_sub_channel(
        &self,
        topic: &str,
        handler: Arc<dyn MethodHandler>,
        allowed_methods: &[&str],
        name: &str,
    ) -> Result<(), FabricError> {
        let dispatch = Dispatch::new(handler, allowed_methods, "")?;
        if !self
            .sub_names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((topic.to_string(), name.to_string()))
        {
            return Err(FabricError::AlreadyRegistered(format!("{topic}/{name}")));
        }
        let sub = SubChannel {
            topic: topic.to_string(),
            name: name.to_string(),
            dispatch,
        };
        if self.is_started() {
            self.activate_sub(sub).await
        } else {
            self.deferred_subs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(sub);
            Ok(())
        }
    }

    /// Expose `allowed_methods` of `handler` at address `name`. Handler entries
    /// are looked up as `method_prefix + method`. With `fanout`, the server also
    /// joins that group and tags its replies with `name`.
    pub async fn request_rpc_server_channel(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
        allowed_methods: &[&str],
        method_prefix: &str,
        fanout: Option<&str>,
    ) -> Result<(), FabricError> {
        let dispatch = Dispatch::new(handler, allowed_methods, method_prefix)?;
        if !self
            .rpc_names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string())
        {
            return Err(FabricError::AlreadyRegistered(name.to_string()));
        }
        let server = RpcServer {
            name: name.to_string(),
            dispatch,
            fanout: fanout.map(str::to_string),
        };
        if self.is_started() {
            self.activate_server(server).await
        } else {
            self.deferred_servers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(server);
            Ok(())
        }
    }

    pub async fn request_rpc_fanout_client_channel(
        &self,
        topic: &str,
    ) -> Result<Arc<FanoutClient>, FabricError> {
        let client = {
            let mut clients = self
                .fanout_clients
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if let Some(c) = clients.get(topic) {
                return Ok(c.clone());
            }
            let c = Arc::new(FanoutClient::new(
                topic,
                format!("{topic}:reply:{}", self.id),
                self.messages.clone(),
                self.cfg.rpc.clone(),
            ));
            clients.insert(topic.to_string(), c.clone());
            c
        };
        if self.is_started() {
            self.activate_client(client.clone()).await?;
        }
        Ok(client)
    }

    pub fn add_failure_listener(&self, f: FailureListener) {
        self.failure_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(f);
    }

    /*──────── activation ────────*/

    async fn activate_sub(&self, sub: SubChannel) -> Result<(), FabricError> {
        let slot = self.log.register_subscriber(&sub.topic).await?;
        debug!(topic = %sub.topic, name = %sub.name, slot, "fabric: subscriber active");
        let log = self.log.clone();
        let cfg = self.cfg.pubsub.clone();
        self.track(tokio::spawn(sub.run(log, slot, cfg)));
        Ok(())
    }

    async fn activate_server(&self, server: RpcServer) -> Result<(), FabricError> {
        let rx = self.messages.bind(&server.name).await?;
        if let Some(group) = &server.fanout {
            self.messages.join(group, &server.name).await?;
        }
        debug!(name = %server.name, fanout = ?server.fanout, "fabric: rpc server active");
        let messages = self.messages.clone();
        self.track(tokio::spawn(server.run(messages, rx)));
        Ok(())
    }

    async fn activate_client(&self, client: Arc<FanoutClient>) -> Result<(), FabricError> {
        let rx = self.messages.bind(client.reply_address()).await?;
        client.set_running(true);
        self.track(tokio::spawn(client.reply_loop(rx)));
        Ok(())
    }

    /// Bind every registered channel and start their loops.
    pub async fn start(&self) -> Result<(), FabricError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(id = %self.id, "fabric: starting");

        let rx = self.messages.bind(&self.reply_address()).await?;
        self.track(tokio::spawn(rpc::unicast_reply_loop(
            self.pending.clone(),
            rx,
        )));

        let servers: Vec<RpcServer> = std::mem::take(
            &mut *self
                .deferred_servers
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        for server in servers {
            self.activate_server(server).await?;
        }

        let clients: Vec<Arc<FanoutClient>> = self
            .fanout_clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for client in clients {
            self.activate_client(client).await?;
        }

        let subs: Vec<SubChannel> = std::mem::take(
            &mut *self
                .deferred_subs
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        for sub in subs {
            self.activate_sub(sub).await?;
        }

        let messages = self.messages.clone();
        let listeners = self.failure_listeners.clone();
        self.track(tokio::spawn(async move {
            messages.closed().await;
            error!("fabric: transport connection lost");
            let listeners: Vec<FailureListener> = listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            for f in listeners {
                f();
            }
        }));
        Ok(())
    }

    /// Abort every channel loop. Outstanding unicast calls fail with `Stopped`.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(id = %self.id, "fabric: stopping");
        for h in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            h.abort();
        }
        for c in self
            .fanout_clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
        {
            c.set_running(false);
        }
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /*──────── unicast RPC ────────*/

    /// Direct call to `dest`. Non-blocking calls return `Ok(None)` once the
    /// request is handed to the transport; blocking calls wait up to `timeout`
    /// (or the configured default, or forever).
    pub async fn send_rpc(
        &self,
        dest: &str,
        method: &str,
        params: Value,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, FabricError> {
        let id = format!(
            "{}:{}",
            self.id,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let frame_for = |reply_to: Option<String>| {
            envelope::encode(&RpcRequest {
                id: id.clone(),
                method: method.to_string(),
                params: params.clone(),
                reply_to,
            })
        };

        if !block {
            self.messages.send(dest, frame_for(None)?).await?;
            return Ok(None);
        }
        if !self.is_started() {
            return Err(FabricError::Stopped);
        }

        let frame = frame_for(Some(self.reply_address()))?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), tx);

        if let Err(e) = self.messages.send(dest, frame).await {
            self.forget(&id);
            return Err(e.into());
        }

        let reply = match timeout.or(self.cfg.rpc.default_timeout) {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.forget(&id);
                    warn!(%dest, %method, "rpc: unicast timeout");
                    return Err(FabricError::Timeout);
                }
            },
            None => rx.await,
        }
        .map_err(|_| FabricError::Stopped)?;

        match reply.error {
            Some(e) => Err(FabricError::Remote(e)),
            None => Ok(Some(reply.result)),
        }
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    /// Unicast calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        for h in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            h.abort();
        }
    }
}
