use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::fabric::{
    FabricError,
    dispatch::Dispatch,
    envelope::{self, RpcReply, RpcRequest},
    transports::MessageTransport,
};

/*──────────────────────── config ───────────────────────*/

#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Applied to unicast calls made without an explicit timeout. `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// How long a discarded fanout call stays tracked before it is dropped.
    pub discard_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            discard_timeout: Duration::from_secs(120),
        }
    }
}

/*──────────────────────── server ───────────────────────*/

pub(crate) struct RpcServer {
    pub name: String,
    pub dispatch: Dispatch,
    /// Fanout group joined at start; replies are tagged with `name`.
    pub fanout: Option<String>,
}

impl RpcServer {
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn run(self, messages: Arc<dyn MessageTransport>, mut rx: mpsc::Receiver<Vec<u8>>) {
        let this = Arc::new(self);
        while let Some(frame) = rx.recv().await {
            let req: RpcRequest = match envelope::decode(&frame) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "rpc: malformed request dropped");
                    continue;
                }
            };
            // One task per request so a slow method never stalls the channel.
            let this = this.clone();
            let messages = messages.clone();
            tokio::spawn(async move { this.serve(messages, req).await });
        }
        debug!("rpc: server exit");
    }

    async fn serve(&self, messages: Arc<dyn MessageTransport>, req: RpcRequest) {
        let source = self.fanout.as_ref().map(|_| self.name.clone());
        let reply = match self.dispatch.invoke(&req.method, req.params).await {
            Ok(result) => RpcReply::ok(req.id, result, source),
            Err(FabricError::Remote(msg)) => RpcReply::err(req.id, msg, source),
            Err(e) => RpcReply::err(req.id, e.to_string(), source),
        };
        let Some(reply_to) = req.reply_to else {
            return;
        };
        let frame = match envelope::encode(&reply) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "rpc: reply encode failed");
                return;
            }
        };
        if let Err(e) = messages.send(&reply_to, frame).await {
            warn!(%reply_to, error = %e, "rpc: reply undeliverable");
        }
    }
}

/*──────────────────────── unicast pending map ───────────────────────*/

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcReply>>>>;

/// Reply loop for the fabric's private reply address.
pub(crate) async fn unicast_reply_loop(pending: PendingMap, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let reply: RpcReply = match envelope::decode(&frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "rpc: malformed reply dropped");
                continue;
            }
        };
        let waiter = pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&reply.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(id = %reply.id, "rpc: reply for unknown id dropped"),
        }
    }
}

/*──────────────────────── fanout client ───────────────────────*/

/// Aggregated fanout outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FanoutResult {
    pub answers: BTreeMap<String, Value>,
    pub errors: usize,
}

struct ActiveFanout {
    method: String,
    num_results: usize,
    seen: HashSet<String>,
    result: FanoutResult,
    done: Option<oneshot::Sender<FanoutResult>>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveFanout>>>;

pub struct FanoutClient {
    topic: String,
    reply_address: String,
    messages: Arc<dyn MessageTransport>,
    cfg: RpcConfig,
    next_id: AtomicU64,
    running: AtomicBool,
    active: ActiveMap,
}

impl FanoutClient {
    pub(crate) fn new(
        topic: &str,
        reply_address: String,
        messages: Arc<dyn MessageTransport>,
        cfg: RpcConfig,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            reply_address,
            messages,
            cfg,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Calls still waiting for replies.
    pub fn in_flight(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Broadcast `method` to every member of the topic and aggregate up to
    /// `num_results` distinct-source replies. With `and_discard` the call is
    /// still tracked but dropped after the discard timeout instead of with the
    /// returned handle.
    pub async fn send_rpc(
        &self,
        method: &str,
        params: Value,
        num_results: usize,
        and_discard: bool,
    ) -> Result<FanoutCall, FabricError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(FabricError::Stopped);
        }
        let id = format!(
            "{}:{}",
            self.reply_address,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();

        if num_results == 0 {
            let _ = tx.send(FanoutResult::default());
        } else {
            self.active.lock().unwrap_or_else(|p| p.into_inner()).insert(
                id.clone(),
                ActiveFanout {
                    method: method.to_string(),
                    num_results,
                    seen: HashSet::new(),
                    result: FanoutResult::default(),
                    done: Some(tx),
                },
            );
        }

        let frame = envelope::encode(&RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
            reply_to: Some(self.reply_address.clone()),
        })?;
        if let Err(e) = self.messages.broadcast(&self.topic, frame).await {
            self.active
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            return Err(e.into());
        }
        debug!(topic = %self.topic, %method, %id, num_results, "rpc: fanout sent");

        if and_discard && num_results > 0 {
            let active = self.active.clone();
            let id = id.clone();
            let after = self.cfg.discard_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                active.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            });
        }

        Ok(FanoutCall {
            id,
            rx,
            active: self.active.clone(),
            discard: and_discard,
        })
    }

    pub(crate) fn handle_reply(&self, reply: RpcReply) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        let Some(call) = active.get_mut(&reply.id) else {
            warn!(topic = %self.topic, id = %reply.id, "rpc: fanout reply for unknown id dropped");
            return;
        };

        if let Some(source) = &reply.source {
            if !call.seen.insert(source.clone()) {
                debug!(id = %reply.id, %source, "rpc: duplicate fanout reply ignored");
                return;
            }
        }

        match (reply.error, reply.source) {
            (Some(err), source) => {
                warn!(method = %call.method, ?source, error = %err, "rpc: fanout member error");
                call.result.errors += 1;
            }
            (None, Some(source)) => {
                call.result.answers.insert(source, reply.result);
            }
            (None, None) => {
                warn!(method = %call.method, "rpc: fanout reply without source counted as error");
                call.result.errors += 1;
            }
        }

        if call.result.answers.len() + call.result.errors >= call.num_results {
            if let Some(mut call) = active.remove(&reply.id) {
                if let Some(done) = call.done.take() {
                    let _ = done.send(call.result);
                }
            }
        }
    }

    pub(crate) async fn reply_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = rx.recv().await {
            match envelope::decode::<RpcReply>(&frame) {
                Ok(reply) => self.handle_reply(reply),
                Err(e) => warn!(topic = %self.topic, error = %e, "rpc: malformed reply dropped"),
            }
        }
    }
}

/// Handle on one outstanding fanout request.
pub struct FanoutCall {
    id: String,
    rx: oneshot::Receiver<FanoutResult>,
    active: ActiveMap,
    discard: bool,
}

impl FanoutCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the aggregate. On timeout the partial state is removed and
    /// later replies for this id are dropped.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<FanoutResult, FabricError> {
        let res = match timeout {
            Some(t) => match tokio::time::timeout(t, &mut self.rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.forget();
                    return Err(FabricError::Timeout);
                }
            },
            None => (&mut self.rx).await,
        };
        res.map_err(|_| FabricError::Stopped)
    }

    /// Non-blocking check; `Some` once the aggregate resolved.
    pub fn try_result(&mut self) -> Option<FanoutResult> {
        self.rx.try_recv().ok()
    }

    fn forget(&self) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

impl Drop for FanoutCall {
    fn drop(&mut self) {
        if !self.discard {
            self.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::transports::inmem::InMemHub;
    use serde_json::json;

    fn client(hub: Arc<InMemHub>) -> FanoutClient {
        let c = FanoutClient::new("bus", "bus:reply".into(), hub, RpcConfig::default());
        c.set_running(true);
        c
    }

    fn answer(id: &str, source: &str, v: Value) -> RpcReply {
        RpcReply::ok(id.to_string(), v, Some(source.to_string()))
    }

    #[tokio::test]
    async fn resolves_exactly_at_n_distinct_sources() {
        let c = client(InMemHub::new());
        let mut call = c.send_rpc("status", Value::Null, 3, false).await.unwrap();
        let id = call.id().to_string();

        c.handle_reply(answer(&id, "a", json!(1)));
        c.handle_reply(answer(&id, "a", json!(99)));
        assert!(call.try_result().is_none());

        c.handle_reply(RpcReply::err(id.clone(), "boom".into(), Some("b".into())));
        assert!(call.try_result().is_none());

        c.handle_reply(answer(&id, "c", json!(3)));
        let res = call.try_result().unwrap();
        assert_eq!(res.errors, 1);
        assert_eq!(res.answers.len(), 2);
        assert_eq!(res.answers["a"], json!(1));
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_results_resolve_immediately() {
        let c = client(InMemHub::new());
        let call = c.send_rpc("status", Value::Null, 0, false).await.unwrap();
        assert_eq!(call.wait(None).await.unwrap(), FanoutResult::default());
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_drops_state_and_late_replies() {
        let c = client(InMemHub::new());
        let call = c.send_rpc("state_info", Value::Null, 2, false).await.unwrap();
        let id = call.id().to_string();
        c.handle_reply(answer(&id, "a", json!(1)));

        let err = call.wait(Some(Duration::from_secs(30))).await.unwrap_err();
        assert_eq!(err, FabricError::Timeout);
        assert_eq!(c.in_flight(), 0);

        // Late reply takes the unknown-id path and does not resurrect the call.
        c.handle_reply(answer(&id, "b", json!(2)));
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_calls_are_cleaned_up_later() {
        let c = client(InMemHub::new());
        let call = c.send_rpc("rebuild", Value::Null, 2, true).await.unwrap();
        drop(call);
        assert_eq!(c.in_flight(), 1);

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn not_running_is_rejected() {
        let c = FanoutClient::new("bus", "bus:reply".into(), InMemHub::new(), RpcConfig::default());
        assert_eq!(
            c.send_rpc("status", Value::Null, 1, false).await.err(),
            Some(FabricError::Stopped)
        );
    }
}
