//! Agent communication bus: mailboxes, broadcast, correlation, shared context.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::comm::context::SharedContext;
use crate::comm::message::{AgentMessage, MessageType};
use crate::config::CommConfig;
use crate::error::CommError;

/// Name under which the shared broadcast mailbox is registered.
const BROADCAST_MAILBOX: &str = "__broadcast__";

/// A per-agent mailbox. The receiver sits behind a mutex so `receive`
/// can suspend without holding the registry lock.
struct Mailbox {
    tx: mpsc::UnboundedSender<AgentMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<AgentMessage>>,
}

impl Mailbox {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }
}

/// Filters for [`AgentCommunicator::get_message_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only messages tagged with this workflow.
    pub workflow_id: Option<Uuid>,
    /// Only messages sent from or to this agent.
    pub agent: Option<String>,
    /// Only messages of this type.
    pub message_type: Option<MessageType>,
}

/// Message bus between agents.
///
/// Mailboxes are created lazily on first use. Broadcasts go to the shared
/// broadcast mailbox and to every agent subscribed to the message type, so
/// a subscriber never misses one even when it is not draining the shared
/// channel.
pub struct AgentCommunicator {
    config: CommConfig,
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    /// Broadcast fan-out membership per message type.
    subscriptions: RwLock<HashMap<MessageType, HashSet<String>>>,
    /// Pending request correlations keyed by message_id.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<serde_json::Value>>>,
    contexts: RwLock<HashMap<Uuid, SharedContext>>,
    history: Mutex<VecDeque<AgentMessage>>,
}

impl AgentCommunicator {
    pub fn new(config: CommConfig) -> Self {
        Self {
            config,
            mailboxes: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    async fn mailbox(&self, agent: &str) -> Arc<Mailbox> {
        if let Some(mb) = self.mailboxes.read().await.get(agent) {
            return Arc::clone(mb);
        }
        let mut mailboxes = self.mailboxes.write().await;
        Arc::clone(mailboxes.entry(agent.to_string()).or_insert_with(Mailbox::new))
    }

    async fn record(&self, msg: &AgentMessage) {
        let mut history = self.history.lock().await;
        history.push_back(msg.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Send a message.
    ///
    /// Targeted messages go only to the recipient's mailbox. Broadcasts go
    /// to the shared broadcast mailbox and to each subscriber of the type.
    /// If `requires_response` is set, the caller suspends on the correlation
    /// until [`send_response`](Self::send_response) resolves it or the
    /// configured timeout elapses; on timeout an empty (`Null`) payload is
    /// returned and a late response becomes a no-op.
    pub async fn send(&self, msg: AgentMessage) -> Result<Option<serde_json::Value>, CommError> {
        self.record(&msg).await;

        let wait_rx = if msg.requires_response {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(msg.message_id, tx);
            Some(rx)
        } else {
            None
        };

        match &msg.to_agent {
            Some(agent) => {
                let mb = self.mailbox(agent).await;
                mb.tx
                    .send(msg.clone())
                    .map_err(|_| CommError::MailboxClosed {
                        agent: agent.clone(),
                    })?;
            }
            None => {
                let shared = self.mailbox(BROADCAST_MAILBOX).await;
                let _ = shared.tx.send(msg.clone());

                let subscribers: Vec<String> = self
                    .subscriptions
                    .read()
                    .await
                    .get(&msg.message_type)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for agent in subscribers {
                    let mb = self.mailbox(&agent).await;
                    let _ = mb.tx.send(msg.clone());
                }
            }
        }

        let Some(rx) = wait_rx else {
            return Ok(None);
        };

        match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            // Sender dropped or timed out: discard the registration so a
            // late response is dropped, and hand back an empty payload.
            _ => {
                self.pending.lock().await.remove(&msg.message_id);
                tracing::warn!(
                    message = %msg.message_id,
                    to = msg.to_agent.as_deref().unwrap_or("broadcast"),
                    "Response timed out"
                );
                Ok(Some(serde_json::Value::Null))
            }
        }
    }

    /// Suspend until a message is available in this agent's mailbox or
    /// `timeout` elapses.
    pub async fn receive(&self, agent: &str, timeout: std::time::Duration) -> Option<AgentMessage> {
        let mb = self.mailbox(agent).await;
        let mut rx = mb.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drain the shared broadcast mailbox (for agents watching everything
    /// rather than subscribing per type).
    pub async fn receive_broadcast(&self, timeout: std::time::Duration) -> Option<AgentMessage> {
        self.receive(BROADCAST_MAILBOX, timeout).await
    }

    /// Resolve the correlation for `original` exactly once. Responding to
    /// an already-resolved or expired correlation is a no-op.
    pub async fn send_response(
        &self,
        original: &AgentMessage,
        from_agent: &str,
        payload: serde_json::Value,
    ) {
        let response = AgentMessage::response_to(original, from_agent, payload.clone());
        self.record(&response).await;

        match self.pending.lock().await.remove(&original.message_id) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    tracing::debug!(
                        message = %original.message_id,
                        "Requester gave up before the response arrived"
                    );
                }
            }
            None => {
                tracing::debug!(
                    message = %original.message_id,
                    "Dropping response to unknown or expired correlation"
                );
            }
        }
    }

    /// Add an agent to the broadcast fan-out for a message type.
    pub async fn subscribe(&self, agent: &str, message_type: MessageType) {
        self.subscriptions
            .write()
            .await
            .entry(message_type)
            .or_default()
            .insert(agent.to_string());
        // Materialize the mailbox so broadcasts queue up even before the
        // agent first calls receive().
        let _ = self.mailbox(agent).await;
    }

    /// Remove an agent from the broadcast fan-out for a message type.
    pub async fn unsubscribe(&self, agent: &str, message_type: MessageType) {
        if let Some(set) = self.subscriptions.write().await.get_mut(&message_type) {
            set.remove(agent);
        }
    }

    /// The most recent messages matching `filter`, newest last.
    pub async fn get_message_history(
        &self,
        filter: HistoryFilter,
        limit: usize,
    ) -> Vec<AgentMessage> {
        let history = self.history.lock().await;
        let matching: Vec<AgentMessage> = history
            .iter()
            .filter(|m| {
                filter
                    .workflow_id
                    .is_none_or(|wf| m.workflow_id == Some(wf))
                    && filter.agent.as_deref().is_none_or(|agent| {
                        m.from_agent == agent || m.to_agent.as_deref() == Some(agent)
                    })
                    && filter.message_type.is_none_or(|t| m.message_type == t)
            })
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    // ── Shared context ──────────────────────────────────────────────

    /// Snapshot of the shared context for a workflow, creating it lazily.
    pub async fn get_shared_context(&self, workflow_id: Uuid) -> SharedContext {
        if let Some(ctx) = self.contexts.read().await.get(&workflow_id) {
            return ctx.clone();
        }
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(workflow_id)
            .or_insert_with(|| SharedContext::new(workflow_id))
            .clone()
    }

    /// Merge or replace the shared data, bumping the version by exactly
    /// one, then broadcast a StateUpdate notification. Returns the new
    /// version.
    pub async fn update_shared_context(
        &self,
        workflow_id: Uuid,
        agent: &str,
        updates: HashMap<String, serde_json::Value>,
        merge: bool,
    ) -> u64 {
        let keys: Vec<String> = updates.keys().cloned().collect();
        let version = {
            let mut contexts = self.contexts.write().await;
            let ctx = contexts
                .entry(workflow_id)
                .or_insert_with(|| SharedContext::new(workflow_id));
            ctx.apply_update(agent, updates, merge);
            ctx.version
        };

        let notice = AgentMessage::broadcast(
            agent,
            MessageType::StateUpdate,
            serde_json::json!({ "version": version, "keys": keys }),
        )
        .with_workflow(workflow_id);
        if let Err(e) = self.send(notice).await {
            tracing::warn!(workflow = %workflow_id, "StateUpdate broadcast failed: {e}");
        }

        version
    }

    /// Take an advisory lock on the workflow context. Returns false when
    /// another agent holds it.
    pub async fn lock_context(&self, workflow_id: Uuid, agent: &str, lock_name: &str) -> bool {
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(workflow_id)
            .or_insert_with(|| SharedContext::new(workflow_id))
            .try_lock(agent, lock_name)
    }

    /// Release an advisory lock held by `agent`.
    pub async fn unlock_context(&self, workflow_id: Uuid, agent: &str, lock_name: &str) -> bool {
        let mut contexts = self.contexts.write().await;
        match contexts.get_mut(&workflow_id) {
            Some(ctx) => ctx.unlock(agent, lock_name),
            None => false,
        }
    }

    /// Serialized snapshot of the shared context, if one exists.
    pub async fn export_context(&self, workflow_id: Uuid) -> Option<serde_json::Value> {
        let contexts = self.contexts.read().await;
        contexts
            .get(&workflow_id)
            .and_then(|ctx| serde_json::to_value(ctx).ok())
    }

    /// Release the shared context when a workflow is cleared.
    pub async fn clear_context(&self, workflow_id: Uuid) -> Option<SharedContext> {
        self.contexts.write().await.remove(&workflow_id)
    }
}

impl Default for AgentCommunicator {
    fn default() -> Self {
        Self::new(CommConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn targeted_send_reaches_only_recipient() {
        let comm = AgentCommunicator::default();
        let msg = AgentMessage::new("a", "b", MessageType::Notification, serde_json::json!(1));
        comm.send(msg).await.unwrap();

        let got = comm.receive("b", RECV_TIMEOUT).await.unwrap();
        assert_eq!(got.from_agent, "a");
        assert!(comm.receive("c", Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_and_shared_channel() {
        let comm = AgentCommunicator::default();
        comm.subscribe("b", MessageType::Notification).await;
        comm.subscribe("c", MessageType::Notification).await;

        let msg = AgentMessage::broadcast("a", MessageType::Notification, serde_json::json!(1));
        let id = msg.message_id;
        comm.send(msg).await.unwrap();

        assert_eq!(comm.receive("b", RECV_TIMEOUT).await.unwrap().message_id, id);
        assert_eq!(comm.receive("c", RECV_TIMEOUT).await.unwrap().message_id, id);
        assert_eq!(
            comm.receive_broadcast(RECV_TIMEOUT).await.unwrap().message_id,
            id
        );
        // Exactly once per subscriber.
        assert!(comm.receive("b", Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribed_agent_misses_broadcast() {
        let comm = AgentCommunicator::default();
        comm.subscribe("b", MessageType::Notification).await;
        comm.unsubscribe("b", MessageType::Notification).await;

        let msg = AgentMessage::broadcast("a", MessageType::Notification, serde_json::json!(1));
        comm.send(msg).await.unwrap();
        assert!(comm.receive("b", Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let comm = Arc::new(AgentCommunicator::default());

        let responder = Arc::clone(&comm);
        tokio::spawn(async move {
            let req = responder.receive("worker", RECV_TIMEOUT).await.unwrap();
            responder
                .send_response(&req, "worker", serde_json::json!("pong"))
                .await;
        });

        let req = AgentMessage::request("planner", "worker", serde_json::json!("ping"));
        let resp = comm.send(req).await.unwrap();
        assert_eq!(resp, Some(serde_json::json!("pong")));
    }

    #[tokio::test]
    async fn response_timeout_returns_empty() {
        let comm = AgentCommunicator::new(CommConfig {
            response_timeout: Duration::from_millis(100),
            ..CommConfig::default()
        });

        let req = AgentMessage::request("planner", "silent", serde_json::json!("ping"));
        let original = req.clone();
        let resp = comm.send(req).await.unwrap();
        assert_eq!(resp, Some(serde_json::Value::Null));

        // Late response after expiry is a no-op.
        comm.send_response(&original, "silent", serde_json::json!("late"))
            .await;
    }

    #[tokio::test]
    async fn double_response_is_noop() {
        let comm = Arc::new(AgentCommunicator::default());

        let responder = Arc::clone(&comm);
        tokio::spawn(async move {
            let req = responder.receive("worker", RECV_TIMEOUT).await.unwrap();
            responder
                .send_response(&req, "worker", serde_json::json!("first"))
                .await;
            responder
                .send_response(&req, "worker", serde_json::json!("second"))
                .await;
        });

        let req = AgentMessage::request("planner", "worker", serde_json::Value::Null);
        let resp = comm.send(req).await.unwrap();
        assert_eq!(resp, Some(serde_json::json!("first")));
    }

    #[tokio::test]
    async fn shared_context_update_and_export() {
        let comm = AgentCommunicator::default();
        let workflow_id = Uuid::new_v4();

        let v1 = comm
            .update_shared_context(
                workflow_id,
                "a1",
                HashMap::from([("k".to_string(), serde_json::json!(1))]),
                true,
            )
            .await;
        assert_eq!(v1, 1);

        let ctx = comm.get_shared_context(workflow_id).await;
        assert_eq!(ctx.version, 1);
        assert_eq!(ctx.updated_by.as_deref(), Some("a1"));

        let exported = comm.export_context(workflow_id).await.unwrap();
        assert_eq!(exported["version"], 1);

        // StateUpdate notification lands on the shared broadcast channel.
        let notice = comm.receive_broadcast(RECV_TIMEOUT).await.unwrap();
        assert_eq!(notice.message_type, MessageType::StateUpdate);

        assert!(comm.clear_context(workflow_id).await.is_some());
        assert!(comm.export_context(workflow_id).await.is_none());
    }

    #[tokio::test]
    async fn advisory_locks_via_bus() {
        let comm = AgentCommunicator::default();
        let workflow_id = Uuid::new_v4();

        assert!(comm.lock_context(workflow_id, "a1", "budget").await);
        assert!(!comm.lock_context(workflow_id, "a2", "budget").await);
        assert!(!comm.unlock_context(workflow_id, "a2", "budget").await);
        assert!(comm.unlock_context(workflow_id, "a1", "budget").await);
        assert!(comm.lock_context(workflow_id, "a2", "budget").await);
    }

    #[tokio::test]
    async fn history_filters_and_caps() {
        let comm = AgentCommunicator::default();
        let workflow_id = Uuid::new_v4();

        for i in 0..5 {
            let msg = AgentMessage::new("a", "b", MessageType::Notification, serde_json::json!(i))
                .with_workflow(workflow_id);
            comm.send(msg).await.unwrap();
        }
        comm.send(AgentMessage::new(
            "x",
            "y",
            MessageType::Error,
            serde_json::Value::Null,
        ))
        .await
        .unwrap();

        let filtered = comm
            .get_message_history(
                HistoryFilter {
                    workflow_id: Some(workflow_id),
                    ..HistoryFilter::default()
                },
                3,
            )
            .await;
        assert_eq!(filtered.len(), 3);
        // Newest last, oldest trimmed by the limit.
        assert_eq!(filtered[2].payload, serde_json::json!(4));

        let by_agent = comm
            .get_message_history(
                HistoryFilter {
                    agent: Some("y".to_string()),
                    ..HistoryFilter::default()
                },
                10,
            )
            .await;
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].message_type, MessageType::Error);
    }
}
