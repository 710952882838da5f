//! Workflow event fan-out.
//!
//! Observers register per event type and receive lifecycle events around
//! every task/workflow transition. Observer failures are logged and never
//! propagate into engine control flow — an observability bug must not
//! break orchestration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Kind of workflow lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StateChanged,
}

/// A workflow lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: EventType,
    pub workflow_id: Uuid,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn workflow(event_type: EventType, workflow_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            workflow_id,
            task_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn task(
        event_type: EventType,
        workflow_id: Uuid,
        task_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            workflow_id,
            task_id: Some(task_id.into()),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of workflow events (logging, metrics, audit).
#[async_trait]
pub trait EventObserver: Send + Sync {
    /// Handle one event. An Err is logged by the bus and otherwise ignored.
    async fn on_event(&self, event: &WorkflowEvent) -> Result<(), String>;
}

/// Disposable registration returned by [`EventBus::register`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) event_type: EventType,
}

/// Per-event-type observer registry.
pub struct EventBus {
    observers: RwLock<HashMap<EventType, Vec<(u64, Arc<dyn EventObserver>)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register an observer for one event type.
    pub async fn register(
        &self,
        event_type: EventType,
        observer: Arc<dyn EventObserver>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push((id, observer));
        SubscriptionHandle { id, event_type }
    }

    /// Remove a previously registered observer.
    pub async fn unregister(&self, handle: SubscriptionHandle) {
        if let Some(list) = self.observers.write().await.get_mut(&handle.event_type) {
            list.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Deliver an event to every observer of its type. Failures are
    /// logged, never returned.
    pub async fn emit(&self, event: &WorkflowEvent) {
        let observers: Vec<Arc<dyn EventObserver>> = self
            .observers
            .read()
            .await
            .get(&event.event_type)
            .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default();

        for observer in observers {
            if let Err(reason) = observer.on_event(event).await {
                tracing::warn!(
                    event = ?event.event_type,
                    workflow = %event.workflow_id,
                    "Event observer failed: {reason}"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventObserver for Counter {
        async fn on_event(&self, _event: &WorkflowEvent) -> Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventObserver for AlwaysFails {
        async fn on_event(&self, _event: &WorkflowEvent) -> Result<(), String> {
            Err("observer bug".to_string())
        }
    }

    #[tokio::test]
    async fn emit_reaches_matching_observers_only() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        bus.register(EventType::TaskCompleted, Arc::clone(&counter) as _)
            .await;

        let workflow_id = Uuid::new_v4();
        bus.emit(&WorkflowEvent::task(
            EventType::TaskCompleted,
            workflow_id,
            "t1",
            serde_json::Value::Null,
        ))
        .await;
        bus.emit(&WorkflowEvent::workflow(
            EventType::WorkflowStarted,
            workflow_id,
            serde_json::Value::Null,
        ))
        .await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let bus = EventBus::new();
        bus.register(EventType::TaskFailed, Arc::new(AlwaysFails) as _)
            .await;
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        bus.register(EventType::TaskFailed, Arc::clone(&counter) as _)
            .await;

        bus.emit(&WorkflowEvent::task(
            EventType::TaskFailed,
            Uuid::new_v4(),
            "t1",
            serde_json::Value::Null,
        ))
        .await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        let handle = bus
            .register(EventType::StateChanged, Arc::clone(&counter) as _)
            .await;
        bus.unregister(handle).await;

        bus.emit(&WorkflowEvent::workflow(
            EventType::StateChanged,
            Uuid::new_v4(),
            serde_json::Value::Null,
        ))
        .await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 0);
    }
}
