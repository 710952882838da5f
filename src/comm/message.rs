//! Inter-agent message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ContextShare,
    ResultHandoff,
    Request,
    Response,
    Notification,
    Error,
    StateUpdate,
}

/// Delivery priority of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

/// A message between agents. `to_agent = None` means broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message ID (also the correlation key for responses).
    pub message_id: Uuid,
    /// Sending agent role.
    pub from_agent: String,
    /// Receiving agent role; None broadcasts to subscribers.
    pub to_agent: Option<String>,
    /// Message kind.
    pub message_type: MessageType,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// Message body.
    pub payload: serde_json::Value,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Whether the sender suspends on a correlated response.
    pub requires_response: bool,
    /// For responses: the message_id being answered.
    pub correlation_id: Option<Uuid>,
    /// Workflow this message belongs to, if any.
    pub workflow_id: Option<Uuid>,
}

impl AgentMessage {
    /// Create a targeted message.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            from_agent: from_agent.into(),
            to_agent: Some(to_agent.into()),
            message_type,
            priority: MessagePriority::Normal,
            payload,
            timestamp: Utc::now(),
            requires_response: false,
            correlation_id: None,
            workflow_id: None,
        }
    }

    /// Create a broadcast message (no specific recipient).
    pub fn broadcast(
        from_agent: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            from_agent: from_agent.into(),
            to_agent: None,
            message_type,
            priority: MessagePriority::Normal,
            payload,
            timestamp: Utc::now(),
            requires_response: false,
            correlation_id: None,
            workflow_id: None,
        }
    }

    /// Create a request expecting a correlated response.
    pub fn request(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(from_agent, to_agent, MessageType::Request, payload);
        msg.requires_response = true;
        msg
    }

    /// Create the response to a previously received message.
    pub fn response_to(original: &AgentMessage, from_agent: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut msg = Self::new(
            from_agent,
            original.from_agent.clone(),
            MessageType::Response,
            payload,
        );
        msg.correlation_id = Some(original.message_id);
        msg.workflow_id = original.workflow_id;
        msg
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Whether this message has no specific recipient.
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_requires_response() {
        let msg = AgentMessage::request("planner", "researcher", serde_json::json!({"q": 1}));
        assert!(msg.requires_response);
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.to_agent.as_deref(), Some("researcher"));
    }

    #[test]
    fn response_carries_correlation() {
        let req = AgentMessage::request("planner", "researcher", serde_json::Value::Null);
        let resp = AgentMessage::response_to(&req, "researcher", serde_json::json!("answer"));
        assert_eq!(resp.correlation_id, Some(req.message_id));
        assert_eq!(resp.to_agent.as_deref(), Some("planner"));
        assert!(!resp.requires_response);
    }

    #[test]
    fn broadcast_has_no_recipient() {
        let msg = AgentMessage::broadcast("planner", MessageType::Notification, serde_json::Value::Null);
        assert!(msg.is_broadcast());
    }

    #[test]
    fn message_type_serde() {
        let json = serde_json::to_string(&MessageType::StateUpdate).unwrap();
        assert_eq!(json, "\"state_update\"");
    }
}
