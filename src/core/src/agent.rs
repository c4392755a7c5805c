//! Agent reply normalization.
//!
//! Older agents answer with the bare task return value, newer ones with
//! `{"state", "value", "agent_task_id"}`. Replies are classified into
//! [`RawReply`] and converted into the single [`AgentReply`] shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State assumed when a reply does not carry one.
pub const DONE_STATE: &str = "done";

/// A reply as received from an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    /// Has a state and at least a value or a task id
    FullyFormed {
        state: Value,
        value: Option<Value>,
        agent_task_id: Option<Value>,
    },
    /// Has a value but no state
    ValueOnly {
        value: Value,
        agent_task_id: Option<Value>,
    },
    /// Anything else; the whole message is the value
    Freeform(Value),
}

/// Canonical agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Task state; usually a string, carried through as sent
    pub state: Value,
    pub value: Option<Value>,
    pub agent_task_id: Option<Value>,
}

impl RawReply {
    pub fn classify(message: Value) -> Self {
        let Value::Object(map) = &message else {
            return RawReply::Freeform(message);
        };

        let has_value = map.contains_key("value");
        let has_task_id = map.contains_key("agent_task_id");

        match map.get("state") {
            Some(state) if has_value || has_task_id => RawReply::FullyFormed {
                state: state.clone(),
                value: map.get("value").cloned(),
                agent_task_id: map.get("agent_task_id").cloned(),
            },
            None if has_value => RawReply::ValueOnly {
                value: map.get("value").cloned().unwrap_or(Value::Null),
                agent_task_id: map.get("agent_task_id").cloned(),
            },
            _ => RawReply::Freeform(message),
        }
    }

    pub fn normalize(self) -> AgentReply {
        match self {
            RawReply::FullyFormed {
                state,
                value,
                agent_task_id,
            } => AgentReply {
                state,
                value,
                agent_task_id,
            },
            RawReply::ValueOnly {
                value,
                agent_task_id,
            } => AgentReply {
                state: Value::from(DONE_STATE),
                value: Some(value),
                agent_task_id,
            },
            RawReply::Freeform(message) => {
                let state = match message.get("state") {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => Value::from(DONE_STATE),
                    Some(state) => state.clone(),
                };
                let agent_task_id = message.get("agent_task_id").cloned();
                AgentReply {
                    state,
                    value: Some(message),
                    agent_task_id,
                }
            }
        }
    }
}

impl AgentReply {
    /// The state as a string, if it is one.
    pub fn state_str(&self) -> Option<&str> {
        self.state.as_str()
    }
}

/// Classify and normalize an agent message in one step.
pub fn normalize_reply(message: Value) -> AgentReply {
    RawReply::classify(message).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fully_formed_passes_through() {
        let reply = normalize_reply(json!({"state": "running", "value": 5, "agent_task_id": 123}));
        assert_eq!(
            reply,
            AgentReply {
                state: json!("running"),
                value: Some(json!(5)),
                agent_task_id: Some(json!(123)),
            }
        );
    }

    #[test]
    fn test_state_and_task_id_without_value() {
        let message = json!({"state": "running", "agent_task_id": "abc"});
        assert!(matches!(
            RawReply::classify(message.clone()),
            RawReply::FullyFormed { value: None, .. }
        ));
        let reply = normalize_reply(message);
        assert_eq!(reply.state_str(), Some("running"));
        assert_eq!(reply.value, None);
        assert_eq!(reply.agent_task_id, Some(json!("abc")));
    }

    #[test]
    fn test_value_without_state_is_done() {
        let reply = normalize_reply(json!({"value": {"ok": true}, "agent_task_id": 7}));
        assert_eq!(reply.state_str(), Some(DONE_STATE));
        assert_eq!(reply.value, Some(json!({"ok": true})));
        assert_eq!(reply.agent_task_id, Some(json!(7)));

        let reply = normalize_reply(json!({"value": "x"}));
        assert_eq!(reply.agent_task_id, None);
    }

    #[test]
    fn test_object_without_value_becomes_value() {
        let message = json!({"state": "failed", "exception": "boom"});
        let reply = normalize_reply(message.clone());
        assert_eq!(reply.state_str(), Some("failed"));
        assert_eq!(reply.value, Some(message));
        assert_eq!(reply.agent_task_id, None);

        let message = json!({"agent_task_id": 9, "output": "x"});
        let reply = normalize_reply(message.clone());
        assert_eq!(reply.state_str(), Some(DONE_STATE));
        assert_eq!(reply.value, Some(message));
        assert_eq!(reply.agent_task_id, Some(json!(9)));
    }

    #[test]
    fn test_scalars_and_arrays_become_value() {
        for message in [json!(42), json!("ok"), json!([1, 2, 3]), json!(null), json!(1.5)] {
            let reply = normalize_reply(message.clone());
            assert_eq!(reply.state_str(), Some(DONE_STATE));
            assert_eq!(reply.value, Some(message));
            assert_eq!(reply.agent_task_id, None);
        }
    }

    #[test]
    fn test_non_string_state_passes_through() {
        let message = json!({"state": null, "value": 1});
        assert!(matches!(
            RawReply::classify(message.clone()),
            RawReply::FullyFormed { .. }
        ));
        let reply = normalize_reply(message);
        assert_eq!(reply.state, Value::Null);
        assert_eq!(reply.value, Some(json!(1)));

        let reply = normalize_reply(json!({"state": 3, "agent_task_id": 9}));
        assert_eq!(reply.state, json!(3));
        assert_eq!(reply.value, None);
        assert_eq!(reply.agent_task_id, Some(json!(9)));
    }

    #[test]
    fn test_freeform_null_state_defaults_to_done() {
        let message = json!({"state": null, "exception": "boom"});
        let reply = normalize_reply(message.clone());
        assert_eq!(reply.state_str(), Some(DONE_STATE));
        assert_eq!(reply.value, Some(message));
    }
}
