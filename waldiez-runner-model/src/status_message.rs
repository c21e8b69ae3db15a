use serde_json::Value;

use crate::task::TaskResults;
use crate::task_status::TaskStatus;

/// A message seen on a task's status channel, one variant per lifecycle
/// transition a child may announce.
///
/// Publishers are not all equally careful: payloads arrive plain, double
/// JSON-encoded, or wrapped in a `{"data": …}` envelope. [`StatusMessage::decode`]
/// canonicalizes all of those shapes before matching on `status`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusMessage {
    Running,
    WaitingForInput {
        request_id: Option<String>,
    },
    Completed {
        results: Option<TaskResults>,
    },
    Failed {
        error: Option<Value>,
    },
    Cancelled {
        error: Option<String>,
    },
}

impl StatusMessage {
    pub fn status(&self) -> TaskStatus {
        match self {
            StatusMessage::Running => TaskStatus::Running,
            StatusMessage::WaitingForInput { .. } => {
                TaskStatus::WaitingForInput
            }
            StatusMessage::Completed { .. } => TaskStatus::Completed,
            StatusMessage::Failed { .. } => TaskStatus::Failed,
            StatusMessage::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether the watcher must signal the child on seeing this message.
    pub fn should_terminate(&self) -> bool {
        matches!(self, StatusMessage::Cancelled { .. })
    }

    /// The repository `results` write this message implies, if any.
    pub fn results(&self) -> Option<TaskResults> {
        match self {
            StatusMessage::Running | StatusMessage::WaitingForInput { .. } => {
                None
            }
            StatusMessage::Completed { results } => results.clone(),
            StatusMessage::Failed { error } => error.as_ref().map(|value| {
                TaskResults::error(value_to_message(value))
            }),
            StatusMessage::Cancelled { error } => {
                error.as_ref().map(|msg| TaskResults::error(msg.clone()))
            }
        }
    }

    /// Decode a raw channel payload. Returns `None` for malformed input and
    /// for unknown statuses, which subscribers ignore.
    pub fn decode(raw: &str) -> Option<StatusMessage> {
        let message = canonicalize(raw)?;
        let status = message.get("status")?.as_str()?;
        let status: TaskStatus = status.parse().ok()?;
        let data = message.get("data");
        Some(match status {
            // PENDING never travels over the channel; treat it as noise.
            TaskStatus::Pending => return None,
            TaskStatus::Running => StatusMessage::Running,
            TaskStatus::WaitingForInput => StatusMessage::WaitingForInput {
                request_id: data
                    .and_then(|d| d.get("request_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            TaskStatus::Completed => StatusMessage::Completed {
                results: data.cloned().and_then(TaskResults::from_value),
            },
            TaskStatus::Failed => StatusMessage::Failed {
                error: data.cloned(),
            },
            TaskStatus::Cancelled => StatusMessage::Cancelled {
                // data may be {"data": "<reason>"}, {"detail": …}, or a
                // bare string.
                error: data.and_then(|d| match d {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Object(map) => map
                        .get("data")
                        .or_else(|| map.get("detail"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    _ => None,
                }),
            },
        })
    }
}

/// Peel double-encoding and `{"data": …}` envelopes down to the object that
/// carries `status`.
fn canonicalize(raw: &str) -> Option<Value> {
    let mut message: Value = serde_json::from_str(raw).ok()?;
    if let Value::String(inner) = &message {
        message = serde_json::from_str(inner).ok()?;
    }
    let object = message.as_object()?;
    if object.contains_key("data") && !object.contains_key("status") {
        let mut inner = object.get("data")?.clone();
        if let Value::String(nested) = &inner {
            inner = serde_json::from_str(nested).ok()?;
        }
        if !inner.is_object() {
            return None;
        }
        return Some(inner);
    }
    Some(message)
}

fn value_to_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_plain_running() {
        let raw = json!({"task_id": "t1", "status": "RUNNING"}).to_string();
        assert_eq!(StatusMessage::decode(&raw), Some(StatusMessage::Running));
    }

    #[test]
    fn decodes_double_encoded_payloads() {
        let inner = json!({"status": "COMPLETED", "data": {"ok": true}});
        let raw = serde_json::to_string(&inner.to_string()).unwrap();
        let message = StatusMessage::decode(&raw).unwrap();
        assert_eq!(message.status(), TaskStatus::Completed);
        assert!(message.results().is_some());
    }

    #[test]
    fn unwraps_data_envelopes() {
        let envelope = json!({
            "data": {"status": "FAILED", "data": "boom"}
        })
        .to_string();
        let message = StatusMessage::decode(&envelope).unwrap();
        assert_eq!(message.status(), TaskStatus::Failed);
        let results = message.results().unwrap();
        assert!(results.has_error());
    }

    #[test]
    fn unwraps_string_data_envelopes() {
        let inner = json!({"status": "RUNNING"}).to_string();
        let envelope = json!({"data": inner}).to_string();
        assert_eq!(
            StatusMessage::decode(&envelope),
            Some(StatusMessage::Running)
        );
    }

    #[test]
    fn waiting_for_input_extracts_request_id() {
        let raw = json!({
            "status": "WAITING_FOR_INPUT",
            "data": {"request_id": "r-1", "prompt": "name?"}
        })
        .to_string();
        let message = StatusMessage::decode(&raw).unwrap();
        assert_eq!(
            message,
            StatusMessage::WaitingForInput {
                request_id: Some("r-1".to_string())
            }
        );
        assert!(!message.should_terminate());
    }

    #[test]
    fn cancelled_extracts_reason_and_terminates() {
        let raw = json!({
            "task_id": "t1",
            "status": "CANCELLED",
            "data": {"data": "stop requested"}
        })
        .to_string();
        let message = StatusMessage::decode(&raw).unwrap();
        assert!(message.should_terminate());
        assert_eq!(
            message.results(),
            Some(TaskResults::error("stop requested"))
        );

        let bare = json!({"status": "CANCELLED", "data": "stop"}).to_string();
        let message = StatusMessage::decode(&bare).unwrap();
        assert_eq!(message.results(), Some(TaskResults::error("stop")));

        let empty = json!({"status": "CANCELLED"}).to_string();
        let message = StatusMessage::decode(&empty).unwrap();
        assert_eq!(message.results(), None);
    }

    #[test]
    fn rejects_garbage_and_unknown_statuses() {
        assert_eq!(StatusMessage::decode("not json"), None);
        assert_eq!(StatusMessage::decode("42"), None);
        let raw = json!({"status": "EXPLODED"}).to_string();
        assert_eq!(StatusMessage::decode(&raw), None);
        let raw = json!({"data": "still not json"}).to_string();
        assert_eq!(StatusMessage::decode(&raw), None);
    }

    #[test]
    fn decode_is_idempotent_on_replay() {
        let raw = json!({"status": "FAILED", "data": "err"}).to_string();
        let first = StatusMessage::decode(&raw).unwrap();
        let second = StatusMessage::decode(&raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.results(), second.results());
    }

    proptest::proptest! {
        #[test]
        fn decode_never_panics(raw in ".*") {
            let _ = StatusMessage::decode(&raw);
        }

        #[test]
        fn decoded_messages_expose_consistent_predicates(
            status in proptest::sample::select(vec![
                "RUNNING", "WAITING_FOR_INPUT", "COMPLETED", "FAILED",
                "CANCELLED",
            ]),
        ) {
            let raw = json!({"status": status}).to_string();
            let message = StatusMessage::decode(&raw).unwrap();
            proptest::prop_assert_eq!(
                message.is_terminal(),
                message.status().is_terminal()
            );
            // Only CANCELLED asks for the child to be signalled.
            proptest::prop_assert_eq!(
                message.should_terminate(),
                status == "CANCELLED"
            );
        }
    }
}
