use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::new_task_id;
use crate::task_status::TaskStatus;

/// How a task run is triggered. Only `None`/immediate execution is
/// implemented; the other variants validate and round-trip so the API shape
/// is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Once,
    Cron,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Once => "once",
            ScheduleType::Cron => "cron",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleType::Once),
            "cron" => Ok(ScheduleType::Cron),
            _ => Err(()),
        }
    }
}

/// Task output: a single mapping (commonly `{"error": …}` on failure) or an
/// ordered sequence of mappings. Stored as JSON, never a pointer graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResults {
    One(Map<String, Value>),
    Many(Vec<Map<String, Value>>),
}

impl TaskResults {
    pub fn error(message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(message.into()));
        TaskResults::One(map)
    }

    /// Whether the payload carries an `error` key (used by the stuck-task
    /// reconciler).
    pub fn has_error(&self) -> bool {
        match self {
            TaskResults::One(map) => map.contains_key("error"),
            TaskResults::Many(items) => {
                items.iter().any(|map| map.contains_key("error"))
            }
        }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

/// The central entity: one user-submitted workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub client_id: String,
    /// Deterministic fingerprint used for duplicate detection; admission may
    /// append a random nonce when `force` is set.
    pub flow_id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub input_timeout: u32,
    /// Set exactly while status is `WaitingForInput`.
    pub input_request_id: Option<String>,
    pub results: Option<TaskResults>,
    pub schedule_type: Option<ScheduleType>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub const DEFAULT_INPUT_TIMEOUT: u32 = 180;

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted() && self.status.is_active()
    }

    pub fn is_inactive(&self) -> bool {
        !self.is_active()
    }

    /// Active status but results already recorded: the watcher or runner
    /// died between the result write and the status write.
    pub fn is_stuck(&self) -> bool {
        self.is_active() && self.results.is_some()
    }
}

/// Validated creation payload, produced by admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    pub client_id: String,
    pub flow_id: String,
    pub filename: String,
    #[serde(default = "default_input_timeout")]
    pub input_timeout: u32,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_input_timeout() -> u32 {
    Task::DEFAULT_INPUT_TIMEOUT
}

impl TaskCreate {
    /// Cross-field schedule validation. Executing schedules is not
    /// implemented, but the fields must still be coherent.
    pub fn validate_schedule(&self) -> Result<(), String> {
        match self.schedule_type {
            Some(ScheduleType::Once) => {
                if self.scheduled_time.is_none() {
                    return Err(
                        "scheduled_time is required for 'once' schedule"
                            .to_string(),
                    );
                }
                if self.expires_at.is_some() {
                    return Err(
                        "expires_at is not allowed for 'once' schedule"
                            .to_string(),
                    );
                }
            }
            Some(ScheduleType::Cron) => {
                if self.cron_expression.is_none() {
                    return Err(
                        "cron_expression is required for 'cron' schedule"
                            .to_string(),
                    );
                }
            }
            None => {}
        }
        if self.schedule_type != Some(ScheduleType::Cron)
            && self.cron_expression.is_some()
        {
            return Err(
                "cron_expression is not allowed unless schedule_type is 'cron'"
                    .to_string(),
            );
        }
        if self.schedule_type != Some(ScheduleType::Once)
            && self.scheduled_time.is_some()
        {
            return Err(
                "scheduled_time is not allowed unless schedule_type is 'once'"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Build the initial row: fresh id, `Pending`, bookkeeping stamped now.
    pub fn into_task(self) -> Task {
        let now = Utc::now();
        Task {
            id: new_task_id(),
            client_id: self.client_id,
            flow_id: self.flow_id,
            filename: self.filename,
            status: TaskStatus::Pending,
            input_timeout: self.input_timeout,
            input_request_id: None,
            results: None,
            schedule_type: self.schedule_type,
            scheduled_time: self.scheduled_time,
            cron_expression: self.cron_expression,
            expires_at: self.expires_at,
            triggered_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Mutable fields exposed through `PATCH /tasks/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub results: Option<TaskResults>,
    #[serde(default)]
    pub input_timeout: Option<u32>,
}

/// API representation of a task. Timestamps serialize as RFC3339 with
/// millisecond precision and a `Z` suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: String,
    pub client_id: String,
    pub flow_id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub input_timeout: u32,
    pub input_request_id: Option<String>,
    pub results: Option<TaskResults>,
    pub schedule_type: Option<ScheduleType>,
    #[serde(with = "rfc3339_millis::option")]
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    #[serde(with = "rfc3339_millis::option")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "rfc3339_millis::option")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(with = "rfc3339_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_millis")]
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            client_id: task.client_id,
            flow_id: task.flow_id,
            filename: task.filename,
            status: task.status,
            input_timeout: task.input_timeout,
            input_request_id: task.input_request_id,
            results: task.results,
            schedule_type: task.schedule_type,
            scheduled_time: task.scheduled_time,
            cron_expression: task.cron_expression,
            expires_at: task.expires_at,
            triggered_at: task.triggered_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// Client answer to an input request, over HTTP or the WebSocket bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputResponse {
    pub request_id: String,
    pub data: String,
}

/// RFC3339 serialization with millisecond precision and a trailing `Z`.
pub mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer
            .serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| Some(dt.with_timezone(&Utc)))
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
