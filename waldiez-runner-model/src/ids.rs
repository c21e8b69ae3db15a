use uuid::Uuid;

/// Generate a task id: 32 lowercase hex chars, time-ordered (UUIDv7), so
/// `ORDER BY id` and `ORDER BY created_at` agree.
pub fn new_task_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Generate an input-request correlation id.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
