pub const PREFIX: &str = "notifyq";
pub const QUEUES_KEY: &str = "notifyq:queues";

/// Completed job hashes are kept this long for inspection.
pub const COMPLETED_JOB_TTL_SECS: i64 = 86_400;

pub const GLOBAL_COUNTER_KEY: &str = "global:per_second";
pub const PERSONAL_COUNTER_PREFIX: &str = "personal";

pub const MESSAGE_GROUP_QUEUE: &str = "message-group";
pub const TASKS_QUEUE: &str = "tasks";

pub const MEMBER_COUNT_COLLECTION: &str = "member_count";
