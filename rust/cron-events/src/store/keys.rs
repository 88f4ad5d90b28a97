//! Redis key layout.

/// Builds every key the Redis backend touches, under an optional namespace.
#[derive(Debug, Clone, Default)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash holding one task record.
    pub fn task(&self, id: &str) -> String {
        format!("{}cron:task:{id}", self.prefix)
    }

    /// Set of all task ids.
    pub fn tasks(&self) -> String {
        format!("{}cron:tasks", self.prefix)
    }

    pub fn stats(&self, task_id: &str) -> String {
        format!("{}cron:stats:{task_id}", self.prefix)
    }

    /// String holding one serialized execution result.
    pub fn history(&self, history_id: &str) -> String {
        format!("{}cron:history:{history_id}", self.prefix)
    }

    /// Sorted set of history ids scored by start time (unix seconds).
    pub fn history_list(&self) -> String {
        format!("{}cron:history_list", self.prefix)
    }

    pub fn delayed(&self, id: &str) -> String {
        format!("{}event:delayed:{id}", self.prefix)
    }

    /// Sorted set of delayed event ids scored by due time (unix seconds).
    pub fn delayed_list(&self) -> String {
        format!("{}event:delayed:list", self.prefix)
    }

    pub fn record(&self, id: &str) -> String {
        format!("{}event:records:{id}", self.prefix)
    }

    /// List of record ids, newest at the head.
    pub fn records_list(&self) -> String {
        format!("{}event:records:list", self.prefix)
    }

    pub fn sequence(&self) -> String {
        format!("{}event:sequence", self.prefix)
    }
}

/// History ids are `<task_id>_<start nanos>` so a task's entries share a prefix.
pub(crate) fn history_id(task_id: &str, start: chrono::DateTime<chrono::Utc>) -> String {
    let nanos = start.timestamp_nanos_opt().unwrap_or_else(|| start.timestamp_micros() * 1000);
    format!("{task_id}_{nanos}")
}

/// Whether `hid` was built by [`history_id`] for `task_id`. A bare prefix
/// check would also claim the history of a task named `<task_id>_x`.
pub(crate) fn is_history_of(hid: &str, task_id: &str) -> bool {
    hid.strip_prefix(task_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|nanos| nanos.parse::<i64>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = Keys::default();
        assert_eq!(keys.task("42"), "cron:task:42");
        assert_eq!(keys.tasks(), "cron:tasks");
        assert_eq!(keys.delayed_list(), "event:delayed:list");
        assert_eq!(keys.records_list(), "event:records:list");
        assert_eq!(keys.sequence(), "event:sequence");
    }

    #[test]
    fn test_prefixed_layout() {
        let keys = Keys::new("tenant-a:");
        assert_eq!(keys.stats("t"), "tenant-a:cron:stats:t");
        assert_eq!(keys.history("t_1"), "tenant-a:cron:history:t_1");
    }

    #[test]
    fn test_history_id_belongs_to_its_task_only() {
        let id = history_id("abc", chrono::Utc::now());
        assert!(is_history_of(&id, "abc"));
        assert!(!is_history_of(&id, "ab"));

        let sibling = history_id("abc_x", chrono::Utc::now());
        assert!(is_history_of(&sibling, "abc_x"));
        assert!(!is_history_of(&sibling, "abc"));
    }
}
