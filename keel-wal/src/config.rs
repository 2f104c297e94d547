use std::time::Duration;

/// When appended frames are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every frame; `append` returns only once durable.
    Always,
    /// fsync after `entries` unsynced frames or once `interval` has elapsed
    /// since the last fsync, whichever comes first. Intermediate appends
    /// return before they are durable; callers force a barrier with
    /// [`crate::SegmentedLog::flush`].
    Batch { entries: usize, interval: Duration },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Roll threshold: a segment is sealed before an append would push its
    /// file past this size.
    pub segment_max_bytes: u64,
    pub sync: SyncPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 8 * 1024 * 1024, // 8 MiB
            sync: SyncPolicy::Always,
        }
    }
}

impl LogConfig {
    pub fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.segment_max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.sync, SyncPolicy::Always);
    }

    #[test]
    fn test_builders() {
        let config = LogConfig::default()
            .with_segment_max_bytes(1024)
            .with_sync(SyncPolicy::Batch {
                entries: 16,
                interval: Duration::from_millis(50),
            });
        assert_eq!(config.segment_max_bytes, 1024);
        assert!(matches!(config.sync, SyncPolicy::Batch { entries: 16, .. }));
    }
}
