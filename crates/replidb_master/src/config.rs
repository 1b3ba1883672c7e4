//! Master configuration.

/// Configuration for the reference master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Maximum batch size for pull responses.
    pub max_pull_batch: u32,
    /// Maximum rows accepted in one push request.
    pub max_push_batch: u32,
    /// Capacity of the change notification channel.
    pub event_capacity: usize,
}

impl MasterConfig {
    /// Creates a new master configuration.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 100,
            event_capacity: 256,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size.max(1);
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size.max(1);
        self
    }

    /// Sets the change notification channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::new()
    }
}
