//! Scheduler configuration and shared application state.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Tuning knobs for the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timezone used for wall-clock math exposed to handlers.
    pub tz: chrono_tz::Tz,

    /// Capacity of the command channel into the scheduler core.
    pub command_buffer: usize,

    /// Capacity of the completion channel back from execution tasks.
    pub completion_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Tz::UTC,
            command_buffer: 64,
            completion_buffer: 64,
        }
    }
}

/// Shared key-value state visible to lifespan hooks and job handlers.
///
/// Values are JSON so they can flow into handlers running on worker
/// threads without lifetime gymnastics. Cloning is cheap; all clones
/// observe the same map.
#[derive(Debug, Clone, Default)]
pub struct State {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner
            .write()
            .expect("state lock poisoned")
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner
            .write()
            .expect("state lock poisoned")
            .remove(key)
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        self.inner
            .write()
            .expect("state lock poisoned")
            .extend(entries);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("state lock poisoned").is_empty()
    }
}
