// src/rabbitmq/tag.rs

use super::errors::{RabbitMQError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Produces the consumer tag announced to the broker for a new consumer.
pub trait ConsumerTagStrategy: Send + Sync + 'static {
    fn create_consumer_tag(&self, queue: &str) -> String;
}

impl<F> ConsumerTagStrategy for F
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    fn create_consumer_tag(&self, queue: &str) -> String {
        (self)(queue)
    }
}

/// `<prefix>-<n>` with `n` counting up from 1.
#[derive(Debug)]
pub struct IncrementingTagStrategy {
    prefix: String,
    next: AtomicU64,
}

impl IncrementingTagStrategy {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }

    /// Prefix plus a short random instance id, for several processes
    /// consuming the same queue.
    pub fn per_instance(prefix: &str) -> Self {
        let instance = Uuid::new_v4().simple().to_string();
        Self::new(&format!("{}-{}", prefix, &instance[..8]))
    }
}

impl ConsumerTagStrategy for IncrementingTagStrategy {
    fn create_consumer_tag(&self, _queue: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, n)
    }
}

/// Tags held by live consumers of one pool.
#[derive(Debug, Default)]
pub struct TagRegistry {
    active: Mutex<HashSet<String>>,
}

impl TagRegistry {
    pub fn claim(&self, tag: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(tag.to_string()) {
            return Err(RabbitMQError::ConsumerTagCollision(tag.to_string()));
        }
        Ok(())
    }

    pub fn release(&self, tag: &str) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(tag);
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
