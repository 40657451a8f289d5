// src/rabbitmq/tracker.rs
// Book-keeping for deliveries between receipt and acknowledgment:
// per-channel in-flight limits, exactly-once resolution and redelivery counts.

use super::errors::{RabbitMQError, Result};
use crate::message::{AckDecision, Delivery, Disposition};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};
use uuid::Uuid;

/// A reserved in-flight slot on one channel, released when the delivery
/// holding it is resolved or its channel is cleared.
#[derive(Debug)]
pub struct InFlightPermit {
    channel: u64,
    _permit: OwnedSemaphorePermit,
}

impl InFlightPermit {
    pub fn channel(&self) -> u64 {
        self.channel
    }
}

struct Pending {
    ledger_key: String,
    redelivery_count: u32,
    _permit: InFlightPermit,
}

struct ChannelLedger {
    slots: Arc<Semaphore>,
    pending: HashMap<u64, Pending>,
}

/// Requeue counts keyed by [`ledger_key`], oldest evicted first.
struct RedeliveryLedger {
    capacity: usize,
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
}

impl RedeliveryLedger {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            counts: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, id: &str) -> u32 {
        self.counts.get(id).copied().unwrap_or(0)
    }

    fn record(&mut self, id: &str, at_least: u32) -> u32 {
        if let Some(count) = self.counts.get_mut(id) {
            *count = (*count).max(at_least) + 1;
            return *count;
        }
        if self.capacity == 0 {
            return at_least + 1;
        }
        while self.counts.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    trace!(ledger_key = %oldest, "Evicting redelivery ledger entry");
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        self.counts.insert(id.to_string(), at_least + 1);
        self.order.push_back(id.to_string());
        at_least + 1
    }

    fn forget(&mut self, id: &str) {
        if self.counts.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}

/// Identity a delivery is counted under across redeliveries.
///
/// The message id when the publisher set one, otherwise a name-based uuid of
/// the queue, exchange, routing key and payload. Identical anonymous
/// messages in flight at the same time share one count.
pub fn ledger_key(delivery: &Delivery) -> String {
    match &delivery.message_id {
        Some(id) => id.clone(),
        None => {
            let mut name = Vec::with_capacity(delivery.payload.len() + 64);
            for part in [
                delivery.queue.as_bytes(),
                delivery.exchange.as_bytes(),
                delivery.routing_key.as_bytes(),
            ] {
                name.extend_from_slice(part);
                name.push(0);
            }
            name.extend_from_slice(&delivery.payload);
            format!("anon:{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, &name))
        }
    }
}

pub struct AckTracker {
    max_in_flight: usize,
    redelivery_limit: u32,
    channels: Mutex<HashMap<u64, ChannelLedger>>,
    ledger: Mutex<RedeliveryLedger>,
}

impl AckTracker {
    pub fn new(max_in_flight: usize, redelivery_limit: u32, ledger_capacity: usize) -> Self {
        Self {
            max_in_flight,
            redelivery_limit,
            channels: Mutex::new(HashMap::new()),
            ledger: Mutex::new(RedeliveryLedger::new(ledger_capacity)),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u64, ChannelLedger>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, RedeliveryLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn redelivery_limit(&self) -> u32 {
        self.redelivery_limit
    }

    fn slots(&self, channel: u64) -> Arc<Semaphore> {
        let mut channels = self.channels();
        let ledger = channels.entry(channel).or_insert_with(|| ChannelLedger {
            slots: Arc::new(Semaphore::new(self.max_in_flight)),
            pending: HashMap::new(),
        });
        Arc::clone(&ledger.slots)
    }

    /// Wait for an in-flight slot on `channel`.
    ///
    /// Fails with `ChannelError` if the channel is cleared while waiting.
    pub async fn reserve(&self, channel: u64) -> Result<InFlightPermit> {
        let permit = self
            .slots(channel)
            .acquire_owned()
            .await
            .map_err(|_| RabbitMQError::ChannelError(format!("Channel {} was cleared", channel)))?;
        Ok(InFlightPermit {
            channel,
            _permit: permit,
        })
    }

    /// Register a received delivery against a slot reserved on its channel.
    pub fn track(&self, delivery: &Delivery, permit: InFlightPermit) -> Result<()> {
        if permit.channel != delivery.channel {
            return Err(RabbitMQError::ChannelError(format!(
                "Permit for channel {} used for a delivery on channel {}",
                permit.channel, delivery.channel
            )));
        }
        let mut channels = self.channels();
        let ledger = channels.get_mut(&delivery.channel).ok_or_else(|| {
            RabbitMQError::ChannelError(format!("Channel {} was cleared", delivery.channel))
        })?;
        if ledger.pending.contains_key(&delivery.delivery_tag) {
            return Err(RabbitMQError::AckError(format!(
                "Delivery tag {} is already tracked on channel {}",
                delivery.delivery_tag, delivery.channel
            )));
        }
        ledger.pending.insert(
            delivery.delivery_tag,
            Pending {
                ledger_key: ledger_key(delivery),
                redelivery_count: delivery.redelivery_count,
                _permit: permit,
            },
        );
        trace!(channel = delivery.channel, delivery_tag = delivery.delivery_tag, "Tracking delivery");
        Ok(())
    }

    /// Effective number of earlier attempts for `delivery`: the highest of
    /// the broker's count, the ledger and the redelivered flag.
    pub fn redelivery_count(&self, delivery: &Delivery) -> u32 {
        let broker = delivery.broker_delivery_count.unwrap_or(0);
        let local = self.ledger().get(&ledger_key(delivery));
        broker.max(local).max(u32::from(delivery.redelivered))
    }

    /// Settle a tracked delivery. Each tag resolves exactly once.
    pub fn resolve(
        &self,
        channel: u64,
        delivery_tag: u64,
        decision: AckDecision,
    ) -> Result<Disposition> {
        let pending = {
            let mut channels = self.channels();
            channels
                .get_mut(&channel)
                .and_then(|ledger| ledger.pending.remove(&delivery_tag))
                .ok_or(RabbitMQError::UnknownDeliveryTag {
                    channel,
                    delivery_tag,
                })?
        };

        let disposition = match decision {
            AckDecision::Ack => Disposition::Acked,
            AckDecision::NackRequeue => Disposition::Requeued,
            AckDecision::NackDiscard => Disposition::Discarded,
        };
        let mut ledger = self.ledger();
        match decision {
            AckDecision::NackRequeue => {
                let count = ledger.record(&pending.ledger_key, pending.redelivery_count);
                trace!(ledger_key = %pending.ledger_key, count, "Requeue recorded");
            }
            AckDecision::Ack | AckDecision::NackDiscard => ledger.forget(&pending.ledger_key),
        }
        Ok(disposition)
    }

    /// Tags still waiting for a decision on `channel`.
    pub fn pending_tags(&self, channel: u64) -> Vec<u64> {
        let mut tags: Vec<u64> = self
            .channels()
            .get(&channel)
            .map(|ledger| ledger.pending.keys().copied().collect())
            .unwrap_or_default();
        tags.sort_unstable();
        tags
    }

    /// Drop every pending delivery of a lost or closed channel.
    ///
    /// The broker requeues them on its own; returns how many were pending.
    pub fn clear_channel(&self, channel: u64) -> usize {
        let removed = self.channels().remove(&channel);
        match removed {
            Some(ledger) => {
                ledger.slots.close();
                let count = ledger.pending.len();
                if count > 0 {
                    debug!(channel, count, "Cleared pending deliveries");
                }
                count
            }
            None => 0,
        }
    }

    pub fn outstanding(&self, channel: u64) -> usize {
        self.channels()
            .get(&channel)
            .map_or(0, |ledger| ledger.pending.len())
    }

    pub fn total_outstanding(&self) -> usize {
        self.channels().values().map(|l| l.pending.len()).sum()
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger().len()
    }
}
