//! # rf-broker-local Implementation
//!
//! An in-process [`MessageBroker`] over a bounded tokio channel.
//!
//! Publishing never waits: a full channel rejects the message with `QueueSaturated`.
//! Deliveries stay in flight until acked; a nack puts the message back at the head of the
//! line with its attempt count bumped, which gives at-least-once delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rf_core::{Delivery, FeedError, MessageBroker, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

pub struct LocalBroker {
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<Delivery>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    next_offset: AtomicU64,
    in_flight: DashMap<u64, Delivery>,
    redeliver: Mutex<VecDeque<Delivery>>,
    requeued: Notify,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            next_offset: AtomicU64::new(1),
            in_flight: DashMap::new(),
            redeliver: Mutex::new(VecDeque::new()),
            requeued: Notify::new(),
        }
    }

    /// Stops accepting messages. Consumers drain what is queued, then see `None`.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            info!("local broker closed");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Delivered but neither acked nor nacked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn track(&self, delivery: Delivery) -> Delivery {
        self.in_flight.insert(delivery.offset, delivery.clone());
        delivery
    }

    fn pop_redelivery(&self) -> Option<Delivery> {
        let next = self.redeliver.lock().pop_front();
        next.map(|d| self.track(d))
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    fn try_publish(&self, key: &str, payload: Bytes) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(FeedError::StoreUnavailable("broker closed".into()));
        };
        let delivery = Delivery {
            offset: self.next_offset.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            payload,
            attempt: 1,
        };
        match tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(d)) => Err(FeedError::QueueSaturated(format!(
                "queue of {} full, dropped {}",
                self.capacity, d.key
            ))),
            Err(TrySendError::Closed(_)) => Err(FeedError::StoreUnavailable("broker closed".into())),
        }
    }

    async fn poll(&self) -> Result<Option<Delivery>> {
        loop {
            let requeued = self.requeued.notified();
            if let Some(d) = self.pop_redelivery() {
                return Ok(Some(d));
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                msg = rx.recv() => {
                    return Ok(match msg {
                        Some(d) => Some(self.track(d)),
                        None => self.pop_redelivery(),
                    });
                }
                _ = requeued => continue,
            }
        }
    }

    async fn ack(&self, offset: u64) -> Result<()> {
        if self.in_flight.remove(&offset).is_none() {
            debug!(offset, "ack for unknown offset ignored");
        }
        Ok(())
    }

    async fn nack(&self, offset: u64) -> Result<()> {
        let Some((_, mut delivery)) = self.in_flight.remove(&offset) else {
            return Err(FeedError::not_found("delivery", offset));
        };
        delivery.attempt += 1;
        debug!(offset, attempt = delivery.attempt, "requeued");
        self.redeliver.lock().push_front(delivery);
        self.requeued.notify_one();
        Ok(())
    }
}
