//! Bounded queue between the request path and the event store.
//!
//! The orchestrator must never wait on disk, so security events, API
//! access rows, and decision audit entries are posted here and drained by
//! a dedicated worker. Back-pressure policy is drop-oldest: the newest
//! observation wins and every drop is counted and exposed via health.

use crate::models::{AuditEntry, SecurityEvent};
use crate::security::event_store::EventStore;
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One deferred write.
#[derive(Debug, Clone)]
pub enum StoreJob {
    Event(SecurityEvent),
    Access {
        source: String,
        endpoint: String,
        method: String,
        status: u16,
        latency_ms: f64,
        now: DateTime<Utc>,
    },
    Audit(AuditEntry),
}

pub struct EventQueue {
    queue: ArrayQueue<StoreJob>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(16)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a write without blocking. When the ring is full the oldest
    /// job is discarded and counted.
    pub fn push(&self, job: StoreJob) {
        if let Some(_evicted) = self.queue.force_push(job) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("fraudgate_events_dropped_total");
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drain_into(&self, store: &EventStore) -> usize {
        let mut written = 0usize;
        while let Some(job) = self.queue.pop() {
            let result = match job {
                StoreJob::Event(event) => store.store_event(&event),
                StoreJob::Access {
                    source,
                    endpoint,
                    method,
                    status,
                    latency_ms,
                    now,
                } => store.record_api_access(&source, &endpoint, &method, status, latency_ms, now),
                StoreJob::Audit(entry) => store.record_audit(&entry),
            };
            // Store errors never propagate to the request path; the
            // observation is lost and logged.
            if let Err(e) = result {
                warn!(error = %e, "event store write failed, observation dropped");
            } else {
                written += 1;
            }
        }
        written
    }

    /// Spawn the drain worker. Runs until the process exits.
    pub fn spawn_drain(self: &Arc<Self>, store: Arc<EventStore>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(25));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let written = queue.drain_into(&store);
                if written > 0 {
                    debug!(written, depth = queue.depth(), "event queue drained");
                }
            }
        })
    }

    /// Synchronous drain for shutdown paths and tests.
    pub fn flush(&self, store: &EventStore) -> usize {
        self.drain_into(store)
    }
}
