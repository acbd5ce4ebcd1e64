//! Change coalescing scheduler.
//!
//! Collects rollout and rollout-group keys touched by entity events into two
//! concurrent sets and periodically turns each dirty key into exactly one
//! [`ChangeNotification`]. Any number of touches between two flushes collapse
//! into a single notification.
//!
//! Draining removes keys one at a time before publishing them. A touch that
//! lands after a key was removed re-inserts it and is picked up by the next
//! flush, so no touch is lost across the drain boundary.
//!
//! The bus listener can fall behind by more than the bus capacity. The
//! skipped events are gone and their keys unknown, so the next flush
//! publishes one [`ChangeNotification::ResyncRequired`] instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, NotificationSink};
use crate::error::EventError;
use crate::event::{ChangeNotification, EntityEvent};

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub published: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.published + self.failed
    }
}

pub struct ChangeCoalescer {
    rollouts: DashSet<ChangeNotification>,
    groups: DashSet<ChangeNotification>,
    /// Entity events skipped by a lagging listener since the last flush.
    missed: AtomicU64,
    sink: Arc<dyn NotificationSink>,
}

impl ChangeCoalescer {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            rollouts: DashSet::new(),
            groups: DashSet::new(),
            missed: AtomicU64::new(0),
            sink,
        }
    }

    /// Record that `skipped` entity events were lost before being recorded.
    pub fn record_lag(&self, skipped: u64) {
        warn!(skipped, "change coalescer lagged behind entity events");
        self.missed.fetch_add(skipped, Ordering::SeqCst);
    }

    /// Record that `event` may have changed rollout progress.
    ///
    /// Returns `false` for events that touch no rollout.
    pub fn record_touch(&self, event: &EntityEvent) -> bool {
        let Some((rollout_id, group_id)) = event.touched() else {
            return false;
        };
        let tenant = event.tenant().to_string();
        if let Some(group_id) = group_id {
            self.groups.insert(ChangeNotification::RolloutGroupChanged {
                tenant: tenant.clone(),
                rollout_id,
                group_id,
            });
        }
        self.rollouts
            .insert(ChangeNotification::RolloutChanged { tenant, rollout_id });
        true
    }

    /// Keys waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.rollouts.len() + self.groups.len()
    }

    /// Drain both sets and publish one notification per dirty key, preceded
    /// by a resync notification when events were missed.
    ///
    /// A failed publish is logged and does not stop the remaining keys.
    pub fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let missed = self.missed.swap(0, Ordering::SeqCst);
        if missed > 0 {
            self.publish(ChangeNotification::ResyncRequired { missed }, &mut report);
        }
        for set in [&self.rollouts, &self.groups] {
            let dirty: Vec<ChangeNotification> = set.iter().map(|k| k.key().clone()).collect();
            for key in dirty {
                let Some(key) = set.remove(&key) else {
                    continue;
                };
                self.publish(key, &mut report);
            }
        }
        if report.total() > 0 {
            debug!(
                published = report.published,
                failed = report.failed,
                "change coalescer flushed"
            );
        }
        report
    }

    fn publish(&self, key: ChangeNotification, report: &mut FlushReport) {
        match self.sink.publish(key.clone()) {
            Ok(receivers) => {
                debug!(%key, receivers, "change notification published");
                report.published += 1;
            }
            Err(EventError::NoSubscribers(_)) => {
                debug!(%key, "change notification dropped, no subscribers");
                report.failed += 1;
            }
            Err(e) => {
                warn!(%key, error = %e, "change notification publish failed");
                report.failed += 1;
            }
        }
    }

    /// Run the flush loop until `shutdown` fires, then flush once more so the
    /// final changes are not lost.
    pub async fn run(
        &self,
        initial_delay: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "change coalescer started"
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown.changed() => {
                info!("change coalescer shutting down");
                self.flush();
                return;
            }
        }

        loop {
            self.flush();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("change coalescer shutting down");
                    // Final flush before exit.
                    self.flush();
                    break;
                }
            }
        }
    }

    /// Subscribe to the bus and record every entity event until shutdown.
    /// Events already buffered when shutdown fires are still recorded.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &EventBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = bus.subscribe_entities();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            self.record_touch(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => self.record_lag(skipped),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        self.drain_buffered(&mut events);
                        break;
                    }
                }
            }
            debug!("change coalescer listener stopped");
        })
    }

    fn drain_buffered(&self, events: &mut broadcast::Receiver<EntityEvent>) {
        loop {
            match events.try_recv() {
                Ok(event) => {
                    self.record_touch(&event);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
    }
}
