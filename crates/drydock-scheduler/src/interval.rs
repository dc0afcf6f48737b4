//! Interval trigger.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drydock_core::trigger::Trigger;
use drydock_core::{BuildCondition, IntegrationRequest, Result};

/// Fires at a fixed interval, measured from the end of the previous
/// integration.
///
/// The trigger keeps firing once its time has come; the queue's duplicate
/// policy coalesces the repeats. `integration_completed` arms the next
/// interval.
pub struct IntervalTrigger {
    interval_ms: i64,
    condition: BuildCondition,
    /// Epoch milliseconds of the next fire time.
    next_fire_ms: AtomicI64,
}

impl IntervalTrigger {
    /// Request source reported by this trigger.
    pub const SOURCE: &'static str = "interval";

    /// An interval trigger that requests modification-checked builds. The
    /// first evaluation fires immediately.
    pub fn new(interval: Duration) -> Self {
        Self::with_condition(interval, BuildCondition::IfModificationExists)
    }

    pub fn with_condition(interval: Duration, condition: BuildCondition) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            condition,
            next_fire_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

#[async_trait]
impl Trigger for IntervalTrigger {
    async fn fire(&self) -> Result<Option<IntegrationRequest>> {
        if Utc::now().timestamp_millis() >= self.next_fire_ms.load(Ordering::SeqCst) {
            Ok(Some(IntegrationRequest::new(
                self.condition,
                Self::SOURCE,
                None,
            )))
        } else {
            Ok(None)
        }
    }

    async fn integration_completed(&self) {
        self.next_fire_ms.store(
            Utc::now().timestamp_millis() + self.interval_ms,
            Ordering::SeqCst,
        );
    }

    fn next_build(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.next_fire_ms.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}
