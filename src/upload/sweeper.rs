//! Background eviction of abandoned upload sessions and of staging files
//! no session refers to any more.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Periodically expires sessions idle for longer than `max_age`.
pub struct ExpirySweeper {
    registry: Arc<SessionRegistry>,
    max_age: Duration,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<SessionRegistry>, max_age: Duration, interval: Duration) -> Self {
        Self {
            registry,
            max_age,
            interval,
        }
    }

    /// Run one pass and return how many sessions and orphaned staging
    /// files were removed.
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let evicted = self.registry.expire_idle(now, self.max_age).await.len();
        let reclaimed = self.registry.reclaim_orphans(now, self.max_age).await;
        if evicted + reclaimed == 0 {
            debug!(remaining = self.registry.len(), "expiry sweep found nothing");
        } else {
            info!(
                evicted,
                reclaimed,
                remaining = self.registry.len(),
                "expiry sweep removed idle uploads"
            );
        }
        evicted + reclaimed
    }

    /// Run forever on the configured interval.  The first pass happens
    /// immediately so sessions left over from a long idle period go at
    /// startup.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                max_age_secs = self.max_age.as_secs(),
                "expiry sweeper started"
            );
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}
