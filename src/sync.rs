//! Fleet ban synchronization.
//!
//! Two paths converge on the same foreign-ban application: notices drained
//! from the broadcast channel (fast, lossy) and a periodic scan of the shared
//! store for bans this node has not applied yet (slow, complete). Both go
//! through [`BanEngine::apply_foreign`], which is a no-op for bans already
//! applied here, so ordering between the paths does not matter.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::engine::BanEngine;
use crate::signal::ShutdownToken;
use crate::store::BanChannel;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Capped exponential delay after consecutive failures
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct SyncEngine {
    engine: Arc<BanEngine>,
    channel: Option<Arc<dyn BanChannel>>,
    reconcile_interval: Duration,
    poll_interval: Duration,
}

impl SyncEngine {
    pub fn new(engine: Arc<BanEngine>, channel: Option<Arc<dyn BanChannel>>, config: &SyncConfig) -> Self {
        Self {
            engine,
            channel,
            reconcile_interval: Duration::from_secs(config.interval_seconds.max(1)),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }

    /// Apply every queued notice from other nodes. Returns how many bans
    /// were newly applied here.
    pub fn drain_notices(&self) -> Result<usize> {
        let Some(channel) = &self.channel else {
            return Ok(0);
        };

        let mut applied = 0;
        for notice in channel.drain() {
            if notice.origin_node == self.engine.node_name() {
                continue;
            }
            if self.engine.apply_foreign(notice.address, &notice.origin_node)? {
                debug!("Applied ban of {} announced by {}", notice.address, notice.origin_node);
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply every stored ban this node has not applied yet.
    pub fn reconcile(&self) -> Result<usize> {
        let pending = self.engine.store().scan()?;
        let mut applied = 0;
        for record in pending {
            if self.engine.apply_foreign(record.address, &record.origin_node)? {
                applied += 1;
            }
        }
        if applied > 0 {
            info!("Reconciliation applied {} ban(s) from other nodes", applied);
        }
        Ok(applied)
    }

    fn cycle(&self, reconcile: bool) -> Result<()> {
        self.drain_notices()?;
        if reconcile {
            self.reconcile()?;
        }
        Ok(())
    }

    /// Drain every poll interval, reconcile at startup and every reconcile
    /// interval, until shutdown. Failures back off and skip the cycle.
    pub async fn run(self: Arc<Self>, token: ShutdownToken) {
        let mut backoff = Backoff::new(Duration::from_secs(1), MAX_BACKOFF);
        let mut next_reconcile = Instant::now();

        info!(
            "Sync started as '{}' (reconcile every {}s)",
            self.engine.node_name(),
            self.reconcile_interval.as_secs()
        );

        while !token.is_cancelled() {
            let reconcile = Instant::now() >= next_reconcile;
            let this = Arc::clone(&self);
            let result = tokio::task::spawn_blocking(move || this.cycle(reconcile)).await;

            let delay = match result {
                Ok(Ok(())) => {
                    if reconcile {
                        next_reconcile = Instant::now() + self.reconcile_interval;
                    }
                    backoff.reset();
                    self.poll_interval
                }
                Ok(Err(e)) => {
                    let delay = backoff.next();
                    warn!("Sync cycle failed: {:#}, retrying in {}s", e, delay.as_secs());
                    delay
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!("Sync task failed: {}", e);
                    delay
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Sync stopped");
    }
}
