//! Event driven reconciliation loop.
//!
//! Node watch, periodic ticker and failed passes all fire the same
//! [`Trigger`]. The trigger is a single pending slot: any number of fires
//! while a pass is running collapse into one follow-up pass. Exactly one
//! worker consumes the slot, so kernel mutations never overlap.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use std::time::Duration;

use crate::reconcile::Reconcile;

/// Retry delay bounds after failed passes.
const RETRY_MIN_DELAY: Duration = Duration::from_millis(5);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Fires the pending reconciliation slot. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Trigger {
    sender: mpsc::Sender<()>,
}

/// Receiving end of the pending slot, owned by the worker.
#[derive(Debug)]
pub struct Pending {
    receiver: mpsc::Receiver<()>,
}

pub fn pending_slot() -> (Trigger, Pending) {
    let (sender, receiver) = mpsc::channel(1);
    (Trigger { sender }, Pending { receiver })
}

impl Trigger {
    pub fn fire(&self) {
        match self.sender.try_send(()) {
            Ok(()) => (),
            // a pass is already pending
            Err(mpsc::error::TrySendError::Full(())) => (),
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::debug!("reconcile trigger fired after worker stopped");
            }
        }
    }
}

/// Backoff used between failed passes, reset after every success.
pub fn retry_backoff() -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_min_delay(RETRY_MIN_DELAY)
        .with_max_delay(RETRY_MAX_DELAY)
        .with_factor(2.0)
        .without_max_times()
}

pub struct Controller<R> {
    reconciler: R,
    resync_interval: Duration,
    backoff: ExponentialBuilder,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(reconciler: R, resync_interval: Duration) -> Self {
        Self {
            reconciler,
            resync_interval,
            backoff: retry_backoff(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs ticker and worker until `cancel` fires. An in-flight pass is finished first.
    pub async fn run(self, trigger: Trigger, pending: Pending, cancel: CancellationToken) {
        // reconcile once right away
        trigger.fire();
        let ticker = tokio::spawn(tick(trigger, self.resync_interval, cancel.clone()));
        self.work(pending, cancel).await;
        if let Err(error) = ticker.await {
            tracing::warn!(%error, "resync ticker terminated abnormally");
        }
    }

    async fn work(&self, mut pending: Pending, cancel: CancellationToken) {
        let mut backoff = self.backoff.build();
        let mut retry_at: Option<Instant> = None;

        tracing::info!("reconcile worker started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = pending.receiver.recv() => {
                    if msg.is_none() {
                        break;
                    }
                }
                _ = sleep_until(retry_at) => {
                    tracing::debug!("retrying failed reconciliation");
                }
            }
            retry_at = None;

            match self.reconciler.reconcile().await {
                Ok(outcome) if outcome.mutated() => {
                    tracing::info!(rules = outcome.desired_rules, ?outcome, "reconciliation applied changes");
                    backoff = self.backoff.build();
                }
                Ok(outcome) => {
                    tracing::debug!(rules = outcome.desired_rules, "DNAT rules up to date");
                    backoff = self.backoff.build();
                }
                Err(error) => {
                    let delay = next_delay(&mut backoff);
                    tracing::error!(%error, ?delay, "reconciliation failed, retrying");
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }
        tracing::info!("reconcile worker stopped");
    }
}

fn next_delay(backoff: &mut ExponentialBackoff) -> Duration {
    backoff.next().unwrap_or(RETRY_MAX_DELAY)
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Fires `trigger` every `interval` as a safety net against missed events and tampered rules.
async fn tick(trigger: Trigger, interval: Duration, cancel: CancellationToken) {
    let mut interval = time::interval_at(Instant::now() + interval, interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => trigger.fire(),
        }
    }
}
