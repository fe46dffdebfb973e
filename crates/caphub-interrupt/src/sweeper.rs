//! Expiry sweeper: scans pending interrupts at a fixed cadence and expires
//! those past their deadline. The owning run observes the expiry on its
//! resume channel.

use std::sync::Arc;
use std::time::Duration;

use caphub_contract::time::current_unix_millis;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::InterruptService;

pub struct InterruptSweeper {
    service: Arc<InterruptService>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl InterruptSweeper {
    pub fn new(
        service: Arc<InterruptService>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            interval,
            shutdown,
        }
    }

    /// Spawn the sweep loop; exits when the shutdown token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        debug!("interrupt sweeper stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let due = self.service.due_for_expiry(current_unix_millis()).await;
                for interrupt_id in due {
                    match self.service.expire(&interrupt_id).await {
                        Ok(_) => debug!(interrupt_id = %interrupt_id, "interrupt expired"),
                        // Lost the race with a resolve; nothing to do.
                        Err(err) => warn!(interrupt_id = %interrupt_id, error = %err, "expiry skipped"),
                    }
                }
            }
        })
    }
}
