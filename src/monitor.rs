use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::fleet::FleetManager;
use crate::model::NodeStatus;

/// What one monitoring pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub skipped: bool,
    pub failed: usize,
    pub recovered: usize,
    pub topped_up: usize,
}

/// Periodic health check: recover failed nodes and refill low balances.
/// Stays idle while a simulation is running.
pub struct FleetMonitor {
    fleet: Arc<FleetManager>,
    config: MonitorConfig,
    shutdown: mpsc::Receiver<()>,
}

impl FleetMonitor {
    pub fn new(fleet: Arc<FleetManager>, shutdown: mpsc::Receiver<()>) -> Self {
        let config = fleet.config().monitor.clone();
        Self {
            fleet,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.fleet.config().monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.recv() => {
                    info!("fleet monitor stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        if self.fleet.is_simulation_active() {
            debug!("simulation active, skipping fleet check");
            return TickOutcome {
                skipped: true,
                ..TickOutcome::default()
            };
        }

        let mut outcome = TickOutcome::default();
        let statuses = self.fleet.check_all_status().await;
        for (id, status) in statuses {
            if status != NodeStatus::Failed {
                continue;
            }
            outcome.failed += 1;
            match self.fleet.recover_node(&id).await {
                Ok(()) => outcome.recovered += 1,
                Err(e) => warn!(node = %id, error = %e, "automatic recovery failed"),
            }
        }

        outcome.topped_up = self
            .fleet
            .top_up_balances(self.config.min_balance, self.config.refill_units)
            .await;

        if outcome.failed > 0 || outcome.topped_up > 0 {
            info!(
                failed = outcome.failed,
                recovered = outcome.recovered,
                topped_up = outcome.topped_up,
                "fleet check complete"
            );
        }
        outcome
    }
}
