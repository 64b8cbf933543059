use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::ClientFactory;
use crate::config::SimulatorConfig;
use crate::error::{ScheduleError, SimulationError};
use crate::fleet::FleetManager;
use crate::model::{RunId, SimulationRun};
use crate::report::ReportSink;
use crate::scheduler::{RoundProgress, RoundScheduler};

/// Admits at most one running simulation per process.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    running: parking_lot::Mutex<bool>,
}

impl AdmissionGate {
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut running = self.running.lock();
        if *running {
            return None;
        }
        *running = true;
        Some(AdmissionPermit { gate: self.clone() })
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

/// Holds the gate closed until dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        *self.gate.running.lock() = false;
    }
}

/// Run id to run state. All mutation goes through the write lock, so readers
/// see a run either before or after a whole round's update.
#[derive(Debug, Default)]
pub struct SimulationRegistry {
    runs: parking_lot::RwLock<HashMap<RunId, SimulationRun>>,
}

impl SimulationRegistry {
    pub fn insert(&self, run: SimulationRun) {
        self.runs.write().insert(run.id, run);
    }

    pub fn get(&self, id: &RunId) -> Option<SimulationRun> {
        self.runs.read().get(id).cloned()
    }

    /// Returns false for unknown ids.
    pub fn update(&self, id: &RunId, f: impl FnOnce(&mut SimulationRun)) -> bool {
        match self.runs.write().get_mut(id) {
            Some(run) => {
                f(run);
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<SimulationRun> {
        let mut runs: Vec<SimulationRun> = self
            .runs
            .read()
            .values()
            .filter(|r| !r.finished)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

/// Ties the fleet and the scheduler together per simulation run.
pub struct Orchestrator {
    config: Arc<SimulatorConfig>,
    fleet: Arc<FleetManager>,
    scheduler: Arc<RoundScheduler>,
    registry: Arc<SimulationRegistry>,
    gate: Arc<AdmissionGate>,
    reports: Arc<dyn ReportSink>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<SimulatorConfig>,
        fleet: Arc<FleetManager>,
        clients: Arc<dyn ClientFactory>,
        reports: Arc<dyn ReportSink>,
    ) -> Self {
        let scheduler = Arc::new(RoundScheduler::new(clients, config.clone()));
        Self {
            config,
            fleet,
            scheduler,
            registry: Arc::new(SimulationRegistry::default()),
            gate: Arc::new(AdmissionGate::default()),
            reports,
        }
    }

    pub fn fleet(&self) -> &Arc<FleetManager> {
        &self.fleet
    }

    pub fn registry(&self) -> &Arc<SimulationRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    fn validate(&self, nodes: usize, transactions: usize) -> Result<(), SimulationError> {
        let config = &self.config;
        if nodes < config.min_transaction_nodes || nodes > config.max_transaction_nodes {
            return Err(SimulationError::InvalidNodeCount {
                requested: nodes,
                min: config.min_transaction_nodes,
                max: config.max_transaction_nodes,
            });
        }
        if transactions < config.min_transactions || transactions > config.max_transactions {
            return Err(SimulationError::InvalidTransactionCount {
                requested: transactions,
                min: config.min_transactions,
                max: config.max_transactions,
            });
        }
        Ok(())
    }

    /// Validate and admit a run, then continue it in the background.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, nodes: usize, transactions: usize) -> Result<RunId, SimulationError> {
        self.validate(nodes, transactions)?;
        let permit = self.gate.try_acquire().ok_or(SimulationError::Busy)?;

        let id = Uuid::new_v4();
        self.registry.insert(SimulationRun::new(
            id,
            nodes,
            transactions,
            self.config.consensus_node_count,
        ));
        info!(run = %id, nodes, transactions, "simulation admitted");

        let run = RunContext {
            id,
            nodes,
            transactions,
            fleet: self.fleet.clone(),
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
        };
        let reports = self.reports.clone();

        tokio::spawn(async move {
            run.fleet.set_simulation_active(true);
            let registry = run.registry.clone();
            let fleet = run.fleet.clone();

            let outcome = match tokio::spawn(run.execute()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(describe(&e)),
                Err(e) if e.is_panic() => Some(format!(
                    "simulation panicked: {}",
                    panic_message(e.into_panic())
                )),
                Err(e) => Some(format!("simulation aborted: {}", e)),
            };

            fleet.set_simulation_active(false);
            drop(permit);

            if let Some(message) = &outcome {
                error!(run = %id, error = %message, "simulation failed");
            }
            registry.update(&id, |run| {
                run.seal(outcome);
            });

            if let Some(sealed) = registry.get(&id) {
                info!(
                    run = %id,
                    success = sealed.stats.success_count,
                    failure = sealed.stats.failure_count,
                    total_time_ms = sealed.total_time_ms,
                    "simulation sealed"
                );
                tokio::spawn(async move {
                    if let Err(e) = reports.write(&sealed).await {
                        warn!(run = %sealed.id, error = %e, "report generation failed");
                    }
                });
            }
        });

        Ok(id)
    }

    pub fn status(&self, id: &RunId) -> Result<SimulationRun, SimulationError> {
        self.registry
            .get(id)
            .ok_or(SimulationError::NotFound(*id))
    }

    pub fn active_runs(&self) -> Vec<SimulationRun> {
        self.registry.active()
    }

    /// Poll until the run is sealed.
    pub async fn wait_for(
        &self,
        id: &RunId,
        poll: Duration,
    ) -> Result<SimulationRun, SimulationError> {
        loop {
            let run = self.status(id)?;
            if run.finished {
                return Ok(run);
            }
            sleep(poll).await;
        }
    }
}

struct RunContext {
    id: RunId,
    nodes: usize,
    transactions: usize,
    fleet: Arc<FleetManager>,
    scheduler: Arc<RoundScheduler>,
    registry: Arc<SimulationRegistry>,
}

impl RunContext {
    async fn execute(self) -> Result<(), SimulationError> {
        let id = self.id;
        self.registry.update(&id, SimulationRun::mark_running);

        self.fleet.ensure_fleet(self.nodes, false).await?;

        let reservation = self.fleet.reserve_transaction_nodes(self.nodes).await;
        if reservation.len() < 2 {
            return Err(ScheduleError::InsufficientNodes(reservation.len()).into());
        }
        if reservation.len() < self.nodes {
            warn!(run = %id, requested = self.nodes, usable = reservation.len(), "running with fewer usable nodes than requested");
        }
        let snapshot = reservation.nodes().to_vec();
        self.registry.update(&id, |run| run.nodes = snapshot);

        self.fleet.rebroadcast_identities().await;

        let registry = &self.registry;
        let records = self
            .scheduler
            .execute(reservation.nodes(), self.transactions, |progress: &RoundProgress| {
                registry.update(&id, |run| run.record_progress(progress.transactions.clone()));
            })
            .await?;
        drop(reservation);

        if records.is_empty() {
            return Err(ScheduleError::NothingExecuted.into());
        }
        self.registry.update(&id, |run| run.record_progress(records));
        Ok(())
    }
}

fn describe(error: &SimulationError) -> String {
    match error {
        SimulationError::Fleet(e) => format!("failed to start nodes: {}", e),
        other => other.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_at_a_time() {
        let gate = Arc::new(AdmissionGate::default());
        let permit = gate.try_acquire().unwrap();
        assert!(gate.is_running());
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(!gate.is_running());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn registry_updates_known_runs_only() {
        let registry = SimulationRegistry::default();
        let run = SimulationRun::new(Uuid::new_v4(), 2, 3, 7);
        let id = run.id;
        registry.insert(run);

        assert!(registry.update(&id, SimulationRun::mark_running));
        assert!(!registry.update(&Uuid::new_v4(), SimulationRun::mark_running));
        assert_eq!(registry.active().len(), 1);

        registry.update(&id, |run| {
            run.seal(None);
        });
        assert!(registry.active().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn panic_payloads_render() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
