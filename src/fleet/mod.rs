//! Fleet lifecycle: phased bootstrap, rescaling, restarts and recovery of
//! the externally-owned node processes.

pub mod launcher;
pub mod metadata;
pub mod plan;

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::client::{ClientFactory, NodeApi};
use crate::config::SimulatorConfig;
use crate::error::{FleetError, NodeClientError};
use crate::model::{short, NodeProcess, NodeRole, NodeStatus};

pub use launcher::{LaunchSpec, NodeHandle, NodeLauncher, ProcessLauncher};
pub use metadata::MetadataStore;
pub use plan::{plan_rescale, RescalePlan};

/// Per-phase outcome counts of a bootstrap or scale-up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSummary {
    pub nodes: usize,
    pub started: usize,
    pub identities: usize,
    pub registered: usize,
    pub topology_configured: usize,
    pub consensus_total: usize,
    pub consensus_configured: usize,
    pub funded: usize,
}

impl BootstrapSummary {
    pub fn is_degraded(&self) -> bool {
        self.identities < self.started
            || self.registered < self.identities
            || self.topology_configured < self.started
            || self.consensus_configured < self.consensus_total
            || self.funded < self.identities
    }
}

/// Transaction nodes marked busy for the lifetime of this value.
#[derive(Debug)]
pub struct Reservation {
    nodes: Vec<NodeProcess>,
    busy: Arc<parking_lot::RwLock<HashSet<usize>>>,
}

impl Reservation {
    pub fn nodes(&self) -> &[NodeProcess] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut busy = self.busy.write();
        for node in &self.nodes {
            busy.remove(&node.index);
        }
    }
}

pub struct FleetManager {
    config: Arc<SimulatorConfig>,
    launcher: Arc<dyn NodeLauncher>,
    clients: Arc<dyn ClientFactory>,
    store: MetadataStore,

    // State
    nodes: RwLock<BTreeMap<usize, NodeProcess>>,
    handles: Mutex<HashMap<usize, Box<dyn NodeHandle>>>,
    busy: Arc<parking_lot::RwLock<HashSet<usize>>>,
    /// Serializes fleet-level mutations (bootstrap, rescale, stop, recovery).
    ops: Mutex<()>,
    simulation_active: AtomicBool,
    last_bootstrap: parking_lot::Mutex<Option<BootstrapSummary>>,
}

impl FleetManager {
    pub fn new(
        config: Arc<SimulatorConfig>,
        launcher: Arc<dyn NodeLauncher>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        let store = MetadataStore::new(config.metadata_path());
        Self {
            config,
            launcher,
            clients,
            store,
            nodes: RwLock::new(BTreeMap::new()),
            handles: Mutex::new(HashMap::new()),
            busy: Arc::new(parking_lot::RwLock::new(HashSet::new())),
            ops: Mutex::new(()),
            simulation_active: AtomicBool::new(false),
            last_bootstrap: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Make sure a fleet with `transaction_nodes` transaction-role members
    /// is up: resume and adjust the persisted fleet, or bootstrap a new one
    /// when there is none or `fresh` is set.
    pub async fn ensure_fleet(
        &self,
        transaction_nodes: usize,
        fresh: bool,
    ) -> Result<Vec<NodeProcess>, FleetError> {
        let (min, max) = (
            self.config.min_transaction_nodes,
            self.config.max_transaction_nodes,
        );
        if transaction_nodes < min || transaction_nodes > max {
            return Err(FleetError::InvalidNodeCount {
                requested: transaction_nodes,
                min,
                max,
            });
        }

        let _op = self.ops.lock().await;
        if !fresh && self.store.exists().await {
            info!(transaction_nodes, "found existing fleet, checking whether adjustment is needed");
            self.adjust(transaction_nodes).await?;
        } else {
            if fresh {
                info!("fresh start requested, removing existing fleet state");
            }
            self.cleanup().await?;
            self.bootstrap(transaction_nodes).await?;
        }
        Ok(self.nodes().await)
    }

    /// Outcome of the most recent bootstrap or scale-up.
    pub fn last_bootstrap(&self) -> Option<BootstrapSummary> {
        self.last_bootstrap.lock().clone()
    }

    async fn bootstrap(&self, transaction_nodes: usize) -> Result<BootstrapSummary, FleetError> {
        let consensus = self.config.consensus_node_count;
        let total = consensus + transaction_nodes;
        let fresh: Vec<NodeProcess> = (0..total)
            .map(|index| {
                let role = if index < consensus {
                    NodeRole::Consensus
                } else {
                    NodeRole::Transaction
                };
                let (port, secondary_port) = self.config.ports_for(index);
                NodeProcess::new(index, role, port, secondary_port)
            })
            .collect();
        let indices: Vec<usize> = fresh.iter().map(|n| n.index).collect();

        info!(total, consensus, transaction_nodes, "phase 1: starting nodes");
        if let Err(e) = self.bring_up(&fresh).await {
            error!(error = %e, "bootstrap aborted, tearing down started nodes");
            self.teardown(&indices).await;
            return Err(e);
        }
        self.register_running(fresh).await;
        let mut summary = BootstrapSummary {
            nodes: total,
            started: total,
            consensus_total: consensus,
            ..BootstrapSummary::default()
        };

        let nodes = self.snapshot(&indices).await;
        summary.identities = match self.create_identities(&nodes, true).await {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, "bootstrap aborted, tearing down started nodes");
                self.teardown(&indices).await;
                return Err(e);
            }
        };

        let nodes = self.snapshot(&indices).await;
        summary.registered = self.register_identities(&nodes).await;
        let consensus_list = self.consensus_identities().await;
        summary.topology_configured = self.configure_topology(&nodes, &consensus_list).await;
        summary.consensus_configured = self.setup_consensus(&nodes).await;
        summary.funded = self.fund(&nodes).await;

        self.persist().await?;
        self.log_summary(&summary);
        Ok(summary)
    }

    async fn adjust(&self, transaction_nodes: usize) -> Result<(), FleetError> {
        let saved = self.store.load().await?;
        let plan = plan_rescale(&saved, transaction_nodes);
        self.adopt(saved).await;

        match plan {
            RescalePlan::Noop => {
                info!("node count matches, checking existing nodes");
                let all = self.indices().await;
                let outcome = self.revive(&all).await;
                self.persist().await?;
                outcome?;
            }
            RescalePlan::ScaleUp { add, next_index } => {
                info!(add, next_index, "adding transaction nodes");
                let all = self.indices().await;
                if let Err(e) = self.revive(&all).await {
                    self.persist().await?;
                    return Err(e);
                }
                self.scale_up(add, next_index).await?;
            }
            RescalePlan::ScaleDown { remove } => {
                info!(?remove, "removing excess transaction nodes");
                let doomed = self.indices_of(&remove).await;
                let stopping = self.snapshot(&doomed).await;
                self.shut_down(&stopping).await;
                self.teardown(&doomed).await;
                let kept = self.indices().await;
                let outcome = self.revive(&kept).await;
                self.persist().await?;
                outcome?;
            }
        }
        Ok(())
    }

    /// Append transaction nodes to a running fleet. Phase 1 failures abort
    /// without touching existing members; later phases only degrade.
    async fn scale_up(&self, add: usize, next_index: usize) -> Result<BootstrapSummary, FleetError> {
        let fresh: Vec<NodeProcess> = (next_index..next_index + add)
            .map(|index| {
                let (port, secondary_port) = self.config.ports_for(index);
                NodeProcess::new(index, NodeRole::Transaction, port, secondary_port)
            })
            .collect();
        let indices: Vec<usize> = fresh.iter().map(|n| n.index).collect();

        info!(add, first = next_index, "phase 1: starting additional transaction nodes");
        if let Err(e) = self.bring_up(&fresh).await {
            error!(error = %e, "scale-up aborted, stopping the new nodes");
            self.teardown(&indices).await;
            return Err(e);
        }
        self.register_running(fresh).await;

        let mut summary = BootstrapSummary {
            nodes: add,
            started: add,
            ..BootstrapSummary::default()
        };
        let nodes = self.snapshot(&indices).await;
        summary.identities = self.create_identities(&nodes, false).await?;

        let nodes = self.snapshot(&indices).await;
        summary.registered = self.register_identities(&nodes).await;
        let consensus_list = self.consensus_identities().await;
        summary.topology_configured = self.configure_topology(&nodes, &consensus_list).await;
        summary.funded = self.fund(&nodes).await;

        self.persist().await?;
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Shut every node down, keep the metadata (marked stopped) and forget
    /// the in-memory fleet.
    pub async fn stop_fleet(&self) -> Result<(), FleetError> {
        let _op = self.ops.lock().await;
        if self.nodes.read().await.is_empty() && self.store.exists().await {
            let saved = self.store.load().await?;
            self.adopt(saved).await;
        }

        let nodes = self.nodes().await;
        info!(nodes = nodes.len(), "stopping fleet");
        self.shut_down(&nodes).await;

        for node in &nodes {
            self.set_status(node.index, NodeStatus::Stopped).await;
        }
        if !nodes.is_empty() {
            self.persist().await?;
        }
        self.nodes.write().await.clear();
        info!("all nodes stopped");
        Ok(())
    }

    /// Load the persisted fleet into memory without touching any process.
    pub async fn attach(&self) -> Result<Vec<NodeProcess>, FleetError> {
        let _op = self.ops.lock().await;
        let saved = self.store.load().await?;
        debug!(nodes = saved.len(), "attached to persisted fleet");
        self.adopt(saved).await;
        Ok(self.nodes().await)
    }

    /// Bring back every node recorded in metadata.
    pub async fn restart_fleet(&self) -> Result<Vec<NodeProcess>, FleetError> {
        let _op = self.ops.lock().await;
        let saved = self.store.load().await?;
        info!(nodes = saved.len(), "restarting fleet from metadata");
        self.adopt(saved).await;

        let all = self.indices().await;
        let outcome = self.revive(&all).await;
        self.persist().await?;
        outcome?;
        Ok(self.nodes().await)
    }

    /// Force-restart the named nodes.
    pub async fn restart_nodes(&self, ids: &[String]) -> Result<(), FleetError> {
        let _op = self.ops.lock().await;
        for id in ids {
            let Some(node) = self.node(id).await else {
                warn!(node = %id, "node not found, skipping restart");
                continue;
            };
            self.kill(node.index).await;
            self.spawn(&node).await?;
            if let Err(e) = self.await_ready(&node).await {
                self.set_status(node.index, NodeStatus::Failed).await;
                return Err(e);
            }
            self.set_status(node.index, NodeStatus::Running).await;
            if node.is_consensus() {
                self.apply_consensus_role(&node).await;
            }
            info!(node = %id, "node restarted");
        }
        self.persist().await
    }

    /// Recover one failed node without touching the others. A node that
    /// still answers is only marked running.
    pub async fn recover_node(&self, id: &str) -> Result<(), FleetError> {
        let _op = self.ops.lock().await;
        let node = self
            .node(id)
            .await
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        let client = self.client_for(&node);

        if client.ping().await.is_ok() {
            info!(node = %id, "node is responding, nothing to recover");
            self.set_status(node.index, NodeStatus::Running).await;
            return Ok(());
        }

        info!(node = %id, "recovering node");
        self.kill(node.index).await;

        let work_dir = self.config.nodes_dir().join(&node.id);
        let quarantine = self.config.nodes_dir().join(format!("{}.quarantine", node.id));
        remove_dir(&quarantine).await;
        if let Err(e) = tokio::fs::rename(&work_dir, &quarantine).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(node = %id, error = %e, "failed to quarantine working directory");
            }
        }

        if let Err(e) = self.spawn(&node).await {
            remove_dir(&work_dir).await;
            if let Err(restore) = tokio::fs::rename(&quarantine, &work_dir).await {
                warn!(node = %id, error = %restore, "failed to restore quarantined directory");
            }
            self.set_status(node.index, NodeStatus::Failed).await;
            return Err(e);
        }

        let ready = self.await_ready(&node).await;
        remove_dir(&quarantine).await;
        if let Err(e) = ready {
            self.set_status(node.index, NodeStatus::Failed).await;
            return Err(e);
        }

        if !node.has_identity() {
            info!(node = %id, "recreating identity for recovered node");
            match client.create_identity(&self.config.identity_password).await {
                Ok(created) => {
                    self.update(node.index, |n| {
                        n.identity = created.identity;
                        n.peer_id = created.peer_id;
                    })
                    .await;
                }
                Err(e) => warn!(node = %id, error = %e, "failed to recreate identity"),
            }
        }

        if node.is_consensus() {
            if let Some(node) = self.node(id).await {
                self.apply_consensus_role(&node).await;
            }
        }

        self.set_status(node.index, NodeStatus::Running).await;
        info!(node = %id, "node recovered");
        self.persist().await
    }

    /// Ping every node and record the result.
    pub async fn check_all_status(&self) -> BTreeMap<String, NodeStatus> {
        let nodes = self.nodes().await;
        let results = join_all(nodes.iter().map(|node| async move {
            let alive = self.client_for(node).ping().await.is_ok();
            (node, alive)
        }))
        .await;

        let mut statuses = BTreeMap::new();
        let mut registry = self.nodes.write().await;
        for (node, alive) in results {
            let status = match (alive, node.status) {
                (true, _) => NodeStatus::Running,
                (false, NodeStatus::Stopped) => NodeStatus::Stopped,
                (false, _) => NodeStatus::Failed,
            };
            if let Some(entry) = registry.get_mut(&node.index) {
                entry.status = status;
            }
            statuses.insert(node.id.clone(), status);
        }
        statuses
    }

    /// Connected peer count per node. Unreachable nodes are left out.
    pub async fn peer_counts(&self) -> BTreeMap<String, usize> {
        let nodes = self.nodes().await;
        let results = join_all(nodes.iter().map(|node| async move {
            (node, self.client_for(node).peer_count().await)
        }))
        .await;

        let mut counts = BTreeMap::new();
        for (node, result) in results {
            match result {
                Ok(peers) => {
                    counts.insert(node.id.clone(), peers);
                }
                Err(e) => debug!(node = %node.id, error = %e, "peer count unavailable"),
            }
        }
        counts
    }

    pub async fn nodes(&self) -> Vec<NodeProcess> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn node(&self, id: &str) -> Option<NodeProcess> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Mark up to `count` usable, idle transaction nodes busy.
    pub async fn reserve_transaction_nodes(&self, count: usize) -> Reservation {
        let candidates: Vec<NodeProcess> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_usable())
            .cloned()
            .collect();

        let mut busy = self.busy.write();
        let nodes: Vec<NodeProcess> = candidates
            .into_iter()
            .filter(|n| !busy.contains(&n.index))
            .take(count)
            .collect();
        for node in &nodes {
            busy.insert(node.index);
        }
        drop(busy);

        Reservation {
            nodes,
            busy: self.busy.clone(),
        }
    }

    pub fn busy_count(&self) -> usize {
        self.busy.read().len()
    }

    /// Re-register every identity so the nodes re-announce themselves to
    /// their peers. Returns how many registrations succeeded.
    pub async fn rebroadcast_identities(&self) -> usize {
        let nodes: Vec<NodeProcess> = self
            .nodes()
            .await
            .into_iter()
            .filter(NodeProcess::has_identity)
            .collect();
        info!(nodes = nodes.len(), "re-registering identities");

        let mut ok = 0;
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                sleep(self.config.rebroadcast_spacing()).await;
            }
            match self
                .client_for(node)
                .register_identity(&node.identity, &self.config.identity_password)
                .await
            {
                Ok(()) => ok += 1,
                // the node still announces the identity to its peers
                Err(e) if already_registered(&e) => ok += 1,
                Err(e) => warn!(node = %node.id, error = %e, "identity re-registration failed"),
            }
        }
        sleep(self.config.registration_settle()).await;
        info!("re-registration complete: {}/{} successful", ok, nodes.len());
        ok
    }

    /// Fund running nodes whose balance fell below `min_balance`.
    pub async fn top_up_balances(&self, min_balance: f64, units: u32) -> usize {
        let nodes: Vec<NodeProcess> = self
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Running && n.has_identity())
            .collect();

        let mut funded = 0;
        for node in &nodes {
            let client = self.client_for(node);
            let balance = match client.get_balance(&node.identity).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(node = %node.id, error = %e, "balance check failed");
                    continue;
                }
            };
            if balance >= min_balance {
                continue;
            }
            info!(node = %node.id, balance, min_balance, units, "topping up balance");
            match client
                .request_funding(&node.identity, units, &self.config.identity_password)
                .await
            {
                Ok(()) => funded += 1,
                Err(e) => warn!(node = %node.id, error = %e, "top-up failed"),
            }
        }
        funded
    }

    pub fn set_simulation_active(&self, active: bool) {
        self.simulation_active.store(active, Ordering::SeqCst);
    }

    pub fn is_simulation_active(&self) -> bool {
        self.simulation_active.load(Ordering::SeqCst)
    }

    // Bootstrap phases

    /// Phase 1: spawn each node, then wait for all of them to come up.
    async fn bring_up(&self, nodes: &[NodeProcess]) -> Result<(), FleetError> {
        for (i, node) in nodes.iter().enumerate() {
            info!(
                node = %node.id,
                role = ?node.role,
                port = node.port,
                "[{}/{}] starting node",
                i + 1,
                nodes.len()
            );
            self.spawn(node).await?;
        }

        sleep(self.config.node_boot_grace()).await;
        let results = join_all(nodes.iter().map(|node| self.await_ready(node))).await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        info!("phase 1 complete: {}/{} nodes ready", nodes.len(), nodes.len());
        Ok(())
    }

    /// Phase 2. With `strict`, the first failure is returned.
    async fn create_identities(
        &self,
        nodes: &[NodeProcess],
        strict: bool,
    ) -> Result<usize, FleetError> {
        info!(nodes = nodes.len(), "phase 2: creating identities");
        let password = &self.config.identity_password;
        let results = join_all(nodes.iter().map(|node| async move {
            (node, self.client_for(node).create_identity(password).await)
        }))
        .await;

        let mut created = 0;
        let mut first_error = None;
        for (node, result) in results {
            match result {
                Ok(identity) => {
                    if identity.peer_id.is_empty() {
                        warn!(node = %node.id, "identity created without a peer id");
                    }
                    info!(node = %node.id, identity = %short(&identity.identity), "identity created");
                    self.update(node.index, |n| {
                        n.identity = identity.identity;
                        n.peer_id = identity.peer_id;
                    })
                    .await;
                    created += 1;
                }
                Err(source) => {
                    error!(node = %node.id, error = %source, "identity creation failed");
                    if first_error.is_none() {
                        first_error = Some(FleetError::Bootstrap {
                            node: node.id.clone(),
                            source,
                        });
                    }
                }
            }
        }
        info!("phase 2 complete: {}/{} identities created", created, nodes.len());

        match first_error {
            Some(e) if strict => Err(e),
            _ => Ok(created),
        }
    }

    /// Phase 3: each node registers its own identity, which broadcasts it.
    async fn register_identities(&self, nodes: &[NodeProcess]) -> usize {
        info!(nodes = nodes.len(), "phase 3: registering identities");
        let mut registered = 0;
        for node in nodes.iter().filter(|n| n.has_identity()) {
            match self
                .client_for(node)
                .register_identity(&node.identity, &self.config.identity_password)
                .await
            {
                Ok(()) => {
                    debug!(node = %node.id, "identity registered");
                    registered += 1;
                }
                Err(e) if already_registered(&e) => {
                    debug!(node = %node.id, "identity was already registered");
                    registered += 1;
                }
                Err(e) => error!(node = %node.id, error = %e, "identity registration failed"),
            }
        }
        sleep(self.config.registration_settle()).await;

        let with_identity = nodes.iter().filter(|n| n.has_identity()).count();
        if registered < with_identity {
            warn!("phase 3 complete: {}/{} registered", registered, with_identity);
        } else {
            info!("phase 3 complete: {}/{} registered", registered, with_identity);
        }
        registered
    }

    /// Phase 4: push the consensus identity list to every node.
    async fn configure_topology(&self, nodes: &[NodeProcess], consensus: &[String]) -> usize {
        info!(nodes = nodes.len(), members = consensus.len(), "phase 4: configuring topology");
        let mut configured = 0;
        for node in nodes {
            let client = self.client_for(node);
            if let Err(e) = client.configure_topology(consensus).await {
                error!(node = %node.id, error = %e, "topology configuration failed");
                continue;
            }
            configured += 1;
            match client.get_topology().await {
                Ok(members) => debug!(node = %node.id, members = members.len(), "topology verified"),
                Err(e) => warn!(node = %node.id, error = %e, "could not read topology back"),
            }
        }
        info!("phase 4 complete: {}/{} nodes configured", configured, nodes.len());
        configured
    }

    /// Phase 5: bind consensus-role identities to the consensus role.
    async fn setup_consensus(&self, nodes: &[NodeProcess]) -> usize {
        let consensus: Vec<&NodeProcess> = nodes.iter().filter(|n| n.is_consensus()).collect();
        info!(nodes = consensus.len(), "phase 5: consensus role setup");
        let mut configured = 0;
        for node in &consensus {
            if self.apply_consensus_role(node).await {
                configured += 1;
            }
        }
        info!("phase 5 complete: {}/{} consensus nodes configured", configured, consensus.len());
        configured
    }

    /// Phase 6: request test value for every node with an identity.
    async fn fund(&self, nodes: &[NodeProcess]) -> usize {
        let targets: Vec<&NodeProcess> = nodes.iter().filter(|n| n.has_identity()).collect();
        info!(nodes = targets.len(), units = self.config.funding_units, "phase 6: funding");
        let results = join_all(targets.iter().map(|node| self.fund_node(node))).await;
        let funded = results.into_iter().filter(|ok| *ok).count();
        if funded < targets.len() {
            warn!("phase 6 complete: {}/{} nodes funded", funded, targets.len());
        } else {
            info!("phase 6 complete: {}/{} nodes funded", funded, targets.len());
        }
        funded
    }

    async fn fund_node(&self, node: &NodeProcess) -> bool {
        let client = self.client_for(node);
        let attempts = self.config.funding_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(node = %node.id, attempt, "retrying funding");
            }
            if let Err(e) = client
                .request_funding(
                    &node.identity,
                    self.config.funding_units,
                    &self.config.identity_password,
                )
                .await
            {
                warn!(node = %node.id, attempt, error = %e, "funding request failed");
                if attempt < attempts {
                    sleep(self.config.funding_poll_interval()).await;
                }
                continue;
            }

            for _ in 0..self.config.funding_balance_polls {
                sleep(self.config.funding_poll_interval()).await;
                match client.get_balance(&node.identity).await {
                    Ok(balance) if balance > 0.0 => {
                        info!(node = %node.id, balance, "node funded");
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(node = %node.id, error = %e, "balance poll failed"),
                }
            }
            warn!(node = %node.id, attempt, "balance still zero after funding");
        }
        error!(node = %node.id, "funding failed");
        false
    }

    // Process and registry helpers

    fn client_for(&self, node: &NodeProcess) -> Arc<dyn NodeApi> {
        self.clients.client(node.port)
    }

    async fn spawn(&self, node: &NodeProcess) -> Result<(), FleetError> {
        let spec = LaunchSpec {
            node_id: node.id.clone(),
            index: node.index,
            port: node.port,
            secondary_port: node.secondary_port,
            work_dir: self.config.nodes_dir().join(&node.id),
        };
        let handle = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|source| FleetError::Launch {
                node: node.id.clone(),
                source,
            })?;
        debug!(node = %node.id, pid = ?handle.pid(), "node process launched");
        let previous = self.handles.lock().await.insert(node.index, handle);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.kill().await {
                debug!(node = %node.id, error = %e, "stale handle kill failed");
            }
        }
        Ok(())
    }

    /// Readiness wait followed by the core start call.
    async fn await_ready(&self, node: &NodeProcess) -> Result<(), FleetError> {
        let client = self.client_for(node);
        client
            .wait_until_ready(
                self.config.node_startup_timeout(),
                &self.config.readiness_backoff,
            )
            .await
            .map_err(|source| FleetError::Bootstrap {
                node: node.id.clone(),
                source,
            })?;
        debug!(node = %node.id, "node ready");
        if let Err(e) = client.start().await {
            warn!(node = %node.id, error = %e, "core start failed");
        }
        Ok(())
    }

    async fn restart_with_retries(&self, node: &NodeProcess) -> Result<(), FleetError> {
        let attempts = self.config.restart_attempts.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                info!(node = %node.id, "restart retry {}/{}", attempt + 1, attempts);
                sleep(self.config.restart_spacing() * attempt).await;
            }
            self.kill(node.index).await;
            let outcome = match self.spawn(node).await {
                Ok(()) => self.await_ready(node).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(node = %node.id, attempt = attempt + 1, error = %e, "restart attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| FleetError::RestartFailed(vec![node.id.clone()])))
    }

    /// Restart the unresponsive nodes among `indices`.
    async fn revive(&self, indices: &[usize]) -> Result<(), FleetError> {
        let nodes = self.snapshot(indices).await;
        let mut failed = Vec::new();
        let mut restarted = Vec::new();

        for node in &nodes {
            if self.client_for(node).ping().await.is_ok() {
                self.set_status(node.index, NodeStatus::Running).await;
                continue;
            }
            warn!(node = %node.id, "node not responding, restarting");
            match self.restart_with_retries(node).await {
                Ok(()) => {
                    self.set_status(node.index, NodeStatus::Running).await;
                    restarted.push(node);
                }
                Err(e) => {
                    error!(node = %node.id, error = %e, "giving up on node");
                    self.set_status(node.index, NodeStatus::Failed).await;
                    failed.push(node.id.clone());
                }
            }
        }

        for node in restarted.into_iter().filter(|n| n.is_consensus()) {
            self.apply_consensus_role(node).await;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(FleetError::RestartFailed(failed))
        }
    }

    async fn apply_consensus_role(&self, node: &NodeProcess) -> bool {
        if !node.has_identity() {
            warn!(node = %node.id, "consensus node has no identity, skipping role setup");
            return false;
        }
        match self
            .client_for(node)
            .setup_consensus_role(
                &node.identity,
                &self.config.consensus_key_password,
                &self.config.identity_password,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %node.id, error = %e, "consensus role setup failed");
                false
            }
        }
    }

    /// Graceful shutdown call bounded by the shutdown timeout, then kill.
    async fn shut_down(&self, nodes: &[NodeProcess]) {
        let grace = self.config.shutdown_timeout();
        join_all(nodes.iter().map(|node| async move {
            match timeout(grace, self.client_for(node).shutdown()).await {
                Ok(Ok(())) => debug!(node = %node.id, "shut down gracefully"),
                Ok(Err(e)) => warn!(node = %node.id, error = %e, "graceful shutdown failed"),
                Err(_) => warn!(node = %node.id, "graceful shutdown timed out, killing"),
            }
        }))
        .await;
        for node in nodes {
            self.kill(node.index).await;
        }
    }

    async fn kill(&self, index: usize) {
        let handle = self.handles.lock().await.remove(&index);
        if let Some(mut handle) = handle {
            if let Err(e) = handle.kill().await {
                warn!(index, error = %e, "failed to kill node process");
            }
        }
    }

    /// Kill and forget the given nodes.
    async fn teardown(&self, indices: &[usize]) {
        for index in indices {
            self.kill(*index).await;
        }
        let mut registry = self.nodes.write().await;
        for index in indices {
            registry.remove(index);
        }
    }

    /// Drop all fleet state: processes, registry, metadata and working dirs.
    async fn cleanup(&self) -> Result<(), FleetError> {
        let indices: Vec<usize> = self.handles.lock().await.keys().copied().collect();
        self.teardown(&indices).await;
        self.nodes.write().await.clear();
        self.store.remove().await?;
        match tokio::fs::remove_dir_all(self.config.nodes_dir()).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn register_running(&self, nodes: Vec<NodeProcess>) {
        let mut registry = self.nodes.write().await;
        for mut node in nodes {
            node.status = NodeStatus::Running;
            registry.insert(node.index, node);
        }
    }

    /// Replace the registry with persisted nodes.
    async fn adopt(&self, saved: Vec<NodeProcess>) {
        let mut registry = self.nodes.write().await;
        registry.clear();
        registry.extend(saved.into_iter().map(|n| (n.index, n)));
    }

    async fn persist(&self) -> Result<(), FleetError> {
        let nodes = self.nodes().await;
        self.store.save(&nodes).await?;
        debug!(path = %self.store.path().display(), nodes = nodes.len(), "fleet metadata saved");
        Ok(())
    }

    async fn indices(&self) -> Vec<usize> {
        self.nodes.read().await.keys().copied().collect()
    }

    async fn indices_of(&self, ids: &[String]) -> Vec<usize> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| ids.contains(&n.id))
            .map(|n| n.index)
            .collect()
    }

    async fn snapshot(&self, indices: &[usize]) -> Vec<NodeProcess> {
        let registry = self.nodes.read().await;
        indices
            .iter()
            .filter_map(|i| registry.get(i).cloned())
            .collect()
    }

    async fn consensus_identities(&self) -> Vec<String> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_consensus() && n.has_identity())
            .map(|n| n.identity.clone())
            .collect()
    }

    async fn update(&self, index: usize, f: impl FnOnce(&mut NodeProcess)) {
        if let Some(node) = self.nodes.write().await.get_mut(&index) {
            f(node);
        }
    }

    async fn set_status(&self, index: usize, status: NodeStatus) {
        self.update(index, |n| n.status = status).await;
    }

    fn log_summary(&self, summary: &BootstrapSummary) {
        info!(
            started = summary.started,
            identities = summary.identities,
            registered = summary.registered,
            topology = summary.topology_configured,
            consensus = summary.consensus_configured,
            funded = summary.funded,
            "fleet setup complete"
        );
        if summary.is_degraded() {
            warn!("some setup steps failed, transfers involving affected nodes may fail");
        }
        *self.last_bootstrap.lock() = Some(summary.clone());
    }
}

fn already_registered(e: &NodeClientError) -> bool {
    matches!(e, NodeClientError::Rejected { message, .. }
        if message.to_ascii_lowercase().contains("already registered"))
}

async fn remove_dir(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_counts_as_registered() {
        let duplicate = NodeClientError::Rejected {
            operation: "register-did",
            message: "DID already registered".into(),
        };
        assert!(already_registered(&duplicate));

        let refused = NodeClientError::Rejected {
            operation: "register-did",
            message: "invalid password".into(),
        };
        assert!(!already_registered(&refused));
        assert!(!already_registered(&NodeClientError::Status {
            status: 500,
            body: "already registered".into(),
        }));
    }

    #[test]
    fn missing_identities_degrade_the_summary() {
        let summary = BootstrapSummary {
            nodes: 2,
            started: 2,
            identities: 1,
            registered: 1,
            topology_configured: 2,
            funded: 1,
            ..BootstrapSummary::default()
        };
        assert!(summary.is_degraded());
        assert!(!BootstrapSummary {
            identities: 2,
            registered: 2,
            funded: 2,
            ..summary
        }
        .is_degraded());
    }
}
