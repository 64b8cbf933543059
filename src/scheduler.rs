use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::client::{round_amount, ClientFactory, NodeApi};
use crate::config::SimulatorConfig;
use crate::error::ScheduleError;
use crate::model::{NodeProcess, TransactionRecord, TxStatus};

/// Share of the available balance sent when the drawn amount is too large.
const FALLBACK_SHARE: f64 = 0.8;

/// One pre-drawn transfer. `sender` and `receiver` index the node slice the
/// plans were generated for.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferPlan {
    pub index: usize,
    pub sender: usize,
    pub receiver: usize,
    pub amount: f64,
}

/// Draw `count` plans with uniformly random distinct endpoints and a whole
/// amount in `1..=max_amount`.
pub fn generate_plans<R: Rng>(
    rng: &mut R,
    nodes: usize,
    count: usize,
    max_amount: u32,
) -> Vec<TransferPlan> {
    if nodes < 2 {
        return Vec::new();
    }
    (0..count)
        .map(|index| {
            let sender = rng.gen_range(0..nodes);
            let mut receiver = rng.gen_range(0..nodes - 1);
            if receiver >= sender {
                receiver += 1;
            }
            TransferPlan {
                index,
                sender,
                receiver,
                amount: f64::from(rng.gen_range(1..=max_amount.max(1))),
            }
        })
        .collect()
}

/// Greedy node-disjoint selection over the unassigned plans, in order,
/// capped at `node_count / 2`. Returns positions into `plans`.
pub fn form_round(plans: &[TransferPlan], assigned: &[bool], node_count: usize) -> Vec<usize> {
    let cap = node_count / 2;
    let mut committed = HashSet::new();
    let mut round = Vec::new();

    for (pos, plan) in plans.iter().enumerate() {
        if round.len() >= cap {
            break;
        }
        if assigned.get(pos).copied().unwrap_or(true) {
            continue;
        }
        if committed.contains(&plan.sender) || committed.contains(&plan.receiver) {
            continue;
        }
        committed.insert(plan.sender);
        committed.insert(plan.receiver);
        round.push(pos);
    }
    round
}

/// Snapshot handed to the progress callback after each round.
#[derive(Clone, Debug)]
pub struct RoundProgress {
    pub round: usize,
    pub admitted: usize,
    pub completed: usize,
    pub success: usize,
    pub failure: usize,
    /// Finished records so far, in plan order.
    pub transactions: Vec<TransactionRecord>,
}

/// Runs a flat transfer count as a sequence of conflict-free concurrent
/// rounds against a set of transaction nodes.
pub struct RoundScheduler {
    clients: Arc<dyn ClientFactory>,
    config: Arc<SimulatorConfig>,
}

impl RoundScheduler {
    pub fn new(clients: Arc<dyn ClientFactory>, config: Arc<SimulatorConfig>) -> Self {
        Self { clients, config }
    }

    fn rng(&self) -> StdRng {
        match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub async fn execute<F>(
        &self,
        nodes: &[NodeProcess],
        count: usize,
        mut on_progress: F,
    ) -> Result<Vec<TransactionRecord>, ScheduleError>
    where
        F: FnMut(&RoundProgress) + Send,
    {
        if nodes.len() < 2 {
            return Err(ScheduleError::InsufficientNodes(nodes.len()));
        }

        let plans = generate_plans(
            &mut self.rng(),
            nodes.len(),
            count,
            self.config.max_transfer_amount,
        );
        info!(transactions = count, nodes = nodes.len(), "executing transfers in paired rounds");

        let mut assigned = vec![false; plans.len()];
        let mut finished: BTreeMap<usize, TransactionRecord> = BTreeMap::new();
        let mut round = 0;

        while assigned.iter().any(|a| !a) {
            round += 1;
            let admitted = form_round(&plans, &assigned, nodes.len());
            if admitted.is_empty() {
                if let Some(pos) = assigned.iter().position(|a| !a) {
                    warn!(round, plan = pos, "no admissible pair in round, skipping plan");
                    assigned[pos] = true;
                }
                continue;
            }

            info!(round, transfers = admitted.len(), "executing round");
            let mut pending = BTreeMap::new();
            let mut tasks = JoinSet::new();
            for &pos in &admitted {
                assigned[pos] = true;
                let plan = &plans[pos];
                let (sender, receiver) = (&nodes[plan.sender], &nodes[plan.receiver]);
                let record = TransactionRecord::pending(
                    sender.identity.clone(),
                    receiver.identity.clone(),
                    plan.amount,
                    format!("Transaction {} from {} to {}", plan.index, sender.id, receiver.id),
                    sender.id.clone(),
                );
                pending.insert(plan.index, record.clone());

                let client = self.clients.client(sender.port);
                let floor = self.config.balance_floor;
                let password = self.config.identity_password.clone();
                let index = plan.index;
                tasks.spawn(async move {
                    (index, execute_transfer(client, record, floor, &password).await)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, record)) => {
                        pending.remove(&index);
                        finished.insert(index, record);
                    }
                    Err(e) => warn!(round, error = %e, "transfer task did not complete"),
                }
            }
            // records whose task died
            for (index, record) in pending {
                finished.insert(
                    index,
                    record.finish(Default::default(), Err("transfer task aborted".into())),
                );
            }

            let transactions: Vec<TransactionRecord> = finished.values().cloned().collect();
            let success = transactions
                .iter()
                .filter(|r| r.status == TxStatus::Success)
                .count();
            let progress = RoundProgress {
                round,
                admitted: admitted.len(),
                completed: transactions.len(),
                success,
                failure: transactions.len() - success,
                transactions,
            };
            info!(
                round,
                completed = progress.completed,
                total = count,
                "progress: {}/{} transfers completed",
                progress.completed,
                count
            );
            on_progress(&progress);

            if assigned.iter().any(|a| !a) {
                sleep(self.config.round_settle()).await;
            }
        }

        info!(transactions = finished.len(), rounds = round, "all rounds complete");
        Ok(finished.into_values().collect())
    }
}

/// Execute one transfer from the sender's node. Checks the balance first and
/// falls back to a share of it when the drawn amount is too large, unless the
/// balance is at or below `balance_floor`.
pub async fn execute_transfer(
    client: Arc<dyn NodeApi>,
    mut record: TransactionRecord,
    balance_floor: f64,
    password: &str,
) -> TransactionRecord {
    let started = Instant::now();
    record.amount = round_amount(record.amount);

    let balance = match client.get_balance(&record.sender).await {
        Ok(balance) => balance,
        Err(e) => {
            warn!(node = %record.node_id, error = %e, "balance check failed");
            return record.finish(started.elapsed(), Err(format!("failed to check balance: {}", e)));
        }
    };
    debug!(node = %record.node_id, balance, amount = record.amount, "sender balance");

    if balance < record.amount {
        if balance <= balance_floor {
            let message = format!(
                "insufficient balance: have {:.3}, need {:.3}",
                balance, record.amount
            );
            warn!(node = %record.node_id, balance, amount = record.amount, "insufficient balance");
            return record.finish(started.elapsed(), Err(message));
        }
        let adjusted = round_amount(balance * FALLBACK_SHARE);
        info!(node = %record.node_id, balance, requested = record.amount, adjusted, "reducing transfer amount");
        record.amount = adjusted;
    }

    let outcome = client
        .initiate_transfer(
            &record.sender,
            &record.receiver,
            record.amount,
            &record.memo,
            password,
        )
        .await
        .map_err(|e| format!("transfer failed: {}", e));
    match &outcome {
        Ok(tx_id) => info!(node = %record.node_id, tx_id = %tx_id, elapsed = ?started.elapsed(), "transfer completed"),
        Err(e) => warn!(node = %record.node_id, error = %e, "transfer failed"),
    }
    record.finish(started.elapsed(), outcome)
}
