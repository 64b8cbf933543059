use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

pub type RunId = Uuid;

// Fleet members

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Participates in agreement only; never sends or receives transfers.
    Consensus,
    Transaction,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

/// One externally-owned node process as seen by the control plane.
///
/// The OS handle lives in the fleet manager; this is the plain, cloneable
/// description that is persisted and handed out in snapshots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeProcess {
    pub id: String,
    pub index: usize,
    pub role: NodeRole,
    pub port: u16,
    pub secondary_port: u16,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub peer_id: String,
    pub status: NodeStatus,
}

impl NodeProcess {
    pub fn new(index: usize, role: NodeRole, port: u16, secondary_port: u16) -> Self {
        Self {
            id: Self::id_for(index),
            index,
            role,
            port,
            secondary_port,
            identity: String::new(),
            peer_id: String::new(),
            status: NodeStatus::Starting,
        }
    }

    pub fn id_for(index: usize) -> String {
        format!("node{}", index)
    }

    pub fn is_consensus(&self) -> bool {
        self.role == NodeRole::Consensus
    }

    pub fn has_identity(&self) -> bool {
        !self.identity.is_empty()
    }

    /// Eligible to send or receive transfers.
    pub fn is_usable(&self) -> bool {
        self.role == NodeRole::Transaction
            && self.status == NodeStatus::Running
            && self.has_identity()
    }
}

/// Shortened identity for log lines.
pub fn short(identity: &str) -> &str {
    match identity.char_indices().nth(16) {
        Some((idx, _)) => &identity[..idx],
        None => identity,
    }
}

// Transactions

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub memo: String,
    pub status: TxStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Node that originated the transfer.
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn pending(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        amount: f64,
        memo: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            memo: memo.into(),
            status: TxStatus::Pending,
            elapsed_ms: 0,
            error: None,
            node_id: node_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Move to a terminal status. Consumes the pending record so the
    /// transition can only happen once.
    pub fn finish(mut self, elapsed: Duration, outcome: Result<String, String>) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(tx_id) => {
                if !tx_id.is_empty() {
                    self.id = tx_id;
                }
                self.status = TxStatus::Success;
            }
            Err(message) => {
                self.status = TxStatus::Failed;
                self.error = Some(message);
            }
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TxStatus::Pending
    }
}

// Aggregates

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub completed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub min_elapsed_ms: u64,
    pub avg_elapsed_ms: f64,
    pub max_elapsed_ms: u64,
    /// Sum of amounts of successful transfers.
    pub total_value: f64,
}

impl RunStats {
    /// Recompute from scratch. Pending records are ignored.
    pub fn from_records(records: &[TransactionRecord]) -> Self {
        let mut stats = RunStats::default();
        let mut total_elapsed = 0u64;
        let mut min = u64::MAX;

        for record in records.iter().filter(|r| r.is_terminal()) {
            match record.status {
                TxStatus::Success => {
                    stats.success_count += 1;
                    stats.total_value += record.amount;
                }
                TxStatus::Failed => stats.failure_count += 1,
                TxStatus::Pending => {}
            }
            total_elapsed += record.elapsed_ms;
            min = min.min(record.elapsed_ms);
            stats.max_elapsed_ms = stats.max_elapsed_ms.max(record.elapsed_ms);
        }

        stats.completed = stats.success_count + stats.failure_count;
        if stats.completed > 0 {
            stats.min_elapsed_ms = min;
            stats.avg_elapsed_ms = total_elapsed as f64 / stats.completed as f64;
        }
        stats
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_id: String,
    pub transactions_handled: usize,
    pub successful: usize,
    pub failed: usize,
    pub avg_elapsed_ms: f64,
    pub total_value: f64,
}

pub fn node_breakdown(records: &[TransactionRecord]) -> Vec<NodeStats> {
    let mut per_node: BTreeMap<&str, (NodeStats, u64)> = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_terminal()) {
        let (stats, elapsed) = per_node.entry(record.node_id.as_str()).or_insert_with(|| {
            (
                NodeStats {
                    node_id: record.node_id.clone(),
                    ..NodeStats::default()
                },
                0,
            )
        });
        stats.transactions_handled += 1;
        *elapsed += record.elapsed_ms;
        if record.status == TxStatus::Success {
            stats.successful += 1;
            stats.total_value += record.amount;
        } else {
            stats.failed += 1;
        }
    }
    per_node
        .into_values()
        .map(|(mut stats, elapsed)| {
            stats.avg_elapsed_ms = elapsed as f64 / stats.transactions_handled as f64;
            stats
        })
        .collect()
}

// Simulation runs

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Admitted,
    Running,
    Finished,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRun {
    pub id: RunId,
    pub requested_nodes: usize,
    pub requested_transactions: usize,
    /// Consensus plus transaction nodes backing the run.
    pub total_nodes: usize,
    pub state: RunState,
    pub nodes: Vec<NodeProcess>,
    pub transactions: Vec<TransactionRecord>,
    #[serde(flatten)]
    pub stats: RunStats,
    pub node_breakdown: Vec<NodeStats>,
    pub total_time_ms: u64,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SimulationRun {
    pub fn new(id: RunId, nodes: usize, transactions: usize, consensus_nodes: usize) -> Self {
        Self {
            id,
            requested_nodes: nodes,
            requested_transactions: transactions,
            total_nodes: nodes + consensus_nodes,
            state: RunState::Admitted,
            nodes: Vec::new(),
            transactions: Vec::new(),
            stats: RunStats::default(),
            node_breakdown: Vec::new(),
            total_time_ms: 0,
            finished: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == RunState::Admitted {
            self.state = RunState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Replace the transaction list and recompute aggregates from it.
    pub fn record_progress(&mut self, transactions: Vec<TransactionRecord>) {
        if self.finished {
            return;
        }
        self.stats = RunStats::from_records(&transactions);
        self.transactions = transactions;
    }

    /// Terminal transition. Returns false if the run was already sealed.
    pub fn seal(&mut self, error: Option<String>) -> bool {
        if self.finished {
            return false;
        }
        let now = Utc::now();
        self.state = if error.is_some() {
            RunState::Failed
        } else {
            RunState::Finished
        };
        self.error = error;
        self.finished = true;
        self.ended_at = Some(now);
        self.node_breakdown = node_breakdown(&self.transactions);
        let start = self.started_at.unwrap_or(self.created_at);
        self.total_time_ms = (now - start).num_milliseconds().max(0) as u64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: &str, amount: f64, elapsed_ms: u64, ok: bool) -> TransactionRecord {
        let outcome = if ok {
            Ok(String::new())
        } else {
            Err("transfer rejected".to_string())
        };
        TransactionRecord::pending("s", "r", amount, "memo", node)
            .finish(Duration::from_millis(elapsed_ms), outcome)
    }

    #[test]
    fn stats_ignore_pending_records() {
        let records = vec![
            record("node7", 3.0, 100, true),
            record("node8", 5.0, 300, false),
            TransactionRecord::pending("s", "r", 9.0, "memo", "node9"),
        ];
        let stats = RunStats::from_records(&records);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.min_elapsed_ms, 100);
        assert_eq!(stats.max_elapsed_ms, 300);
        assert_eq!(stats.avg_elapsed_ms, 200.0);
        assert_eq!(stats.total_value, 3.0);
    }

    #[test]
    fn finish_keeps_generated_id_without_tx_id() {
        let pending = TransactionRecord::pending("s", "r", 1.0, "memo", "node7");
        let id = pending.id.clone();
        let done = pending.finish(Duration::from_millis(5), Ok(String::new()));
        assert_eq!(done.id, id);
        assert_eq!(done.status, TxStatus::Success);

        let done = TransactionRecord::pending("s", "r", 1.0, "memo", "node7")
            .finish(Duration::from_millis(5), Ok("abc123".into()));
        assert_eq!(done.id, "abc123");
    }

    #[test]
    fn breakdown_groups_by_originating_node() {
        let records = vec![
            record("node7", 2.0, 10, true),
            record("node7", 4.0, 30, true),
            record("node8", 1.0, 50, false),
        ];
        let breakdown = node_breakdown(&records);
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].node_id, "node7");
        assert_eq!(breakdown[0].successful, 2);
        assert_eq!(breakdown[0].avg_elapsed_ms, 20.0);
        assert_eq!(breakdown[0].total_value, 6.0);
        assert_eq!(breakdown[1].failed, 1);
    }

    #[test]
    fn seal_happens_once() {
        let mut run = SimulationRun::new(Uuid::new_v4(), 2, 1, 7);
        assert_eq!(run.total_nodes, 9);
        run.mark_running();
        assert_eq!(run.state, RunState::Running);
        assert!(run.seal(None));
        assert!(!run.seal(Some("late".into())));
        assert_eq!(run.state, RunState::Finished);
        assert!(run.error.is_none());

        run.record_progress(vec![record("node7", 1.0, 1, true)]);
        assert!(run.transactions.is_empty());
    }

    #[test]
    fn short_identity() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789abcdefXYZ"), "0123456789abcdef");
    }
}
