use crate::model::{NodeProcess, NodeRole};

/// How an existing fleet must change to hold `requested` transaction nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RescalePlan {
    Noop,
    /// Append `add` transaction nodes starting at `next_index`.
    ScaleUp { add: usize, next_index: usize },
    /// Stop and drop these transaction nodes, highest index first.
    ScaleDown { remove: Vec<String> },
}

/// Consensus nodes never appear in a scale-down.
pub fn plan_rescale(existing: &[NodeProcess], requested: usize) -> RescalePlan {
    let mut transaction: Vec<&NodeProcess> = existing
        .iter()
        .filter(|n| n.role == NodeRole::Transaction)
        .collect();
    let current = transaction.len();

    if requested == current {
        return RescalePlan::Noop;
    }

    if requested > current {
        let next_index = existing.iter().map(|n| n.index + 1).max().unwrap_or(0);
        return RescalePlan::ScaleUp {
            add: requested - current,
            next_index,
        };
    }

    transaction.sort_by(|a, b| b.index.cmp(&a.index));
    RescalePlan::ScaleDown {
        remove: transaction
            .into_iter()
            .take(current - requested)
            .map(|n| n.id.clone())
            .collect(),
    }
}
