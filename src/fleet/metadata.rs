use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::FleetError;
use crate::model::NodeProcess;

/// Persisted fleet description: node id to port pair, identity, role and
/// status. Lets a later process resume a fleet instead of bootstrapping.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Nodes ordered by index.
    pub async fn load(&self) -> Result<Vec<NodeProcess>, FleetError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FleetError::NoFleet(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let by_id: BTreeMap<String, NodeProcess> = serde_json::from_slice(&raw)?;
        let mut nodes: Vec<NodeProcess> = by_id.into_values().collect();
        nodes.sort_by_key(|n| n.index);
        Ok(nodes)
    }

    /// Write through a temp file so a crash never leaves half a file behind.
    pub async fn save<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeProcess>,
    ) -> Result<(), FleetError> {
        let by_id: BTreeMap<&str, &NodeProcess> =
            nodes.into_iter().map(|n| (n.id.as_str(), n)).collect();
        let encoded = serde_json::to_vec_pretty(&by_id)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), FleetError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeRole, NodeStatus};

    fn node(index: usize, role: NodeRole) -> NodeProcess {
        let mut node = NodeProcess::new(index, role, 20000 + index as u16, 10500 + index as u16);
        node.identity = format!("bafy{}", index);
        node.status = NodeStatus::Running;
        node
    }

    #[tokio::test]
    async fn round_trip_keeps_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("fleet").join("node_metadata.json"));
        // node10 sorts before node2 by id
        let nodes = vec![
            node(0, NodeRole::Consensus),
            node(2, NodeRole::Transaction),
            node(10, NodeRole::Transaction),
        ];
        store.save(&nodes).await.unwrap();
        assert!(store.exists().await);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, nodes);
    }

    #[tokio::test]
    async fn missing_file_is_no_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("node_metadata.json"));
        assert!(!store.exists().await);
        assert!(matches!(store.load().await, Err(FleetError::NoFleet(_))));
        store.remove().await.unwrap();
    }
}
