use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::model::SimulationRun;

/// Consumer of sealed runs.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Returns where the artifact was written.
    async fn write(&self, run: &SimulationRun) -> io::Result<PathBuf>;
}

/// Writes each sealed run as `simulation-<id>.json`.
#[derive(Clone, Debug)]
pub struct JsonReportWriter {
    dir: PathBuf,
}

impl JsonReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run: &SimulationRun) -> PathBuf {
        self.dir.join(format!("simulation-{}.json", run.id))
    }

    /// Report files in the directory, newest name last.
    pub async fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reports = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_report = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("simulation-") && n.ends_with(".json"));
            if is_report {
                reports.push(path);
            }
        }
        reports.sort();
        Ok(reports)
    }
}

#[async_trait]
impl ReportSink for JsonReportWriter {
    async fn write(&self, run: &SimulationRun) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run);
        let encoded = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&path, encoded).await?;
        info!(run = %run.id, path = %path.display(), "report written");
        Ok(path)
    }
}

/// `850ms`, `45s`, `2m`, `1m10s`.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }
    let minutes = d.as_secs() / 60;
    let seconds = d.as_secs() % 60;
    match (minutes, seconds) {
        (0, s) => format!("{}s", s),
        (m, 0) => format!("{}m", m),
        (m, s) => format!("{}m{}s", m, s),
    }
}
