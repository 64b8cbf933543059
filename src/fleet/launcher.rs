use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Where and how to bring up one node process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub node_id: String,
    pub index: usize,
    pub port: u16,
    pub secondary_port: u16,
    pub work_dir: PathBuf,
}

/// A running node process. Owned exclusively by the fleet manager.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait NodeLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn NodeHandle>>;
}

/// Spawns the node executable as a child process, one working directory per
/// node, with stdout and stderr appended to `node.log` there.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    binary: PathBuf,
    support_files: Vec<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            support_files: Vec::new(),
        }
    }

    /// Files (keys, helper executables) copied into every working directory
    /// that lacks them.
    pub fn with_support_files(mut self, files: Vec<PathBuf>) -> Self {
        self.support_files = files;
        self
    }

    fn args(spec: &LaunchSpec) -> Vec<String> {
        vec![
            "run".into(),
            "-p".into(),
            spec.node_id.clone(),
            "-n".into(),
            spec.index.to_string(),
            "-s".into(),
            "-port".into(),
            spec.port.to_string(),
            "-testNet".into(),
            "-grpcPort".into(),
            spec.secondary_port.to_string(),
        ]
    }

    async fn stage(&self, work_dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(work_dir).await?;
        for file in &self.support_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = work_dir.join(name);
            if !tokio::fs::try_exists(&target).await? {
                debug!(file = %file.display(), dir = %work_dir.display(), "copying support file");
                tokio::fs::copy(file, &target).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn NodeHandle>> {
        self.stage(&spec.work_dir).await?;

        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.work_dir.join("node.log"))
            .await?
            .into_std()
            .await;
        let stderr = log.try_clone()?;

        let child = Command::new(&self.binary)
            .args(Self::args(spec))
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()?;

        info!(
            node = %spec.node_id,
            port = spec.port,
            secondary_port = spec.secondary_port,
            pid = ?child.id(),
            "spawned node process"
        );
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl NodeHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn kill(&mut self) -> io::Result<()> {
        match self.child.kill().await {
            // already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}
