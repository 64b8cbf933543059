//! Control plane for a local fleet of ledger nodes: launches and bootstraps
//! the nodes, schedules conflict-free transfer rounds across them and tracks
//! simulation runs end to end.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod scheduler;

pub use backoff::Backoff;
pub use client::{ClientFactory, CreatedIdentity, HttpClientFactory, NodeApi, NodeClient};
pub use config::{MonitorConfig, SimulatorConfig};
pub use error::{ConfigError, FleetError, NodeClientError, ScheduleError, SimulationError};
pub use fleet::{
    BootstrapSummary, FleetManager, LaunchSpec, MetadataStore, NodeHandle, NodeLauncher,
    ProcessLauncher, Reservation,
};
pub use model::{
    NodeProcess, NodeRole, NodeStats, NodeStatus, RunId, RunState, RunStats, SimulationRun,
    TransactionRecord, TxStatus,
};
pub use monitor::{FleetMonitor, TickOutcome};
pub use orchestrator::Orchestrator;
pub use report::{JsonReportWriter, ReportSink};
pub use scheduler::{RoundProgress, RoundScheduler};
