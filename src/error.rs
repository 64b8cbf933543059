use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::RunId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures of a single call against one node's HTTP surface.
#[derive(Error, Debug)]
pub enum NodeClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("node answered {status}: {body}")]
    Status { status: u16, body: String },

    /// The node understood the request and refused it.
    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    #[error("malformed response from {operation}: {detail}")]
    Decode {
        operation: &'static str,
        detail: String,
    },

    #[error("node not ready after {0:?}")]
    Timeout(Duration),

    #[error("no account info for identity {0}")]
    MissingAccount(String),
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("transaction node count {requested} outside {min}..={max}")]
    InvalidNodeCount {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("failed to launch {node}: {source}")]
    Launch {
        node: String,
        #[source]
        source: std::io::Error,
    },

    /// A node could not complete a mandatory bootstrap step.
    #[error("bootstrap failed at {node}: {source}")]
    Bootstrap {
        node: String,
        #[source]
        source: NodeClientError,
    },

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("no fleet metadata at {0}")]
    NoFleet(PathBuf),

    #[error("failed to restart nodes: {0:?}")]
    RestartFailed(Vec<String>),

    #[error("fleet metadata io: {0}")]
    Io(#[from] std::io::Error),

    #[error("fleet metadata encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("insufficient transaction nodes: {0} (need minimum 2)")]
    InsufficientNodes(usize),

    #[error("no transactions were executed")]
    NothingExecuted,
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("transaction node count must be between {min} and {max}, got {requested}")]
    InvalidNodeCount {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("transaction count must be between {min} and {max}, got {requested}")]
    InvalidTransactionCount {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("all servers are busy, please try again after some time")]
    Busy,

    #[error("simulation {0} not found")]
    NotFound(RunId),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl SimulationError {
    /// Caller mistakes, as opposed to failures of the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SimulationError::InvalidNodeCount { .. }
                | SimulationError::InvalidTransactionCount { .. }
        )
    }
}
