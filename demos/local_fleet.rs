// demos/local_fleet.rs
//
// Runs a full simulation against an in-process ledger: every "node" is a
// few entries in a shared map, transfers take a random 50-400ms.

use async_trait::async_trait;
use ledger_fleet_simulator::report::format_duration;
use ledger_fleet_simulator::*;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Default)]
struct LocalLedger {
    inner: Arc<Mutex<Ledger>>,
}

#[derive(Default)]
struct Ledger {
    up: HashMap<u16, bool>,
    balances: HashMap<String, f64>,
    topology: HashMap<u16, Vec<String>>,
    next_tx: u64,
}

impl LocalLedger {
    fn check(&self, port: u16) -> Result<(), NodeClientError> {
        if self.inner.lock().up.get(&port).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(NodeClientError::Status {
                status: 503,
                body: "node down".into(),
            })
        }
    }
}

struct LocalProcess {
    ledger: LocalLedger,
    port: u16,
}

#[async_trait]
impl NodeHandle for LocalProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.ledger.inner.lock().up.insert(self.port, false);
        Ok(())
    }
}

#[async_trait]
impl NodeLauncher for LocalLedger {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn NodeHandle>> {
        self.inner.lock().up.insert(spec.port, true);
        Ok(Box::new(LocalProcess {
            ledger: self.clone(),
            port: spec.port,
        }))
    }
}

impl ClientFactory for LocalLedger {
    fn client(&self, port: u16) -> Arc<dyn NodeApi> {
        Arc::new(LocalNode {
            ledger: self.clone(),
            port,
        })
    }
}

struct LocalNode {
    ledger: LocalLedger,
    port: u16,
}

#[async_trait]
impl NodeApi for LocalNode {
    async fn start(&self) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)
    }

    async fn shutdown(&self) -> Result<(), NodeClientError> {
        self.ledger.inner.lock().up.insert(self.port, false);
        Ok(())
    }

    async fn status(&self) -> Result<bool, NodeClientError> {
        Ok(self.ledger.check(self.port).is_ok())
    }

    async fn ping(&self) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)
    }

    async fn create_identity(&self, _password: &str) -> Result<CreatedIdentity, NodeClientError> {
        self.ledger.check(self.port)?;
        let identity = format!("bafylocal{}", self.port);
        self.ledger.inner.lock().balances.insert(identity.clone(), 0.0);
        Ok(CreatedIdentity {
            identity,
            peer_id: format!("12D3Local{}", self.port),
        })
    }

    async fn register_identity(&self, _identity: &str, _password: &str) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)
    }

    async fn configure_topology(&self, consensus: &[String]) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)?;
        self.ledger.inner.lock().topology.insert(self.port, consensus.to_vec());
        Ok(())
    }

    async fn get_topology(&self) -> Result<Vec<String>, NodeClientError> {
        self.ledger.check(self.port)?;
        Ok(self.ledger.inner.lock().topology.get(&self.port).cloned().unwrap_or_default())
    }

    async fn setup_consensus_role(&self, _identity: &str, _password: &str, _key_password: &str) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)
    }

    async fn get_balance(&self, identity: &str) -> Result<f64, NodeClientError> {
        self.ledger.check(self.port)?;
        self.ledger
            .inner
            .lock()
            .balances
            .get(identity)
            .copied()
            .ok_or_else(|| NodeClientError::MissingAccount(identity.to_string()))
    }

    async fn request_funding(&self, identity: &str, units: u32, _password: &str) -> Result<(), NodeClientError> {
        self.ledger.check(self.port)?;
        *self.ledger.inner.lock().balances.entry(identity.to_string()).or_default() += f64::from(units);
        Ok(())
    }

    async fn initiate_transfer(
        &self,
        sender: &str,
        receiver: &str,
        amount: f64,
        _memo: &str,
        _password: &str,
    ) -> Result<String, NodeClientError> {
        self.ledger.check(self.port)?;
        let latency = Duration::from_millis(thread_rng().gen_range(50..400));
        sleep(latency).await;

        let mut ledger = self.ledger.inner.lock();
        let available = ledger.balances.get(sender).copied().unwrap_or(0.0);
        if available < amount {
            return Err(NodeClientError::Rejected {
                operation: "initiate-rbt-transfer",
                message: "insufficient balance".into(),
            });
        }
        ledger.balances.insert(sender.to_string(), available - amount);
        *ledger.balances.entry(receiver.to_string()).or_default() += amount;
        ledger.next_tx += 1;
        Ok(format!("{:016x}", ledger.next_tx))
    }

    async fn peer_count(&self) -> Result<usize, NodeClientError> {
        self.ledger.check(self.port)?;
        Ok(self.ledger.inner.lock().up.values().filter(|up| **up).count().saturating_sub(1))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,ledger_fleet_simulator=info")),
        )
        .init();

    let dir = std::env::temp_dir().join(format!("local-fleet-{}", std::process::id()));
    let config = Arc::new(SimulatorConfig {
        data_dir: dir.join("fleet"),
        reports_dir: dir.join("reports"),
        node_boot_grace_secs: 0,
        funding_poll_interval_secs: 1,
        registration_settle_ms: 200,
        ..SimulatorConfig::default()
    });

    let ledger = LocalLedger::default();
    let fleet = Arc::new(FleetManager::new(
        config.clone(),
        Arc::new(ledger.clone()),
        Arc::new(ledger.clone()),
    ));
    let reports = Arc::new(JsonReportWriter::new(&config.reports_dir));
    let orchestrator = Orchestrator::new(config.clone(), fleet.clone(), Arc::new(ledger), reports.clone());

    println!("Local ledger fleet");
    println!("==================");
    println!("{} consensus nodes, 4 transaction nodes, 12 transfers\n", config.consensus_node_count);

    let id = orchestrator.start(4, 12)?;
    let run = orchestrator.wait_for(&id, Duration::from_millis(250)).await?;

    for tx in &run.transactions {
        println!(
            "  {:<8} {:>7.3}  {:>6}ms  {}",
            format!("{:?}", tx.status).to_lowercase(),
            tx.amount,
            tx.elapsed_ms,
            tx.memo
        );
    }
    println!(
        "\n{} succeeded, {} failed, avg {:.0}ms, total value {:.3}, took {}",
        run.stats.success_count,
        run.stats.failure_count,
        run.stats.avg_elapsed_ms,
        run.stats.total_value,
        format_duration(Duration::from_millis(run.total_time_ms))
    );

    // the report is written in the background
    sleep(Duration::from_millis(200)).await;
    println!("report: {}", reports.path_for(&run).display());

    fleet.stop_fleet().await?;
    Ok(())
}
