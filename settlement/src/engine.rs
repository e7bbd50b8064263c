//! Main settlement engine
//!
//! Owns the ledger store and chain client handles and runs the reconciliation
//! loop and the inbound credit handler as two tasks on the runtime.
//!
//! `disconnect` stops and joins the tasks, which drops every clone of the
//! handles they held. The engine keeps the last ones, so dropping the engine
//! afterwards closes the Redis connection and the provider transport.

use crate::{
    chain::{ChainClient, EthChainClient},
    config::Config,
    inbound::InboundCreditHandler,
    ledger::{LedgerStore, RedisLedgerStore},
    metrics::Metrics,
    reconciliation::ReconciliationLoop,
    recovery::audit_open_reservations,
    worker::SettlementWorker,
    Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Extra time on top of the worker grace period before `disconnect` gives up
const STOP_SLACK: Duration = Duration::from_secs(5);

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Settlement engine
pub struct SettlementEngine {
    /// Ledger store handle
    ledger: Arc<dyn LedgerStore>,

    /// Chain client handle
    chain: Arc<dyn ChainClient>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,

    /// Background tasks, present between `start` and `disconnect`
    running: Option<Running>,
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("address", &self.chain.address())
            .field("config", &self.config)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl SettlementEngine {
    /// Create an engine over existing handles
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            chain,
            metrics,
            config,
            running: None,
        }
    }

    /// Open the Redis ledger and the Ethereum provider named by `config`
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;

        info!("Connecting to ledger store at {}", config.redis_url);
        let ledger = RedisLedgerStore::connect(
            &config.redis_url,
            config.asset_scale,
            config.scan_batch_size,
        )
        .await?;

        info!("Connecting to Ethereum provider at {}", config.provider_url);
        let chain = EthChainClient::connect(
            &config.provider_url,
            &config.private_key,
            config.asset_scale,
            config.block_poll_interval(),
        )
        .await?;

        let metrics = Metrics::new()?;
        Ok(Self::new(config, Arc::new(ledger), Arc::new(chain), metrics))
    }

    /// Engine's own network address
    pub fn address(&self) -> &str {
        self.chain.address()
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Whether the background tasks are running
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Audit open reservations, then start sweeping and crediting.
    ///
    /// The first sweep runs immediately.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidState("engine already started".to_string()));
        }

        info!("Starting settlement engine for {}", self.chain.address());

        audit_open_reservations(
            self.ledger.as_ref(),
            &self.metrics,
            self.config.reservation_safety_margin(),
        )
        .await?;

        let incoming = self.chain.subscribe_incoming(self.chain.address())?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Arc::new(SettlementWorker::new(
            self.ledger.clone(),
            self.chain.clone(),
            self.metrics.clone(),
            self.config.send_timeout(),
        ));
        let reconciliation = ReconciliationLoop::new(
            self.ledger.clone(),
            worker,
            self.metrics.clone(),
            self.config.min_settlement_amount,
            self.config.poll_interval(),
        );
        let inbound = InboundCreditHandler::new(
            self.ledger.clone(),
            self.metrics.clone(),
            self.chain.address(),
        );

        let tasks = vec![
            tokio::spawn(reconciliation.run(shutdown_rx.clone(), self.config.shutdown_grace())),
            tokio::spawn(inbound.run(incoming, shutdown_rx)),
        ];

        self.running = Some(Running { shutdown, tasks });
        info!("Settlement engine started");
        Ok(())
    }

    /// Stop the background tasks.
    ///
    /// In-flight settlements get the configured grace period. Whatever is
    /// still running after that is aborted and its reservation stays open.
    /// Returns once every task has finished, so the engine holds the only
    /// remaining ledger and chain handles.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(Running { shutdown, tasks }) = self.running.take() else {
            warn!("Settlement engine not running");
            return Ok(());
        };

        info!("Stopping settlement engine");
        // Receivers may already be gone if a task exited early
        let _ = shutdown.send(true);

        let deadline = self.config.shutdown_grace() + STOP_SLACK;
        for mut task in tasks {
            match tokio::time::timeout(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Engine task failed: {}", e),
                Err(_) => {
                    warn!("Engine task did not stop within {:?}, aborting", deadline);
                    task.abort();
                    // Joining an aborted task drops its captured handles
                    if let Err(e) = task.await {
                        if !e.is_cancelled() {
                            error!("Engine task failed: {}", e);
                        }
                    }
                }
            }
        }

        info!("Settlement engine stopped");
        Ok(())
    }
}
