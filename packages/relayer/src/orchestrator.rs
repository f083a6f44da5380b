//! Relay orchestrator
//!
//! Runs the mint and release pipelines as independent workers. Each pipeline
//! owns one reader and drives its transfers through the state machine:
//!
//! - ingest: read a final batch, create transfers through the ledger, then
//!   acknowledge the batch so the cursor moves
//! - dispatch: walk active transfers in event order, submit under the
//!   per-chain admission cap, and hand submitted transfers to background
//!   finalizers that wait for confirmation depth
//!
//! The dispatch scan is head-of-line: a transfer still backing off holds back
//! the transfers after it, so first submissions follow event order.

use alloy::primitives::{Address, B256};
use eyre::{eyre, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::config::Config;
use crate::db::{RelayStore, ACTIVE_STATUSES};
use crate::dispatcher::ActionDispatcher;
use crate::error::{DispatchError, TransitionError};
use crate::metrics;
use crate::quorum::{Attestor, QuorumPolicy, SignatureCollector};
use crate::reader::ChainLogReader;
use crate::retry::RetryConfig;
use crate::state::TransferStateMachine;
use crate::types::{Direction, EventKind, Transfer, TransferId, TransferStatus};

/// Pipeline tuning shared by both directions
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub confirmation_depth: u64,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub retry: RetryConfig,
    /// Admission cap on submissions awaiting confirmation, per destination chain
    pub max_in_flight_per_chain: usize,
    pub confirmation_timeout: Duration,
    pub source_genesis_block: u64,
    pub dest_genesis_block: u64,
    /// Required attestations; 0 dispatches on the relayer's own observation
    pub quorum_threshold: usize,
    pub quorum_validators: Vec<Address>,
    /// How long shutdown waits for in-flight confirmations
    pub shutdown_grace: Duration,
    /// Active transfers examined per dispatch scan
    pub dispatch_batch: usize,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confirmation_depth: config.relayer.confirmation_depth,
            poll_interval: config.relayer.poll_interval(),
            max_block_range: config.relayer.max_block_range,
            retry: config.relayer.retry_config(),
            max_in_flight_per_chain: config.relayer.max_in_flight_per_chain,
            confirmation_timeout: config.relayer.confirmation_timeout(),
            source_genesis_block: config.source.genesis_block,
            dest_genesis_block: config.destination.genesis_block,
            quorum_threshold: config.quorum.threshold,
            quorum_validators: config.quorum.validators.clone(),
            shutdown_grace: Duration::from_secs(30),
            dispatch_batch: 100,
        }
    }
}

enum Flow {
    /// Move on to the next transfer in the scan
    Continue,
    /// End the scan; later transfers wait for the next tick
    Stop,
}

/// Continue past terminal failures, stop behind a transfer that will retry
fn flow_after_failure(transfer: &Transfer) -> Flow {
    if transfer.status == TransferStatus::Failed {
        Flow::Stop
    } else {
        Flow::Continue
    }
}

fn is_conflict(e: &eyre::Report) -> bool {
    matches!(
        e.downcast_ref::<TransitionError>(),
        Some(TransitionError::Conflict { .. })
    )
}

/// One direction of the relay: reader, state machine and dispatcher
pub struct DirectionPipeline {
    direction: Direction,
    reader: ChainLogReader,
    machine: TransferStateMachine,
    dispatcher: Arc<ActionDispatcher>,
    collector: Option<SignatureCollector>,
    admission: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<TransferId>>>,
    finalizers: JoinSet<()>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    dispatch_batch: usize,
}

impl DirectionPipeline {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// One pass: reap finished confirmations, ingest a batch, dispatch
    ///
    /// Returns true when a batch was ingested, meaning the reader may still
    /// be behind the safe tip.
    pub async fn tick(&mut self) -> Result<bool> {
        self.reap();
        let ingested = self.poll_and_ingest().await?;
        self.dispatch_ready().await?;
        Ok(ingested)
    }

    fn reap(&mut self) {
        while let Some(joined) = self.finalizers.try_join_next() {
            if let Err(e) = joined {
                error!(direction = %self.direction, error = %e, "Finalizer task failed");
            }
        }
    }

    async fn poll_and_ingest(&mut self) -> Result<bool> {
        let Some(batch) = self.reader.next_batch().await else {
            return Ok(false);
        };

        for event in &batch.events {
            // a failure leaves the cursor in place, so the batch is read again
            self.machine.observe(event.clone()).await?;
        }
        self.reader.acknowledge(&batch).await?;
        Ok(true)
    }

    async fn dispatch_ready(&mut self) -> Result<()> {
        let now = chrono::Utc::now();
        let transfers = self
            .machine
            .store()
            .transfers_with_status(Some(self.direction), &ACTIVE_STATUSES, self.dispatch_batch)
            .await?;

        for mut transfer in transfers {
            if self.in_flight.lock().await.contains(&transfer.transfer_id) {
                continue;
            }
            if !transfer.is_due(now) {
                break;
            }
            match self.advance(&mut transfer).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) if is_conflict(&e) => {
                    debug!(transfer_id = %transfer.transfer_id, error = %e, "Transfer moved concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn advance(&mut self, transfer: &mut Transfer) -> Result<Flow> {
        loop {
            match transfer.status {
                TransferStatus::Observed | TransferStatus::Failed => {
                    // signatures are already in place once a submission exists
                    if self.collector.is_some() && transfer.submission.is_none() {
                        self.machine.begin_collecting(transfer).await?;
                    } else {
                        self.machine.begin_dispatch(transfer).await?;
                    }
                }
                TransferStatus::CollectingSignatures => {
                    let Some(collector) = &self.collector else {
                        self.machine.begin_dispatch(transfer).await?;
                        continue;
                    };
                    let shortfall = match collector.collect(transfer).await {
                        Ok(count) if count >= collector.threshold() => None,
                        Ok(count) => Some(DispatchError::Transient(format!(
                            "{} of {} attestations",
                            count,
                            collector.threshold()
                        ))),
                        Err(e) => Some(e),
                    };
                    match shortfall {
                        None => self.machine.begin_dispatch(transfer).await?,
                        Some(cause) => {
                            self.machine.fail(transfer, &cause).await?;
                            return Ok(flow_after_failure(transfer));
                        }
                    }
                }
                TransferStatus::Dispatching => return self.launch(transfer).await,
                TransferStatus::Confirmed | TransferStatus::DeadLettered | TransferStatus::Flagged => {
                    return Ok(Flow::Continue)
                }
            }
        }
    }

    /// Submit under the admission cap and start waiting for confirmation
    async fn launch(&mut self, transfer: &mut Transfer) -> Result<Flow> {
        let Ok(permit) = self.admission.clone().try_acquire_owned() else {
            debug!(
                direction = %self.direction,
                transfer_id = %transfer.transfer_id,
                "Admission cap reached, deferring submission"
            );
            return Ok(Flow::Stop);
        };

        match self.dispatcher.submit(transfer).await {
            Ok(tx_hash) => {
                self.spawn_finalizer(transfer.clone(), tx_hash, permit).await;
                Ok(Flow::Continue)
            }
            Err(cause) => {
                drop(permit);
                self.machine.fail(transfer, &cause).await?;
                Ok(flow_after_failure(transfer))
            }
        }
    }

    async fn spawn_finalizer(
        &mut self,
        mut transfer: Transfer,
        tx_hash: B256,
        permit: OwnedSemaphorePermit,
    ) {
        let chain = self.dispatcher.target().name().to_string();
        let in_flight = self.in_flight.clone();
        {
            let mut set = in_flight.lock().await;
            set.insert(transfer.transfer_id);
            metrics::set_in_flight(&chain, set.len());
        }

        let dispatcher = self.dispatcher.clone();
        self.finalizers.spawn(async move {
            let _permit = permit;
            if let Err(e) = dispatcher.finalize(&mut transfer, tx_hash).await {
                if is_conflict(&e) {
                    debug!(transfer_id = %transfer.transfer_id, error = %e, "Transfer finalized elsewhere");
                } else {
                    error!(transfer_id = %transfer.transfer_id, error = %e, "Failed to record outcome");
                }
            }
            let mut set = in_flight.lock().await;
            set.remove(&transfer.transfer_id);
            metrics::set_in_flight(&chain, set.len());
        });
    }

    /// Wait for every running finalizer
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.finalizers.join_next().await {
            if let Err(e) = joined {
                error!(direction = %self.direction, error = %e, "Finalizer task failed");
            }
        }
    }

    async fn drain(&mut self) {
        let pending = self.finalizers.len();
        if pending == 0 {
            return;
        }
        info!(direction = %self.direction, pending, "Waiting for in-flight confirmations");
        if tokio::time::timeout(self.shutdown_grace, self.wait_idle()).await.is_err() {
            warn!(
                direction = %self.direction,
                remaining = self.finalizers.len(),
                "Grace period elapsed; remaining transfers stay dispatching and resume on restart"
            );
            self.finalizers.abort_all();
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            direction = %self.direction,
            chain = %self.reader.chain_name(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Pipeline starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.tick() => outcome,
            };

            let idle = match outcome {
                Ok(ingested) => !ingested,
                Err(e) => {
                    error!(direction = %self.direction, error = %e, "Pipeline pass failed");
                    metrics::record_error(self.reader.chain_name(), "pipeline");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(direction = %self.direction, "Shutdown signal received, stopping pipeline");
        self.drain().await;
        Ok(())
    }
}

pub struct RelayOrchestrator {
    source: Arc<dyn ChainClient>,
    destination: Arc<dyn ChainClient>,
    mint: DirectionPipeline,
    release: DirectionPipeline,
}

impl RelayOrchestrator {
    /// Wire both pipelines
    ///
    /// `source` hosts the vault and `destination` the wrapped token bridge.
    /// Each chain gets one nonce lock and one admission semaphore, shared by
    /// everything that submits to it.
    pub fn new(
        settings: RelaySettings,
        source: Arc<dyn ChainClient>,
        destination: Arc<dyn ChainClient>,
        store: Arc<dyn RelayStore>,
        attestors: Vec<Arc<dyn Attestor>>,
    ) -> Self {
        let machine = TransferStateMachine::new(store.clone(), settings.retry.clone());

        let mint = Self::pipeline(
            &settings,
            EventKind::Locked,
            source.clone(),
            destination.clone(),
            settings.source_genesis_block,
            &store,
            &machine,
            &attestors,
        );
        let release = Self::pipeline(
            &settings,
            EventKind::Burned,
            destination.clone(),
            source.clone(),
            settings.dest_genesis_block,
            &store,
            &machine,
            &attestors,
        );

        Self {
            source,
            destination,
            mint,
            release,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline(
        settings: &RelaySettings,
        kind: EventKind,
        origin: Arc<dyn ChainClient>,
        target: Arc<dyn ChainClient>,
        genesis_block: u64,
        store: &Arc<dyn RelayStore>,
        machine: &TransferStateMachine,
        attestors: &[Arc<dyn Attestor>],
    ) -> DirectionPipeline {
        let reader = ChainLogReader::new(
            origin.clone(),
            store.clone(),
            kind,
            genesis_block,
            settings.confirmation_depth,
            settings.max_block_range,
            settings.retry.clone(),
        );
        let dispatcher = ActionDispatcher::new(
            target,
            origin,
            machine.clone(),
            Arc::new(Mutex::new(())),
            settings.confirmation_depth,
            settings.confirmation_timeout,
            settings.poll_interval,
        );
        let collector = (settings.quorum_threshold > 0).then(|| {
            SignatureCollector::new(
                store.clone(),
                attestors.to_vec(),
                QuorumPolicy {
                    threshold: settings.quorum_threshold,
                    validators: settings.quorum_validators.clone(),
                },
            )
        });

        DirectionPipeline {
            direction: kind.direction(),
            reader,
            machine: machine.clone(),
            dispatcher: Arc::new(dispatcher),
            collector,
            admission: Arc::new(Semaphore::new(settings.max_in_flight_per_chain.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            finalizers: JoinSet::new(),
            poll_interval: settings.poll_interval,
            shutdown_grace: settings.shutdown_grace,
            dispatch_batch: settings.dispatch_batch.max(1),
        }
    }

    /// Refuse to start unless both contracts accept the local signer
    pub async fn verify_authorization(&self) -> Result<()> {
        for chain in [&self.source, &self.destination] {
            let authorized = chain
                .authorized_relayer()
                .await
                .map_err(|e| eyre!("{}: failed to read authorized relayer: {}", chain.name(), e))?;
            let local = chain.relayer_address();
            if authorized != local {
                error!(
                    chain = %chain.name(),
                    authorized = %authorized,
                    local = %local,
                    "Relayer identity mismatch"
                );
                return Err(eyre!(
                    "{}: contract authorizes {} but the local signer is {}",
                    chain.name(),
                    authorized,
                    local
                ));
            }
            info!(chain = %chain.name(), relayer = %local, "Relayer authorization verified");
        }
        Ok(())
    }

    /// One pass of both pipelines
    pub async fn tick(&mut self) -> Result<()> {
        self.mint.tick().await?;
        self.release.tick().await?;
        Ok(())
    }

    pub async fn wait_idle(&mut self) {
        self.mint.wait_idle().await;
        self.release.wait_idle().await;
    }

    /// Run both pipelines until `shutdown` flips to true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut workers = JoinSet::new();
        workers.spawn(self.mint.run(shutdown.clone()));
        workers.spawn(self.release.run(shutdown));

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Pipeline stopped with error");
                    outcome = Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Pipeline task panicked");
                    outcome = Err(eyre!("pipeline task panicked: {}", e));
                }
            }
        }
        info!("Relay orchestrator stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::quorum::LocalAttestor;
    use crate::testing::{SimulatedChain, OWNER, RELAYER, USER};
    use crate::types::FailureKind;
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;

    fn settings() -> RelaySettings {
        RelaySettings {
            confirmation_depth: 2,
            poll_interval: Duration::from_millis(1),
            max_block_range: 50,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                ..Default::default()
            },
            max_in_flight_per_chain: 4,
            confirmation_timeout: Duration::from_secs(5),
            source_genesis_block: 0,
            dest_genesis_block: 0,
            quorum_threshold: 0,
            quorum_validators: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
            dispatch_batch: 100,
        }
    }

    struct Harness {
        source: Arc<SimulatedChain>,
        dest: Arc<SimulatedChain>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let source = Arc::new(SimulatedChain::source(1, 2));
            let dest = Arc::new(SimulatedChain::destination(2, 1));
            source.set_auto_mine(true);
            dest.set_auto_mine(true);
            Self {
                source,
                dest,
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn orchestrator(&self, settings: RelaySettings, attestors: Vec<Arc<dyn Attestor>>) -> RelayOrchestrator {
            RelayOrchestrator::new(
                settings,
                self.source.clone(),
                self.dest.clone(),
                self.store.clone(),
                attestors,
            )
        }

        fn statuses(&self) -> Vec<TransferStatus> {
            self.store.all_transfers().iter().map(|t| t.status).collect()
        }
    }

    /// Tick until `done` holds, failing the test after a bounded number of passes
    async fn drive(orchestrator: &mut RelayOrchestrator, mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            orchestrator.tick().await.unwrap();
            orchestrator.wait_idle().await;
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("relay did not settle");
    }

    fn validator_key(byte: u8) -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&B256::repeat_byte(byte)).unwrap()
    }

    #[tokio::test]
    async fn test_lock_is_minted_once_confirmed() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();

        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        assert_eq!(h.dest.balance_of(USER), U256::from(100u64));
        assert_eq!(h.dest.total_supply(), U256::from(100u64));
        assert_eq!(h.source.vault_locked(), U256::from(100u64));
        let transfer = &h.store.all_transfers()[0];
        assert_eq!(transfer.direction, Direction::LockToMint);
        assert!(transfer.resulting_tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_burn_is_released() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        drive(&mut orchestrator, || h.dest.balance_of(USER) == U256::from(100u64)).await;

        h.dest.burn(USER, U256::from(100u64), USER).unwrap();
        drive(&mut orchestrator, || {
            h.statuses() == vec![TransferStatus::Confirmed, TransferStatus::Confirmed]
        })
        .await;

        assert_eq!(h.source.balance_of(USER), U256::from(100u64));
        assert_eq!(h.source.vault_locked(), U256::ZERO);
        assert_eq!(h.dest.total_supply(), U256::ZERO);
        assert_eq!(h.dest.balance_of(USER), U256::ZERO);
    }

    #[tokio::test]
    async fn test_redelivered_events_mint_once() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        // lose the cursors so the readers rescan from genesis
        h.store.forget_cursors();
        let mut restarted = h.orchestrator(settings(), Vec::new());
        for _ in 0..10 {
            restarted.tick().await.unwrap();
            restarted.wait_idle().await;
        }

        assert_eq!(h.store.all_transfers().len(), 1);
        assert_eq!(h.dest.total_supply(), U256::from(100u64));
        assert_eq!(h.dest.broadcast_count(), 1);
    }

    /// Run until the mint is submitted, then drop the orchestrator mid-flight
    async fn crash_after_submission(h: &Harness) {
        h.dest.set_auto_mine(false);
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        for _ in 0..50 {
            orchestrator.tick().await.unwrap();
            if h.dest.mempool_len() == 1 {
                break;
            }
        }
        assert_eq!(h.dest.mempool_len(), 1);
        drop(orchestrator);

        let transfer = &h.store.all_transfers()[0];
        assert_eq!(transfer.status, TransferStatus::Dispatching);
        assert!(transfer.submission.is_some());
    }

    #[tokio::test]
    async fn test_restart_waits_on_pending_submission() {
        let h = Harness::new();
        crash_after_submission(&h).await;

        h.dest.set_auto_mine(true);
        let mut restarted = h.orchestrator(settings(), Vec::new());
        drive(&mut restarted, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        assert_eq!(h.dest.broadcast_count(), 1);
        assert_eq!(h.dest.total_supply(), U256::from(100u64));
    }

    #[tokio::test]
    async fn test_restart_completes_already_included_submission() {
        let h = Harness::new();
        crash_after_submission(&h).await;

        // the transaction lands while the relayer is down
        h.dest.mine(5);
        assert_eq!(h.dest.total_supply(), U256::from(100u64));

        let mut restarted = h.orchestrator(settings(), Vec::new());
        drive(&mut restarted, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        assert_eq!(h.dest.broadcast_count(), 1);
        assert_eq!(h.dest.total_supply(), U256::from(100u64));
    }

    #[tokio::test]
    async fn test_minted_never_exceeds_locked() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.source.fund(USER, U256::from(1_000u64));

        for amount in [100u64, 250, 50] {
            h.source.lock(USER, U256::from(amount), USER).unwrap();
            h.source.mine(1);
        }
        let mut burned = false;
        for _ in 0..200 {
            orchestrator.tick().await.unwrap();
            assert!(h.dest.total_supply() <= h.source.vault_locked());
            if !burned && h.dest.balance_of(USER) >= U256::from(150u64) {
                h.dest.burn(USER, U256::from(150u64), USER).unwrap();
                burned = true;
            }
            orchestrator.wait_idle().await;
            assert!(h.dest.total_supply() <= h.source.vault_locked());
            if burned && h.statuses().iter().all(|s| *s == TransferStatus::Confirmed) && h.statuses().len() == 4 {
                break;
            }
        }

        assert_eq!(h.statuses().len(), 4);
        assert_eq!(h.source.vault_locked(), U256::from(250u64));
        assert_eq!(h.dest.total_supply(), U256::from(250u64));
        assert_eq!(h.source.balance_of(USER), U256::from(750u64));
    }

    #[tokio::test]
    async fn test_admission_cap_limits_in_flight_submissions() {
        let h = Harness::new();
        h.dest.set_auto_mine(false);
        let mut orchestrator = h.orchestrator(
            RelaySettings {
                max_in_flight_per_chain: 1,
                confirmation_timeout: Duration::from_secs(30),
                ..settings()
            },
            Vec::new(),
        );
        h.source.fund(USER, U256::from(300u64));
        for _ in 0..3 {
            h.source.lock(USER, U256::from(100u64), USER).unwrap();
            h.source.mine(1);
        }

        for _ in 0..10 {
            orchestrator.tick().await.unwrap();
        }
        assert_eq!(h.store.all_transfers().len(), 3);
        assert_eq!(h.dest.mempool_len(), 1);
        let submitted: Vec<_> = h
            .store
            .all_transfers()
            .into_iter()
            .filter(|t| t.submission.is_some())
            .collect();
        assert_eq!(submitted.len(), 1);
        // the earliest event goes first
        assert_eq!(submitted[0].event.id.block_number, h.store.all_transfers()[0].event.id.block_number);

        h.dest.set_auto_mine(true);
        drive(&mut orchestrator, || {
            h.statuses().iter().filter(|s| **s == TransferStatus::Confirmed).count() == 3
        })
        .await;

        let mut nonces: Vec<u64> = h
            .store
            .all_transfers()
            .iter()
            .filter_map(|t| t.submission.as_ref().map(|s| s.nonce))
            .collect();
        let in_event_order = nonces.clone();
        nonces.sort_unstable();
        assert_eq!(in_event_order, nonces);
        assert_eq!(h.dest.total_supply(), U256::from(300u64));
    }

    #[tokio::test]
    async fn test_quorum_gates_dispatch() {
        let h = Harness::new();
        let validators: Vec<Address> = (1..=3).map(|b| validator_key(b).address()).collect();
        let chains: Vec<Arc<dyn ChainClient>> = vec![h.source.clone(), h.dest.clone()];
        let attestor = |byte: u8| -> Arc<dyn Attestor> {
            Arc::new(LocalAttestor::new(validator_key(byte), chains.clone()))
        };
        let quorum = RelaySettings {
            quorum_threshold: 2,
            quorum_validators: validators,
            ..settings()
        };

        // one reachable validator cannot reach a 2-of-3 quorum
        let mut starved = h.orchestrator(quorum.clone(), vec![attestor(1)]);
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        drive(&mut starved, || h.statuses() == vec![TransferStatus::DeadLettered]).await;
        assert_eq!(h.dest.broadcast_count(), 0);
        assert_eq!(h.dest.total_supply(), U256::ZERO);

        // an operator requeues once a second validator is back
        let id = h.store.all_transfers()[0].transfer_id;
        TransferStateMachine::new(h.store.clone(), quorum.retry.clone())
            .requeue(id)
            .await
            .unwrap();
        let mut healthy = h.orchestrator(quorum, vec![attestor(1), attestor(2)]);
        drive(&mut healthy, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        assert_eq!(h.dest.total_supply(), U256::from(100u64));
        assert_eq!(h.store.attestations(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refuses_to_start_with_foreign_relayer() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(settings(), Vec::new());
        orchestrator.verify_authorization().await.unwrap();

        h.dest.set_relayer(OWNER, Address::repeat_byte(0x77)).unwrap();
        assert!(orchestrator.verify_authorization().await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_mint_leaves_lock_untouched() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        h.dest.set_relayer(OWNER, Address::repeat_byte(0x77)).unwrap();
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();

        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::DeadLettered]).await;

        let transfer = &h.store.all_transfers()[0];
        assert_eq!(transfer.failure_kind, Some(FailureKind::ChainRejection));
        assert!(transfer.last_error.is_some());
        assert_eq!(h.source.vault_locked(), U256::from(100u64));
        assert_eq!(h.dest.total_supply(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_requeue_after_reverted_mint_confirms() {
        let h = Harness::new();
        crash_after_submission(&h).await;

        // the relayer is rotated away while the mint sits in the mempool
        h.dest.set_relayer(OWNER, Address::repeat_byte(0x77)).unwrap();
        h.dest.mine(5);
        let mut orchestrator = h.orchestrator(settings(), Vec::new());
        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::DeadLettered]).await;
        assert_eq!(h.store.all_transfers()[0].failure_kind, Some(FailureKind::ChainRejection));
        assert_eq!(h.dest.total_supply(), U256::ZERO);

        h.dest.set_relayer(OWNER, RELAYER).unwrap();
        h.dest.set_auto_mine(true);
        let id = h.store.all_transfers()[0].transfer_id;
        TransferStateMachine::new(h.store.clone(), settings().retry)
            .requeue(id)
            .await
            .unwrap();
        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::Confirmed]).await;

        assert_eq!(h.dest.total_supply(), U256::from(100u64));
        assert_eq!(h.dest.balance_of(USER), U256::from(100u64));
        assert_eq!(h.dest.broadcast_count(), 2);
    }

    #[tokio::test]
    async fn test_quorum_flags_vanished_event() {
        let h = Harness::new();
        let chains: Vec<Arc<dyn ChainClient>> = vec![h.source.clone(), h.dest.clone()];
        let attestor: Arc<dyn Attestor> = Arc::new(LocalAttestor::new(validator_key(1), chains));
        let mut orchestrator = h.orchestrator(
            RelaySettings {
                quorum_threshold: 1,
                quorum_validators: vec![validator_key(1).address()],
                ..settings()
            },
            vec![attestor],
        );
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        h.source.mine(1);

        // observed, then erased by a reorganization before any validator signs
        let event = h.source.fetch_events(EventKind::Locked, 0, u64::MAX).await.unwrap().remove(0);
        TransferStateMachine::new(h.store.clone(), settings().retry)
            .observe(event.clone())
            .await
            .unwrap();
        h.source.remove_event(&event.id);

        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::Flagged]).await;

        let transfer = &h.store.all_transfers()[0];
        assert_eq!(transfer.failure_kind, Some(FailureKind::Reorganization));
        assert_eq!(h.dest.broadcast_count(), 0);
        assert!(h.store.attestations(transfer.transfer_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relocated_event_is_flagged_not_relayed_twice() {
        let h = Harness::new();
        let mut orchestrator = h.orchestrator(
            RelaySettings {
                retry: RetryConfig {
                    max_retries: 3,
                    initial_backoff: Duration::from_secs(60),
                    max_backoff: Duration::from_secs(60),
                    ..Default::default()
                },
                ..settings()
            },
            Vec::new(),
        );
        h.dest.fail_next_broadcasts(1);
        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        for _ in 0..50 {
            orchestrator.tick().await.unwrap();
            if h.statuses() == vec![TransferStatus::Failed] {
                break;
            }
        }
        assert_eq!(h.statuses(), vec![TransferStatus::Failed]);

        // a reorganization re-includes the lock a few blocks later
        let original = h.store.all_transfers()[0].event.id;
        let moved_to = h.source.head() + 3;
        let moved = h.source.relocate_event(&original, moved_to).unwrap();
        drive(&mut orchestrator, || h.statuses() == vec![TransferStatus::Flagged]).await;

        let transfer = &h.store.all_transfers()[0];
        assert_eq!(transfer.event.id, original);
        assert_eq!(transfer.failure_kind, Some(FailureKind::Reorganization));
        assert!(h.store.get_transfer(moved.id.transfer_id()).await.unwrap().is_none());
        assert_eq!(h.dest.broadcast_count(), 1);
        assert_eq!(h.dest.total_supply(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(settings(), Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(shutdown_rx));

        h.source.fund(USER, U256::from(100u64));
        h.source.lock(USER, U256::from(100u64), USER).unwrap();
        let minted = tokio::time::timeout(Duration::from_secs(5), async {
            while h.dest.balance_of(USER) != U256::from(100u64) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(minted.is_ok());

        shutdown_tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }
}
