use crate::appointment::Status;
use crate::chain::{self, BlockSource, BlockStub, EthersBlockSource, Event as ReorgEvent, Reducer, ReorgDetector};
use crate::ethereum::{self, EthersResponseProvider, Transport};
use crate::event_bus::EventBus;
use crate::gc::{self, GarbageCollector};
use crate::inspector::{EthersDisputeRegistry, InspectorRegistry, NullInspector, StateChannelInspector};
use crate::responder::{self, Responder};
use crate::server::{self, RateLimiters};
use crate::signer::{self, ReceiptSigner};
use crate::store::{self, Store};
use crate::subscriber::Subscriber;
use crate::tower::Tower;
use crate::watcher::{EthersGasOracle, Watcher};
use clap::Parser;
use ethers::providers::{Middleware, Provider};
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

type EthereumProvider = Provider<Transport>;

/// Top-level CLI/env configuration, composed from every module's own
/// `Options`, matching the base service's `app::Options` shape.
#[derive(Clone, Debug, Parser)]
#[group(skip)]
pub struct Options {
    #[clap(flatten)]
    pub ethereum: ethereum::Options,

    #[clap(flatten)]
    pub chain: chain::Options,

    #[clap(flatten)]
    pub store: store::Options,

    #[clap(flatten)]
    pub signer: signer::Options,

    #[clap(flatten)]
    pub responder: responder::Options,

    #[clap(flatten)]
    pub gc: gc::Options,

    #[clap(flatten)]
    pub server: server::Options,

    /// This tower's own address on the accountability contract, bound
    /// into every receipt signature.
    #[clap(long, env)]
    pub tower_address: Address,

    /// The published free-tier payment hash constant.
    #[clap(long, env)]
    pub payment_hash: H256,

    /// Number of recent filter matches retained for reorg retraction.
    #[clap(long, env, default_value = "200")]
    pub subscriber_retention: usize,

    /// Expected deployed bytecode hash for mode-1 (state-channel)
    /// appointments' target contracts.
    #[clap(long, env, default_value = "0x0000000000000000000000000000000000000000000000000000000000000000")]
    pub state_channel_code_hash: H256,

    /// Minimum on-chain dispute window (in blocks) mode-1 inspection
    /// requires.
    #[clap(long, env, default_value = "0")]
    pub state_channel_min_dispute_window: u64,
}

struct RunningInstance {
    handle: JoinHandle<()>,
    shutdown_sender: broadcast::Sender<()>,
}

/// Owns every component and the block-driven loop that ties the block
/// source and reorg detector to the subscriber, watcher, and garbage
/// collector, mirroring the base service's `App`: a single struct built
/// once at startup, handed to the HTTP server as shared state.
pub struct App {
    pub store: Arc<Store>,
    pub subscriber: Arc<Subscriber<EthereumProvider>>,
    pub tower: Arc<Tower<EthereumProvider>>,
    pub responder: Arc<Responder<EthersResponseProvider<EthereumProvider>>>,
    gc: Arc<GarbageCollector<EthereumProvider>>,
    block_source: Arc<EthersBlockSource<EthereumProvider>>,
    watcher: Arc<Watcher<EthersResponseProvider<EthereumProvider>>>,
    rate_limiters: Arc<RateLimiters>,
    polling_interval: Duration,
    reorg_window: usize,
    block_loop: tokio::sync::Mutex<Option<RunningInstance>>,
}

impl App {
    /// Connects to the chain endpoint and the database in parallel (the
    /// same `try_join!` shape `App::new` uses in the base service), then
    /// runs the tower's crash-recovery pass before returning, so the HTTP
    /// surface never opens on a half-recovered process.
    #[instrument(name = "App::new", skip_all)]
    pub async fn new(options: Options) -> anyhow::Result<Self> {
        let ((provider, chain_id), store) = tokio::try_join!(
            async { ethereum::connect(&options.ethereum).await.map_err(anyhow::Error::from) },
            async { Store::new(&options.store).await.map_err(anyhow::Error::from) },
        )?;
        let store = Arc::new(store);

        let subscriber = Arc::new(Subscriber::new(provider.clone(), options.subscriber_retention));
        let block_source = Arc::new(EthersBlockSource::new(provider.clone()));

        let mut inspectors = InspectorRegistry::new();
        inspectors.register(0, Arc::new(NullInspector));
        let dispute_registry = Arc::new(EthersDisputeRegistry::new(provider.clone()));
        inspectors.register(
            1,
            Arc::new(StateChannelInspector::new(
                dispute_registry,
                options.state_channel_code_hash,
                options.state_channel_min_dispute_window,
            )),
        );

        let signer = Arc::new(
            ReceiptSigner::new(&options.signer, options.tower_address).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        );

        let tower = Arc::new(Tower::new(
            store.clone(),
            subscriber.clone(),
            Arc::new(inspectors),
            signer,
            options.payment_hash,
        ));

        let recovered = tower.recover().await?;
        info!(recovered, "startup recovery complete");

        let response_provider = Arc::new(EthersResponseProvider::new(
            provider.clone(),
            &options.responder.responder_key,
            chain_id,
            Duration::from_secs(options.ethereum.confirmation_poll_seconds),
        )?);
        let initial_nonce = provider
            .get_transaction_count(response_provider.address(), None)
            .await?
            .as_u64();

        let events = Arc::new(EventBus::new(1024));
        let queue = crate::responder::gas_queue::GasQueue::new(
            vec![],
            initial_nonce,
            initial_nonce,
            options.responder.max_queue_depth,
            options.responder.replacement_rate,
        )
        .map_err(|e| anyhow::anyhow!(e))?;
        let responder = Arc::new(Responder::new(response_provider, events, queue, &options.responder));

        let gas_oracle = Arc::new(EthersGasOracle::new(provider.clone()));
        let watcher = Arc::new(Watcher::new(store.clone(), responder.clone(), gas_oracle, chain_id));

        let gc = Arc::new(GarbageCollector::new(store.clone(), subscriber.clone(), &options.gc));
        let rate_limiters = Arc::new(RateLimiters::new(&options.server));

        Ok(Self {
            store,
            subscriber,
            tower,
            responder,
            gc,
            block_source,
            watcher,
            rate_limiters,
            polling_interval: options.chain.polling_interval,
            reorg_window: options.chain.reorg_window,
            block_loop: tokio::sync::Mutex::new(None),
        })
    }

    /// The HTTP surface: `POST /appointment` behind the configured rate
    /// limits, bound to this instance's `Tower`.
    pub fn router(&self) -> axum::Router {
        server::router(self.tower.clone(), self.rate_limiters.clone())
    }

    /// Starts the Responder dispatcher and the block-polling loop. Safe
    /// to call once; a second call is a no-op, matching
    /// `Responder::start`'s own idempotence.
    pub async fn start(self: &Arc<Self>) {
        self.responder.clone().start().await;

        let mut guard = self.block_loop.lock().await;
        if guard.is_some() {
            return;
        }
        let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);
        let app = self.clone();
        let handle = tokio::spawn(async move { app.run_block_loop(shutdown_receiver).await });
        *guard = Some(RunningInstance { handle, shutdown_sender });
    }

    pub async fn shutdown(&self) {
        self.responder.shutdown().await;
        let mut guard = self.block_loop.lock().await;
        if let Some(instance) = guard.take() {
            let _ = instance.shutdown_sender.send(());
            let _ = instance.handle.await;
        }
    }

    #[instrument(name = "App::block_loop", skip_all)]
    async fn run_block_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut detector = ReorgDetector::new(self.reorg_window);
        let mut last_synced = self.store.get_last_block().await.ok().flatten();
        let mut states = crate::chain::MappedStateMachine::new(LastHeadReducer);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("block loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.polling_interval) => {}
            }

            let head = match self.block_source.head().await {
                Ok(head) => head,
                Err(error) => {
                    warn!(%error, "failed to fetch chain head, retrying after backoff");
                    continue;
                }
            };

            let Some(events) = detector.push(head) else {
                warn!("deep reorg detected, common ancestor fell outside the retention window");
                return;
            };

            for event in events {
                match event {
                    ReorgEvent::ReorgTo(height) => {
                        for id in self.subscriber.retract_from(height).await {
                            if let Err(error) = self.watcher.handle_retraction(id).await {
                                warn!(%error, %id, "failed to process retraction");
                            }
                        }
                    }
                    ReorgEvent::Forward(block) => {
                        match self.watcher.advance(block.number).await {
                            Ok(transitioned) if transitioned > 0 => {
                                info!(transitioned, block = block.number, "lifecycle transitions applied");
                            }
                            Ok(_) => {}
                            Err(error) => warn!(%error, "failed to apply lifecycle transitions"),
                        }

                        let from = last_synced.map_or(block.number, |n| n + 1);
                        if from <= block.number {
                            match self.subscriber.poll_range(from, block.number).await {
                                Ok(matches) => {
                                    for matched in matches {
                                        if let Err(error) = self.watcher.handle_match(matched).await {
                                            warn!(%error, "failed to process log match");
                                        }
                                    }
                                }
                                Err(error) => warn!(%error, "failed to poll for log matches"),
                            }
                        }

                        if let Err(error) = self.store.set_last_block(block.number).await {
                            warn!(%error, "failed to persist last synced block");
                        }
                        last_synced = Some(block.number);

                        let live_ids: Vec<String> = self
                            .store
                            .all()
                            .await
                            .unwrap_or_default()
                            .into_iter()
                            .filter(|s| matches!(s.status, Status::Pending | Status::Active | Status::Triggered))
                            .map(|s| s.appointment.id().to_string())
                            .collect();
                        states.apply_block(&live_ids, &block);

                        if self.gc.due_at(block.number) {
                            match self.gc.collect(block.number).await {
                                Ok(collected) if !collected.is_empty() => {
                                    info!(count = collected.len(), "garbage collector pass complete");
                                }
                                Ok(_) => {}
                                Err(error) => warn!(%error, "garbage collection pass failed"),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Per-appointment substrate for the generic block-state-machine runtime:
/// keeps the block stub each live appointment last observed. Does not gate
/// any admission or response decision (those stay Store-driven).
struct LastHeadReducer;

impl Reducer<BlockStub> for LastHeadReducer {
    fn initial_state(&self, block: &BlockStub) -> BlockStub {
        *block
    }

    fn reduce(&self, _prev: &BlockStub, block: &BlockStub) -> BlockStub {
        *block
    }
}
