pub mod gas_queue;

use crate::appointment::AppointmentId;
use crate::event_bus::{Event, EventBus};
use crate::secret::Secret;
use async_trait::async_trait;
use clap::Parser;
use gas_queue::{GasQueue, GasQueueItem, ResponseRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Configuration for the Responder's gas queue and retry policy.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Private key the Responder broadcasts transactions with. Owns a
    /// single monotone nonce space, never shared with the receipt key.
    #[clap(long, env)]
    pub responder_key: Secret<String>,

    /// How many broadcast timeouts a single intent tolerates before
    /// `ResponseFailed` is emitted and the intent is abandoned.
    #[clap(long, env, default_value = "10")]
    pub max_attempts: u32,

    /// Percentage a replaced transaction's gas price rises by, e.g. 15
    /// means +15%.
    #[clap(long, env, default_value = "15")]
    pub replacement_rate: u64,

    /// Maximum number of in-flight intents.
    #[clap(long, env, default_value = "50")]
    pub max_queue_depth: usize,

    #[clap(long, env, default_value = "30")]
    pub wait_time_for_provider_response_seconds: u64,

    #[clap(long, env, default_value = "5")]
    pub wait_time_between_attempts_seconds: u64,
}

impl Options {
    pub fn wait_time_for_provider_response(&self) -> Duration {
        Duration::from_secs(self.wait_time_for_provider_response_seconds)
    }

    pub fn wait_time_between_attempts(&self) -> Duration {
        Duration::from_secs(self.wait_time_between_attempts_seconds)
    }
}

/// What the Responder needs from the chain: broadcast an item at its
/// current gas price and report back whether it confirmed within the
/// timeout. Kept behind a trait so retry exhaustion can be tested against
/// a fake that never confirms, without a live provider.
#[async_trait]
pub trait ResponseProvider: Send + Sync {
    async fn broadcast(&self, item: &GasQueueItem) -> Result<(), Error>;

    /// Waits up to `timeout` for the broadcast transaction to confirm.
    /// `Ok(true)` = confirmed, `Ok(false)` = timed out, not orphaned.
    async fn await_confirmation(&self, item: &GasQueueItem, timeout: Duration) -> Result<bool, Error>;
}

struct RunningInstance {
    handle: JoinHandle<()>,
    shutdown_sender: broadcast::Sender<()>,
}

impl RunningInstance {
    async fn shutdown(self) {
        info!("sending shutdown to the responder dispatcher");
        let _ = self.shutdown_sender.send(());
        if let Err(error) = self.handle.await {
            warn!(?error, "responder dispatcher task panicked");
        }
    }
}

/// The transactional core: owns the gas queue and the dispatch loop. A
/// single logical writer drives it; `submit`/`cancel` mutate the queue
/// under a lock, the dispatch loop reads the head and drives it to
/// completion or exhaustion.
pub struct Responder<P> {
    instance: RwLock<Option<RunningInstance>>,
    queue: RwLock<GasQueue>,
    attempts: RwLock<HashMap<AppointmentId, u32>>,
    provider: Arc<P>,
    events: Arc<EventBus>,
    max_attempts: u32,
    wait_time_for_provider_response: Duration,
    wait_time_between_attempts: Duration,
}

impl<P> Responder<P>
where
    P: ResponseProvider + 'static,
{
    pub fn new(provider: Arc<P>, events: Arc<EventBus>, queue: GasQueue, options: &Options) -> Self {
        Self {
            instance: RwLock::new(None),
            queue: RwLock::new(queue),
            attempts: RwLock::new(HashMap::new()),
            provider,
            events,
            max_attempts: options.max_attempts,
            wait_time_for_provider_response: options.wait_time_for_provider_response(),
            wait_time_between_attempts: options.wait_time_between_attempts(),
        }
    }

    /// Enqueues a new intent; the Watcher hands this to the Responder on a
    /// log match.
    #[instrument(skip(self, request))]
    pub async fn submit(&self, request: ResponseRequest) -> Result<(), gas_queue::Error> {
        let id = request.appointment_id;
        let mut queue = self.queue.write().await;
        *queue = queue.add(request)?;
        info!(%id, "intent enqueued");
        Ok(())
    }

    /// Cancels an in-flight intent: a retraction, a supersession by a
    /// higher `job_id`, or GC deletion after expiry.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: AppointmentId) -> Result<(), gas_queue::Error> {
        let mut queue = self.queue.write().await;
        *queue = queue.remove(id)?;
        self.attempts.write().await.remove(&id);
        Ok(())
    }

    pub async fn start(self: Arc<Self>) {
        let mut instance = self.instance.write().await;
        if instance.is_some() {
            info!("responder dispatcher already running");
            return;
        }

        let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);
        let responder = self.clone();
        let handle = tokio::spawn(async move { responder.run(shutdown_receiver).await });
        *instance = Some(RunningInstance {
            handle,
            shutdown_sender,
        });
    }

    pub async fn shutdown(&self) {
        let instance = self.instance.write().await.take();
        if let Some(instance) = instance {
            instance.shutdown().await;
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("responder dispatcher shutting down");
                    return;
                }
                _ = self.dispatch_once() => {}
            }
            tokio::time::sleep(self.wait_time_between_attempts).await;
        }
    }

    /// One pass of the dispatcher algorithm: broadcast the head (bounded
    /// by `wait_time_for_provider_response`, a non-resolving send counts
    /// as a failed attempt, not a sent one), await confirmation or
    /// bump-and-retry, give up after `max_attempts`.
    #[instrument(skip(self))]
    async fn dispatch_once(&self) {
        let head = { self.queue.read().await.items().first().cloned() };
        let Some(head) = head else {
            return;
        };
        let id = head.request.appointment_id;

        match tokio::time::timeout(self.wait_time_for_provider_response, self.provider.broadcast(&head)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(%id, ?error, "broadcast failed, will retry next pass");
                return;
            }
            Err(_) => {
                warn!(%id, "broadcast did not return within the provider response timeout");
                self.handle_timeout(id).await;
                return;
            }
        }
        let _ = self.events.publish(Event::ResponseSent { id });

        match self.provider.await_confirmation(&head, self.wait_time_for_provider_response).await {
            Ok(true) => {
                let mut queue = self.queue.write().await;
                *queue = queue.confirm_head().expect("confirming the head never breaks queue invariants");
                self.attempts.write().await.remove(&id);
                let _ = self.events.publish(Event::ResponseConfirmed { id });
                info!(%id, "response confirmed");
            }
            Ok(false) => self.handle_timeout(id).await,
            Err(error) => {
                warn!(%id, ?error, "provider error while awaiting confirmation");
                self.handle_timeout(id).await;
            }
        }
    }

    async fn handle_timeout(&self, id: AppointmentId) {
        let attempt = {
            let mut attempts = self.attempts.write().await;
            let counter = attempts.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };
        let _ = self.events.publish(Event::AttemptFailed { id, attempt });

        if attempt >= self.max_attempts {
            warn!(%id, attempt, "exhausted max_attempts, giving up on intent");
            let mut queue = self.queue.write().await;
            if let Ok(updated) = queue.remove(id) {
                *queue = updated;
            }
            self.attempts.write().await.remove(&id);
            let _ = self.events.publish(Event::ResponseFailed { id });
            return;
        }

        let mut queue = self.queue.write().await;
        if let Ok(updated) = queue.replace_head() {
            *queue = updated;
        }
    }

    /// Reorg handling: if the head's confirming block is orphaned, the
    /// item is still in the queue (it was only dropped on confirmation).
    /// Nothing to re-insert; the next dispatch pass retries it at its last
    /// gas price. Exposed so the Watcher can log the retraction against
    /// the right id.
    pub async fn is_in_flight(&self, id: &AppointmentId) -> bool {
        self.queue
            .read()
            .await
            .items()
            .iter()
            .any(|item| item.request.appointment_id == *id)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient provider error: {0}")]
    TransientProviderError(String),
}
