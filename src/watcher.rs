use crate::appointment::{AppointmentId, Status};
use crate::responder::gas_queue::{ResponseRequest, TransactionIdentifier};
use crate::responder::{Responder, ResponseProvider};
use crate::store::Store;
use crate::subscriber::Match;
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::U256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

/// The ideal gas price a newly triggered intent enters the queue at.
/// There's no prescribed pricing model beyond "the price the
/// customer's fee model wants to pay"; this crate samples the
/// network's current gas price at trigger time, the same call
/// `GasOracleMiddleware` makes internally.
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn estimate_gas_price(&self) -> Result<U256, Error>;
}

pub struct EthersGasOracle<M> {
    provider: Arc<M>,
}

impl<M> EthersGasOracle<M> {
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<M> GasOracle for EthersGasOracle<M>
where
    M: Middleware + 'static,
{
    async fn estimate_gas_price(&self) -> Result<U256, Error> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| Error::GasOracle(e.to_string()))
    }
}

/// Reacts to a log match by transitioning the appointment and handing a
/// response intent to the Responder. Does not own the subscription itself,
/// it's driven by whatever reads the Subscriber's matches and reorg
/// retractions (the top-level block loop in `app.rs`).
pub struct Watcher<P> {
    store: Arc<Store>,
    responder: Arc<Responder<P>>,
    gas_oracle: Arc<dyn GasOracle>,
    chain_id: u64,
}

impl<P> Watcher<P>
where
    P: ResponseProvider + 'static,
{
    pub fn new(store: Arc<Store>, responder: Arc<Responder<P>>, gas_oracle: Arc<dyn GasOracle>, chain_id: u64) -> Self {
        Self {
            store,
            responder,
            gas_oracle,
            chain_id,
        }
    }

    /// On log match: re-read from the Store, transition Active ->
    /// Triggered, submit the response intent. A no-op if the stored
    /// appointment is missing or not Active (already triggered, expired,
    /// or superseded), or if the matched log's block falls outside
    /// `[start_block, end_block]` (a filter can still be installed and
    /// polled for a block range wider than the appointment's own
    /// window).
    #[instrument(skip(self))]
    pub async fn handle_match(&self, matched: Match) -> Result<(), Error> {
        let Some(mut stored) = self.store.get(&matched.id).await? else {
            return Ok(());
        };
        if stored.status != Status::Active {
            return Ok(());
        }

        let block_number = matched.log.block_number.map(|n| n.as_u64());
        let in_window = block_number.is_some_and(|n| {
            n >= stored.appointment.start_block && n <= stored.appointment.end_block
        });
        if !in_window {
            info!(
                id = %matched.id,
                ?block_number,
                start_block = stored.appointment.start_block,
                end_block = stored.appointment.end_block,
                "ignoring match outside the appointment's block window"
            );
            return Ok(());
        }

        stored.status = Status::Triggered;
        self.store.put(&stored).await?;
        info!(id = %matched.id, "appointment triggered");

        let ideal_gas_price = self.gas_oracle.estimate_gas_price().await?;
        let request = ResponseRequest {
            appointment_id: matched.id,
            transaction: TransactionIdentifier {
                chain_id: self.chain_id,
                data: stored.appointment.data.clone(),
                to: stored.appointment.contract_address,
                value: U256::zero(),
                gas_limit: stored.appointment.gas_limit,
            },
            ideal_gas_price,
        };
        self.responder.submit(request).await?;
        Ok(())
    }

    /// On retraction before confirmation: cancel the responder entry,
    /// revert to Active.
    #[instrument(skip(self))]
    pub async fn handle_retraction(&self, id: AppointmentId) -> Result<(), Error> {
        let Some(mut stored) = self.store.get(&id).await? else {
            return Ok(());
        };
        if stored.status != Status::Triggered {
            return Ok(());
        }

        self.responder.cancel(id).await?;
        stored.status = Status::Active;
        self.store.put(&stored).await?;
        info!(%id, "retraction reverted appointment to active");
        Ok(())
    }

    /// Drives the block-stream-side lifecycle transitions: `Pending` ->
    /// `Active` once `block_number >= start_block`, and `Active` ->
    /// `Expired` once `block_number > end_block`. Called once per
    /// forward block, before matches for that block are handled, so
    /// `handle_match` only ever sees `Active` for appointments actually
    /// inside their window. Returns the number of appointments
    /// transitioned.
    #[instrument(skip(self))]
    pub async fn advance(&self, block_number: u64) -> Result<usize, Error> {
        let mut transitioned = 0;
        for stored in self.store.all().await? {
            let next_status = match stored.status {
                Status::Pending if block_number >= stored.appointment.start_block => Some(Status::Active),
                Status::Active if block_number > stored.appointment.end_block => Some(Status::Expired),
                _ => None,
            };
            let Some(next_status) = next_status else {
                continue;
            };

            let id = stored.appointment.id();
            let mut stored = stored;
            stored.status = next_status;
            self.store.put(&stored).await?;
            info!(%id, ?next_status, block_number, "appointment lifecycle transition");
            transitioned += 1;
        }
        Ok(transitioned)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Queue(#[from] crate::responder::gas_queue::Error),
    #[error("gas oracle error: {0}")]
    GasOracle(String),
}
