use crate::appointment::AppointmentId;
use crate::store::Store;
use crate::subscriber::Subscriber;
use clap::Parser;
use ethers::providers::Middleware;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

/// Periodic sweep of appointments past their challenge window.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Run a collection pass every this many blocks.
    #[clap(long, env, default_value = "20")]
    pub gc_interval: u64,

    /// An appointment is collectible once `end_block + confirmations <
    /// head`.
    #[clap(long, env, default_value = "12")]
    pub confirmations: u64,
}

pub struct GarbageCollector<M> {
    store: Arc<Store>,
    subscriber: Arc<Subscriber<M>>,
    confirmations: u64,
    gc_interval: u64,
}

impl<M> GarbageCollector<M>
where
    M: Middleware + 'static,
{
    pub fn new(store: Arc<Store>, subscriber: Arc<Subscriber<M>>, options: &Options) -> Self {
        Self {
            store,
            subscriber,
            confirmations: options.confirmations,
            gc_interval: options.gc_interval,
        }
    }

    pub fn gc_interval(&self) -> u64 {
        self.gc_interval
    }

    pub fn due_at(&self, head: u64) -> bool {
        self.gc_interval != 0 && head % self.gc_interval == 0
    }

    /// Deletes every appointment with `end_block + confirmations < head`,
    /// unsubscribing first. Idempotent: re-running against the same head
    /// (or a lower one) deletes nothing new.
    #[instrument(skip(self))]
    pub async fn collect(&self, head: u64) -> Result<Vec<AppointmentId>, Error> {
        let threshold = head.saturating_sub(self.confirmations);
        if threshold == 0 {
            return Ok(Vec::new());
        }
        let expired = self.store.iter_by_end_block_upto(threshold - 1).await?;

        let mut collected = Vec::with_capacity(expired.len());
        for stored in expired {
            let id = stored.appointment.id();
            self.subscriber.remove(id).await;
            self.store.delete(&id).await?;
            info!(%id, end_block = stored.appointment.end_block, head, "collected expired appointment");
            collected.push(id);
        }
        Ok(collected)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}
