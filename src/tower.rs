use crate::appointment::{Appointment, Status, StoredAppointment};
use crate::error::Error;
use crate::inspector::InspectorRegistry;
use crate::signer::ReceiptSigner;
use crate::store::{PutOutcome, Store};
use crate::subscriber::Subscriber;
use chrono::Utc;
use ethers::providers::Middleware;
use ethers::types::{H256, Signature};
use std::sync::Arc;
use tracing::{info, instrument};

/// Admission: `add_appointment`'s six steps, plus the startup recovery
/// pass that re-registers filters for every persisted live appointment
/// (steps 4-5 must look atomic from the client's perspective).
pub struct Tower<M> {
    store: Arc<Store>,
    subscriber: Arc<Subscriber<M>>,
    inspectors: Arc<InspectorRegistry>,
    signer: Arc<ReceiptSigner>,
    payment_hash: H256,
}

impl<M> Tower<M>
where
    M: Middleware + 'static,
{
    pub fn new(
        store: Arc<Store>,
        subscriber: Arc<Subscriber<M>>,
        inspectors: Arc<InspectorRegistry>,
        signer: Arc<ReceiptSigner>,
        payment_hash: H256,
    ) -> Self {
        Self {
            store,
            subscriber,
            inspectors,
            signer,
            payment_hash,
        }
    }

    /// Re-registers a filter for every appointment still live, called
    /// once before the HTTP surface starts accepting requests
    /// (recovery from a crash between persist and subscribe).
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, Error> {
        let all = self
            .store
            .all()
            .await
            .map_err(|e| Error::ApplicationError(e.to_string()))?;

        let mut recovered = 0;
        for stored in all {
            if matches!(stored.status, Status::Pending | Status::Active | Status::Triggered) {
                self.subscriber.add(&stored.appointment).await;
                recovered += 1;
            }
        }
        info!(recovered, "recovered subscriptions from the store");
        Ok(recovered)
    }

    /// The six-step flow. Steps 4 (persist) and 5 (subscribe) both
    /// happen here so a crash between them is closed by `recover` on
    /// restart rather than by distributed-transaction machinery.
    #[instrument(skip(self, request))]
    pub async fn add_appointment(&self, request: Appointment) -> Result<(Appointment, Signature), Error> {
        self.validate_schema(&request)?;

        let inspector = self
            .inspectors
            .get(request.mode)
            .ok_or_else(|| Error::InspectionFailed(format!("no inspector registered for mode {}", request.mode)))?;
        inspector.validate(&request).await?;

        let signature = self
            .signer
            .sign(&request)
            .await
            .map_err(|e| Error::ApplicationError(e.to_string()))?;

        let stored = StoredAppointment {
            appointment: request.clone(),
            signature,
            status: Status::Pending,
            received_at: Utc::now(),
        };

        let outcome = self
            .store
            .put(&stored)
            .await
            .map_err(|e| match e {
                crate::store::Error::IdConflict(id) => {
                    Error::ValidationFailed(format!("appointment {id} already exists with different contents"))
                }
                other => Error::ApplicationError(other.to_string()),
            })?;

        if let PutOutcome::Replaced(superseded_id) = outcome {
            self.subscriber.remove(superseded_id).await;
            info!(superseded = %superseded_id, "dropped subscription for superseded appointment");
        }
        self.subscriber.add(&request).await;

        info!(id = %request.id(), "appointment admitted");
        Ok((request, signature))
    }

    /// Step 1: schema-level checks safe to do without touching the
    /// chain or the store. The payment hash check lives here since it's
    /// a pure comparison against a published constant, not a
    /// protocol-specific inspection.
    fn validate_schema(&self, request: &Appointment) -> Result<(), Error> {
        if request.start_block >= request.end_block {
            return Err(Error::ValidationFailed(
                "start_block must be strictly less than end_block".to_string(),
            ));
        }
        if request.job_id == 0 {
            return Err(Error::ValidationFailed("job_id must be nonzero".to_string()));
        }
        if request.payment_hash != self.payment_hash {
            return Err(Error::ValidationFailed(
                "payment_hash does not match the published free-tier constant".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::NullInspector;
    use crate::secret::Secret;
    use crate::signer::Options as SignerOptions;
    use crate::store::Options as StoreOptions;
    use ethers::providers::{MockProvider, Provider};
    use ethers::types::{Address, Bytes, U256};

    fn base_request(job_id: u64, payment_hash: H256) -> Appointment {
        Appointment {
            contract_address: Address::repeat_byte(0x11),
            customer_address: Address::repeat_byte(0x22),
            start_block: 100,
            end_block: 200,
            challenge_period: 10,
            customer_chosen_id: U256::from(1),
            job_id,
            data: Bytes::default(),
            refund: U256::zero(),
            gas_limit: 21_000,
            mode: 0,
            event_abi: "Dispute(address)".to_string(),
            event_args: Bytes::default(),
            pre_condition: Bytes::default(),
            post_condition: Bytes::default(),
            payment_hash,
            customer_signature: Signature {
                r: U256::zero(),
                s: U256::zero(),
                v: 27,
            },
        }
    }

    async fn test_tower() -> (Tower<Provider<MockProvider>>, H256) {
        let store = Arc::new(
            Store::new(&StoreOptions {
                database: "sqlite::memory:".parse().unwrap(),
                database_migrate: true,
                database_max_connections: 5,
            })
            .await
            .unwrap(),
        );
        let (provider, _mock) = Provider::mocked();
        let subscriber = Arc::new(Subscriber::new(Arc::new(provider), 200));
        let mut inspectors = InspectorRegistry::new();
        inspectors.register(0, Arc::new(NullInspector));

        let signer = Arc::new(
            ReceiptSigner::new(
                &SignerOptions {
                    receipt_key: Secret::new(
                        "0000000000000000000000000000000000000000000000000000000000000001".to_string(),
                    ),
                },
                Address::repeat_byte(0x99),
            )
            .unwrap(),
        );
        let payment_hash = H256::repeat_byte(0x77);

        (
            Tower::new(store, subscriber, Arc::new(inspectors), signer, payment_hash),
            payment_hash,
        )
    }

    #[tokio::test]
    async fn rejects_wrong_payment_hash() {
        let (tower, _payment_hash) = test_tower().await;
        let request = base_request(1, H256::zero());
        let err = tower.add_appointment(request).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn admits_and_subscribes_a_valid_appointment() {
        let (tower, payment_hash) = test_tower().await;
        let request = base_request(1, payment_hash);
        let id = request.id();
        let (returned, signature) = tower.add_appointment(request).await.unwrap();
        assert_eq!(returned.id(), id);

        let digest = returned.receipt_digest(tower.signer.tower_address());
        let recovered = crate::signer::ReceiptSigner::recover(digest, &signature).unwrap();
        assert_eq!(recovered, tower.signer.address());
        assert!(tower.subscriber.is_subscribed(&id).await);
    }

    #[tokio::test]
    async fn higher_job_id_drops_the_superseded_subscription() {
        let (tower, payment_hash) = test_tower().await;
        let first = base_request(1, payment_hash);
        let first_id = first.id();
        tower.add_appointment(first).await.unwrap();

        let second = base_request(2, payment_hash);
        tower.add_appointment(second).await.unwrap();

        assert!(!tower.subscriber.is_subscribed(&first_id).await);
    }

    #[tokio::test]
    async fn recover_resubscribes_persisted_appointments() {
        let (tower, payment_hash) = test_tower().await;
        let request = base_request(1, payment_hash);
        let id = request.id();
        tower.add_appointment(request).await.unwrap();

        // Simulate a fresh process: a brand-new subscriber with nothing
        // registered, then recover from the store.
        let (provider, _mock) = Provider::mocked();
        let fresh_subscriber = Arc::new(Subscriber::new(Arc::new(provider), 200));
        let fresh_tower = Tower::new(
            tower.store.clone(),
            fresh_subscriber,
            tower.inspectors.clone(),
            tower.signer.clone(),
            payment_hash,
        );
        assert!(!fresh_tower.subscriber.is_subscribed(&id).await);
        let recovered = fresh_tower.recover().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(fresh_tower.subscriber.is_subscribed(&id).await);
    }
}
