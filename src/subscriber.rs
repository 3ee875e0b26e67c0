use crate::appointment::{Appointment, AppointmentId};
use ethers::providers::Middleware;
use ethers::types::{Filter, Log, ValueOrArray, H256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

/// One argument position from an appointment's `event_args`: topic index
/// `1..=3` and the value to filter on. Positions not present are
/// wildcards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexedArg {
    pub index: u8,
    pub value: H256,
}

fn decode_event_args(bytes: &ethers::types::Bytes) -> Vec<IndexedArg> {
    if bytes.is_empty() {
        return Vec::new();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

/// Builds the provider-level filter for an appointment: address plus
/// topic0 (the event signature hash) plus any indexed args the customer
/// pinned.
pub fn appointment_filter(appointment: &Appointment) -> Filter {
    let topic0 = ethers::utils::id(appointment.event_abi.as_str());
    let mut filter = Filter::new()
        .address(appointment.contract_address)
        .topic0(topic0);

    for arg in decode_event_args(&appointment.event_args) {
        filter = match arg.index {
            1 => filter.topic1(ValueOrArray::Value(arg.value)),
            2 => filter.topic2(ValueOrArray::Value(arg.value)),
            3 => filter.topic3(ValueOrArray::Value(arg.value)),
            _ => filter,
        };
    }
    filter
}

/// Groups filters by their `(address, topic0)` shape so shared
/// subscriptions can be refcounted correctly, even though the actual
/// `get_logs` call is still made once per filter key, not once per
/// appointment.
type FilterKey = (ethers::types::Address, H256);

fn filter_key(appointment: &Appointment) -> FilterKey {
    (
        appointment.contract_address,
        ethers::utils::id(appointment.event_abi.as_str()),
    )
}

struct DeliveredLog {
    id: AppointmentId,
    block_number: u64,
}

/// A log matching a live appointment's filter, to be handed to the
/// Watcher.
#[derive(Clone, Debug)]
pub struct Match {
    pub id: AppointmentId,
    pub log: Log,
}

/// Wraps the chain endpoint's log filtering. Maintains `filter ->
/// {appointment_id}` refcounts, routes matching logs to every listening
/// appointment, and retracts previously delivered logs on reorg.
pub struct Subscriber<M> {
    provider: Arc<M>,
    filters: RwLock<HashMap<AppointmentId, (FilterKey, Filter)>>,
    refcounts: RwLock<HashMap<FilterKey, HashSet<AppointmentId>>>,
    delivered: RwLock<VecDeque<DeliveredLog>>,
    retention: usize,
}

impl<M> Subscriber<M>
where
    M: Middleware + 'static,
{
    pub fn new(provider: Arc<M>, retention: usize) -> Self {
        Self {
            provider,
            filters: RwLock::new(HashMap::new()),
            refcounts: RwLock::new(HashMap::new()),
            delivered: RwLock::new(VecDeque::new()),
            retention,
        }
    }

    /// Installs a filter for `appointment` if one isn't already tracked
    /// for this id.
    #[instrument(skip(self, appointment))]
    pub async fn add(&self, appointment: &Appointment) {
        let id = appointment.id();
        let key = filter_key(appointment);
        let filter = appointment_filter(appointment);

        self.filters.write().await.insert(id, (key, filter));
        self.refcounts
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(id);
    }

    /// Decrements the refcount for `id`'s filter, uninstalling it when
    /// zero.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: AppointmentId) {
        let removed = self.filters.write().await.remove(&id);
        if let Some((key, _)) = removed {
            let mut refcounts = self.refcounts.write().await;
            if let Some(ids) = refcounts.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    refcounts.remove(&key);
                }
            }
        }
    }

    pub async fn is_subscribed(&self, id: &AppointmentId) -> bool {
        self.filters.read().await.contains_key(id)
    }

    /// Scans `[from_block, to_block]` for logs matching every live
    /// filter, recording each delivery for later retraction.
    #[instrument(skip(self))]
    pub async fn poll_range(&self, from_block: u64, to_block: u64) -> Result<Vec<Match>, Error> {
        let snapshot: Vec<(AppointmentId, Filter)> = self
            .filters
            .read()
            .await
            .iter()
            .map(|(id, (_, filter))| (*id, filter.clone()))
            .collect();

        let mut matches = Vec::new();
        for (id, filter) in snapshot {
            let filter = filter.from_block(from_block).to_block(to_block);
            let logs = self
                .provider
                .get_logs(&filter)
                .await
                .map_err(|e| Error::Provider(e.to_string()))?;
            for log in logs {
                let block_number = log.block_number.map(|n| n.as_u64()).unwrap_or(to_block);
                self.delivered.write().await.push_back(DeliveredLog { id, block_number });
                self.trim_retention().await;
                matches.push(Match { id, log });
            }
        }
        Ok(matches)
    }

    async fn trim_retention(&self) {
        let mut delivered = self.delivered.write().await;
        while delivered.len() > self.retention {
            delivered.pop_front();
        }
    }

    /// On a `reorg_to(h)` event: every appointment id with a delivered
    /// log at height >= h is retracted (its Triggered marker must revert
    /// to Active).
    #[instrument(skip(self))]
    pub async fn retract_from(&self, height: u64) -> Vec<AppointmentId> {
        let mut delivered = self.delivered.write().await;
        let mut retracted = Vec::new();
        let remaining: VecDeque<DeliveredLog> = delivered
            .drain(..)
            .filter(|d| {
                if d.block_number >= height {
                    retracted.push(d.id);
                    false
                } else {
                    true
                }
            })
            .collect();
        *delivered = remaining;
        retracted.dedup();
        retracted
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("provider error while polling logs: {0}")]
    Provider(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, Signature, U256};

    fn sample_appointment(job_id: u64) -> Appointment {
        Appointment {
            contract_address: Address::repeat_byte(0x11),
            customer_address: Address::repeat_byte(0x22),
            start_block: 1,
            end_block: 100,
            challenge_period: 5,
            customer_chosen_id: U256::from(1),
            job_id,
            data: Bytes::default(),
            refund: U256::zero(),
            gas_limit: 21_000,
            mode: 0,
            event_abi: "Dispute(address,uint256)".to_string(),
            event_args: Bytes::default(),
            pre_condition: Bytes::default(),
            post_condition: Bytes::default(),
            payment_hash: H256::zero(),
            customer_signature: Signature {
                r: U256::zero(),
                s: U256::zero(),
                v: 27,
            },
        }
    }

    #[test]
    fn filter_key_groups_by_address_and_topic0() {
        let a = sample_appointment(1);
        let b = sample_appointment(2);
        assert_eq!(filter_key(&a), filter_key(&b));
    }

    #[test]
    fn decode_event_args_defaults_to_empty_on_garbage() {
        let garbage = ethers::types::Bytes::from_static(b"\xff\xff");
        assert!(decode_event_args(&garbage).is_empty());
    }
}
