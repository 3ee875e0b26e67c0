use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-unique customer-facing key. Many appointments may share a locator;
/// at most one is ever active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub customer_chosen_id: U256,
    pub customer_address: Address,
}

impl Locator {
    pub fn new(customer_chosen_id: U256, customer_address: Address) -> Self {
        Self {
            customer_chosen_id,
            customer_address,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.customer_chosen_id, self.customer_address)
    }
}

/// `(locator, job_id)`. Unique. A higher `job_id` replaces any live
/// appointment sharing the same locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppointmentId {
    pub locator: Locator,
    pub job_id: u64,
}

impl AppointmentId {
    pub fn new(locator: Locator, job_id: u64) -> Self {
        Self { locator, job_id }
    }
}

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locator, self.job_id)
    }
}

/// Lifecycle of a stored appointment, driven by the block stream
/// (Pending -> Active -> Expired) with Triggered occurring only while
/// Active, and Completed reached only from Triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Active,
    Triggered,
    Completed,
    Expired,
}

/// An immutable, once-accepted hiring contract between a customer and the
/// tower, covering one event in one block window. Field order mirrors the
/// canonical packed encoding below, so the two stay easy to eyeball against
/// each other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub contract_address: Address,
    pub customer_address: Address,
    pub start_block: u64,
    pub end_block: u64,
    pub challenge_period: u64,
    pub customer_chosen_id: U256,
    pub job_id: u64,
    pub data: Bytes,
    pub refund: U256,
    pub gas_limit: u64,
    pub mode: u64,
    pub event_abi: String,
    pub event_args: Bytes,
    pub pre_condition: Bytes,
    pub post_condition: Bytes,
    pub payment_hash: H256,
    pub customer_signature: Signature,
}

impl Appointment {
    pub fn locator(&self) -> Locator {
        Locator::new(self.customer_chosen_id, self.customer_address)
    }

    pub fn id(&self) -> AppointmentId {
        AppointmentId::new(self.locator(), self.job_id)
    }

    /// Tightly packed encoding, byte-exact, in the field order fixed by the
    /// canonical encoding: every integer big-endian, addresses and byte
    /// strings raw, `event_abi` contributing its UTF-8 bytes rather than a
    /// length-prefixed form.
    pub fn canonical_encoding(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.contract_address.as_bytes());
        buf.extend_from_slice(self.customer_address.as_bytes());
        buf.extend_from_slice(&u256_be(self.start_block.into()));
        buf.extend_from_slice(&u256_be(self.end_block.into()));
        buf.extend_from_slice(&u256_be(self.challenge_period.into()));
        buf.extend_from_slice(&u256_be(self.customer_chosen_id));
        buf.extend_from_slice(&u256_be(self.job_id.into()));
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&u256_be(self.refund));
        buf.extend_from_slice(&u256_be(self.gas_limit.into()));
        buf.extend_from_slice(&u256_be(self.mode.into()));
        buf.extend_from_slice(self.event_abi.as_bytes());
        buf.extend_from_slice(&self.event_args);
        buf.extend_from_slice(&self.post_condition);
        buf.extend_from_slice(self.payment_hash.as_bytes());
        buf
    }

    /// `keccak256("\x19Ethereum Signed Message:\n32" ‖ keccak256(encoding ‖ tower_address))`.
    pub fn receipt_digest(&self, tower_address: Address) -> H256 {
        let mut inner = self.canonical_encoding();
        inner.extend_from_slice(tower_address.as_bytes());
        let inner_hash = keccak256(inner);

        let mut prefixed = Vec::with_capacity(28 + 32);
        prefixed.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
        prefixed.extend_from_slice(&inner_hash);
        H256::from(keccak256(prefixed))
    }
}

fn u256_be(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// What is actually persisted: the appointment, the receipt signature
/// returned to the customer (so a restart can answer lookups without
/// re-signing), the current lifecycle status, and a diagnostic timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAppointment {
    pub appointment: Appointment,
    pub signature: Signature,
    pub status: Status,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Appointment {
        Appointment {
            contract_address: Address::repeat_byte(0x11),
            customer_address: Address::repeat_byte(0x22),
            start_block: 100,
            end_block: 200,
            challenge_period: 10,
            customer_chosen_id: U256::from(42),
            job_id: 1,
            data: Bytes::from_static(b"\xde\xad\xbe\xef"),
            refund: U256::from(1_000_000u64),
            gas_limit: 21_000,
            mode: 0,
            event_abi: "Dispute(address,uint256)".to_string(),
            event_args: Bytes::from_static(b"\x00\x01"),
            pre_condition: Bytes::default(),
            post_condition: Bytes::from_static(b"\xca\xfe"),
            payment_hash: H256::repeat_byte(0x33),
            customer_signature: Signature {
                r: U256::zero(),
                s: U256::zero(),
                v: 27,
            },
        }
    }

    #[test]
    fn id_changes_with_job_id_not_locator() {
        let mut a = sample();
        let mut b = sample();
        b.job_id = 2;
        assert_eq!(a.locator(), b.locator());
        assert_ne!(a.id(), b.id());
        a.job_id = 1;
        assert_eq!(a.id(), sample().id());
    }

    #[test]
    fn encoding_is_sensitive_to_every_field() {
        let a = sample();
        let mut b = sample();
        b.post_condition = Bytes::from_static(b"\x00");
        assert_ne!(a.canonical_encoding(), b.canonical_encoding());
    }

    #[test]
    fn encoding_length_matches_fixed_plus_variable_parts() {
        let a = sample();
        let fixed = 20 + 20 + 32 * 8 + 32; // addresses + 8 u256 words + payment_hash
        let variable = a.data.len() + a.event_abi.len() + a.event_args.len() + a.post_condition.len();
        assert_eq!(a.canonical_encoding().len(), fixed + variable);
    }
}
