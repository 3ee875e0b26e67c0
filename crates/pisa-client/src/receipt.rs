use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// The subset of an appointment's fields that feed the canonical packed
/// encoding. Field order here is significant and must match the tower's
/// encoder byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
}

/// An appointment plus the tower's detached signature over it, as returned
/// from `POST /appointment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub signature: Signature,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] ethers::types::SignatureError),
    #[error("recovered signer {recovered:#x} does not match advertised tower key {expected:#x}")]
    Mismatch { recovered: Address, expected: Address },
}

impl Appointment {
    /// Tightly packed encoding in the field order fixed by the tower:
    /// every integer is big-endian, addresses and byte strings are raw,
    /// and `event_abi` contributes its UTF-8 bytes rather than a length-
    /// prefixed form.
    pub fn canonical_encoding(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.contract_address.as_bytes());
        buf.extend_from_slice(self.customer_address.as_bytes());
        buf.extend_from_slice(&U256::from(self.start_block).to_big_endian_bytes());
        buf.extend_from_slice(&U256::from(self.end_block).to_big_endian_bytes());
        buf.extend_from_slice(&U256::from(self.challenge_period).to_big_endian_bytes());
        buf.extend_from_slice(&self.customer_chosen_id.to_big_endian_bytes());
        buf.extend_from_slice(&U256::from(self.job_id).to_big_endian_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.refund.to_big_endian_bytes());
        buf.extend_from_slice(&U256::from(self.gas_limit).to_big_endian_bytes());
        buf.extend_from_slice(&U256::from(self.mode).to_big_endian_bytes());
        buf.extend_from_slice(self.event_abi.as_bytes());
        buf.extend_from_slice(&self.event_args);
        buf.extend_from_slice(&self.post_condition);
        buf.extend_from_slice(self.payment_hash.as_bytes());
        buf
    }

    /// The digest actually signed by the tower: a standard Ethereum signed
    /// message over `keccak256(encoding ‖ tower_address)`.
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

trait BigEndianBytes {
    fn to_big_endian_bytes(&self) -> [u8; 32];
}

impl BigEndianBytes for U256 {
    fn to_big_endian_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.to_big_endian(&mut out);
        out
    }
}

impl Receipt {
    /// Recovers the signer of this receipt's digest; does not by itself
    /// prove the signer is the tower the caller expects.
    pub fn recover_signer(&self, tower_address: Address) -> Result<Address, ClientError> {
        let digest = self.appointment.receipt_digest(tower_address);
        Ok(self.signature.recover(digest)?)
    }

    /// Verifies that the signature recovers to `expected_key`, the tower's
    /// advertised receipt-signing address.
    pub fn verify(&self, tower_address: Address, expected_key: Address) -> Result<(), ClientError> {
        let recovered = self.recover_signer(tower_address)?;
        if recovered != expected_key {
            return Err(ClientError::Mismatch {
                recovered,
                expected: expected_key,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    fn sample_appointment() -> Appointment {
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
        }
    }

    #[tokio::test]
    async fn round_trips_through_signing_and_verification() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let tower_address = Address::repeat_byte(0x99);
        let appointment = sample_appointment();

        let digest = appointment.receipt_digest(tower_address);
        let signature = wallet.sign_hash(digest).unwrap();

        let receipt = Receipt {
            appointment,
            signature,
        };

        receipt
            .verify(tower_address, wallet.address())
            .expect("signature must verify against the signing wallet's address");
    }

    #[tokio::test]
    async fn rejects_signature_from_a_different_key() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let other = LocalWallet::new(&mut rand::thread_rng());
        let tower_address = Address::repeat_byte(0x99);
        let appointment = sample_appointment();

        let digest = appointment.receipt_digest(tower_address);
        let signature = wallet.sign_hash(digest).unwrap();
        let receipt = Receipt {
            appointment,
            signature,
        };

        let err = receipt
            .verify(tower_address, other.address())
            .unwrap_err();
        assert!(matches!(err, ClientError::Mismatch { .. }));
    }

    #[test]
    fn encoding_changes_with_any_field() {
        let a = sample_appointment();
        let mut b = sample_appointment();
        b.job_id = 2;
        assert_ne!(a.canonical_encoding(), b.canonical_encoding());
    }
}
