use crate::appointment::Appointment;
use crate::secret::Secret;
use clap::Parser;
use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Address, Signature, H256};
use eyre::{Context, Result};

/// Configuration for the receipt-signing key. Distinct from the
/// Responder's broadcasting key: this one never pays gas or holds a
/// nonce, it only produces detached message signatures.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Private key used to sign appointment receipts, as a 32-byte hex
    /// string (with or without `0x`).
    #[clap(long, env)]
    pub receipt_key: Secret<String>,
}

/// Pure function from an appointment's canonical packed encoding plus the
/// tower's own contract address to a 65-byte ECDSA signature over the
/// Ethereum-prefixed hash.
pub struct ReceiptSigner {
    wallet: LocalWallet,
    tower_address: Address,
}

impl ReceiptSigner {
    pub fn new(options: &Options, tower_address: Address) -> Result<Self> {
        let bytes = hex::decode(options.receipt_key.expose().trim_start_matches("0x"))
            .wrap_err("receipt key is not valid hex")?;
        let signing_key =
            SigningKey::from_slice(&bytes).wrap_err("receipt key is not a valid secp256k1 key")?;
        let wallet = LocalWallet::from(signing_key);
        Ok(Self {
            wallet,
            tower_address,
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn tower_address(&self) -> Address {
        self.tower_address
    }

    /// Signs the appointment's receipt digest, producing the detached
    /// signature returned to the customer.
    pub async fn sign(&self, appointment: &Appointment) -> Result<Signature> {
        let digest = appointment.receipt_digest(self.tower_address);
        self.sign_digest(digest).await
    }

    pub async fn sign_digest(&self, digest: H256) -> Result<Signature> {
        Ok(self
            .wallet
            .sign_hash(digest)
            .wrap_err("failed to sign receipt digest")?)
    }

    /// Recovers the signer of a digest; used by tests and by the tower's
    /// own round-trip check (P2).
    pub fn recover(digest: H256, signature: &Signature) -> Result<Address> {
        Ok(signature.recover(digest)?)
    }
}
