use crate::responder::gas_queue::GasQueueItem;
use crate::responder::{Error as ResponderError, ResponseProvider};
use crate::secret::Secret;
use async_trait::async_trait;
use clap::Parser;
use ethers::core::k256::ecdsa::SigningKey;
use ethers::providers::{Http, Ipc, JsonRpcClient, Middleware, Provider, ProviderError, Ws};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockNumber, TransactionRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use url::Url;

/// Connection parameters for the JSON-RPC endpoint.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    #[clap(long, env, default_value = "http://localhost:8545")]
    pub json_rpc_url: Secret<Url>,

    /// How often `await_confirmation` polls the responder's on-chain nonce.
    #[clap(long, env, default_value = "2")]
    pub confirmation_poll_seconds: u64,
}

/// One JSON-RPC transport behind a uniform `JsonRpcClient`, so the rest of
/// the crate is generic over `Middleware` rather than over a transport
/// enum. Supports the same three schemes the `ws`/`ipc` feature flags on
/// the `ethers` dependency enable.
#[derive(Debug, Clone)]
pub enum Transport {
    Http(Http),
    Ws(Ws),
    Ipc(Ipc),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Http(<Http as JsonRpcClient>::Error),
    #[error("websocket transport error: {0}")]
    Ws(<Ws as JsonRpcClient>::Error),
    #[error("ipc transport error: {0}")]
    Ipc(<Ipc as JsonRpcClient>::Error),
    #[error("unsupported json-rpc url scheme: {0}")]
    InvalidScheme(Url),
}

impl From<TransportError> for ProviderError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Http(e) => ProviderError::from(e),
            TransportError::Ws(e) => ProviderError::from(e),
            TransportError::Ipc(e) => ProviderError::from(e),
            TransportError::InvalidScheme(url) => {
                ProviderError::CustomError(format!("unsupported json-rpc url scheme: {url}"))
            }
        }
    }
}

impl Transport {
    async fn connect(url: Url) -> Result<Self, TransportError> {
        match url.scheme() {
            "http" | "https" => Ok(Transport::Http(Http::new(url))),
            "ws" | "wss" => Ok(Transport::Ws(Ws::connect(url).await.map_err(TransportError::Ws)?)),
            "ipc" if url.host().is_none() => {
                Ok(Transport::Ipc(Ipc::connect(url.path()).await.map_err(TransportError::Ipc)?))
            }
            _ => Err(TransportError::InvalidScheme(url)),
        }
    }
}

#[async_trait]
impl JsonRpcClient for Transport {
    type Error = TransportError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: std::fmt::Debug + Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        match self {
            Transport::Http(inner) => inner.request(method, params).await.map_err(TransportError::Http),
            Transport::Ws(inner) => inner.request(method, params).await.map_err(TransportError::Ws),
            Transport::Ipc(inner) => inner.request(method, params).await.map_err(TransportError::Ipc),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to the json-rpc provider: {0}")]
    Connect(#[from] TransportError),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("responder key is not valid hex")]
    InvalidKey,
}

/// Connects to the configured JSON-RPC endpoint and logs the chain it
/// found, mirroring `Ethereum::new`'s startup sanity check in the base
/// service but without its metrics/gas-oracle middleware stack, which this
/// crate's own `GasOracle`/`ResponseProvider` traits replace.
#[instrument(name = "ethereum::connect", skip_all)]
pub async fn connect(options: &Options) -> Result<(Arc<Provider<Transport>>, u64), Error> {
    let url = options.json_rpc_url.expose().to_string();
    info!(provider = %url, "connecting to json-rpc provider");
    let transport = Transport::connect(options.json_rpc_url.expose().clone()).await?;
    let provider = Provider::new(transport);

    let chain_id = provider
        .get_chainid()
        .await
        .map_err(|e| Error::Provider(e.to_string()))?;
    let head = provider
        .get_block(BlockNumber::Latest)
        .await
        .map_err(|e| Error::Provider(e.to_string()))?;
    let head_number = head.and_then(|b| b.number).map(|n| n.as_u64());
    info!(%chain_id, ?head_number, "connected to json-rpc provider");

    Ok((Arc::new(provider), chain_id.as_u64()))
}

/// The production `ResponseProvider`: signs each queue item's transaction
/// with the responder's own key at the item's current nonce and gas
/// price, broadcasts it, and considers the intent confirmed once the
/// responder's on-chain nonce has advanced past it. Any of the
/// replace-by-fee resubmissions being mined counts, not just the most
/// recent one.
pub struct EthersResponseProvider<M> {
    provider: Arc<M>,
    wallet: LocalWallet,
    poll_interval: Duration,
}

impl<M> EthersResponseProvider<M>
where
    M: Middleware + 'static,
{
    pub fn new(provider: Arc<M>, responder_key: &Secret<String>, chain_id: u64, poll_interval: Duration) -> Result<Self, Error> {
        let bytes = hex::decode(responder_key.expose().trim_start_matches("0x")).map_err(|_| Error::InvalidKey)?;
        let signing_key = SigningKey::from_slice(&bytes).map_err(|_| Error::InvalidKey)?;
        let wallet = LocalWallet::from(signing_key).with_chain_id(chain_id);
        Ok(Self { provider, wallet, poll_interval })
    }

    pub fn address(&self) -> ethers::types::Address {
        self.wallet.address()
    }
}

#[async_trait]
impl<M> ResponseProvider for EthersResponseProvider<M>
where
    M: Middleware + 'static,
{
    #[instrument(skip(self, item), fields(id = %item.request.appointment_id, nonce = item.nonce))]
    async fn broadcast(&self, item: &GasQueueItem) -> Result<(), ResponderError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(item.request.transaction.to)
            .value(item.request.transaction.value)
            .data(item.request.transaction.data.clone())
            .gas(item.request.transaction.gas_limit)
            .gas_price(item.current_gas_price)
            .nonce(item.nonce)
            .chain_id(item.request.transaction.chain_id)
            .into();

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ResponderError::TransientProviderError(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        self.provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ResponderError::TransientProviderError(e.to_string()))?;
        info!(gas_price = %item.current_gas_price, "broadcast response transaction");
        Ok(())
    }

    async fn await_confirmation(&self, item: &GasQueueItem, timeout: Duration) -> Result<bool, ResponderError> {
        let deadline = Instant::now() + timeout;
        loop {
            let on_chain_nonce = self
                .provider
                .get_transaction_count(self.wallet.address(), None)
                .await
                .map_err(|e| ResponderError::TransientProviderError(e.to_string()))?;
            if on_chain_nonce.as_u64() > item.nonce {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(nonce = item.nonce, "response transaction not confirmed before timeout");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(timeout)).await;
        }
    }
}
