use super::BlockStub;
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::BlockNumber;
use thiserror::Error;
use tracing::instrument;

/// Polls the chain endpoint for its current head. A thin wrapper so the
/// Reorg Detector and the supervising task don't depend on `ethers`
/// directly.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn head(&self) -> Result<BlockStub, Error>;
}

pub struct EthersBlockSource<M> {
    provider: std::sync::Arc<M>,
}

impl<M> EthersBlockSource<M> {
    pub fn new(provider: std::sync::Arc<M>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<M> BlockSource for EthersBlockSource<M>
where
    M: Middleware + 'static,
{
    #[instrument(skip(self))]
    async fn head(&self) -> Result<BlockStub, Error> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| Error::Provider(e.to_string()))?
            .ok_or(Error::NoHead)?;

        Ok(BlockStub {
            hash: block.hash.ok_or(Error::NoHead)?,
            parent_hash: block.parent_hash,
            number: block
                .number
                .ok_or(Error::NoHead)?
                .as_u64(),
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("chain endpoint error: {0}")]
    Provider(String),
    #[error("chain endpoint returned a head block without hash/number")]
    NoHead,
}
