pub mod block_source;
pub mod reorg;
pub mod state_machine;

use clap::Parser;
use ethers::types::H256;
use std::time::Duration;

pub use block_source::BlockSource;
pub use reorg::{Event, ReorgDetector};
pub use state_machine::{MappedStateMachine, Reducer};

/// The ordered-stream element the block source and reorg detector operate
/// on: `(hash, parent_hash, number)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStub {
    pub hash: H256,
    pub parent_hash: H256,
    pub number: u64,
}

/// Top-level polling parameters for the block source / reorg detector
/// loop.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// How often to poll the chain endpoint for a new head. Accepts
    /// humantime durations, e.g. `12s`, `500ms`.
    #[clap(long, env, default_value = "12s", value_parser = humantime::parse_duration)]
    pub polling_interval: Duration,

    /// Number of recent heads the reorg detector retains before treating
    /// a divergence as a deep reorg.
    #[clap(long, env, default_value = "200")]
    pub reorg_window: usize,
}
