use super::BlockStub;
use std::collections::HashMap;

/// A per-block state transition function: `initial_state` runs the first
/// time a sub-state's id is seen, `reduce` on every subsequent block.
pub trait Reducer<S> {
    fn initial_state(&self, block: &BlockStub) -> S;
    fn reduce(&self, prev: &S, block: &BlockStub) -> S;
}

/// Indexes independent sub-states by a string id drawn from a dynamic
/// collection (e.g. live appointment ids). Shared substrate for the
/// Watcher and the Garbage Collector, kept pure and block-I/O-free so it
/// can be unit tested in isolation.
pub struct MappedStateMachine<S, R: Reducer<S>> {
    reducer: R,
    states: HashMap<String, S>,
}

impl<S, R: Reducer<S>> MappedStateMachine<S, R> {
    pub fn new(reducer: R) -> Self {
        Self {
            reducer,
            states: HashMap::new(),
        }
    }

    /// Applies `block` to every id in `live_ids`, computing an initial
    /// state for ids not seen before and reducing for the rest. Ids no
    /// longer present in `live_ids` are dropped.
    pub fn apply_block(&mut self, live_ids: &[String], block: &BlockStub) {
        self.states.retain(|id, _| live_ids.contains(id));
        for id in live_ids {
            let next = match self.states.get(id) {
                Some(prev) => self.reducer.reduce(prev, block),
                None => self.reducer.initial_state(block),
            };
            self.states.insert(id.clone(), next);
        }
    }

    pub fn state(&self, id: &str) -> Option<&S> {
        self.states.get(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn stub(number: u64) -> BlockStub {
        BlockStub {
            hash: H256::repeat_byte(number as u8),
            parent_hash: H256::zero(),
            number,
        }
    }

    struct CountBlocksSeen;

    impl Reducer<u64> for CountBlocksSeen {
        fn initial_state(&self, _block: &BlockStub) -> u64 {
            1
        }

        fn reduce(&self, prev: &u64, _block: &BlockStub) -> u64 {
            prev + 1
        }
    }

    #[test]
    fn computes_initial_state_on_first_sight() {
        let mut machine = MappedStateMachine::new(CountBlocksSeen);
        let ids = vec!["a".to_string()];
        machine.apply_block(&ids, &stub(1));
        assert_eq!(machine.state("a"), Some(&1));
    }

    #[test]
    fn reduces_on_subsequent_blocks() {
        let mut machine = MappedStateMachine::new(CountBlocksSeen);
        let ids = vec!["a".to_string()];
        machine.apply_block(&ids, &stub(1));
        machine.apply_block(&ids, &stub(2));
        machine.apply_block(&ids, &stub(3));
        assert_eq!(machine.state("a"), Some(&3));
    }

    #[test]
    fn drops_ids_no_longer_live() {
        let mut machine = MappedStateMachine::new(CountBlocksSeen);
        machine.apply_block(&["a".to_string(), "b".to_string()], &stub(1));
        assert_eq!(machine.len(), 2);
        machine.apply_block(&["a".to_string()], &stub(2));
        assert_eq!(machine.len(), 1);
        assert!(machine.state("b").is_none());
    }
}
