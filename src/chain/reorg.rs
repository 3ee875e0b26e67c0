use super::BlockStub;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Emitted by `ReorgDetector::push`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The new head extends the previously emitted chain; process
    /// forward as usual.
    Forward(BlockStub),
    /// The new head's ancestor diverges from the retained suffix at
    /// `height`: everything at or above `height` in the old chain is
    /// orphaned. Emitted before the `Forward` event for the new head
    /// itself.
    ReorgTo(u64),
}

/// Maintains a bounded suffix of recently emitted heads (default 200
/// blocks) and detects reorgs by walking it backwards. Fails fast
/// (`Error::DeepReorg`, via the caller checking `push`'s `None`) when the
/// common ancestor falls outside the window.
pub struct ReorgDetector {
    suffix: VecDeque<BlockStub>,
    window: usize,
}

impl ReorgDetector {
    pub fn new(window: usize) -> Self {
        Self {
            suffix: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Feeds a newly observed head. Returns `None` on a deep reorg (the
    /// common ancestor isn't in the retained window); the caller must
    /// treat this as fatal (`Error::DeepReorg`).
    pub fn push(&mut self, new_head: BlockStub) -> Option<Vec<Event>> {
        if self.suffix.is_empty() {
            self.suffix.push_back(new_head);
            return Some(vec![Event::Forward(new_head)]);
        }

        let tip = *self.suffix.back().unwrap();
        if new_head.parent_hash == tip.hash {
            self.suffix.push_back(new_head);
            self.trim();
            return Some(vec![Event::Forward(new_head)]);
        }

        if new_head.hash == tip.hash {
            // Already-seen head, nothing to do.
            return Some(vec![]);
        }

        let ancestor_index = self
            .suffix
            .iter()
            .rposition(|stub| stub.hash == new_head.parent_hash);

        match ancestor_index {
            Some(index) => {
                let reorg_height = self.suffix[index].number + 1;
                warn!(reorg_height, "reorg detected, walking back to common ancestor");
                self.suffix.truncate(index + 1);
                self.suffix.push_back(new_head);
                self.trim();
                Some(vec![Event::ReorgTo(reorg_height), Event::Forward(new_head)])
            }
            None => {
                info!(
                    new_head = ?new_head,
                    "common ancestor not found in retained window, deep reorg"
                );
                None
            }
        }
    }

    fn trim(&mut self) {
        while self.suffix.len() > self.window {
            self.suffix.pop_front();
        }
    }
}
