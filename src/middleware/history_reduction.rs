//! Adapts [`crate::history::reduce`] to the `beforeIteration` seam
//! (`spec.md` §4.5, §4.7). The only standard middleware that touches
//! `ctx.messages` rather than `ctx.visible_tools`.

use crate::history::{HistoryReductionConfig, Reduction, reduce};
use crate::types::Message;

pub struct HistoryReductionMiddleware {
    config: HistoryReductionConfig,
}

impl HistoryReductionMiddleware {
    pub fn new(config: HistoryReductionConfig) -> Self {
        Self { config }
    }

    pub fn reduce(&self, messages: &[Message]) -> Reduction {
        reduce(messages, &self.config)
    }
}
