//! Adapts [`crate::permission::PermissionBroker`] to the
//! `beforeToolExecution` seam (`spec.md` §4.5, §4.6).

use super::PendingToolCall;
use crate::event_bus::EventBus;
use crate::permission::{PermissionBroker, fingerprint_arguments};

pub struct PermissionMiddleware {
    broker: PermissionBroker,
}

impl PermissionMiddleware {
    pub fn new() -> Self {
        Self {
            broker: PermissionBroker::new(),
        }
    }

    /// Resolves whether `call` may execute, deriving a stable permission id
    /// from the call id (one permission round trip per tool call) and a
    /// fingerprint from its arguments so `allowAlways` can be scoped either
    /// to the bare tool name or to specific argument shapes depending on
    /// what the cache already holds.
    pub async fn check(&self, bus: &EventBus, call: &PendingToolCall) -> bool {
        let permission_id = format!("perm-{}", call.call_id);
        let fingerprint = fingerprint_arguments(&call.arguments);
        self.broker
            .ask(bus, permission_id, &call.name, &call.arguments, Some(fingerprint))
            .await
    }

    /// Decisions cached on this middleware's broker, in the shape
    /// [`crate::session::Branch`] persists at `afterMessageTurn`.
    pub fn persistent_decisions(&self) -> Vec<(String, Option<String>, bool)> {
        self.broker.persistent_decisions()
    }
}

impl Default for PermissionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}
