//! Per-branch tool-execution authorization (`spec.md` §4.6).
//!
//! No teacher equivalent — the teacher SDK executes every registered tool
//! unconditionally. Grounded directly on `spec.md` §4.6 and exercised by
//! [`crate::middleware::permission::PermissionMiddleware`].

use crate::event_bus::{Event, EventBus, PermissionChoice};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// `(toolName, argumentsFingerprint?)`, the cache key `spec.md` §4.6
/// specifies. The fingerprint is `None` when a cached decision should apply
/// to every call of that tool regardless of arguments (the common case for
/// `allowAlways`/`denyAlways`); callers that want per-argument caching pass
/// `Some(fingerprint)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tool_name: String,
    arguments_fingerprint: Option<String>,
}

/// A stable fingerprint of a tool call's arguments, used as the optional
/// half of [`CacheKey`]. Canonicalizes via `serde_json`'s key-sorted `Map`
/// rendering so equivalent argument objects with differently-ordered keys
/// hash identically.
pub fn fingerprint_arguments(arguments: &Value) -> String {
    serde_json::to_string(arguments).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachedDecision {
    AllowAlways,
    DenyAlways,
}

/// Per-branch allow/deny cache plus the one-shot ask flow through
/// [`EventBus`]. One instance guards one branch; [`crate::session::SessionManager`]
/// is expected to own one per active branch, matching the spec's "per-branch
/// lock" resource policy (§5) for permission state specifically.
#[derive(Default)]
pub struct PermissionBroker {
    decisions: Mutex<HashMap<CacheKey, CachedDecision>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves whether `tool_name(arguments)` may execute, consulting the
    /// cache first and falling back to a `PermissionRequest`/`PermissionResponse`
    /// round trip through `bus` otherwise.
    ///
    /// `fingerprint` is `None` for tools whose permission decision never
    /// depends on arguments; passing `Some` checks the `(name, fingerprint)`
    /// key before falling back to the `(name, None)` key, so an
    /// `allowAlways` granted for a bare tool name still covers
    /// argument-scoped lookups.
    pub async fn ask(
        &self,
        bus: &EventBus,
        permission_id: impl Into<String>,
        tool_name: &str,
        arguments: &Value,
        fingerprint: Option<String>,
    ) -> bool {
        if let Some(cached) = self.cached_decision(tool_name, fingerprint.as_deref()) {
            log::debug!("tool '{tool_name}' permission resolved from cache: {cached:?}");
            return cached == CachedDecision::AllowAlways;
        }

        let permission_id = permission_id.into();
        let pending = bus.await_response(permission_id.clone());
        bus.emit(Event::PermissionRequest {
            permission_id: permission_id.clone(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        });

        let choice = match pending.recv().await {
            Ok(Event::PermissionResponse { choice, .. }) => choice,
            // Cancelled (run terminated while waiting) or a mismatched
            // event delivered by a misbehaving caller: deny defensively.
            _ => {
                log::warn!("permission request {permission_id} for '{tool_name}' was cancelled before a response arrived, denying");
                PermissionChoice::Deny
            }
        };

        log::debug!("tool '{tool_name}' permission decision: {choice:?}");
        self.record(tool_name, fingerprint, choice);
        choice.is_approval()
    }

    fn cached_decision(&self, tool_name: &str, fingerprint: Option<&str>) -> Option<CachedDecision> {
        let decisions = self.decisions.lock().unwrap();
        if let Some(fp) = fingerprint {
            if let Some(d) = decisions.get(&CacheKey {
                tool_name: tool_name.to_string(),
                arguments_fingerprint: Some(fp.to_string()),
            }) {
                return Some(*d);
            }
        }
        decisions
            .get(&CacheKey {
                tool_name: tool_name.to_string(),
                arguments_fingerprint: None,
            })
            .copied()
    }

    fn record(&self, tool_name: &str, fingerprint: Option<String>, choice: PermissionChoice) {
        let cached = match choice {
            PermissionChoice::AllowAlways => Some(CachedDecision::AllowAlways),
            PermissionChoice::DenyAlways => Some(CachedDecision::DenyAlways),
            // `ask` (one-shot approve) and plain `deny` are not cached —
            // spec.md §4.6 only lists allowAlways/denyAlways as persistent.
            PermissionChoice::Ask | PermissionChoice::Deny => None,
        };
        if let Some(cached) = cached {
            self.decisions.lock().unwrap().insert(
                CacheKey {
                    tool_name: tool_name.to_string(),
                    arguments_fingerprint: fingerprint,
                },
                cached,
            );
        }
    }

    /// Persistent decisions currently cached, in the shape
    /// [`crate::session::Branch`] metadata stores them at `afterMessageTurn`
    /// (`spec.md` §4.6).
    pub fn persistent_decisions(&self) -> Vec<(String, Option<String>, bool)> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .map(|(key, decision)| {
                (
                    key.tool_name.clone(),
                    key.arguments_fingerprint.clone(),
                    *decision == CachedDecision::AllowAlways,
                )
            })
            .collect()
    }
}
