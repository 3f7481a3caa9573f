//! The session/branch model (`spec.md` §4.2, §4.9, §3 Session/Branch/ExecutionState
//! glossary entries).
//!
//! No teacher equivalent — the teacher's `Client` holds one linear history in
//! a `Vec<Message>` field with no forking. Everything here is grounded
//! directly on `spec.md` §3/§4.2/§4.9, with the persisted-state split
//! (`session.json` metadata + one `branches/<id>.json` per branch) described
//! in §6 driving the [`Session`]/[`Branch`] split below: `Session` is the
//! lightweight index a [`store::SessionStore`] keeps in `session.json`,
//! `Branch` is the potentially-large object kept in its own file.

pub mod manager;
pub mod store;

pub use manager::{BranchLock, SessionManager};
pub use store::{InMemorySessionStore, JsonFileSessionStore, SessionStore};

use crate::event_bus::TerminationReason;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A conversation: a stable id, creation metadata, and the index of branches
/// that belong to it (`spec.md` §3). Invariant: `branch_ids` always contains
/// `"main"` from creation until the session is deleted — enforced by
/// [`SessionManager::create_session`] and by every delete path refusing to
/// remove `main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at_ms: u64,
    pub metadata: HashMap<String, Value>,
    pub active_branch_id: String,
    pub branch_ids: Vec<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            id: id.into(),
            created_at_ms,
            metadata: HashMap::new(),
            active_branch_id: "main".to_string(),
            branch_ids: vec!["main".to_string()],
        }
    }
}

/// One linear message history plus its fork/sibling linkage (`spec.md` §3,
/// §4.2 fork/delete contracts).
///
/// `created_seq` is an opaque monotonically-increasing id assigned at branch
/// creation, used only to recover insertion order when recomputing sibling
/// linkage (a doubly-linked list has no other way to know which sibling came
/// first without it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub session_id: String,
    pub created_seq: u64,
    pub messages: Vec<Message>,
    pub parent_id: Option<String>,
    pub forked_at_message_index: Option<usize>,
    pub previous_sibling_id: Option<String>,
    pub next_sibling_id: Option<String>,
    pub sibling_index: usize,
    pub total_siblings: usize,
    pub children: Vec<String>,
    /// Ancestor ids from the root branch down to (not including) this one,
    /// one entry per depth — the "lineage map from depth to ancestor id"
    /// `spec.md` §3 names, represented positionally rather than as an
    /// explicit `HashMap<usize, String>` since depths are always contiguous
    /// from zero.
    pub lineage: Vec<String>,
    pub execution_state: Option<ExecutionState>,
}

impl Branch {
    /// Builds the root `main` branch of a brand-new session.
    pub fn main(session_id: impl Into<String>, created_seq: u64) -> Self {
        Self {
            id: "main".to_string(),
            session_id: session_id.into(),
            created_seq,
            messages: Vec::new(),
            parent_id: None,
            forked_at_message_index: None,
            previous_sibling_id: None,
            next_sibling_id: None,
            sibling_index: 0,
            total_siblings: 1,
            children: Vec::new(),
            lineage: Vec::new(),
            execution_state: None,
        }
    }
}

/// An immutable snapshot of a suspended or in-progress run, produced at
/// checkpoint boundaries (`spec.md` §3). Consumed by [`crate::agent_loop::AgentLoop`]
/// to resume a branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    pub iteration: u32,
    pub terminated: bool,
    pub termination_reason: Option<TerminationReason>,
    pub consecutive_error_count: u32,
    pub completed_tool_call_ids: HashSet<String>,
    pub expanded_containers: HashSet<String>,
    pub middleware_state: MiddlewareStateBag,
}

/// Per-middleware persisted state (`spec.md` §3's "middleware state bag").
///
/// `spec.md` §9 REDESIGN FLAGS calls out the obvious implementation
/// ("reflective heterogeneous map") as the thing to *not* build in a typed
/// language and asks for either a tagged sum or per-middleware typed slots
/// instead; this is the latter. Of the six standard middlewares, only
/// [`crate::middleware::permission::PermissionMiddleware`] has anything
/// worth persisting across a checkpoint (retry/timeout/error-formatting
/// state is scoped to one `executeFunction` call and container/history
/// state already lives in [`ExecutionState::expanded_containers`] and the
/// branch's message list respectively) — so this starts as a one-field
/// struct, not a placeholder for an `Any` map. A seventh middleware with its
/// own resumable state adds a field here, typed, at compile time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareStateBag {
    pub permission: PermissionState,
}

/// Cached allow/deny decisions, persisted into the branch's checkpoint at
/// `afterMessageTurn` (`spec.md` §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionState {
    pub decisions: Vec<PermissionDecisionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecisionRecord {
    pub tool_name: String,
    pub arguments_fingerprint: Option<String>,
    pub allow: bool,
}

/// Recomputes sibling linkage for a set of branches known to share the same
/// `(parent, forkedAtMessageIndex)`, ordered by `created_seq` (`spec.md`
/// §4.2 fork contract point (c); §8 invariant 4 "sibling renumbering").
///
/// Assigns a 0-based contiguous `sibling_index`, a shared `total_siblings`,
/// and doubly-linked `previous_sibling_id`/`next_sibling_id` pointers.
/// Callers pass exactly the branches that must be re-persisted afterward.
pub(crate) fn renumber_siblings(siblings: &mut [&mut Branch]) {
    siblings.sort_by_key(|b| b.created_seq);
    let total = siblings.len();
    for i in 0..total {
        siblings[i].sibling_index = i;
        siblings[i].total_siblings = total;
    }
    for i in 0..total {
        let prev_id = if i > 0 { Some(siblings[i - 1].id.clone()) } else { None };
        let next_id = if i + 1 < total { Some(siblings[i + 1].id.clone()) } else { None };
        siblings[i].previous_sibling_id = prev_id;
        siblings[i].next_sibling_id = next_id;
    }
}
