//! [`SessionStore`] and its two required implementations (`spec.md` §4.2):
//! an in-memory store and a file-backed JSON store, interchangeable behind
//! the same trait.

use super::{Branch, Session, renumber_siblings};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

/// Persistence of sessions, branches, and their fork/sibling linkage
/// (`spec.md` §4.2). Implementations must be internally concurrency-safe
/// (`spec.md` §5 Shared-resource policy) — callers never wrap a `dyn
/// SessionStore` in their own lock.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, id: &str) -> Result<Session>;
    async fn save_session(&self, session: &Session) -> Result<()>;
    async fn load_branch(&self, session_id: &str, branch_id: &str) -> Result<Branch>;
    async fn save_branch(&self, branch: &Branch) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<String>>;
    async fn list_branches(&self, session_id: &str) -> Result<Vec<String>>;
    async fn delete_branch(&self, session_id: &str, branch_id: &str, recursive: bool) -> Result<()>;

    /// Atomically (`spec.md` §4.2 fork contract):
    /// (a) copies messages `[0..from_message_index)` from the parent branch
    ///     into a new branch with id `new_branch_id`;
    /// (b) sets the new branch's parent pointer, fork index, and lineage;
    /// (c) updates the parent's child list and renumbers sibling linkage for
    ///     every branch sharing `(parent_branch_id, from_message_index)`.
    async fn fork_branch(
        &self,
        session_id: &str,
        parent_branch_id: &str,
        from_message_index: usize,
        new_branch_id: &str,
    ) -> Result<Branch>;
}

/// Assembles the new branch and the renumbered sibling set for a fork,
/// shared by both store implementations so the fork contract (`spec.md`
/// §4.2, §8 invariant 3) is only implemented once. `existing_siblings` is
/// every other branch already sharing `(parent.id, from_message_index)`,
/// loaded by the caller from whatever storage backend it uses.
fn build_fork(
    parent: &mut Branch,
    mut existing_siblings: Vec<Branch>,
    from_message_index: usize,
    new_branch_id: &str,
    created_seq: u64,
) -> (Branch, Vec<Branch>) {
    let mut lineage = parent.lineage.clone();
    lineage.push(parent.id.clone());

    let new_branch = Branch {
        id: new_branch_id.to_string(),
        session_id: parent.session_id.clone(),
        created_seq,
        messages: parent.messages[..from_message_index.min(parent.messages.len())].to_vec(),
        parent_id: Some(parent.id.clone()),
        forked_at_message_index: Some(from_message_index),
        previous_sibling_id: None,
        next_sibling_id: None,
        sibling_index: 0,
        total_siblings: 0,
        children: Vec::new(),
        lineage,
        execution_state: None,
    };

    parent.children.push(new_branch_id.to_string());

    existing_siblings.push(new_branch.clone());
    {
        let mut refs: Vec<&mut Branch> = existing_siblings.iter_mut().collect();
        renumber_siblings(&mut refs);
    }
    let new_branch = existing_siblings
        .iter()
        .find(|b| b.id == new_branch_id)
        .cloned()
        .expect("new branch was just pushed into existing_siblings");
    let renumbered_existing: Vec<Branch> = existing_siblings
        .into_iter()
        .filter(|b| b.id != new_branch_id)
        .collect();

    (new_branch, renumbered_existing)
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    branches: HashMap<(String, String), Branch>,
    seq: u64,
}

/// Thread-safe in-memory [`SessionStore`], backed by plain `HashMap`s behind
/// a single `Mutex` — the teacher's general preference (see `tools.rs`'s
/// `ToolRegistry`) for a concrete lock-guarded struct over a sharded or
/// lock-free design, since session/branch traffic is not a hot path.
#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<MemoryState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_session(&self, id: &str) -> Result<Session> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_branch(&self, session_id: &str, branch_id: &str) -> Result<Branch> {
        let state = self.state.lock().unwrap();
        state
            .branches
            .get(&(session_id.to_string(), branch_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::BranchNotFound(session_id.to_string(), branch_id.to_string()))
    }

    async fn save_branch(&self, branch: &Branch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .branches
            .insert((branch.session_id.clone(), branch.id.clone()), branch.clone());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.keys().cloned().collect())
    }

    async fn list_branches(&self, session_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .branches
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, bid)| bid.clone())
            .collect())
    }

    async fn delete_branch(&self, session_id: &str, branch_id: &str, recursive: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        delete_branch_locked(&mut state.branches, session_id, branch_id, recursive)
    }

    async fn fork_branch(
        &self,
        session_id: &str,
        parent_branch_id: &str,
        from_message_index: usize,
        new_branch_id: &str,
    ) -> Result<Branch> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let seq = state.seq;

        let mut parent = state
            .branches
            .get(&(session_id.to_string(), parent_branch_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::BranchNotFound(session_id.to_string(), parent_branch_id.to_string()))?;

        let existing_siblings: Vec<Branch> = state
            .branches
            .values()
            .filter(|b| {
                b.session_id == session_id
                    && b.parent_id.as_deref() == Some(parent_branch_id)
                    && b.forked_at_message_index == Some(from_message_index)
            })
            .cloned()
            .collect();

        let (new_branch, renumbered_existing) =
            build_fork(&mut parent, existing_siblings, from_message_index, new_branch_id, seq);

        state
            .branches
            .insert((session_id.to_string(), parent_branch_id.to_string()), parent);
        for sibling in renumbered_existing {
            state.branches.insert((session_id.to_string(), sibling.id.clone()), sibling);
        }
        state
            .branches
            .insert((session_id.to_string(), new_branch_id.to_string()), new_branch.clone());

        Ok(new_branch)
    }
}

/// Shared delete+renormalize logic (`spec.md` §4.2 delete contract, §8
/// invariant 4), parameterized over the in-memory map so both stores can
/// reuse it without implementing sibling renumbering twice.
fn delete_branch_locked(
    branches: &mut HashMap<(String, String), Branch>,
    session_id: &str,
    branch_id: &str,
    recursive: bool,
) -> Result<()> {
    if branch_id == "main" {
        return Err(Error::store("the main branch cannot be deleted"));
    }

    let target = branches
        .get(&(session_id.to_string(), branch_id.to_string()))
        .cloned()
        .ok_or_else(|| Error::BranchNotFound(session_id.to_string(), branch_id.to_string()))?;

    if !recursive && !target.children.is_empty() {
        return Err(Error::store(format!(
            "branch {branch_id} has children; pass recursive=true to delete them"
        )));
    }

    if recursive {
        for child_id in target.children.clone() {
            delete_branch_locked(branches, session_id, &child_id, true)?;
        }
    }

    branches.remove(&(session_id.to_string(), branch_id.to_string()));

    if let Some(parent_id) = &target.parent_id {
        if let Some(parent) = branches.get_mut(&(session_id.to_string(), parent_id.clone())) {
            parent.children.retain(|c| c != branch_id);
        }
    }

    if let Some(fork_index) = target.forked_at_message_index {
        let mut remaining_siblings: Vec<Branch> = branches
            .values()
            .filter(|b| {
                b.session_id == session_id
                    && b.parent_id == target.parent_id
                    && b.forked_at_message_index == Some(fork_index)
            })
            .cloned()
            .collect();
        {
            let mut refs: Vec<&mut Branch> = remaining_siblings.iter_mut().collect();
            renumber_siblings(&mut refs);
        }
        for sibling in remaining_siblings {
            branches.insert((session_id.to_string(), sibling.id.clone()), sibling);
        }
    }

    Ok(())
}

/// File-backed [`SessionStore`]: one directory per session at
/// `<root>/<sessionId>/`, holding `session.json` (metadata + branch index)
/// and `branches/<branchId>.json` (messages + execution state), per `spec.md`
/// §6. Writes are atomic (temp file + rename) and serialized per branch via
/// `file_locks`, matching §5's "the JSON implementation serializes writes
/// per-branch and uses atomic rename".
pub struct JsonFileSessionStore {
    root: PathBuf,
    /// One lock per `(session, branch)` file, so concurrent writers to
    /// *different* branches of the same session never block each other
    /// (`spec.md` §9 Open Questions: cross-branch atomicity of the session
    /// index is explicitly unspecified; only per-branch atomicity is
    /// required). The outer mutex only guards inserts into this map; the
    /// per-key `Arc<AsyncMutex<()>>` is what's actually held across a
    /// branch's write.
    file_locks: AsyncMutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

const SCHEMA_VERSION: u32 = 1;

impl JsonFileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &(String, String)) -> Arc<AsyncMutex<()>> {
        let mut locks = self.file_locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn branch_file(&self, session_id: &str, branch_id: &str) -> PathBuf {
        self.session_dir(session_id).join("branches").join(format!("{branch_id}.json"))
    }

    /// Writes `contents` to `path` via a temp file in the same directory
    /// followed by a rename, so a crash mid-write never leaves a truncated
    /// file in place.
    async fn write_atomic(&self, path: &PathBuf, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &PathBuf) -> Result<T> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    #[serde(flatten)]
    data: T,
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load_session(&self, id: &str) -> Result<Session> {
        let path = self.session_file(id);
        let envelope: Envelope<Session> = self
            .read_json(&path)
            .await
            .map_err(|_| Error::SessionNotFound(id.to_string()))?;
        Ok(envelope.data)
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            data: session.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.write_atomic(&self.session_file(&session.id), &bytes).await
    }

    async fn load_branch(&self, session_id: &str, branch_id: &str) -> Result<Branch> {
        let path = self.branch_file(session_id, branch_id);
        let envelope: Envelope<Branch> = self
            .read_json(&path)
            .await
            .map_err(|_| Error::BranchNotFound(session_id.to_string(), branch_id.to_string()))?;
        Ok(envelope.data)
    }

    async fn save_branch(&self, branch: &Branch) -> Result<()> {
        let key = (branch.session_id.clone(), branch.id.clone());
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            data: branch.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        let path = self.branch_file(&key.0, &key.1);
        log::debug!("checkpointing branch {}/{}", key.0, key.1);
        self.write_atomic(&path, &bytes).await
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn list_branches(&self, session_id: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let dir = self.session_dir(session_id).join("branches");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json") {
                    out.push(id.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn delete_branch(&self, session_id: &str, branch_id: &str, recursive: bool) -> Result<()> {
        if branch_id == "main" {
            return Err(Error::store("the main branch cannot be deleted"));
        }
        let target = self.load_branch(session_id, branch_id).await?;
        if !recursive && !target.children.is_empty() {
            return Err(Error::store(format!(
                "branch {branch_id} has children; pass recursive=true to delete them"
            )));
        }
        if recursive {
            for child_id in target.children.clone() {
                Box::pin(self.delete_branch(session_id, &child_id, true)).await?;
            }
        }

        fs::remove_file(self.branch_file(session_id, branch_id)).await.ok();

        if let Some(parent_id) = &target.parent_id {
            if let Ok(mut parent) = self.load_branch(session_id, parent_id).await {
                parent.children.retain(|c| c != branch_id);
                self.save_branch(&parent).await?;
            }
        }

        if let Some(fork_index) = target.forked_at_message_index {
            let all_branch_ids = self.list_branches(session_id).await?;
            let mut remaining_siblings = Vec::new();
            for id in all_branch_ids {
                let b = self.load_branch(session_id, &id).await?;
                if b.parent_id == target.parent_id && b.forked_at_message_index == Some(fork_index) {
                    remaining_siblings.push(b);
                }
            }
            {
                let mut refs: Vec<&mut Branch> = remaining_siblings.iter_mut().collect();
                renumber_siblings(&mut refs);
            }
            for sibling in remaining_siblings {
                self.save_branch(&sibling).await?;
            }
        }

        Ok(())
    }

    async fn fork_branch(
        &self,
        session_id: &str,
        parent_branch_id: &str,
        from_message_index: usize,
        new_branch_id: &str,
    ) -> Result<Branch> {
        let mut parent = self.load_branch(session_id, parent_branch_id).await?;

        let all_branch_ids = self.list_branches(session_id).await?;
        let mut existing_siblings = Vec::new();
        for id in all_branch_ids {
            let b = self.load_branch(session_id, &id).await?;
            if b.parent_id.as_deref() == Some(parent_branch_id) && b.forked_at_message_index == Some(from_message_index) {
                existing_siblings.push(b);
            }
        }

        let seq = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let (new_branch, renumbered_existing) =
            build_fork(&mut parent, existing_siblings, from_message_index, new_branch_id, seq);

        self.save_branch(&parent).await?;
        for sibling in renumbered_existing {
            self.save_branch(&sibling).await?;
        }
        self.save_branch(&new_branch).await?;

        Ok(new_branch)
    }
}
