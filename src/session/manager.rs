//! [`SessionManager`]: the single entry point `spec.md` §4.9 describes for
//! creating sessions, activating/forking branches, and enforcing
//! at-most-one-active-run-per-branch (`spec.md` §5, §8 invariant 10).

use super::{Branch, Session, SessionStore};
use crate::error::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

/// Bound on the in-memory branch cache. Not configurable via
/// [`crate::config::RuntimeConfig`] today — `spec.md` §4.9 leaves the cache
/// size as an implementation detail, not an external contract.
const BRANCH_CACHE_CAPACITY: usize = 64;

/// Minimal LRU keyed by `(session_id, branch_id)`. The teacher's dependency
/// stack has no `lru` crate, so this hand-rolls the one thing actually
/// needed: evict the least-recently-touched entry once over capacity. A
/// `VecDeque` recency list plus a capacity check on insert is enough at this
/// scale; it does not aim to be an O(1) general-purpose LRU.
struct BranchCache {
    capacity: usize,
    recency: VecDeque<(String, String)>,
    entries: std::collections::HashMap<(String, String), Branch>,
}

impl BranchCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recency: VecDeque::new(),
            entries: std::collections::HashMap::new(),
        }
    }

    fn touch(&mut self, key: &(String, String)) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.clone());
    }

    fn get(&mut self, key: &(String, String)) -> Option<Branch> {
        let hit = self.entries.get(key).cloned();
        if hit.is_some() {
            self.touch(key);
        }
        hit
    }

    fn put(&mut self, key: (String, String), branch: Branch) {
        self.entries.insert(key.clone(), branch);
        self.touch(&key);
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn invalidate(&mut self, key: &(String, String)) {
        self.entries.remove(key);
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
    }
}

/// RAII guard for the at-most-one-active-run-per-branch invariant
/// (`spec.md` §8 invariant 10). Held for the duration of an
/// [`crate::agent_loop::AgentLoop`] run; dropping it (including on panic or
/// early return) releases the branch for the next run.
pub struct BranchLock {
    key: (String, String),
    active: Arc<StdMutex<HashSet<(String, String)>>>,
}

impl Drop for BranchLock {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.key);
    }
}

/// Owns a [`SessionStore`], a bounded branch cache, and the active-run
/// registry that backs [`BranchLock`]. `spec.md` §4.9 describes this as the
/// single object through which callers create sessions and fork/activate
/// branches, rather than touching a `SessionStore` directly.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cache: StdMutex<BranchCache>,
    active_runs: Arc<StdMutex<HashSet<(String, String)>>>,
    seq: StdMutex<u64>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            cache: StdMutex::new(BranchCache::new(BRANCH_CACHE_CAPACITY)),
            active_runs: Arc::new(StdMutex::new(HashSet::new())),
            seq: StdMutex::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        *seq
    }

    /// Creates a brand-new session with a single `main` branch, persists
    /// both, and returns the session.
    pub async fn create_session(&self, session_id: impl Into<String>, created_at_ms: u64) -> Result<Session> {
        let session_id = session_id.into();
        let session = Session::new(session_id.clone(), created_at_ms);
        let main = Branch::main(session_id.clone(), self.next_seq());

        self.store.save_session(&session).await?;
        self.store.save_branch(&main).await?;
        self.cache
            .lock()
            .unwrap()
            .put((session_id.clone(), "main".to_string()), main);

        Ok(session)
    }

    /// Loads a branch, preferring the in-memory cache over the backing
    /// store.
    pub async fn load(&self, session_id: &str, branch_id: &str) -> Result<Branch> {
        let key = (session_id.to_string(), branch_id.to_string());
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return Ok(cached);
        }
        let branch = self.store.load_branch(session_id, branch_id).await?;
        self.cache.lock().unwrap().put(key, branch.clone());
        Ok(branch)
    }

    /// Sets `branch_id` as the session's active branch (`spec.md` §4.9
    /// "activate"). Fails if the branch does not exist.
    pub async fn activate_branch(&self, session_id: &str, branch_id: &str) -> Result<Session> {
        self.load(session_id, branch_id).await?;
        let mut session = self.store.load_session(session_id).await?;
        session.active_branch_id = branch_id.to_string();
        self.store.save_session(&session).await?;
        Ok(session)
    }

    /// Forks `parent_branch_id` at `from_message_index` into a new branch
    /// (`spec.md` §4.9 "fork-for-edit"/"regenerate"), invalidating any
    /// cached copy of the parent and every sibling whose linkage the fork
    /// contract rewrites.
    pub async fn fork_branch_at_message(
        &self,
        session_id: &str,
        parent_branch_id: &str,
        from_message_index: usize,
        new_branch_id: impl Into<String>,
    ) -> Result<Branch> {
        let new_branch_id = new_branch_id.into();
        let new_branch = self
            .store
            .fork_branch(session_id, parent_branch_id, from_message_index, &new_branch_id)
            .await?;

        let mut cache = self.cache.lock().unwrap();
        cache.invalidate(&(session_id.to_string(), parent_branch_id.to_string()));
        cache.put(
            (session_id.to_string(), new_branch_id.clone()),
            new_branch.clone(),
        );
        drop(cache);

        let mut session = self.store.load_session(session_id).await?;
        if !session.branch_ids.contains(&new_branch_id) {
            session.branch_ids.push(new_branch_id.clone());
            self.store.save_session(&session).await?;
        }

        Ok(new_branch)
    }

    /// Deletes a branch (`spec.md` §4.2 delete contract), recursing into
    /// descendants when `recursive` is set, and drops any cached copies.
    pub async fn delete_branch(&self, session_id: &str, branch_id: &str, recursive: bool) -> Result<()> {
        self.store.delete_branch(session_id, branch_id, recursive).await?;
        self.cache
            .lock()
            .unwrap()
            .invalidate(&(session_id.to_string(), branch_id.to_string()));

        let mut session = self.store.load_session(session_id).await?;
        session.branch_ids.retain(|id| id != branch_id);
        self.store.save_session(&session).await?;
        Ok(())
    }

    /// Acquires the at-most-one-active-run-per-branch lock for
    /// `(session_id, branch_id)` (`spec.md` §8 invariant 10). Rejects
    /// deterministically — returns [`Error::BranchLocked`] immediately
    /// rather than queueing — if a run is already active on that branch.
    pub fn acquire_branch_lock(&self, session_id: &str, branch_id: &str) -> Result<BranchLock> {
        let key = (session_id.to_string(), branch_id.to_string());
        let mut active = self.active_runs.lock().unwrap();
        if active.contains(&key) {
            return Err(Error::BranchLocked(branch_id.to_string()));
        }
        active.insert(key.clone());
        drop(active);
        Ok(BranchLock {
            key,
            active: Arc::clone(&self.active_runs),
        })
    }

    pub async fn persist_branch(&self, branch: &Branch) -> Result<()> {
        self.store.save_branch(branch).await?;
        self.cache.lock().unwrap().put(
            (branch.session_id.clone(), branch.id.clone()),
            branch.clone(),
        );
        Ok(())
    }
}
