//! Obsolete-prefix computation and deletion for the commit DAG

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::commit::{ClockEntry, Commit, CommitId, CommitPrunerDelegate, LiveCommitTracker};
use crate::coroutine::TaskHandle;
use crate::status::{Result, Status};

/// Gate for pruning cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningPolicy {
    /// Never delete anything; `prune` is a no-op
    #[default]
    Never,
    /// Prune the obsolete prefix as soon as a cycle runs
    LocalImmediate,
}

/// Computes and deletes the prefix of the commit DAG no live state depends
/// on.
///
/// A cycle finds the latest unique common ancestor (LUCA) of the live
/// commits, collects its full ancestor closure, filters out anything live,
/// and deletes the rest as one batch before recording the new boundary in
/// a clock entry. No commit reachable only through a live commit's history
/// beyond the boundary is ever touched, and nothing is deleted before the
/// whole closure is known.
///
/// The pruner takes no locks of its own; callers serialize all
/// storage-mutating tasks.
pub struct CommitPruner {
    delegate: Arc<dyn CommitPrunerDelegate>,
    tracker: Arc<dyn LiveCommitTracker>,
    policy: PruningPolicy,
}

impl CommitPruner {
    pub fn new(
        delegate: Arc<dyn CommitPrunerDelegate>,
        tracker: Arc<dyn LiveCommitTracker>,
        policy: PruningPolicy,
    ) -> Self {
        debug!(?policy, "CommitPruner::new: called");
        Self {
            delegate,
            tracker,
            policy,
        }
    }

    /// Run one pruning cycle
    pub async fn prune(&self, handle: &TaskHandle) -> Result<()> {
        debug!(policy = ?self.policy, "CommitPruner::prune: called");
        if self.policy == PruningPolicy::Never {
            return Ok(());
        }

        // single consistent snapshot for the whole cycle
        let live = self.tracker.live_commits();
        if live.is_empty() {
            debug!("CommitPruner::prune: empty live set, nothing to prune");
            return Ok(());
        }

        let Some(luca) = self.find_luca(&live).await? else {
            debug!("CommitPruner::prune: no unique common ancestor, nothing to prune");
            return Ok(());
        };
        debug!(luca = %luca.id, generation = luca.generation, "CommitPruner::prune: boundary found");

        let mut doomed = self.ancestor_closure(&luca).await?;
        let live_ids: HashSet<&CommitId> = live.iter().map(|commit| &commit.id).collect();
        // a commit in the live snapshot is never deleted, even when the
        // LUCA is itself live
        doomed.retain(|commit| !live_ids.contains(&commit.id));
        if doomed.is_empty() {
            debug!("CommitPruner::prune: closure already pruned");
            return Ok(());
        }

        let entry = ClockEntry::at_boundary(&luca);
        info!(count = doomed.len(), boundary = %luca.id, "pruning obsolete commits");
        self.delegate.delete_commits(handle, doomed).await?;
        self.delegate.update_self_clock_entry(handle, entry).await?;
        Ok(())
    }

    /// Latest unique common ancestor of the live set.
    ///
    /// The frontier is ordered by `(generation, id)`; the highest entry
    /// cannot be an ancestor of any other frontier entry, so repeatedly
    /// replacing it with its parents converges on the single newest commit
    /// below all of them. Returns `None` when no such commit exists:
    /// divergent histories, or a parent that is already pruned.
    async fn find_luca(&self, live: &[Commit]) -> Result<Option<Commit>> {
        let mut frontier: BTreeMap<(u64, CommitId), Commit> = BTreeMap::new();
        for commit in live {
            frontier.insert((commit.generation, commit.id.clone()), commit.clone());
        }

        while frontier.len() > 1 {
            let Some((_, newest)) = frontier.pop_last() else {
                break;
            };
            if newest.is_root() {
                // a root removed while other frontier entries remain can
                // have no common ancestor with them
                return Ok(None);
            }
            for parent_id in &newest.parents {
                match self.delegate.get_commit(parent_id).await {
                    Ok(parent) => {
                        frontier.insert((parent.generation, parent.id.clone()), parent);
                    }
                    Err(Status::NotFound(_)) => {
                        // the walk crossed the previously pruned boundary
                        debug!(parent = %parent_id, "CommitPruner::find_luca: parent already pruned");
                        return Ok(None);
                    }
                    Err(status) => return Err(status),
                }
            }
        }

        Ok(frontier.pop_last().map(|(_, commit)| commit))
    }

    /// Full ancestor closure of `luca`, itself included.
    ///
    /// Iterative worklist with a visited set; parent chains can be long
    /// and recursion would be unbounded. Already-pruned parents are the
    /// boundary and are skipped.
    async fn ancestor_closure(&self, luca: &Commit) -> Result<Vec<Commit>> {
        let mut visited: HashSet<CommitId> = HashSet::new();
        let mut worklist: Vec<CommitId> = luca.parents.clone();
        let mut closure = vec![luca.clone()];
        visited.insert(luca.id.clone());

        while let Some(id) = worklist.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match self.delegate.get_commit(&id).await {
                Ok(commit) => {
                    worklist.extend(commit.parents.iter().cloned());
                    closure.push(commit);
                }
                Err(Status::NotFound(_)) => {
                    debug!(commit = %id, "CommitPruner::ancestor_closure: already pruned");
                }
                Err(status) => return Err(status),
            }
        }

        debug!(size = closure.len(), "CommitPruner::ancestor_closure: computed");
        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct FakeDelegate {
        commits: Mutex<HashMap<CommitId, Commit>>,
        deleted: Mutex<Vec<CommitId>>,
        clock: Mutex<Option<ClockEntry>>,
        fail_delete: Mutex<Option<Status>>,
        fail_get: Mutex<Option<(CommitId, Status)>>,
    }

    impl FakeDelegate {
        fn with_commits(commits: Vec<Commit>) -> Arc<FakeDelegate> {
            let map = commits.into_iter().map(|commit| (commit.id.clone(), commit)).collect();
            Arc::new(FakeDelegate {
                commits: Mutex::new(map),
                deleted: Mutex::new(Vec::new()),
                clock: Mutex::new(None),
                fail_delete: Mutex::new(None),
                fail_get: Mutex::new(None),
            })
        }

        fn deleted_ids(&self) -> Vec<CommitId> {
            let mut ids = self.deleted.lock().expect("lock").clone();
            ids.sort();
            ids
        }

        fn remaining_ids(&self) -> Vec<CommitId> {
            let mut ids: Vec<_> = self.commits.lock().expect("lock").keys().cloned().collect();
            ids.sort();
            ids
        }

        fn clock_entry(&self) -> Option<ClockEntry> {
            self.clock.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl CommitPrunerDelegate for FakeDelegate {
        async fn get_commit(&self, id: &CommitId) -> crate::status::Result<Commit> {
            if let Some((bad_id, status)) = self.fail_get.lock().expect("lock").clone()
                && &bad_id == id
            {
                return Err(status);
            }
            self.commits
                .lock()
                .expect("lock")
                .get(id)
                .cloned()
                .ok_or_else(|| Status::NotFound(id.clone()))
        }

        async fn delete_commits(&self, _handle: &TaskHandle, commits: Vec<Commit>) -> crate::status::Result<()> {
            if let Some(status) = self.fail_delete.lock().expect("lock").clone() {
                return Err(status);
            }
            let mut map = self.commits.lock().expect("lock");
            let mut deleted = self.deleted.lock().expect("lock");
            for commit in commits {
                map.remove(&commit.id);
                deleted.push(commit.id);
            }
            Ok(())
        }

        async fn update_self_clock_entry(&self, _handle: &TaskHandle, entry: ClockEntry) -> crate::status::Result<()> {
            *self.clock.lock().expect("lock") = Some(entry);
            Ok(())
        }
    }

    struct FixedTracker {
        live: Vec<Commit>,
    }

    impl LiveCommitTracker for FixedTracker {
        fn live_commits(&self) -> Vec<Commit> {
            self.live.clone()
        }
    }

    fn commit(id: &str, parents: &[&str], generation: u64) -> Commit {
        Commit::new(
            id,
            parents.iter().map(|parent| parent.to_string()).collect(),
            generation,
            vec![],
        )
    }

    /// c0 <- c1 <- c2 with two children c3a and c3b of c2
    fn forked_chain() -> Vec<Commit> {
        vec![
            commit("c0", &[], 0),
            commit("c1", &["c0"], 1),
            commit("c2", &["c1"], 2),
            commit("c3a", &["c2"], 3),
            commit("c3b", &["c2"], 3),
        ]
    }

    fn pruner(delegate: &Arc<FakeDelegate>, live: Vec<Commit>, policy: PruningPolicy) -> CommitPruner {
        CommitPruner::new(
            Arc::clone(delegate) as Arc<dyn CommitPrunerDelegate>,
            Arc::new(FixedTracker { live }),
            policy,
        )
    }

    #[tokio::test]
    async fn test_prune_deletes_obsolete_prefix() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        let live = vec![commit("c3a", &["c2"], 3), commit("c3b", &["c2"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        assert_eq!(delegate.deleted_ids(), vec!["c0", "c1", "c2"]);
        assert_eq!(delegate.remaining_ids(), vec!["c3a", "c3b"]);
        let entry = delegate.clock_entry().expect("clock entry recorded");
        assert_eq!(entry.commit_id, "c2");
        assert_eq!(entry.generation, 2);
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        let live = vec![commit("c3a", &["c2"], 3), commit("c3b", &["c2"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);
        let handle = TaskHandle::detached();

        pruner.prune(&handle).await.expect("first cycle");
        pruner.prune(&handle).await.expect("second cycle");

        // the second cycle crosses the pruned boundary and deletes nothing
        assert_eq!(delegate.deleted_ids(), vec!["c0", "c1", "c2"]);
        assert_eq!(delegate.remaining_ids(), vec!["c3a", "c3b"]);
    }

    #[tokio::test]
    async fn test_never_policy_is_noop() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        let live = vec![commit("c3a", &["c2"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::Never);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        assert!(delegate.deleted_ids().is_empty());
        assert!(delegate.clock_entry().is_none());
    }

    #[tokio::test]
    async fn test_empty_live_set_prunes_nothing() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        let pruner = pruner(&delegate, vec![], PruningPolicy::LocalImmediate);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        assert!(delegate.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_divergent_roots_have_no_common_ancestor() {
        let delegate = FakeDelegate::with_commits(vec![commit("r1", &[], 0), commit("r2", &[], 0)]);
        let live = vec![commit("r1", &[], 0), commit("r2", &[], 0)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        assert!(delegate.deleted_ids().is_empty());
        assert_eq!(delegate.remaining_ids(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_single_live_commit_survives_its_own_closure() {
        let delegate = FakeDelegate::with_commits(vec![
            commit("c0", &[], 0),
            commit("c1", &["c0"], 1),
            commit("c2", &["c1"], 2),
        ]);
        let live = vec![commit("c2", &["c1"], 2)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        // the LUCA of a one-element live set is the live commit itself; it
        // must survive while its strict ancestors go
        assert_eq!(delegate.deleted_ids(), vec!["c0", "c1"]);
        assert_eq!(delegate.remaining_ids(), vec!["c2"]);
        assert_eq!(delegate.clock_entry().expect("clock entry").commit_id, "c2");
    }

    #[tokio::test]
    async fn test_merge_history_prunes_below_merge() {
        // r <- a <- m, r <- b <- m (m is a merge), live child of m
        let delegate = FakeDelegate::with_commits(vec![
            commit("r", &[], 0),
            commit("a", &["r"], 1),
            commit("b", &["r"], 1),
            commit("m", &["a", "b"], 2),
            commit("tip", &["m"], 3),
        ]);
        let live = vec![commit("tip", &["m"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        pruner.prune(&TaskHandle::detached()).await.expect("prune");

        assert_eq!(delegate.deleted_ids(), vec!["a", "b", "m", "r"]);
        assert_eq!(delegate.remaining_ids(), vec!["tip"]);
    }

    #[tokio::test]
    async fn test_delete_failure_aborts_cycle() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        *delegate.fail_delete.lock().expect("lock") = Some(Status::Io("disk full".to_string()));
        let live = vec![commit("c3a", &["c2"], 3), commit("c3b", &["c2"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        let result = pruner.prune(&TaskHandle::detached()).await;

        assert_eq!(result.err(), Some(Status::Io("disk full".to_string())));
        assert_eq!(delegate.remaining_ids(), vec!["c0", "c1", "c2", "c3a", "c3b"]);
        assert!(delegate.clock_entry().is_none(), "no boundary recorded on failure");
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_cycle() {
        let delegate = FakeDelegate::with_commits(forked_chain());
        *delegate.fail_get.lock().expect("lock") =
            Some(("c1".to_string(), Status::Io("read failed".to_string())));
        let live = vec![commit("c3a", &["c2"], 3), commit("c3b", &["c2"], 3)];
        let pruner = pruner(&delegate, live, PruningPolicy::LocalImmediate);

        let result = pruner.prune(&TaskHandle::detached()).await;

        assert_eq!(result.err(), Some(Status::Io("read failed".to_string())));
        assert!(delegate.deleted_ids().is_empty());
    }
}
