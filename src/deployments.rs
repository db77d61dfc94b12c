//! Deployment records, CI status mapping and history reconciliation.
//!
//! Two sources describe deployments:
//!
//! - the **local log** ([`DeploymentLog`]): deployments this admin started,
//!   keyed by commit sha, capped, persisted in [`LocalState`];
//! - the **remote history** ([`RunHistory`]): the CI system's own run list.
//!   Authoritative, but unaware of which content item triggered a run and
//!   possibly a few seconds behind a fresh commit.
//!
//! [`merge_history`] folds both into one display list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{CmsError, CmsResult};
use crate::local_state::{LocalState, DEPLOYMENTS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Skipped,
    /// Given up on locally after the tracking timeout.
    TimedOut,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Ordering used to keep status changes monotonic.
    pub fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::Queued => 1,
            DeploymentStatus::InProgress => 2,
            _ => 3,
        }
    }

    /// Failures deserve a failure banner. Cancelled and skipped runs were
    /// superseded by a later commit and are not errors.
    pub fn is_failure(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::TimedOut)
    }

    /// Map a GitHub Actions `status` / `conclusion` pair.
    pub fn from_ci(status: &str, conclusion: Option<&str>) -> Self {
        match (status, conclusion) {
            ("completed", Some("success")) => DeploymentStatus::Completed,
            ("completed", Some("failure")) => DeploymentStatus::Failed,
            ("completed", Some("cancelled")) => DeploymentStatus::Cancelled,
            ("completed", Some("skipped")) => DeploymentStatus::Skipped,
            ("completed", Some("timed_out")) | ("completed", Some("startup_failure")) => {
                DeploymentStatus::Failed
            }
            ("completed", _) => DeploymentStatus::Completed,
            ("in_progress", _) => DeploymentStatus::InProgress,
            ("pending", _) => DeploymentStatus::Pending,
            // queued, waiting, requested
            _ => DeploymentStatus::Queued,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
            DeploymentStatus::Skipped => "skipped",
            DeploymentStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build/publish cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub commit_sha: String,
    /// What triggered it, e.g. `Update post 2025-01-01-x.md`.
    pub action: String,
    /// Content item behind the change. Only known for locally started deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds from start to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Deployment {
    pub fn pending(
        commit_sha: impl Into<String>,
        action: impl Into<String>,
        item_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            action: action.into(),
            item_id,
            status: DeploymentStatus::Pending,
            started_at,
            completed_at: None,
            duration: None,
            url: None,
        }
    }

    /// Timestamp the history is ordered by.
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }

    /// Mark terminal at `at`, filling in the duration.
    pub fn finish(&mut self, status: DeploymentStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.duration = Some((at - self.started_at).num_seconds().max(0));
    }
}

/// A CI workflow run as reported by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub commit_sha: String,
    pub display_title: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: Option<String>,
}

impl WorkflowRun {
    pub fn deployment_status(&self) -> DeploymentStatus {
        DeploymentStatus::from_ci(&self.status, self.conclusion.as_deref())
    }

    pub fn to_deployment(&self) -> Deployment {
        let status = self.deployment_status();
        let mut d = Deployment {
            commit_sha: self.commit_sha.clone(),
            action: self.display_title.clone(),
            item_id: None,
            status,
            started_at: self.created_at,
            completed_at: None,
            duration: None,
            url: self.url.clone(),
        };
        if status.is_terminal() {
            d.finish(status, self.updated_at);
        }
        d
    }
}

/// The CI system's run history.
#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> CmsResult<Vec<WorkflowRun>>;

    /// Latest run for `commit_sha`, or `None` if CI has not picked it up yet.
    async fn run_for_commit(&self, commit_sha: &str) -> CmsResult<Option<WorkflowRun>>;
}

/// Merge the local log with remote history.
///
/// Remote records win for the same commit sha and are emitted once. The
/// result is ordered newest first by `completed_at`, falling back to
/// `started_at`. Ties keep input order, so the merge is deterministic.
pub fn merge_history(local: &[Deployment], remote: &[Deployment]) -> Vec<Deployment> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, r) in remote.iter().enumerate() {
        index.entry(r.commit_sha.as_str()).or_insert(i);
    }

    let mut merged = Vec::with_capacity(local.len() + remote.len());
    for l in local {
        match index.remove(l.commit_sha.as_str()) {
            Some(i) => merged.push(remote[i].clone()),
            None => merged.push(l.clone()),
        }
    }
    for (i, r) in remote.iter().enumerate() {
        if index.get(r.commit_sha.as_str()) == Some(&i) {
            index.remove(r.commit_sha.as_str());
            merged.push(r.clone());
        }
    }

    merged.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    merged
}

/// Capped log of finished deployments, persisted under [`DEPLOYMENTS_KEY`].
pub struct DeploymentLog {
    max: usize,
    records: Mutex<VecDeque<Deployment>>,
    state: Arc<LocalState>,
}

impl DeploymentLog {
    pub fn load(state: Arc<LocalState>, max: usize) -> Self {
        let mut records: VecDeque<Deployment> = state
            .get::<Vec<Deployment>>(DEPLOYMENTS_KEY)
            .unwrap_or_default()
            .into();
        while records.len() > max {
            records.pop_front();
        }
        Self {
            max,
            records: Mutex::new(records),
            state,
        }
    }

    /// Append (or replace the record for the same commit), evicting the oldest.
    pub fn record(&self, deployment: Deployment) -> CmsResult<()> {
        let snapshot: Vec<Deployment> = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.retain(|d| d.commit_sha != deployment.commit_sha);
            records.push_back(deployment);
            while records.len() > self.max {
                records.pop_front();
            }
            records.iter().cloned().collect()
        };
        self.state.set(DEPLOYMENTS_KEY, &snapshot)
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<Deployment> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn contains(&self, commit_sha: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|d| d.commit_sha == commit_sha)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`RunHistory`] for tests and offline runs.
#[derive(Default)]
pub struct MemoryRunHistory {
    runs: Mutex<Vec<WorkflowRun>>,
    failing: Mutex<bool>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the run for `run.commit_sha`, newest first.
    pub fn upsert(&self, run: WorkflowRun) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.retain(|r| r.commit_sha != run.commit_sha);
        runs.insert(0, run);
    }

    /// Make every call fail with a network-style error until reset.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    fn check(&self) -> CmsResult<()> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(CmsError::Timeout("memory run history".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn recent_runs(&self, limit: usize) -> CmsResult<Vec<WorkflowRun>> {
        self.check()?;
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runs.iter().take(limit).cloned().collect())
    }

    async fn run_for_commit(&self, commit_sha: &str) -> CmsResult<Option<WorkflowRun>> {
        self.check()?;
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runs.iter().find(|r| r.commit_sha == commit_sha).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn local(sha: &str, started: i64) -> Deployment {
        Deployment::pending(sha, format!("local {}", sha), Some(format!("item-{}", sha)), t(started))
    }

    fn remote(sha: &str, status: DeploymentStatus, started: i64, done: Option<i64>) -> Deployment {
        let mut d = Deployment::pending(sha, format!("remote {}", sha), None, t(started));
        d.status = status;
        if let Some(done) = done {
            d.finish(status, t(done));
        }
        d
    }

    #[test]
    fn test_ci_status_mapping() {
        use DeploymentStatus::*;
        assert_eq!(DeploymentStatus::from_ci("completed", Some("success")), Completed);
        assert_eq!(DeploymentStatus::from_ci("completed", Some("failure")), Failed);
        assert_eq!(DeploymentStatus::from_ci("completed", Some("cancelled")), Cancelled);
        assert_eq!(DeploymentStatus::from_ci("completed", Some("skipped")), Skipped);
        assert_eq!(DeploymentStatus::from_ci("in_progress", None), InProgress);
        assert_eq!(DeploymentStatus::from_ci("queued", None), Queued);
        assert_eq!(DeploymentStatus::from_ci("pending", None), Pending);
        assert_eq!(DeploymentStatus::from_ci("waiting", None), Queued);
    }

    #[test]
    fn test_terminal_and_failure_classes() {
        use DeploymentStatus::*;
        for s in [Completed, Failed, Cancelled, Skipped, TimedOut] {
            assert!(s.is_terminal(), "{} should be terminal", s);
        }
        for s in [Pending, Queued, InProgress] {
            assert!(!s.is_terminal(), "{} should not be terminal", s);
        }
        assert!(!Cancelled.is_failure());
        assert!(!Skipped.is_failure());
        assert!(Failed.is_failure());
        assert!(TimedOut.is_failure());
    }

    #[test]
    fn test_merge_prefers_remote_for_same_commit() {
        let l = vec![local("X", 0)];
        let r = vec![remote("X", DeploymentStatus::Completed, 0, Some(60))];
        let merged = merge_history(&l, &r);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].commit_sha, "X");
        assert_eq!(merged[0].status, DeploymentStatus::Completed);
        assert_eq!(merged[0].item_id, None);
    }

    #[test]
    fn test_merge_appends_unmatched_and_sorts_desc() {
        let l = vec![local("A", 10), local("B", 100)];
        let r = vec![
            remote("C", DeploymentStatus::InProgress, 50, None),
            remote("A", DeploymentStatus::Failed, 10, Some(200)),
        ];
        let merged = merge_history(&l, &r);
        let shas: Vec<&str> = merged.iter().map(|d| d.commit_sha.as_str()).collect();
        // A completed at 200, B started 100, C started 50
        assert_eq!(shas, vec!["A", "B", "C"]);
        assert_eq!(merged[0].status, DeploymentStatus::Failed);
        assert_eq!(merged[1].item_id.as_deref(), Some("item-B"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let l = vec![local("A", 10), local("B", 10), local("C", 30)];
        let r = vec![
            remote("D", DeploymentStatus::Completed, 5, Some(10)),
            remote("C", DeploymentStatus::Completed, 30, Some(90)),
            remote("E", DeploymentStatus::Queued, 10, None),
        ];
        let first = merge_history(&l, &r);
        let second = merge_history(&l, &r);
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn test_merge_dedupes_remote_reruns() {
        let r = vec![
            remote("A", DeploymentStatus::Completed, 20, Some(30)),
            remote("A", DeploymentStatus::Failed, 0, Some(10)),
        ];
        let merged = merge_history(&[], &r);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, DeploymentStatus::Completed);
    }

    #[test]
    fn test_workflow_run_to_deployment() {
        let run = WorkflowRun {
            commit_sha: "abc".into(),
            display_title: "Update post".into(),
            status: "completed".into(),
            conclusion: Some("success".into()),
            created_at: t(0),
            updated_at: t(95),
            url: Some("https://ci/run/1".into()),
        };
        let d = run.to_deployment();
        assert_eq!(d.status, DeploymentStatus::Completed);
        assert_eq!(d.completed_at, Some(t(95)));
        assert_eq!(d.duration, Some(95));
        assert_eq!(d.item_id, None);
    }

    #[test]
    fn test_log_is_capped_and_persisted() {
        let state = Arc::new(LocalState::in_memory());
        let log = DeploymentLog::load(state.clone(), 2);
        log.record(local("A", 0)).unwrap();
        log.record(local("B", 1)).unwrap();
        log.record(local("C", 2)).unwrap();
        let shas: Vec<String> = log.records().into_iter().map(|d| d.commit_sha).collect();
        assert_eq!(shas, vec!["B".to_string(), "C".to_string()]);

        let reloaded = DeploymentLog::load(state, 2);
        assert!(reloaded.contains("C"));
        assert!(!reloaded.contains("A"));
    }

    #[test]
    fn test_log_replaces_same_commit() {
        let log = DeploymentLog::load(Arc::new(LocalState::in_memory()), 5);
        log.record(local("A", 0)).unwrap();
        let mut done = local("A", 0);
        done.finish(DeploymentStatus::Completed, t(30));
        log.record(done).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.records()[0].status, DeploymentStatus::Completed);
    }
}
