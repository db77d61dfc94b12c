//! Deployment Tracker: optimistic tracking of in-flight deployments.
//!
//! The tracker owns the active set (deployments started but not yet
//! terminal) and the local [`DeploymentLog`]. It performs no timing of its
//! own: [`DeploymentTracker::tick`] runs one polling pass and
//! [`DeploymentTracker::poll_history`] one history scan. The
//! [`crate::monitor::DeploymentMonitor`] drives both on intervals; tests call
//! them directly against a [`crate::clock::ManualClock`].
//!
//! Per tick, for each tracked deployment:
//!
//! 1. past the timeout → `timed_out`, logged, removed;
//! 2. otherwise query CI by commit sha (outside the state lock):
//!    - `completed` / `failed` → logged, removed;
//!    - `cancelled` / `skipped` → removed, not an error (superseded);
//!    - non-terminal → updated in place if the status advanced;
//!    - query error → logged at `warn`, retried next tick.
//!
//! When the last tracked deployment leaves the active set a [`Banner`] is
//! raised; it expires after the success or failure dismiss delay.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::clock::Clock;
use crate::deployments::{merge_history, Deployment, DeploymentLog, DeploymentStatus, RunHistory};
use crate::error::CmsResult;
use crate::fanout::map_settled;
use crate::local_state::AppSettings;

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub timeout: Duration,
    pub history_limit: usize,
    pub success_dismiss: Duration,
    pub failure_dismiss: Duration,
}

impl From<&AppSettings> for TrackerSettings {
    fn from(s: &AppSettings) -> Self {
        Self {
            timeout: Duration::seconds(s.deployment_timeout_secs as i64),
            history_limit: s.history_limit,
            success_dismiss: Duration::seconds(s.success_dismiss_secs as i64),
            failure_dismiss: Duration::seconds(s.failure_dismiss_secs as i64),
        }
    }
}

/// Completion notice shown once every tracked deployment has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub success: bool,
    pub message: String,
    pub shown_at: DateTime<Utc>,
    pub dismiss_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Started(Deployment),
    Updated(Deployment),
    Finished(Deployment),
    Settled(Banner),
}

#[derive(Default)]
struct TrackerState {
    active: Vec<Deployment>,
    banner: Option<Banner>,
    /// Deployments that failed since the active set was last empty.
    batch_failures: Vec<String>,
    batch_finished: usize,
}

pub struct DeploymentTracker {
    history: Arc<dyn RunHistory>,
    clock: Arc<dyn Clock>,
    log: DeploymentLog,
    settings: TrackerSettings,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<DeploymentEvent>,
}

impl DeploymentTracker {
    pub fn new(
        history: Arc<dyn RunHistory>,
        clock: Arc<dyn Clock>,
        log: DeploymentLog,
        settings: TrackerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            history,
            clock,
            log,
            settings,
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeploymentEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Begin tracking a commit the admin just made. Tracking the same commit
    /// twice keeps the first record.
    pub async fn start_tracking(
        &self,
        commit_sha: &str,
        action: &str,
        item_id: Option<String>,
    ) -> Deployment {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.active.iter().find(|d| d.commit_sha == commit_sha) {
            return existing.clone();
        }
        let deployment = Deployment::pending(commit_sha, action, item_id, self.clock.now());
        tracing::info!(commit = commit_sha, action, "tracking deployment");
        state.active.push(deployment.clone());
        state.banner = None;
        self.emit(DeploymentEvent::Started(deployment.clone()));
        deployment
    }

    pub async fn active(&self) -> Vec<Deployment> {
        self.state.lock().await.active.clone()
    }

    pub async fn has_active(&self) -> bool {
        !self.state.lock().await.active.is_empty()
    }

    /// The completion banner, unless it has been auto-dismissed.
    pub async fn current_banner(&self) -> Option<Banner> {
        let mut state = self.state.lock().await;
        if let Some(banner) = &state.banner {
            if self.clock.now() >= banner.dismiss_at {
                state.banner = None;
            }
        }
        state.banner.clone()
    }

    pub fn local_history(&self) -> Vec<Deployment> {
        self.log.records()
    }

    /// One polling pass over the active set. Returns how many remain active.
    ///
    /// The state lock is not held while CI is queried: results are applied
    /// by commit sha, so deployments tracked or removed in the meantime are
    /// left alone.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let mut removed_any = false;

        let pending: Vec<String> = {
            let mut state = self.state.lock().await;
            for i in (0..state.active.len()).rev() {
                let elapsed = now - state.active[i].started_at;
                if elapsed > self.settings.timeout {
                    let mut d = state.active.remove(i);
                    d.finish(DeploymentStatus::TimedOut, now);
                    tracing::warn!(
                        commit = %d.commit_sha,
                        elapsed_secs = elapsed.num_seconds(),
                        "giving up on deployment"
                    );
                    self.settle_one(&mut state, d);
                    removed_any = true;
                }
            }
            if state.active.is_empty() {
                if removed_any {
                    self.raise_banner(&mut state, now);
                }
                return 0;
            }
            state.active.iter().map(|d| d.commit_sha.clone()).collect()
        };

        let runs = map_settled(pending.clone(), |sha| {
            let history = self.history.clone();
            async move { history.run_for_commit(&sha).await }
        })
        .await;

        let mut state = self.state.lock().await;
        for (sha, result) in pending.into_iter().zip(runs) {
            let run = match result {
                Ok(Some(run)) => run,
                // CI has not registered the commit yet.
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(commit = %sha, "deployment status poll failed: {}", e);
                    continue;
                }
            };
            let Some(i) = state.active.iter().position(|d| d.commit_sha == sha) else {
                continue;
            };

            let status = run.deployment_status();
            if status.is_terminal() {
                let mut d = state.active.remove(i);
                d.finish(status, run.updated_at);
                if run.url.is_some() {
                    d.url = run.url.clone();
                }
                self.settle_one(&mut state, d);
                removed_any = true;
            } else {
                let d = &mut state.active[i];
                if status.rank() > d.status.rank() || (run.url.is_some() && d.url != run.url) {
                    if status.rank() > d.status.rank() {
                        d.status = status;
                    }
                    d.url = run.url.clone();
                    let updated = d.clone();
                    tracing::debug!(commit = %sha, status = %status, "deployment progressed");
                    self.emit(DeploymentEvent::Updated(updated));
                }
            }
        }

        if removed_any && state.active.is_empty() {
            self.raise_banner(&mut state, now);
        }
        state.active.len()
    }

    fn settle_one(&self, state: &mut TrackerState, d: Deployment) {
        state.batch_finished += 1;
        match d.status {
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::TimedOut => {
                if let Err(e) = self.log.record(d.clone()) {
                    tracing::warn!(commit = %d.commit_sha, "failed to persist deployment: {}", e);
                }
            }
            _ => {
                tracing::info!(commit = %d.commit_sha, status = %d.status, "deployment superseded");
            }
        }
        if d.status.is_failure() {
            state.batch_failures.push(d.action.clone());
        }
        tracing::info!(commit = %d.commit_sha, status = %d.status, "deployment finished");
        self.emit(DeploymentEvent::Finished(d));
    }

    fn raise_banner(&self, state: &mut TrackerState, now: DateTime<Utc>) {
        let failures = std::mem::take(&mut state.batch_failures);
        let finished = std::mem::take(&mut state.batch_finished);
        let success = failures.is_empty();
        let (message, delay) = if success {
            let message = if finished == 1 {
                "Deployment finished; the site is up to date".to_string()
            } else {
                format!("{} deployments finished; the site is up to date", finished)
            };
            (message, self.settings.success_dismiss)
        } else {
            (
                format!("Deployment failed: {}", failures.join(", ")),
                self.settings.failure_dismiss,
            )
        };
        let banner = Banner {
            success,
            message,
            shown_at: now,
            dismiss_at: now + delay,
        };
        state.banner = Some(banner.clone());
        self.emit(DeploymentEvent::Settled(banner));
    }

    /// Scan CI history for in-flight runs nobody is tracking (e.g. a direct
    /// push) and start tracking them. Returns how many were picked up.
    pub async fn poll_history(&self) -> CmsResult<usize> {
        let runs = self.history.recent_runs(self.settings.history_limit).await?;
        let mut state = self.state.lock().await;
        let mut picked_up = 0;
        for run in runs {
            let d = run.to_deployment();
            if d.status.is_terminal()
                || state.active.iter().any(|a| a.commit_sha == d.commit_sha)
                || self.log.contains(&d.commit_sha)
            {
                continue;
            }
            tracing::info!(commit = %d.commit_sha, action = %d.action, "tracking external deployment");
            state.active.push(d.clone());
            state.banner = None;
            self.emit(DeploymentEvent::Started(d));
            picked_up += 1;
        }
        Ok(picked_up)
    }

    /// Local log merged with recent CI history, newest first.
    pub async fn history(&self) -> CmsResult<Vec<Deployment>> {
        let runs = self.history.recent_runs(self.settings.history_limit).await?;
        let remote: Vec<Deployment> = runs.iter().map(|r| r.to_deployment()).collect();
        Ok(merge_history(&self.log.records(), &remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::deployments::{MemoryRunHistory, WorkflowRun};
    use crate::local_state::LocalState;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Semaphore;

    /// CI whose status lookups block until permits are added.
    struct GatedHistory {
        gate: Semaphore,
        waiting: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RunHistory for GatedHistory {
        async fn recent_runs(&self, _limit: usize) -> CmsResult<Vec<WorkflowRun>> {
            Ok(Vec::new())
        }

        async fn run_for_commit(&self, commit_sha: &str) -> CmsResult<Option<WorkflowRun>> {
            self.waiting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| crate::error::CmsError::Internal(e.to_string()))?;
            Ok(Some(run(commit_sha, "completed", Some("success"), t0())))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn settings() -> TrackerSettings {
        TrackerSettings {
            timeout: Duration::seconds(600),
            history_limit: 10,
            success_dismiss: Duration::seconds(5),
            failure_dismiss: Duration::seconds(15),
        }
    }

    fn run(sha: &str, status: &str, conclusion: Option<&str>, at: DateTime<Utc>) -> WorkflowRun {
        WorkflowRun {
            commit_sha: sha.into(),
            display_title: format!("run {}", sha),
            status: status.into(),
            conclusion: conclusion.map(String::from),
            created_at: at,
            updated_at: at + Duration::seconds(42),
            url: Some(format!("https://ci/{}", sha)),
        }
    }

    fn setup() -> (DeploymentTracker, Arc<MemoryRunHistory>, Arc<ManualClock>) {
        let history = Arc::new(MemoryRunHistory::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let log = DeploymentLog::load(Arc::new(LocalState::in_memory()), 10);
        let tracker = DeploymentTracker::new(history.clone(), clock.clone(), log, settings());
        (tracker, history, clock)
    }

    #[tokio::test]
    async fn test_times_out_after_deadline() {
        let (tracker, history, clock) = setup();
        tracker.start_tracking("abc", "Update post", None).await;
        history.upsert(run("abc", "in_progress", None, t0()));

        clock.advance(Duration::seconds(300));
        assert_eq!(tracker.tick().await, 1);
        assert_eq!(tracker.active().await[0].status, DeploymentStatus::InProgress);

        clock.set(t0() + Duration::seconds(601));
        assert_eq!(tracker.tick().await, 0);
        let logged = tracker.local_history();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].status, DeploymentStatus::TimedOut);
        let banner = tracker.current_banner().await.unwrap();
        assert!(!banner.success);
    }

    #[tokio::test]
    async fn test_completion_logs_and_raises_success_banner() {
        let (tracker, history, clock) = setup();
        let mut events = tracker.subscribe();
        tracker
            .start_tracking("abc", "Create post", Some("2025-01-01-x.md".into()))
            .await;

        // CI has not seen the commit yet.
        assert_eq!(tracker.tick().await, 1);

        history.upsert(run("abc", "completed", Some("success"), t0()));
        assert_eq!(tracker.tick().await, 0);

        let logged = tracker.local_history();
        assert_eq!(logged[0].status, DeploymentStatus::Completed);
        assert_eq!(logged[0].item_id.as_deref(), Some("2025-01-01-x.md"));
        assert_eq!(logged[0].duration, Some(42));

        let banner = tracker.current_banner().await.unwrap();
        assert!(banner.success);
        clock.advance(Duration::seconds(5));
        assert!(tracker.current_banner().await.is_none());

        assert!(matches!(events.recv().await.unwrap(), DeploymentEvent::Started(_)));
        assert!(matches!(events.recv().await.unwrap(), DeploymentEvent::Finished(_)));
        assert!(matches!(events.recv().await.unwrap(), DeploymentEvent::Settled(_)));
    }

    #[tokio::test]
    async fn test_cancelled_is_not_a_failure() {
        let (tracker, history, _clock) = setup();
        tracker.start_tracking("old", "Update page", None).await;
        history.upsert(run("old", "completed", Some("cancelled"), t0()));
        assert_eq!(tracker.tick().await, 0);
        assert!(tracker.current_banner().await.unwrap().success);
        // Superseded runs are left to the CI history.
        assert!(tracker.local_history().is_empty());
    }

    #[tokio::test]
    async fn test_poll_errors_keep_deployment_active() {
        let (tracker, history, _clock) = setup();
        tracker.start_tracking("abc", "Update post", None).await;
        history.set_failing(true);
        assert_eq!(tracker.tick().await, 1);
        assert_eq!(tracker.active().await[0].status, DeploymentStatus::Pending);
        assert!(tracker.current_banner().await.is_none());
    }

    #[tokio::test]
    async fn test_removal_does_not_skip_neighbours() {
        let (tracker, history, _clock) = setup();
        for sha in ["a", "b", "c", "d"] {
            tracker.start_tracking(sha, "bulk", None).await;
        }
        history.upsert(run("a", "completed", Some("success"), t0()));
        history.upsert(run("b", "completed", Some("failure"), t0()));
        history.upsert(run("c", "completed", Some("success"), t0()));
        history.upsert(run("d", "queued", None, t0()));

        assert_eq!(tracker.tick().await, 1);
        let active = tracker.active().await;
        assert_eq!(active[0].commit_sha, "d");
        assert_eq!(active[0].status, DeploymentStatus::Queued);
        assert_eq!(tracker.local_history().len(), 3);
        // Not everything has settled yet.
        assert!(tracker.current_banner().await.is_none());

        history.upsert(run("d", "completed", Some("success"), t0()));
        assert_eq!(tracker.tick().await, 0);
        let banner = tracker.current_banner().await.unwrap();
        assert!(!banner.success);
        assert!(banner.message.contains("bulk"));
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let (tracker, history, _clock) = setup();
        tracker.start_tracking("abc", "x", None).await;
        history.upsert(run("abc", "in_progress", None, t0()));
        tracker.tick().await;
        history.upsert(run("abc", "queued", None, t0()));
        tracker.tick().await;
        assert_eq!(tracker.active().await[0].status, DeploymentStatus::InProgress);
    }

    #[tokio::test]
    async fn test_history_poll_picks_up_external_runs() {
        let (tracker, history, _clock) = setup();
        history.upsert(run("done", "completed", Some("success"), t0()));
        history.upsert(run("push", "in_progress", None, t0()));

        assert_eq!(tracker.poll_history().await.unwrap(), 1);
        assert_eq!(tracker.poll_history().await.unwrap(), 0);
        let active = tracker.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].commit_sha, "push");
        assert_eq!(active[0].item_id, None);
    }

    #[tokio::test]
    async fn test_history_merges_local_and_remote() {
        let (tracker, history, _clock) = setup();
        tracker.start_tracking("abc", "Create post", None).await;
        history.upsert(run("abc", "completed", Some("success"), t0()));
        tracker.tick().await;
        history.upsert(run("other", "completed", Some("failure"), t0() + Duration::seconds(100)));

        let merged = tracker.history().await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].commit_sha, "other");
        assert_eq!(merged[1].status, DeploymentStatus::Completed);

        assert_eq!(merged, tracker.history().await.unwrap());
    }

    #[tokio::test]
    async fn test_tracking_is_not_blocked_by_a_slow_tick() {
        let history = Arc::new(GatedHistory {
            gate: Semaphore::new(0),
            waiting: std::sync::atomic::AtomicUsize::new(0),
        });
        let log = DeploymentLog::load(Arc::new(LocalState::in_memory()), 10);
        let tracker = Arc::new(DeploymentTracker::new(
            history.clone(),
            Arc::new(ManualClock::new(t0())),
            log,
            settings(),
        ));
        for sha in ["a", "b", "c"] {
            tracker.start_tracking(sha, "bulk", None).await;
        }

        let ticking = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.tick().await }
        });
        while history.waiting.load(std::sync::atomic::Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        let quick = std::time::Duration::from_millis(500);
        tokio::time::timeout(quick, tracker.start_tracking("new", "Create post", None))
            .await
            .expect("start_tracking waited on the tick");
        let active = tokio::time::timeout(quick, tracker.active())
            .await
            .expect("active() waited on the tick");
        assert_eq!(active.len(), 4);

        history.gate.add_permits(3);
        // The three polled deployments finish; the one tracked mid-tick stays.
        assert_eq!(ticking.await.unwrap(), 1);
        let active = tracker.active().await;
        assert_eq!(active[0].commit_sha, "new");
        assert_eq!(active[0].status, DeploymentStatus::Pending);
        assert!(tracker.current_banner().await.is_none());
        assert_eq!(tracker.local_history().len(), 3);
    }
}
