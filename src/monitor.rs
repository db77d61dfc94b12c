//! Deployment monitor: drives a [`DeploymentTracker`] on two schedules.
//!
//! - the **active poll** ticks every `poll_interval` while at least one
//!   deployment is tracked and stops itself once the active set is empty;
//! - the **history poll** runs every `history_poll_interval` while the monitor
//!   is initialised, picking up deployments started outside this process.
//!
//! Lifecycle is explicit: [`DeploymentMonitor::init`] starts the history
//! poll, [`DeploymentMonitor::dispose`] stops everything. When bound to an
//! [`AuthProvider`] the monitor follows the session: sign-in initialises it,
//! sign-out disposes it.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::auth::{AuthEvent, AuthProvider, SubscriptionId};
use crate::deployments::Deployment;
use crate::local_state::AppSettings;
use crate::schedule::ScheduledTask;
use crate::tracker::DeploymentTracker;

struct Tasks {
    active: ScheduledTask,
    history: ScheduledTask,
    initialised: bool,
    /// Set by the active job once it has found nothing left to poll.
    active_idle: bool,
}

pub struct DeploymentMonitor {
    tracker: Arc<DeploymentTracker>,
    tasks: Mutex<Tasks>,
    me: Weak<DeploymentMonitor>,
}

impl DeploymentMonitor {
    pub fn new(tracker: Arc<DeploymentTracker>, settings: &AppSettings) -> Arc<Self> {
        Self::with_intervals(
            tracker,
            settings.poll_interval(),
            settings.history_poll_interval(),
        )
    }

    pub fn with_intervals(
        tracker: Arc<DeploymentTracker>,
        poll_interval: Duration,
        history_poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            tracker,
            tasks: Mutex::new(Tasks {
                active: ScheduledTask::new("deployment-poll", poll_interval),
                history: ScheduledTask::new("deployment-history-poll", history_poll_interval),
                initialised: false,
                active_idle: false,
            }),
            me: me.clone(),
        })
    }

    pub fn tracker(&self) -> &Arc<DeploymentTracker> {
        &self.tracker
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the history poll, and the active poll in case deployments were
    /// tracked before initialisation. Idempotent.
    pub fn init(&self) {
        let mut tasks = self.tasks();
        if tasks.initialised {
            return;
        }
        tasks.initialised = true;
        tracing::info!("deployment monitor started");

        let me = self.me.clone();
        tasks.history.start(move || {
            let me = me.clone();
            async move {
                let Some(monitor) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                match monitor.tracker.poll_history().await {
                    Ok(picked_up) if picked_up > 0 => {
                        tracing::debug!(picked_up, "history poll found new deployments");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("deployment history poll failed: {}", e),
                }
                if monitor.tracker.has_active().await {
                    monitor.ensure_polling();
                }
                ControlFlow::Continue(())
            }
        });
        self.start_active(&mut tasks);
    }

    /// Stop both schedules. Tracked deployments stay in the tracker and
    /// resume on the next `init()`.
    pub fn dispose(&self) {
        let mut tasks = self.tasks();
        tasks.active.stop();
        tasks.history.stop();
        if std::mem::take(&mut tasks.initialised) {
            tracing::info!("deployment monitor stopped");
        }
    }

    /// Track a deployment the admin just started and make sure it is polled.
    pub async fn track(
        &self,
        commit_sha: &str,
        action: &str,
        item_id: Option<String>,
    ) -> Deployment {
        let deployment = self.tracker.start_tracking(commit_sha, action, item_id).await;
        self.ensure_polling();
        deployment
    }

    /// Start the active poll unless it is already running and not winding
    /// down.
    pub fn ensure_polling(&self) {
        let mut tasks = self.tasks();
        if tasks.active_idle || !tasks.active.is_running() {
            self.start_active(&mut tasks);
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.tasks().initialised
    }

    pub fn is_polling(&self) -> bool {
        self.tasks().active.is_running()
    }

    fn start_active(&self, tasks: &mut Tasks) {
        tasks.active_idle = false;
        let me = self.me.clone();
        tasks.active.start(move || {
            let me = me.clone();
            async move {
                let Some(monitor) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                if monitor.tracker.tick().await > 0 {
                    return ControlFlow::Continue(());
                }
                // Mark idle before the re-check: a deployment tracked after
                // it sees the flag and restarts the poll.
                monitor.tasks().active_idle = true;
                if monitor.tracker.has_active().await {
                    monitor.tasks().active_idle = false;
                    ControlFlow::Continue(())
                } else {
                    tracing::debug!("no active deployments; pausing poll");
                    ControlFlow::Break(())
                }
            }
        });
    }

    /// Follow the session of `auth`. Returns the subscription so callers can
    /// detach.
    pub fn bind_auth(&self, auth: &dyn AuthProvider) -> SubscriptionId {
        let me = self.me.clone();
        let id = auth.subscribe(Arc::new(move |event: &AuthEvent| {
            let Some(monitor) = me.upgrade() else {
                return;
            };
            match event {
                AuthEvent::SignedIn(_) => monitor.init(),
                AuthEvent::SignedOut => monitor.dispose(),
            }
        }));
        if auth.current_user().is_some() {
            self.init();
        }
        id
    }
}
