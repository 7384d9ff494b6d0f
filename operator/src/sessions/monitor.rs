//! Per-session watchdog tasks. Each monitor is a child of the
//! controller's cancellation token and is cancelled on session
//! deletion before the finalizer is removed, so a stopped controller
//! or a deleted session leaves no orphan pollers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use k8s_openapi::jiff::Timestamp;
use kube::{Api, Client};
use owo_colors::OwoColorize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use corral_types::{AgentSession, SessionPhase};

use super::{actions, decide};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MonitorKind {
    /// Running budget, armed at the first Running transition.
    RunningDeadline,
    /// Operator-configured cap on WaitingForApproval; absent by
    /// default ("wait forever until cancelled").
    ApprovalDeadline,
}

impl MonitorKind {
    fn armed_phase(&self) -> SessionPhase {
        match self {
            MonitorKind::RunningDeadline => SessionPhase::Running,
            MonitorKind::ApprovalDeadline => SessionPhase::WaitingForApproval,
        }
    }
}

struct SessionMonitor {
    kind: MonitorKind,
    deadline: Timestamp,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct MonitorRegistry {
    root: CancellationToken,
    inner: Arc<Mutex<HashMap<(String, String), SessionMonitor>>>,
}

fn sleep_until(deadline: Timestamp) -> Duration {
    let remaining = deadline.duration_since(Timestamp::now());
    if remaining.is_negative() {
        Duration::ZERO
    } else {
        Duration::from_millis(remaining.as_millis() as u64)
    }
}

impl MonitorRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms (or re-arms) the watchdog for one session. Re-arming with
    /// the same kind and deadline is a no-op so reconcile probes do
    /// not churn tasks.
    pub async fn arm(
        &self,
        client: Client,
        namespace: &str,
        name: &str,
        kind: MonitorKind,
        deadline: Timestamp,
        reason: &'static str,
        message: String,
    ) {
        let key = (namespace.to_string(), name.to_string());
        let mut monitors = self.inner.lock().await;
        if let Some(existing) = monitors.get(&key)
            && existing.kind == kind
            && existing.deadline == deadline
        {
            return;
        }
        if let Some(previous) = monitors.remove(&key) {
            previous.cancel.cancel();
            previous.handle.abort();
        }
        let cancel = self.root.child_token();
        let task_cancel = cancel.clone();
        let task_inner = self.inner.clone();
        let task_key = key.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_until(deadline)) => {}
            }
            let api: Api<AgentSession> = Api::namespaced(client.clone(), &namespace);
            match api.get(&name).await {
                Ok(session) => {
                    // Only fire in the phase this deadline governs; a
                    // suspended session must not be killed by the
                    // running watchdog.
                    if decide::phase_of(&session) == kind.armed_phase() {
                        println!(
                            "⏰ {}",
                            format!("{}/{} exceeded its {:?}", namespace, name, kind).yellow()
                        );
                        if let Err(e) = actions::fail(client, &session, reason, message).await {
                            corral_common::response::print_warning(
                                anyhow::anyhow!(e).context("Watchdog failed to record timeout"),
                            );
                        }
                    }
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => corral_common::response::print_warning(
                    anyhow::anyhow!(e).context("Watchdog failed to read session"),
                ),
            }
            task_inner.lock().await.remove(&task_key);
        });
        monitors.insert(
            key,
            SessionMonitor {
                kind,
                deadline,
                cancel,
                handle,
            },
        );
    }

    /// Stops the session's watchdog, if any. Called on deletion before
    /// finalizer removal and on every terminal transition.
    pub async fn cancel(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        if let Some(monitor) = self.inner.lock().await.remove(&key) {
            monitor.cancel.cancel();
            monitor.handle.abort();
        }
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        let mut monitors = self.inner.lock().await;
        for (_key, monitor) in monitors.drain() {
            monitor.handle.abort();
        }
    }
}
