//! Read phase of session reconciliation: look at the session, its
//! worker pod, and the clock, and decide one action. Everything here
//! is pure so the state machine is testable without a cluster.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use std::time::Duration;

use corral_common::{SESSION_FINALIZER, naming};
use corral_types::{
    AgentSession, ApprovalChoice, ApprovalDecision, ApprovalRequest, CostMetrics, SessionPhase,
    worker,
};

pub const REASON_WORKER_LOST: &str = "WorkerLost";
pub const REASON_WORKER_ERROR: &str = "WorkerError";
pub const REASON_WORKER_START_FAILED: &str = "WorkerStartFailed";
pub const REASON_APPROVAL_DENIED: &str = "ApprovalDenied";
pub const REASON_APPROVAL_TIMEOUT: &str = "ApprovalTimeout";
pub const REASON_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
pub const REASON_INVARIANT_BREACH: &str = "InvariantBreach";
pub const REASON_CONFLICT: &str = "Conflict";
pub const REASON_VALIDATION: &str = "Validation";

/// Action to be taken upon an `AgentSession` during reconciliation.
#[derive(Debug, PartialEq, Clone)]
pub enum SessionAction {
    /// Stamp the cleanup finalizer before any child exists.
    AddFinalizer,

    /// Deletion requested: release children, stop monitors, drop the
    /// finalizer.
    Cleanup,

    /// Bring up the minted identity, the credential bundle, and the
    /// worker pod.
    CreateChildren,

    Starting {
        reason: String,
    },

    MarkRunning {
        pod_name: String,
    },

    /// Worker asked for an interactive approval.
    Suspend {
        request: ApprovalRequest,
    },

    /// Caller allowed (or revised); hand the decision to the worker
    /// and resume.
    Resume {
        decision: ApprovalDecision,
    },

    Complete {
        result: Option<String>,
        cost: Option<CostMetrics>,
    },

    Fail {
        reason: &'static str,
        message: String,
    },

    Cancel,

    /// The session is in its desired state.
    NoOp,

    Requeue(Duration),
}

impl SessionAction {
    pub fn to_str(&self) -> &str {
        match self {
            SessionAction::AddFinalizer => "AddFinalizer",
            SessionAction::Cleanup => "Cleanup",
            SessionAction::CreateChildren => "CreateChildren",
            SessionAction::Starting { .. } => "Starting",
            SessionAction::MarkRunning { .. } => "MarkRunning",
            SessionAction::Suspend { .. } => "Suspend",
            SessionAction::Resume { .. } => "Resume",
            SessionAction::Complete { .. } => "Complete",
            SessionAction::Fail { .. } => "Fail",
            SessionAction::Cancel => "Cancel",
            SessionAction::NoOp => "NoOp",
            SessionAction::Requeue(_) => "Requeue",
        }
    }
}

fn pod_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|s| s.as_str())
}

pub fn worker_state(pod: &Pod) -> Option<&str> {
    pod_annotation(pod, worker::STATE)
}

fn worker_result(pod: &Pod) -> Option<String> {
    if let Some(result) = pod_annotation(pod, worker::RESULT) {
        return Some(result.to_string());
    }
    // Fallback: the agent container's termination message.
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == "agent"))
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.message.clone())
}

fn worker_error(pod: &Pod) -> String {
    pod_annotation(pod, worker::ERROR)
        .map(|s| s.to_string())
        .or_else(|| worker_result(pod))
        .unwrap_or_else(|| "worker reported an error".to_string())
}

fn worker_cost(pod: &Pod) -> Option<CostMetrics> {
    serde_json::from_str(pod_annotation(pod, worker::COST)?).ok()
}

fn worker_approval_request(pod: &Pod) -> Option<Result<ApprovalRequest, serde_json::Error>> {
    pod_annotation(pod, worker::APPROVAL_REQUEST).map(serde_json::from_str)
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn pod_is_ready(pod: &Pod) -> Option<bool> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status == "True")
}

/// Container states a restartPolicy=Never worker can never come back
/// from. Mirrors what the kubelet reports for image and sandbox
/// failures.
const FATAL_WAITING: &[&str] = &[
    "ImagePullBackOff",
    "ErrImageNeverPull",
    "RegistryUnavailable",
    "CreateSandboxError",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
    "CrashLoopBackOff",
];

fn fatal_container_state(pod: &Pod, container_status: &ContainerStatus) -> Option<String> {
    if let Some(waiting) = container_status.state.as_ref().and_then(|s| s.waiting.as_ref()) {
        let reason = waiting.reason.as_deref().unwrap_or("");
        if FATAL_WAITING.contains(&reason) {
            return Some(format!(
                "Pod '{}' container '{}' is in unrecoverable waiting state: {}",
                pod.name_any(),
                container_status.name,
                reason,
            ));
        }
    }
    None
}

/// Fatal startup condition, if any: unschedulable, unknown node, or a
/// container the kubelet reports as unrecoverable.
pub fn fatal_pod_state(pod: &Pod) -> Option<String> {
    if let Some(status) = &pod.status
        && let Some(cond) = status
            .conditions
            .as_ref()
            .and_then(|cs| cs.iter().find(|c| c.type_ == "PodScheduled"))
        && cond.status == "False"
        && cond.reason.as_deref() == Some("Unschedulable")
    {
        return Some(format!(
            "Pod '{}' is unschedulable: {}",
            pod.name_any(),
            cond.message.as_deref().unwrap_or("unspecified"),
        ));
    }
    for container_status in pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|v| v.as_slice())
        .unwrap_or_default()
    {
        if let Some(reason) = fatal_container_state(pod, container_status) {
            return Some(reason);
        }
    }
    None
}

pub fn phase_of(session: &AgentSession) -> SessionPhase {
    session
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(SessionPhase::Pending)
}

/// Whether the Running deadline has passed. Measured from the first
/// Running transition, never from creation.
pub fn deadline_exceeded(session: &AgentSession, now: Timestamp) -> bool {
    let Some(started_at) = session.status.as_ref().and_then(|s| s.started_at.as_ref()) else {
        return false;
    };
    let elapsed = now.duration_since(started_at.0);
    elapsed.as_secs() >= 0 && (elapsed.as_secs() as u64) >= session.spec.timeout_seconds
}

fn has_finalizer(session: &AgentSession) -> bool {
    session.finalizers().iter().any(|f| f == SESSION_FINALIZER)
}

/// The caller's decision applies only to the request the scheduler is
/// currently suspended on; anything else is stale and ignored.
pub fn applicable_approval(session: &AgentSession) -> Option<&ApprovalDecision> {
    let decision = session.spec.approval.as_ref()?;
    let current = session
        .status
        .as_ref()?
        .approval_request
        .as_ref()?;
    if decision.request_id.as_deref() == Some(current.id.as_str()) {
        Some(decision)
    } else {
        None
    }
}

/// The whole read phase. `live_workers` is the number of non-deleted
/// pods labelled as this session's worker; `pod` is the one matching
/// the expected worker name.
pub fn determine_action(
    session: &AgentSession,
    pod: Option<&Pod>,
    live_workers: usize,
    desired_hash: &str,
    now: Timestamp,
) -> SessionAction {
    if session.metadata.deletion_timestamp.is_some() {
        return if has_finalizer(session) {
            SessionAction::Cleanup
        } else {
            SessionAction::NoOp
        };
    }

    let phase = phase_of(session);
    if phase.is_terminal() {
        // Retention of terminal sessions belongs to an external
        // janitor.
        return SessionAction::NoOp;
    }

    if !has_finalizer(session) {
        return SessionAction::AddFinalizer;
    }

    if !naming::is_valid_name(&session.name_any()) {
        return SessionAction::Fail {
            reason: REASON_VALIDATION,
            message: format!("session name '{}' violates naming rules", session.name_any()),
        };
    }

    // Cancel wins over everything except an already-persisted terminal
    // phase.
    if session.spec.cancel {
        return SessionAction::Cancel;
    }

    if live_workers > 1 {
        return SessionAction::Fail {
            reason: REASON_INVARIANT_BREACH,
            message: format!("{} live workers observed for one session", live_workers),
        };
    }

    match phase {
        SessionPhase::Pending => SessionAction::CreateChildren,
        SessionPhase::Creating => determine_creating_action(session, pod, desired_hash),
        SessionPhase::Running => determine_running_action(session, pod, now),
        SessionPhase::WaitingForApproval => determine_waiting_action(session, pod),
        // Terminal phases returned above.
        _ => SessionAction::NoOp,
    }
}

fn determine_creating_action(
    session: &AgentSession,
    pod: Option<&Pod>,
    desired_hash: &str,
) -> SessionAction {
    let Some(pod) = pod else {
        return SessionAction::CreateChildren;
    };
    if pod.metadata.deletion_timestamp.is_some() {
        return SessionAction::Requeue(Duration::from_secs(2));
    }
    if pod_annotation(pod, corral_common::annotations::SPEC_HASH) != Some(desired_hash) {
        // The worker pod is immutable; a spec divergence under it is a
        // conflict, not something to converge.
        return SessionAction::Fail {
            reason: REASON_CONFLICT,
            message: format!("Pod '{}' does not match the session spec", pod.name_any()),
        };
    }
    if let Some(message) = fatal_pod_state(pod) {
        return SessionAction::Fail {
            reason: REASON_WORKER_START_FAILED,
            message,
        };
    }
    match pod_phase(pod) {
        // A fast worker may finish before we ever observed it ready;
        // pass through Running so the transition graph holds.
        Some("Succeeded") => SessionAction::MarkRunning {
            pod_name: pod.name_any(),
        },
        Some("Failed") => SessionAction::Fail {
            reason: REASON_WORKER_START_FAILED,
            message: worker_error(pod),
        },
        Some("Unknown") => SessionAction::Fail {
            reason: REASON_WORKER_LOST,
            message: format!("Pod '{}' is in Unknown phase", pod.name_any()),
        },
        _ => {
            if worker_state(pod) == Some(worker::STATE_RUNNING) || pod_is_ready(pod) == Some(true) {
                SessionAction::MarkRunning {
                    pod_name: pod.name_any(),
                }
            } else {
                SessionAction::Starting {
                    reason: format!("Pod '{}' is not Ready yet", pod.name_any()),
                }
            }
        }
    }
}

fn determine_running_action(
    session: &AgentSession,
    pod: Option<&Pod>,
    now: Timestamp,
) -> SessionAction {
    let Some(pod) = pod else {
        // No terminal report, no pod: the node took the worker with it.
        return SessionAction::Fail {
            reason: REASON_WORKER_LOST,
            message: "worker pod disappeared without a terminal report".to_string(),
        };
    };
    match pod_phase(pod) {
        Some("Unknown") => {
            return SessionAction::Fail {
                reason: REASON_WORKER_LOST,
                message: format!(
                    "Pod '{}' node is lost or unreachable",
                    pod.name_any()
                ),
            };
        }
        Some("Succeeded") => {
            return SessionAction::Complete {
                result: worker_result(pod),
                cost: worker_cost(pod),
            };
        }
        Some("Failed") => {
            return SessionAction::Fail {
                reason: REASON_WORKER_ERROR,
                message: worker_error(pod),
            };
        }
        _ => {}
    }
    match worker_state(pod) {
        Some(worker::STATE_SUCCEEDED) => {
            return SessionAction::Complete {
                result: worker_result(pod),
                cost: worker_cost(pod),
            };
        }
        Some(worker::STATE_FAILED) => {
            return SessionAction::Fail {
                reason: REASON_WORKER_ERROR,
                message: worker_error(pod),
            };
        }
        Some(worker::STATE_WAITING_APPROVAL) => {
            let already_suspended = session
                .status
                .as_ref()
                .and_then(|s| s.approval_request.as_ref())
                .is_some();
            if !already_suspended {
                return match worker_approval_request(pod) {
                    Some(Ok(request)) => SessionAction::Suspend { request },
                    Some(Err(e)) => SessionAction::Fail {
                        reason: REASON_WORKER_ERROR,
                        message: format!("worker posted a malformed approval request: {e}"),
                    },
                    None => SessionAction::Fail {
                        reason: REASON_WORKER_ERROR,
                        message: "worker requested approval without a request body".to_string(),
                    },
                };
            }
        }
        _ => {}
    }
    if deadline_exceeded(session, now) {
        return SessionAction::Fail {
            reason: REASON_DEADLINE_EXCEEDED,
            message: format!(
                "session exceeded its {}s running budget",
                session.spec.timeout_seconds
            ),
        };
    }
    SessionAction::NoOp
}

fn determine_waiting_action(session: &AgentSession, pod: Option<&Pod>) -> SessionAction {
    // The worker stays up while suspended; losing it fails the session
    // the same way as in Running.
    if pod.is_none() {
        return SessionAction::Fail {
            reason: REASON_WORKER_LOST,
            message: "worker pod disappeared while waiting for approval".to_string(),
        };
    }
    match applicable_approval(session) {
        Some(decision) => match decision.decision {
            ApprovalChoice::Deny => SessionAction::Fail {
                reason: REASON_APPROVAL_DENIED,
                message: decision
                    .payload
                    .clone()
                    .unwrap_or_else(|| "approval denied by caller".to_string()),
            },
            ApprovalChoice::Allow | ApprovalChoice::Revise => SessionAction::Resume {
                decision: decision.clone(),
            },
        },
        // No implicit timeout: wait until a decision or a cancel. The
        // operator-configured cap is enforced by the monitor task.
        None => SessionAction::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    use corral_types::{AgentSessionSpec, AgentSessionStatus, UserContext};

    const HASH: &str = "hash-0";

    fn session(phase: SessionPhase) -> AgentSession {
        let mut s = AgentSession::new(
            "fix-typo-1",
            AgentSessionSpec {
                prompt: "Fix typo".to_string(),
                model: "model-x".to_string(),
                timeout_seconds: 3600,
                user_context: UserContext {
                    user_id: "user-42".to_string(),
                    display_name: None,
                },
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("team-a".to_string());
        s.metadata.finalizers = Some(vec![corral_common::SESSION_FINALIZER.to_string()]);
        s.status = Some(AgentSessionStatus {
            phase,
            ..Default::default()
        });
        s
    }

    fn pod(phase: &str, ready: bool) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            corral_common::annotations::SPEC_HASH.to_string(),
            HASH.to_string(),
        );
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("fix-typo-1".to_string()),
                namespace: Some("team-a".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotate(mut p: Pod, key: &str, value: &str) -> Pod {
        p.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        p
    }

    fn now() -> Timestamp {
        Timestamp::from_second(1_700_000_000).unwrap()
    }

    #[test]
    fn fresh_sessions_get_the_finalizer_first() {
        let mut s = session(SessionPhase::Pending);
        s.metadata.finalizers = None;
        assert_eq!(
            determine_action(&s, None, 0, HASH, now()),
            SessionAction::AddFinalizer
        );
    }

    #[test]
    fn pending_sessions_create_children() {
        let s = session(SessionPhase::Pending);
        assert_eq!(
            determine_action(&s, None, 0, HASH, now()),
            SessionAction::CreateChildren
        );
    }

    #[test]
    fn creating_marks_running_when_worker_is_ready() {
        let s = session(SessionPhase::Creating);
        let p = pod("Running", true);
        assert_eq!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::MarkRunning {
                pod_name: "fix-typo-1".to_string()
            }
        );
    }

    #[test]
    fn creating_waits_while_worker_is_not_ready() {
        let s = session(SessionPhase::Creating);
        let p = pod("Pending", false);
        assert!(matches!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::Starting { .. }
        ));
    }

    #[test]
    fn running_completes_on_worker_success() {
        let s = session(SessionPhase::Running);
        let p = annotate(
            annotate(pod("Running", true), worker::STATE, worker::STATE_SUCCEEDED),
            worker::RESULT,
            "patched 1 file",
        );
        assert_eq!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::Complete {
                result: Some("patched 1 file".to_string()),
                cost: None,
            }
        );
    }

    #[test]
    fn running_fails_on_worker_error() {
        let s = session(SessionPhase::Running);
        let p = annotate(
            annotate(pod("Running", true), worker::STATE, worker::STATE_FAILED),
            worker::ERROR,
            "compile error",
        );
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Fail { reason, message } => {
                assert_eq!(reason, REASON_WORKER_ERROR);
                assert_eq!(message, "compile error");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn lost_worker_fails_without_retry() {
        let s = session(SessionPhase::Running);
        match determine_action(&s, None, 0, HASH, now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_WORKER_LOST),
            other => panic!("unexpected action {other:?}"),
        }
        let p = pod("Unknown", false);
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_WORKER_LOST),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn approval_request_suspends_the_session() {
        let s = session(SessionPhase::Running);
        let request = serde_json::json!({"id": "req-1", "summary": "push to main?"});
        let p = annotate(
            annotate(
                pod("Running", true),
                worker::STATE,
                worker::STATE_WAITING_APPROVAL,
            ),
            worker::APPROVAL_REQUEST,
            &request.to_string(),
        );
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Suspend { request } => {
                assert_eq!(request.id, "req-1");
                assert_eq!(request.summary, "push to main?");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    fn waiting_session(request_id: &str) -> AgentSession {
        let mut s = session(SessionPhase::WaitingForApproval);
        s.status.as_mut().unwrap().approval_request = Some(ApprovalRequest {
            id: request_id.to_string(),
            summary: "push to main?".to_string(),
            requested_at: None,
        });
        s
    }

    #[test]
    fn allow_resumes_and_deny_fails() {
        let mut s = waiting_session("req-1");
        s.spec.approval = Some(ApprovalDecision {
            decision: ApprovalChoice::Allow,
            payload: None,
            request_id: Some("req-1".to_string()),
        });
        let p = pod("Running", true);
        assert!(matches!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::Resume { .. }
        ));

        s.spec.approval = Some(ApprovalDecision {
            decision: ApprovalChoice::Deny,
            payload: None,
            request_id: Some("req-1".to_string()),
        });
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_APPROVAL_DENIED),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn stale_approvals_do_not_apply_to_new_requests() {
        let mut s = waiting_session("req-2");
        s.spec.approval = Some(ApprovalDecision {
            decision: ApprovalChoice::Allow,
            payload: None,
            request_id: Some("req-1".to_string()),
        });
        let p = pod("Running", true);
        assert_eq!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::NoOp
        );
    }

    #[test]
    fn waiting_has_no_implicit_timeout() {
        let mut s = waiting_session("req-1");
        // Deadline long past, but suspended sessions wait forever.
        s.status.as_mut().unwrap().started_at =
            Some(Time(Timestamp::from_second(1).unwrap()));
        let p = pod("Running", true);
        assert_eq!(
            determine_action(&s, Some(&p), 1, HASH, now()),
            SessionAction::NoOp
        );
    }

    #[test]
    fn cancel_wins_from_every_non_terminal_phase() {
        for phase in [
            SessionPhase::Pending,
            SessionPhase::Creating,
            SessionPhase::Running,
            SessionPhase::WaitingForApproval,
        ] {
            let mut s = session(phase);
            s.spec.cancel = true;
            assert_eq!(
                determine_action(&s, None, 0, HASH, now()),
                SessionAction::Cancel,
                "{phase}"
            );
        }
    }

    #[test]
    fn terminal_phases_are_left_alone() {
        for phase in [
            SessionPhase::Completed,
            SessionPhase::Failed,
            SessionPhase::Cancelled,
        ] {
            let mut s = session(phase);
            // Even with a cancel marker: terminal is final.
            s.spec.cancel = true;
            assert_eq!(
                determine_action(&s, None, 0, HASH, now()),
                SessionAction::NoOp,
                "{phase}"
            );
        }
    }

    #[test]
    fn two_live_workers_is_an_invariant_breach() {
        let s = session(SessionPhase::Running);
        let p = pod("Running", true);
        match determine_action(&s, Some(&p), 2, HASH, now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_INVARIANT_BREACH),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn spec_hash_divergence_is_a_conflict() {
        let s = session(SessionPhase::Creating);
        let p = pod("Running", true);
        match determine_action(&s, Some(&p), 1, "other-hash", now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_CONFLICT),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn deadline_runs_from_first_running_transition() {
        let mut s = session(SessionPhase::Running);
        // Never transitioned: no deadline.
        assert!(!deadline_exceeded(&s, now()));
        s.status.as_mut().unwrap().started_at = Some(Time(
            Timestamp::from_second(1_700_000_000 - 7200).unwrap(),
        ));
        assert!(deadline_exceeded(&s, now()));
        let p = pod("Running", true);
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Fail { reason, .. } => assert_eq!(reason, REASON_DEADLINE_EXCEEDED),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn deletion_with_finalizer_cleans_up() {
        let mut s = session(SessionPhase::Running);
        s.metadata.deletion_timestamp = Some(Time(now()));
        assert_eq!(
            determine_action(&s, None, 0, HASH, now()),
            SessionAction::Cleanup
        );
        s.metadata.finalizers = None;
        assert_eq!(
            determine_action(&s, None, 0, HASH, now()),
            SessionAction::NoOp
        );
    }

    #[test]
    fn unschedulable_worker_fails_the_session() {
        let s = session(SessionPhase::Creating);
        let mut p = pod("Pending", false);
        p.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            reason: Some("Unschedulable".to_string()),
            message: Some("0/3 nodes available".to_string()),
            ..Default::default()
        }]);
        match determine_action(&s, Some(&p), 1, HASH, now()) {
            SessionAction::Fail { reason, message } => {
                assert_eq!(reason, REASON_WORKER_START_FAILED);
                assert!(message.contains("unschedulable"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
