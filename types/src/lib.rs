use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Upstream system a session credential belongs to. Tags double as the
/// URL path segment of the `/auth/{provider}/...` routes and as the
/// label value on the stored credential container.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    GithubApp,
    GithubPat,
    GitlabPat,
    GoogleWorkspace,
    Jira,
    LlmKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFamily {
    Git,
    Workspace,
    Ticketing,
    Llm,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::Git => "git",
            ProviderFamily::Workspace => "workspace",
            ProviderFamily::Ticketing => "ticketing",
            ProviderFamily::Llm => "llm",
        }
    }
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::GithubApp,
        Provider::GithubPat,
        Provider::GitlabPat,
        Provider::GoogleWorkspace,
        Provider::Jira,
        Provider::LlmKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GithubApp => "github-app",
            Provider::GithubPat => "github-pat",
            Provider::GitlabPat => "gitlab-pat",
            Provider::GoogleWorkspace => "google-workspace",
            Provider::Jira => "jira",
            Provider::LlmKey => "llm-key",
        }
    }

    pub fn family(&self) -> ProviderFamily {
        match self {
            Provider::GithubApp | Provider::GithubPat | Provider::GitlabPat => ProviderFamily::Git,
            Provider::GoogleWorkspace => ProviderFamily::Workspace,
            Provider::Jira => ProviderFamily::Ticketing,
            Provider::LlmKey => ProviderFamily::Llm,
        }
    }
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github-app" => Ok(Provider::GithubApp),
            "github-pat" => Ok(Provider::GithubPat),
            "gitlab-pat" => Ok(Provider::GitlabPat),
            "google-workspace" => Ok(Provider::GoogleWorkspace),
            "jira" => Ok(Provider::Jira),
            "llm-key" => Ok(Provider::LlmKey),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RepoRole {
    #[default]
    Input,
    Output,
}

/// A repository the agent is allowed to read from and, for `Output`
/// roles, push results to.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoRef {
    pub url: String,
    pub branch: Option<String>,
    #[serde(default)]
    pub role: RepoRole,
}

/// Identity fingerprint of the caller who created the session. The
/// credential broker only releases credentials whose owner matches
/// `user_id` (see the gateway's worker-identity check).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalChoice {
    Allow,
    Deny,
    Revise,
}

/// Caller verdict on a pending approval request. One of the only two
/// spec fields that may be written after creation (the other is
/// `cancel`). `request_id` pins the decision to one request so a stale
/// verdict can never apply to a later suspension.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub decision: ApprovalChoice,
    pub payload: Option<String>,
    pub request_id: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    3600
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "corral.dev",
    version = "v1",
    kind = "AgentSession",
    plural = "agentsessions",
    derive = "PartialEq",
    status = "AgentSessionStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionSpec {
    pub prompt: String,
    pub model: String,
    pub workflow: Option<String>,
    #[serde(default)]
    pub repos: Vec<RepoRef>,
    /// Extra provider families the worker needs beyond those implied by
    /// `repos` and `model` (e.g. "jira", "google-workspace").
    #[serde(default)]
    pub integrations: Vec<Provider>,
    /// Budget for the Running phase, measured from the first transition
    /// into Running, not from creation.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub user_context: UserContext,
    /// Cancellation marker; the scheduler observes it and transitions.
    #[serde(default)]
    pub cancel: bool,
    pub approval: Option<ApprovalDecision>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub summary: String,
    pub requested_at: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CostMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_usd_cents: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionStatus {
    pub phase: SessionPhase,
    pub observed_generation: Option<i64>,
    pub message: Option<String>,
    /// Machine-readable cause for the current phase, e.g. `WorkerLost`,
    /// `ApprovalDenied`, `DeadlineExceeded`, `InvariantBreach`.
    pub reason: Option<String>,
    /// Name of the worker pod currently owned by this session.
    pub worker: Option<String>,
    pub started_at: Option<Time>,
    pub completed_at: Option<Time>,
    pub cost: Option<CostMetrics>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub approval_request: Option<ApprovalRequest>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SessionPhase {
    #[default]
    Pending,
    Creating,
    Running,
    WaitingForApproval,
    Completed,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    /// Cancel is the only edge allowed out of every non-terminal phase.
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == SessionPhase::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (SessionPhase::Pending, SessionPhase::Creating)
                | (SessionPhase::Creating, SessionPhase::Running)
                | (SessionPhase::Creating, SessionPhase::Failed)
                | (SessionPhase::Running, SessionPhase::WaitingForApproval)
                | (SessionPhase::Running, SessionPhase::Completed)
                | (SessionPhase::Running, SessionPhase::Failed)
                | (SessionPhase::WaitingForApproval, SessionPhase::Running)
                | (SessionPhase::WaitingForApproval, SessionPhase::Failed)
        )
    }
}

impl FromStr for SessionPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SessionPhase::Pending),
            "Creating" => Ok(SessionPhase::Creating),
            "Running" => Ok(SessionPhase::Running),
            "WaitingForApproval" => Ok(SessionPhase::WaitingForApproval),
            "Completed" => Ok(SessionPhase::Completed),
            "Failed" => Ok(SessionPhase::Failed),
            "Cancelled" => Ok(SessionPhase::Cancelled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Pending => write!(f, "Pending"),
            SessionPhase::Creating => write!(f, "Creating"),
            SessionPhase::Running => write!(f, "Running"),
            SessionPhase::WaitingForApproval => write!(f, "WaitingForApproval"),
            SessionPhase::Completed => write!(f, "Completed"),
            SessionPhase::Failed => write!(f, "Failed"),
            SessionPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl AgentSessionSpec {
    /// Provider families the worker will request credentials for:
    /// the git host of each repo, the LLM key for the model, plus any
    /// explicitly declared integrations.
    pub fn required_providers(&self) -> Vec<Provider> {
        let mut out = vec![Provider::LlmKey];
        for repo in &self.repos {
            if let Some(p) = git_provider_for_url(&repo.url)
                && !out.contains(&p)
            {
                out.push(p);
            }
        }
        for p in &self.integrations {
            if !out.contains(p) {
                out.push(*p);
            }
        }
        out
    }
}

/// Annotations exchanged between the scheduler and the worker pod.
/// The worker's minted identity may patch only its own pod; the
/// scheduler reads these on every pod event and writes the approval
/// decision back the same way.
pub mod worker {
    pub const STATE: &str = "corral.dev/worker-state";
    pub const STATE_RUNNING: &str = "running";
    pub const STATE_WAITING_APPROVAL: &str = "waiting-approval";
    pub const STATE_SUCCEEDED: &str = "succeeded";
    pub const STATE_FAILED: &str = "failed";

    /// JSON-encoded [`super::ApprovalRequest`], written by the worker.
    pub const APPROVAL_REQUEST: &str = "corral.dev/approval-request";
    /// allow|deny|revise, written by the scheduler after the caller
    /// decides.
    pub const APPROVAL_DECISION: &str = "corral.dev/approval-decision";
    pub const APPROVAL_PAYLOAD: &str = "corral.dev/approval-payload";

    pub const RESULT: &str = "corral.dev/result";
    pub const ERROR: &str = "corral.dev/error";
    /// JSON-encoded [`super::CostMetrics`].
    pub const COST: &str = "corral.dev/cost";
}

/// Maps a repository URL to the git provider family that can mint
/// credentials for it. Unknown hosts yield None; the worker clones
/// those anonymously.
pub fn git_provider_for_url(url: &str) -> Option<Provider> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://git@"))?;
    let host = rest.split(['/', ':']).next()?;
    if host == "github.com" || host.ends_with(".github.com") {
        Some(Provider::GithubPat)
    } else if host == "gitlab.com" || host.contains("gitlab") {
        Some(Provider::GitlabPat)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_admit_no_transitions() {
        for terminal in [
            SessionPhase::Completed,
            SessionPhase::Failed,
            SessionPhase::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                SessionPhase::Pending,
                SessionPhase::Creating,
                SessionPhase::Running,
                SessionPhase::WaitingForApproval,
                SessionPhase::Cancelled,
            ] {
                if next != terminal {
                    assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
                }
            }
        }
    }

    #[test]
    fn cancel_is_reachable_from_every_non_terminal_phase() {
        for phase in [
            SessionPhase::Pending,
            SessionPhase::Creating,
            SessionPhase::Running,
            SessionPhase::WaitingForApproval,
        ] {
            assert!(phase.can_transition_to(SessionPhase::Cancelled));
        }
    }

    #[test]
    fn no_transition_skips_a_state() {
        assert!(!SessionPhase::Pending.can_transition_to(SessionPhase::Running));
        assert!(!SessionPhase::Pending.can_transition_to(SessionPhase::Completed));
        assert!(!SessionPhase::Creating.can_transition_to(SessionPhase::Completed));
        assert!(!SessionPhase::WaitingForApproval.can_transition_to(SessionPhase::Completed));
    }

    #[test]
    fn approval_suspension_round_trips() {
        assert!(SessionPhase::Running.can_transition_to(SessionPhase::WaitingForApproval));
        assert!(SessionPhase::WaitingForApproval.can_transition_to(SessionPhase::Running));
        assert!(SessionPhase::WaitingForApproval.can_transition_to(SessionPhase::Failed));
    }

    #[test]
    fn required_providers_follow_repo_hosts() {
        let spec = AgentSessionSpec {
            prompt: "fix".into(),
            model: "model-x".into(),
            repos: vec![
                RepoRef {
                    url: "https://github.com/acme/site".into(),
                    ..Default::default()
                },
                RepoRef {
                    url: "https://gitlab.example.com/acme/infra".into(),
                    ..Default::default()
                },
            ],
            integrations: vec![Provider::Jira],
            ..Default::default()
        };
        let providers = spec.required_providers();
        assert!(providers.contains(&Provider::LlmKey));
        assert!(providers.contains(&Provider::GithubPat));
        assert!(providers.contains(&Provider::GitlabPat));
        assert!(providers.contains(&Provider::Jira));
        assert!(!providers.contains(&Provider::GoogleWorkspace));
    }

    #[test]
    fn unknown_git_hosts_are_anonymous() {
        assert_eq!(git_provider_for_url("https://example.com/x.git"), None);
        assert_eq!(
            git_provider_for_url("https://github.com/a/b.git"),
            Some(Provider::GithubPat)
        );
        assert_eq!(
            git_provider_for_url("ssh://git@gitlab.com/a/b.git"),
            Some(Provider::GitlabPat)
        );
        assert_eq!(git_provider_for_url("not a url"), None);
    }

    #[test]
    fn provider_tags_round_trip() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>(), Ok(p));
        }
        assert!("carrier-pigeon".parse::<Provider>().is_err());
    }
}
