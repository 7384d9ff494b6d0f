//! Tenant-scoped session handlers. Reads go through the caller's
//! delegated client so the cluster's own RBAC answers; writes follow
//! validate-then-escalate: a delegated access review first, then the
//! privileged write carrying the `Escalation` proof.

use std::collections::BTreeMap;

use anyhow::anyhow;
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams, PostParams},
};
use serde::Deserialize;

use corral_common::{annotations, naming, response};
use owo_colors::OwoColorize;
use corral_types::{
    AgentSession, AgentSessionSpec, ApprovalChoice, ApprovalDecision, Provider, RepoRef,
    SessionPhase, UserContext,
};
use corral_vault::ResolveError;

use crate::{
    app::App,
    auth::{
        self, Escalation, Identity, authenticate, ensure_tenant_consistency, map_kube_error,
        session_service_account,
    },
};

pub const MAX_MODEL_LEN: usize = 128;
pub const MAX_PROMPT_LEN: usize = 65536;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub name: String,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub repos: Vec<RepoRef>,
    #[serde(default)]
    pub integrations: Vec<Provider>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub decision: String,
    #[serde(default)]
    pub payload: Option<String>,
}

/// The model selector is opaque to us but ends up in pod env and
/// labels, so it is bounded and restricted to a tame charset.
pub fn sanitize_model(model: &str) -> anyhow::Result<String> {
    let model = model.trim();
    if model.is_empty() {
        anyhow::bail!("model must not be empty");
    }
    if model.len() > MAX_MODEL_LEN {
        anyhow::bail!("model exceeds {} characters", MAX_MODEL_LEN);
    }
    if !model
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-'))
    {
        anyhow::bail!("model contains characters outside [A-Za-z0-9._:/-]");
    }
    Ok(model.to_string())
}

fn sessions_api(client: kube::Client, tenant: &str) -> Api<AgentSession> {
    Api::namespaced(client, tenant)
}

// The two control-plane write sites. Each takes the review proof and
// names the identity it runs as, so "which identity and why" is
// answered at the call site, not by convention.
async fn create_session_privileged(
    app: &App,
    proof: &Escalation,
    tenant: &str,
    session: &AgentSession,
) -> Result<AgentSession, kube::Error> {
    println!(
        "{}",
        format!(
            "🔐 control-plane write • reason=caller-allowed tenant={} resource={} verb={}",
            proof.tenant(),
            proof.resource(),
            proof.verb()
        )
        .dimmed()
    );
    sessions_api(app.privileged.clone(), tenant)
        .create(&PostParams::default(), session)
        .await
}

async fn patch_spec_privileged(
    app: &App,
    proof: &Escalation,
    tenant: &str,
    name: &str,
    patch: serde_json::Value,
) -> Result<AgentSession, kube::Error> {
    println!(
        "{}",
        format!(
            "🔐 control-plane write • reason=caller-allowed tenant={} resource={} verb={} name={}",
            proof.tenant(),
            proof.resource(),
            proof.verb(),
            name
        )
        .dimmed()
    );
    sessions_api(app.privileged.clone(), tenant)
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

pub async fn create(
    State(app): State<App>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) = naming::validate_name("tenant", &tenant) {
        return response::bad_request(e);
    }
    if let Err(e) = naming::validate_name("session", &req.name) {
        return response::bad_request(e);
    }
    let model = match sanitize_model(&req.model) {
        Ok(m) => m,
        Err(e) => return response::bad_request(e),
    };
    if req.prompt.is_empty() || req.prompt.len() > MAX_PROMPT_LEN {
        return response::bad_request(anyhow!(
            "prompt must be 1..{} bytes",
            MAX_PROMPT_LEN
        ));
    }
    let identity = match auth::whoami(&caller.client).await {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let escalation = match auth::authorize(
        &caller.client,
        &tenant,
        "corral.dev",
        "agentsessions",
        "create",
        None,
    )
    .await
    {
        Ok(proof) => proof,
        Err(e) => return e.into_response(),
    };

    let mut session = AgentSession::new(
        &req.name,
        AgentSessionSpec {
            prompt: req.prompt,
            model,
            workflow: req.workflow,
            repos: req.repos,
            integrations: req.integrations,
            timeout_seconds: req.timeout_seconds.unwrap_or(3600),
            user_context: UserContext {
                user_id: identity.user_id().to_string(),
                display_name: caller.claims.name.clone().or_else(|| {
                    Some(identity.username.clone()).filter(|u| !u.is_empty())
                }),
            },
            cancel: false,
            approval: None,
        },
    );
    session.metadata.namespace = Some(tenant.clone());
    session.metadata.annotations = Some({
        let mut a = BTreeMap::new();
        a.insert(annotations::CREATED_BY.to_string(), "corral-gateway".to_string());
        a.insert(
            annotations::CREATED_BY_USER.to_string(),
            identity.user_id().to_string(),
        );
        a
    });

    match create_session_privileged(&app, &escalation, &tenant, &session).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            response::conflict(anyhow!("session '{}' already exists", req.name))
        }
        Err(e) => response::error(anyhow!(e).context("Failed to persist session")),
    }
}

pub async fn list(
    State(app): State<App>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) = naming::validate_name("tenant", &tenant) {
        return response::bad_request(e);
    }
    // Tenant-access probe first: a rejected or expired token gets its
    // 401/403 here, before any object is read.
    if let Err(e) = auth::authorize_tenant_access(&caller.client, &tenant).await {
        return e.into_response();
    }
    match sessions_api(caller.client, &tenant)
        .list(&Default::default())
        .await
    {
        Ok(sessions) => Json(sessions.items).into_response(),
        Err(e) => map_kube_error(e).into_response(),
    }
}

pub async fn get(
    State(app): State<App>,
    Path((tenant, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) =
        naming::validate_name("tenant", &tenant).and_then(|_| naming::validate_name("session", &name))
    {
        return response::bad_request(e);
    }
    match sessions_api(caller.client, &tenant).get(&name).await {
        Ok(session) => Json(session).into_response(),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow!("session '{}' not found", name))
        }
        Err(e) => map_kube_error(e).into_response(),
    }
}

/// Marks the session for deletion with the caller's own permissions;
/// the scheduler's finalizer then releases children before the object
/// disappears.
pub async fn delete(
    State(app): State<App>,
    Path((tenant, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) =
        naming::validate_name("tenant", &tenant).and_then(|_| naming::validate_name("session", &name))
    {
        return response::bad_request(e);
    }
    match sessions_api(caller.client, &tenant)
        .delete(&name, &Default::default())
        .await
    {
        Ok(_) => Json(serde_json::json!({"status": "deleting"})).into_response(),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow!("session '{}' not found", name))
        }
        Err(e) => map_kube_error(e).into_response(),
    }
}

pub async fn cancel(
    State(app): State<App>,
    Path((tenant, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) =
        naming::validate_name("tenant", &tenant).and_then(|_| naming::validate_name("session", &name))
    {
        return response::bad_request(e);
    }
    // NotFound surfaces through the caller's own read.
    if let Err(e) = sessions_api(caller.client.clone(), &tenant).get(&name).await {
        return match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                response::not_found(anyhow!("session '{}' not found", name))
            }
            e => map_kube_error(e).into_response(),
        };
    }
    let escalation = match auth::authorize(
        &caller.client,
        &tenant,
        "corral.dev",
        "agentsessions",
        "update",
        Some(&name),
    )
    .await
    {
        Ok(proof) => proof,
        Err(e) => return e.into_response(),
    };
    let patch = serde_json::json!({"spec": {"cancel": true}});
    match patch_spec_privileged(&app, &escalation, &tenant, &name, patch).await {
        Ok(_) => Json(serde_json::json!({"status": "cancelling"})).into_response(),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow!("session '{}' not found", name))
        }
        Err(e) => response::error(anyhow!(e).context("Failed to record cancellation")),
    }
}

pub async fn approve(
    State(app): State<App>,
    Path((tenant, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<ApproveRequest>,
) -> Response {
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) =
        naming::validate_name("tenant", &tenant).and_then(|_| naming::validate_name("session", &name))
    {
        return response::bad_request(e);
    }
    let decision = match req.decision.as_str() {
        "allow" => ApprovalChoice::Allow,
        "deny" => ApprovalChoice::Deny,
        "revise" => ApprovalChoice::Revise,
        other => {
            return response::bad_request(anyhow!(
                "decision must be one of allow|deny|revise, got '{}'",
                other
            ));
        }
    };
    let session = match sessions_api(caller.client.clone(), &tenant).get(&name).await {
        Ok(session) => session,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return response::not_found(anyhow!("session '{}' not found", name));
        }
        Err(e) => return map_kube_error(e).into_response(),
    };
    let phase = session
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(SessionPhase::Pending);
    if phase != SessionPhase::WaitingForApproval {
        return response::conflict(anyhow!(
            "session '{}' is not waiting for approval (phase: {})",
            name,
            phase
        ));
    }
    let escalation = match auth::authorize(
        &caller.client,
        &tenant,
        "corral.dev",
        "agentsessions",
        "update",
        Some(&name),
    )
    .await
    {
        Ok(proof) => proof,
        Err(e) => return e.into_response(),
    };
    let approval = ApprovalDecision {
        decision,
        payload: req.payload,
        request_id: session
            .status
            .as_ref()
            .and_then(|s| s.approval_request.as_ref())
            .map(|r| r.id.clone()),
    };
    let patch = serde_json::json!({"spec": {"approval": approval}});
    match patch_spec_privileged(&app, &escalation, &tenant, &name, patch).await {
        Ok(_) => Json(serde_json::json!({"status": "recorded"})).into_response(),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow!("session '{}' not found", name))
        }
        Err(e) => response::error(anyhow!(e).context("Failed to record approval")),
    }
}

/// Whether `identity` may fetch credentials for a session owned by
/// `owner`: the session's own minted service account is in scope by
/// construction; anyone else must be the owning user.
pub fn may_fetch_credentials(
    identity: &Identity,
    tenant: &str,
    session: &str,
    owner: &str,
) -> bool {
    if let Some((ns, sa)) = identity.service_account()
        && ns == tenant
        && sa == session_service_account(session)
    {
        return true;
    }
    !owner.is_empty() && identity.user_id() == owner
}

/// Worker-facing credential broker. The access review proves the
/// caller can `get` exactly this session; the identity rule above
/// proves it is allowed to see the owner's credentials.
pub async fn worker_credentials(
    State(app): State<App>,
    Path((tenant, name, provider)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let Ok(provider) = provider.parse::<Provider>() else {
        return response::bad_request(anyhow!("unknown provider '{}'", provider));
    };
    let caller = match authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) =
        naming::validate_name("tenant", &tenant).and_then(|_| naming::validate_name("session", &name))
    {
        return response::bad_request(e);
    }
    if let Err(e) = auth::authorize(
        &caller.client,
        &tenant,
        "corral.dev",
        "agentsessions",
        "get",
        Some(&name),
    )
    .await
    {
        return e.into_response();
    }
    let session = match sessions_api(caller.client.clone(), &tenant).get(&name).await {
        Ok(session) => session,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return response::not_found(anyhow!("session '{}' not found", name));
        }
        Err(e) => return map_kube_error(e).into_response(),
    };
    let identity = match auth::whoami(&caller.client).await {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let owner = session.spec.user_context.user_id.clone();
    if !may_fetch_credentials(&identity, &tenant, &session.name_any(), &owner) {
        return response::forbidden(anyhow!("insufficient permissions"));
    }
    match app.vault.resolve_for_session(provider, &owner).await {
        Ok(resolved) => Json(resolved).into_response(),
        Err(ResolveError::NotConfigured(p)) => {
            response::not_found(anyhow!("no {} credential configured", p))
        }
        Err(ResolveError::Expired(p)) => {
            response::conflict(anyhow!("{} credential expired; re-authentication required", p))
        }
        Err(ResolveError::Transient(reason)) => response::bad_gateway(anyhow!(reason)),
        Err(ResolveError::Vault(e)) => {
            response::error(anyhow!(e).context("Failed to resolve credential"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_uses_wire_casing() {
        let body = serde_json::json!({
            "name": "fix-typo-1",
            "prompt": "Fix typo",
            "model": "model-x",
            "repos": [{"url": "https://github.com/acme/site", "branch": "main", "role": "output"}],
            "integrations": ["jira"],
            "timeoutSeconds": 900,
        });
        let req: CreateSessionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.timeout_seconds, Some(900));
        assert_eq!(req.repos[0].role, corral_types::RepoRole::Output);
        assert_eq!(req.integrations, vec![Provider::Jira]);
        assert_eq!(req.repos[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn model_selectors_are_sanitized() {
        assert_eq!(sanitize_model(" model-x ").unwrap(), "model-x");
        assert!(sanitize_model("org/model:v1.2_beta").is_ok());
        assert!(sanitize_model("").is_err());
        assert!(sanitize_model("   ").is_err());
        assert!(sanitize_model("model x").is_err());
        assert!(sanitize_model("model\n").is_err());
        assert!(sanitize_model(&"m".repeat(200)).is_err());
    }

    fn sa_identity(ns: &str, sa: &str) -> Identity {
        Identity {
            username: format!("system:serviceaccount:{ns}:{sa}"),
            uid: Some("sa-uid".to_string()),
        }
    }

    #[test]
    fn sessions_own_service_account_is_in_scope() {
        let id = sa_identity("team-a", "corral-session-fix-typo-1");
        assert!(may_fetch_credentials(&id, "team-a", "fix-typo-1", "user-42"));
    }

    #[test]
    fn foreign_service_accounts_are_rejected() {
        let other_session = sa_identity("team-a", "corral-session-other");
        assert!(!may_fetch_credentials(&other_session, "team-a", "fix-typo-1", "user-42"));
        let other_tenant = sa_identity("team-b", "corral-session-fix-typo-1");
        assert!(!may_fetch_credentials(&other_tenant, "team-a", "fix-typo-1", "user-42"));
    }

    #[test]
    fn owning_user_may_fetch_their_own() {
        let id = Identity {
            username: "jane".to_string(),
            uid: Some("user-42".to_string()),
        };
        assert!(may_fetch_credentials(&id, "team-a", "fix-typo-1", "user-42"));
        assert!(!may_fetch_credentials(&id, "team-a", "fix-typo-1", "user-43"));
    }

    #[test]
    fn sessions_with_no_owner_release_nothing_to_users() {
        let id = Identity {
            username: String::new(),
            uid: None,
        };
        assert!(!may_fetch_credentials(&id, "team-a", "fix-typo-1", ""));
    }
}
