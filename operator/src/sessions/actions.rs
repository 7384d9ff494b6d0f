//! Write phase of session reconciliation. Every mutation here is
//! idempotent: creates tolerate AlreadyExists, deletes tolerate
//! NotFound, and status writes go through the guarded optimistic
//! writer so a persisted terminal phase is final.

use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, Patch, PatchParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};

use corral_common::SESSION_FINALIZER;
use corral_types::{
    AgentSession, ApprovalChoice, ApprovalDecision, ApprovalRequest, CostMetrics, SessionPhase,
    worker,
};
use corral_vault::Vault;
use kube::ResourceExt;

use super::children;
use super::decide;
use crate::util::{Error, MANAGER_NAME, patch::patch_status};

fn reporter() -> Reporter {
    Reporter {
        controller: MANAGER_NAME.into(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

/// Emits a transition event; failures to record events never fail the
/// reconcile.
pub async fn publish_event(
    client: Client,
    session: &AgentSession,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let recorder = Recorder::new(client, reporter());
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &session.object_ref(&())).await {
        corral_common::response::print_warning(
            anyhow::anyhow!(e).context("Failed to publish event"),
        );
    }
}

/// Status writes refuse to touch a session whose persisted phase is
/// already terminal.
async fn patch_session_status(
    client: Client,
    session: &AgentSession,
    f: impl Fn(&mut corral_types::AgentSessionStatus),
) -> Result<AgentSession, Error> {
    patch_status(
        client,
        session,
        |s: &AgentSession| !decide::phase_of(s).is_terminal(),
        f,
    )
    .await
}

pub async fn add_finalizer(client: Client, session: &AgentSession) -> Result<(), Error> {
    let name = children::worker_name(session)?;
    let namespace = children::session_namespace(session)?;
    let mut finalizers = session.finalizers().to_vec();
    finalizers.push(SESSION_FINALIZER.to_string());
    let api: Api<AgentSession> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(client: Client, session: &AgentSession) -> Result<(), Error> {
    let name = children::worker_name(session)?;
    let namespace = children::session_namespace(session)?;
    let api: Api<AgentSession> = Api::namespaced(client, namespace);
    // Work from a fresh read so we do not resurrect a finalizer someone
    // else removed meanwhile.
    let fresh = match api.get(name).await {
        Ok(fresh) => fresh,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let finalizers: Vec<String> = fresh
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SESSION_FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete_tolerant<T>(api: &Api<T>, name: &str) -> Result<(), Error>
where
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn exists<T>(api: &Api<T>, name: &str) -> Result<bool, Error>
where
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_worker(client: Client, session: &AgentSession) -> Result<(), Error> {
    let name = children::worker_name(session)?;
    let namespace = children::session_namespace(session)?;
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    delete_tolerant(&pods, name).await
}

/// Releases every owned child and, once they are gone, drops the
/// finalizer. Returns false while children are still terminating so
/// the caller requeues.
pub async fn cleanup(client: Client, session: &AgentSession) -> Result<bool, Error> {
    let name = children::worker_name(session)?.to_string();
    let namespace = children::session_namespace(session)?.to_string();
    let sa_name = children::service_account_name(&name);
    let secret_name = children::env_secret_name(&name);

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let sas: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    let roles: Api<Role> = Api::namespaced(client.clone(), &namespace);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), &namespace);

    delete_tolerant(&pods, &name).await?;
    delete_tolerant(&secrets, &secret_name).await?;
    delete_tolerant(&bindings, &sa_name).await?;
    delete_tolerant(&roles, &sa_name).await?;
    delete_tolerant(&sas, &sa_name).await?;

    let mut remaining = false;
    remaining |= exists(&pods, &name).await?;
    remaining |= exists(&secrets, &secret_name).await?;
    remaining |= exists(&bindings, &sa_name).await?;
    remaining |= exists(&roles, &sa_name).await?;
    remaining |= exists(&sas, &sa_name).await?;
    if remaining {
        return Ok(false);
    }

    remove_finalizer(client, session).await?;
    Ok(true)
}

async fn create_tolerant<T>(api: &Api<T>, desired: &T) -> Result<(), Error>
where
    T: Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Brings up the full child set: minted identity, credential bundle,
/// worker pod. Get-then-create; an identical existing child is a
/// no-op. Only then does the phase advance Pending → Creating.
pub async fn create_children(
    client: Client,
    vault: &Vault,
    session: &AgentSession,
    image: &str,
    gateway_url: &str,
    llm_base_url: &str,
) -> Result<(), Error> {
    let namespace = children::session_namespace(session)?.to_string();
    let name = children::worker_name(session)?.to_string();

    let credentials = children::credential_env(vault, session).await?;

    let sas: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    create_tolerant(&sas, &children::service_account(session)?).await?;
    let roles: Api<Role> = Api::namespaced(client.clone(), &namespace);
    create_tolerant(&roles, &children::role(session)?).await?;
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), &namespace);
    create_tolerant(&bindings, &children::role_binding(session)?).await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let desired_secret = children::env_secret(session, credentials, llm_base_url)?;
    let secret_name = children::env_secret_name(&name);
    match secrets.get(&secret_name).await {
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            create_tolerant(&secrets, &desired_secret).await?;
        }
        Ok(existing) => {
            let existing_hash = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(corral_common::annotations::SPEC_HASH))
                .cloned();
            let desired_hash = desired_secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(corral_common::annotations::SPEC_HASH))
                .cloned();
            if existing_hash != desired_hash {
                // Mutable child diverged: converge it.
                let mut replacement = desired_secret.clone();
                replacement.metadata.resource_version = existing.metadata.resource_version.clone();
                secrets
                    .replace(&secret_name, &PostParams::default(), &replacement)
                    .await?;
            }
        }
        Err(e) => return Err(e.into()),
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    create_tolerant(&pods, &children::worker_pod(session, image, gateway_url)?).await?;

    if decide::phase_of(session) == SessionPhase::Pending {
        patch_session_status(client.clone(), session, |status| {
            status.phase = SessionPhase::Creating;
            status.message = Some(format!("Creating worker Pod '{}'", name));
            status.worker = Some(name.clone());
        })
        .await?;
        publish_event(
            client,
            session,
            EventType::Normal,
            "CreatingWorker",
            format!("Creating worker Pod '{}'", name),
        )
        .await;
    }
    Ok(())
}

/// Keeps the Creating message current while the worker comes up.
pub async fn starting(client: Client, session: &AgentSession, reason: String) -> Result<(), Error> {
    let current = session
        .status
        .as_ref()
        .and_then(|s| s.message.as_deref());
    if current == Some(reason.as_str()) {
        return Ok(());
    }
    patch_session_status(client, session, |status| {
        status.message = Some(reason.clone());
    })
    .await?;
    Ok(())
}

pub async fn mark_running(
    client: Client,
    session: &AgentSession,
    pod_name: &str,
) -> Result<(), Error> {
    let already_running = decide::phase_of(session) == SessionPhase::Running;
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::Running;
        status.worker = Some(pod_name.to_string());
        status.message = Some(format!("Worker Pod '{}' is running", pod_name));
        // The running budget runs from the FIRST transition only.
        if status.started_at.is_none() {
            status.started_at = Some(Time(Timestamp::now()));
        }
    })
    .await?;
    if !already_running {
        publish_event(
            client,
            session,
            EventType::Normal,
            "WorkerRunning",
            format!("Worker Pod '{}' reported ready", pod_name),
        )
        .await;
    }
    Ok(())
}

pub async fn suspend(
    client: Client,
    session: &AgentSession,
    request: ApprovalRequest,
) -> Result<(), Error> {
    let summary = request.summary.clone();
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::WaitingForApproval;
        status.message = Some(format!("Waiting for approval: {}", request.summary));
        status.approval_request = Some(ApprovalRequest {
            requested_at: Some(Time(Timestamp::now())),
            ..request.clone()
        });
    })
    .await?;
    publish_event(
        client,
        session,
        EventType::Normal,
        "ApprovalRequested",
        format!("Worker requested approval: {}", summary),
    )
    .await;
    Ok(())
}

/// Hands the caller's decision to the worker (via its pod annotations)
/// and resumes the session.
pub async fn resume(
    client: Client,
    session: &AgentSession,
    decision: &ApprovalDecision,
) -> Result<(), Error> {
    let name = children::worker_name(session)?;
    let namespace = children::session_namespace(session)?;
    let verdict = match decision.decision {
        ApprovalChoice::Allow => "allow",
        ApprovalChoice::Revise => "revise",
        ApprovalChoice::Deny => "deny",
    };
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    // Merge-patch semantics: a null value deletes the consumed request.
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                (worker::APPROVAL_DECISION): verdict,
                (worker::APPROVAL_PAYLOAD): decision.payload.clone().unwrap_or_default(),
                (worker::STATE): worker::STATE_RUNNING,
                (worker::APPROVAL_REQUEST): serde_json::Value::Null,
            }
        }
    });
    pods.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::Running;
        status.approval_request = None;
        status.message = Some(format!("Approval {verdict}ed; worker resumed"));
    })
    .await?;
    publish_event(
        client,
        session,
        EventType::Normal,
        "ApprovalGranted",
        format!("Caller decision '{verdict}' handed to worker"),
    )
    .await;
    Ok(())
}

pub async fn complete(
    client: Client,
    session: &AgentSession,
    result: Option<String>,
    cost: Option<CostMetrics>,
) -> Result<(), Error> {
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::Completed;
        status.message = Some("Session completed".to_string());
        status.result = result.clone();
        status.cost = cost.clone();
        status.error = None;
        status.reason = None;
        status.completed_at = Some(Time(Timestamp::now()));
    })
    .await?;
    // The worker handle is released on completion; the rest of the
    // children go with the session itself.
    delete_worker(client.clone(), session).await?;
    publish_event(
        client,
        session,
        EventType::Normal,
        "SessionCompleted",
        "Worker reported success".to_string(),
    )
    .await;
    Ok(())
}

pub async fn fail(
    client: Client,
    session: &AgentSession,
    reason: &'static str,
    message: String,
) -> Result<(), Error> {
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::Failed;
        status.reason = Some(reason.to_string());
        status.error = Some(message.clone());
        status.message = Some(message.clone());
        status.completed_at = Some(Time(Timestamp::now()));
    })
    .await?;
    delete_worker(client.clone(), session).await?;
    publish_event(
        client,
        session,
        EventType::Warning,
        reason,
        message,
    )
    .await;
    Ok(())
}

pub async fn cancelled(client: Client, session: &AgentSession) -> Result<(), Error> {
    patch_session_status(client.clone(), session, |status| {
        status.phase = SessionPhase::Cancelled;
        status.message = Some("Cancelled by caller".to_string());
        status.completed_at = Some(Time(Timestamp::now()));
    })
    .await?;
    delete_worker(client.clone(), session).await?;
    publish_event(
        client,
        session,
        EventType::Normal,
        "SessionCancelled",
        "Cancellation marker observed".to_string(),
    )
    .await;
    Ok(())
}
