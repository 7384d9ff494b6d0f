//! Builders for the objects a session owns: the minted identity
//! (ServiceAccount + Role + RoleBinding), the ephemeral credential
//! bundle, and the worker pod. Everything carries the session's
//! controller owner reference so cascading deletion does the heavy
//! lifting, and the spec-hash annotation so divergence is detectable.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, Pod, PodSpec, Secret, SecretEnvSource, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{ObjectMeta, Resource};

use corral_common::annotations;
use corral_types::{AgentSession, Provider};
use corral_vault::{ResolveError, ResolvedCredential, Vault};

use crate::util::{self, Error};

/// The worker pod carries the session's own name.
pub fn worker_name(session: &AgentSession) -> Result<&str, Error> {
    session
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("AgentSession is missing metadata.name".to_string()))
}

pub fn session_namespace(session: &AgentSession) -> Result<&str, Error> {
    session
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("AgentSession is missing metadata.namespace".to_string()))
}

pub fn service_account_name(session_name: &str) -> String {
    format!("corral-session-{session_name}")
}

pub fn env_secret_name(session_name: &str) -> String {
    format!("corral-session-{session_name}-env")
}

fn child_meta(session: &AgentSession, name: String) -> Result<ObjectMeta, Error> {
    let namespace = session_namespace(session)?.to_string();
    let mut owner = session.controller_owner_ref(&()).unwrap();
    // Blocking deletion would require tenant-side RBAC on finalizer
    // updates and can deadlock multi-tenant deletes.
    owner.block_owner_deletion = None;
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        owner_references: Some(vec![owner]),
        labels: Some({
            let mut labels = BTreeMap::new();
            labels.insert(
                "app.kubernetes.io/managed-by".to_string(),
                "corral-operator".to_string(),
            );
            labels.insert(
                annotations::SESSION.to_string(),
                worker_name(session)?.to_string(),
            );
            labels
        }),
        annotations: Some({
            let mut a = BTreeMap::new();
            a.insert(
                annotations::SPEC_HASH.to_string(),
                util::session_spec_hash(&session.spec),
            );
            a.insert(
                annotations::CREATED_BY.to_string(),
                "corral-operator".to_string(),
            );
            a
        }),
        ..Default::default()
    })
}

/// The session-minted identity: a service account whose projected
/// token the worker presents back to the control plane.
pub fn service_account(session: &AgentSession) -> Result<ServiceAccount, Error> {
    let name = worker_name(session)?;
    Ok(ServiceAccount {
        metadata: child_meta(session, service_account_name(name))?,
        ..Default::default()
    })
}

/// RBAC scope of the minted identity: read exactly this session, and
/// patch exactly its own pod (that is how it reports state). Even a
/// forged token holding this role reaches nothing else.
pub fn role(session: &AgentSession) -> Result<Role, Error> {
    let name = worker_name(session)?;
    Ok(Role {
        metadata: child_meta(session, service_account_name(name))?,
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["corral.dev".to_string()]),
                resources: Some(vec!["agentsessions".to_string()]),
                resource_names: Some(vec![name.to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                resource_names: Some(vec![name.to_string()]),
                verbs: vec!["get".to_string(), "patch".to_string()],
                ..Default::default()
            },
        ]),
    })
}

pub fn role_binding(session: &AgentSession) -> Result<RoleBinding, Error> {
    let name = worker_name(session)?;
    let namespace = session_namespace(session)?;
    Ok(RoleBinding {
        metadata: child_meta(session, service_account_name(name))?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: service_account_name(name),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(name),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    })
}

/// Resolves the session's provider credentials into the env entries
/// stamped into the worker at start. Missing or expired credentials
/// degrade to an absent entry (the worker clones anonymously or fails
/// with its own message); transient upstream failures bubble out so
/// the reconcile retries with backoff.
pub async fn credential_env(
    vault: &Vault,
    session: &AgentSession,
) -> Result<BTreeMap<String, String>, Error> {
    let mut env = BTreeMap::new();
    let user_id = session.spec.user_context.user_id.as_str();
    for provider in session.spec.required_providers() {
        match vault.resolve_for_session(provider, user_id).await {
            Ok(resolved) => insert_provider_env(&mut env, provider, &resolved),
            Err(ResolveError::NotConfigured(_)) => {}
            Err(ResolveError::Expired(p)) => {
                corral_common::response::print_warning(anyhow::anyhow!(
                    "{} credential for this session's owner is expired; starting worker without it",
                    p
                ));
            }
            Err(ResolveError::Transient(reason)) => {
                return Err(Error::Credential(reason));
            }
            Err(ResolveError::Vault(e)) => {
                return Err(Error::Credential(e.to_string()));
            }
        }
    }
    Ok(env)
}

fn insert_provider_env(
    env: &mut BTreeMap<String, String>,
    provider: Provider,
    resolved: &ResolvedCredential,
) {
    match provider {
        Provider::GithubPat | Provider::GithubApp => {
            env.insert("GITHUB_TOKEN".to_string(), resolved.token.clone());
        }
        Provider::GitlabPat => {
            env.insert("GITLAB_TOKEN".to_string(), resolved.token.clone());
            if let Some(url) = &resolved.instance_url {
                env.insert("GITLAB_BASE_URL".to_string(), url.clone());
            }
        }
        Provider::GoogleWorkspace => {
            env.insert("GOOGLE_ACCESS_TOKEN".to_string(), resolved.token.clone());
        }
        Provider::Jira => {
            env.insert("JIRA_API_TOKEN".to_string(), resolved.token.clone());
            if let Some(email) = &resolved.account {
                env.insert("JIRA_EMAIL".to_string(), email.clone());
            }
            if let Some(url) = &resolved.instance_url {
                env.insert("JIRA_BASE_URL".to_string(), url.clone());
            }
        }
        Provider::LlmKey => {
            env.insert("LLM_API_KEY".to_string(), resolved.token.clone());
        }
    }
}

/// The ephemeral secret mounted into the worker: prompt, task shape,
/// and the per-session credential stamps. Owned by the session, so it
/// disappears with it.
pub fn env_secret(
    session: &AgentSession,
    credentials: BTreeMap<String, String>,
    llm_base_url: &str,
) -> Result<Secret, Error> {
    let name = worker_name(session)?;
    let mut string_data = credentials;
    string_data.insert("PROMPT".to_string(), session.spec.prompt.clone());
    string_data.insert("MODEL".to_string(), session.spec.model.clone());
    string_data.insert("LLM_BASE_URL".to_string(), llm_base_url.to_string());
    string_data.insert(
        "REPOS".to_string(),
        serde_json::to_string(&session.spec.repos)?,
    );
    if let Some(workflow) = &session.spec.workflow {
        string_data.insert("WORKFLOW".to_string(), workflow.clone());
    }
    Ok(Secret {
        metadata: child_meta(session, env_secret_name(name))?,
        string_data: Some(string_data),
        ..Default::default()
    })
}

pub fn worker_pod(
    session: &AgentSession,
    image: &str,
    gateway_url: &str,
) -> Result<Pod, Error> {
    let name = worker_name(session)?.to_string();
    let tenant = session_namespace(session)?.to_string();
    Ok(Pod {
        metadata: child_meta(session, name.clone())?,
        spec: Some(PodSpec {
            service_account_name: Some(service_account_name(&name)),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "agent".to_string(),
                image: Some(image.to_string()),
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: env_secret_name(&name),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }]),
                env: Some(vec![
                    EnvVar {
                        name: "CORRAL_SESSION".to_string(),
                        value: Some(name.clone()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "CORRAL_TENANT".to_string(),
                        value: Some(tenant),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "CORRAL_GATEWAY_URL".to_string(),
                        value: Some(gateway_url.to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::{AgentSessionSpec, RepoRef, UserContext};

    fn session() -> AgentSession {
        let mut s = AgentSession::new(
            "fix-typo-1",
            AgentSessionSpec {
                prompt: "Fix typo".to_string(),
                model: "model-x".to_string(),
                repos: vec![RepoRef {
                    url: "https://github.com/acme/site".to_string(),
                    ..Default::default()
                }],
                user_context: UserContext {
                    user_id: "user-42".to_string(),
                    display_name: None,
                },
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("team-a".to_string());
        s.metadata.uid = Some("uid-1".to_string());
        s
    }

    #[test]
    fn minted_identity_is_scoped_to_exactly_one_session() {
        let role = role(&session()).unwrap();
        let rules = role.rules.unwrap();
        for rule in &rules {
            assert_eq!(
                rule.resource_names.as_deref(),
                Some(&["fix-typo-1".to_string()][..]),
            );
        }
        assert!(
            rules
                .iter()
                .all(|r| !r.verbs.iter().any(|v| v == "create" || v == "delete"))
        );
    }

    #[test]
    fn children_are_owned_by_the_session() {
        let s = session();
        for meta in [
            service_account(&s).unwrap().metadata,
            role(&s).unwrap().metadata,
            role_binding(&s).unwrap().metadata,
            worker_pod(&s, "img", "http://gw").unwrap().metadata,
        ] {
            let owners = meta.owner_references.unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].kind, "AgentSession");
            assert_eq!(owners[0].name, "fix-typo-1");
            assert_eq!(owners[0].controller, Some(true));
            // Non-blocking ownership: cascading deletion must not
            // deadlock on tenant RBAC.
            assert_ne!(owners[0].block_owner_deletion, Some(true));
        }
    }

    #[test]
    fn worker_runs_as_the_minted_identity() {
        let pod = worker_pod(&session(), "img", "http://gw").unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.service_account_name.as_deref(),
            Some("corral-session-fix-typo-1")
        );
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(
            env_from[0].secret_ref.as_ref().unwrap().name,
            "corral-session-fix-typo-1-env"
        );
    }

    #[test]
    fn env_secret_carries_task_and_credentials() {
        let mut creds = BTreeMap::new();
        creds.insert("GITHUB_TOKEN".to_string(), "ghp_x".to_string());
        let secret = env_secret(&session(), creds, "https://api.anthropic.com").unwrap();
        let data = secret.string_data.unwrap();
        assert_eq!(data.get("PROMPT").unwrap(), "Fix typo");
        assert_eq!(data.get("MODEL").unwrap(), "model-x");
        assert_eq!(data.get("GITHUB_TOKEN").unwrap(), "ghp_x");
        assert!(data.get("REPOS").unwrap().contains("github.com/acme/site"));
    }
}
