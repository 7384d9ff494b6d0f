//! The authorization gateway: resolves the caller's delegated identity
//! per request, performs cluster access reviews with it, and hands out
//! `Escalation` capabilities that are the only doorway to the
//! control-plane identity. The privileged client is never a fallback:
//! any failure here surfaces the caller's own error.

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use k8s_openapi::api::authentication::v1::SelfSubjectReview;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::{Api, api::PostParams, config::AuthInfo};
use serde::Deserialize;

use corral_common::response;

use crate::app::App;

pub const FORWARDED_TOKEN_HEADER: &str = "x-forwarded-access-token";

/// Claim carrying the tenant assertion in tokens minted by identity
/// proxies; checked against the path tenant and failed closed on
/// mismatch.
const TENANT_CLAIM: &str = "corral.dev/tenant";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Missing,

    #[error("token expired or invalid")]
    Expired,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("tenant mismatch between header and credential")]
    TenantMismatch,

    #[error("cluster error: {0}")]
    Cluster(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Missing | AuthError::Expired => response::unauthorized(anyhow::anyhow!("{self}")),
            AuthError::Forbidden => response::forbidden(anyhow::anyhow!("{self}")),
            AuthError::TenantMismatch => response::bad_request(anyhow::anyhow!("{self}")),
            AuthError::Cluster(_) => response::bad_gateway(anyhow::anyhow!("{self}")),
        }
    }
}

/// Unverified claims peeked out of the bearer's JWT payload. Used only
/// for routing and the cross-tenant pre-check; trust comes from the
/// cluster's own reviews, never from this decode.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "corral.dev/tenant")]
    pub tenant: Option<String>,
}

pub fn extract_bearer(headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && !token.trim().is_empty()
    {
        return Ok(token.trim().to_string());
    }
    // Identity-forwarding header for transparent proxy deployments.
    if let Some(value) = headers.get(FORWARDED_TOKEN_HEADER)
        && let Ok(token) = value.to_str()
        && !token.trim().is_empty()
    {
        return Ok(token.trim().to_string());
    }
    Err(AuthError::Missing)
}

/// Best-effort JWT payload decode; opaque tokens yield empty claims.
pub fn peek_claims(bearer: &str) -> TokenClaims {
    let mut parts = bearer.split('.');
    let (Some(_header), Some(payload)) = (parts.next(), parts.next()) else {
        return TokenClaims::default();
    };
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload) else {
        return TokenClaims::default();
    };
    serde_json::from_slice(&bytes).unwrap_or_default()
}

/// Two independent tenant assertions must agree; a mismatch fails
/// closed before any review runs. Tokens without a tenant claim assert
/// nothing.
pub fn ensure_tenant_consistency(claims: &TokenClaims, tenant: &str) -> Result<(), AuthError> {
    match claims.tenant.as_deref() {
        Some(asserted) if asserted != tenant => Err(AuthError::TenantMismatch),
        _ => Ok(()),
    }
}

/// The caller as seen by this request: peeked claims and a cluster
/// client that forwards the bearer verbatim.
pub struct Caller {
    pub claims: TokenClaims,
    pub client: kube::Client,
}

pub async fn authenticate(app: &App, headers: &HeaderMap) -> Result<Caller, AuthError> {
    let bearer = extract_bearer(headers)?;
    let claims = peek_claims(&bearer);
    let client = delegated_client(&app.base_config, &bearer)?;
    Ok(Caller { claims, client })
}

/// Builds a client against the same cluster endpoint with the caller's
/// bearer as its entire auth section, clearing any exec/auth-provider
/// plugin so nothing can substitute the privileged identity.
pub fn delegated_client(base: &kube::Config, bearer: &str) -> Result<kube::Client, AuthError> {
    let mut config = base.clone();
    config.auth_info = AuthInfo {
        token: Some(bearer.to_string().into()),
        ..Default::default()
    };
    kube::Client::try_from(config).map_err(|e| AuthError::Cluster(e.to_string()))
}

/// The cluster's authoritative answer to "who is this token". Used to
/// key credential storage and to recognize session service accounts.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub username: String,
    pub uid: Option<String>,
}

impl Identity {
    /// Stable key for credential storage: the authenticator's uid when
    /// present, the username otherwise.
    pub fn user_id(&self) -> &str {
        self.uid.as_deref().filter(|u| !u.is_empty()).unwrap_or(&self.username)
    }

    /// `(namespace, name)` when this identity is a service account.
    pub fn service_account(&self) -> Option<(&str, &str)> {
        let rest = self.username.strip_prefix("system:serviceaccount:")?;
        rest.split_once(':')
    }
}

pub async fn whoami(delegated: &kube::Client) -> Result<Identity, AuthError> {
    let api: Api<SelfSubjectReview> = Api::all(delegated.clone());
    let review = SelfSubjectReview::default();
    match api.create(&PostParams::default(), &review).await {
        Ok(result) => {
            let info = result
                .status
                .and_then(|s| s.user_info)
                .ok_or_else(|| AuthError::Cluster("self-subject review had no user info".into()))?;
            Ok(Identity {
                username: info.username.unwrap_or_default(),
                uid: info.uid,
            })
        }
        Err(kube::Error::Api(ae)) if ae.code == 401 => Err(AuthError::Expired),
        Err(kube::Error::Api(ae)) if ae.code == 403 => Err(AuthError::Forbidden),
        Err(e) => Err(AuthError::Cluster(e.to_string())),
    }
}

/// Proof that the caller passed an access review for one
/// `(tenant, resource, verb)`. Only constructible here, and only from
/// an `allowed` review: privileged write paths take it by reference,
/// which is what makes validate-then-escalate structural instead of
/// conventional.
pub struct Escalation {
    tenant: String,
    resource: String,
    verb: String,
}

impl Escalation {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }
}

/// Runs a self-subject access review with the caller's own client.
/// Distinguishes server-side authentication failure (401) from policy
/// denial (403 or allowed=false) from transport error.
pub async fn authorize(
    delegated: &kube::Client,
    tenant: &str,
    group: &str,
    resource: &str,
    verb: &str,
    name: Option<&str>,
) -> Result<Escalation, AuthError> {
    let review = SelfSubjectAccessReview {
        metadata: Default::default(),
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(tenant.to_string()),
                group: Some(group.to_string()),
                resource: Some(resource.to_string()),
                verb: Some(verb.to_string()),
                name: name.map(|n| n.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        status: None,
    };
    let api: Api<SelfSubjectAccessReview> = Api::all(delegated.clone());
    match api.create(&PostParams::default(), &review).await {
        Ok(result) => {
            let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
            if allowed {
                Ok(Escalation {
                    tenant: tenant.to_string(),
                    resource: resource.to_string(),
                    verb: verb.to_string(),
                })
            } else {
                Err(AuthError::Forbidden)
            }
        }
        Err(kube::Error::Api(ae)) if ae.code == 401 => Err(AuthError::Expired),
        Err(kube::Error::Api(ae)) if ae.code == 403 => Err(AuthError::Forbidden),
        Err(e) => Err(AuthError::Cluster(e.to_string())),
    }
}

/// Tenant-access probe: can this caller read sessions in the tenant at
/// all. Used before list/get so a bad token 401s without touching
/// objects.
pub async fn authorize_tenant_access(
    delegated: &kube::Client,
    tenant: &str,
) -> Result<(), AuthError> {
    authorize(delegated, tenant, "corral.dev", "agentsessions", "get", None).await?;
    Ok(())
}

/// Name of the per-session service account whose projected token is
/// the session-minted identity.
pub fn session_service_account(session: &str) -> String {
    format!("corral-session-{session}")
}

/// Maps a kube API error from a delegated read into the caller-facing
/// taxonomy.
pub fn map_kube_error(e: kube::Error) -> AuthError {
    match e {
        kube::Error::Api(ae) if ae.code == 401 => AuthError::Expired,
        kube::Error::Api(ae) if ae.code == 403 => AuthError::Forbidden,
        e => AuthError::Cluster(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn jwt_with_payload(payload: serde_json::Value) -> String {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        format!("eyJhbGciOiJSUzI1NiJ9.{body}.c2ln")
    }

    #[test]
    fn bearer_comes_from_authorization_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-123"),
        );
        headers.insert(
            FORWARDED_TOKEN_HEADER,
            HeaderValue::from_static("forwarded-tok"),
        );
        assert_eq!(extract_bearer(&headers).unwrap(), "tok-123");
    }

    #[test]
    fn forwarded_header_is_accepted_for_proxies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_TOKEN_HEADER,
            HeaderValue::from_static("forwarded-tok"),
        );
        assert_eq!(extract_bearer(&headers).unwrap(), "forwarded-tok");
    }

    #[test]
    fn missing_credential_is_its_own_error() {
        let headers = HeaderMap::new();
        assert!(matches!(extract_bearer(&headers), Err(AuthError::Missing)));
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(matches!(extract_bearer(&headers), Err(AuthError::Missing)));
    }

    #[test]
    fn claims_peek_reads_sub_and_tenant() {
        let token = jwt_with_payload(serde_json::json!({
            "sub": "user-42",
            "corral.dev/tenant": "team-b",
        }));
        let claims = peek_claims(&token);
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.tenant.as_deref(), Some("team-b"));
    }

    #[test]
    fn opaque_tokens_yield_empty_claims() {
        let claims = peek_claims("not-a-jwt");
        assert_eq!(claims.sub, "");
        assert!(claims.tenant.is_none());
    }

    #[test]
    fn tenant_mismatch_fails_closed() {
        let claims = TokenClaims {
            tenant: Some("team-b".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ensure_tenant_consistency(&claims, "team-a"),
            Err(AuthError::TenantMismatch)
        ));
        assert!(ensure_tenant_consistency(&claims, "team-b").is_ok());
        // No claim asserts nothing.
        assert!(ensure_tenant_consistency(&TokenClaims::default(), "team-a").is_ok());
    }

    #[test]
    fn service_account_identities_parse() {
        let id = Identity {
            username: "system:serviceaccount:team-a:corral-session-fix-typo-1".to_string(),
            uid: Some("abc".to_string()),
        };
        assert_eq!(
            id.service_account(),
            Some(("team-a", "corral-session-fix-typo-1"))
        );
        let human = Identity {
            username: "jane@acme.test".to_string(),
            uid: None,
        };
        assert_eq!(human.service_account(), None);
        assert_eq!(human.user_id(), "jane@acme.test");
    }

    #[test]
    fn session_service_account_matches_worker_identity() {
        assert_eq!(
            session_service_account("fix-typo-1"),
            "corral-session-fix-typo-1"
        );
    }
}
