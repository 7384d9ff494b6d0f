//! Per-user credential management routes. The vault is keyed by the
//! cluster authenticator's answer to "who is this token", not by
//! anything the token claims about itself.

use anyhow::anyhow;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use corral_common::response;
use corral_types::Provider;
use corral_vault::{ConnectRequest, VaultError, github, state};

use crate::{app::App, auth};

fn parse_provider(provider: &str) -> Result<Provider, Response> {
    provider
        .parse::<Provider>()
        .map_err(|_| response::bad_request(anyhow!("unknown provider '{}'", provider)))
}

fn map_vault_error(e: VaultError) -> Response {
    match e {
        VaultError::BadInput(reason) => response::bad_request(anyhow!(reason)),
        VaultError::Conflict => response::conflict(anyhow!(
            "credential write lost a concurrent update; retry"
        )),
        VaultError::Upstream(reason) => response::bad_gateway(anyhow!(reason)),
        e => response::error(anyhow!(e).context("Credential store failure")),
    }
}

/// Authenticates the caller and returns the authoritative user id the
/// vault keys on.
async fn caller_user_id(app: &App, headers: &HeaderMap) -> Result<String, Response> {
    let caller = auth::authenticate(app, headers)
        .await
        .map_err(|e| e.into_response())?;
    let identity = auth::whoami(&caller.client)
        .await
        .map_err(|e| e.into_response())?;
    let user_id = identity.user_id().to_string();
    if user_id.is_empty() {
        return Err(response::bad_request(anyhow!(
            "cannot determine caller identity"
        )));
    }
    Ok(user_id)
}

pub async fn connect(
    State(app): State<App>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let user_id = match caller_user_id(&app, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match app.vault.connect(provider, &user_id, req).await {
        Ok(()) => Json(json!({"provider": provider.as_str(), "connected": true})).into_response(),
        Err(e) => map_vault_error(e),
    }
}

pub async fn status(
    State(app): State<App>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let user_id = match caller_user_id(&app, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match app.vault.status(provider, &user_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => map_vault_error(e),
    }
}

pub async fn disconnect(
    State(app): State<App>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let user_id = match caller_user_id(&app, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match app.vault.disconnect(provider, &user_id).await {
        Ok(()) => Json(json!({"provider": provider.as_str(), "connected": false})).into_response(),
        Err(e) => map_vault_error(e),
    }
}

/// Aggregate status across every provider family.
pub async fn integrations_status(State(app): State<App>, headers: HeaderMap) -> Response {
    let user_id = match caller_user_id(&app, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match app.vault.integrations_status(&user_id).await {
        Ok(statuses) => {
            let body: serde_json::Map<String, serde_json::Value> = statuses
                .into_iter()
                .map(|(provider, status)| {
                    (
                        provider.as_str().to_string(),
                        serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect();
            Json(serde_json::Value::Object(body)).into_response()
        }
        Err(e) => map_vault_error(e),
    }
}

/// Starts the GitHub App installation flow: hands back the provider's
/// install URL carrying HMAC-signed state bound to the caller.
pub async fn github_app_install(State(app): State<App>, headers: HeaderMap) -> Response {
    let user_id = match caller_user_id(&app, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(slug) = app.providers.github_app_slug.as_deref() else {
        return response::service_unavailable(anyhow!("GitHub App is not configured"));
    };
    let Some(secret) = app.providers.oauth_state_secret.as_deref() else {
        return response::service_unavailable(anyhow!("OAuth state signing is not configured"));
    };
    let signed = state::sign_state(secret, &user_id, Utc::now());
    Json(json!({
        "url": format!("https://github.com/apps/{slug}/installations/new?state={signed}"),
    }))
    .into_response()
}

#[derive(Deserialize, Debug)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
}

/// OAuth-completion callback. The browser redirect carries no caller
/// credential; identity comes from the signed state, and the
/// installation binds to that user only after GitHub confirms they can
/// see it.
pub async fn github_app_callback(
    State(app): State<App>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(secret) = app.providers.oauth_state_secret.as_deref() else {
        return response::service_unavailable(anyhow!("OAuth state signing is not configured"));
    };
    let (Some(signed), Some(code), Some(installation_id)) =
        (&query.state, &query.code, &query.installation_id)
    else {
        return response::bad_request(anyhow!(
            "callback requires code, state, and installation_id"
        ));
    };
    let payload = match state::verify_state(secret, signed, Utc::now()) {
        Ok(payload) => payload,
        Err(e) => return response::bad_request(anyhow!(e)),
    };
    let (Some(client_id), Some(client_secret)) = (
        app.providers.github_oauth_client_id.as_deref(),
        app.providers.github_oauth_client_secret.as_deref(),
    ) else {
        return response::service_unavailable(anyhow!("GitHub OAuth client is not configured"));
    };
    let user_token =
        match github::exchange_oauth_code(&app.http, client_id, client_secret, code).await {
            Ok(token) => token,
            Err(e) => return map_vault_error(e),
        };
    match github::user_owns_installation(&app.http, &user_token, installation_id).await {
        Ok(true) => {}
        Ok(false) => {
            return response::forbidden(anyhow!(
                "installation does not belong to the authenticated user"
            ));
        }
        Err(e) => return map_vault_error(e),
    }
    let connect = ConnectRequest {
        installation_id: Some(installation_id.clone()),
        ..Default::default()
    };
    match app
        .vault
        .connect(Provider::GithubApp, &payload.user_id, connect)
        .await
    {
        Ok(()) => Json(json!({"provider": "github-app", "connected": true})).into_response(),
        Err(e) => map_vault_error(e),
    }
}
