//! Tenant flag routes: reads and writes are both gated by the
//! caller's own permissions on the tenant's override map; only after
//! an `allowed` review does the store write with the control-plane
//! identity.

use anyhow::anyhow;
use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use owo_colors::OwoColorize;
use serde::Deserialize;
use serde_json::json;

use corral_common::{RequestContextExtractor, naming, response};
use corral_flags::{FlagContext, overrides::OVERRIDE_MAP_NAME};

use crate::{app::App, auth};

pub const MAX_FLAG_NAME_LEN: usize = 128;

/// Flag names come from the oracle's namespace, which is looser than
/// object names: dots and uppercase are fine, whitespace is not.
pub fn validate_flag_name(flag: &str) -> anyhow::Result<()> {
    if flag.is_empty() || flag.len() > MAX_FLAG_NAME_LEN {
        anyhow::bail!("flag name must be 1..{} characters", MAX_FLAG_NAME_LEN);
    }
    if !flag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        anyhow::bail!("flag name contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

#[derive(Deserialize, Debug)]
pub struct OverrideRequest {
    pub enabled: bool,
}

async fn gate_read(app: &App, headers: &HeaderMap, tenant: &str) -> Result<auth::Caller, Response> {
    let caller = auth::authenticate(app, headers)
        .await
        .map_err(|e| e.into_response())?;
    auth::ensure_tenant_consistency(&caller.claims, tenant).map_err(|e| e.into_response())?;
    if let Err(e) = naming::validate_name("tenant", tenant) {
        return Err(response::bad_request(e));
    }
    auth::authorize(
        &caller.client,
        tenant,
        "",
        "configmaps",
        "get",
        Some(OVERRIDE_MAP_NAME),
    )
    .await
    .map_err(|e| e.into_response())?;
    Ok(caller)
}

pub async fn list(
    State(app): State<App>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = gate_read(&app, &headers, &tenant).await {
        return resp;
    }
    match app.flags.list(&tenant).await {
        Ok(flags) => Json(flags).into_response(),
        Err(e) => response::error(e.context("Failed to list flags")),
    }
}

pub async fn evaluate(
    State(app): State<App>,
    Path((tenant, flag)): Path<(String, String)>,
    RequestContextExtractor(ctx): RequestContextExtractor,
    headers: HeaderMap,
) -> Response {
    let caller = match gate_read(&app, &headers, &tenant).await {
        Ok(caller) => caller,
        Err(resp) => return resp,
    };
    if let Err(e) = validate_flag_name(&flag) {
        return response::bad_request(e);
    }
    let flag_ctx = FlagContext {
        user_id: Some(caller.claims.sub.clone()).filter(|s| !s.is_empty()),
        session_id: None,
        remote_addr: ctx.client_ip.map(|ip| ip.to_string()),
    };
    match app.flags.evaluate(&tenant, &flag, &flag_ctx).await {
        Ok(eval) => Json(eval).into_response(),
        Err(e) => response::error(e.context("Failed to evaluate flag")),
    }
}

pub async fn put_override(
    State(app): State<App>,
    Path((tenant, flag)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<OverrideRequest>,
) -> Response {
    let caller = match auth::authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = auth::ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) = naming::validate_name("tenant", &tenant) {
        return response::bad_request(e);
    }
    if let Err(e) = validate_flag_name(&flag) {
        return response::bad_request(e);
    }
    // Create/update on the tenant's override store gates the write.
    let proof = match auth::authorize(
        &caller.client,
        &tenant,
        "",
        "configmaps",
        "update",
        Some(OVERRIDE_MAP_NAME),
    )
    .await
    {
        Ok(proof) => proof,
        Err(e) => return e.into_response(),
    };
    println!(
        "{}",
        format!(
            "🔐 control-plane write • reason=caller-allowed tenant={} resource={} verb={} flag={}",
            proof.tenant(),
            proof.resource(),
            proof.verb(),
            flag
        )
        .dimmed()
    );
    match app.flags.set_override(&tenant, &flag, req.enabled).await {
        Ok(()) => Json(json!({"flag": flag, "enabled": req.enabled, "source": "override"}))
            .into_response(),
        Err(e) => response::error(e.context("Failed to set override")),
    }
}

pub async fn delete_override(
    State(app): State<App>,
    Path((tenant, flag)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = match auth::authenticate(&app, &headers).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = auth::ensure_tenant_consistency(&caller.claims, &tenant) {
        return e.into_response();
    }
    if let Err(e) = naming::validate_name("tenant", &tenant) {
        return response::bad_request(e);
    }
    if let Err(e) = validate_flag_name(&flag) {
        return response::bad_request(e);
    }
    let proof = match auth::authorize(
        &caller.client,
        &tenant,
        "",
        "configmaps",
        "update",
        Some(OVERRIDE_MAP_NAME),
    )
    .await
    {
        Ok(proof) => proof,
        Err(e) => return e.into_response(),
    };
    println!(
        "{}",
        format!(
            "🔐 control-plane write • reason=caller-allowed tenant={} resource={} verb={} flag={}",
            proof.tenant(),
            proof.resource(),
            proof.verb(),
            flag
        )
        .dimmed()
    );
    match app.flags.delete_override(&tenant, &flag).await {
        Ok(()) => Json(json!({"flag": flag, "source": "oracle"})).into_response(),
        Err(e) => response::error(e.context("Failed to delete override")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names_allow_oracle_style_identifiers() {
        assert!(validate_flag_name("feature-X").is_ok());
        assert!(validate_flag_name("checkout.v2_rollout").is_ok());
        assert!(validate_flag_name("").is_err());
        assert!(validate_flag_name("has space").is_err());
        assert!(validate_flag_name(&"f".repeat(200)).is_err());
    }
}
