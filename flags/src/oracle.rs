//! Client for the external flag oracle. The oracle is an opaque
//! boolean evaluator; when it is not configured every answer is
//! `false` and the store keeps working on overrides alone.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use corral_common::args::OracleArgs;
use owo_colors::OwoColorize;
use serde::Deserialize;

/// Evaluation context forwarded to the oracle for percentage rollouts
/// and identity targeting. All fields optional.
#[derive(Debug, Default, Clone)]
pub struct FlagContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub remote_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OracleFlag {
    pub name: String,
    pub enabled: bool,
    pub description: Option<String>,
}

pub struct Oracle {
    eval_url: String,
    client_key: String,
    admin_url: Option<String>,
    admin_token: Option<String>,
    project: Option<String>,
    workspace_tag_type: String,
    workspace_tag_value: String,
    http: reqwest::Client,
}

impl Oracle {
    /// Init-once: returns None when no oracle URL is configured, and
    /// the caller runs degraded.
    pub fn from_args(args: &OracleArgs) -> Option<Oracle> {
        let eval_url = args.oracle_url.clone()?;
        let client_key = args.oracle_client_key.clone().unwrap_or_default();
        Some(Oracle {
            eval_url: eval_url.trim_end_matches('/').to_string(),
            client_key,
            admin_url: args
                .oracle_admin_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            admin_token: args.oracle_admin_token.clone(),
            project: args.oracle_project.clone(),
            workspace_tag_type: args.workspace_tag_type.clone(),
            workspace_tag_value: args.workspace_tag_value.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("construct oracle http client"),
        })
    }

    pub async fn is_enabled(&self, flag: &str) -> bool {
        self.is_enabled_for_context(flag, &FlagContext::default())
            .await
    }

    /// Transport failures evaluate to `false`; flags gate features, so
    /// an unreachable oracle must look like "feature off", not an
    /// outage.
    pub async fn is_enabled_for_context(&self, flag: &str, ctx: &FlagContext) -> bool {
        match self.try_evaluate(flag, ctx).await {
            Ok(enabled) => enabled,
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("⚠️ Oracle evaluation failed for '{}': {:#}", flag, e).yellow()
                );
                false
            }
        }
    }

    async fn try_evaluate(&self, flag: &str, ctx: &FlagContext) -> Result<bool> {
        #[derive(Deserialize)]
        struct EvalFlag {
            feature: FeatureRepr,
            enabled: bool,
        }
        #[derive(Deserialize)]
        struct FeatureRepr {
            name: String,
        }

        let mut req = self
            .http
            .get(format!("{}/flags/", self.eval_url))
            .header("X-Environment-Key", &self.client_key);
        if let Some(identifier) = ctx.user_id.as_deref().or(ctx.session_id.as_deref()) {
            req = req.query(&[("identifier", identifier)]);
        }
        if let Some(addr) = ctx.remote_addr.as_deref() {
            req = req.query(&[("remote_addr", addr)]);
        }
        let res = req.send().await.context("Oracle evaluation request failed")?;
        if !res.status().is_success() {
            bail!("Oracle evaluation returned {}", res.status());
        }
        let flags: Vec<EvalFlag> = res
            .json()
            .await
            .context("Failed to parse oracle evaluation response")?;
        Ok(flags
            .iter()
            .find(|f| f.feature.name == flag)
            .map(|f| f.enabled)
            .unwrap_or(false))
    }

    /// Lists flags the oracle marks as workspace-configurable (by its
    /// own tag metadata). Errors here mean "oracle unreachable"; the
    /// store falls back to overrides only.
    pub async fn list_workspace_flags(&self) -> Result<Vec<OracleFlag>> {
        #[derive(Deserialize)]
        struct AdminPage {
            results: Vec<AdminFlag>,
        }
        #[derive(Deserialize)]
        struct AdminFlag {
            name: String,
            #[serde(default)]
            enabled: bool,
            #[serde(default)]
            description: Option<String>,
            #[serde(default)]
            tags: Vec<AdminTag>,
        }
        #[derive(Deserialize)]
        struct AdminTag {
            #[serde(rename = "type")]
            tag_type: String,
            value: String,
        }

        let (Some(admin_url), Some(admin_token), Some(project)) =
            (&self.admin_url, &self.admin_token, &self.project)
        else {
            bail!("Oracle admin API is not configured");
        };
        let res = self
            .http
            .get(format!("{}/projects/{}/features/", admin_url, project))
            .bearer_auth(admin_token)
            .send()
            .await
            .context("Oracle admin request failed")?;
        if !res.status().is_success() {
            bail!("Oracle admin API returned {}", res.status());
        }
        let page: AdminPage = res
            .json()
            .await
            .context("Failed to parse oracle admin response")?;
        Ok(page
            .results
            .into_iter()
            .filter(|f| {
                f.tags.iter().any(|t| {
                    t.tag_type == self.workspace_tag_type && t.value == self.workspace_tag_value
                })
            })
            .map(|f| OracleFlag {
                name: f.name,
                enabled: f.enabled,
                description: f.description,
            })
            .collect())
    }
}
