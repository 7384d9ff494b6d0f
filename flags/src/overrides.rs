//! Per-tenant override storage: one ConfigMap per tenant namespace,
//! keys = flag names, values = "true"/"false". A missing map is not an
//! error; it means no overrides.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use tokio_util::sync::CancellationToken;

pub const OVERRIDE_MAP_NAME: &str = "corral-flag-overrides";

const WRITE_RETRY_BUDGET: usize = 5;

pub fn parse_override(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Clone)]
pub struct OverrideStore {
    client: Client,
}

impl OverrideStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, tenant: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), tenant)
    }

    async fn get_map(&self, tenant: &str) -> Result<Option<ConfigMap>> {
        match self.api(tenant).get(OVERRIDE_MAP_NAME).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e).context("Failed to read override map"),
        }
    }

    /// Entries with values outside {"true","false"} are skipped rather
    /// than failing the whole tenant.
    pub async fn get_all(&self, tenant: &str) -> Result<BTreeMap<String, bool>> {
        let Some(cm) = self.get_map(tenant).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(cm
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| parse_override(&v).map(|b| (k, b)))
            .collect())
    }

    pub async fn set(&self, tenant: &str, flag: &str, enabled: bool) -> Result<()> {
        let cancel = CancellationToken::new();
        for attempt in 0..WRITE_RETRY_BUDGET {
            match self.get_map(tenant).await? {
                None => {
                    let mut data = BTreeMap::new();
                    data.insert(flag.to_string(), enabled.to_string());
                    let cm = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(OVERRIDE_MAP_NAME.to_string()),
                            namespace: Some(tenant.to_string()),
                            ..Default::default()
                        },
                        data: Some(data),
                        ..Default::default()
                    };
                    match self.api(tenant).create(&PostParams::default(), &cm).await {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(e).context("Failed to create override map"),
                    }
                }
                Some(mut cm) => {
                    cm.data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(flag.to_string(), enabled.to_string());
                    match self
                        .api(tenant)
                        .replace(OVERRIDE_MAP_NAME, &PostParams::default(), &cm)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(e).context("Failed to update override map"),
                    }
                }
            }
            let _ = corral_common::wait::backoff_step(&cancel, attempt).await;
        }
        bail!("Override write lost the optimistic-concurrency race after retries")
    }

    /// Deleting an absent entry is success.
    pub async fn delete(&self, tenant: &str, flag: &str) -> Result<()> {
        let cancel = CancellationToken::new();
        for attempt in 0..WRITE_RETRY_BUDGET {
            let Some(mut cm) = self.get_map(tenant).await? else {
                return Ok(());
            };
            let existed = cm
                .data
                .as_mut()
                .map(|d| d.remove(flag).is_some())
                .unwrap_or(false);
            if !existed {
                return Ok(());
            }
            match self
                .api(tenant)
                .replace(OVERRIDE_MAP_NAME, &PostParams::default(), &cm)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e).context("Failed to update override map"),
            }
            let _ = corral_common::wait::backoff_step(&cancel, attempt).await;
        }
        bail!("Override delete lost the optimistic-concurrency race after retries")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_strictly_boolean_strings() {
        assert_eq!(parse_override("true"), Some(true));
        assert_eq!(parse_override("false"), Some(false));
        assert_eq!(parse_override("True"), None);
        assert_eq!(parse_override("1"), None);
        assert_eq!(parse_override(""), None);
    }
}
