//! Credential persistence: one opaque Secret per provider in the
//! control-plane namespace, `data[userId] = JSON record`. All writes go
//! through optimistic concurrency with a bounded jittered retry; reads
//! return `None` rather than an error when the user has no entry.

use std::collections::BTreeMap;

use corral_common::annotations;
use corral_types::Provider;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use tokio_util::sync::CancellationToken;

use crate::{CredentialRecord, error::VaultError};

const WRITE_RETRY_BUDGET: usize = 5;

pub fn container_name(provider: Provider) -> String {
    format!("corral-credentials-{}", provider.as_str())
}

fn container_labels(provider: Provider) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "corral".to_string(),
    );
    labels.insert(annotations::PROVIDER.to_string(), provider.as_str().to_string());
    labels.insert(
        annotations::CREDENTIAL_KIND.to_string(),
        provider.family().as_str().to_string(),
    );
    labels
}

#[derive(Clone)]
pub struct SecretStore {
    client: Client,
    namespace: String,
}

impl SecretStore {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get_container(&self, provider: Provider) -> Result<Option<Secret>, VaultError> {
        match self.api().get(&container_name(provider)).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(
        &self,
        provider: Provider,
        user_id: &str,
    ) -> Result<Option<CredentialRecord>, VaultError> {
        let Some(secret) = self.get_container(provider).await? else {
            return Ok(None);
        };
        let Some(entry) = secret.data.as_ref().and_then(|d| d.get(user_id)) else {
            return Ok(None);
        };
        let record: CredentialRecord = serde_json::from_slice(&entry.0)?;
        Ok(Some(record))
    }

    /// Upserts one user's entry. Losing the resourceVersion race means
    /// someone else touched a sibling entry; re-read and re-apply.
    pub async fn put(
        &self,
        provider: Provider,
        user_id: &str,
        record: &CredentialRecord,
    ) -> Result<(), VaultError> {
        let payload = ByteString(serde_json::to_vec(record)?);
        let cancel = CancellationToken::new();
        for attempt in 0..WRITE_RETRY_BUDGET {
            match self.get_container(provider).await? {
                None => {
                    let mut data = BTreeMap::new();
                    data.insert(user_id.to_string(), payload.clone());
                    let secret = Secret {
                        metadata: ObjectMeta {
                            name: Some(container_name(provider)),
                            namespace: Some(self.namespace.clone()),
                            labels: Some(container_labels(provider)),
                            ..Default::default()
                        },
                        data: Some(data),
                        ..Default::default()
                    };
                    match self.api().create(&PostParams::default(), &secret).await {
                        Ok(_) => return Ok(()),
                        // Lost the create race; retry as an update.
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(mut secret) => {
                    secret
                        .data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(user_id.to_string(), payload.clone());
                    let name = container_name(provider);
                    match self
                        .api()
                        .replace(&name, &PostParams::default(), &secret)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            let _ = corral_common::wait::backoff_step(&cancel, attempt).await;
        }
        Err(VaultError::Conflict)
    }

    /// Removes one user's entry. Absent container or entry is success.
    pub async fn delete(&self, provider: Provider, user_id: &str) -> Result<(), VaultError> {
        let cancel = CancellationToken::new();
        for attempt in 0..WRITE_RETRY_BUDGET {
            let Some(mut secret) = self.get_container(provider).await? else {
                return Ok(());
            };
            let existed = secret
                .data
                .as_mut()
                .map(|d| d.remove(user_id).is_some())
                .unwrap_or(false);
            if !existed {
                return Ok(());
            }
            let name = container_name(provider);
            match self
                .api()
                .replace(&name, &PostParams::default(), &secret)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let _ = corral_common::wait::backoff_step(&cancel, attempt).await;
        }
        Err(VaultError::Conflict)
    }
}
