use corral_types::Provider;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid credential material: {0}")]
    BadInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Credential write lost the optimistic-concurrency race after retries")]
    Conflict,

    #[error("Upstream provider error: {0}")]
    Upstream(String),
}

/// Outcome taxonomy of `resolve`: consumers route on these, so they
/// are typed rather than stringly.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no {0} credential configured")]
    NotConfigured(Provider),

    #[error("{0} credential expired; re-authentication required")]
    Expired(Provider),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}
