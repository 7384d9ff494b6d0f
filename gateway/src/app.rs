use std::{ops::Deref, sync::Arc};

use anyhow::{Context, Result};
use corral_common::args::ProviderArgs;
use corral_flags::FlagStore;
use corral_vault::Vault;

pub struct AppInner {
    /// The control-plane identity. Only used for writes that follow a
    /// successful access review by the caller's delegated client.
    pub privileged: kube::Client,
    /// Cluster endpoint/CA config the delegated clients are built
    /// from; per-request bearer tokens replace its auth section.
    pub base_config: kube::Config,
    pub control_ns: String,
    pub vault: Vault,
    pub flags: FlagStore,
    pub providers: ProviderArgs,
    pub http: reqwest::Client,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Deref for App {
    type Target = AppInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl App {
    pub async fn new(args: &crate::args::ServerArgs) -> Result<Self> {
        let base_config = kube::Config::infer()
            .await
            .context("Failed to infer cluster config")?;
        let privileged = kube::Client::try_from(base_config.clone())
            .context("Failed to build control-plane client")?;
        let control_ns = corral_common::control_plane_namespace();
        let vault = Vault::new(
            privileged.clone(),
            control_ns.clone(),
            args.providers.clone(),
        );
        let flags = FlagStore::new(privileged.clone(), &args.oracle);
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                args.providers.upstream_timeout_seconds,
            ))
            .build()
            .context("Failed to build upstream http client")?;
        Ok(Self {
            inner: Arc::new(AppInner {
                privileged,
                base_config,
                control_ns,
                vault,
                flags,
                providers: args.providers.clone(),
                http,
            }),
        })
    }
}
