use clap::Parser;

/// Connection to the external feature-flag oracle. Everything is
/// optional: with no URL configured the flag store runs in degraded
/// mode and every oracle answer is `false`.
#[derive(Parser, Debug, Clone, Default)]
pub struct OracleArgs {
    /// Base URL of the oracle's evaluation API
    #[arg(long, env = "ORACLE_URL")]
    pub oracle_url: Option<String>,

    /// Client-side (environment) key sent with evaluation calls
    #[arg(long, env = "ORACLE_CLIENT_KEY")]
    pub oracle_client_key: Option<String>,

    /// Base URL of the oracle's admin API (flag listing)
    #[arg(long, env = "ORACLE_ADMIN_URL")]
    pub oracle_admin_url: Option<String>,

    #[arg(long, env = "ORACLE_ADMIN_TOKEN")]
    pub oracle_admin_token: Option<String>,

    #[arg(long, env = "ORACLE_PROJECT")]
    pub oracle_project: Option<String>,

    #[arg(long, env = "ORACLE_ENVIRONMENT")]
    pub oracle_environment: Option<String>,

    /// Tag type marking a flag as workspace-configurable
    #[arg(long, env = "ORACLE_WORKSPACE_TAG_TYPE", default_value = "scope")]
    pub workspace_tag_type: String,

    /// Tag value marking a flag as workspace-configurable
    #[arg(long, env = "ORACLE_WORKSPACE_TAG_VALUE", default_value = "workspace")]
    pub workspace_tag_value: String,
}

#[derive(Parser, Debug, Clone)]
pub struct RateLimiterArgs {
    /// Sustained requests per second allowed per client IP
    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 10.0)]
    pub rate_limit_rps: f64,

    /// Burst capacity of each client IP bucket
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 50)]
    pub rate_limit_burst: u32,

    /// Seconds of inactivity after which a client bucket is evicted
    #[arg(long, env = "RATE_LIMIT_IDLE_EVICT_SECONDS", default_value_t = 300)]
    pub rate_limit_idle_evict_seconds: u64,
}

/// Upstream provider application config: OAuth client credentials,
/// the GitHub App identity used to mint installation tokens, the
/// HMAC secret for signed OAuth state, and LLM routing.
#[derive(Parser, Debug, Clone, Default)]
pub struct ProviderArgs {
    #[arg(long, env = "GITHUB_APP_ID")]
    pub github_app_id: Option<String>,

    /// PEM-encoded RSA private key of the GitHub App
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY", hide_env_values = true)]
    pub github_app_private_key: Option<String>,

    /// URL slug of the GitHub App, used to build installation links
    #[arg(long, env = "GITHUB_APP_SLUG")]
    pub github_app_slug: Option<String>,

    #[arg(long, env = "GITHUB_OAUTH_CLIENT_ID")]
    pub github_oauth_client_id: Option<String>,

    #[arg(long, env = "GITHUB_OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub github_oauth_client_secret: Option<String>,

    #[arg(long, env = "GOOGLE_OAUTH_CLIENT_ID")]
    pub google_oauth_client_id: Option<String>,

    #[arg(long, env = "GOOGLE_OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub google_oauth_client_secret: Option<String>,

    /// Secret used to HMAC-sign OAuth callback state
    #[arg(long, env = "OAUTH_STATE_SECRET", hide_env_values = true)]
    pub oauth_state_secret: Option<String>,

    /// Direct LLM endpoint; workers talk to this unless a gateway URL
    /// is configured
    #[arg(long, env = "LLM_BASE_URL", default_value = "https://api.anthropic.com")]
    pub llm_base_url: String,

    /// Cloud-hosted LLM gateway; takes precedence over the direct
    /// endpoint when set
    #[arg(long, env = "LLM_GATEWAY_URL")]
    pub llm_gateway_url: Option<String>,

    /// Tenant-level git token fallback used when a user has no
    /// credential of their own
    #[arg(long, env = "CORRAL_TENANT_GIT_TOKEN", hide_env_values = true)]
    pub tenant_git_token: Option<String>,

    /// Hard timeout for upstream identity and refresh calls
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECONDS", default_value_t = 10)]
    pub upstream_timeout_seconds: u64,
}
