use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 { 120 }

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// REST API root, for GitHub Enterprise Server. Defaults to
    /// `https://api.github.com`.
    pub api_url: Option<String>,
    /// When unset, webhook signatures are not verified and no installation
    /// clients are created.
    pub app: Option<GitHubAppConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub webhook_secret: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluatorConfig {
    pub url: String,
    #[serde(default = "default_evaluator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_evaluator_timeout_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Upper bound on evaluations in flight for a single delivery.
    /// `1` evaluates pull requests one after another.
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_concurrent_evaluations: default_max_concurrent_evaluations() }
    }
}

fn default_max_concurrent_evaluations() -> usize { 1 }
