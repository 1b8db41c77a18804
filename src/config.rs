use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Validate the full require graph of an action before executing it.
    /// Off by default; turning it on rejects actions whose dependent files
    /// fail the resolver's security check.
    #[serde(default)]
    pub strict_require_checks: bool,

    /// Secret used to sign delegation tokens.
    /// Supports ${ENV_VAR} substitution
    pub token_secret: String,

    /// Audience claim stamped into delegation tokens.
    #[serde(default = "default_token_audience")]
    pub token_audience: String,

    /// Environment variable names exposed to scripts through the
    /// restricted `process` view. Everything else is invisible.
    #[serde(default)]
    pub exposed_env: Vec<String>,
}

fn default_token_audience() -> String {
    "action-server".to_string()
}

impl RuntimeConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${ACTION_TOKEN_SECRET}
        let expanded = shellexpand::env(&content)?;
        let config: RuntimeConfig = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Programmatic constructor for embedding without a config file.
    pub fn new(token_secret: &str) -> Self {
        Self {
            strict_require_checks: false,
            token_secret: token_secret.to_string(),
            token_audience: default_token_audience(),
            exposed_env: Vec::new(),
        }
    }
}
