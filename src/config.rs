use std::path::PathBuf;

/// Names of the providers that can be synthesized from the environment.
pub const BUILTIN_PROVIDER_NAMES: [&str; 4] = ["openai", "anthropic", "togetherai", "vllm"];

#[derive(Debug, Clone)]
pub struct BuiltinProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
}

impl BuiltinProviderConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() || self.api_key_file.is_some()
    }

    /// Returns the key to use right now. Key files are read on every call so
    /// a rotated key is picked up without a restart.
    pub fn current_api_key(&self) -> Result<String, String> {
        if let Some(path) = &self.api_key_file {
            let raw = std::fs::read_to_string(path)
                .map_err(|err| format!("failed to read key file {}: {err}", path.display()))?;
            let key = raw.trim().to_string();
            if key.is_empty() {
                return Err(format!("key file {} is empty", path.display()));
            }
            return Ok(key);
        }
        self.api_key
            .clone()
            .ok_or_else(|| format!("no api key configured for {}", self.name))
    }
}

#[derive(Debug, Clone)]
pub struct BuiltinProviders {
    pub default_provider: String,
    pub billing_enabled: bool,
    pub providers: Vec<BuiltinProviderConfig>,
}

impl BuiltinProviders {
    pub fn from_env() -> Self {
        let default_provider = env_nonempty("RELAYGATE_DEFAULT_PROVIDER")
            .unwrap_or_else(|| "openai".to_string());
        let billing_enabled = env_nonempty("RELAYGATE_BILLING_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let providers = BUILTIN_PROVIDER_NAMES
            .iter()
            .map(|name| {
                let upper = name.to_ascii_uppercase();
                BuiltinProviderConfig {
                    name: name.to_string(),
                    base_url: env_nonempty(&format!("RELAYGATE_{upper}_BASE_URL"))
                        .unwrap_or_else(|| default_base_url(name).to_string()),
                    api_key: env_nonempty(&format!("RELAYGATE_{upper}_API_KEY")),
                    api_key_file: env_nonempty(&format!("RELAYGATE_{upper}_API_KEY_FILE"))
                        .map(PathBuf::from),
                }
            })
            .collect();
        Self {
            default_provider,
            billing_enabled,
            providers,
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Built-ins that have a key, i.e. the ones a caller can actually reach.
    pub fn configured(&self) -> impl Iterator<Item = &BuiltinProviderConfig> {
        self.providers.iter().filter(|p| p.is_configured())
    }
}

impl Default for BuiltinProviders {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            billing_enabled: false,
            providers: Vec::new(),
        }
    }
}

fn default_base_url(name: &str) -> &'static str {
    match name {
        "openai" => "https://api.openai.com/v1",
        "anthropic" => "https://api.anthropic.com",
        "togetherai" => "https://api.together.xyz/v1",
        _ => "http://localhost:8000/v1",
    }
}

pub(crate) fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
