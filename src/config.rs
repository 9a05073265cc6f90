use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Be concise, accurate, and friendly in your responses";
pub const DEFAULT_MAX_FILES: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Completion provider id used when `--provider` is not given.
    pub provider: Option<String>,

    /// Transcription provider id used by `transcribe`.
    pub stt_provider: Option<String>,

    pub system_prompt: String,

    /// Whole-request timeout; unset means no timeout.
    pub request_timeout_secs: Option<u64>,

    /// Attachments accepted per message.
    pub max_files: usize,

    /// Values for free-form placeholders of completion providers.
    pub variables: BTreeMap<String, String>,

    /// Values for free-form placeholders of transcription providers.
    pub stt_variables: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: None,
            stt_provider: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout_secs: None,
            max_files: DEFAULT_MAX_FILES,
            variables: BTreeMap::new(),
            stt_variables: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// Fill `API_KEY` from `CHATWIRE_API_KEY` where the file left it unset.
    pub fn apply_env(&mut self) {
        if let Some(key) = std::env::var("CHATWIRE_API_KEY").ok().filter(|k| !k.is_empty()) {
            self.set_api_key(&key);
        }
    }

    fn set_api_key(&mut self, key: &str) {
        for vars in [&mut self.variables, &mut self.stt_variables] {
            vars.entry("API_KEY".to_string()).or_insert_with(|| key.to_string());
        }
    }

    /// Completion variables with `--var NAME=VALUE` overrides applied.
    pub fn variables_with(&self, overrides: &[(String, String)]) -> BTreeMap<String, String> {
        let mut vars = self.variables.clone();
        vars.extend(overrides.iter().cloned());
        vars
    }
}

/// Parse `NAME=VALUE` as given to `--var`.
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid variable name {name:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none_and_defaults_fill_gaps() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_optional(dir.path().join("config.toml")).unwrap().is_none());

        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "provider = \"openai\"\n\n[variables]\nMODEL = \"gpt-4o-mini\"\n",
        )
        .unwrap();
        let cfg = Config::load_optional(&path).unwrap().unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("openai"));
        assert_eq!(cfg.max_files, 6);
        assert_eq!(cfg.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(cfg.variables["MODEL"], "gpt-4o-mini");
    }

    #[test]
    fn api_key_from_env_does_not_override_file() {
        let mut cfg = Config::default();
        cfg.variables.insert("API_KEY".to_string(), "from-file".to_string());
        cfg.set_api_key("from-env");
        assert_eq!(cfg.variables["API_KEY"], "from-file");
        assert_eq!(cfg.stt_variables["API_KEY"], "from-env");
    }

    #[test]
    fn var_flags() {
        assert_eq!(parse_var("MODEL=a=b").unwrap(), ("MODEL".to_string(), "a=b".to_string()));
        assert!(parse_var("MODEL").is_err());
        assert!(parse_var("BAD NAME=x").is_err());

        let mut cfg = Config::default();
        cfg.variables.insert("MODEL".to_string(), "old".to_string());
        let vars = cfg.variables_with(&[("MODEL".to_string(), "new".to_string())]);
        assert_eq!(vars["MODEL"], "new");
    }
}
