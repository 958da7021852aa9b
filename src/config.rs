use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "ScriptConfig::default_timeout_millis")]
    pub timeout_millis: u64,
    #[serde(default)]
    pub throw_on_error: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { timeout_millis: Self::default_timeout_millis(), throw_on_error: false }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptConfigOverrides {
    pub timeout_millis: Option<u64>,
    pub throw_on_error: Option<bool>,
}

impl ScriptConfig {
    const fn default_timeout_millis() -> u64 {
        0
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ScriptConfigOverrides) {
        if let Some(timeout_millis) = overrides.timeout_millis {
            self.timeout_millis = timeout_millis;
        }
        if let Some(throw_on_error) = overrides.throw_on_error {
            self.throw_on_error = throw_on_error;
        }
    }
}

impl ScriptConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.timeout_millis.is_none() && self.throw_on_error.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.timeout_millis.is_some() {
            fields.push("timeout_millis");
        }
        if self.throw_on_error.is_some() {
            fields.push("throw_on_error");
        }
        fields
    }
}
