use std::collections::HashMap;

use crate::error::{GatewayError, Result};
use crate::prompt::PlaceholderKind;

/// Limits for one upstream chat model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Name sent upstream in the `model` field.
    pub legal_name: String,
    pub max_tokens: u32,
    chunk_budgets: HashMap<PlaceholderKind, usize>,
}

impl ModelConfig {
    pub fn new(legal_name: impl Into<String>, max_tokens: u32, chunk_budget: usize) -> Self {
        let chunk_budgets = [
            PlaceholderKind::InlineVariable,
            PlaceholderKind::RemoteUrl,
            PlaceholderKind::RemoteFile,
        ]
        .into_iter()
        .map(|kind| (kind, chunk_budget))
        .collect();
        Self {
            legal_name: legal_name.into(),
            max_tokens,
            chunk_budgets,
        }
    }

    #[cfg(test)]
    pub fn with_chunk_budget(mut self, kind: PlaceholderKind, budget: usize) -> Self {
        self.chunk_budgets.insert(kind, budget);
        self
    }

    /// Token budget for a single resolved placeholder of `kind`, before the
    /// template's own tokens are subtracted.
    pub fn chunk_budget(&self, kind: PlaceholderKind) -> usize {
        self.chunk_budgets.get(&kind).copied().unwrap_or_default()
    }
}

/// The set of chat models a request may select with `_chat_model`.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    default_model: String,
    models: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            models: HashMap::new(),
        }
    }

    /// Registry with the models the gateway ships with.
    pub fn builtin(default_model: impl Into<String>) -> Self {
        Self::new(default_model)
            .with_model("deepseek-v3", ModelConfig::new("deepseek-v3", 1500, 2000))
            .with_model("gpt-4", ModelConfig::new("gpt-4", 1500, 2000))
            .with_model(
                "gpt-3.5-turbo-16k",
                ModelConfig::new("gpt-3.5-turbo-16k", 6000, 6000),
            )
    }

    pub fn with_model(mut self, name: impl Into<String>, config: ModelConfig) -> Self {
        self.models.insert(name.into(), config);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn get(&self, name: &str) -> Result<&ModelConfig> {
        self.models
            .get(name)
            .ok_or_else(|| GatewayError::UnknownModel(name.to_string()))
    }

    /// Look up `requested`, falling back to the default model when it is
    /// empty. Returns the selected name alongside its config.
    pub fn select<'a>(&'a self, requested: Option<&'a str>) -> Result<(&'a str, &'a ModelConfig)> {
        let name = requested
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.default_model);
        Ok((name, self.get(name)?))
    }
}
