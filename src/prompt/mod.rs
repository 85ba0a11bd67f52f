//! Prompt templates: placeholder discovery, option values and resolution
//! into send-ready prompt variants.
//!
//! Two placeholder forms are recognized:
//!
//! - `RMO_VAR{name}` substitutes the option value called `name`.
//! - `RMO_EXT{KIND:key}` where `KIND` is `VAR`, `URL` or `FILE`. The option
//!   value called `key` is the literal text, the page to crawl, or the file to
//!   download and extract.
//!
//! An extension whose body is not exactly `KIND:key` is left in the prompt
//! verbatim.

pub mod providers;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::chunker;
use crate::config::ResolveFailurePolicy;
use crate::error::{GatewayError, Result};
use crate::models::{ModelConfig, ModelRegistry};
use crate::tokens::token_len;

use providers::ContentProvider;

/// Option selecting the chat model for a request.
pub const CHAT_MODEL_OPTION: &str = "_chat_model";
/// Option enabling auto-split when set to `"true"`.
pub const AUTO_SPLIT_OPTION: &str = "_auto_split";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RMO_(VAR|EXT)\{([^{}]*)\}").expect("placeholder pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderKind {
    InlineVariable,
    RemoteUrl,
    RemoteFile,
}

impl PlaceholderKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "VAR" => Some(PlaceholderKind::InlineVariable),
            "URL" => Some(PlaceholderKind::RemoteUrl),
            "FILE" => Some(PlaceholderKind::RemoteFile),
            _ => None,
        }
    }
}

/// One placeholder occurrence. `id` is the opaque token standing in for it in
/// the scanned template text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRef {
    pub id: String,
    pub kind: PlaceholderKind,
    pub key: String,
}

/// A template with every placeholder occurrence swapped for its opaque token.
#[derive(Debug, Clone)]
pub struct ScannedTemplate {
    pub text: String,
    pub placeholders: Vec<PlaceholderRef>,
}

impl ScannedTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut text = String::with_capacity(template.len());
        let mut placeholders = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            let body = &caps[2];
            let target = if &caps[1] == "VAR" {
                Some((PlaceholderKind::InlineVariable, body))
            } else {
                match body.split_once(':') {
                    Some((tag, key)) if !key.contains(':') => {
                        let kind = PlaceholderKind::from_tag(tag).ok_or_else(|| {
                            GatewayError::Parse(format!("unknown variable type: {tag}"))
                        })?;
                        Some((kind, key))
                    }
                    _ => None,
                }
            };

            text.push_str(&template[last..whole.start()]);
            match target {
                Some((kind, key)) => {
                    let id = uuid::Uuid::new_v4().simple().to_string();
                    text.push_str(&id);
                    placeholders.push(PlaceholderRef {
                        id,
                        kind,
                        key: key.to_string(),
                    });
                }
                None => text.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        text.push_str(&template[last..]);

        Ok(Self { text, placeholders })
    }

    /// Replace every opaque token with its value; `split` overrides one.
    fn substitute(&self, values: &HashMap<String, String>, split: Option<(&str, &str)>) -> String {
        let mut out = self.text.clone();
        for ph in &self.placeholders {
            let value = match split {
                Some((id, chunk)) if id == ph.id => chunk,
                _ => values.get(&ph.id).map(String::as_str).unwrap_or_default(),
            };
            out = out.replace(&ph.id, value);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "stringify")]
    pub value: String,
}

fn stringify<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Named values a template is resolved against, in the JSON array form
/// `[{"name": "...", "value": ...}]` clients send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionValues(Vec<OptionValue>);

impl OptionValues {
    /// Parse the client's JSON. Blank input is an empty set.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::Parse(format!("tmpl_option_values: {e}")))
    }

    /// First value registered under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(OptionValue {
            name: name.into(),
            value: value.into(),
        });
    }

    fn auto_split(&self) -> bool {
        self.get(AUTO_SPLIT_OPTION) == Some("true")
    }
}

impl FromIterator<(String, String)> for OptionValues {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| OptionValue { name, value })
                .collect(),
        )
    }
}

/// Result of resolving a template.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Send-ready prompts, in order. Never empty.
    pub variants: Vec<String>,
    /// Model name as selected by the request.
    pub model_name: String,
    pub model: ModelConfig,
}

/// Turns templates plus option values into prompt variants.
pub struct PromptResolver {
    models: Arc<ModelRegistry>,
    url_provider: Arc<dyn ContentProvider>,
    file_provider: Arc<dyn ContentProvider>,
    failure_policy: ResolveFailurePolicy,
}

impl PromptResolver {
    pub fn new(
        models: Arc<ModelRegistry>,
        url_provider: Arc<dyn ContentProvider>,
        file_provider: Arc<dyn ContentProvider>,
        failure_policy: ResolveFailurePolicy,
    ) -> Self {
        Self {
            models,
            url_provider,
            file_provider,
            failure_policy,
        }
    }

    #[tracing::instrument(skip_all, fields(placeholders))]
    pub async fn resolve(&self, template: &str, options: &OptionValues) -> Result<Resolved> {
        let (model_name, model) = self.models.select(options.get(CHAT_MODEL_OPTION))?;
        let scanned = ScannedTemplate::parse(template)?;
        tracing::Span::current().record("placeholders", scanned.placeholders.len());

        let values = self.resolve_values(&scanned, options).await?;

        let mut variants = Vec::new();
        if options.auto_split() {
            // budget is measured against the template as written
            let template_tokens = token_len(template) as i64;
            for ph in &scanned.placeholders {
                let value = values.get(&ph.id).map(String::as_str).unwrap_or_default();
                if value.is_empty() {
                    continue;
                }
                let budget = model.chunk_budget(ph.kind) as i64 - template_tokens;
                if token_len(value) as i64 <= budget {
                    continue;
                }
                if budget <= 0 {
                    return Err(GatewayError::ResourceLimit(format!(
                        "template uses {template_tokens} tokens, no room left for {}",
                        ph.key
                    )));
                }
                for chunk in chunker::split(value, budget as usize) {
                    variants.push(scanned.substitute(&values, Some((&ph.id, &chunk.text))));
                }
                tracing::info!(key = %ph.key, budget, variants = variants.len(), "placeholder split");
                break;
            }
        }
        if variants.is_empty() {
            variants.push(scanned.substitute(&values, None));
        }

        tracing::info!(
            variants = variants.len(),
            auto_split = options.auto_split(),
            model = model_name,
            "prompt resolved"
        );
        Ok(Resolved {
            variants,
            model_name: model_name.to_string(),
            model: model.clone(),
        })
    }

    /// Inline values are taken as-is; remote ones are fetched concurrently and
    /// joined before returning.
    async fn resolve_values(
        &self,
        scanned: &ScannedTemplate,
        options: &OptionValues,
    ) -> Result<HashMap<String, String>> {
        let mut values = HashMap::new();
        let mut fetches = Vec::new();

        for ph in &scanned.placeholders {
            let source = options.get(&ph.key).unwrap_or_default();
            if source.is_empty() {
                continue;
            }
            let provider = match ph.kind {
                PlaceholderKind::InlineVariable => {
                    values.insert(ph.id.clone(), source.to_string());
                    continue;
                }
                PlaceholderKind::RemoteUrl => self.url_provider.clone(),
                PlaceholderKind::RemoteFile => self.file_provider.clone(),
            };
            fetches.push(async move { (ph, source, provider.fetch(source).await) });
        }

        for (ph, source, result) in join_all(fetches).await {
            match result {
                Ok(text) => {
                    values.insert(ph.id.clone(), text);
                }
                Err(e) => match self.failure_policy {
                    ResolveFailurePolicy::Degrade => {
                        tracing::warn!(error = %e, key = %ph.key, source, "placeholder resolved to empty");
                    }
                    ResolveFailurePolicy::Abort => {
                        tracing::warn!(error = %e, key = %ph.key, source, "placeholder failed");
                        return Err(e);
                    }
                },
            }
        }
        Ok(values)
    }
}
