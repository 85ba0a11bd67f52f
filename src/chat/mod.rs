//! Chat jobs: resolve a request's prompts, stream every variant upstream and
//! report progress through a [`JobSink`].
//!
//! A job walks its chain links in order. Each link is resolved into one or
//! more variants which are streamed one after another, so deltas for
//! different variants never interleave. Cancellation is cooperative: the
//! token is checked between upstream reads, never mid-read.

pub mod retrieval;
pub mod upstream;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::notify::{Completion, Failure, JobReport};
use crate::prompt::{OptionValues, PromptResolver};
use crate::tokens::token_len;
use retrieval::{DbSource, PassageRetriever, SHARED_CLASS, grounded_conversation};
use upstream::{ChatMessage, CompletionClient};

/// Option name prefix under which a link receives the previous link's output.
pub const CHAIN_OUTPUT_PREFIX: &str = "_output";

/// A `create` request, as carried in a duplex message's `data` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub prompt: String,
    pub from: String,
    pub pid: String,
    pub project_name: String,
    pub user_uuid: String,
    pub notify_url: String,
    pub web_hook: String,
    pub parent_chat_uuid: String,
    pub chat_uuid: String,
    /// `prompt` is a JSON conversation whose last turn is the template.
    pub has_context: bool,
    pub tmpl_option_values: String,
    pub is3rd: bool,
    /// JSON list of `{prompt, tmpl_option_values}`. Takes precedence over
    /// `prompt` when present.
    pub prompt_chains: String,
}

impl ChatRequest {
    pub fn from_data(data: &HashMap<String, String>) -> Self {
        let field = |key: &str| data.get(key).cloned().unwrap_or_default();
        let flag = |key: &str| data.get(key).is_some_and(|v| v == "true");
        Self {
            prompt: field("prompt"),
            from: field("from"),
            pid: field("pid"),
            project_name: field("project_name"),
            user_uuid: field("user_uuid"),
            notify_url: field("notify_url"),
            web_hook: field("web_hook"),
            parent_chat_uuid: field("parent_chat_uuid"),
            chat_uuid: field("chat_uuid"),
            has_context: flag("has_context"),
            tmpl_option_values: field("tmpl_option_values"),
            is3rd: flag("is3rd"),
            prompt_chains: field("prompt_chains"),
        }
    }

    /// Knowledge-base class to ground on, for the sources that use one.
    fn retrieval_class(&self) -> Option<String> {
        match self.from.as_str() {
            "rubychat" => Some(SHARED_CLASS.to_string()),
            "achat" => Some(self.pid.clone()),
            _ => None,
        }
    }
}

/// Messages for `prompt`: a JSON conversation when `has_context`, otherwise
/// a single user turn. Never empty.
pub fn conversation(prompt: &str, has_context: bool) -> Result<Vec<ChatMessage>> {
    if !has_context {
        return Ok(vec![ChatMessage::user(prompt)]);
    }
    let messages: Vec<ChatMessage> = serde_json::from_str(prompt)
        .map_err(|e| GatewayError::Parse(format!("prompt conversation: {e}")))?;
    if messages.is_empty() {
        return Err(GatewayError::Parse("prompt conversation is empty".into()));
    }
    Ok(messages)
}

#[derive(Debug, Deserialize)]
struct ChainLink {
    #[serde(default)]
    prompt: String,
    #[serde(default, deserialize_with = "option_values_field")]
    tmpl_option_values: OptionValues,
}

/// Option values inside a chain arrive either as an array or as its JSON text.
fn option_values_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OptionValues, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(OptionValues::default()),
        serde_json::Value::String(raw) => OptionValues::parse(&raw).map_err(serde::de::Error::custom),
        other => serde_json::from_value(other).map_err(serde::de::Error::custom),
    }
}

fn chain_links(request: &ChatRequest) -> Result<Vec<ChainLink>> {
    if request.prompt_chains.trim().is_empty() {
        return Ok(vec![ChainLink {
            prompt: request.prompt.clone(),
            tmpl_option_values: OptionValues::parse(&request.tmpl_option_values)?,
        }]);
    }
    let links: Vec<ChainLink> = serde_json::from_str(&request.prompt_chains)
        .map_err(|e| GatewayError::Parse(format!("prompt_chains: {e}")))?;
    if links.is_empty() {
        return Err(GatewayError::Parse("prompt_chains is empty".into()));
    }
    Ok(links)
}

/// One incremental fragment, sent to the client as `{"cmd": "create", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delta {
    pub c: String,
    pub chunks: String,
    pub workflow: String,
    /// Set on the closing fragment of the job's final variant.
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_source: Option<DbSource>,
}

/// Receives a job's output.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn on_delta(&self, delta: Delta);
    /// A failure to show on the client connection.
    async fn on_error(&self, message: String);
    /// Awaited before the job continues; a sink may cancel the job here.
    async fn on_complete(&self, report: JobReport);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Preparing,
    Streaming,
    Finalizing,
    Done,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Stop,
    Cancel,
    Error,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Stop => "stop",
            TerminationReason::Cancel => "cancel",
            TerminationReason::Error => "error",
        }
    }
}

/// Progress of one job. Owned by the task running it.
#[derive(Debug)]
pub struct ChatJob {
    pub job_id: String,
    pub state: JobState,
    pub chain_position: usize,
    pub chain_length: usize,
    pub variant_index: usize,
    pub variant_count: usize,
    /// Text of the variant being streamed.
    pub accumulated_text: String,
    pub termination_reason: Option<TerminationReason>,
    request: ChatRequest,
    ori_prompt: String,
    db_source: Option<DbSource>,
}

impl ChatJob {
    fn new(request: ChatRequest) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            state: JobState::Preparing,
            chain_position: 1,
            chain_length: 1,
            variant_index: 1,
            variant_count: 1,
            accumulated_text: String::new(),
            termination_reason: None,
            request,
            ori_prompt: String::new(),
            db_source: None,
        }
    }

    fn transition(&mut self, next: JobState) {
        tracing::trace!(job_id = %self.job_id, from = ?self.state, to = ?next, "job state");
        self.state = next;
    }

    fn chunks(&self) -> String {
        format!("{}/{}", self.variant_index, self.variant_count)
    }

    fn workflow(&self) -> String {
        format!("{}/{}", self.chain_position, self.chain_length)
    }

    fn is_last_step(&self) -> bool {
        self.chain_position == self.chain_length && self.variant_index == self.variant_count
    }

    fn delta(&self, c: String, closing: bool) -> Delta {
        Delta {
            c,
            chunks: self.chunks(),
            workflow: self.workflow(),
            done: closing && self.is_last_step(),
            db_source: if closing && !self.request.is3rd {
                self.db_source.clone()
            } else {
                None
            },
        }
    }

    fn completion(
        &self,
        link_prompt: &str,
        messages: &[ChatMessage],
        prompt_tokens: usize,
        chat_model: &str,
        reason: TerminationReason,
    ) -> JobReport {
        let request = &self.request;
        JobReport::Ok(Completion {
            job_uuid: self.job_id.clone(),
            user_uuid: request.user_uuid.clone(),
            ori_prompt: self.ori_prompt.clone(),
            prompt: link_prompt.to_string(),
            from: request.from.clone(),
            parent_chat_uuid: request.parent_chat_uuid.clone(),
            chat_uuid: request.chat_uuid.clone(),
            content: self.accumulated_text.clone(),
            is_finished: reason == TerminationReason::Cancel || self.is_last_step(),
            reason: reason.as_str().to_string(),
            db_source: self.db_source.clone(),
            final_prompt: messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            prompt_tokens,
            content_tokens: token_len(&self.accumulated_text),
            web_hook: request.web_hook.clone(),
            is3rd: request.is3rd,
            chat_model: chat_model.to_string(),
            chunks: self.chunks(),
            prompt_chains: request.prompt_chains.clone(),
            workflow: self.workflow(),
        })
    }

    /// Failures after streaming began carry the position they happened at.
    fn failure(&self, error: &GatewayError) -> JobReport {
        let positioned = matches!(self.state, JobState::Streaming | JobState::Finalizing);
        JobReport::Error(Failure {
            error: error.to_string(),
            is3rd: self.request.is3rd,
            job_uuid: self.job_id.clone(),
            chat_uuid: self.request.chat_uuid.clone(),
            parent_chat_uuid: self.request.parent_chat_uuid.clone(),
            chunks: positioned.then(|| self.chunks()),
            prompt_chains: self.request.prompt_chains.clone(),
            workflow: positioned.then(|| self.workflow()),
        })
    }
}

/// Runs chat jobs against the upstream completion endpoint.
pub struct ChatOrchestrator {
    resolver: Arc<PromptResolver>,
    completions: Arc<dyn CompletionClient>,
    retriever: Option<Arc<dyn PassageRetriever>>,
}

impl ChatOrchestrator {
    pub fn new(resolver: Arc<PromptResolver>, completions: Arc<dyn CompletionClient>) -> Self {
        Self {
            resolver,
            completions,
            retriever: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn PassageRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Run a job to completion. Every outcome ends with exactly one report
    /// flagged `is_finished`, or one error report.
    #[tracing::instrument(skip_all, fields(job_id, from = %request.from, chat_uuid = %request.chat_uuid))]
    pub async fn run(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
        sink: Arc<dyn JobSink>,
    ) -> ChatJob {
        let mut job = ChatJob::new(request);
        tracing::Span::current().record("job_id", job.job_id.as_str());
        tracing::info!(
            user_uuid = %job.request.user_uuid,
            notify_url = %job.request.notify_url,
            "chat job started"
        );

        match self.drive(&mut job, &cancel, sink.as_ref()).await {
            Ok(()) => {
                job.termination_reason = Some(TerminationReason::Stop);
                job.transition(JobState::Done);
                tracing::info!("chat job done");
            }
            Err(e) if e.is_cancel() => {
                job.termination_reason = Some(TerminationReason::Cancel);
                job.transition(JobState::Canceled);
                tracing::info!(workflow = %job.workflow(), chunks = %job.chunks(), "chat job canceled");
            }
            Err(e) => {
                tracing::warn!(error = %e, state = ?job.state, "chat job failed");
                sink.on_error(e.to_string()).await;
                sink.on_complete(job.failure(&e)).await;
                job.termination_reason = Some(TerminationReason::Error);
                job.transition(JobState::Failed);
            }
        }
        job
    }

    async fn drive(
        &self,
        job: &mut ChatJob,
        cancel: &CancellationToken,
        sink: &dyn JobSink,
    ) -> Result<()> {
        if let Some(class) = job.request.retrieval_class() {
            self.ground(job, &class).await?;
        }

        let links = chain_links(&job.request)?;
        job.chain_length = links.len();
        let mut previous = String::new();
        for (i, link) in links.into_iter().enumerate() {
            job.chain_position = i + 1;
            let mut options = link.tmpl_option_values;
            if i > 0 {
                options.push(
                    format!("{CHAIN_OUTPUT_PREFIX}{i}"),
                    std::mem::take(&mut previous),
                );
            }
            previous = self
                .run_link(job, &link.prompt, &options, cancel, sink)
                .await?;
        }
        Ok(())
    }

    /// Replace the request prompt with a conversation grounded on passages
    /// retrieved for the user's question.
    async fn ground(&self, job: &mut ChatJob, class: &str) -> Result<()> {
        let retriever = self
            .retriever
            .as_ref()
            .ok_or_else(|| GatewayError::Provider("retrieval is not configured".into()))?;

        let mut history = conversation(&job.request.prompt, job.request.has_context)?;
        let question = history.pop().map(|m| m.content).unwrap_or_default();
        let passages = retriever.retrieve(class, &question).await?;
        tracing::info!(class, passages = passages.len(), "grounding question");

        let messages =
            grounded_conversation(&job.request.project_name, history, &passages, &question);
        job.request.prompt = serde_json::to_string(&messages)?;
        job.request.has_context = true;
        job.ori_prompt = question;
        job.db_source = Some(DbSource {
            cls_name: class.to_string(),
            chunks: passages,
        });
        Ok(())
    }

    /// Resolve and stream one chain link. Returns the text of all its variants.
    async fn run_link(
        &self,
        job: &mut ChatJob,
        prompt: &str,
        options: &OptionValues,
        cancel: &CancellationToken,
        sink: &dyn JobSink,
    ) -> Result<String> {
        job.transition(JobState::Preparing);
        job.variant_index = 1;
        job.variant_count = 1;

        let base = conversation(prompt, job.request.has_context)?;
        let template = base.last().map(|m| m.content.clone()).unwrap_or_default();
        if job.ori_prompt.is_empty() {
            job.ori_prompt = template.clone();
        }

        let resolved = self.resolver.resolve(&template, options).await?;
        job.variant_count = resolved.variants.len();

        let mut output = String::new();
        for (idx, variant) in resolved.variants.into_iter().enumerate() {
            job.variant_index = idx + 1;
            let mut messages = base.clone();
            if let Some(last) = messages.last_mut() {
                last.content = variant;
            }
            let prompt_tokens = token_len(&serde_json::to_string(&messages)?);
            tracing::info!(
                workflow = %job.workflow(),
                chunks = %job.chunks(),
                tokens = prompt_tokens,
                chat_model = %resolved.model_name,
                "handling prompt"
            );
            tracing::trace!(messages = ?messages, "prompt");

            job.transition(JobState::Streaming);
            job.accumulated_text.clear();
            let reason = self
                .stream_variant(job, &resolved.model.legal_name, resolved.model.max_tokens, &messages, cancel, sink)
                .await?;

            job.transition(JobState::Finalizing);
            output.push_str(&job.accumulated_text);
            sink.on_complete(job.completion(prompt, &messages, prompt_tokens, &resolved.model_name, reason))
                .await;
            if reason == TerminationReason::Cancel {
                return Err(GatewayError::Canceled);
            }
        }
        Ok(output)
    }

    /// Stream one variant, forwarding fragments as deltas. Returns how the
    /// stream ended; transport failures after cancellation count as cancel.
    async fn stream_variant(
        &self,
        job: &mut ChatJob,
        model: &str,
        max_tokens: u32,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
        sink: &dyn JobSink,
    ) -> Result<TerminationReason> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TerminationReason::Cancel),
            opened = self.completions.stream_chat(model, max_tokens, messages) => opened?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TerminationReason::Cancel),
                next = stream.next() => next,
            };
            let mut event = match next {
                Some(Ok(event)) => event,
                Some(Err(_)) if cancel.is_cancelled() => return Ok(TerminationReason::Cancel),
                Some(Err(e)) => return Err(e),
                None => return Err(GatewayError::Transport("upstream stream closed".into())),
            };

            if event.stop && event.fragments.is_empty() {
                event.fragments.push(String::new());
            }
            let count = event.fragments.len();
            for (i, fragment) in event.fragments.into_iter().enumerate() {
                job.accumulated_text.push_str(&fragment);
                sink.on_delta(job.delta(fragment, event.stop && i + 1 == count))
                    .await;
            }
            if event.stop {
                return Ok(TerminationReason::Stop);
            }
        }
    }
}
