//! Delivery of finished-job reports to webhook targets.

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::chat::retrieval::DbSource;
use crate::config::NotifyConfig;

pub const AUTH_HEADER: &str = "X_KEY";

fn as_flag<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "true" } else { "false" })
}

/// A finished variant (or a cancelled job).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Completion {
    pub job_uuid: String,
    pub user_uuid: String,
    pub ori_prompt: String,
    pub prompt: String,
    pub from: String,
    pub parent_chat_uuid: String,
    pub chat_uuid: String,
    pub content: String,
    /// True only on the last callback of the whole job.
    pub is_finished: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_source: Option<DbSource>,
    pub final_prompt: String,
    pub prompt_tokens: usize,
    pub content_tokens: usize,
    pub web_hook: String,
    #[serde(serialize_with = "as_flag")]
    pub is3rd: bool,
    pub chat_model: String,
    pub chunks: String,
    pub prompt_chains: String,
    pub workflow: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Failure {
    pub error: String,
    #[serde(serialize_with = "as_flag")]
    pub is3rd: bool,
    pub job_uuid: String,
    pub chat_uuid: String,
    pub parent_chat_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<String>,
    pub prompt_chains: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

/// Envelope sent to the internal callback: `{"status": "ok"|"error", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum JobReport {
    Ok(Completion),
    Error(Failure),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThirdPartyCompletion {
    pub parent_thread_uuid: String,
    pub thread_uuid: String,
    pub content: String,
    pub is_finished: bool,
    pub reason: String,
    pub chat_model: String,
    pub chunks: String,
    pub workflow: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThirdPartyFailure {
    pub error: String,
    pub thread_uuid: String,
    pub parent_thread_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<String>,
    pub prompt_chains: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

/// The narrower report a third-party webhook receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ThirdPartyReport {
    Ok(ThirdPartyCompletion),
    Error(ThirdPartyFailure),
}

impl JobReport {
    pub fn third_party(&self) -> ThirdPartyReport {
        match self {
            JobReport::Ok(c) => ThirdPartyReport::Ok(ThirdPartyCompletion {
                parent_thread_uuid: c.parent_chat_uuid.clone(),
                thread_uuid: c.chat_uuid.clone(),
                content: c.content.clone(),
                is_finished: c.is_finished,
                reason: c.reason.clone(),
                chat_model: c.chat_model.clone(),
                chunks: c.chunks.clone(),
                workflow: c.workflow.clone(),
            }),
            JobReport::Error(f) => ThirdPartyReport::Error(ThirdPartyFailure {
                error: f.error.clone(),
                thread_uuid: f.chat_uuid.clone(),
                parent_thread_uuid: f.parent_chat_uuid.clone(),
                chunks: f.chunks.clone(),
                prompt_chains: f.prompt_chains.clone(),
                workflow: f.workflow.clone(),
            }),
        }
    }
}

/// Where a job's reports go. Fixed when the job starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyTarget {
    pub callback_url: String,
    pub web_hook: Option<String>,
}

/// True when a callback response says the user has run out of credit.
pub fn out_of_credit(response: &serde_json::Value) -> bool {
    response
        .get("user_points")
        .and_then(serde_json::Value::as_f64)
        .is_some_and(|points| points <= 0.0)
}

pub struct NotifyDispatcher {
    client: reqwest::Client,
    retry_interval: Duration,
    deadline: Duration,
    attempt_timeout: Duration,
    auth_secret: String,
}

impl NotifyDispatcher {
    pub fn new(client: reqwest::Client, config: &NotifyConfig) -> Self {
        Self {
            client,
            retry_interval: config.retry_interval,
            deadline: config.deadline,
            attempt_timeout: config.attempt_timeout,
            auth_secret: config.auth_header_secret.clone(),
        }
    }

    /// POST `payload` to `url` until it answers 200 or the deadline passes.
    /// Returns the 200 response body (JSON, or `Null` when it is not JSON);
    /// `None` for an empty url or when every attempt failed.
    #[tracing::instrument(skip(self, payload))]
    pub async fn notify<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
    ) -> Option<serde_json::Value> {
        if url.is_empty() {
            return None;
        }
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "notify payload not serializable");
                return None;
            }
        };

        match tokio::time::timeout(self.deadline, self.deliver_until_ok(url, body)).await {
            Ok(response) => Some(response),
            Err(_) => {
                tracing::error!(
                    deadline_secs = self.deadline.as_secs(),
                    "critical, notify deadline exceeded"
                );
                None
            }
        }
    }

    async fn deliver_until_ok(&self, url: &str, body: Vec<u8>) -> serde_json::Value {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(url, body.clone()).await {
                Ok(response) => {
                    tracing::debug!(attempt, "notify delivered");
                    return response;
                }
                Err(reason) => {
                    tracing::warn!(attempt, reason = %reason, "notify attempt failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    async fn attempt(&self, url: &str, body: Vec<u8>) -> Result<serde_json::Value, String> {
        let resp = self
            .client
            .post(url)
            .header(AUTH_HEADER, &self.auth_secret)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| e.to_string())?;
        if status != reqwest::StatusCode::OK {
            return Err(format!("status {status}: {text}"));
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::Null))
    }

    /// Single best-effort delivery of the narrowed report.
    pub async fn notify_third_party(&self, web_hook: &str, report: &JobReport) {
        if web_hook.is_empty() {
            return;
        }
        let payload = report.third_party();
        let result = self
            .client
            .post(web_hook)
            .json(&payload)
            .timeout(self.attempt_timeout)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(web_hook, "third-party webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(web_hook, status = %resp.status(), "third-party webhook rejected report");
            }
            Err(e) => {
                tracing::warn!(web_hook, error = %e, "third-party webhook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(retry_ms: u64, deadline_ms: u64) -> NotifyDispatcher {
        NotifyDispatcher::new(
            reqwest::Client::new(),
            &NotifyConfig {
                retry_interval: Duration::from_millis(retry_ms),
                deadline: Duration::from_millis(deadline_ms),
                attempt_timeout: Duration::from_secs(1),
                auth_header_secret: "s3cret".into(),
            },
        )
    }

    fn completion() -> Completion {
        Completion {
            job_uuid: "job-1".into(),
            chat_uuid: "chat-1".into(),
            parent_chat_uuid: "parent-1".into(),
            content: "Gravity pulls.".into(),
            is_finished: true,
            reason: "stop".into(),
            chat_model: "deepseek-v3".into(),
            chunks: "1/1".into(),
            workflow: "1/1".into(),
            is3rd: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_report_envelope_shape() {
        let value = serde_json::to_value(JobReport::Ok(completion())).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["chunks"], "1/1");
        assert_eq!(value["data"]["is3rd"], "true");
        assert_eq!(value["data"]["is_finished"], true);
        assert!(value["data"].get("db_source").is_none());

        let failure = JobReport::Error(Failure {
            error: "chat_model gpt-9 is invalid".into(),
            ..Default::default()
        });
        let value = serde_json::to_value(failure).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["data"]["error"], "chat_model gpt-9 is invalid");
        assert!(value["data"].get("workflow").is_none());
    }

    #[test]
    fn test_third_party_renames_thread_fields() {
        let value = serde_json::to_value(JobReport::Ok(completion()).third_party()).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["thread_uuid"], "chat-1");
        assert_eq!(value["data"]["parent_thread_uuid"], "parent-1");
        assert!(value["data"].get("chat_uuid").is_none());
        assert!(value["data"].get("prompt").is_none());
    }

    #[test]
    fn test_out_of_credit() {
        assert!(out_of_credit(&json!({"user_points": 0})));
        assert!(out_of_credit(&json!({"user_points": -3.5})));
        assert!(!out_of_credit(&json!({"user_points": 12})));
        assert!(!out_of_credit(&json!({"status": "ok"})));
        assert!(!out_of_credit(&serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_empty_url_is_noop() {
        assert!(dispatcher(10, 100).notify("", &json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/callback"))
            .and(header("x_key", "s3cret"))
            .and(body_partial_json(json!({"status": "ok"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_points": 7})))
            .mount(&server)
            .await;

        let started = Instant::now();
        let response = dispatcher(150, 5_000)
            .notify(
                &format!("{}/callback", server.uri()),
                &JobReport::Ok(completion()),
            )
            .await
            .unwrap();

        assert_eq!(response["user_points"], 7);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_gives_up_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let started = Instant::now();
        let response = dispatcher(100, 600)
            .notify(&server.uri(), &json!({"status": "ok"}))
            .await;

        let elapsed = started.elapsed();
        assert!(response.is_none());
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_secs(3));
        let attempts = server.received_requests().await.unwrap().len();
        assert!((2..=8).contains(&attempts), "attempts: {attempts}");
    }

    #[tokio::test]
    async fn test_non_json_success_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let response = dispatcher(10, 1_000)
            .notify(&server.uri(), &json!({}))
            .await;
        assert_eq!(response, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_third_party_is_single_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"data": {"thread_uuid": "chat-1"}})))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        dispatcher(10, 1_000)
            .notify_third_party(&server.uri(), &JobReport::Ok(completion()))
            .await;
    }
}
