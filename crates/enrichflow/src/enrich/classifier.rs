//! Pluggable transaction classifier.
//!
//! - `Classifier` trait: batch of text groups in, one result per key out
//! - `ClassifierClient` enum: Clone + compile-time dispatch over backends
//! - `OpenAICompatibleClassifier`: any `/chat/completions` server
//! - `MockClassifier`: keyword rules, no network
//!
//! Environment variables:
//! - `CLASSIFIER_BACKEND`: `openai_compatible` (default) or `mock`
//! - `CLASSIFIER_BASE_URL`: API root including the version segment
//!   (default: https://api.openai.com/v1)
//! - `CLASSIFIER_MODEL`: model name (default: gpt-4o-mini)
//! - `CLASSIFIER_API_KEY`: bearer token, optional for local servers
//! - `CLASSIFIER_TIMEOUT_SECS`: request timeout (default: 60)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::enrich::parsing::{extract_json, parse_classifications, UNCATEGORIZED};
use crate::enrich::transactions::SubscriptionPeriod;
use crate::error::{Error, Result};

/// One text group as sent to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationItem {
    pub key: String,
    pub text: String,
    pub type_hint: String,
    pub count: usize,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub key: String,
    pub merchant: Option<String>,
    /// Category path already joined with `" > "`.
    pub category: String,
    pub confidence: f64,
    pub is_subscription: bool,
    pub subscription_period: Option<SubscriptionPeriod>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a batch. The result must contain an entry for every item key;
    /// callers treat a missing key as a malformed response.
    async fn classify_batch(&self, items: &[ClassificationItem]) -> Result<Vec<Classification>>;

    /// Model name, for logs.
    fn model(&self) -> &str;
}

#[derive(Clone)]
pub enum ClassifierClient {
    OpenAICompatible(OpenAICompatibleClassifier),
    Mock(MockClassifier),
}

impl ClassifierClient {
    pub fn from_env() -> Result<Self> {
        let backend =
            std::env::var("CLASSIFIER_BACKEND").unwrap_or_else(|_| "openai_compatible".to_string());

        match backend.trim().to_lowercase().as_str() {
            "mock" => Ok(ClassifierClient::Mock(MockClassifier::new())),
            "openai_compatible" | "openai" | "local" => {
                OpenAICompatibleClassifier::from_env().map(ClassifierClient::OpenAICompatible)
            }
            other => {
                tracing::warn!(backend = %other, "unknown CLASSIFIER_BACKEND, using openai_compatible");
                OpenAICompatibleClassifier::from_env().map(ClassifierClient::OpenAICompatible)
            }
        }
    }

    pub fn mock() -> Self {
        ClassifierClient::Mock(MockClassifier::new())
    }
}

#[async_trait]
impl Classifier for ClassifierClient {
    async fn classify_batch(&self, items: &[ClassificationItem]) -> Result<Vec<Classification>> {
        match self {
            ClassifierClient::OpenAICompatible(c) => c.classify_batch(items).await,
            ClassifierClient::Mock(c) => c.classify_batch(items).await,
        }
    }

    fn model(&self) -> &str {
        match self {
            ClassifierClient::OpenAICompatible(c) => c.model(),
            ClassifierClient::Mock(c) => c.model(),
        }
    }
}

const SYSTEM_PROMPT: &str = "You categorize anonymized bank transactions. \
The user sends a JSON array of groups, each with: key, text, type_hint (debit|credit), \
count, amount_min, amount_max. Reply with a JSON array containing exactly one object per \
input key: {\"key\": string, \"merchant\": string|null, \"category_path\": string or array \
of strings (e.g. [\"Living\", \"Groceries\"]), \"confidence\": number 0..1, \
\"is_subscription\": boolean, \"subscription_period\": \"monthly\"|\"yearly\"|\"unknown\"|null}.";

const JSON_ONLY: &str = "Output ONLY valid JSON. No markdown, no comments.";

#[derive(Clone)]
pub struct OpenAICompatibleClassifier {
    http_client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAICompatibleClassifier {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("CLASSIFIER_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            std::env::var("CLASSIFIER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let api_key = std::env::var("CLASSIFIER_API_KEY").ok();
        let timeout_secs = std::env::var("CLASSIFIER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60)
            .max(1);

        Self::new(&base_url, &model, api_key, Duration::from_secs(timeout_secs))
    }

    async fn chat_completion(&self, user_content: String) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
                ChatMessage {
                    role: "system",
                    content: JSON_ONLY.to_string(),
                },
            ],
            temperature: 0.1,
        };

        let mut req_builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);

        if let Some(ref api_key) = self.api_key {
            req_builder = req_builder.bearer_auth(api_key);
        }

        let response = req_builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(400).collect();
            return Err(Error::Classifier(format!("HTTP {status}: {body}")));
        }

        let chat_response: ChatCompletionResponse = response.json().await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::MalformedResponse("no content in completion".into()))
    }
}

#[async_trait]
impl Classifier for OpenAICompatibleClassifier {
    async fn classify_batch(&self, items: &[ClassificationItem]) -> Result<Vec<Classification>> {
        let user_content = serde_json::to_string(items)?;
        tracing::debug!(model = %self.model, items = items.len(), "classifier request");

        let reply = self.chat_completion(user_content).await?;
        parse_classifications(extract_json(&reply)?)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Keyword classifier for development and tests.
#[derive(Clone, Default)]
pub struct MockClassifier;

impl MockClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_one(item: &ClassificationItem) -> Classification {
        let text = item.text.to_uppercase();
        let rule: Option<(&str, &str, Option<SubscriptionPeriod>)> = match text.as_str() {
            t if t.contains("NETFLIX") => Some((
                "NETFLIX",
                "Leisure > Streaming",
                Some(SubscriptionPeriod::Monthly),
            )),
            t if t.contains("SPOTIFY") => Some((
                "SPOTIFY",
                "Leisure > Streaming",
                Some(SubscriptionPeriod::Monthly),
            )),
            t if t.contains("MIETE") || t.contains("RENT") => Some((
                "RENT",
                "Housing > Rent",
                Some(SubscriptionPeriod::Monthly),
            )),
            t if t.contains("VERSICHERUNG") || t.contains("INSURANCE") => Some((
                "INSURANCE",
                "Insurance",
                Some(SubscriptionPeriod::Yearly),
            )),
            t if t.contains("REWE") => Some(("REWE", "Living > Groceries", None)),
            t if t.contains("EDEKA") => Some(("EDEKA", "Living > Groceries", None)),
            t if t.contains("ALDI") => Some(("ALDI", "Living > Groceries", None)),
            t if t.contains("AMAZON") => Some(("AMAZON", "Shopping", None)),
            t if t.contains("SHELL") || t.contains("ARAL") => {
                Some(("FUEL STATION", "Transport > Fuel", None))
            }
            _ => None,
        };

        match rule {
            Some((merchant, category, period)) => Classification {
                key: item.key.clone(),
                merchant: Some(merchant.to_string()),
                category: category.to_string(),
                confidence: 0.9,
                is_subscription: period.is_some(),
                subscription_period: period,
            },
            None => Classification {
                key: item.key.clone(),
                merchant: None,
                category: UNCATEGORIZED.to_string(),
                confidence: 0.1,
                is_subscription: false,
                subscription_period: None,
            },
        }
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify_batch(&self, items: &[ClassificationItem]) -> Result<Vec<Classification>> {
        Ok(items.iter().map(Self::classify_one).collect())
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    fn item(key: &str, text: &str) -> ClassificationItem {
        ClassificationItem {
            key: key.into(),
            text: text.into(),
            type_hint: "debit".into(),
            count: 1,
            amount_min: Some(-12.99),
            amount_max: Some(-12.99),
        }
    }

    async fn stub_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn client(base_url: &str) -> OpenAICompatibleClassifier {
        OpenAICompatibleClassifier::new(base_url, "test-model", Some("k".into()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn mock_recognizes_known_merchants() {
        let out = MockClassifier::new()
            .classify_batch(&[item("g0", "NETFLIX.COM 12345"), item("g1", "xyz shop")])
            .await
            .unwrap();
        assert_eq!(out[0].merchant.as_deref(), Some("NETFLIX"));
        assert!(out[0].is_subscription);
        assert_eq!(out[1].merchant, None);
        assert_eq!(out[1].category, UNCATEGORIZED);
    }

    #[tokio::test]
    async fn http_classifier_parses_fenced_reply() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                let content = "```json\n[{\"key\":\"g0\",\"merchant\":\"Netflix\",\"category_path\":[\"Leisure\",\"Streaming\"],\"confidence\":0.93,\"is_subscription\":true,\"subscription_period\":\"monthly\"}]\n```";
                Json(json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] }))
            }),
        );
        let base = stub_server(app).await;

        let out = client(&base)
            .classify_batch(&[item("g0", "NETFLIX")])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, "Leisure > Streaming");
        assert_eq!(out[0].subscription_period, Some(SubscriptionPeriod::Monthly));
    }

    #[tokio::test]
    async fn http_errors_are_classifier_errors() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let base = stub_server(app).await;

        let err = client(&base)
            .classify_batch(&[item("g0", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Classifier(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn empty_completion_is_malformed() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({ "choices": [] })) }),
        );
        let base = stub_server(app).await;

        let err = client(&base)
            .classify_batch(&[item("g0", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }
}
