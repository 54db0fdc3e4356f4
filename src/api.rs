//! Typed wrappers around the formulation backend.
//!
//! Every call is a single attempt: no retries, no backoff. A non-2xx status
//! becomes [`ApiError::RequestFailed`] and is left to the caller.

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Endpoints;
use crate::status::SseDecoder;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed with status {status}")]
    RequestFailed {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RequestFailed { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::InvalidUrl(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulationResponse {
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub query_analysis: Value,
    #[serde(default)]
    pub original_query: String,
    #[serde(default)]
    pub enhanced_query: String,
}

impl FormulationResponse {
    fn analysis_list(&self, key: &str) -> Vec<String> {
        self.query_analysis
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    pub fn missing_context(&self) -> Vec<String> {
        self.analysis_list("missing_context")
    }

    pub fn suggested_improvements(&self) -> Vec<String> {
        self.analysis_list("suggested_improvements")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryValidation {
    #[serde(default)]
    pub is_sufficient: bool,
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    #[serde(default)]
    pub conversation_history: Vec<ConversationMessage>,
    #[serde(default)]
    pub ready_for_formulation: bool,
    #[serde(default)]
    pub enhanced_query: Option<String>,
    #[serde(default)]
    pub exchange_count: Option<u32>,
    #[serde(default)]
    pub current_query: Option<String>,
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub is_sufficient: Option<bool>,
    #[serde(default)]
    pub next_question: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub questions_remaining: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationIntent {
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub achievement_goal: String,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub special_ingredients: String,
    #[serde(default)]
    pub full_intent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(default)]
    pub current_understanding: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[serde(default)]
    pub progress_percentage: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    initial_query: &'a str,
}

#[derive(Debug, Serialize)]
struct ContinueRequest<'a> {
    conversation_id: &'a str,
    user_response: &'a str,
    conversation_history: &'a [ConversationMessage],
}

#[derive(Debug, Serialize)]
struct HistoryRequest<'a> {
    conversation_history: &'a [ConversationMessage],
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    messages: &'a [ConversationMessage],
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl ApiClient {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        tracing::debug!("POST {}", url);
        let response = self.client.post(url).json(body).send().await?;
        let response = check_status(url, response).await?;
        Ok(response.json().await?)
    }

    pub async fn generate_formulation(&self, query: &str) -> Result<FormulationResponse, ApiError> {
        self.post_json(&self.endpoints.generate, &QueryRequest { query }).await
    }

    pub async fn validate_query(&self, query: &str) -> Result<QueryValidation, ApiError> {
        self.post_json(&self.endpoints.validate, &QueryRequest { query }).await
    }

    pub async fn query_suggestions(&self, query: &str) -> Result<Vec<String>, ApiError> {
        self.post_json(&self.endpoints.suggestions, &QueryRequest { query }).await
    }

    pub async fn start_conversation(&self, initial_query: &str) -> Result<ConversationResponse, ApiError> {
        self.post_json(&self.endpoints.conversation_start, &StartRequest { initial_query })
            .await
    }

    pub async fn continue_conversation(
        &self,
        conversation_id: &str,
        user_response: &str,
        conversation_history: &[ConversationMessage],
    ) -> Result<ConversationResponse, ApiError> {
        let request = ContinueRequest {
            conversation_id,
            user_response,
            conversation_history,
        };
        self.post_json(&self.endpoints.conversation_continue, &request).await
    }

    pub async fn aggregate_intent(
        &self,
        conversation_history: &[ConversationMessage],
    ) -> Result<ConversationIntent, ApiError> {
        self.post_json(&self.endpoints.aggregate_intent, &HistoryRequest { conversation_history })
            .await
    }

    pub async fn conversation_summary(
        &self,
        conversation_history: &[ConversationMessage],
    ) -> Result<ConversationSummary, ApiError> {
        self.post_json(&self.endpoints.conversation_summary, &HistoryRequest { conversation_history })
            .await
    }

    /// Streams an assistant reply. `on_chunk` receives the text accumulated
    /// so far after every `data:` frame; the full text is returned.
    pub async fn stream_conversation<F>(
        &self,
        messages: &[ConversationMessage],
        mut on_chunk: F,
    ) -> Result<String, ApiError>
    where
        F: FnMut(&str) + Send,
    {
        let url = &self.endpoints.conversation_stream;
        tracing::debug!("POST {} (streaming)", url);

        let response = self
            .client
            .post(url)
            .json(&StreamRequest { messages })
            .send()
            .await?;
        let response = check_status(url, response).await?;

        let mut decoder = SseDecoder::default();
        let mut text = String::new();
        let mut stream = response.bytes_stream();

        while let Some(item) = stream.next().await {
            let chunk = item?;
            for data in decoder.push(&chunk) {
                text.push_str(&data);
                on_chunk(&text);
            }
        }
        for data in decoder.finish() {
            text.push_str(&data);
            on_chunk(&text);
        }

        Ok(text)
    }

    /// Opens the formulation progress feed for `query`.
    pub async fn formulation_status(&self, query: &str) -> Result<reqwest::Response, ApiError> {
        let url = reqwest::Url::parse_with_params(&self.endpoints.formulation_stream, &[("query", query)])
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", self.endpoints.formulation_stream, e)))?;

        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        check_status(&self.endpoints.formulation_stream, response).await
    }
}

async fn check_status(endpoint: &str, response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    Err(ApiError::RequestFailed {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}
