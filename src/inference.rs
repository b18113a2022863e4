use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;

use crate::error::{InferenceResult, PipelineError};
use crate::prompt::{MessageContent, PromptMessage};

const EXCERPT_LIMIT: usize = 500;

/// Bearer secret for the inference endpoint. Never printed.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn expose(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Credential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Credential(***)")
  }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
  pub model: String,
  pub endpoint: String,
  pub messages: Vec<PromptMessage>,
  pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
  pub text: String,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
  /// Single attempt; every failure comes back inside the result.
  async fn infer(&self, request: &InferenceRequest) -> InferenceResult;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
  model: &'a str,
  messages: Vec<WireMessage>,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
  role: &'static str,
  content: WireContent,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
enum WireContent {
  Text(String),
  Parts(Vec<ContentPart>),
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
  ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug, PartialEq)]
struct ImageUrl {
  url: String,
}

fn to_wire_messages(messages: &[PromptMessage]) -> Vec<WireMessage> {
  messages
    .iter()
    .map(|msg| WireMessage {
      role: msg.role.as_str(),
      content: match &msg.content {
        MessageContent::Text(text) => WireContent::Text(text.clone()),
        MessageContent::Image(image) => WireContent::Parts(vec![ContentPart::ImageUrl {
          image_url: ImageUrl { url: image.to_url() },
        }]),
      },
    })
    .collect()
}

fn excerpt(body: &str) -> String {
  let trimmed = body.trim();
  match trimmed.char_indices().nth(EXCERPT_LIMIT) {
    Some((idx, _)) => format!("{}...", &trimmed[..idx]),
    None => trimmed.to_string(),
  }
}

fn extract_text(body: &str) -> InferenceResult {
  let json_body: serde_json::Value = serde_json::from_str(body)
    .map_err(|err| PipelineError::MalformedResponse(format!("body is not JSON: {err}")))?;
  let content = json_body["choices"][0]["message"]["content"]
    .as_str()
    .ok_or_else(|| PipelineError::MalformedResponse("missing choices[0].message.content".to_string()))?;
  Ok(Answer {
    text: content.to_string(),
  })
}

/// OpenAI-compatible chat-completion client over reqwest.
pub struct HttpInferenceClient {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpInferenceClient {
  pub fn new(timeout: Duration) -> anyhow::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, timeout })
  }

  fn transport_error(&self, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
      PipelineError::Timeout(self.timeout)
    } else {
      PipelineError::Transport(err.without_url().to_string())
    }
  }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
  async fn infer(&self, request: &InferenceRequest) -> InferenceResult {
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", request.credential.expose()))
      .map_err(|_| PipelineError::MissingCredential)?;
    auth.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);

    let payload = ChatCompletionRequest {
      model: &request.model,
      messages: to_wire_messages(&request.messages),
    };

    let resp = self
      .client
      .post(&request.endpoint)
      .headers(headers)
      .json(&payload)
      .send()
      .await
      .map_err(|err| self.transport_error(err))?;

    let status = resp.status();
    let text = resp.text().await.map_err(|err| self.transport_error(err))?;

    if !status.is_success() {
      return Err(PipelineError::Remote {
        status: status.as_u16(),
        excerpt: excerpt(&text),
      });
    }

    extract_text(&text)
  }
}
