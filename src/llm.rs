// src/llm.rs
// Text generator interface and the OpenAI-compatible HTTP client

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::GeneratorConfig;
use crate::error::{HivemindError, Result};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to conversation \
history and a knowledge base. Use the provided context to give accurate, contextual responses. \
If the context is relevant, reference it naturally. If you're not sure about something, say so.";

/// Message role in a chat exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting for one generation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// External text generator.
///
/// With `stream` set, implementations still return the concatenated full
/// text and best-effort usage.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        stream: bool,
    ) -> Result<(String, TokenUsage)>;

    fn model_name(&self) -> String;
}

/// Assemble the messages array for a chat turn: system prompt, optional
/// retrieved-context system message, then the user message.
pub fn build_chat_messages(
    user_message: &str,
    context_block: Option<&str>,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(
        system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT),
    )];

    if let Some(context) = context_block
        && !context.is_empty()
    {
        messages.push(ChatMessage::system(format!(
            "Here is relevant context:\n\n{context}"
        )));
    }

    messages.push(ChatMessage::user(user_message));
    messages
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<UsageBody> for TokenUsage {
    fn from(u: UsageBody) -> Self {
        TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

/// OpenAI-compatible `/chat/completions` client
pub struct HttpGenerator {
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpGenerator {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            config.api_key(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url,
            model,
            api_key,
            timeout,
            http_client,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, body: &impl Serialize) -> reqwest::RequestBuilder {
        let mut req = self.http_client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    async fn generate_standard(&self, request: &ChatRequest<'_>) -> Result<(String, TokenUsage)> {
        let response = self
            .request(request)
            .send()
            .await
            .map_err(|e| HivemindError::External(format!("generator request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HivemindError::External(format!(
                "generator API error {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| HivemindError::External(format!("generator response malformed: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| HivemindError::External("generator returned no choices".into()))?;
        let usage = parsed.usage.unwrap_or_default().into();

        debug!(model = %self.model, "generator response received");
        Ok((content, usage))
    }

    /// Consume an SSE stream and return the concatenated deltas. Usage is
    /// taken from the final chunk when the provider sends one.
    async fn generate_streaming(&self, request: &ChatRequest<'_>) -> Result<(String, TokenUsage)> {
        let response = self
            .request(request)
            .send()
            .await
            .map_err(|e| HivemindError::External(format!("generator request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HivemindError::External(format!(
                "generator API error {status}: {body}"
            )));
        }

        let mut content = String::new();
        let mut usage = TokenUsage::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| HivemindError::External(format!("generator stream failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok((content, usage));
                }

                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                    content.push_str(delta);
                }
                if let Some(u) = value.get("usage")
                    && !u.is_null()
                {
                    usage = TokenUsage {
                        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
                        total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
                    };
                }
            }
        }

        Ok((content, usage))
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        stream: bool,
    ) -> Result<(String, TokenUsage)> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens,
            stream,
        };

        debug!(
            model = %self.model,
            message_count = messages.len(),
            stream,
            "generator call"
        );

        // The client carries its own timeout, but streams can stall between
        // chunks; this outer bound guarantees the call never hangs.
        let work = async {
            if stream {
                self.generate_streaming(&request).await
            } else {
                self.generate_standard(&request).await
            }
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(HivemindError::External(format!(
                "generator timed out after {:?}",
                self.timeout
            ))),
        }
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

pub mod mock {
    //! Canned generator for tests

    use super::*;
    use std::sync::Mutex;

    /// Generator that returns a fixed response and records prompts.
    pub struct MockGenerator {
        response: String,
        pub calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl MockGenerator {
        pub fn new(response: impl Into<String>) -> Self {
            Self {
                response: response.into(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Generator for MockGenerator {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
            _stream: bool,
        ) -> Result<(String, TokenUsage)> {
            self.calls.lock().unwrap().push(messages.to_vec());
            Ok((
                self.response.clone(),
                TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    total_tokens: 150,
                },
            ))
        }

        fn model_name(&self) -> String {
            "mock".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization_roles() {
        let msg = ChatMessage::system("be terse");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "system");

        let user = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(user["role"], "user");
        let bot = serde_json::to_value(ChatMessage::assistant("hello")).unwrap();
        assert_eq!(bot["role"], "assistant");
    }

    #[test]
    fn test_build_chat_messages_with_context() {
        let messages = build_chat_messages("What's my name?", Some("=== CONTEXT ==="), None);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.contains("=== CONTEXT ==="));
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "What's my name?");
    }

    #[test]
    fn test_build_chat_messages_without_context() {
        let messages = build_chat_messages("hi", None, Some("custom prompt"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "custom prompt");
    }

    #[tokio::test]
    async fn test_mock_generator_records_calls() {
        let generator = mock::MockGenerator::new("a summary");
        let (text, usage) = generator
            .generate(&[ChatMessage::user("summarize")], 0.3, 500, false)
            .await
            .unwrap();

        assert_eq!(text, "a summary");
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(generator.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_external_error() {
        let generator = HttpGenerator::new(
            "http://127.0.0.1:1/v1".to_string(),
            "test".to_string(),
            None,
            Duration::from_secs(2),
        );
        let err = generator
            .generate(&[ChatMessage::user("hi")], 0.7, 10, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HivemindError::External(_)));
    }
}
