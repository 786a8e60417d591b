use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use super::{ build_messages, http_fragment_stream, FragmentStream, InferenceEngine, StreamLine, WireMessage };
use crate::errors::InferenceError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::request::GenerationParams;

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

/// One NDJSON line of `/api/chat`.
pub fn parse_line(line: &str) -> Result<StreamLine, InferenceError> {
    let resp: StreamResponse = serde_json
        ::from_str(line)
        .map_err(|e| InferenceError::Decode(format!("{} in line: {}", e, line)))?;
    if let Some(err) = resp.error {
        return Err(InferenceError::Decode(err));
    }
    let delta = resp.message.map(|m| m.content).unwrap_or_default();
    if resp.done {
        // the closing line may still carry text
        return Ok(if delta.is_empty() { StreamLine::Done } else { StreamLine::Delta(delta) });
    }
    Ok(StreamLine::Delta(delta))
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| "chatglm3".to_string());
        let url = base_url.unwrap_or_else(|| "http://localhost:11434".into());

        Self {
            http: HttpClient::new(),
            base_url: url,
            completion_model: model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, InferenceError> {
        if config.llm_type != LlmType::Ollama {
            return Err(InferenceError::Config("Invalid config type for OllamaClient".into()));
        }

        Ok(Self::new(config.base_url.clone(), config.completion_model.clone()))
    }
}

#[async_trait]
impl InferenceEngine for OllamaClient {
    async fn stream_chat(
        &self,
        prompt: &str,
        history: &[(String, String)],
        params: &GenerationParams
    ) -> Result<FragmentStream, InferenceError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let req = ChatRequest {
            model: self.completion_model.clone(),
            messages: build_messages(prompt, history),
            stream: true,
            options: ChatOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: params.max_length,
            },
        };
        debug!(
            "Ollama chat request: model={}, history_pairs={}, top_p={}, temperature={}",
            self.completion_model,
            history.len(),
            params.top_p,
            params.temperature
        );

        Ok(http_fragment_stream(self.http.post(&url).json(&req), parse_line))
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }
}
