use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use super::{ build_messages, http_fragment_stream, FragmentStream, InferenceEngine, StreamLine, WireMessage };
use crate::errors::InferenceError;
use crate::llm::{ LlmConfig, LlmType };
use crate::models::request::GenerationParams;

/// Client for OpenAI-compatible `/chat/completions` servers (OpenAI itself,
/// vLLM, llama.cpp server, ...). `base_url` is the full completions endpoint.
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

/// One server-sent line of a streaming completion.
pub fn parse_line(line: &str) -> Result<StreamLine, InferenceError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    let resp: OpenAIStreamResponse = serde_json
        ::from_str(data)
        .map_err(|e| InferenceError::Decode(format!("{} in event: {}", e, data)))?;
    let delta = resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();
    Ok(StreamLine::Delta(delta))
}

impl OpenAIChatClient {
    pub fn new(
        api_key: Option<String>,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, InferenceError> {
        let chat_model = model.unwrap_or_else(|| "gpt-4o".to_string());
        let api_url = base_url.unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e|
                    InferenceError::Config(format!("Invalid API key format: {}", e))
                )?
            );
        }

        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            model: chat_model,
            base_url: api_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, InferenceError> {
        if config.llm_type != LlmType::OpenAI {
            return Err(InferenceError::Config("Invalid config type for OpenAIChatClient".into()));
        }
        Self::new(config.api_key.clone(), config.completion_model.clone(), config.base_url.clone())
    }
}

#[async_trait]
impl InferenceEngine for OpenAIChatClient {
    async fn stream_chat(
        &self,
        prompt: &str,
        history: &[(String, String)],
        params: &GenerationParams
    ) -> Result<FragmentStream, InferenceError> {
        let req = OpenAIChatRequest {
            model: self.model.clone(),
            messages: build_messages(prompt, history),
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_length,
            stream: true,
        };
        debug!("OpenAI-compatible chat request: model={}, history_pairs={}", self.model, history.len());

        Ok(http_fragment_stream(self.http.post(&self.base_url).json(&req), parse_line))
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_sent_lines() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"你好"},"finish_reason":null}]}"#).unwrap(),
            StreamLine::Delta("你好".into())
        );
        assert_eq!(parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(), StreamLine::Delta(String::new()));
        assert_eq!(parse_line("data: [DONE]").unwrap(), StreamLine::Done);
        assert_eq!(parse_line(": keep-alive").unwrap(), StreamLine::Skip);
        assert!(parse_line("data: {oops").is_err());
    }

    #[tokio::test]
    async fn streams_cumulative_text_from_a_compatible_server() {
        use futures::StreamExt;

        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(move || async move { body })
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = OpenAIChatClient::new(
            None,
            Some("local".into()),
            Some(format!("http://{}/v1/chat/completions", addr))
        ).unwrap();
        let params = GenerationParams { max_length: 64, top_p: 0.9, temperature: 0.9, memory_window: 5 };
        let stream = client.stream_chat("hi", &[], &params).await.unwrap();
        let texts: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(texts, vec!["Hel".to_string(), "Hello".to_string()]);
    }
}
