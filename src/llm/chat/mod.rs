pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::debug;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use super::{ LlmConfig, LlmType };
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use crate::errors::InferenceError;
use crate::models::request::GenerationParams;

/// Cumulative answer text, one item per produced fragment. The last item is
/// the complete answer.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn stream_chat(
        &self,
        prompt: &str,
        history: &[(String, String)],
        params: &GenerationParams
    ) -> Result<FragmentStream, InferenceError>;

    fn get_model(&self) -> String;
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

/// Paired history followed by the prompt, in chat-completion message order.
pub fn build_messages(prompt: &str, history: &[(String, String)]) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 1);
    for (user, assistant) in history {
        messages.push(WireMessage { role: "user", content: user.clone() });
        messages.push(WireMessage { role: "assistant", content: assistant.clone() });
    }
    messages.push(WireMessage { role: "user", content: prompt.to_string() });
    messages
}

/// What one line of a streaming body means.
#[derive(Debug, PartialEq)]
pub enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

/// Splits a byte stream into lines, holding back a trailing partial line
/// (and any split UTF-8 sequence) until the rest arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Some(rest).filter(|s| !s.is_empty())
    }
}

/// Sends `request` and turns its streaming body into cumulative text.
///
/// The body is read by a spawned producer feeding a one-slot channel, so
/// nothing is read ahead of the consumer and a dropped consumer stops the
/// producer at its next send.
pub fn http_fragment_stream(
    request: reqwest::RequestBuilder,
    line_parser: fn(&str) -> Result<StreamLine, InferenceError>
) -> FragmentStream {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(InferenceError::Http(e))).await;
                return;
            }
        };
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let _ = tx.send(Err(InferenceError::Status { status, body })).await;
            return;
        }

        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut answer = String::new();

        let mut finished = false;
        while !finished {
            let batch = match bytes.next().await {
                Some(Ok(chunk)) => lines.push(&chunk),
                Some(Err(e)) => {
                    let _ = tx.send(Err(InferenceError::Http(e))).await;
                    return;
                }
                None => {
                    finished = true;
                    lines.finish().into_iter().collect()
                }
            };

            for line in batch {
                match line_parser(&line) {
                    Ok(StreamLine::Delta(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        answer.push_str(&delta);
                        if tx.send(Ok(answer.clone())).await.is_err() {
                            debug!("Fragment consumer went away, stopping inference stream");
                            return;
                        }
                    }
                    Ok(StreamLine::Done) => {
                        return;
                    }
                    Ok(StreamLine::Skip) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_engine(config: &LlmConfig) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    let engine: Arc<dyn InferenceEngine> = match config.llm_type {
        LlmType::Ollama => Arc::new(OllamaClient::from_config(config)?),
        LlmType::OpenAI => Arc::new(OpenAIChatClient::from_config(config)?),
    };
    Ok(engine)
}
