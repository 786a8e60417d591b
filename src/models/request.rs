use serde::{ Deserialize, Deserializer, Serialize };
use serde_json::Value;
use crate::errors::ChatError;

pub const DEFAULT_MAX_LENGTH: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 0.9;

/// Body of `POST /chat-process` as clients send it.
///
/// Every field is read leniently: a value of the wrong JSON type falls back to
/// the field's default instead of failing the whole body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatProcessRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub prompt: Option<String>,
    #[serde(default, deserialize_with = "lenient_length")]
    pub max_length: Option<u32>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub top_p: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_options")]
    pub options: Option<ChatOptions>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub memory: Option<f64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_knowledge: bool,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

fn lenient_options<'de, D: Deserializer<'de>>(
    deserializer: D
) -> Result<Option<ChatOptions>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_f64()))
}

fn lenient_length<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let length = lenient_number(deserializer)?;
    Ok(
        length
            .filter(|n| n.is_finite() && *n >= 1.0 && *n <= (u32::MAX as f64))
            .map(|n| n as u32)
    )
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(matches!(value, Some(Value::Bool(true))))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default, deserialize_with = "lenient_string")]
    pub parent_message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_length: u32,
    pub top_p: f64,
    pub temperature: f64,
    pub memory_window: usize,
}

/// A request that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    pub parent_message_id: Option<String>,
    pub params: GenerationParams,
    pub use_knowledge: bool,
}

/// Client `memory` preset to a window of trailing turns.
pub fn memory_window_for(memory: Option<f64>) -> usize {
    match memory {
        Some(m) if m == 1.0 => 5,
        Some(m) if m == 50.0 => 20,
        _ => 999,
    }
}

/// Client `top_p` preset to the value the engine receives. This is a lookup on
/// the literal value sent, so anything outside the table (including a real
/// probability like 0.7, or no value at all) becomes 0.9.
pub fn top_p_for(top_p: Option<f64>) -> f64 {
    match top_p {
        Some(p) if p == 1.0 => 0.2,
        Some(p) if p == 50.0 => 0.5,
        _ => 0.9,
    }
}

impl ChatProcessRequest {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_length: self.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
            top_p: top_p_for(self.top_p),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            memory_window: memory_window_for(self.memory),
        }
    }

    pub fn validate(self) -> Result<ChatRequest, ChatError> {
        let params = self.generation_params();
        let prompt = match self.prompt {
            Some(p) if !p.trim().is_empty() => p,
            _ => {
                return Err(ChatError::PromptEmpty);
            }
        };
        let parent_message_id = self.options
            .and_then(|o| o.parent_message_id)
            .filter(|id| !id.is_empty());

        Ok(ChatRequest {
            prompt,
            parent_message_id,
            params,
            use_knowledge: self.is_knowledge,
        })
    }
}
