use thiserror::Error;

pub const PROMPT_EMPTY: &str = "PROMPT_EMPTY";
pub const INFERENCE_FAILURE: &str = "INFERENCE_FAILURE";
pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session store Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference backend returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("Malformed inference stream: {0}")]
    Decode(String),

    #[error("Invalid inference configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Knowledge index IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Knowledge index parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Knowledge search request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid knowledge configuration: {0}")]
    Config(String),
}

/// Everything that can end a chat turn early.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Prompt is empty")]
    PromptEmpty,

    #[error("Unreadable request body: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl ChatError {
    /// Sentinel code sent to the caller. Validation failures are reported
    /// specifically; every other failure is generic.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::PromptEmpty => PROMPT_EMPTY,
            ChatError::InvalidRequest(_) => INVALID_REQUEST,
            _ => INFERENCE_FAILURE,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            ChatError::PromptEmpty => "Prompt is empty.",
            ChatError::InvalidRequest(_) => "Request body is not valid JSON.",
            _ => "Something went wrong, please try again later.",
        }
    }
}
