use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the HTTP server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:3002")]
    pub server_addr: String,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Maximum chat requests accepted per second across all clients. 0 disables the limit.
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "0")]
    pub rate_limit_per_second: u32,

    // --- Session Store Args ---
    /// Session store type (memory, file, redis)
    #[arg(long, env = "SESSION_STORE_TYPE", default_value = "file")]
    pub session_store_type: String,

    /// Append-only log used by the file session store.
    #[arg(long, env = "SESSION_STORE_PATH", default_value = "message_store.jsonl")]
    pub session_store_path: String,

    /// Maximum number of sessions kept before the oldest is evicted.
    #[arg(long, env = "SESSION_STORE_CAPACITY", default_value = "100000")]
    pub session_store_capacity: usize,

    /// Redis URL for the redis session store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "SESSION_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub session_redis_url: String,

    /// Prefix for Redis session keys.
    #[arg(long, env = "SESSION_REDIS_PREFIX", default_value = "chat-session:")]
    pub session_redis_prefix: String,

    /// Prefix of every minted session id.
    #[arg(long, env = "SESSION_ID_PREFIX", default_value = "chatglm")]
    pub session_id_prefix: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (ollama, openai)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "ollama")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., chatglm3, gpt-4o)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    // --- Knowledge Args ---
    /// Knowledge source for augmented answers (none, file, http)
    #[arg(long, env = "KNOWLEDGE_TYPE", default_value = "none")]
    pub knowledge_type: String,

    /// JSON file of {title, content} records for the file knowledge source.
    #[arg(long, env = "KNOWLEDGE_PATH")]
    pub knowledge_path: Option<String>,

    /// Search endpoint for the http knowledge source.
    #[arg(long, env = "KNOWLEDGE_URL")]
    pub knowledge_url: Option<String>,

    /// Number of knowledge records folded into a prompt.
    #[arg(long, env = "KNOWLEDGE_LIMIT", default_value = "3")]
    pub knowledge_limit: usize,

    /// Instruction placed before retrieved knowledge.
    #[arg(long, env = "KNOWLEDGE_INSTRUCTION", default_value = crate::rag::DEFAULT_INSTRUCTION)]
    pub knowledge_instruction: String,

    /// Header line of the references footer.
    #[arg(long, env = "KNOWLEDGE_REFERENCES_HEADER", default_value = crate::rag::DEFAULT_REFERENCES_HEADER)]
    pub knowledge_references_header: String,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn knowledge_template(&self) -> crate::rag::KnowledgeTemplate {
        crate::rag::KnowledgeTemplate {
            instruction: self.knowledge_instruction.clone(),
            references_header: self.knowledge_references_header.clone(),
        }
    }
}
