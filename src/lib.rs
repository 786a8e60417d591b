pub mod cli;
pub mod errors;
pub mod history;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod rag;
pub mod server;

use cli::Args;
use llm::{ LlmConfig, LlmType };
use log::info;
use orchestrator::ChatOrchestrator;
use rag::KnowledgeAugmenter;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub fn llm_config(args: &Args) -> Result<LlmConfig, Box<dyn Error + Send + Sync>> {
    let llm_type: LlmType = args.chat_llm_type.parse()?;
    let api_key = Some(args.chat_api_key.clone()).filter(|k| !k.trim().is_empty());
    Ok(LlmConfig {
        llm_type,
        api_key,
        completion_model: args.chat_model.clone(),
        base_url: args.chat_base_url.clone(),
    })
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("Rate Limit (req/s): {}", args.rate_limit_per_second);
    info!("Session Store Type: {}", args.session_store_type);
    match args.session_store_type.as_str() {
        "file" => info!("Session Store Path: {}", args.session_store_path),
        "redis" => info!("Session Redis Prefix: {}", args.session_redis_prefix),
        _ => {}
    }
    info!("Session Store Capacity: {}", args.session_store_capacity);
    info!("Session Id Prefix: {}", args.session_id_prefix);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or("(adapter default)"));
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("(adapter default)"));
    info!("Knowledge Type: {}", args.knowledge_type);
    if args.knowledge_type != "none" {
        info!("Knowledge Source: {}", args.knowledge_path.as_deref().or(args.knowledge_url.as_deref()).unwrap_or("(unset)"));
        info!("Knowledge Limit: {}", args.knowledge_limit);
    }
    info!("-------------------------");

    let store = history::initialize_session_store(&args).await?;
    let engine = llm::chat::new_engine(&llm_config(&args)?)?;
    info!("Chat engine ready: {}", engine.get_model());
    let retriever = rag::create_retriever(&args).await?;
    let augmenter = KnowledgeAugmenter::new(retriever, args.knowledge_template());

    let orchestrator = Arc::new(
        ChatOrchestrator::new(store, engine, augmenter, args.session_id_prefix.clone())
    );
    let server = Server::new(orchestrator, args);
    server.run().await?;

    Ok(())
}
