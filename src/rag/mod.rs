pub mod keyword;
pub mod remote;

use async_trait::async_trait;
use log::{ debug, info, warn };
use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::errors::RetrievalError;
use self::keyword::KeywordIndex;
use self::remote::RemoteRetriever;

pub const DEFAULT_INSTRUCTION: &str = "基于以下内容，用中文简洁和专业回答用户的问题。";
pub const DEFAULT_REFERENCES_HEADER: &str = "参考：";
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub title: String,
    pub content: String,
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Records relevant to `query`, best first.
    async fn find(&self, query: &str) -> Result<Vec<KnowledgeRecord>, RetrievalError>;
}

/// Retriever used when no knowledge source is configured.
pub struct NoKnowledge;

#[async_trait]
impl KnowledgeRetriever for NoKnowledge {
    async fn find(&self, _query: &str) -> Result<Vec<KnowledgeRecord>, RetrievalError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeTemplate {
    pub instruction: String,
    pub references_header: String,
}

impl Default for KnowledgeTemplate {
    fn default() -> Self {
        Self {
            instruction: DEFAULT_INSTRUCTION.to_string(),
            references_header: DEFAULT_REFERENCES_HEADER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Augmentation {
    pub prompt: String,
    /// Appended verbatim to every streamed fragment; empty when nothing was found.
    pub footer: String,
}

#[derive(Clone)]
pub struct KnowledgeAugmenter {
    retriever: Arc<dyn KnowledgeRetriever>,
    template: KnowledgeTemplate,
}

impl KnowledgeAugmenter {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>, template: KnowledgeTemplate) -> Self {
        Self { retriever, template }
    }

    pub async fn augment(&self, query: &str) -> Result<Augmentation, RetrievalError> {
        let records = self.retriever.find(query).await?;
        debug!("Knowledge lookup returned {} records", records.len());
        Ok(self.compose(query, &records))
    }

    pub fn compose(&self, query: &str, records: &[KnowledgeRecord]) -> Augmentation {
        let context = records
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);
        let prompt = format!("system:{}\n\n{}\nuser:{}", self.template.instruction, context, query);

        let footer = if records.is_empty() {
            String::new()
        } else {
            let titles = records
                .iter()
                .map(|r| r.title.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n{}\n{}", self.template.references_header, titles)
        };

        Augmentation { prompt, footer }
    }
}

pub async fn create_retriever(
    args: &Args
) -> Result<Arc<dyn KnowledgeRetriever>, Box<dyn Error + Send + Sync>> {
    match args.knowledge_type.to_lowercase().as_str() {
        "none" => Ok(Arc::new(NoKnowledge)),
        "file" => {
            let path = args.knowledge_path
                .as_deref()
                .ok_or_else(|| RetrievalError::Config("KNOWLEDGE_PATH is required for file knowledge".into()))?;
            let index = KeywordIndex::load(path, args.knowledge_limit).await?;
            info!("Knowledge index loaded from {} ({} records)", path, index.len());
            Ok(Arc::new(index))
        }
        "http" => {
            let url = args.knowledge_url
                .clone()
                .ok_or_else(|| RetrievalError::Config("KNOWLEDGE_URL is required for http knowledge".into()))?;
            Ok(Arc::new(RemoteRetriever::new(url, args.knowledge_limit)))
        }
        other => {
            warn!("Unknown knowledge type '{}'", other);
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported knowledge type: {}", other)
                    )
                )
            )
        }
    }
}
