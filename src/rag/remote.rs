use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;
use super::{ KnowledgeRecord, KnowledgeRetriever };
use crate::errors::RetrievalError;

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
}

/// Delegates search to a service answering `POST {query, limit}` with a JSON
/// array of records.
pub struct RemoteRetriever {
    http: HttpClient,
    url: String,
    limit: usize,
}

impl RemoteRetriever {
    pub fn new(url: String, limit: usize) -> Self {
        Self { http: HttpClient::new(), url, limit }
    }
}

#[async_trait]
impl KnowledgeRetriever for RemoteRetriever {
    async fn find(&self, query: &str) -> Result<Vec<KnowledgeRecord>, RetrievalError> {
        let req = SearchRequest { query, limit: self.limit };
        let resp = self.http.post(&self.url).json(&req).send().await?.error_for_status()?;
        let mut records = resp.json::<Vec<KnowledgeRecord>>().await?;
        records.truncate(self.limit);
        Ok(records)
    }
}
