//! Local keyword index over a JSON array of `{title, content}` records.
//!
//! Latin text is matched by lower-cased words, CJK text by character bigrams
//! (single characters for one-character runs).

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use super::{ KnowledgeRecord, KnowledgeRetriever };
use crate::errors::RetrievalError;

const TITLE_WEIGHT: usize = 3;

struct IndexedRecord {
    record: KnowledgeRecord,
    title_terms: Vec<String>,
    content_terms: Vec<String>,
}

pub struct KeywordIndex {
    records: Vec<IndexedRecord>,
    limit: usize,
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4dbf | 0x4e00..=0x9fff | 0xf900..=0xfaff | 0x3040..=0x30ff | 0xac00..=0xd7af)
}

pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_cjk = |run: &mut Vec<char>, terms: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => terms.push(run[0].to_string()),
            _ => {
                for pair in run.windows(2) {
                    terms.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                terms.push(std::mem::take(&mut word));
            }
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut terms);
            word.extend(c.to_lowercase());
        } else {
            flush_cjk(&mut cjk_run, &mut terms);
            if !word.is_empty() {
                terms.push(std::mem::take(&mut word));
            }
        }
    }
    flush_cjk(&mut cjk_run, &mut terms);
    if !word.is_empty() {
        terms.push(word);
    }
    terms
}

impl KeywordIndex {
    pub fn new(records: Vec<KnowledgeRecord>, limit: usize) -> Self {
        let records = records
            .into_iter()
            .map(|record| IndexedRecord {
                title_terms: tokenize(&record.title),
                content_terms: tokenize(&record.content),
                record,
            })
            .collect();
        Self { records, limit }
    }

    pub async fn load(path: impl AsRef<Path>, limit: usize) -> Result<Self, RetrievalError> {
        let text = tokio::fs::read_to_string(path).await?;
        let records: Vec<KnowledgeRecord> = serde_json::from_str(&text)?;
        Ok(Self::new(records, limit))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn search(&self, query: &str) -> Vec<KnowledgeRecord> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize)> = self.records
            .iter()
            .enumerate()
            .filter_map(|(pos, indexed)| {
                let title_hits = indexed.title_terms
                    .iter()
                    .filter(|t| query_terms.contains(*t))
                    .count();
                let content_hits = indexed.content_terms
                    .iter()
                    .filter(|t| query_terms.contains(*t))
                    .count();
                let score = title_hits * TITLE_WEIGHT + content_hits;
                (score > 0).then_some((score, pos))
            })
            .collect();

        // stable sort keeps file order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.limit)
            .map(|(_, pos)| self.records[pos].record.clone())
            .collect()
    }
}

#[async_trait]
impl KnowledgeRetriever for KeywordIndex {
    async fn find(&self, query: &str) -> Result<Vec<KnowledgeRecord>, RetrievalError> {
        Ok(self.search(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, content: &str) -> KnowledgeRecord {
        KnowledgeRecord { title: title.into(), content: content.into() }
    }

    #[test]
    fn tokenizes_words_and_cjk_bigrams() {
        assert_eq!(tokenize("Hello, World-42"), vec!["hello", "world", "42"]);
        assert_eq!(tokenize("混凝土强度"), vec!["混凝", "凝土", "土强", "强度"]);
        assert_eq!(tokenize("C30混凝土"), vec!["c30", "混凝", "凝土"]);
        assert_eq!(tokenize("桥 梁"), vec!["桥", "梁"]);
    }

    #[test]
    fn ranks_title_hits_above_content_hits() {
        let index = KeywordIndex::new(
            vec![
                record("Asphalt", "curing concrete takes time"),
                record("Concrete curing", "keep it wet"),
                record("Steel", "unrelated"),
            ],
            5
        );
        let hits = index.search("concrete curing");
        let titles: Vec<_> = hits.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Concrete curing", "Asphalt"]);
    }

    #[test]
    fn respects_limit_and_file_order_on_ties() {
        let index = KeywordIndex::new(
            vec![record("a", "bridge"), record("b", "bridge"), record("c", "bridge")],
            2
        );
        let titles: Vec<_> = index
            .search("bridge")
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn no_match_returns_nothing() {
        let index = KeywordIndex::new(vec![record("a", "bridge")], 3);
        assert!(index.search("tunnel").is_empty());
        assert!(index.search("  ?! ").is_empty());
    }

    #[tokio::test]
    async fn loads_records_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, r#"[{"title":"桥梁规范","content":"桥梁设计荷载"}]"#).unwrap();
        let index = KeywordIndex::load(&path, 3).await.unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.find("桥梁荷载是多少").await.unwrap();
        assert_eq!(hits[0].title, "桥梁规范");
    }
}
