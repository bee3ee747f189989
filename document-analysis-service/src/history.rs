use analysis_bridge::AnalysisRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Trait for storing and retrieving past analyses
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: AnalysisRecord);
    /// All records, newest first
    async fn list(&self) -> Vec<AnalysisRecord>;
    async fn get(&self, id: &str) -> Option<AnalysisRecord>;
    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> bool;
}

/// In-memory implementation of HistoryStore. Lives as long as the process.
#[derive(Clone, Default)]
pub struct InMemoryHistoryStore {
    records: Arc<DashMap<String, AnalysisRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: AnalysisRecord) {
        self.records.insert(record.id.clone(), record);
    }

    async fn list(&self) -> Vec<AnalysisRecord> {
        let mut records: Vec<AnalysisRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    async fn get(&self, id: &str) -> Option<AnalysisRecord> {
        self.records.get(id).map(|entry| entry.clone())
    }

    async fn delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }
}
