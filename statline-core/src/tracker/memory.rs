//! In-process run log
//!
//! Used by tests and by single-process deployments that do not need
//! durability across restarts.

use super::{RunLog, RunRecord};
use statline_common::{Error, Result};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryRunLog {
    records: RwLock<Vec<RunRecord>>,
}

impl InMemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in append order
    pub fn records(&self) -> Vec<RunRecord> {
        self.records
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RunLog for InMemoryRunLog {
    async fn append(&self, record: &RunRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Internal("Run log lock poisoned".to_string()))?;
        records.push(record.clone());
        Ok(())
    }

    async fn query_latest(
        &self,
        processor_name: &str,
        data_unit_key: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Internal("Run log lock poisoned".to_string()))?;

        let mut matching: Vec<(usize, &RunRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.processor_name == processor_name && r.data_unit_key == data_unit_key)
            .collect();

        // started_at DESC, then append order DESC
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.started_at.cmp(&a.started_at).then(seq_b.cmp(seq_a))
        });

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }
}
