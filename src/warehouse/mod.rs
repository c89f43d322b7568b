use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::PipelineError;

pub mod bigquery;
pub use bigquery::BigQueryWarehouse;

/// Partitioning/clustering directives applied to every load, regardless of
/// input size.
pub const PARTITION_FIELD: &str = "event_timestamp";
pub const CLUSTER_FIELDS: [&str; 2] = ["service_request_type", "region_id"];

/// `<dataset>.<table>` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableId {
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// One load submission: staged columnar objects → partitioned facts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSpec {
    pub source_uris: Vec<String>,
    pub dest_table: TableId,
    pub partition_field: String,
    pub cluster_fields: Vec<String>,
}

impl LoadSpec {
    /// The partition/cluster layout is fixed for this dataset; callers only
    /// choose sources and destination.
    pub fn new(source_uris: Vec<String>, dest_table: TableId) -> Self {
        Self {
            source_uris,
            dest_table,
            partition_field: PARTITION_FIELD.to_string(),
            cluster_fields: CLUSTER_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a load job, as reported by the warehouse.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: String,
    pub state: JobState,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

/// Handle for a submitted load job. The warehouse owns the state transitions;
/// this handle only observes them.
#[async_trait]
pub trait LoadJob: Send {
    fn id(&self) -> &str;

    /// Blocks until the job reaches a terminal state or `timeout` elapses.
    /// `Done` resolves to the final snapshot; `Failed` is a
    /// [`PipelineError::LoadJob`] carrying the warehouse-reported reason. On
    /// timeout the job keeps running server-side and is not cancelled; the
    /// caller must re-check its state out of band.
    async fn wait(&mut self, timeout: Duration) -> Result<JobSnapshot, PipelineError>;
}

/// Warehouse load API: submit a load job, get back a waitable handle.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn submit_load(&self, spec: LoadSpec) -> Result<Box<dyn LoadJob>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_spec_always_carries_fixed_directives() {
        let spec = LoadSpec::new(
            vec!["gs://b/raw/pq/x.parquet".into()],
            TableId::new("service_calls_models", "facts_2020_partitioned"),
        );
        assert_eq!(spec.partition_field, "event_timestamp");
        assert_eq!(spec.cluster_fields, vec!["service_request_type", "region_id"]);
        assert_eq!(spec.dest_table.to_string(), "service_calls_models.facts_2020_partitioned");
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
