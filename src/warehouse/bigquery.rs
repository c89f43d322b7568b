use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::job::get::GetJobRequest;
use google_cloud_bigquery::http::job::{
    Job, JobConfiguration, JobConfigurationLoad, JobReference, JobState as BqJobState, JobType,
    SourceFormat,
};
use google_cloud_bigquery::http::table::{Clustering, TableReference, TimePartitionType, TimePartitioning};
use std::time::Duration;
use tracing::{info, instrument};

use super::{JobSnapshot, JobState, LoadJob, LoadSpec, Warehouse};
use crate::error::PipelineError;

/// BigQuery-backed [`Warehouse`] using application-default credentials.
pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    location: String,
    poll: Duration,
}

impl BigQueryWarehouse {
    pub async fn new(location: String, poll: Duration) -> anyhow::Result<Self> {
        let (config, project_id) = ClientConfig::new_with_auth()
            .await
            .context("authenticating BigQuery client")?;
        let project_id = project_id.context("no project id resolved from credentials")?;
        let client = Client::new(config)
            .await
            .context("building BigQuery client")?;
        Ok(Self {
            client,
            project_id,
            location,
            poll,
        })
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    #[instrument(level = "info", skip(self, spec), fields(table = %spec.dest_table))]
    async fn submit_load(&self, spec: LoadSpec) -> Result<Box<dyn LoadJob>, PipelineError> {
        let job_id = format!(
            "callstage_{}_{}",
            spec.dest_table.table,
            Utc::now().timestamp_millis()
        );
        let load = JobConfigurationLoad {
            source_uris: spec.source_uris.clone(),
            destination_table: TableReference {
                project_id: self.project_id.clone(),
                dataset_id: spec.dest_table.dataset.clone(),
                table_id: spec.dest_table.table.clone(),
            },
            source_format: Some(SourceFormat::Parquet),
            time_partitioning: Some(TimePartitioning {
                partition_type: TimePartitionType::Day,
                field: Some(spec.partition_field.clone()),
                ..Default::default()
            }),
            clustering: Some(Clustering {
                fields: spec.cluster_fields.clone(),
            }),
            ..Default::default()
        };
        let job = Job {
            job_reference: JobReference {
                project_id: self.project_id.clone(),
                job_id: job_id.clone(),
                location: Some(self.location.clone()),
            },
            configuration: JobConfiguration {
                job: JobType::Load(load),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = self.client.job().create(&job).await.map_err(|e| {
            PipelineError::LoadJob {
                job_id: job_id.clone(),
                reason: format!("submission failed: {e}"),
            }
        })?;
        info!(job_id = %job_id, sources = spec.source_uris.len(), "load job submitted");

        Ok(Box::new(BigQueryLoadJob {
            client: self.client.clone(),
            project_id: self.project_id.clone(),
            location: self.location.clone(),
            job_id,
            poll: self.poll,
            last: snapshot_of(&created),
        }))
    }
}

/// Polling handle for one submitted job.
struct BigQueryLoadJob {
    client: Client,
    project_id: String,
    location: String,
    job_id: String,
    poll: Duration,
    last: JobSnapshot,
}

fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn snapshot_of(job: &Job) -> JobSnapshot {
    let (state, _) = state_of(job);
    let stats = job.statistics.as_ref();
    JobSnapshot {
        id: job.job_reference.job_id.clone(),
        state,
        created: millis_to_datetime(stats.and_then(|s| s.creation_time)),
        started: millis_to_datetime(stats.and_then(|s| s.start_time)),
        ended: millis_to_datetime(stats.and_then(|s| s.end_time)),
    }
}

/// Maps the warehouse-reported status to our state, carrying the failure
/// reason when the terminal state is an error.
fn state_of(job: &Job) -> (JobState, Option<String>) {
    let status = &job.status;
    let failure = status.error_result.as_ref().map(|e| e.message.clone());
    let state = match status.state {
        BqJobState::Pending => JobState::Pending,
        BqJobState::Running => JobState::Running,
        BqJobState::Done => {
            if failure.is_some() {
                JobState::Failed
            } else {
                JobState::Done
            }
        }
    };
    (state, failure)
}

#[async_trait]
impl LoadJob for BigQueryLoadJob {
    fn id(&self) -> &str {
        &self.job_id
    }

    async fn wait(&mut self, timeout: Duration) -> Result<JobSnapshot, PipelineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let request = GetJobRequest {
                location: Some(self.location.clone()),
            };
            let job = self
                .client
                .job()
                .get(&self.project_id, &self.job_id, &request)
                .await
                .map_err(|e| PipelineError::LoadJob {
                    job_id: self.job_id.clone(),
                    reason: format!("state poll failed: {e}"),
                })?;

            let (state, failure) = state_of(&job);
            self.last = snapshot_of(&job);
            match state {
                JobState::Done => {
                    info!(
                        job_id = %self.job_id,
                        started = ?self.last.started,
                        ended = ?self.last.ended,
                        "load job done"
                    );
                    return Ok(self.last.clone());
                }
                JobState::Failed => {
                    return Err(PipelineError::LoadJob {
                        job_id: self.job_id.clone(),
                        reason: failure.unwrap_or_else(|| "unknown failure".to_string()),
                    })
                }
                JobState::Pending | JobState::Running => {
                    // Not cancelled on timeout; the job keeps running server-side.
                    if tokio::time::Instant::now() + self.poll > deadline {
                        return Err(PipelineError::LoadTimeout {
                            job_id: self.job_id.clone(),
                            waited: timeout,
                        });
                    }
                    tokio::time::sleep(self.poll).await;
                }
            }
        }
    }
}
