use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::catalog::{Catalog, DatasetDescriptor};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fetch::ArchiveFetcher;
use crate::store::{BlobStore, ObjectKey};
use crate::transform::{self, TransformReport};
use crate::warehouse::{JobSnapshot, LoadSpec, TableId, Warehouse};

pub mod graph;
use graph::StageGraph;

/// Where a run currently is. `Failed` absorbs from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Resolving,
    CheckingRaw,
    CheckingNormalized,
    Downloading,
    SkipRaw,
    Transforming,
    SkipNormalized,
    Loading,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "IDLE",
            RunState::Resolving => "RESOLVING",
            RunState::CheckingRaw => "CHECKING_RAW",
            RunState::CheckingNormalized => "CHECKING_NORMALIZED",
            RunState::Downloading => "DOWNLOADING",
            RunState::SkipRaw => "SKIP_RAW",
            RunState::Transforming => "TRANSFORMING",
            RunState::SkipNormalized => "SKIP_NORMALIZED",
            RunState::Loading => "LOADING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Everything derived from the resolved archive: staging keys and the
/// destination table. Fixed for the rest of the run.
#[derive(Debug, Clone)]
struct Plan {
    descriptor: DatasetDescriptor,
    stem: String,
    csv_key: ObjectKey,
    pq_key: ObjectKey,
    table: TableId,
}

impl Plan {
    fn for_run(cfg: &PipelineConfig, descriptor: DatasetDescriptor) -> Result<Self, PipelineError> {
        let stem = descriptor.archive_stem()?;
        Ok(Self {
            csv_key: ObjectKey::new(cfg.bucket.clone(), format!("raw/csv/{stem}.csv")),
            pq_key: ObjectKey::new(cfg.bucket.clone(), format!("raw/pq/{stem}.parquet")),
            table: TableId::new(
                cfg.dataset.clone(),
                format!("facts_{}_partitioned", cfg.year),
            ),
            stem,
            descriptor,
        })
    }
}

/// What one completed run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub year: u16,
    pub raw_uri: String,
    pub normalized_uri: String,
    pub table: String,
    pub skipped_download: bool,
    pub skipped_transform: bool,
    pub transform: Option<TransformReport>,
    pub load: JobSnapshot,
}

/// Shared state the stage tasks read and write. Slots are write-once; the
/// stage graph's dependency order guarantees readers run after writers.
struct RunContext {
    cfg: PipelineConfig,
    catalog: Arc<dyn Catalog>,
    fetcher: Arc<dyn ArchiveFetcher>,
    store: Arc<dyn BlobStore>,
    warehouse: Arc<dyn Warehouse>,
    workdir: PathBuf,
    state: Mutex<RunState>,
    plan: OnceLock<Plan>,
    raw_exists: OnceLock<bool>,
    normalized_exists: OnceLock<bool>,
    staged_csv: OnceLock<Option<PathBuf>>,
    transform_report: OnceLock<Option<TransformReport>>,
    load_result: OnceLock<JobSnapshot>,
}

impl RunContext {
    fn enter(&self, next: RunState) {
        let mut state = self.state.lock().expect("run state lock");
        info!(from = %*state, to = %next, "transition");
        *state = next;
    }

    fn plan(&self) -> &Plan {
        self.plan.get().expect("resolve stage completed")
    }
}

/// Sequences one extract→transform→load run over the injected components,
/// skipping stages whose destinations already exist unless overwrite is set.
pub struct Pipeline {
    cfg: PipelineConfig,
    catalog: Arc<dyn Catalog>,
    fetcher: Arc<dyn ArchiveFetcher>,
    store: Arc<dyn BlobStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn ArchiveFetcher>,
        store: Arc<dyn BlobStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            cfg,
            catalog,
            fetcher,
            store,
            warehouse,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        // Per-run scratch space; reclaimed on every exit path below.
        let workdir = TempDir::new().map_err(|e| PipelineError::local_io("run scratch dir", e))?;
        let ctx = Arc::new(RunContext {
            cfg: self.cfg.clone(),
            catalog: self.catalog.clone(),
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            warehouse: self.warehouse.clone(),
            workdir: workdir.path().to_path_buf(),
            state: Mutex::new(RunState::Idle),
            plan: OnceLock::new(),
            raw_exists: OnceLock::new(),
            normalized_exists: OnceLock::new(),
            staged_csv: OnceLock::new(),
            transform_report: OnceLock::new(),
            load_result: OnceLock::new(),
        });

        match Self::drive(ctx.clone()).await {
            Ok(()) => {
                ctx.enter(RunState::Done);
                Ok(Self::summarize(&ctx))
            }
            Err(e) => {
                ctx.enter(RunState::Failed);
                Err(e)
            }
        }
    }

    fn summarize(ctx: &RunContext) -> RunSummary {
        let plan = ctx.plan();
        let overwrite = ctx.cfg.overwrite;
        let raw_exists = *ctx.raw_exists.get().expect("check_raw completed");
        let normalized_exists = *ctx
            .normalized_exists
            .get()
            .expect("check_normalized completed");
        RunSummary {
            year: ctx.cfg.year,
            raw_uri: plan.csv_key.gs_uri(),
            normalized_uri: plan.pq_key.gs_uri(),
            table: plan.table.to_string(),
            skipped_download: !overwrite && (raw_exists || normalized_exists),
            skipped_transform: !overwrite && normalized_exists,
            transform: ctx
                .transform_report
                .get()
                .expect("transform stage completed")
                .clone(),
            load: ctx.load_result.get().expect("load stage completed").clone(),
        }
    }

    async fn drive(ctx: Arc<RunContext>) -> Result<(), PipelineError> {
        let mut g = StageGraph::new();

        g.add_stage("resolve", &[], {
            let ctx = ctx.clone();
            async move {
                ctx.enter(RunState::Resolving);
                let descriptor = ctx.catalog.resolve(ctx.cfg.year).await?;
                let plan = Plan::for_run(&ctx.cfg, descriptor)?;
                info!(
                    url = %plan.descriptor.url,
                    raw = %plan.csv_key,
                    normalized = %plan.pq_key,
                    table = %plan.table,
                    "resolved archive"
                );
                ctx.plan.set(plan).expect("resolve runs once");
                Ok(())
            }
        });

        // The two existence checks share no data; the scheduler runs them
        // concurrently.
        g.add_stage("check_raw", &["resolve"], {
            let ctx = ctx.clone();
            async move {
                ctx.enter(RunState::CheckingRaw);
                let exists = ctx.store.exists(&ctx.plan().csv_key).await?;
                info!(key = %ctx.plan().csv_key, exists, "raw destination checked");
                ctx.raw_exists.set(exists).expect("check_raw runs once");
                Ok(())
            }
        });

        g.add_stage("check_normalized", &["resolve"], {
            let ctx = ctx.clone();
            async move {
                ctx.enter(RunState::CheckingNormalized);
                let exists = ctx.store.exists(&ctx.plan().pq_key).await?;
                info!(key = %ctx.plan().pq_key, exists, "normalized destination checked");
                ctx.normalized_exists
                    .set(exists)
                    .expect("check_normalized runs once");
                Ok(())
            }
        });

        g.add_stage("stage_raw", &["check_raw", "check_normalized"], {
            let ctx = ctx.clone();
            async move {
                let plan = ctx.plan().clone();
                let overwrite = ctx.cfg.overwrite;
                let raw_exists = *ctx.raw_exists.get().expect("check_raw completed");
                let normalized_exists = *ctx
                    .normalized_exists
                    .get()
                    .expect("check_normalized completed");

                if normalized_exists && !overwrite {
                    ctx.enter(RunState::SkipRaw);
                    info!(key = %plan.pq_key, "normalized output already staged; raw stage skipped");
                    ctx.staged_csv.set(None).expect("stage_raw runs once");
                    return Ok(());
                }
                if raw_exists && !overwrite {
                    ctx.enter(RunState::SkipRaw);
                    warn!(key = %plan.csv_key, "raw csv already staged; reusing it");
                    let local = ctx.workdir.join(format!("{}.csv", plan.stem));
                    ctx.store.download(&plan.csv_key, &local).await?;
                    ctx.staged_csv
                        .set(Some(local))
                        .expect("stage_raw runs once");
                    return Ok(());
                }

                ctx.enter(RunState::Downloading);
                let csv = ctx.fetcher.fetch(&plan.descriptor.url, &ctx.workdir).await?;
                ctx.store
                    .upload(&csv, &plan.csv_key, ctx.cfg.timeouts.upload)
                    .await?;
                ctx.staged_csv.set(Some(csv)).expect("stage_raw runs once");
                Ok(())
            }
        });

        g.add_stage("transform", &["stage_raw"], {
            let ctx = ctx.clone();
            async move {
                let plan = ctx.plan().clone();
                let normalized_exists = *ctx
                    .normalized_exists
                    .get()
                    .expect("check_normalized completed");
                if normalized_exists && !ctx.cfg.overwrite {
                    ctx.enter(RunState::SkipNormalized);
                    info!(key = %plan.pq_key, "normalized output already staged; transform skipped");
                    ctx.transform_report
                        .set(None)
                        .expect("transform runs once");
                    return Ok(());
                }

                ctx.enter(RunState::Transforming);
                let csv = ctx
                    .staged_csv
                    .get()
                    .expect("stage_raw completed")
                    .clone()
                    .expect("staged csv present when transform is not skipped");
                let out = ctx.workdir.join(format!("{}.parquet", plan.stem));
                let row_limit = ctx.cfg.row_limit;
                let report = {
                    let csv = csv.clone();
                    let out = out.clone();
                    tokio::task::spawn_blocking(move || {
                        transform::transform_to_parquet(&csv, &out, row_limit)
                    })
                    .await
                    .map_err(|e| PipelineError::local_io(out.display().to_string(), e))??
                };
                ctx.store
                    .upload(&out, &plan.pq_key, ctx.cfg.timeouts.upload)
                    .await?;
                ctx.transform_report
                    .set(Some(report))
                    .expect("transform runs once");
                Ok(())
            }
        });

        g.add_stage("load", &["transform"], {
            let ctx = ctx.clone();
            async move {
                ctx.enter(RunState::Loading);
                let plan = ctx.plan().clone();
                let spec = LoadSpec::new(vec![plan.pq_key.gs_uri()], plan.table.clone());
                let mut job = ctx.warehouse.submit_load(spec).await?;
                info!(job_id = job.id(), table = %plan.table, "waiting for load job");
                let snapshot = job.wait(ctx.cfg.timeouts.load_wait).await?;
                ctx.load_result.set(snapshot).expect("load runs once");
                Ok(())
            }
        });

        g.run().await
    }
}
