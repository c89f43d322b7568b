use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::error::PipelineError;

/// Inclusive range of years the open-data portal publishes yearly archives for.
pub const YEAR_MIN: u16 = 2015;
pub const YEAR_MAX: u16 = 2023;

/// Row limit applied by `--test` runs.
pub const TEST_ROW_LIMIT: usize = 100;

// GCS bucket names: 3-63 chars, lowercase letters/digits/dash/underscore/dot,
// must start and end with a letter or digit.
static BUCKET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{1,61}[a-z0-9]$").expect("bucket name regex"));

// BigQuery dataset ids: letters, digits and underscores only.
static DATASET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,1024}$").expect("dataset name regex"));

/// One timeout per external concern, applied consistently at every call site.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Catalog metadata lookup.
    pub catalog: Duration,
    /// Archive download, connect through last body byte.
    pub download: Duration,
    /// One object-store upload.
    pub upload: Duration,
    /// Total wait for a load job to reach a terminal state.
    pub load_wait: Duration,
    /// Interval between load-job state polls.
    pub load_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            catalog: Duration::from_secs(5),
            download: Duration::from_secs(30),
            upload: Duration::from_secs(90),
            load_wait: Duration::from_secs(90),
            load_poll: Duration::from_secs(2),
        }
    }
}

/// Immutable configuration for one pipeline run. Built once at process start
/// from CLI arguments and deployment environment variables; components receive
/// it by reference and never consult ambient state themselves.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// GCS bucket staging both the raw CSV and the normalized parquet.
    pub bucket: String,
    /// BigQuery dataset receiving the partitioned facts table.
    pub dataset: String,
    /// Warehouse region/location.
    pub location: String,
    /// Dataset year to fetch, within [`YEAR_MIN`]..=[`YEAR_MAX`].
    pub year: u16,
    /// Re-run every stage even if its destination already exists.
    pub overwrite: bool,
    /// Cap on transformed rows (test runs); `None` means the full file.
    pub row_limit: Option<usize>,
    pub timeouts: Timeouts,
}

impl PipelineConfig {
    /// Validates and freezes the run configuration. Fails before any I/O.
    pub fn new(
        bucket: String,
        dataset: String,
        location: String,
        year: &str,
        overwrite: bool,
        row_limit: Option<usize>,
        timeouts: Timeouts,
    ) -> Result<Self, PipelineError> {
        if !BUCKET_RE.is_match(&bucket) {
            return Err(PipelineError::validation(
                "bucket_name",
                format!("{bucket:?} is not a valid bucket name"),
            ));
        }
        if !DATASET_RE.is_match(&dataset) {
            return Err(PipelineError::validation(
                "dataset_name",
                format!("{dataset:?} is not a valid dataset name"),
            ));
        }
        let year: u16 = year.trim().parse().map_err(|_| {
            PipelineError::validation("year", format!("{year:?} is not a number"))
        })?;
        if !(YEAR_MIN..=YEAR_MAX).contains(&year) {
            return Err(PipelineError::validation(
                "year",
                format!("{year} outside supported range {YEAR_MIN}-{YEAR_MAX}"),
            ));
        }
        Ok(Self {
            bucket,
            dataset,
            location,
            year,
            overwrite,
            row_limit,
            timeouts,
        })
    }
}
