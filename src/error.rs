use std::time::Duration;
use thiserror::Error;

/// Boxed source for variants whose underlying failure can come from more than
/// one library (reqwest, std::io, zip, arrow, ...).
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure taxonomy for one pipeline run.
///
/// Per-row anomalies in the transform (bad column count, a region field with no
/// `(`) are counted and logged, not represented here. Everything below aborts
/// the remaining stages and surfaces unchanged to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input; raised before any I/O, the pipeline never starts.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The catalog had no matching resource, or the catalog call itself failed.
    #[error("no archive resource found for year {year}: {reason}")]
    NotFound { year: String, reason: String },

    /// HTTP error status or interrupted transfer while fetching the archive.
    #[error("download of {url} failed")]
    Download {
        url: String,
        #[source]
        source: BoxedSource,
    },

    /// The archive could not be decompressed.
    #[error("failed to extract archive {archive}")]
    Extraction {
        archive: String,
        #[source]
        source: BoxedSource,
    },

    /// Decompression succeeded but did not yield exactly one tabular file.
    #[error("archive yielded {found} csv files, expected exactly 1")]
    ExtractionAmbiguity { found: usize },

    /// Required column missing, unparseable timestamp column, or a column-name
    /// collision after renaming.
    #[error("schema error: {0}")]
    Schema(String),

    /// Local file i/o failed (run scratch space, reading the tabular file,
    /// writing the columnar output).
    #[error("local i/o on {path} failed")]
    LocalIo {
        path: String,
        #[source]
        source: BoxedSource,
    },

    /// Object-store read (existence check / staged-object download) failed.
    #[error("object store {op} on {uri} failed")]
    Store {
        op: &'static str,
        uri: String,
        #[source]
        source: BoxedSource,
    },

    /// Object-store write failed. Always fatal; never swallowed.
    #[error("upload to {uri} failed")]
    Upload {
        uri: String,
        #[source]
        source: BoxedSource,
    },

    /// The warehouse reported the load job as failed.
    #[error("load job {job_id} failed: {reason}")]
    LoadJob { job_id: String, reason: String },

    /// The load job did not reach a terminal state within the wait budget.
    /// The job is still running server-side; it is not cancelled.
    #[error("load job {job_id} still not terminal after {waited:?}")]
    LoadTimeout { job_id: String, waited: Duration },
}

impl PipelineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(year: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            year: year.into(),
            reason: reason.into(),
        }
    }

    pub fn download(url: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Download {
            url: url.into(),
            source: source.into(),
        }
    }

    pub fn extraction(archive: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Extraction {
            archive: archive.into(),
            source: source.into(),
        }
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }

    pub fn local_io(path: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::LocalIo {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn store(op: &'static str, uri: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Store {
            op,
            uri: uri.into(),
            source: source.into(),
        }
    }

    pub fn upload(uri: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Upload {
            uri: uri.into(),
            source: source.into(),
        }
    }
}
