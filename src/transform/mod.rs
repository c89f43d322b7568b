use arrow::array::{ArrayRef, Int8Builder, StringBuilder, TimestampMillisecondBuilder};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use csv::ByteRecord;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineError;

pub mod region;
pub mod timestamp;

use region::RegionParse;

/// Source column carrying the creation timestamp; consumed by the transform.
pub const SOURCE_TIMESTAMP_COLUMN: &str = "Creation Date";
/// Source column carrying the composite region field; consumed by the transform.
pub const SOURCE_REGION_COLUMN: &str = "Ward";

pub const REGION_NAME_COLUMN: &str = "region_name";
pub const REGION_ID_COLUMN: &str = "region_id";
pub const EVENT_TIMESTAMP_COLUMN: &str = "event_timestamp";

/// Exact renames applied before the lowercase/underscore normalization.
const RENAMES: &[(&str, &str)] = &[("First 3 Chars of Postal Code", "fsa_code")];

const BATCH_ROWS: usize = 8192;

/// Counters for one transform run. Per-row anomalies land here, not in errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransformReport {
    /// Data rows scanned from the source file.
    pub rows_read: u64,
    /// Rows dropped for having the wrong column count.
    pub rows_skipped: u64,
    /// Rows written to the columnar output.
    pub rows_written: u64,
    /// Rows whose region field had no parseable name/code pair.
    pub region_missing: u64,
}

/// Output column name for a source header: exact renames first, then
/// lowercased with spaces replaced by underscores.
fn normalize_column_name(header: &str) -> String {
    let renamed = RENAMES
        .iter()
        .find(|(from, _)| *from == header)
        .map(|(_, to)| *to)
        .unwrap_or(header);
    renamed.to_lowercase().replace(' ', "_")
}

/// Column plan derived from the source header row.
struct Layout {
    source_width: usize,
    timestamp_idx: usize,
    region_idx: usize,
    /// Source indices of columns copied through as text, in source order.
    passthrough: Vec<usize>,
    schema: Arc<Schema>,
}

impl Layout {
    fn from_headers(headers: &[String]) -> Result<Self, PipelineError> {
        let position = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                PipelineError::schema(format!("required column {name:?} not found in source"))
            })
        };
        let timestamp_idx = position(SOURCE_TIMESTAMP_COLUMN)?;
        let region_idx = position(SOURCE_REGION_COLUMN)?;

        let passthrough: Vec<usize> = (0..headers.len())
            .filter(|&i| i != timestamp_idx && i != region_idx)
            .collect();

        let mut fields: Vec<Field> = passthrough
            .iter()
            .map(|&i| Field::new(normalize_column_name(&headers[i]), DataType::Utf8, true))
            .collect();
        fields.push(Field::new(REGION_NAME_COLUMN, DataType::Utf8, true));
        fields.push(Field::new(REGION_ID_COLUMN, DataType::Int8, true));
        fields.push(Field::new(
            EVENT_TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Millisecond, None),
            true,
        ));

        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name().clone()) {
                return Err(PipelineError::schema(format!(
                    "column name {:?} is not unique after renaming",
                    field.name()
                )));
            }
        }

        Ok(Self {
            source_width: headers.len(),
            timestamp_idx,
            region_idx,
            passthrough,
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

fn field_str(record: &ByteRecord, idx: usize) -> String {
    String::from_utf8_lossy(record.get(idx).unwrap_or_default()).into_owned()
}

/// Converts the raw CSV into a normalized parquet file at `out_path`.
///
/// Rows with the wrong column count are skipped; a region field without a
/// parseable name/code pair nulls both outputs; an unparseable non-empty
/// timestamp fails the stage. The output appears at `out_path` only after a
/// complete, closed write.
#[instrument(level = "info", skip(csv_path, out_path), fields(src = %csv_path.display()))]
pub fn transform_to_parquet(
    csv_path: &Path,
    out_path: &Path,
    row_limit: Option<usize>,
) -> Result<TransformReport, PipelineError> {
    let src = csv_path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(csv_path)
        .map_err(|e| PipelineError::local_io(&src, e))?;
    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| PipelineError::local_io(&src, e))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();
    let layout = Layout::from_headers(&headers)?;

    let tmp_path = out_path.with_extension("parquet.tmp");
    let tmp_name = tmp_path.display().to_string();
    let tmp_file =
        File::create(&tmp_path).map_err(|e| PipelineError::local_io(&tmp_name, e))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let writer = ArrowWriter::try_new(tmp_file, layout.schema.clone(), Some(props))
        .map_err(|e| PipelineError::local_io(&tmp_name, e))?;

    match write_rows(&mut reader, &layout, writer, row_limit) {
        Ok(report) => {
            fs::rename(&tmp_path, out_path)
                .map_err(|e| PipelineError::local_io(&tmp_name, e))?;
            info!(
                rows_read = report.rows_read,
                rows_written = report.rows_written,
                rows_skipped = report.rows_skipped,
                region_missing = report.region_missing,
                out = %out_path.display(),
                "transform complete"
            );
            Ok(report)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn write_rows<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    layout: &Layout,
    mut writer: ArrowWriter<File>,
    row_limit: Option<usize>,
) -> Result<TransformReport, PipelineError> {
    let mut report = TransformReport::default();
    let mut rows: Vec<ByteRecord> = Vec::with_capacity(BATCH_ROWS);
    let mut kept: usize = 0;

    for record in reader.byte_records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                report.rows_read += 1;
                report.rows_skipped += 1;
                debug!(error = %e, "skipping unreadable row");
                continue;
            }
        };
        report.rows_read += 1;
        if record.len() != layout.source_width {
            report.rows_skipped += 1;
            debug!(
                row = report.rows_read,
                width = record.len(),
                expected = layout.source_width,
                "skipping row with wrong column count"
            );
            continue;
        }

        rows.push(record);
        kept += 1;
        if rows.len() == BATCH_ROWS {
            flush_batch(layout, &rows, &mut writer, &mut report)?;
            rows.clear();
        }
        if row_limit.is_some_and(|limit| kept >= limit) {
            break;
        }
    }
    if !rows.is_empty() {
        flush_batch(layout, &rows, &mut writer, &mut report)?;
    }
    writer
        .close()
        .map_err(|e| PipelineError::local_io("parquet writer", e))?;

    if report.rows_skipped > 0 || report.region_missing > 0 {
        warn!(
            rows_skipped = report.rows_skipped,
            region_missing = report.region_missing,
            "tolerated per-row anomalies"
        );
    }
    Ok(report)
}

fn flush_batch(
    layout: &Layout,
    rows: &[ByteRecord],
    writer: &mut ArrowWriter<File>,
    report: &mut TransformReport,
) -> Result<(), PipelineError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(layout.passthrough.len() + 3);

    for &idx in &layout.passthrough {
        let mut builder = StringBuilder::new();
        for row in rows {
            let value = field_str(row, idx);
            if value.is_empty() {
                builder.append_null();
            } else {
                builder.append_value(value);
            }
        }
        columns.push(Arc::new(builder.finish()));
    }

    let mut names = StringBuilder::new();
    let mut ids = Int8Builder::new();
    for row in rows {
        match region::parse(&field_str(row, layout.region_idx)) {
            RegionParse::Parsed { name, id } => {
                names.append_value(name);
                ids.append_value(id);
            }
            RegionParse::Missing => {
                report.region_missing += 1;
                names.append_null();
                ids.append_null();
            }
        }
    }
    columns.push(Arc::new(names.finish()));
    columns.push(Arc::new(ids.finish()));

    let mut timestamps = TimestampMillisecondBuilder::new();
    for row in rows {
        let raw = field_str(row, layout.timestamp_idx);
        let raw = raw.trim();
        if raw.is_empty() {
            timestamps.append_null();
        } else {
            match timestamp::parse_timestamp_millis(raw) {
                Some(millis) => timestamps.append_value(millis),
                // Whole-column cast: one bad value fails the stage.
                None => {
                    return Err(PipelineError::schema(format!(
                        "cannot parse {SOURCE_TIMESTAMP_COLUMN:?} value {raw:?} as a timestamp"
                    )))
                }
            }
        }
    }
    columns.push(Arc::new(timestamps.finish()));

    let batch = RecordBatch::try_new(layout.schema.clone(), columns)
        .map_err(|e| PipelineError::local_io("record batch", e))?;
    writer
        .write(&batch)
        .map_err(|e| PipelineError::local_io("parquet writer", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int8Array, StringArray, TimestampMillisecondArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    const HEADER: &str =
        "Service Request Type,Status,First 3 Chars of Postal Code,Creation Date,Ward";

    fn run(content: &str, row_limit: Option<usize>) -> (TempDir, Result<TransformReport, PipelineError>, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("calls.csv");
        let out_path = dir.path().join("calls.parquet");
        std::fs::write(&csv_path, content).unwrap();
        let result = transform_to_parquet(&csv_path, &out_path, row_limit);
        (dir, result, out_path)
    }

    fn read_back(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a StringArray {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
    }

    #[test]
    fn normalizes_columns_and_values() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,Open,M1B,2020-03-01 14:30:00,Scarborough-Agincourt (20)\n\
             Noise,Closed,M4C,2020-04-02 09:00:00,Toronto-Danforth (14)\n"
        );
        let (_dir, result, out) = run(&content, None);
        let report = result.unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.region_missing, 0);

        let batches = read_back(&out);
        let batch = &batches[0];
        let schema = batch.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![
                "service_request_type",
                "status",
                "fsa_code",
                "region_name",
                "region_id",
                "event_timestamp"
            ]
        );

        assert_eq!(string_col(batch, "fsa_code").value(0), "M1B");
        assert_eq!(string_col(batch, "region_name").value(0), "Scarborough-Agincourt");
        let ids = batch
            .column_by_name("region_id")
            .unwrap()
            .as_any()
            .downcast_ref::<Int8Array>()
            .unwrap();
        assert_eq!(ids.value(0), 20);
        assert_eq!(ids.value(1), 14);

        let field = batch.schema().field_with_name("event_timestamp").unwrap().clone();
        assert_eq!(
            field.data_type(),
            &DataType::Timestamp(TimeUnit::Millisecond, None)
        );
        let ts = batch
            .column_by_name("event_timestamp")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .unwrap();
        assert_eq!(ts.value(0), 1_583_073_000_000);
    }

    #[test]
    fn region_without_parenthesis_is_tolerated_as_nulls() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,Open,M1B,2020-03-01 14:30:00,Unknown\n\
             Noise,Closed,M4C,2020-04-02 09:00:00,Toronto-Danforth (14)\n"
        );
        let (_dir, result, out) = run(&content, None);
        let report = result.unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.region_missing, 1);

        let batches = read_back(&out);
        let batch = &batches[0];
        assert!(string_col(batch, "region_name").is_null(0));
        assert!(batch.column_by_name("region_id").unwrap().is_null(0));
        assert_eq!(string_col(batch, "region_name").value(1), "Toronto-Danforth");
    }

    #[test]
    fn rows_with_wrong_column_count_are_skipped() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,Open,M1B,2020-03-01 14:30:00,Scarborough-Agincourt (20)\n\
             too,few,columns\n\
             Noise,Closed,M4C,2020-04-02 09:00:00,Toronto-Danforth (14)\n"
        );
        let (_dir, result, _out) = run(&content, None);
        let report = result.unwrap();
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn missing_timestamp_column_fails_the_stage() {
        let content = "Service Request Type,Ward\nGraffiti,Toronto-Danforth (14)\n";
        let (_dir, result, out) = run(content, None);
        assert!(matches!(result.unwrap_err(), PipelineError::Schema(_)));
        assert!(!out.exists());
    }

    #[test]
    fn missing_region_column_fails_the_stage() {
        let content = "Service Request Type,Creation Date\nGraffiti,2020-03-01 14:30:00\n";
        let (_dir, result, _out) = run(content, None);
        assert!(matches!(result.unwrap_err(), PipelineError::Schema(_)));
    }

    #[test]
    fn unparseable_timestamp_value_fails_the_stage() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,Open,M1B,yesterday-ish,Scarborough-Agincourt (20)\n"
        );
        let (_dir, result, out) = run(&content, None);
        assert!(matches!(result.unwrap_err(), PipelineError::Schema(_)));
        // No partial output and no stray temp file at the destination.
        assert!(!out.exists());
        assert!(!out.with_extension("parquet.tmp").exists());
    }

    #[test]
    fn empty_timestamp_value_stays_null() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,Open,M1B,,Scarborough-Agincourt (20)\n"
        );
        let (_dir, result, out) = run(&content, None);
        assert_eq!(result.unwrap().rows_written, 1);
        let batches = read_back(&out);
        assert!(batches[0].column_by_name("event_timestamp").unwrap().is_null(0));
    }

    #[test]
    fn row_limit_caps_output() {
        let mut content = String::from(HEADER);
        content.push('\n');
        for i in 0..10 {
            content.push_str(&format!(
                "Graffiti,Open,M1B,2020-03-0{} 00:00:00,Toronto Centre (08)\n",
                (i % 9) + 1
            ));
        }
        let (_dir, result, _out) = run(&content, Some(3));
        let report = result.unwrap();
        assert_eq!(report.rows_written, 3);
    }

    #[test]
    fn duplicate_output_names_are_rejected() {
        let content = "Status,status,Creation Date,Ward\nOpen,open,2020-03-01,Toronto Centre (08)\n";
        let (_dir, result, _out) = run(content, None);
        assert!(matches!(result.unwrap_err(), PipelineError::Schema(_)));
    }

    #[test]
    fn empty_passthrough_values_become_null() {
        let content = format!(
            "{HEADER}\n\
             Graffiti,,M1B,2020-03-01 14:30:00,Toronto Centre (08)\n"
        );
        let (_dir, result, out) = run(&content, None);
        assert_eq!(result.unwrap().rows_written, 1);
        let batches = read_back(&out);
        assert!(string_col(&batches[0], "status").is_null(0));
    }
}
