//! Flat export of a raw stream to JSONL or a Parquet snapshot.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::builder::{ListBuilder, StringBuilder, UInt64Builder};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use twload_normalize::flatten_line;
use twload_storage::SnapshotStore;

use crate::LineReader;

/// String columns of the Parquet export.
pub const PARQUET_SCALAR_COLUMNS: &[&str] = &[
    "id_str",
    "user_id_str",
    "created_at",
    "text",
    "lang",
    "retweeted_id",
    "retweeted_user_id",
    "in_reply_to_status_id_str",
    "in_reply_to_user_id_str",
];

const PARQUET_COUNT_COLUMNS: &[&str] = &["retweet_count", "favorite_count"];

/// `List<Utf8>` columns of the Parquet export.
pub const PARQUET_LIST_COLUMNS: &[&str] = &["urls", "mention_ids", "hashtags", "symbols"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Jsonl,
    Parquet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub lines: u64,
    pub exported: u64,
    pub errors: u64,
    pub output: Option<String>,
    pub sha256: Option<String>,
}

/// Flatten every post of `input`. JSONL goes to `output`, or stdout when absent; Parquet
/// needs an output path.
pub async fn run_export(
    input: &Path,
    output: Option<&Path>,
    format: ExportFormat,
) -> Result<ExportReport> {
    let (rows, mut report) = read_flat_rows(input).await?;

    match (format, output) {
        (ExportFormat::Jsonl, Some(path)) => {
            let bytes = jsonl_bytes(&rows)?;
            fs::write(path, &bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            report.sha256 = Some(SnapshotStore::sha256_hex(&bytes));
            report.output = Some(path.display().to_string());
        }
        (ExportFormat::Jsonl, None) => {
            let mut stdout = tokio::io::stdout();
            write_jsonl(&mut stdout, &rows).await?;
        }
        (ExportFormat::Parquet, Some(path)) => {
            write_flat_parquet(path, &rows)?;
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            report.sha256 = Some(SnapshotStore::sha256_hex(&bytes));
            report.output = Some(path.display().to_string());
        }
        (ExportFormat::Parquet, None) => bail!("parquet export needs an output path"),
    }

    info!(
        input = %input.display(),
        exported = report.exported,
        errors = report.errors,
        "export finished"
    );
    Ok(report)
}

async fn read_flat_rows(input: &Path) -> Result<(Vec<Map<String, JsonValue>>, ExportReport)> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut lines = LineReader::new(BufReader::new(file));
    let mut rows = Vec::new();
    let mut report = ExportReport::default();

    while let Some((line_no, line)) = lines
        .next_line()
        .await
        .with_context(|| format!("reading {}", input.display()))?
    {
        report.lines = line_no;
        match line {
            Ok("") => {}
            Ok(line) => match flatten_line(line) {
                Ok(row) => {
                    rows.push(row);
                    report.exported += 1;
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(line = line_no, error = %err, "skipping document");
                }
            },
            Err(err) => {
                report.errors += 1;
                warn!(line = line_no, error = %err, "skipping line that is not UTF-8");
            }
        }
    }
    Ok((rows, report))
}

fn jsonl_bytes(rows: &[Map<String, JsonValue>]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row).context("serializing flat post")?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

pub(crate) async fn write_jsonl<W>(writer: &mut W, rows: &[Map<String, JsonValue>]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&jsonl_bytes(rows)?)
        .await
        .context("writing flat posts")?;
    writer.flush().await.context("flushing flat posts")?;
    Ok(())
}

fn write_flat_parquet(path: &Path, rows: &[Map<String, JsonValue>]) -> Result<()> {
    let mut columns: Vec<(&str, ArrayRef)> = Vec::new();

    for name in PARQUET_SCALAR_COLUMNS {
        let mut builder = StringBuilder::new();
        for row in rows {
            match row.get(*name) {
                Some(JsonValue::String(value)) => builder.append_value(value),
                Some(JsonValue::Null) | None => builder.append_null(),
                Some(other) => builder.append_value(other.to_string()),
            }
        }
        columns.push((*name, Arc::new(builder.finish()) as ArrayRef));
    }

    for name in PARQUET_COUNT_COLUMNS {
        let mut builder = UInt64Builder::new();
        for row in rows {
            builder.append_option(row.get(*name).and_then(JsonValue::as_u64));
        }
        columns.push((*name, Arc::new(builder.finish()) as ArrayRef));
    }

    for name in PARQUET_LIST_COLUMNS {
        let mut builder = ListBuilder::new(StringBuilder::new());
        for row in rows {
            match row.get(*name).and_then(JsonValue::as_array) {
                Some(items) => {
                    for item in items {
                        match item.as_str() {
                            Some(value) => builder.values().append_value(value),
                            None => builder.values().append_value(item.to_string()),
                        }
                    }
                    builder.append(true);
                }
                None => builder.append(false),
            }
        }
        columns.push((*name, Arc::new(builder.finish()) as ArrayRef));
    }

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, array)| ArrowField::new(*name, array.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(schema, columns.into_iter().map(|(_, array)| array).collect())
        .context("building flat posts record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}
