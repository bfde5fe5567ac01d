//! Identifier listings over line-delimited files.

use std::collections::HashSet;
use std::str::Utf8Error;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::LineReader;

/// Write the `id_str` of every post, one per line. Returns how many were written.
pub async fn extract_post_ids<R, W>(reader: R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut lines = LineReader::new(reader);
    while let Some((line_no, line)) = lines.next_line().await.context("reading posts")? {
        if let Some(id) = string_field(line, line_no, "id_str") {
            emit(writer, &id).await?;
            written += 1;
        }
    }
    writer.flush().await.context("flushing ids")?;
    Ok(written)
}

/// Write each distinct `user_id_str` of a flat export once, in first-seen order.
pub async fn extract_unique_user_ids<R, W>(reader: R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut seen = HashSet::new();
    let mut lines = LineReader::new(reader);
    while let Some((line_no, line)) = lines.next_line().await.context("reading flat posts")? {
        let Some(id) = string_field(line, line_no, "user_id_str") else {
            continue;
        };
        if seen.insert(id.clone()) {
            emit(writer, &id).await?;
        }
    }
    writer.flush().await.context("flushing ids")?;
    Ok(seen.len() as u64)
}

fn string_field(line: Result<&str, Utf8Error>, line_no: u64, field: &str) -> Option<String> {
    let line = match line {
        Ok("") => return None,
        Ok(line) => line,
        Err(err) => {
            warn!(line = line_no, error = %err, "skipping line that is not UTF-8");
            return None;
        }
    };
    let value: JsonValue = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!(line = line_no, error = %err, "skipping document");
            return None;
        }
    };
    value.get(field).and_then(JsonValue::as_str).map(str::to_string)
}

async fn emit<W: AsyncWrite + Unpin>(writer: &mut W, id: &str) -> Result<()> {
    writer
        .write_all(format!("{id}\n").as_bytes())
        .await
        .context("writing id")
}
