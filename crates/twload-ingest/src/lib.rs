//! Line-delimited stream ingestion and the load pipeline around it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use twload_normalize::{
    AnomalyLog, NormalizeOptions, NormalizeOutcome, NormalizeRules, PostNormalizer,
    DEFAULT_MAX_REPOST_DEPTH,
};
use twload_storage::{CollectionCounts, Collections, SnapshotStore, MANIFEST_FILE};
use uuid::Uuid;

mod export;
mod ids;

pub use export::{run_export, ExportFormat, ExportReport, PARQUET_LIST_COLUMNS, PARQUET_SCALAR_COLUMNS};
pub use ids::{extract_post_ids, extract_unique_user_ids};

pub const CRATE_NAME: &str = "twload-ingest";

pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000;

/// Byte-level line reader. Each line is decoded on its own, so one line that is not UTF-8
/// does not end the stream.
pub(crate) struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    /// Next line as `(line number, trimmed text)`.
    pub(crate) async fn next_line(
        &mut self,
    ) -> std::io::Result<Option<(u64, Result<&str, std::str::Utf8Error>)>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some((self.line_no, std::str::from_utf8(&self.buf).map(str::trim))))
    }
}

/// File extensions picked up when loading a directory.
pub const STREAM_EXTENSIONS: &[&str] = &["json", "jsonl", "ndjson"];

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub data_dir: PathBuf,
    pub progress_interval: u64,
    pub max_repost_depth: usize,
    pub rules_path: Option<PathBuf>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_repost_depth: DEFAULT_MAX_REPOST_DEPTH,
            rules_path: None,
        }
    }
}

impl LoadConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("TWLOAD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            progress_interval: std::env::var("TWLOAD_PROGRESS_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.progress_interval),
            max_repost_depth: std::env::var("TWLOAD_MAX_REPOST_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_repost_depth),
            rules_path: std::env::var("TWLOAD_RULES").ok().map(PathBuf::from),
        }
    }

    pub fn normalize_options(&self) -> Result<NormalizeOptions> {
        let rules = match &self.rules_path {
            Some(path) => NormalizeRules::from_path(path)?,
            None => NormalizeRules::default(),
        };
        Ok(NormalizeOptions {
            rules,
            max_repost_depth: self.max_repost_depth,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Lines read, blank ones included.
    pub lines: u64,
    pub errors: u64,
    pub stored: u64,
    pub not_newer: u64,
    /// Posts dropped for lack of an identifier.
    pub discarded: u64,
    pub anomalies: AnomalyLog,
}

impl IngestReport {
    pub fn merge(&mut self, other: &IngestReport) {
        self.lines += other.lines;
        self.errors += other.errors;
        self.stored += other.stored;
        self.not_newer += other.not_newer;
        self.discarded += other.discarded;
        self.anomalies.merge(&other.anomalies);
    }
}

/// Feeds one stream through a normalizer, a line at a time.
#[derive(Debug, Clone, Copy)]
pub struct StreamIngestor {
    progress_interval: u64,
}

impl StreamIngestor {
    pub fn new(progress_interval: u64) -> Self {
        Self { progress_interval }
    }

    /// Each line is fully normalized before the next one is read. Bad lines are counted and
    /// skipped; only read failures of the stream itself end the run.
    pub async fn ingest<R>(
        &self,
        normalizer: &mut PostNormalizer<'_>,
        source: &str,
        reader: R,
    ) -> Result<IngestReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = IngestReport::default();
        let mut lines = LineReader::new(reader);

        while let Some((line_no, line)) = lines
            .next_line()
            .await
            .with_context(|| format!("reading {source}"))?
        {
            report.lines = line_no;

            match line {
                Ok("") => {}
                Ok(line) => match normalizer.normalize_line(line) {
                    Ok(NormalizeOutcome::Stored { .. }) => report.stored += 1,
                    Ok(NormalizeOutcome::NotNewer { .. }) => report.not_newer += 1,
                    Ok(NormalizeOutcome::MissingId) => report.discarded += 1,
                    Err(err) => {
                        report.errors += 1;
                        warn!(source, line = line_no, error = %err, "skipping document");
                    }
                },
                Err(err) => {
                    report.errors += 1;
                    warn!(source, line = line_no, error = %err, "skipping line that is not UTF-8");
                }
            }

            if self.progress_interval > 0 && line_no % self.progress_interval == 0 {
                info!(source, lines = report.lines, errors = report.errors, "progress");
            }
        }

        report.anomalies = normalizer.take_anomalies();
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<String>,
    pub report: IngestReport,
    pub counts: CollectionCounts,
    pub manifest_path: String,
}

/// A load run: collections are read from the data directory, fed from any number of files,
/// then flushed back as a fresh snapshot.
pub struct LoadPipeline {
    config: LoadConfig,
    options: NormalizeOptions,
    snapshots: SnapshotStore,
    collections: Collections,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    files: Vec<String>,
    report: IngestReport,
}

impl LoadPipeline {
    pub async fn open(config: LoadConfig) -> Result<Self> {
        let options = config.normalize_options()?;
        fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let snapshots = SnapshotStore::new(&config.data_dir);
        let collections = Collections::load(&snapshots).await?;
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            data_dir = %config.data_dir.display(),
            posts = collections.counts().posts,
            "opened load run"
        );

        Ok(Self {
            config,
            options,
            snapshots,
            collections,
            run_id,
            started_at: Utc::now(),
            files: Vec::new(),
            report: IngestReport::default(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    pub async fn load_file(&mut self, path: &Path) -> Result<IngestReport> {
        let file = fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let source = path.display().to_string();
        info!(file = %source, "loading");

        let ingestor = StreamIngestor::new(self.config.progress_interval);
        let mut normalizer = PostNormalizer::new(self.collections.handles(), self.options.clone());
        let report = ingestor
            .ingest(&mut normalizer, &source, BufReader::new(file))
            .await?;
        drop(normalizer);

        info!(
            file = %source,
            lines = report.lines,
            stored = report.stored,
            not_newer = report.not_newer,
            errors = report.errors,
            "loaded"
        );
        self.report.merge(&report);
        self.files.push(source);
        Ok(report)
    }

    /// Load every stream file directly inside `dir`, in file name order.
    pub async fn load_dir(&mut self, dir: &Path) -> Result<IngestReport> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry.path();
            if path.is_file() && is_stream_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut report = IngestReport::default();
        for path in paths {
            report.merge(&self.load_file(&path).await?);
        }
        Ok(report)
    }

    pub async fn finish(self) -> Result<LoadSummary> {
        let manifest = self.collections.flush(&self.snapshots).await?;
        let counts = self.collections.counts();
        for (collection, records) in counts.as_pairs() {
            info!(collection, records, "collection summary");
        }
        info!(
            run_id = %self.run_id,
            files = self.files.len(),
            snapshot_files = manifest.files.len(),
            anomalies = self.report.anomalies.total(),
            "load run finished"
        );

        Ok(LoadSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            files: self.files,
            report: self.report,
            counts,
            manifest_path: self.snapshots.root().join(MANIFEST_FILE).display().to_string(),
        })
    }
}

fn is_stream_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| STREAM_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
