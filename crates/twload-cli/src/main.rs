use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;
use twload_ingest::{
    extract_post_ids, extract_unique_user_ids, run_export, ExportFormat, LoadConfig, LoadPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "twload")]
#[command(about = "Load line-delimited platform streams into deduplicated collections")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize stream files into the data directory.
    Load {
        /// Stream file to load; repeatable.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Directory whose .json/.jsonl/.ndjson files are loaded in name order; repeatable.
        #[arg(long = "dir")]
        dirs: Vec<PathBuf>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        progress_interval: Option<u64>,
        #[arg(long)]
        max_repost_depth: Option<usize>,
    },
    /// Flatten raw posts for analysis.
    Export {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = FormatArg::Jsonl)]
        format: FormatArg,
    },
    /// Print the id of every post in a stream file.
    Ids { input: PathBuf },
    /// Print each author id of a flat export once.
    UserIds { input: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Jsonl,
    Parquet,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Jsonl => ExportFormat::Jsonl,
            FormatArg::Parquet => ExportFormat::Parquet,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("twload=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Load {
            files,
            dirs,
            data_dir,
            rules,
            progress_interval,
            max_repost_depth,
        } => {
            if files.is_empty() && dirs.is_empty() {
                bail!("nothing to load; pass --file or --dir");
            }
            let mut config = LoadConfig::from_env();
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(rules) = rules {
                config.rules_path = Some(rules);
            }
            if let Some(interval) = progress_interval {
                config.progress_interval = interval;
            }
            if let Some(depth) = max_repost_depth {
                config.max_repost_depth = depth;
            }

            let mut pipeline = LoadPipeline::open(config).await?;
            info!(run_id = %pipeline.run_id(), "load started");
            for dir in &dirs {
                pipeline.load_dir(dir).await?;
            }
            for file in &files {
                pipeline.load_file(file).await?;
            }
            let summary = pipeline.finish().await?;

            println!(
                "load complete: run_id={} files={} lines={} stored={} not_newer={} errors={} manifest={}",
                summary.run_id,
                summary.files.len(),
                summary.report.lines,
                summary.report.stored,
                summary.report.not_newer,
                summary.report.errors,
                summary.manifest_path
            );
            for (collection, records) in summary.counts.as_pairs() {
                println!("{collection}: {records}");
            }
        }
        Commands::Export {
            input,
            output,
            format,
        } => {
            let report = run_export(&input, output.as_deref(), format.into()).await?;
            if let Some(output) = &report.output {
                println!(
                    "export complete: exported={} errors={} output={} sha256={}",
                    report.exported,
                    report.errors,
                    output,
                    report.sha256.as_deref().unwrap_or_default()
                );
            }
        }
        Commands::Ids { input } => {
            let file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("opening {}", input.display()))?;
            let mut stdout = tokio::io::stdout();
            extract_post_ids(BufReader::new(file), &mut stdout).await?;
        }
        Commands::UserIds { input } => {
            let file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("opening {}", input.display()))?;
            let mut stdout = tokio::io::stdout();
            extract_unique_user_ids(BufReader::new(file), &mut stdout).await?;
        }
    }

    Ok(())
}
