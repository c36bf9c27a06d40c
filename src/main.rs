mod config;
mod init;

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use quarry_index::indexer::IndexEvent;
use quarry_index::query::QueryOptions;
use quarry_store::RepoId;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Ask questions about a remote code repository")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a repository (owner/name or owner/name@branch).
    Index { repo: String },
    /// Index several repositories with bounded concurrency.
    Batch { repos: Vec<String> },
    /// Ask a question about an indexed repository.
    Query {
        repo: String,
        question: String,
        /// Restrict retrieval to one language (e.g. rust, python).
        #[arg(long)]
        language: Option<String>,
        /// Number of chunks to retrieve (max 50).
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Show the latest index job for a repository.
    Status { repo: String },
    /// List known repositories.
    List,
}

fn parse_repo(spec: &str) -> anyhow::Result<RepoId> {
    RepoId::from_str(spec).map_err(|e| anyhow::anyhow!(e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::Config::load(&cli.config)?;
    let app = init::build(&config).await?;

    match cli.command {
        Command::Index { repo } => {
            let repo = parse_repo(&repo)?;

            let mut events = app.indexer.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        IndexEvent::Stage { state, .. } => eprintln!("stage: {state}"),
                        IndexEvent::FileProcessed {
                            files_processed,
                            files_total,
                            ..
                        } => eprintln!("files: {files_processed}/{files_total}"),
                        _ => {}
                    }
                }
            });

            let report = app.indexer.index(&repo).await?;
            println!(
                "indexed {repo}: {} files, {} chunks in {} ms",
                report.files_indexed, report.chunks_written, report.duration_ms
            );
            if !report.errors.is_empty() {
                println!("skipped {} items:", report.errors.len());
                for error in &report.errors {
                    println!("  {error}");
                }
            }
        }
        Command::Batch { repos } => {
            let repos = repos
                .iter()
                .map(|s| parse_repo(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let outcomes = app.indexer.batch_index(&repos).await;
            for (repo, result) in outcomes {
                match result {
                    Ok(report) => println!("{repo}: ok ({} chunks)", report.chunks_written),
                    Err(e) => println!("{repo}: failed ({e})"),
                }
            }
        }
        Command::Query {
            repo,
            question,
            language,
            top_k,
        } => {
            let repo = parse_repo(&repo)?;
            let options = QueryOptions { top_k, language };
            let result = app.query.query(&question, &repo, &options).await?;

            println!("{}", result.answer);
            println!();
            println!(
                "confidence: {} ({} ms)",
                result.confidence, result.processing_time_ms
            );
            for source in &result.sources {
                println!(
                    "  {}:{}-{} (similarity {:.2})",
                    source.file_path, source.start_line, source.end_line, source.similarity
                );
            }
        }
        Command::Status { repo } => {
            let repo = parse_repo(&repo)?;
            match app.indexer.get_status(&repo).await? {
                Some(job) => {
                    println!("{}: {}", job.repository, job.state);
                    println!("  files: {}/{}", job.files_processed, job.files_total);
                    println!("  chunks: {}", job.chunks_written);
                    println!("  started: {}", job.started_at.to_rfc3339());
                    if let Some(finished) = job.finished_at {
                        println!("  finished: {}", finished.to_rfc3339());
                    }
                    if let Some(error) = job.error {
                        println!("  error: {error}");
                    }
                }
                None => println!("{repo}: never indexed"),
            }
        }
        Command::List => {
            let repos = app.indexer.list_repositories().await?;
            if repos.is_empty() {
                println!("no repositories indexed yet");
            }
            for repo in repos {
                let indexed = repo
                    .last_indexed_at
                    .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339());
                println!(
                    "{}/{}@{} (last indexed: {indexed})",
                    repo.owner, repo.name, repo.branch
                );
            }
        }
    }

    Ok(())
}
