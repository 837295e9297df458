// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Knowgraph CLI
//!
//! Indexes a directory of text files into one workspace and answers
//! questions against it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knowgraph_engine::knowledge_graph::WorkspaceSnapshot;
use knowgraph_engine::{EngineConfig, KnowledgeEngine, QueryMode, QueryResponse};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "knowgraph")]
#[command(about = "Knowgraph - knowledge graphs and question answering over text", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "KNOWGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    /// Workspace to index into and query
    #[arg(short, long, default_value = "default")]
    workspace: String,

    /// Restore this workspace snapshot before running the command
    #[arg(long)]
    snapshot_in: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every file in a directory and build communities
    Index {
        /// Directory of text documents
        dir: PathBuf,

        /// Write the workspace snapshot here afterwards
        #[arg(long)]
        snapshot_out: Option<PathBuf>,

        /// Drop communities smaller than this
        #[arg(long)]
        min_community_size: Option<usize>,
    },

    /// Index a directory, then answer each query
    Ask {
        /// Directory of text documents
        dir: PathBuf,

        /// Queries, one per argument
        #[arg(required = true)]
        queries: Vec<String>,

        /// Search mode: auto, global or local
        #[arg(long, default_value = "auto")]
        mode: QueryMode,
    },

    /// Index a directory, then answer queries read from stdin (one per line)
    Repl {
        /// Directory of text documents
        dir: PathBuf,

        /// Search mode: auto, global or local
        #[arg(long, default_value = "auto")]
        mode: QueryMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays parseable
    let default_filter = if cli.verbose {
        "knowgraph_engine=debug,knowgraph=debug"
    } else {
        "knowgraph_engine=info,knowgraph=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::load(cli.config.clone())?;
    if !config.llm_configured() {
        warn!(
            provider = %config.llm.provider_id,
            "No credentials for the selected LLM provider, using pattern extraction and lexical search"
        );
    }
    let engine = KnowledgeEngine::new(config).context("Failed to initialize engine")?;

    match &cli.command {
        Commands::Index {
            dir,
            snapshot_out,
            min_community_size,
        } => {
            build_workspace(&engine, &cli, dir, *min_community_size).await?;

            let stats = engine.stats(Some(&cli.workspace));
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("✓ Workspace '{}' indexed", cli.workspace);
                println!("  Entities:      {}", stats.graph.entity_count);
                println!("  Relationships: {}", stats.graph.relationship_count);
                println!("  Communities:   {}", stats.graph.community_count);
                println!("  Avg degree:    {:.2}", stats.graph.avg_degree);
            }

            if let Some(path) = snapshot_out {
                engine
                    .snapshot(&cli.workspace)?
                    .save(path)
                    .with_context(|| format!("Failed to write snapshot to {:?}", path))?;
                info!("Wrote snapshot to {:?}", path);
                if !cli.json {
                    println!("✓ Snapshot written to {:?}", path);
                }
            }
        }

        Commands::Ask { dir, queries, mode } => {
            build_workspace(&engine, &cli, dir, None).await?;

            for query in queries {
                let response = run_query(&engine, &cli.workspace, query, *mode).await;
                print_response(query, &response, cli.json)?;
            }
        }

        Commands::Repl { dir, mode } => {
            build_workspace(&engine, &cli, dir, None).await?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;

                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let query = line.trim();
                if query.is_empty() {
                    continue;
                }
                if query == "exit" || query == "quit" {
                    break;
                }

                let response = run_query(&engine, &cli.workspace, query, *mode).await;
                print_response(query, &response, cli.json)?;
            }
        }
    }

    Ok(())
}

/// Restore the snapshot (if any), ingest `dir`, then rebuild communities
async fn build_workspace(
    engine: &KnowledgeEngine,
    cli: &Cli,
    dir: &Path,
    min_community_size: Option<usize>,
) -> Result<()> {
    if let Some(path) = &cli.snapshot_in {
        let mut snapshot = WorkspaceSnapshot::load(path)
            .with_context(|| format!("Failed to read snapshot {:?}", path))?;
        snapshot.workspace_id = cli.workspace.clone();
        let (entities, relationships) = engine.restore(&snapshot)?;
        info!(entities, relationships, "Restored snapshot from {:?}", path);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut fallbacks = 0;
    for path in &files {
        let doc_id = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Skipping {:?}: {}", path, e);
                continue;
            }
        };

        let report = engine
            .ingest(&cli.workspace, &doc_id, &text, "document")
            .await;
        if report.fallback_used {
            fallbacks += 1;
        }
    }
    info!(
        documents = files.len(),
        fallbacks,
        "Ingested directory {:?}", dir
    );

    let rebuild = engine
        .rebuild_communities(&cli.workspace, min_community_size)
        .await;
    info!(
        communities = rebuild.communities_built,
        summaries = rebuild.summaries_generated,
        "Communities ready"
    );

    Ok(())
}

/// Run one query, cancelling it on Ctrl-C
async fn run_query(
    engine: &KnowledgeEngine,
    workspace: &str,
    query: &str,
    mode: QueryMode,
) -> QueryResponse {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let response = engine
        .query_with_cancel(workspace, query, mode, cancel)
        .await;
    watcher.abort();
    response
}

fn print_response(query: &str, response: &QueryResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    println!("\nQ: {}", query);
    match response {
        QueryResponse::Global {
            answer,
            communities_found,
            communities_used,
            fallback_used,
            ..
        } => {
            println!(
                "[global] {} of {} communities used{}",
                communities_used,
                communities_found,
                if *fallback_used { " (fallback)" } else { "" }
            );
            println!("{}", answer);
        }
        QueryResponse::Local {
            answer,
            start_entity,
            entities_found,
            relationships_found,
            fallback_used,
            error,
            ..
        } => {
            if let Some(error) = error {
                println!("[local] {}", error);
            } else {
                println!(
                    "[local] {} ({} entities, {} relationships){}",
                    start_entity.as_deref().unwrap_or("?"),
                    entities_found,
                    relationships_found,
                    if *fallback_used { " (fallback)" } else { "" }
                );
            }
            println!("{}", answer);
        }
    }
    Ok(())
}
