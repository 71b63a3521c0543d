//! Command-line interface.
//!
//! Thin shell over the library: every command builds the shared
//! collaborators (store, gateway, config), runs one operation, and prints
//! the JSON envelope.

// The CLI is the one place that writes to stdout.
#![allow(clippy::print_stdout)]

use crate::config::GraphtogConfig;
use crate::index::IndexingPipeline;
use crate::llm::LlmGateway;
use crate::models::Envelope;
use crate::query::QueryService;
use crate::resolve::EntityResolver;
use crate::retrieve::{QueryCategory, Retriever};
use crate::storage::{GraphStore, MemoryGraphStore, SqliteGraphStore};
use crate::tog::{PruningMethod, ToGReasoner};
use crate::community::CommunitySummarizer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// GraphRAG question answering over a property-graph knowledge base.
#[derive(Debug, Parser)]
#[command(name = "graphtog", version, about)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config; defaults to the platform
    /// data directory).
    #[arg(long, global = true, env = "GRAPHTOG_GRAPH_DB_PATH")]
    db: Option<PathBuf>,

    /// Keep the graph in memory only (no persistence).
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index a Markdown file into the knowledge graph.
    Index {
        /// Markdown file to ingest.
        file: PathBuf,
    },
    /// Answer a question with adaptive retrieval.
    Query {
        /// The question.
        question: String,
        /// Restrict retrieval to one document id.
        #[arg(long)]
        document: Option<String>,
    },
    /// Answer a question with multi-hop ToG reasoning.
    Tog {
        /// The question.
        question: String,
        /// Maximum hops (1-5).
        #[arg(long)]
        depth: Option<u32>,
        /// Relations explored per hop.
        #[arg(long)]
        width: Option<usize>,
        /// Pruning method: llm, bm25, or sentence_bert.
        #[arg(long)]
        pruning: Option<String>,
    },
    /// Run one retrieval mode directly, without answer generation.
    Retrieve {
        /// Retrieval mode: local, community, global, hierarchical, or
        /// adaptive.
        #[arg(long, default_value = "local")]
        mode: String,
        /// Seed entity name (local/community) or query text
        /// (hierarchical/adaptive); ignored for global.
        #[arg(default_value = "")]
        target: String,
        /// Hop limit for local retrieval.
        #[arg(long, default_value_t = 2)]
        hops: u32,
    },
    /// List communities, optionally generating missing summaries.
    Communities {
        /// Generate summaries for stale or unsummarized communities.
        #[arg(long)]
        summarize: bool,
    },
    /// Report duplicate entity pairs, optionally merging them.
    Resolve {
        /// Apply merges instead of only reporting pairs.
        #[arg(long)]
        apply: bool,
    },
    /// Print graph statistics.
    Stats,
}

/// Runs the CLI.
///
/// # Errors
///
/// Returns an error for configuration, I/O, or engine failures; the process
/// exit code follows from it.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GraphtogConfig::from_toml_file(path)?,
        None => GraphtogConfig::from_env(),
    };
    if let Some(db) = &cli.db {
        config.graph.db_path = Some(db.display().to_string());
    }
    config.validate()?;

    let store: Arc<dyn GraphStore> = if cli.ephemeral {
        Arc::new(MemoryGraphStore::new())
    } else {
        let path = match &config.graph.db_path {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Arc::new(SqliteGraphStore::new(&path)?)
    };
    let gateway = Arc::new(LlmGateway::from_config(&config.llm)?);

    match cli.command {
        Command::Index { file } => {
            let pipeline = IndexingPipeline::new(store, gateway, config)?;
            let report = pipeline.index_file(&file);
            print_envelope(&Envelope::from(report));
        },
        Command::Query { question, document } => {
            let service = QueryService::new(store, gateway, config);
            let envelope = service.process(&question, document.as_deref());
            print_envelope(&envelope);
        },
        Command::Tog {
            question,
            depth,
            width,
            pruning,
        } => {
            let mut tog_config = config.tog.clone();
            if let Some(depth) = depth {
                tog_config.search_depth = depth;
            }
            if let Some(width) = width {
                tog_config.search_width = width;
            }
            if let Some(method) = pruning.as_deref().and_then(PruningMethod::parse) {
                tog_config.pruning_method = method;
            }
            tog_config.validate()?;

            let reasoner = ToGReasoner::new(store, gateway);
            let outcome = reasoner.process_query(&question, &tog_config);
            print_envelope(&Envelope::success(outcome));
        },
        Command::Retrieve { mode, target, hops } => {
            let retriever = Retriever::new(store.clone(), gateway.clone());
            let json = match mode.as_str() {
                "local" => serde_json::to_value(retriever.local(&target, hops)?)?,
                "community" => serde_json::to_value(retriever.community(&target)?)?,
                "global" => serde_json::to_value(retriever.global()?)?,
                "hierarchical" => serde_json::to_value(retriever.hierarchical(&target)?)?,
                "adaptive" => {
                    // Classify first so the category picks the levels.
                    let service = QueryService::new(store, gateway, config);
                    let category = service
                        .classify(&target)
                        .map_or(QueryCategory::Exploratory, |c| c.category);
                    serde_json::to_value(retriever.adaptive(&target, category)?)?
                },
                other => anyhow::bail!("unknown retrieval mode: {other}"),
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        },
        Command::Communities { summarize } => {
            if summarize {
                let summarizer = CommunitySummarizer::new(store.clone(), gateway);
                let report = summarizer.summarize_all(None, false);
                print_envelope(&Envelope::from(report));
            }
            let communities = store.list_communities(None);
            print_envelope(&Envelope::from(communities));
        },
        Command::Resolve { apply } => {
            let resolver = EntityResolver::new(
                store,
                config.resolution.use_llm.then(|| gateway.clone()),
                config.resolution,
            );
            if apply {
                print_envelope(&Envelope::from(resolver.resolve_all(true)));
            } else {
                print_envelope(&Envelope::from(resolver.find_duplicate_pairs(None, None)));
            }
        },
        Command::Stats => {
            print_envelope(&Envelope::from(store.graph_statistics()));
        },
    }

    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "graphtog", "graphtog")
        .ok_or_else(|| anyhow::anyhow!("cannot determine a data directory"))?;
    Ok(dirs.data_dir().join("graph.db"))
}

fn print_envelope<T: serde::Serialize>(envelope: &Envelope<T>) {
    match serde_json::to_string_pretty(envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{{\"status\":\"error\",\"error\":{{\"kind\":\"INTERNAL\",\"message\":\"{e}\"}}}}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_index() {
        let cli = Cli::try_parse_from(["graphtog", "index", "notes.md"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parses_tog_options() {
        let cli = Cli::try_parse_from([
            "graphtog",
            "tog",
            "where does alice work?",
            "--depth",
            "2",
            "--pruning",
            "bm25",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        let cli = Cli::try_parse_from(["graphtog", "frobnicate"]);
        assert!(cli.is_err());
    }
}
