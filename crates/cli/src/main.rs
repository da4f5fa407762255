//! codequery CLI — index repositories and ask questions from the terminal.
//!
//! Calls `codequery-core` directly with no server overhead.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use codequery_core::config::Config;
use codequery_core::engine::{Engine, RetrieveOptions};
use codequery_core::llm::HttpChatModel;

/// codequery CLI — ask questions about indexed codebases.
#[derive(Parser)]
#[command(name = "cq", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./codequery.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index (or re-index) a repository
    Index {
        /// Repository root directory
        root: PathBuf,

        /// Name for the repository (default: directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Ask a question about the indexed repositories
    Query {
        /// The question
        question: String,

        /// Restrict to specific repositories (comma-separated)
        #[arg(long)]
        repos: Option<String>,

        /// Force the iterative agent on or off
        #[arg(long)]
        agency: Option<bool>,

        /// Maximum results to print
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List indexed repositories
    Repos,
    /// Remove a repository and its index files
    Remove {
        /// Repository name
        name: String,
    },
}

fn load_config(path: Option<PathBuf>) -> Config {
    match path {
        Some(p) => Config::load(&p).unwrap_or_else(|e| {
            eprintln!("Could not load config {}: {e}", p.display());
            std::process::exit(1);
        }),
        None => Config::load_or_default(&std::env::current_dir().unwrap_or_default()),
    }
}

fn build_engine(config: Config) -> Engine {
    let engine = Engine::new(config.clone()).unwrap_or_else(|e| {
        eprintln!("Could not open index: {e}");
        std::process::exit(1);
    });
    // The chat model is optional: without an API key the engine still serves
    // standard retrieval, just without agency mode or LLM enhancement.
    match HttpChatModel::new(config.llm) {
        Ok(chat) => engine.with_chat_model(Arc::new(chat)),
        Err(e) => {
            tracing::debug!("chat model unavailable: {e}");
            engine
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codequery=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone());

    match cli.command {
        Commands::Index { root, name } => {
            let root = root.canonicalize().unwrap_or_else(|_| {
                eprintln!("Repository root not found: {}", root.display());
                std::process::exit(1);
            });
            let name = name.unwrap_or_else(|| {
                root.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("repo")
                    .to_string()
            });

            let mut engine = build_engine(config);
            match engine.index_repository(&name, &root) {
                Ok(count) => {
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::json!({ "repo": name, "elements": count })
                        );
                    } else {
                        println!("Indexed '{name}': {count} elements");
                    }
                }
                Err(e) => {
                    eprintln!("Indexing failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Query { question, repos, agency, limit } => {
            let mut engine = build_engine(config);
            let options = RetrieveOptions {
                repo_filter: repos.map(|r| {
                    r.split(',').map(|s| s.trim().to_string()).collect()
                }),
                use_agency: agency,
                ..Default::default()
            };

            let (elements, metadata) = engine.retrieve(&question, &options);

            if cli.json {
                let output = serde_json::json!({
                    "elements": elements,
                    "metadata": metadata,
                });
                println!("{}", serde_json::to_string_pretty(&output).unwrap());
                return;
            }

            if let Some(diag) = &metadata.diagnostic {
                eprintln!("Note: {diag}");
            }
            if elements.is_empty() {
                eprintln!("No results.");
                std::process::exit(1);
            }
            for (i, e) in elements.iter().take(limit).enumerate() {
                let elem = &e.element;
                println!(
                    "{:>2}. {:<50} {:>8.3}  [{}] {}:{}-{}",
                    i + 1,
                    format!(
                        "{}/{}{}",
                        elem.repo_name,
                        elem.relative_path,
                        if elem.name.is_empty() {
                            String::new()
                        } else {
                            format!(":{}", elem.name)
                        }
                    ),
                    e.total_score(),
                    elem.element_type.as_str(),
                    elem.language,
                    elem.start_line,
                    elem.end_line,
                );
            }
            if let Some(reason) = metadata.stopping_reason {
                eprintln!(
                    "\n{} elements, mode {}, stopped: {}",
                    metadata.element_count,
                    metadata.mode,
                    reason.as_str()
                );
            } else {
                eprintln!("\n{} elements, mode {}", metadata.element_count, metadata.mode);
            }
        }
        Commands::Repos => {
            let engine = build_engine(config);
            let repos = engine.repositories();
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "repos": repos,
                        "total_elements": engine.indexed_element_count(),
                    })
                );
            } else if repos.is_empty() {
                eprintln!("No repositories indexed.");
            } else {
                for name in &repos {
                    let root = engine
                        .repo_root(name)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    println!("{name:<24} {root}");
                }
                eprintln!("\n{} repos, {} indexed elements", repos.len(), engine.indexed_element_count());
            }
        }
        Commands::Remove { name } => {
            let mut engine = build_engine(config);
            match engine.remove_repository(&name) {
                Ok(true) => println!("Removed '{name}'"),
                Ok(false) => {
                    eprintln!("Unknown repository '{name}'");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Remove failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
