//! forkchat - Branching conversations with a local Ollama model.
//!
//! Every message lives in a tree. Any node can be branched, and a turn sends
//! only the path from the root to its node as context, so each branch is an
//! independent conversation that shares its ancestors.
//!
//! Architecture:
//! - `tree` owns the conversation arena and writes through to `storage`
//! - `ollama` talks to the model server and decodes its NDJSON stream
//! - `generation` runs one turn at a time against the tree
//! - `cli` and `server` are thin surfaces over the same core

mod batch;
mod cli;
mod config;
mod generation;
mod models;
mod names;
mod ollama;
mod server;
mod storage;
mod tree;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

/// Log to stderr so streamed replies on stdout stay clean. `RUST_LOG` wins
/// over `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("forkchat={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    execute(cli).await
}
