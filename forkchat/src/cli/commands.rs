//! CLI command execution.
//!
//! Each invocation opens the tree from disk, applies one command, and writes
//! it back through the store. Turns stream to stdout; logs and stats go to
//! stderr.

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::batch::{apply_batch, BatchMode};
use crate::config::Settings;
use crate::generation::{LiveUpdate, Orchestrator, Turn, TurnOutcome, EMPTY_RESPONSE_MESSAGE};
use crate::models::{Tree, ROOT_ID};
use crate::names::node_label;
use crate::ollama::{ChatBackend, OllamaClient};
use crate::server;
use crate::storage::FileStorage;
use crate::tree::TreeStore;

use super::args::{Cli, Commands};

type Store = TreeStore<FileStorage>;

/// Open the file-backed store in `data_dir`, or in the default location.
fn open_store(data_dir: Option<&Path>) -> Result<Store> {
    let storage = match data_dir {
        Some(dir) => FileStorage::open_at(dir),
        None => FileStorage::open_default(),
    }
    .context("Failed to open data directory")?;
    debug!(dir = %storage.dir().display(), "using data directory");
    Ok(TreeStore::open(storage))
}

fn build_orchestrator(settings: Settings) -> Result<Orchestrator<OllamaClient>> {
    let client = OllamaClient::new(&settings.api_url).context("Failed to create HTTP client")?;
    Ok(Orchestrator::new(Arc::new(client), settings))
}

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    cli.generation.apply(&mut settings);

    let data_dir = cli.data_dir.as_deref();

    match cli.command {
        Some(Commands::Chat { message }) => chat(data_dir, settings, &message.join(" ")).await,
        Some(Commands::Branch { from, message }) => {
            branch(data_dir, settings, from.as_deref(), &message.join(" ")).await
        }
        Some(Commands::Tree { all }) => {
            let store = open_store(data_dir)?;
            print!("{}", render_tree(store.tree(), store.active_node_id(), all));
            Ok(())
        }
        Some(Commands::Show { id }) => show(&open_store(data_dir)?, id.as_deref()),
        Some(Commands::Checkout { id }) => {
            let mut store = open_store(data_dir)?;
            store.set_active(&id)?;
            println!("Active node: {id}");
            Ok(())
        }
        Some(Commands::Rename { id, name }) => {
            let mut store = open_store(data_dir)?;
            store.rename_node(&id, name.join(" "))?;
            Ok(())
        }
        Some(Commands::Collapse { id }) => {
            let mut store = open_store(data_dir)?;
            let collapsed = store.toggle_collapse(&id)?;
            println!("{id} {}", if collapsed { "collapsed" } else { "expanded" });
            Ok(())
        }
        Some(Commands::Delete { id }) => {
            let mut store = open_store(data_dir)?;
            store.delete_node(&id)?;
            println!("Deleted {id}. Active node: {}", store.active_node_id());
            Ok(())
        }
        Some(Commands::Reset { yes }) => {
            if !yes && !confirm("Discard the whole conversation tree?")? {
                println!("Aborted.");
                return Ok(());
            }
            open_store(data_dir)?.reset_tree();
            println!("Conversation tree reset.");
            Ok(())
        }
        Some(Commands::Export { output }) => export(&open_store(data_dir)?, output.as_deref()),
        Some(Commands::Import { file }) => import(data_dir, &file),
        Some(Commands::BatchImport {
            separator,
            file,
            parent,
        }) => batch(
            data_dir,
            BatchMode::Chained,
            &separator,
            file.as_deref(),
            parent.as_deref(),
        ),
        Some(Commands::BatchBranch {
            separator,
            file,
            node,
        }) => batch(
            data_dir,
            BatchMode::Siblings,
            &separator,
            file.as_deref(),
            node.as_deref(),
        ),
        Some(Commands::Models) => list_models(&settings).await,
        Some(Commands::Serve { port }) => {
            let store = open_store(data_dir)?;
            let mut orchestrator = build_orchestrator(settings)?;
            check_model(&mut orchestrator).await;
            server::start_server(port, store, orchestrator).await
        }
        None => {
            let message = cli.message.join(" ");
            if message.trim().is_empty() {
                println!("forkchat - Branching conversations with a local Ollama model");
                println!();
                println!("Usage: forkchat [OPTIONS] [MESSAGE]...");
                println!("       forkchat <COMMAND>");
                println!();
                println!("Run `forkchat --help` for the list of commands.");
                return Ok(());
            }
            chat(data_dir, settings, &message).await
        }
    }
}

async fn chat(data_dir: Option<&Path>, settings: Settings, message: &str) -> Result<()> {
    let mut store = open_store(data_dir)?;
    let mut orchestrator = build_orchestrator(settings)?;
    check_model(&mut orchestrator).await;

    let turn = orchestrator
        .prepare_submit(&mut store, message)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    stream_turn(&mut orchestrator, &mut store, turn).await
}

async fn branch(
    data_dir: Option<&Path>,
    settings: Settings,
    from: Option<&str>,
    message: &str,
) -> Result<()> {
    let mut store = open_store(data_dir)?;
    let mut orchestrator = build_orchestrator(settings)?;
    check_model(&mut orchestrator).await;

    let from = from.map_or_else(|| store.active_node_id().to_string(), String::from);
    let turn = orchestrator
        .prepare_branch(&mut store, &from, message)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    eprintln!("Branch: {}", turn.target());
    stream_turn(&mut orchestrator, &mut store, turn).await
}

/// Switch to an available model if the configured one is missing. A server
/// that cannot be asked is reported when the turn itself fails.
async fn check_model<B: ChatBackend>(orchestrator: &mut Orchestrator<B>) {
    if let Err(e) = orchestrator.validate_model().await {
        debug!(error = %e, "could not list models");
    }
}

/// Run `turn`, printing the reply as it arrives. Ctrl-C stops the turn
/// without committing anything.
async fn stream_turn(
    orchestrator: &mut Orchestrator<OllamaClient>,
    store: &mut Store,
    turn: Turn,
) -> Result<()> {
    let token = turn.cancel_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = orchestrator
        .run_turn(store, turn, |update| {
            if let LiveUpdate::Delta { content, .. } = update {
                let _ = write!(stdout, "{content}");
                let _ = stdout.flush();
            }
        })
        .await;
    watcher.abort();
    println!();

    match outcome {
        TurnOutcome::Committed { stats, .. } => {
            if let Some(stats) = stats {
                eprintln!("[{stats}]");
            }
            Ok(())
        }
        TurnOutcome::Cancelled => {
            eprintln!("Generation stopped. Nothing was saved.");
            Ok(())
        }
        TurnOutcome::Empty => bail!(EMPTY_RESPONSE_MESSAGE),
        TurnOutcome::Failed(e) => {
            if let Some(detail) = e.detail() {
                eprintln!("Details: {detail}");
            }
            bail!(e.user_message())
        }
    }
}

fn show(store: &Store, id: Option<&str>) -> Result<()> {
    let id = id.unwrap_or_else(|| store.active_node_id());
    if !store.contains(id) {
        bail!("Node not found: {id}");
    }

    for node in store.path(id) {
        println!("── {} ({})", node_label(node), node.id);
        for message in &node.messages {
            println!("[{}]", message.role);
            println!("{}", message.content);
            println!();
        }
    }
    Ok(())
}

/// Indented outline of the tree. The active node is starred; children of
/// collapsed nodes are summarized unless `all` is set.
fn render_tree(tree: &Tree, active: &str, all: bool) -> String {
    let mut out = String::new();
    // (node id, depth); children pushed in reverse to keep sibling order.
    let mut stack = vec![(ROOT_ID, 0usize)];
    let mut visited = 0;

    while let Some((id, depth)) = stack.pop() {
        let Some(node) = tree.get(id) else { continue };
        visited += 1;
        if visited > tree.len() {
            break;
        }

        let marker = if id == active { "*" } else { " " };
        let _ = write!(
            out,
            "{marker} {}{} ({})",
            "  ".repeat(depth),
            node_label(node),
            node.id
        );

        if node.is_collapsed && !all && !node.children_ids.is_empty() {
            let _ = writeln!(out, " [+{} hidden]", node.children_ids.len());
            continue;
        }
        out.push('\n');
        for child in node.children_ids.iter().rev() {
            stack.push((child.as_str(), depth + 1));
        }
    }
    out
}

fn export(store: &Store, output: Option<&Path>) -> Result<()> {
    let json = store.export_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} nodes to {}", store.tree().len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn import(data_dir: Option<&Path>, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let candidate: serde_json::Value =
        serde_json::from_str(&content).context("Import file is not valid JSON")?;

    let mut store = open_store(data_dir)?;
    store.load_tree(candidate)?;
    println!("Imported {} nodes.", store.tree().len());
    Ok(())
}

fn batch(
    data_dir: Option<&Path>,
    mode: BatchMode,
    separator: &str,
    file: Option<&Path>,
    parent: Option<&str>,
) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read stdin")?;
            text
        }
    };

    let mut store = open_store(data_dir)?;
    let parent = parent.map_or_else(|| store.active_node_id().to_string(), String::from);
    let ids = apply_batch(&mut store, mode, &text, separator, &parent)?;

    println!("Created {} nodes under {parent}.", ids.len());
    println!("Active node: {}", store.active_node_id());
    Ok(())
}

async fn list_models(settings: &Settings) -> Result<()> {
    let client = OllamaClient::new(&settings.api_url).context("Failed to create HTTP client")?;
    let models = client
        .list_models()
        .await
        .with_context(|| format!("Failed to list models at {}", client.base_url()))?;

    if models.is_empty() {
        println!("No models installed. Pull one with `ollama pull <model>`.");
        return Ok(());
    }
    for model in models {
        let marker = if model == settings.model { "*" } else { " " };
        println!("{marker} {model}");
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, TreeNode};

    fn tree() -> Tree {
        let mut tree = crate::models::fresh_tree();
        for (id, parent) in [("a", ROOT_ID), ("b", ROOT_ID), ("c", "a")] {
            tree.insert(
                id.to_string(),
                TreeNode::leaf(id.to_string(), parent.to_string(), Message::user(id)),
            );
            tree.get_mut(parent).unwrap().children_ids.push(id.to_string());
        }
        tree
    }

    #[test]
    fn renders_outline_in_sibling_order() {
        let rendered = render_tree(&tree(), "c", false);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("(root)"));
        assert_eq!(lines[1], "    a (a)");
        assert_eq!(lines[2], "*     c (c)");
        assert_eq!(lines[3], "    b (b)");
    }

    #[test]
    fn collapsed_nodes_hide_children() {
        let mut tree = tree();
        tree.get_mut("a").unwrap().is_collapsed = true;

        let rendered = render_tree(&tree, ROOT_ID, false);
        assert!(rendered.contains("a (a) [+1 hidden]"));
        assert!(!rendered.contains("(c)"));

        assert!(render_tree(&tree, ROOT_ID, true).contains("(c)"));
    }
}
