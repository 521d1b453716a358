//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::batch::{DEFAULT_CHAIN_SEPARATOR, DEFAULT_SIBLING_SEPARATOR};
use crate::config::Settings;

/// forkchat - Branching conversations with a local Ollama model
#[derive(Parser, Debug)]
#[command(name = "forkchat")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // === Storage / Config Options ===
    /// Config file (defaults to <config dir>/forkchat/config.toml)
    #[arg(long, global = true, env = "FORKCHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the conversation tree
    #[arg(long, global = true, env = "FORKCHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(flatten)]
    pub generation: GenerationArgs,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Message to send on the active branch (same as `chat`)
    #[arg(trailing_var_arg = true)]
    pub message: Vec<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Overrides for the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct GenerationArgs {
    /// Model to use (e.g., llama3, mistral)
    #[arg(short, long, global = true, env = "FORKCHAT_MODEL")]
    pub model: Option<String>,

    /// Base URL of the Ollama server
    #[arg(long, global = true, env = "OLLAMA_HOST")]
    pub api_url: Option<String>,

    /// System prompt prepended to every request
    #[arg(long, global = true)]
    pub system_prompt: Option<String>,

    /// Sampling temperature
    #[arg(long, global = true)]
    pub temperature: Option<f32>,

    /// Output token cap; 0 or less means unlimited
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub max_tokens: Option<i64>,

    /// Number of recent messages sent as context; 0 sends all
    #[arg(long, global = true)]
    pub history_length: Option<usize>,
}

impl GenerationArgs {
    /// Apply the flags that were given on top of `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.model.clone_from(model);
        }
        if let Some(url) = &self.api_url {
            settings.api_url.clone_from(url);
        }
        if let Some(prompt) = &self.system_prompt {
            settings.system_prompt.clone_from(prompt);
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_output_tokens = max_tokens;
        }
        if let Some(history_length) = self.history_length {
            settings.history_length = history_length;
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message on the active branch and stream the reply
    Chat {
        /// Message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Start a new branch from a node and stream the reply there
    Branch {
        /// Node to branch from (defaults to the active node)
        #[arg(short, long)]
        from: Option<String>,

        /// Message that opens the branch
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Show the conversation tree
    Tree {
        /// Also list nodes under collapsed branches
        #[arg(short, long)]
        all: bool,
    },

    /// Show the conversation from the root to a node
    Show {
        /// Node to show (defaults to the active node)
        id: Option<String>,
    },

    /// Make a node the active one
    Checkout {
        /// Node to activate
        id: String,
    },

    /// Set a node's display name
    Rename {
        /// Node to rename
        id: String,

        /// New name (may be empty)
        #[arg(trailing_var_arg = true)]
        name: Vec<String>,
    },

    /// Collapse or expand a node in the tree view
    Collapse {
        /// Node to toggle
        id: String,
    },

    /// Delete a leaf node
    Delete {
        /// Node to delete
        id: String,
    },

    /// Discard the whole tree and start over
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Write the tree as JSON
    Export {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the tree with one read from a JSON file
    Import {
        /// File to import
        file: PathBuf,
    },

    /// Import a pasted conversation as a chain of alternating user/assistant nodes
    BatchImport {
        /// Separator between messages; `\n` and `\t` are unescaped
        #[arg(short, long, default_value = DEFAULT_CHAIN_SEPARATOR)]
        separator: String,

        /// Read text from a file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Node to attach the chain to (defaults to the active node)
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Create one user branch per chunk under a node
    BatchBranch {
        /// Separator between prompts; `\n` and `\t` are unescaped
        #[arg(short, long, default_value = DEFAULT_SIBLING_SEPARATOR)]
        separator: String,

        /// Read text from a file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Node to branch from (defaults to the active node)
        #[arg(short, long)]
        node: Option<String>,
    },

    /// List models installed on the Ollama server
    Models,

    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "58231")]
        port: u16,
    },
}
