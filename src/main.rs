//! # docchat CLI
//!
//! The `docchat` binary starts the HTTP API and offers one-shot commands
//! for refreshing, listing, searching, and asking questions of the document
//! folder.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Write an example configuration file |
//! | `docchat serve` | Start the HTTP API and the background refresher |
//! | `docchat refresh` | Extract and embed the folder once, print counts |
//! | `docchat files` | List the files that were extracted |
//! | `docchat search "<query>"` | Search without the model |
//! | `docchat ask "<question>"` | Answer one question with the model |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docchat::{commands, config, logging, server};

/// docchat: retrieval-augmented chat over a folder of documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `docchat init` for a commented example.
#[derive(Parser)]
#[command(name = "docchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file to the `--config` path.
    Init,

    /// Start the HTTP API.
    ///
    /// Binds to `[server].bind`, refreshes the document folder right away and
    /// then every `[files].refresh_interval_secs`. Stops on Ctrl-C.
    Serve,

    /// Extract, chunk, and embed the document folder once.
    Refresh,

    /// List the files currently readable from the document folder.
    Files,

    /// Search the documents without asking the model.
    Search {
        /// Search query text.
        query: String,

        /// Search mode: `semantic` (embeddings), `exact` (literal), or
        /// `loose` (keywords).
        #[arg(long, default_value = "semantic")]
        mode: String,

        /// Maximum number of results (defaults to `[retrieval].top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer one question with the model. Nothing is stored.
    Ask {
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return commands::run_init(&cli.config);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Refresh => commands::run_refresh(&cfg).await?,
        Commands::Files => commands::run_files(&cfg).await?,
        Commands::Search { query, mode, limit } => {
            commands::run_search(&cfg, &query, &mode, limit).await?
        }
        Commands::Ask { question } => commands::run_ask(&cfg, &question).await?,
    }

    Ok(())
}
