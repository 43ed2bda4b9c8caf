use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::generator::{ContentGenerator, NoopGenerator};
use crate::openai::OpenAiGenerator;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API server.
    Serve(ServeArgs),
    /// Generate a complete ebook from the command line.
    Generate(GenerateArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Deterministic offline generator.
    Noop,
    /// OpenAI API (requires OPENAI_API_KEY).
    Openai,
}

impl Engine {
    pub fn build_generator(self) -> anyhow::Result<Arc<dyn ContentGenerator>> {
        match self {
            Self::Noop => Ok(Arc::new(NoopGenerator)),
            Self::Openai => Ok(Arc::new(OpenAiGenerator::from_env()?)),
        }
    }
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Data directory for ebook records.
    #[arg(long, default_value = "workspace")]
    pub data_dir: PathBuf,

    /// Content generation engine.
    #[arg(long, value_enum, default_value_t = Engine::Noop)]
    pub engine: Engine,

    /// Maximum concurrent generation pipelines.
    #[arg(long, default_value_t = 2)]
    pub max_concurrency: usize,

    /// Chain follow-up stages automatically in the background.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_advance: bool,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Description of the book to generate.
    #[arg(long)]
    pub description: String,

    /// Book title (default: generated from the description).
    #[arg(long)]
    pub title: Option<String>,

    /// Data directory for ebook records.
    #[arg(long, default_value = "workspace")]
    pub data_dir: PathBuf,

    /// Content generation engine.
    #[arg(long, value_enum, default_value_t = Engine::Noop)]
    pub engine: Engine,

    /// Owner recorded on the ebook.
    #[arg(long, default_value = "local")]
    pub user_id: String,
}
