use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    booksmith::logging::init().context("init logging")?;

    let cli = booksmith::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        booksmith::cli::Command::Serve(args) => {
            booksmith::app::server::run(args).await.context("serve")?;
        }
        booksmith::cli::Command::Generate(args) => {
            booksmith::generate::run(args).await.context("generate")?;
        }
    }

    Ok(())
}
