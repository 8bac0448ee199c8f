//! plexmix - Mirror Plex audio playlists to a local music library

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod export;
mod library;
mod media;
mod plex;
mod sync;

use cli::commands::ConfigChanges;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "plexmix=debug,reqwest=debug"
    } else {
        "plexmix=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Auth { url, token, force } => {
            cli::commands::auth(url, token, force).await?;
        }
        Commands::List => {
            cli::commands::list().await?;
        }
        Commands::Enable { indices, all } => {
            cli::commands::enable(indices, all).await?;
        }
        Commands::Ignore { indices, all } => {
            cli::commands::ignore(indices, all).await?;
        }
        Commands::Download {
            force,
            clean,
            formats,
        } => {
            cli::commands::download(force, clean, formats).await?;
        }
        Commands::Itunes { formats } => {
            cli::commands::itunes(formats).await?;
        }
        Commands::Config {
            library,
            playlists,
            itunes,
            threads,
            subfolders,
            formats,
        } => {
            cli::commands::config(ConfigChanges {
                library,
                playlists,
                itunes,
                threads,
                subfolders,
                formats,
            })?;
        }
        Commands::Completion { shell } => {
            cli::commands::completion(shell);
        }
    }

    Ok(())
}
