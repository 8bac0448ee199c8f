//! CLI module for plexmix

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod auth;
pub mod commands;

pub use auth::AuthManager;

#[derive(Parser, Debug)]
#[command(name = "plexmix", about = "Mirror Plex audio playlists to a local library")]
#[command(version, author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configure Plex server credentials
    Auth {
        /// Plex server URL
        #[arg(long, env = "PLEX_URL")]
        url: Option<String>,

        /// Plex access token
        #[arg(short, long, env = "PLEX_TOKEN")]
        token: Option<String>,

        /// Force re-authentication (ignore stored credentials)
        #[arg(long)]
        force: bool,
    },

    /// List audio playlists on the server
    List,

    /// Mark playlists for download, by index from `list`
    Enable {
        #[arg(value_name = "INDEX", required_unless_present = "all")]
        indices: Vec<usize>,

        /// Enable every playlist
        #[arg(long)]
        all: bool,
    },

    /// Ignore playlists, by index from `list`
    Ignore {
        #[arg(value_name = "INDEX", required_unless_present = "all")]
        indices: Vec<usize>,

        /// Ignore every playlist
        #[arg(long)]
        all: bool,
    },

    /// Download saved playlists and export them
    Download {
        /// Transfer every track again, even if complete on disk
        #[arg(short, long)]
        force: bool,

        /// Remove files and exports no saved playlist refers to
        #[arg(long)]
        clean: bool,

        /// Export format (m3u8, json, itunes); repeatable, overrides the config
        #[arg(long = "format", value_name = "FORMAT")]
        formats: Vec<String>,
    },

    /// Rebuild exports from tracks already downloaded, without transferring
    Itunes {
        /// Export format (m3u8, json, itunes); repeatable, defaults to itunes
        #[arg(long = "format", value_name = "FORMAT")]
        formats: Vec<String>,
    },

    /// Show or change configuration
    Config {
        /// Root directory of the local track mirror
        #[arg(long)]
        library: Option<PathBuf>,

        /// Directory for m3u8/json playlist files
        #[arg(long)]
        playlists: Option<PathBuf>,

        /// Directory for the iTunes library file
        #[arg(long)]
        itunes: Option<PathBuf>,

        /// Number of parallel downloads
        #[arg(long)]
        threads: Option<usize>,

        /// Store tracks as artist/album/file
        #[arg(long)]
        subfolders: Option<bool>,

        /// Default export formats
        #[arg(long = "format", value_name = "FORMAT")]
        formats: Vec<String>,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_formats_repeat() {
        let cli = Cli::parse_from([
            "plexmix", "download", "--clean", "--format", "m3u8", "--format", "itunes",
        ]);
        match cli.command {
            Commands::Download {
                force,
                clean,
                formats,
            } => {
                assert!(!force);
                assert!(clean);
                assert_eq!(formats, ["m3u8", "itunes"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_enable_requires_index_or_all() {
        assert!(Cli::try_parse_from(["plexmix", "enable"]).is_err());
        assert!(Cli::try_parse_from(["plexmix", "enable", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["plexmix", "enable", "0", "2"]).is_ok());
    }

    #[test]
    fn test_itunes_defaults_to_no_formats() {
        let cli = Cli::parse_from(["plexmix", "itunes"]);
        assert!(matches!(cli.command, Commands::Itunes { formats } if formats.is_empty()));
    }
}
