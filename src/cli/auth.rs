//! Keyring-based credential storage for Plex

use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use keyring::Entry;
use tracing::{debug, info};

use crate::plex::PlexClient;

const KEYRING_SERVICE: &str = "plexmix";

/// Plex server address and access token
#[derive(Debug, Clone)]
pub struct PlexCredentials {
    pub url: String,
    pub token: String,
}

impl PlexCredentials {
    pub fn client(&self) -> Result<PlexClient> {
        PlexClient::new(&self.url, &self.token)
    }
}

/// Manages authentication credentials storage
pub struct AuthManager;

impl AuthManager {
    /// Authenticate with a Plex server
    ///
    /// Tries to load credentials from keyring first, or prompts for new ones.
    /// Verifies credentials work before storing.
    pub async fn authenticate(
        url: Option<String>,
        token: Option<String>,
        force: bool,
    ) -> Result<PlexCredentials> {
        if !force {
            if let Ok(creds) = Self::load() {
                info!("Found existing credentials in keyring");
                return Ok(creds);
            }
        } else {
            debug!("Force flag set, ignoring stored credentials");
        }

        let url = match url {
            Some(url) => url,
            None => Input::new()
                .with_prompt("Plex server URL")
                .default("http://localhost:32400".to_string())
                .interact_text()
                .context("Failed to read server URL")?,
        };

        let token = match token {
            Some(token) => token,
            None => Password::new()
                .with_prompt("Plex token")
                .interact()
                .context("Failed to read token")?,
        };

        let creds = PlexCredentials {
            url: url.trim_end_matches('/').to_string(),
            token,
        };

        let server = Self::verify(&creds).await?;
        info!("Connected to {}", server);

        Self::store(&creds)?;
        info!("Credentials stored in keyring");

        Ok(creds)
    }

    /// Load credentials from keyring
    pub fn load() -> Result<PlexCredentials> {
        let url = Self::get_entry("url")?
            .get_password()
            .context("No Plex URL in keyring")?;

        let token = Self::get_entry("token")?
            .get_password()
            .context("No Plex token in keyring")?;

        Ok(PlexCredentials { url, token })
    }

    /// Load credentials or explain how to create them
    pub fn require() -> Result<PlexCredentials> {
        Self::load().map_err(|_| {
            anyhow::anyhow!("No credentials found. Run 'plexmix auth' first to configure.")
        })
    }

    /// Store credentials in keyring
    pub fn store(creds: &PlexCredentials) -> Result<()> {
        Self::get_entry("url")?
            .set_password(&creds.url)
            .context("Failed to store URL in keyring")?;

        Self::get_entry("token")?
            .set_password(&creds.token)
            .context("Failed to store token in keyring")?;

        Ok(())
    }

    /// Verify credentials against the server's identity endpoint
    async fn verify(creds: &PlexCredentials) -> Result<String> {
        debug!("Verifying credentials against {}", creds.url);

        let client = creds.client()?;
        client.ping().await.context("Failed to verify credentials")
    }

    /// Get a keyring entry for a given key
    fn get_entry(key: &str) -> Result<Entry> {
        let entry_key = format!("plex:{}", key);
        Entry::new(KEYRING_SERVICE, &entry_key).context("Failed to access keyring")
    }
}
