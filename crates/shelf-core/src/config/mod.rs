//! Store configuration supplied by the hosting application.
//!
//! Shelf persists nothing beyond the two store endpoints: the path of the
//! on-device database and the Supabase project backing the remote store.

use std::env;
use std::path::PathBuf;

use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const ENV_SUPABASE_URL: &str = "SHELF_SUPABASE_URL";
const ENV_SUPABASE_ANON_KEY: &str = "SHELF_SUPABASE_ANON_KEY";

/// Remote (Supabase) endpoint configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Project base URL, e.g. `https://project.supabase.co`.
    pub url: String,
    /// Public anon key sent as `apikey`.
    pub anon_key: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("anon_key", &"[REDACTED]")
            .finish()
    }
}

impl RemoteConfig {
    /// Build a validated remote configuration.
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self> {
        let url = normalize_base_url(Some(url.into()))?;
        let anon_key = normalize_text_option(Some(anon_key.into()))
            .ok_or_else(|| Error::InvalidInput("Supabase anon key must not be empty".into()))?;
        Ok(Self { url, anon_key })
    }

    /// Load the remote configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no variables are set and an error when only a
    /// partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    /// PostgREST base URL (`{url}/rest/v1`).
    #[must_use]
    pub fn rest_url(&self) -> String {
        if self.url.ends_with("/rest/v1") {
            self.url.clone()
        } else {
            format!("{}/rest/v1", self.url)
        }
    }
}

/// Both store endpoints, handed to the sync engine at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// On-device database file; `None` keeps the store in memory.
    pub db_path: Option<PathBuf>,
    /// Remote backend; `None` runs local-only.
    pub remote: Option<RemoteConfig>,
}

impl StoreConfig {
    /// Local-only configuration at the given path.
    pub fn local(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(db_path.into()),
            remote: None,
        }
    }

    /// Attach a remote backend.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Check if a remote backend is configured
    pub const fn is_remote_configured(&self) -> bool {
        self.remote.is_some()
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<RemoteConfig>> {
    let url = normalize_text_option(lookup(ENV_SUPABASE_URL));
    let anon_key = normalize_text_option(lookup(ENV_SUPABASE_ANON_KEY));

    match (url, anon_key) {
        (None, None) => Ok(None),
        (Some(url), Some(anon_key)) => RemoteConfig::new(url, anon_key).map(Some),
        (url, _) => {
            let missing = if url.is_none() {
                ENV_SUPABASE_URL
            } else {
                ENV_SUPABASE_ANON_KEY
            };
            Err(Error::InvalidInput(format!(
                "Remote configuration is incomplete. Missing: {missing}"
            )))
        }
    }
}

fn normalize_base_url(raw: Option<String>) -> Result<String> {
    let url = normalize_text_option(raw)
        .ok_or_else(|| Error::InvalidInput("Supabase URL must not be empty".into()))?;
    if !is_http_url(&url) {
        return Err(Error::InvalidInput(
            "Supabase URL must include http:// or https://".into(),
        ));
    }
    Ok(url.trim_end_matches('/').to_string())
}
