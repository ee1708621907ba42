use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ContentError;
use crate::http::HttpClient;
use crate::server_list::fetch_server_list;

/// The `[content]` table of the client configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub directory_host: String,
    pub directory_port: u16,
    pub cell_id: u32,
    pub request_timeout_secs: u64,
    /// Static content-server hosts. Empty means discover them.
    pub servers: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            directory_host: "cs.steampowered.com".to_string(),
            directory_port: 80,
            cell_id: 0,
            request_timeout_secs: 30,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    content: ContentConfig,
}

impl ContentConfig {
    /// Reads the `[content]` table, ignoring every other key in the file.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<ConfigFile>(input).map(|file| file.content)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ContentError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|err| ContentError::Config(err.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the configured servers, or asks the directory when none are set.
    pub async fn resolve_servers<H: HttpClient + ?Sized>(
        &self,
        http: &H,
    ) -> Result<Vec<String>, ContentError> {
        if !self.servers.is_empty() {
            return Ok(self.servers.clone());
        }
        fetch_server_list(http, &self.directory_host, self.directory_port, self.cell_id).await
    }
}
