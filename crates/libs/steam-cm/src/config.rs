use serde::Deserialize;
use std::fs;
use std::path::Path;

use rand_core::RngCore;

use crate::dispatcher::PROTOCOL_VERSION;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub cm_servers: Vec<CmEndpoint>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CmEndpoint {
    pub host: String,
    pub port: u16,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { cm_servers: Vec::new(), protocol_version: PROTOCOL_VERSION }
    }
}

impl CmEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Picks one configured CM server uniformly at random.
    pub fn random_endpoint<R: RngCore>(&self, rng: &mut R) -> Option<&CmEndpoint> {
        if self.cm_servers.is_empty() {
            return None;
        }
        let index = rng.next_u32() as usize % self.cm_servers.len();
        self.cm_servers.get(index)
    }
}
