use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_MAX_ROUNDS: usize = 16;

/// Startup configuration for one client.
///
/// The server list is ordered and shared verbatim by every participant; the
/// home server (the one that answers all per-round calls) is named by
/// address and resolved to its index in that list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This client's own address, announced at registration.
    pub addr: String,
    /// Ordered addresses of the full server set.
    pub servers: Vec<String>,
    /// Address of the home server; must appear in `servers`.
    pub home: String,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Round window: wire rounds are counters reduced modulo this, and the
    /// request-to-download queue holds at most this many outstanding hashes.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

impl ClientConfig {
    pub fn new(
        addr: impl Into<String>,
        servers: Vec<String>,
        home: impl Into<String>,
    ) -> Self {
        Self {
            addr: addr.into(),
            servers,
            home: home.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("server list is empty".into()));
        }
        if self.home_index().is_none() {
            return Err(Error::InvalidConfig(format!(
                "home server {:?} is not in the server list",
                self.home
            )));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block size must be non-zero".into()));
        }
        if self.max_rounds == 0 {
            return Err(Error::InvalidConfig("round window must be non-zero".into()));
        }
        Ok(())
    }

    /// Index of the home server in the ordered list.
    pub fn home_index(&self) -> Option<usize> {
        self.servers.iter().position(|s| *s == self.home)
    }
}
