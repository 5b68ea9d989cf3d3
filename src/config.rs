//! Server configuration
//!
//! Loaded once from the environment at startup and passed around inside the
//! explicit `ServerState`; there is no global config.

use std::net::SocketAddr;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the worker-connection listener binds to
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    /// Shared secret every inbound worker frame must carry
    pub judge_token: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5283".into())
            .parse()
            .context("Invalid LISTEN_ADDR")?;
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let judge_token = std::env::var("JUDGE_TOKEN")
            .context("JUDGE_TOKEN must be set (shared secret for worker connections)")?;

        Ok(Self {
            listen_addr,
            redis_url,
            judge_token,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            redis_url: "redis://localhost:6379".into(),
            judge_token: "test-secret".into(),
        }
    }
}
