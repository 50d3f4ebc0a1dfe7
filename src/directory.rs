//! Agent-directory client — registration, heartbeat, and base-URL lookup.
//!
//! The directory is an external collaborator; this module is only the
//! interface plus the HTTP client. The server registers itself on bind,
//! heartbeats on an interval, and deactivates its entry on shutdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DirectoryError;

/// A directory entry for a reachable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub base_url: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub online: bool,
}

/// Directory operations used by this server.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Register (or re-register) this server's own entry.
    async fn register(&self, info: &AgentInfo) -> Result<(), DirectoryError>;

    /// Refresh liveness for this server's entry.
    async fn heartbeat(&self, agent_id: &str) -> Result<(), DirectoryError>;

    /// Mark this server's entry offline.
    async fn deactivate(&self, agent_id: &str) -> Result<(), DirectoryError>;

    /// Resolve another agent's entry.
    async fn lookup(&self, agent_id: &str) -> Result<AgentInfo, DirectoryError>;
}

/// reqwest-backed directory client.
pub struct HttpAgentDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AgentDirectory for HttpAgentDirectory {
    async fn register(&self, info: &AgentInfo) -> Result<(), DirectoryError> {
        self.client
            .post(self.url("agents/register"))
            .json(info)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DirectoryError::Request(e.to_string()))?;
        debug!(agent_id = %info.agent_id, "Registered with directory");
        Ok(())
    }

    async fn heartbeat(&self, agent_id: &str) -> Result<(), DirectoryError> {
        self.client
            .post(self.url(&format!("agents/{agent_id}/heartbeat")))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DirectoryError::Request(e.to_string()))?;
        Ok(())
    }

    async fn deactivate(&self, agent_id: &str) -> Result<(), DirectoryError> {
        self.client
            .post(self.url(&format!("agents/{agent_id}/deactivate")))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DirectoryError::Request(e.to_string()))?;
        debug!(agent_id, "Deactivated directory entry");
        Ok(())
    }

    async fn lookup(&self, agent_id: &str) -> Result<AgentInfo, DirectoryError> {
        let response = self
            .client
            .get(self.url(&format!("agents/{agent_id}")))
            .send()
            .await
            .map_err(|e| DirectoryError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            });
        }

        response
            .error_for_status()
            .map_err(|e| DirectoryError::Request(e.to_string()))?
            .json::<AgentInfo>()
            .await
            .map_err(|e| DirectoryError::Request(e.to_string()))
    }
}

/// No-op directory used when no directory URL is configured (standalone
/// mode) and in tests.
pub struct NullDirectory;

#[async_trait]
impl AgentDirectory for NullDirectory {
    async fn register(&self, _info: &AgentInfo) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn heartbeat(&self, _agent_id: &str) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn deactivate(&self, _agent_id: &str) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn lookup(&self, agent_id: &str) -> Result<AgentInfo, DirectoryError> {
        Err(DirectoryError::UnknownAgent {
            agent_id: agent_id.to_string(),
        })
    }
}
